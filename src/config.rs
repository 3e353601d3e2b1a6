/// Configuration for CycleGAN training
///
/// One `CycleGanConfig` is built at startup (from a JSON file, defaults, and
/// CLI overrides) and handed by reference to every component that needs it.
use std::path::{Path, PathBuf};

use crate::{CycleGanError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CycleGanConfig {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub data: DataConfig,
    pub paths: PathsConfig,
}

impl CycleGanConfig {
    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.training.validate()?;
        self.data.validate()?;
        Ok(())
    }
}

/// U-Net generator hyperparameters
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Filters in the first encoder block
    pub base_filters: usize,

    /// Number of stride-2 encoder blocks (the decoder mirrors depth - 1 of them)
    pub depth: usize,

    /// Cap on the filter multiplier (filters = base * min(2^i, cap))
    pub max_filter_mult: usize,

    /// Dropout probability in the first decoder blocks, training mode only
    pub dropout: f32,

    /// How many decoder blocks apply dropout
    pub dropout_layers: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            base_filters: 64,
            depth: 8,
            max_filter_mult: 8,
            dropout: 0.5,
            dropout_layers: 3,
        }
    }
}

/// PatchGAN discriminator hyperparameters
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    /// Filters in the first block
    pub base_filters: usize,

    /// Number of stride-2 blocks before the two stride-1 blocks
    pub downsample_layers: usize,

    /// Cap on the filter multiplier
    pub max_filter_mult: usize,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            base_filters: 64,
            downsample_layers: 3,
            max_filter_mult: 8,
        }
    }
}

/// Network topology shared by all four models
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Square image side length
    pub image_size: usize,

    /// Image channels (3 for RGB)
    pub channels: usize,

    /// Instance normalization epsilon
    pub norm_eps: f64,

    /// Standard deviation of the normal weight initializer
    pub init_std: f64,

    pub generator: GeneratorConfig,

    pub discriminator: DiscriminatorConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_size: 256,
            channels: 3,
            norm_eps: 1e-5,
            init_std: 0.02,
            generator: GeneratorConfig::default(),
            discriminator: DiscriminatorConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Compact topology for small images: few filters, shallow networks,
    /// no dropout. `image_size` must be a multiple of 8.
    pub fn small(image_size: usize) -> Self {
        Self {
            image_size,
            generator: GeneratorConfig {
                base_filters: 4,
                depth: 3,
                max_filter_mult: 4,
                dropout: 0.0,
                dropout_layers: 0,
            },
            discriminator: DiscriminatorConfig {
                base_filters: 4,
                downsample_layers: 1,
                max_filter_mult: 4,
            },
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.image_size == 0 || self.channels == 0 {
            return Err(CycleGanError::Config(
                "image_size and channels must be > 0".to_string(),
            ));
        }

        let g = &self.generator;
        if g.base_filters == 0 || g.max_filter_mult == 0 {
            return Err(CycleGanError::Config(
                "generator base_filters and max_filter_mult must be > 0".to_string(),
            ));
        }
        if g.depth < 2 {
            return Err(CycleGanError::Config(
                "generator depth must be >= 2".to_string(),
            ));
        }
        if g.depth >= usize::BITS as usize || self.image_size % (1usize << g.depth) != 0 {
            return Err(CycleGanError::Config(format!(
                "image_size {} must be divisible by 2^depth (depth = {})",
                self.image_size, g.depth
            )));
        }
        if !(0.0..1.0).contains(&g.dropout) {
            return Err(CycleGanError::Config(format!(
                "generator dropout must be in [0, 1), got {}",
                g.dropout
            )));
        }

        let d = &self.discriminator;
        if d.base_filters == 0 || d.max_filter_mult == 0 {
            return Err(CycleGanError::Config(
                "discriminator base_filters and max_filter_mult must be > 0".to_string(),
            ));
        }
        if self.patch_size() == 0 {
            return Err(CycleGanError::Config(format!(
                "discriminator with {} downsample layers leaves no patches for image_size {}",
                d.downsample_layers, self.image_size
            )));
        }

        Ok(())
    }

    /// Expected image batch shape `[batch, H, W, C]`
    pub fn image_shape(&self, batch: usize) -> [usize; 4] {
        [batch, self.image_size, self.image_size, self.channels]
    }

    /// Side length of the discriminator's score map
    pub fn patch_size(&self) -> usize {
        let n = self.discriminator.downsample_layers;
        if n >= usize::BITS as usize {
            return 0;
        }
        (self.image_size >> n).saturating_sub(2)
    }

    /// Expected discriminator output shape `[batch, P, P, 1]`
    pub fn patch_shape(&self, batch: usize) -> [usize; 4] {
        let p = self.patch_size();
        [batch, p, p, 1]
    }

    /// Filters of generator encoder block `i`
    pub fn generator_filters(&self, i: usize) -> usize {
        let g = &self.generator;
        g.base_filters * filter_mult(i, g.max_filter_mult)
    }

    /// Filters of discriminator block `i`
    pub fn discriminator_filters(&self, i: usize) -> usize {
        let d = &self.discriminator;
        d.base_filters * filter_mult(i, d.max_filter_mult)
    }
}

fn filter_mult(i: usize, cap: usize) -> usize {
    if i >= 16 {
        cap
    } else {
        (1usize << i).min(cap)
    }
}

/// Optimization and loop settings
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub num_epochs: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Adam epsilon
    pub eps: f64,
    /// Decoupled weight decay (0 disables)
    pub weight_decay: f64,
    /// Cycle-consistency weight; identity loss uses half of it
    pub lambda: f64,
    /// Save a checkpoint every N epochs
    pub checkpoint_every: usize,
    /// Retained checkpoints
    pub max_to_keep: usize,
    /// Log losses every N steps
    pub log_every: usize,
    /// Test-X batches translated after training
    pub eval_samples: usize,
    /// Start fresh instead of failing when the newest checkpoint is unreadable
    pub fresh_start_on_corrupt: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 3,
            learning_rate: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay: 0.0,
            lambda: 10.0,
            checkpoint_every: 5,
            max_to_keep: 5,
            log_every: 10,
            eval_samples: 5,
            fresh_start_on_corrupt: false,
        }
    }
}

impl TrainingConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_every == 0 || self.max_to_keep == 0 {
            return Err(CycleGanError::Config(
                "checkpoint_every and max_to_keep must be > 0".to_string(),
            ));
        }
        if !(self.learning_rate > 0.0) {
            return Err(CycleGanError::Config(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(CycleGanError::Config(
                "beta1 and beta2 must be in [0, 1)".to_string(),
            ));
        }
        if self.lambda < 0.0 {
            return Err(CycleGanError::Config(format!(
                "lambda must be >= 0, got {}",
                self.lambda
            )));
        }
        Ok(())
    }
}

/// Image pipeline settings
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding the four image folders
    pub image_root: PathBuf,
    pub train_x_dir: String,
    pub train_y_dir: String,
    pub test_x_dir: String,
    pub test_y_dir: String,
    pub batch_size: usize,
    /// Shuffle buffer capacity
    pub shuffle_buffer: usize,
    /// Side length images are resized to before the random crop
    pub jitter_size: usize,
    /// Decoded images buffered ahead of the training step
    pub prefetch: usize,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            image_root: PathBuf::from("dataset/cycle_dataset"),
            train_x_dir: "trainA".to_string(),
            train_y_dir: "trainB".to_string(),
            test_x_dir: "testA".to_string(),
            test_y_dir: "testB".to_string(),
            batch_size: 1,
            shuffle_buffer: 175,
            jitter_size: 286,
            prefetch: 4,
            seed: 0,
        }
    }
}

impl DataConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.shuffle_buffer == 0 || self.prefetch == 0 {
            return Err(CycleGanError::Config(
                "batch_size, shuffle_buffer and prefetch must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn train_x_path(&self) -> PathBuf {
        self.image_root.join(&self.train_x_dir)
    }

    pub fn train_y_path(&self) -> PathBuf {
        self.image_root.join(&self.train_y_dir)
    }

    pub fn test_x_path(&self) -> PathBuf {
        self.image_root.join(&self.test_x_dir)
    }

    pub fn test_y_path(&self) -> PathBuf {
        self.image_root.join(&self.test_y_dir)
    }
}

/// Output locations
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Rotating checkpoints
    pub checkpoint_dir: PathBuf,
    /// Final per-network models, written once
    pub model_dir: PathBuf,
    /// Epoch previews and translated test images
    pub image_dir: PathBuf,
    /// Loss logs
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints/train"),
            model_dir: PathBuf::from("models"),
            image_dir: PathBuf::from("images"),
            log_dir: PathBuf::from("logs"),
        }
    }
}
