//! CycleGAN - unpaired image-to-image translation on candle
//!
//! Trains two generators (G: X -> Y, F: Y -> X) and two PatchGAN
//! discriminators (D_X, D_Y) jointly with adversarial, cycle-consistency
//! and identity losses.
//!
//! # Architecture
//!
//! - **LossEngine**: pure loss functions over forward-pass outputs
//! - **TrainingStep**: one forward record, four gradient queries, four updates
//! - **CheckpointManager**: atomic, rotating snapshots of all trainable state
//! - **Trainer**: epoch state machine with previews, checkpoints and final save
//!
//! # Example
//!
//! ```ignore
//! use cyclegan::CycleGanConfig;
//! use cyclegan::data::{ImageStream, Mode};
//! use cyclegan::training::{LogSink, Trainer};
//!
//! let config = CycleGanConfig::default();
//! let size = config.model.image_size;
//! let mut train_x = ImageStream::open(&config.data.train_x_path(), Mode::Train, &config.data, size, 0)?;
//! let mut train_y = ImageStream::open(&config.data.train_y_path(), Mode::Train, &config.data, size, 1)?;
//!
//! let mut trainer = Trainer::new(&config, &device, LogSink::new(10))?;
//! trainer.run(&mut train_x, &mut train_y)?;
//! ```

use std::path::PathBuf;

pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod training;
pub mod utils;

// Re-export commonly used items
pub use config::{CycleGanConfig, DataConfig, ModelConfig, PathsConfig, TrainingConfig};
pub use models::{Domain, ModelBank, NetworkId, PerNetwork};

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum CycleGanError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Corrupt checkpoint at {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("Non-finite value at step {step} (epoch {epoch}): {detail}")]
    NonFiniteLoss {
        step: usize,
        epoch: usize,
        detail: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Safetensors error: {0}")]
    SafeTensor(#[from] safetensors::SafeTensorError),
}

impl CycleGanError {
    /// Build a `ShapeMismatch` from two dimension slices
    pub fn shape_mismatch(context: impl Into<String>, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Build a `CorruptCheckpoint` error
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CycleGanError>;
