/// Training loop for CycleGAN
use std::time::Instant;

use candle_core::{Device, Tensor};

use super::checkpoint::CheckpointManager;
use super::losses::LossEngine;
use super::metrics::MetricsSink;
use super::step::{train_step, TrainingState};
use crate::config::CycleGanConfig;
use crate::data::BatchStream;
use crate::models::loader::save_final_models;
use crate::models::ModelBank;
use crate::{CycleGanError, Result};

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    RunningEpoch,
    SamplingPreview,
    Checkpointing,
    Finalizing,
    Done,
}

/// Running mean of the four objectives over an epoch
#[derive(Debug, Default)]
struct EpochLosses {
    steps: usize,
    gen_g: f64,
    gen_f: f64,
    disc_x: f64,
    disc_y: f64,
}

impl EpochLosses {
    fn mean(&self, total: f64) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            total / self.steps as f64
        }
    }
}

/// Trainer for CycleGAN
///
/// Drives `Initializing -> (RunningEpoch -> SamplingPreview [-> Checkpointing])*
/// -> Finalizing -> Done`.
pub struct Trainer<S: MetricsSink> {
    config: CycleGanConfig,
    state: TrainingState,
    engine: LossEngine,
    checkpoints: CheckpointManager,
    sink: S,
    phase: Phase,
    preview: Option<Tensor>,
}

impl<S: MetricsSink> Trainer<S> {
    /// Create new trainer with freshly initialized networks
    ///
    /// Checkpoints are only looked at when [`Trainer::run`] starts.
    pub fn new(config: &CycleGanConfig, device: &Device, sink: S) -> Result<Self> {
        config.validate()?;

        let models = ModelBank::new(&config.model, device)?;
        let state = TrainingState::new(models, &config.training)?;
        let checkpoints =
            CheckpointManager::open(&config.paths.checkpoint_dir, config.training.max_to_keep)?;

        Ok(Self {
            config: config.clone(),
            state,
            engine: LossEngine::new(config.training.lambda),
            checkpoints,
            sink,
            phase: Phase::Initializing,
            preview: None,
        })
    }

    /// Use `sample` for the end-of-epoch previews instead of the first
    /// training batch
    pub fn with_preview_sample(mut self, sample: Tensor) -> Self {
        self.preview = Some(sample);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn device(&self) -> Device {
        self.state.device().clone()
    }

    fn enter(&mut self, phase: Phase) {
        log::debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn after_epoch(&self) -> Phase {
        if self.state.epoch >= self.config.training.num_epochs {
            Phase::Finalizing
        } else {
            Phase::RunningEpoch
        }
    }

    /// Full training run, resuming from the newest checkpoint if present
    pub fn run(
        &mut self,
        train_x: &mut dyn BatchStream,
        train_y: &mut dyn BatchStream,
    ) -> Result<()> {
        loop {
            match self.phase {
                Phase::Initializing => {
                    self.initialize(train_x)?;
                    let next = self.after_epoch();
                    self.enter(next);
                }
                Phase::RunningEpoch => {
                    self.train_epoch(train_x, train_y)?;
                    self.enter(Phase::SamplingPreview);
                }
                Phase::SamplingPreview => {
                    self.sample_preview()?;
                    let next = if self.state.epoch % self.config.training.checkpoint_every == 0 {
                        Phase::Checkpointing
                    } else {
                        self.after_epoch()
                    };
                    self.enter(next);
                }
                Phase::Checkpointing => {
                    let snapshot = self.state.snapshot()?;
                    let handle = self
                        .checkpoints
                        .save(&snapshot, self.state.model_config())?;
                    self.sink.record_checkpoint(&handle)?;
                    let next = self.after_epoch();
                    self.enter(next);
                }
                Phase::Finalizing => {
                    save_final_models(&self.state.models, &self.config.paths.model_dir)?;
                    log::info!("Training complete after {} steps", self.state.global_step);
                    self.enter(Phase::Done);
                }
                Phase::Done => return Ok(()),
            }
        }
    }

    fn initialize(&mut self, train_x: &mut dyn BatchStream) -> Result<()> {
        match self.checkpoints.latest().cloned() {
            Some(handle) => match self.checkpoints.restore(&handle, &mut self.state) {
                Ok(()) => {}
                Err(e @ CycleGanError::CorruptCheckpoint { .. })
                    if self.config.training.fresh_start_on_corrupt =>
                {
                    log::error!("{}; starting from fresh parameters", e);
                }
                Err(e) => return Err(e),
            },
            None => log::info!("No checkpoint found, starting from fresh parameters"),
        }

        if self.preview.is_none() {
            let device = self.device();
            train_x.reset()?;
            self.preview = train_x.next_batch(&device)?;
            train_x.reset()?;
        }

        log::info!(
            "Starting at epoch {}/{} (step {}, lr {:e})",
            self.state.epoch,
            self.config.training.num_epochs,
            self.state.global_step,
            self.state.optimizers.generator_g.learning_rate()
        );
        Ok(())
    }

    /// Train for one epoch over position-wise pairs of the two streams
    fn train_epoch(
        &mut self,
        train_x: &mut dyn BatchStream,
        train_y: &mut dyn BatchStream,
    ) -> Result<()> {
        let device = self.device();
        let epoch = self.state.epoch;
        log::info!(
            "=== Epoch {}/{} ===",
            epoch + 1,
            self.config.training.num_epochs
        );

        train_x.reset()?;
        train_y.reset()?;
        let start = Instant::now();
        let mut totals = EpochLosses::default();

        loop {
            let Some(real_x) = train_x.next_batch(&device)? else {
                break;
            };
            let Some(real_y) = train_y.next_batch(&device)? else {
                break;
            };

            let report = train_step(&mut self.state, &self.engine, &real_x, &real_y)?;
            self.sink.record_step(&report)?;

            totals.steps += 1;
            totals.gen_g += report.losses.gen_g as f64;
            totals.gen_f += report.losses.gen_f as f64;
            totals.disc_x += report.losses.disc_x as f64;
            totals.disc_y += report.losses.disc_y as f64;
        }

        if totals.steps == 0 {
            log::warn!("Epoch {} had no batch pairs", epoch + 1);
        }
        self.state.epoch += 1;

        log::info!(
            "Epoch {} complete: {} steps, gen_g={:.4} gen_f={:.4} disc_x={:.4} disc_y={:.4}, {:.1}s",
            epoch + 1,
            totals.steps,
            totals.mean(totals.gen_g),
            totals.mean(totals.gen_f),
            totals.mean(totals.disc_x),
            totals.mean(totals.disc_y),
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn sample_preview(&mut self) -> Result<()> {
        let Some(sample) = self.preview.as_ref() else {
            return Ok(());
        };
        let prediction = self.state.models.generator_g.forward(sample, false)?;
        self.sink
            .record_preview(self.state.epoch.saturating_sub(1), sample, &prediction)
    }

    /// Translate up to `limit` test-X batches with GeneratorG
    ///
    /// Only valid once the run has finished.
    pub fn evaluate(&mut self, test_x: &mut dyn BatchStream, limit: usize) -> Result<usize> {
        if self.phase != Phase::Done {
            return Err(CycleGanError::Config(format!(
                "evaluation needs a finished run, trainer is in {:?}",
                self.phase
            )));
        }
        translate(&self.state.models, test_x, limit, &mut self.sink)
    }
}

/// Run GeneratorG in inference mode over at most `limit` batches of `stream`
/// and hand each result to `sink`
pub fn translate<S: MetricsSink + ?Sized>(
    models: &ModelBank,
    stream: &mut dyn BatchStream,
    limit: usize,
    sink: &mut S,
) -> Result<usize> {
    let device = models.generator_g.device().clone();
    let expected = models.config().image_shape(1);
    stream.reset()?;

    let mut count = 0;
    while count < limit {
        let Some(batch) = stream.next_batch(&device)? else {
            break;
        };
        if batch.dims().get(1..) != expected.get(1..) {
            return Err(CycleGanError::shape_mismatch("test batch", &expected, batch.dims()));
        }
        let prediction = models.generator_g.forward(&batch, false)?;
        sink.record_sample(count, &batch, &prediction)?;
        count += 1;
    }
    log::info!("Translated {} test batches", count);
    Ok(count)
}
