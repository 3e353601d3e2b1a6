/// Training infrastructure for CycleGAN
pub mod checkpoint;
pub mod losses;
pub mod metrics;
pub mod optimizer;
pub mod step;
pub mod trainer;

pub use checkpoint::{CheckpointHandle, CheckpointManager, CheckpointMetadata};
pub use losses::{CompositeLosses, LossEngine, LossValues};
pub use metrics::{FanoutSink, FileSink, LogSink, MemorySink, MetricsSink};
pub use optimizer::{Adam, AdamConfig, OptimizerState};
pub use step::{train_step, ForwardPass, StepReport, TrainingSnapshot, TrainingState};
pub use trainer::{translate, Phase, Trainer};
