/// Observability sinks for step losses, previews and generated samples
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use candle_core::Tensor;

use super::checkpoint::CheckpointHandle;
use super::step::StepReport;
use crate::utils::{side_by_side, tensor_to_image};
use crate::Result;

/// Receives what the training loop observes
pub trait MetricsSink {
    /// Called after every step
    fn record_step(&mut self, report: &StepReport) -> Result<()>;

    /// GeneratorG applied to the fixed preview sample at the end of an epoch
    fn record_preview(&mut self, epoch: usize, input: &Tensor, prediction: &Tensor) -> Result<()>;

    /// GeneratorG applied to a test batch during evaluation
    fn record_sample(&mut self, index: usize, input: &Tensor, prediction: &Tensor) -> Result<()> {
        let _ = (index, input, prediction);
        Ok(())
    }

    fn record_checkpoint(&mut self, handle: &CheckpointHandle) -> Result<()> {
        let _ = handle;
        Ok(())
    }
}

/// Writes losses through the `log` facade
pub struct LogSink {
    log_every: usize,
}

impl LogSink {
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every: log_every.max(1),
        }
    }
}

impl MetricsSink for LogSink {
    fn record_step(&mut self, report: &StepReport) -> Result<()> {
        if let Some(err) = report.non_finite_error() {
            log::error!("{}", err);
            return Ok(());
        }
        if report.step % self.log_every == 0 {
            let l = &report.losses;
            log::info!(
                "epoch {} step {}: gen_g {:.4} gen_f {:.4} disc_x {:.4} disc_y {:.4} cycle {:.4}",
                report.epoch + 1,
                report.step,
                l.gen_g,
                l.gen_f,
                l.disc_x,
                l.disc_y,
                l.total_cycle
            );
        }
        Ok(())
    }

    fn record_preview(&mut self, epoch: usize, _input: &Tensor, prediction: &Tensor) -> Result<()> {
        let mean = prediction.mean_all()?.to_scalar::<f32>()?;
        log::info!("epoch {} preview: mean output {:.4}", epoch + 1, mean);
        Ok(())
    }

    fn record_checkpoint(&mut self, handle: &CheckpointHandle) -> Result<()> {
        log::debug!("checkpoint {} recorded", handle.index);
        Ok(())
    }
}

/// Appends JSON loss lines and writes preview/sample PNGs
///
/// Losses go to `<log_dir>/fit/<timestamp>/losses.jsonl`; images go to
/// `<image_dir>` with input and prediction side by side.
pub struct FileSink {
    run_dir: PathBuf,
    image_dir: PathBuf,
    losses: BufWriter<File>,
}

impl FileSink {
    pub fn new(log_dir: &Path, image_dir: &Path) -> Result<Self> {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let run_dir = log_dir.join("fit").join(stamp);
        std::fs::create_dir_all(&run_dir)?;
        std::fs::create_dir_all(image_dir)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("losses.jsonl"))?;
        log::info!("Writing losses to {}", run_dir.display());

        Ok(Self {
            run_dir,
            image_dir: image_dir.to_path_buf(),
            losses: BufWriter::new(file),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn write_pair(&self, name: &str, input: &Tensor, prediction: &Tensor) -> Result<PathBuf> {
        let image = side_by_side(&tensor_to_image(input, 0)?, &tensor_to_image(prediction, 0)?);
        let path = self.image_dir.join(name);
        image.save(&path)?;
        Ok(path)
    }
}

impl MetricsSink for FileSink {
    fn record_step(&mut self, report: &StepReport) -> Result<()> {
        serde_json::to_writer(&mut self.losses, report)?;
        self.losses.write_all(b"\n")?;
        Ok(())
    }

    fn record_preview(&mut self, epoch: usize, input: &Tensor, prediction: &Tensor) -> Result<()> {
        self.losses.flush()?;
        let path = self.write_pair(&format!("epoch_{:04}.png", epoch + 1), input, prediction)?;
        log::debug!("Wrote preview {}", path.display());
        Ok(())
    }

    fn record_sample(&mut self, index: usize, input: &Tensor, prediction: &Tensor) -> Result<()> {
        let path = self.write_pair(&format!("sample_{:04}.png", index), input, prediction)?;
        log::debug!("Wrote sample {}", path.display());
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.losses.flush() {
            log::warn!("Failed to flush loss log: {}", e);
        }
    }
}

/// Forwards every event to each inner sink in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Box<dyn MetricsSink>) {
        self.sinks.push(sink);
    }
}

impl MetricsSink for FanoutSink {
    fn record_step(&mut self, report: &StepReport) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.record_step(report))
    }

    fn record_preview(&mut self, epoch: usize, input: &Tensor, prediction: &Tensor) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|s| s.record_preview(epoch, input, prediction))
    }

    fn record_sample(&mut self, index: usize, input: &Tensor, prediction: &Tensor) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|s| s.record_sample(index, input, prediction))
    }

    fn record_checkpoint(&mut self, handle: &CheckpointHandle) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|s| s.record_checkpoint(handle))
    }
}

/// Keeps everything it receives; for tests and embedding
#[derive(Default)]
pub struct MemorySink {
    pub steps: Vec<StepReport>,
    pub previews: Vec<(usize, Tensor)>,
    pub samples: Vec<(usize, Tensor)>,
    pub checkpoints: Vec<CheckpointHandle>,
}

impl MetricsSink for MemorySink {
    fn record_step(&mut self, report: &StepReport) -> Result<()> {
        self.steps.push(report.clone());
        Ok(())
    }

    fn record_preview(&mut self, epoch: usize, _input: &Tensor, prediction: &Tensor) -> Result<()> {
        self.previews.push((epoch, prediction.clone()));
        Ok(())
    }

    fn record_sample(&mut self, index: usize, _input: &Tensor, prediction: &Tensor) -> Result<()> {
        self.samples.push((index, prediction.clone()));
        Ok(())
    }

    fn record_checkpoint(&mut self, handle: &CheckpointHandle) -> Result<()> {
        self.checkpoints.push(handle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PerNetwork;
    use crate::training::losses::LossValues;
    use candle_core::Device;

    fn report(step: usize) -> StepReport {
        StepReport {
            step,
            epoch: 0,
            losses: LossValues {
                gen_g: 1.0,
                gen_f: 2.0,
                disc_x: 0.5,
                disc_y: 0.25,
                gen_g_adv: 0.7,
                gen_f_adv: 0.6,
                total_cycle: 0.3,
            },
            grad_norms: PerNetwork::from_fn(|_| 0.1),
            non_finite: false,
        }
    }

    #[test]
    fn test_file_sink_writes_lines_and_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let images = dir.path().join("images");
        let mut sink = FileSink::new(&dir.path().join("logs"), &images)?;

        sink.record_step(&report(1))?;
        sink.record_step(&report(2))?;
        let x = Tensor::zeros((1, 4, 4, 3), candle_core::DType::F32, &Device::Cpu)?;
        sink.record_preview(0, &x, &x)?;
        sink.record_sample(3, &x, &x)?;

        let text = std::fs::read_to_string(sink.run_dir().join("losses.jsonl"))?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(first["step"], 1);
        assert_eq!(first["losses"]["gen_f"], 2.0);

        let preview = image::open(images.join("epoch_0001.png"))?;
        assert_eq!((preview.width(), preview.height()), (8, 4));
        assert!(images.join("sample_0003.png").exists());
        Ok(())
    }

    #[test]
    fn test_fanout_forwards() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = FileSink::new(dir.path(), dir.path())?;
        let run_dir = file.run_dir().to_path_buf();
        let mut fanout = FanoutSink::new(vec![Box::new(LogSink::new(1)), Box::new(file)]);

        fanout.record_step(&report(1))?;
        drop(fanout);

        let text = std::fs::read_to_string(run_dir.join("losses.jsonl"))?;
        assert_eq!(text.lines().count(), 1);
        Ok(())
    }

    #[test]
    fn test_log_sink_tolerates_non_finite() -> Result<()> {
        let mut sink = LogSink::new(10);
        let mut bad = report(3);
        bad.losses.disc_x = f32::INFINITY;
        bad.non_finite = true;
        sink.record_step(&bad)?;
        Ok(())
    }
}
