/// Data loading modules for CycleGAN training
pub mod image_folder;
pub mod preprocessing;

pub use image_folder::{ImageStream, Mode};

use candle_core::{Device, Tensor};

use crate::Result;

/// A lazy, restartable sequence of `[B, H, W, C]` image batches
pub trait BatchStream {
    /// Get next batch, or `None` once the epoch is exhausted
    fn next_batch(&mut self, device: &Device) -> Result<Option<Tensor>>;

    /// Restart from the beginning for a new epoch
    fn reset(&mut self) -> Result<()>;

    /// Get total number of batches per epoch
    fn num_batches(&self) -> usize;
}

/// Batches held in memory, replayed in order every epoch
pub struct TensorStream {
    batches: Vec<Tensor>,
    cursor: usize,
}

impl TensorStream {
    pub fn new(batches: Vec<Tensor>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl BatchStream for TensorStream {
    fn next_batch(&mut self, device: &Device) -> Result<Option<Tensor>> {
        let Some(batch) = self.batches.get(self.cursor) else {
            return Ok(None);
        };
        self.cursor += 1;
        Ok(Some(batch.to_device(device)?))
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn test_tensor_stream_replays() -> Result<()> {
        let device = Device::Cpu;
        let batches = (0..3)
            .map(|i| Tensor::full(i as f32, (1, 2, 2, 3), &device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let mut stream = TensorStream::new(batches);

        assert_eq!(stream.num_batches(), 3);
        let mut seen = 0;
        while let Some(batch) = stream.next_batch(&device)? {
            assert_eq!(batch.dtype(), DType::F32);
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert!(stream.next_batch(&device)?.is_none());

        stream.reset()?;
        let first = stream.next_batch(&device)?.unwrap();
        assert_eq!(first.flatten_all()?.to_vec1::<f32>()?[0], 0.0);
        Ok(())
    }
}
