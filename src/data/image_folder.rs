/// Image folder streams with a shuffle buffer and background decoding
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::preprocessing::{preprocess_test, preprocess_train};
use super::BatchStream;
use crate::config::DataConfig;
use crate::{CycleGanError, Result};

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Which preprocessing pipeline a stream applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Resize to the jitter size, random crop, random mirror
    Train,
    /// Plain resize
    Test,
}

/// Streams one image folder as `[B, H, W, 3]` batches
///
/// A worker thread decodes images in shuffle-buffer order and hands them
/// over a bounded channel. Each epoch reseeds the order from
/// `seed + epoch`, so a run is reproducible for a fixed seed.
pub struct ImageStream {
    files: Arc<Vec<PathBuf>>,
    mode: Mode,
    image_size: u32,
    jitter_size: u32,
    batch_size: usize,
    shuffle_buffer: usize,
    prefetch: usize,
    seed: u64,
    epoch: u64,
    receiver: Option<Receiver<Result<Vec<f32>>>>,
    worker: Option<JoinHandle<()>>,
}

impl ImageStream {
    /// Open an image folder
    ///
    /// Test streams keep the sorted file order; train streams shuffle.
    pub fn open(
        dir: &Path,
        mode: Mode,
        data: &DataConfig,
        image_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let files = list_images(dir)?;
        if files.is_empty() {
            return Err(CycleGanError::Config(format!(
                "no images found in {}",
                dir.display()
            )));
        }
        log::info!("Found {} images in {}", files.len(), dir.display());

        Ok(Self {
            files: Arc::new(files),
            mode,
            image_size: image_size as u32,
            jitter_size: data.jitter_size as u32,
            batch_size: data.batch_size.max(1),
            shuffle_buffer: data.shuffle_buffer.max(1),
            prefetch: data.prefetch.max(1),
            seed,
            epoch: 0,
            receiver: None,
            worker: None,
        })
    }

    /// Number of images in the folder
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let (sender, receiver) = mpsc::sync_channel(self.prefetch);
        let files = Arc::clone(&self.files);
        let mode = self.mode;
        let image_size = self.image_size;
        let jitter_size = self.jitter_size;
        let buffer = self.shuffle_buffer;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));

        let handle = std::thread::Builder::new()
            .name("image-stream".to_string())
            .spawn(move || {
                let order = match mode {
                    Mode::Train => shuffle_buffer_order(files.len(), buffer, &mut rng),
                    Mode::Test => (0..files.len()).collect(),
                };
                for index in order {
                    let path = &files[index];
                    let item = match mode {
                        Mode::Train => preprocess_train(path, image_size, jitter_size, &mut rng),
                        Mode::Test => preprocess_test(path, image_size),
                    };
                    // The consumer hung up
                    if sender.send(item).is_err() {
                        break;
                    }
                }
            })?;

        self.receiver = Some(receiver);
        self.worker = Some(handle);
        Ok(())
    }

    fn stop_worker(&mut self) {
        self.receiver = None;
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::warn!("image worker thread panicked");
            }
        }
    }
}

impl BatchStream for ImageStream {
    fn next_batch(&mut self, device: &Device) -> Result<Option<Tensor>> {
        if self.receiver.is_none() {
            self.spawn_worker()?;
        }
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(None);
        };

        let mut data = Vec::new();
        let mut count = 0;
        while count < self.batch_size {
            match receiver.recv() {
                Ok(item) => {
                    data.extend(item?);
                    count += 1;
                }
                Err(_) => break,
            }
        }

        if count == 0 {
            return Ok(None);
        }
        let size = self.image_size as usize;
        Ok(Some(Tensor::from_vec(data, (count, size, size, 3), device)?))
    }

    fn reset(&mut self) -> Result<()> {
        self.stop_worker();
        self.epoch += 1;
        Ok(())
    }

    fn num_batches(&self) -> usize {
        self.files.len().div_ceil(self.batch_size)
    }
}

impl Drop for ImageStream {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// Image files directly under `dir`, sorted by path
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if is_image && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Order produced by streaming `0..len` through a fixed-capacity shuffle
/// buffer: once the buffer is full, each new element evicts a random
/// resident one.
pub fn shuffle_buffer_order<R: Rng>(len: usize, capacity: usize, rng: &mut R) -> Vec<usize> {
    let capacity = capacity.max(1);
    let mut buffer = Vec::with_capacity(capacity.min(len));
    let mut order = Vec::with_capacity(len);

    for index in 0..len {
        if buffer.len() == capacity {
            let slot = rng.gen_range(0..capacity);
            order.push(buffer.swap_remove(slot));
        }
        buffer.push(index);
    }
    while !buffer.is_empty() {
        let slot = rng.gen_range(0..buffer.len());
        order.push(buffer.swap_remove(slot));
    }
    order
}
