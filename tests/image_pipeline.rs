use std::path::Path;

use candle_core::Device;
use cyclegan::data::{BatchStream, ImageStream, Mode};
use cyclegan::models::loader::load_final_models;
use cyclegan::training::{translate, FileSink, MemorySink, Trainer};
use cyclegan::{CycleGanConfig, ModelConfig, Result};
use image::{Rgb, RgbImage};

fn write_folder(dir: &Path, count: usize, tint: u8) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    for i in 0..count {
        let image = RgbImage::from_fn(24, 20, |x, y| {
            Rgb([tint, (x * 10) as u8, (y * 12 + i as u32) as u8])
        });
        image.save(dir.join(format!("{:03}.png", i)))?;
    }
    Ok(())
}

fn config(root: &Path) -> CycleGanConfig {
    let mut config = CycleGanConfig::default();
    config.model = ModelConfig::small(16);
    config.training.num_epochs = 1;
    config.data.image_root = root.join("data");
    config.data.jitter_size = 18;
    config.data.shuffle_buffer = 2;
    config.paths.checkpoint_dir = root.join("checkpoints");
    config.paths.model_dir = root.join("models");
    config.paths.image_dir = root.join("images");
    config.paths.log_dir = root.join("logs");
    config
}

#[test]
fn trains_from_image_folders_and_generates() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = config(dir.path());
    let data = &config.data;
    write_folder(&data.train_x_path(), 3, 20)?;
    write_folder(&data.train_y_path(), 4, 220)?;
    write_folder(&data.test_x_path(), 2, 20)?;

    let device = Device::Cpu;
    let size = config.model.image_size;
    let mut train_x = ImageStream::open(&data.train_x_path(), Mode::Train, data, size, 0)?;
    let mut train_y = ImageStream::open(&data.train_y_path(), Mode::Train, data, size, 1)?;
    let mut test_x = ImageStream::open(&data.test_x_path(), Mode::Test, data, size, 0)?;
    assert_eq!(train_x.num_batches(), 3);

    let mut trainer = Trainer::new(&config, &device, MemorySink::default())?;
    trainer.run(&mut train_x, &mut train_y)?;
    assert_eq!(trainer.sink().steps.len(), 3);

    let models = load_final_models(&config.paths.model_dir, &device)?;
    let mut sink = FileSink::new(&config.paths.log_dir, &config.paths.image_dir)?;
    let count = translate(&models, &mut test_x, 5, &mut sink)?;

    assert_eq!(count, 2);
    assert!(config.paths.image_dir.join("sample_0000.png").exists());
    assert!(config.paths.image_dir.join("sample_0001.png").exists());
    Ok(())
}
