/// Image preprocessing: decode, resize, random jitter, normalize
use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::Rng;

use crate::utils::normalize_pixel;
use crate::{CycleGanError, Result};

/// Decode an image file as 8-bit RGB
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    let image = image::open(path)?;
    let channels = image.color().channel_count();
    if channels != 3 {
        log::warn!(
            "{} has {} channels, converting to RGB",
            path.display(),
            channels
        );
    }
    Ok(image.to_rgb8())
}

/// Nearest-neighbour resize to `size` x `size`
pub fn resize(image: &RgbImage, size: u32) -> RgbImage {
    imageops::resize(image, size, size, FilterType::Nearest)
}

/// Crop a random `size` x `size` window
pub fn random_crop<R: Rng>(image: &RgbImage, size: u32, rng: &mut R) -> Result<RgbImage> {
    let (w, h) = image.dimensions();
    if w < size || h < size {
        return Err(CycleGanError::shape_mismatch(
            "random crop",
            &[size as usize, size as usize],
            &[h as usize, w as usize],
        ));
    }
    let x = rng.gen_range(0..=w - size);
    let y = rng.gen_range(0..=h - size);
    Ok(imageops::crop_imm(image, x, y, size, size).to_image())
}

/// Mirror left-right with probability 1/2
pub fn random_flip<R: Rng>(image: RgbImage, rng: &mut R) -> RgbImage {
    if rng.gen_bool(0.5) {
        imageops::flip_horizontal(&image)
    } else {
        image
    }
}

/// Flatten to HWC f32 values in [-1, 1]
pub fn normalize(image: &RgbImage) -> Vec<f32> {
    image.as_raw().iter().map(|&v| normalize_pixel(v)).collect()
}

/// Training pipeline: resize to `jitter_size`, random crop to `image_size`,
/// random mirror, normalize
pub fn preprocess_train<R: Rng>(
    path: &Path,
    image_size: u32,
    jitter_size: u32,
    rng: &mut R,
) -> Result<Vec<f32>> {
    let image = load_rgb(path)?;
    let image = resize(&image, jitter_size.max(image_size));
    let image = random_crop(&image, image_size, rng)?;
    let image = random_flip(image, rng);
    Ok(normalize(&image))
}

/// Evaluation pipeline: resize to `image_size`, normalize
pub fn preprocess_test(path: &Path, image_size: u32) -> Result<Vec<f32>> {
    let image = load_rgb(path)?;
    Ok(normalize(&resize(&image, image_size)))
}
