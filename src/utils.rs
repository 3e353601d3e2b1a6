/// Utility functions: tensor/image conversion, numeric checks, file writes
use std::io::Write;
use std::path::Path;

use candle_core::{DType, Tensor};
use image::RgbImage;

use crate::{CycleGanError, Result};

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}

/// Scalar value of a rank-0 tensor as f32
pub fn scalar(tensor: &Tensor) -> Result<f32> {
    Ok(tensor.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// L2 norm of a tensor; NaN/Inf propagate into the result
pub fn l2_norm(tensor: &Tensor) -> Result<f32> {
    let sum = tensor.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
    Ok(sum.sqrt())
}

/// Write `data` to `path` through a temporary sibling file and a rename,
/// so readers never observe a partially written file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| CycleGanError::Config(format!("not a file path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    Ok(result?)
}

/// Map a u8 pixel value to [-1, 1]
pub fn normalize_pixel(value: u8) -> f32 {
    value as f32 / 127.5 - 1.0
}

/// Convert the `index`-th image of a `[B, H, W, 3]` batch in [-1, 1] to RGB
pub fn tensor_to_image(batch: &Tensor, index: usize) -> Result<RgbImage> {
    let (_, h, w, c) = batch.dims4()?;
    if c != 3 {
        return Err(CycleGanError::shape_mismatch(
            "image conversion",
            &[h, w, 3],
            &[h, w, c],
        ));
    }

    let pixels = batch
        .get(index)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|v| ((v * 0.5 + 0.5).clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();

    RgbImage::from_raw(w as u32, h as u32, pixels).ok_or_else(|| {
        CycleGanError::shape_mismatch("image conversion", &[h * w * 3], &[h, w, c])
    })
}

/// Place two equally sized images next to each other
pub fn side_by_side(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let (w, h) = left.dimensions();
    let mut canvas = RgbImage::new(w + right.width(), h.max(right.height()));
    image::imageops::replace(&mut canvas, left, 0, 0);
    image::imageops::replace(&mut canvas, right, w as i64, 0);
    canvas
}
