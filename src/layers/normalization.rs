/// Instance normalization
///
/// Normalizes each (sample, channel) plane over its spatial extent, then
/// applies a learnable per-channel scale and offset.
use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Instance normalization function for `[B, C, H, W]` tensors
///
/// # Arguments
/// * `xs` - Input tensor in channels-first layout
/// * `eps` - Small constant added to the variance
///
/// # Returns
/// Normalized tensor with the same shape as the input
pub fn instance_norm(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let mean = xs.mean_keepdim((2, 3))?;
    let centered = xs.broadcast_sub(&mean)?;
    let variance = centered.sqr()?.mean_keepdim((2, 3))?;
    centered.broadcast_div(&(variance + eps)?.sqrt()?)
}

/// Instance normalization layer with learnable scale and offset
pub struct InstanceNorm {
    scale: Tensor,
    offset: Tensor,
    channels: usize,
    eps: f64,
}

impl InstanceNorm {
    pub fn new(channels: usize, eps: f64, init_std: f64, vb: VarBuilder) -> Result<Self> {
        let scale = vb.get_with_hints(
            channels,
            "scale",
            Init::Randn {
                mean: 1.0,
                stdev: init_std,
            },
        )?;
        let offset = vb.get_with_hints(channels, "offset", Init::Const(0.0))?;
        Ok(Self {
            scale,
            offset,
            channels,
            eps,
        })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let normalized = instance_norm(xs, self.eps)?;
        let scale = self.scale.reshape((1, self.channels, 1, 1))?;
        let offset = self.offset.reshape((1, self.channels, 1, 1))?;
        normalized.broadcast_mul(&scale)?.broadcast_add(&offset)
    }
}
