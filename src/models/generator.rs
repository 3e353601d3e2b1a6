/// U-Net generator
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Conv2d, VarBuilder};

use crate::config::ModelConfig;
use crate::layers::activations::{conv2d, upsample_nearest2x};
use crate::layers::{ConvBlock, UpBlock};

/// Encoder-decoder with skip connections between mirrored resolutions
///
/// Takes and returns `[B, H, W, C]` images in [-1, 1].
pub struct UNetGenerator {
    down: Vec<ConvBlock>,
    up: Vec<UpBlock>,
    last: Conv2d,
}

impl UNetGenerator {
    /// Create new generator
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let g = &config.generator;

        let mut down = Vec::with_capacity(g.depth);
        let mut in_channels = config.channels;
        for i in 0..g.depth {
            let out_channels = config.generator_filters(i);
            down.push(ConvBlock::new(
                in_channels,
                out_channels,
                2,
                i != 0,
                config.norm_eps,
                config.init_std,
                vb.pp(format!("down.{}", i)),
            )?);
            in_channels = out_channels;
        }

        // Decoder block j restores the resolution of encoder block depth-2-j
        // and is followed by a concat with that block's output.
        let mut up = Vec::with_capacity(g.depth - 1);
        for j in 0..g.depth - 1 {
            let out_channels = config.generator_filters(g.depth - 2 - j);
            let dropout = if j < g.dropout_layers { g.dropout } else { 0.0 };
            up.push(UpBlock::new(
                in_channels,
                out_channels,
                dropout,
                config.norm_eps,
                config.init_std,
                vb.pp(format!("up.{}", j)),
            )?);
            in_channels = out_channels * 2;
        }

        let last = conv2d(
            in_channels,
            config.channels,
            3,
            1,
            1,
            true,
            config.init_std,
            vb.pp("last"),
        )?;

        Ok(Self { down, up, last })
    }
}

impl ModuleT for UNetGenerator {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.permute((0, 3, 1, 2))?.contiguous()?;

        let mut skips = Vec::with_capacity(self.down.len());
        for block in &self.down {
            xs = block.forward(&xs)?;
            skips.push(xs.clone());
        }
        skips.pop();

        for (block, skip) in self.up.iter().zip(skips.iter().rev()) {
            xs = block.forward_t(&xs, train)?;
            xs = Tensor::cat(&[&xs, skip], 1)?;
        }

        let xs = self.last.forward(&upsample_nearest2x(&xs)?)?.tanh()?;
        xs.permute((0, 2, 3, 1))?.contiguous()
    }
}
