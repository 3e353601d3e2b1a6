/// PatchGAN discriminator
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Conv2d, VarBuilder};

use crate::config::ModelConfig;
use crate::layers::activations::conv2d;
use crate::layers::ConvBlock;

/// Scores overlapping patches of an image as real or generated
///
/// Takes `[B, S, S, C]` images and returns `[B, P, P, 1]` logits,
/// `P = S / 2^n - 2` for `n` downsampling blocks.
pub struct PatchDiscriminator {
    blocks: Vec<ConvBlock>,
    last: Conv2d,
}

impl PatchDiscriminator {
    /// Create new discriminator
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let n = config.discriminator.downsample_layers;

        let mut blocks = Vec::with_capacity(n + 1);
        let mut in_channels = config.channels;
        for i in 0..n {
            let out_channels = config.discriminator_filters(i);
            blocks.push(ConvBlock::new(
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

        let out_channels = config.discriminator_filters(n);
        blocks.push(ConvBlock::new(
            in_channels,
            out_channels,
            1,
            true,
            config.norm_eps,
            config.init_std,
            vb.pp("conv"),
        )?);

        let last = conv2d(
            out_channels,
            1,
            4,
            1,
            1,
            true,
            config.init_std,
            vb.pp("last"),
        )?;

        Ok(Self { blocks, last })
    }
}

impl ModuleT for PatchDiscriminator {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        let mut xs = xs.permute((0, 3, 1, 2))?.contiguous()?;
        for block in &self.blocks {
            xs = block.forward(&xs)?;
        }
        let xs = self.last.forward(&xs)?;
        xs.permute((0, 2, 3, 1))?.contiguous()
    }
}
