/// Activations and convolution blocks for the generator and discriminator
use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};

use super::normalization::InstanceNorm;

/// Leaky ReLU: `max(x, 0) - slope * max(-x, 0)`
pub fn leaky_relu(xs: &Tensor, negative_slope: f64) -> Result<Tensor> {
    let positive = xs.relu()?;
    let negative = (xs.neg()?.relu()? * negative_slope)?;
    positive.sub(&negative)
}

/// Nearest-neighbour 2x spatial upsampling of a `[B, C, H, W]` tensor
///
/// Built from broadcast + reshape so it stays differentiable.
pub fn upsample_nearest2x(xs: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    xs.reshape((b, c, h, 1, w, 1))?
        .broadcast_as((b, c, h, 2, w, 2))?
        .reshape((b, c, h * 2, w * 2))
}

/// Square convolution with normal-initialized weights
///
/// # Arguments
/// * `in_channels` - Input channels
/// * `out_channels` - Output channels
/// * `kernel` - Kernel side length
/// * `stride` - Stride
/// * `padding` - Zero padding on every side
/// * `bias` - Whether to include a (zero-initialized) bias
/// * `init_std` - Weight initializer standard deviation
/// * `vb` - VarBuilder for parameter initialization
#[allow(clippy::too_many_arguments)]
pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    bias: bool,
    init_std: f64,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let weight = vb.get_with_hints(
        (out_channels, in_channels, kernel, kernel),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: init_std,
        },
    )?;
    let bias = if bias {
        Some(vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?)
    } else {
        None
    };
    let config = Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, bias, config))
}

/// Strided 4x4 convolution, optional instance norm, leaky ReLU
pub struct ConvBlock {
    conv: Conv2d,
    norm: Option<InstanceNorm>,
}

impl ConvBlock {
    /// Create new block
    ///
    /// `stride` 2 halves the spatial size; `stride` 1 shrinks it by one.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        normalize: bool,
        norm_eps: f64,
        init_std: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = conv2d(
            in_channels,
            out_channels,
            4,
            stride,
            1,
            false,
            init_std,
            vb.pp("conv"),
        )?;
        let norm = if normalize {
            Some(InstanceNorm::new(out_channels, norm_eps, init_std, vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self { conv, norm })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.apply(&self.conv)?;
        if let Some(ref norm) = self.norm {
            xs = norm.forward(&xs)?;
        }
        leaky_relu(&xs, 0.2)
    }
}

/// Nearest upsample, 3x3 convolution, instance norm, optional dropout, ReLU
pub struct UpBlock {
    conv: Conv2d,
    norm: InstanceNorm,
    dropout: f32,
}

impl UpBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        dropout: f32,
        norm_eps: f64,
        init_std: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = conv2d(
            in_channels,
            out_channels,
            3,
            1,
            1,
            false,
            init_std,
            vb.pp("conv"),
        )?;
        let norm = InstanceNorm::new(out_channels, norm_eps, init_std, vb.pp("norm"))?;
        Ok(Self {
            conv,
            norm,
            dropout,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = upsample_nearest2x(xs)?.apply(&self.conv)?;
        let mut xs = self.norm.forward(&xs)?;
        if train && self.dropout > 0.0 {
            xs = candle_nn::ops::dropout(&xs, self.dropout)?;
        }
        xs.relu()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_leaky_relu() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[-2.0f32, -0.5, 0.0, 1.5], &device)?;

        let y = leaky_relu(&x, 0.2)?.to_vec1::<f32>()?;

        let expected = [-0.4f32, -0.1, 0.0, 1.5];
        for (a, b) in y.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "expected {}, got {}", b, a);
        }
        Ok(())
    }

    #[test]
    fn test_upsample_repeats_pixels() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &device)?.reshape((1, 1, 2, 2))?;

        let y = upsample_nearest2x(&x)?;

        assert_eq!(y.dims(), &[1, 1, 4, 4]);
        let rows = y.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(rows[1], vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(rows[3], vec![3.0, 3.0, 4.0, 4.0]);
        Ok(())
    }

    #[test]
    fn test_block_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let down = ConvBlock::new(3, 8, 2, true, 1e-5, 0.02, vb.pp("down"))?;
        let same = ConvBlock::new(8, 8, 1, true, 1e-5, 0.02, vb.pp("same"))?;
        let up = UpBlock::new(8, 4, 0.0, 1e-5, 0.02, vb.pp("up"))?;

        let x = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &device)?;
        let d = down.forward(&x)?;
        assert_eq!(d.dims(), &[2, 8, 8, 8]);
        assert_eq!(same.forward(&d)?.dims(), &[2, 8, 7, 7]);
        assert_eq!(up.forward_t(&d, true)?.dims(), &[2, 4, 16, 16]);
        Ok(())
    }
}
