/// Neural network layer primitives
///
/// Building blocks for the U-Net generator and PatchGAN discriminator:
/// - Normalizations (instance norm)
/// - Activations (leaky ReLU) and nearest-neighbour upsampling
/// - Convolution blocks (strided down blocks, upsampling blocks)

pub mod activations;
pub mod normalization;

pub use activations::{leaky_relu, upsample_nearest2x, ConvBlock, UpBlock};
pub use normalization::InstanceNorm;
