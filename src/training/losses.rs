/// CycleGAN objectives
///
/// All functions are pure over their input tensors and return rank-0
/// tensors, so they can be differentiated with `Tensor::backward`.
use candle_core::Tensor;

use crate::utils::scalar;
use crate::Result;

/// Mean binary cross-entropy between `logits` and a constant `target`
///
/// Uses the stable form `max(x, 0) - x * z + log(1 + exp(-|x|))`.
pub fn bce_with_logits(logits: &Tensor, target: f64) -> Result<Tensor> {
    let abs = logits.abs()?;
    let positive = ((logits + &abs)? * 0.5)?;
    let softplus = (abs.neg()?.exp()? + 1.0)?.log()?;
    let loss = ((positive - (logits * target)?)? + softplus)?;
    Ok(loss.mean_all()?)
}

/// Loss weights for the three objectives
#[derive(Debug, Clone, Copy)]
pub struct LossEngine {
    lambda: f64,
}

impl LossEngine {
    pub fn new(lambda: f64) -> Self {
        Self { lambda }
    }

    /// Cycle weight; the identity term uses half of it
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Generator objective: its fakes should be scored as real
    pub fn adversarial_loss(&self, disc_fake: &Tensor) -> Result<Tensor> {
        bce_with_logits(disc_fake, 1.0)
    }

    /// Discriminator objective, averaged over the real and fake halves
    pub fn discriminator_loss(&self, disc_real: &Tensor, disc_fake: &Tensor) -> Result<Tensor> {
        let real = bce_with_logits(disc_real, 1.0)?;
        let fake = bce_with_logits(disc_fake, 0.0)?;
        Ok(((real + fake)? * 0.5)?)
    }

    /// `lambda * mean |real - cycled|`
    pub fn cycle_consistency_loss(&self, real: &Tensor, cycled: &Tensor) -> Result<Tensor> {
        Ok(((real - cycled)?.abs()?.mean_all()? * self.lambda)?)
    }

    /// `lambda / 2 * mean |real - same|`
    pub fn identity_loss(&self, real: &Tensor, same: &Tensor) -> Result<Tensor> {
        Ok(((real - same)?.abs()?.mean_all()? * (0.5 * self.lambda))?)
    }

    /// Combine the per-network objectives of one forward pass
    pub fn compose(&self, pass: &LossInputs<'_>) -> Result<CompositeLosses> {
        let total_cycle = (self.cycle_consistency_loss(pass.real_x, pass.cycled_x)?
            + self.cycle_consistency_loss(pass.real_y, pass.cycled_y)?)?;

        let gen_g_adv = self.adversarial_loss(pass.disc_fake_y)?;
        let gen_f_adv = self.adversarial_loss(pass.disc_fake_x)?;

        let gen_g = ((&gen_g_adv + &total_cycle)?
            + self.identity_loss(pass.real_y, pass.same_y)?)?;
        let gen_f = ((&gen_f_adv + &total_cycle)?
            + self.identity_loss(pass.real_x, pass.same_x)?)?;

        let disc_x = self.discriminator_loss(pass.disc_real_x, pass.disc_fake_x)?;
        let disc_y = self.discriminator_loss(pass.disc_real_y, pass.disc_fake_y)?;

        Ok(CompositeLosses {
            gen_g,
            gen_f,
            disc_x,
            disc_y,
            gen_g_adv,
            gen_f_adv,
            total_cycle,
        })
    }
}

/// Borrowed outputs of one forward pass
pub struct LossInputs<'a> {
    pub real_x: &'a Tensor,
    pub real_y: &'a Tensor,
    pub cycled_x: &'a Tensor,
    pub cycled_y: &'a Tensor,
    pub same_x: &'a Tensor,
    pub same_y: &'a Tensor,
    pub disc_real_x: &'a Tensor,
    pub disc_real_y: &'a Tensor,
    pub disc_fake_x: &'a Tensor,
    pub disc_fake_y: &'a Tensor,
}

/// The four scalar objectives plus their shared components
pub struct CompositeLosses {
    pub gen_g: Tensor,
    pub gen_f: Tensor,
    pub disc_x: Tensor,
    pub disc_y: Tensor,
    pub gen_g_adv: Tensor,
    pub gen_f_adv: Tensor,
    pub total_cycle: Tensor,
}

impl CompositeLosses {
    /// Host-side values for reporting
    pub fn values(&self) -> Result<LossValues> {
        Ok(LossValues {
            gen_g: scalar(&self.gen_g)?,
            gen_f: scalar(&self.gen_f)?,
            disc_x: scalar(&self.disc_x)?,
            disc_y: scalar(&self.disc_y)?,
            gen_g_adv: scalar(&self.gen_g_adv)?,
            gen_f_adv: scalar(&self.gen_f_adv)?,
            total_cycle: scalar(&self.total_cycle)?,
        })
    }
}

/// Loss values of one step
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LossValues {
    pub gen_g: f32,
    pub gen_f: f32,
    pub disc_x: f32,
    pub disc_y: f32,
    pub gen_g_adv: f32,
    pub gen_f_adv: f32,
    pub total_cycle: f32,
}

impl LossValues {
    pub fn is_finite(&self) -> bool {
        [
            self.gen_g,
            self.gen_f,
            self.disc_x,
            self.disc_y,
            self.gen_g_adv,
            self.gen_f_adv,
            self.total_cycle,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    const LN2: f32 = std::f32::consts::LN_2;

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_bce_at_zero_logits() -> Result<()> {
        let zeros = Tensor::zeros((2, 3, 3, 1), candle_core::DType::F32, &Device::Cpu)?;
        assert!(close(scalar(&bce_with_logits(&zeros, 1.0)?)?, LN2));
        assert!(close(scalar(&bce_with_logits(&zeros, 0.0)?)?, LN2));
        Ok(())
    }

    #[test]
    fn test_bce_matches_definition() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[-3.0f32, -0.5, 0.0, 2.0, 40.0], &device)?;

        let got = scalar(&bce_with_logits(&logits, 1.0)?)?;
        let expected: f32 = [-3.0f32, -0.5, 0.0, 2.0, 40.0]
            .iter()
            .map(|&x| (1.0 + (-x).exp()).ln())
            .sum::<f32>()
            / 5.0;
        assert!(close(got, expected), "{} vs {}", got, expected);
        Ok(())
    }

    #[test]
    fn test_bce_gradient_at_zero() -> Result<()> {
        let device = Device::Cpu;
        let x = Var::zeros(4, candle_core::DType::F32, &device)?;

        let grads = bce_with_logits(x.as_tensor(), 1.0)?.backward()?;
        let g = grads.get(x.as_tensor()).unwrap().to_vec1::<f32>()?;

        // d/dx mean(...) = (sigmoid(0) - 1) / n
        for v in g {
            assert!(close(v, -0.5 / 4.0));
        }
        Ok(())
    }

    #[test]
    fn test_discriminator_loss_averages() -> Result<()> {
        let device = Device::Cpu;
        let engine = LossEngine::new(10.0);
        let real = Tensor::new(&[4.0f32, 5.0], &device)?;
        let fake = Tensor::new(&[0.0f32, 0.0], &device)?;

        let loss = scalar(&engine.discriminator_loss(&real, &fake)?)?;
        let real_part = scalar(&bce_with_logits(&real, 1.0)?)?;
        assert!(close(loss, 0.5 * (real_part + LN2)));
        Ok(())
    }

    #[test]
    fn test_cycle_and_identity_vanish_on_equal_inputs() -> Result<()> {
        let device = Device::Cpu;
        let engine = LossEngine::new(10.0);
        let a = Tensor::randn(0f32, 1.0, (1, 4, 4, 3), &device)?;

        assert_eq!(scalar(&engine.cycle_consistency_loss(&a, &a)?)?, 0.0);
        assert_eq!(scalar(&engine.identity_loss(&a, &a)?)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_identity_is_half_cycle() -> Result<()> {
        let device = Device::Cpu;
        let engine = LossEngine::new(10.0);
        let a = Tensor::zeros((1, 2, 2, 3), candle_core::DType::F32, &device)?;
        let b = Tensor::ones((1, 2, 2, 3), candle_core::DType::F32, &device)?;

        assert!(close(scalar(&engine.cycle_consistency_loss(&a, &b)?)?, 10.0));
        assert!(close(scalar(&engine.identity_loss(&a, &b)?)?, 5.0));
        Ok(())
    }

    #[test]
    fn test_compose_shares_cycle_term() -> Result<()> {
        let device = Device::Cpu;
        let engine = LossEngine::new(10.0);
        let img = |v: f64| Tensor::full(v as f32, (1, 2, 2, 3), &device);
        let patch = Tensor::zeros((1, 2, 2, 1), candle_core::DType::F32, &device)?;

        let (real_x, real_y) = (img(0.0)?, img(0.5)?);
        let (cycled_x, cycled_y) = (img(0.1)?, img(0.5)?);
        let (same_x, same_y) = (img(0.0)?, img(0.3)?);
        let losses = engine.compose(&LossInputs {
            real_x: &real_x,
            real_y: &real_y,
            cycled_x: &cycled_x,
            cycled_y: &cycled_y,
            same_x: &same_x,
            same_y: &same_y,
            disc_real_x: &patch,
            disc_real_y: &patch,
            disc_fake_x: &patch,
            disc_fake_y: &patch,
        })?;
        let v = losses.values()?;

        assert!(close(v.total_cycle, 1.0));
        assert!(close(v.gen_f, LN2 + 1.0));
        assert!(close(v.gen_g, LN2 + 1.0 + 1.0));
        assert!(close(v.disc_x, LN2));
        assert!(v.is_finite());
        Ok(())
    }
}
