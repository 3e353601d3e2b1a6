/// One CycleGAN optimization step over all four parameter sets
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};

use super::losses::{LossEngine, LossInputs, LossValues};
use super::optimizer::{Adam, AdamConfig, OptimizerState};
use crate::config::{ModelConfig, TrainingConfig};
use crate::models::{ModelBank, NetworkId, ParameterSet, PerNetwork};
use crate::utils::l2_norm;
use crate::{CycleGanError, Result};

/// Models, their optimizers and the loop position
pub struct TrainingState {
    pub models: ModelBank,
    pub optimizers: PerNetwork<Adam>,
    /// Completed epochs
    pub epoch: usize,
    /// Completed steps across all epochs
    pub global_step: usize,
}

/// Detached copy of every piece of trainable state
pub struct TrainingSnapshot {
    pub parameters: PerNetwork<ParameterSet>,
    pub optimizers: PerNetwork<OptimizerState>,
    pub epoch: usize,
    pub global_step: usize,
}

impl TrainingState {
    /// Attach one fresh optimizer to each network
    pub fn new(models: ModelBank, config: &TrainingConfig) -> Result<Self> {
        let adam = AdamConfig::from(config);
        let optimizers =
            PerNetwork::try_from_fn(|id| Adam::new(models.named_parameters(id), adam.clone()))?;
        Ok(Self {
            models,
            optimizers,
            epoch: 0,
            global_step: 0,
        })
    }

    pub fn device(&self) -> &Device {
        self.models.generator_g.device()
    }

    pub fn model_config(&self) -> &ModelConfig {
        self.models.config()
    }

    pub fn snapshot(&self) -> Result<TrainingSnapshot> {
        Ok(TrainingSnapshot {
            parameters: self.models.snapshot()?,
            optimizers: PerNetwork::try_from_fn(|id| self.optimizers.get(id).state())?,
            epoch: self.epoch,
            global_step: self.global_step,
        })
    }

    /// Check all eight sub-states against the current topology
    pub fn check_compatible(&self, snapshot: &TrainingSnapshot) -> std::result::Result<(), String> {
        self.models.check_compatible(&snapshot.parameters)?;
        for id in NetworkId::ALL {
            self.optimizers
                .get(id)
                .check_compatible(snapshot.optimizers.get(id))
                .map_err(|reason| format!("{} optimizer: {}", id, reason))?;
        }
        Ok(())
    }

    /// Overwrite all state from `snapshot`, or nothing if any part does not fit
    pub fn apply(&mut self, snapshot: &TrainingSnapshot) -> Result<()> {
        self.check_compatible(snapshot).map_err(CycleGanError::Config)?;
        self.models.load_parameters(&snapshot.parameters)?;
        for id in NetworkId::ALL {
            self.optimizers
                .get_mut(id)
                .load_state(snapshot.optimizers.get(id))?;
        }
        self.epoch = snapshot.epoch;
        self.global_step = snapshot.global_step;
        Ok(())
    }
}

/// Every tensor the losses need, recorded in one training-mode pass
pub struct ForwardPass {
    pub fake_y: Tensor,
    pub cycled_x: Tensor,
    pub fake_x: Tensor,
    pub cycled_y: Tensor,
    pub same_x: Tensor,
    pub same_y: Tensor,
    pub disc_real_x: Tensor,
    pub disc_real_y: Tensor,
    pub disc_fake_x: Tensor,
    pub disc_fake_y: Tensor,
}

impl ForwardPass {
    pub fn run(models: &ModelBank, real_x: &Tensor, real_y: &Tensor) -> Result<Self> {
        let config = models.config();
        check_batch(config, "real_x", real_x)?;
        check_batch(config, "real_y", real_y)?;

        let generate = |id: NetworkId, xs: &Tensor| -> Result<Tensor> {
            let out = match id {
                NetworkId::GeneratorG => models.generator_g.forward(xs, true)?,
                _ => models.generator_f.forward(xs, true)?,
            };
            if out.dims() != xs.dims() {
                return Err(CycleGanError::shape_mismatch(
                    format!("{} output", id),
                    xs.dims(),
                    out.dims(),
                ));
            }
            Ok(out)
        };
        let judge = |id: NetworkId, xs: &Tensor| -> Result<Tensor> {
            let out = match id {
                NetworkId::DiscriminatorX => models.discriminator_x.forward(xs, true)?,
                _ => models.discriminator_y.forward(xs, true)?,
            };
            let expected = config.patch_shape(xs.dims()[0]);
            if out.dims() != expected {
                return Err(CycleGanError::shape_mismatch(
                    format!("{} output", id),
                    &expected,
                    out.dims(),
                ));
            }
            Ok(out)
        };

        let fake_y = generate(NetworkId::GeneratorG, real_x)?;
        let cycled_x = generate(NetworkId::GeneratorF, &fake_y)?;
        let fake_x = generate(NetworkId::GeneratorF, real_y)?;
        let cycled_y = generate(NetworkId::GeneratorG, &fake_x)?;

        let same_x = generate(NetworkId::GeneratorF, real_x)?;
        let same_y = generate(NetworkId::GeneratorG, real_y)?;

        let disc_real_x = judge(NetworkId::DiscriminatorX, real_x)?;
        let disc_real_y = judge(NetworkId::DiscriminatorY, real_y)?;
        let disc_fake_x = judge(NetworkId::DiscriminatorX, &fake_x)?;
        let disc_fake_y = judge(NetworkId::DiscriminatorY, &fake_y)?;

        Ok(Self {
            fake_y,
            cycled_x,
            fake_x,
            cycled_y,
            same_x,
            same_y,
            disc_real_x,
            disc_real_y,
            disc_fake_x,
            disc_fake_y,
        })
    }

    pub fn loss_inputs<'a>(&'a self, real_x: &'a Tensor, real_y: &'a Tensor) -> LossInputs<'a> {
        LossInputs {
            real_x,
            real_y,
            cycled_x: &self.cycled_x,
            cycled_y: &self.cycled_y,
            same_x: &self.same_x,
            same_y: &self.same_y,
            disc_real_x: &self.disc_real_x,
            disc_real_y: &self.disc_real_y,
            disc_fake_x: &self.disc_fake_x,
            disc_fake_y: &self.disc_fake_y,
        }
    }
}

/// Outcome of one step, handed to the metrics sink
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepReport {
    /// 1-based index of this step across the whole run
    pub step: usize,
    /// 0-based epoch the step belongs to
    pub epoch: usize,
    pub losses: LossValues,
    /// L2 norm of each network's gradient with respect to its own objective
    pub grad_norms: PerNetwork<f32>,
    /// A loss or gradient norm was NaN or infinite
    pub non_finite: bool,
}

impl StepReport {
    /// Describe which values were not finite
    pub fn non_finite_detail(&self) -> String {
        let l = &self.losses;
        let g = &self.grad_norms;
        format!(
            "losses gen_g={} gen_f={} disc_x={} disc_y={}; grad norms gen_g={} gen_f={} disc_x={} disc_y={}",
            l.gen_g,
            l.gen_f,
            l.disc_x,
            l.disc_y,
            g.generator_g,
            g.generator_f,
            g.discriminator_x,
            g.discriminator_y
        )
    }

    /// The error value describing a non-finite step
    pub fn non_finite_error(&self) -> Option<CycleGanError> {
        self.non_finite.then(|| CycleGanError::NonFiniteLoss {
            step: self.step,
            epoch: self.epoch,
            detail: self.non_finite_detail(),
        })
    }
}

/// Run one step on a batch pair
///
/// All four gradients are taken from the same forward record and all four
/// updates are computed before any optimizer touches a parameter; an error
/// leaves every network and optimizer unchanged. A non-finite loss or gradient does not stop
/// the step; it is flagged in the report.
pub fn train_step(
    state: &mut TrainingState,
    engine: &LossEngine,
    real_x: &Tensor,
    real_y: &Tensor,
) -> Result<StepReport> {
    let pass = ForwardPass::run(&state.models, real_x, real_y)?;
    let losses = engine.compose(&pass.loss_inputs(real_x, real_y))?;
    let values = losses.values()?;

    let grads = PerNetwork {
        generator_g: losses.gen_g.backward()?,
        generator_f: losses.gen_f.backward()?,
        discriminator_x: losses.disc_x.backward()?,
        discriminator_y: losses.disc_y.backward()?,
    };
    drop(losses);
    drop(pass);

    let grad_norms = PerNetwork::try_from_fn(|id| grad_norm(&state.models, id, grads.get(id)))?;

    // All four updates are computed before the first parameter is written
    let updates = PerNetwork::try_from_fn(|id| state.optimizers.get(id).prepare(grads.get(id)))?;
    drop(grads);
    let PerNetwork {
        generator_g,
        generator_f,
        discriminator_x,
        discriminator_y,
    } = updates;
    state.optimizers.generator_g.commit(generator_g)?;
    state.optimizers.generator_f.commit(generator_f)?;
    state.optimizers.discriminator_x.commit(discriminator_x)?;
    state.optimizers.discriminator_y.commit(discriminator_y)?;
    state.global_step += 1;

    let non_finite = !values.is_finite() || grad_norms.iter().any(|(_, n)| !n.is_finite());
    let report = StepReport {
        step: state.global_step,
        epoch: state.epoch,
        losses: values,
        grad_norms,
        non_finite,
    };
    log::debug!(
        "step {}: gen_g={:.4} gen_f={:.4} disc_x={:.4} disc_y={:.4}",
        report.step,
        values.gen_g,
        values.gen_f,
        values.disc_x,
        values.disc_y
    );
    Ok(report)
}

/// L2 norm over one network's gradients
fn grad_norm(models: &ModelBank, id: NetworkId, grads: &GradStore) -> Result<f32> {
    let mut sum = 0f32;
    for (_, var) in models.named_parameters(id) {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum += l2_norm(grad)?.powi(2);
        }
    }
    Ok(sum.sqrt())
}

fn check_batch(config: &ModelConfig, name: &str, batch: &Tensor) -> Result<()> {
    let dims = batch.dims();
    let batch_size = dims.first().copied().unwrap_or(0);
    let expected = config.image_shape(batch_size);
    if dims != expected || batch_size == 0 {
        return Err(CycleGanError::shape_mismatch(name, &expected, dims));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn state() -> Result<TrainingState> {
        let models = ModelBank::new(&ModelConfig::small(16), &Device::Cpu)?;
        TrainingState::new(models, &TrainingConfig::default())
    }

    fn batch(b: usize) -> Result<Tensor> {
        Ok(Tensor::randn(0f32, 0.5, (b, 16, 16, 3), &Device::Cpu)?)
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let state = state()?;
        let (x, y) = (batch(2)?, batch(1)?);

        let pass = ForwardPass::run(&state.models, &x, &y)?;

        assert_eq!(pass.fake_y.dims(), x.dims());
        assert_eq!(pass.cycled_y.dims(), y.dims());
        assert_eq!(pass.disc_fake_y.dims(), &[2, 6, 6, 1]);
        assert_eq!(pass.disc_real_y.dims(), &[1, 6, 6, 1]);
        Ok(())
    }

    #[test]
    fn test_step_updates_every_network() -> Result<()> {
        let mut state = state()?;
        let before = state.models.snapshot()?;

        let report = train_step(&mut state, &LossEngine::new(10.0), &batch(1)?, &batch(1)?)?;

        assert_eq!(report.step, 1);
        assert_eq!(state.global_step, 1);
        assert!(!report.non_finite);
        assert!(report.non_finite_error().is_none());

        let after = state.models.snapshot()?;
        for id in NetworkId::ALL {
            let name = "last.bias";
            let a = before.get(id)[name].to_vec1::<f32>()?;
            let b = after.get(id)[name].to_vec1::<f32>()?;
            assert_ne!(a, b, "{} was not updated", id);
            assert_eq!(state.optimizers.get(id).step_count(), 1);
        }
        Ok(())
    }

    #[test]
    fn test_wrong_channels_rejected() -> Result<()> {
        let mut state = state()?;
        let x = Tensor::zeros((1, 16, 16, 1), DType::F32, &Device::Cpu)?;

        let err = train_step(&mut state, &LossEngine::new(10.0), &x, &batch(1)?);

        assert!(matches!(err, Err(CycleGanError::ShapeMismatch { .. })));
        assert_eq!(state.global_step, 0);
        Ok(())
    }

    #[test]
    fn test_failed_update_leaves_every_network_unchanged() -> Result<()> {
        use crate::training::optimizer::Moments;

        let mut state = state()?;
        // Moments that cannot combine with the last.bias gradient of D_Y
        let bad = Tensor::zeros(3, DType::F32, &Device::Cpu)?;
        state.optimizers.discriminator_y.replace_moments(
            "last.bias",
            Moments {
                m: bad.clone(),
                v: bad,
            },
        );
        let before = state.models.snapshot()?;

        let result = train_step(&mut state, &LossEngine::new(10.0), &batch(1)?, &batch(1)?);

        assert!(result.is_err());
        assert_eq!(state.global_step, 0);
        let after = state.models.snapshot()?;
        for id in NetworkId::ALL {
            assert_eq!(state.optimizers.get(id).step_count(), 0, "{} optimizer stepped", id);
            for (name, tensor) in before.get(id) {
                let a = tensor.flatten_all()?.to_vec1::<f32>()?;
                let b = after.get(id)[name].flatten_all()?.to_vec1::<f32>()?;
                assert_eq!(a, b, "{} {} was written", id, name);
            }
        }
        Ok(())
    }

    #[test]
    fn test_snapshot_apply_restores() -> Result<()> {
        let mut state = state()?;
        let snapshot = state.snapshot()?;

        train_step(&mut state, &LossEngine::new(10.0), &batch(1)?, &batch(1)?)?;
        state.apply(&snapshot)?;

        assert_eq!(state.global_step, 0);
        let restored = state.models.snapshot()?;
        for id in NetworkId::ALL {
            for (name, tensor) in snapshot.parameters.get(id) {
                let a = tensor.flatten_all()?.to_vec1::<f32>()?;
                let b = restored.get(id)[name].flatten_all()?.to_vec1::<f32>()?;
                assert_eq!(a, b);
            }
        }
        Ok(())
    }

    #[test]
    fn test_non_finite_report() -> Result<()> {
        let values = LossValues {
            gen_g: f32::NAN,
            gen_f: 1.0,
            disc_x: 1.0,
            disc_y: 1.0,
            gen_g_adv: 1.0,
            gen_f_adv: 1.0,
            total_cycle: 1.0,
        };
        let report = StepReport {
            step: 7,
            epoch: 2,
            losses: values,
            grad_norms: PerNetwork::from_fn(|_| 1.0),
            non_finite: !values.is_finite(),
        };

        let err = report.non_finite_error();
        assert!(matches!(err, Some(CycleGanError::NonFiniteLoss { step: 7, epoch: 2, .. })));
        Ok(())
    }
}
