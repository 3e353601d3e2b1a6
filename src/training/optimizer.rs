/// Adam optimizer with exportable state
///
/// One instance owns the update of exactly one parameter set. Moment
/// estimates are keyed by parameter name so they can be checkpointed and
/// matched against a model topology on restore.
use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};

use crate::config::TrainingConfig;
use crate::Result;

const MOMENT_SUFFIX_M: &str = ".m";
const MOMENT_SUFFIX_V: &str = ".v";

/// Adam optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// Decoupled weight decay coefficient
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 2e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-7,
            weight_decay: 0.0,
        }
    }
}

impl From<&TrainingConfig> for AdamConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            lr: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        }
    }
}

/// First and second moment estimates of one parameter
#[derive(Debug, Clone)]
pub struct Moments {
    /// Exponential moving average of gradients
    pub m: Tensor,
    /// Exponential moving average of squared gradients
    pub v: Tensor,
}

/// Everything needed to resume an optimizer
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step: usize,
    pub moments: BTreeMap<String, Moments>,
}

impl OptimizerState {
    /// Flatten to `<param>.m` / `<param>.v` tensors
    pub fn to_tensors(&self) -> BTreeMap<String, Tensor> {
        let mut tensors = BTreeMap::new();
        for (name, moments) in &self.moments {
            tensors.insert(format!("{}{}", name, MOMENT_SUFFIX_M), moments.m.clone());
            tensors.insert(format!("{}{}", name, MOMENT_SUFFIX_V), moments.v.clone());
        }
        tensors
    }

    /// Inverse of [`OptimizerState::to_tensors`]
    pub fn from_tensors(
        step: usize,
        mut tensors: HashMap<String, Tensor>,
    ) -> std::result::Result<Self, String> {
        let names: Vec<String> = tensors
            .keys()
            .filter_map(|key| key.strip_suffix(MOMENT_SUFFIX_M).map(str::to_string))
            .collect();

        let mut moments = BTreeMap::new();
        for name in names {
            let m = tensors.remove(&format!("{}{}", name, MOMENT_SUFFIX_M));
            let v = tensors.remove(&format!("{}{}", name, MOMENT_SUFFIX_V));
            match (m, v) {
                (Some(m), Some(v)) => {
                    moments.insert(name, Moments { m, v });
                }
                _ => return Err(format!("incomplete moments for '{}'", name)),
            }
        }
        if let Some(extra) = tensors.keys().next() {
            return Err(format!("unexpected optimizer tensor '{}'", extra));
        }
        Ok(Self { step, moments })
    }
}

/// Next values of one parameter and its moments
struct PendingEntry {
    index: usize,
    value: Tensor,
    moments: Moments,
}

/// An optimizer step that has been computed but not yet written
pub struct PendingUpdate {
    step: usize,
    entries: Vec<PendingEntry>,
}

/// Adam optimizer over one named parameter set
pub struct Adam {
    config: AdamConfig,
    params: Vec<(String, Var)>,
    moments: BTreeMap<String, Moments>,
    step: usize,
}

impl Adam {
    /// Create an optimizer with zeroed moments for every parameter
    pub fn new(params: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        let mut moments = BTreeMap::new();
        for (name, var) in &params {
            let zeros = var.as_tensor().zeros_like()?;
            moments.insert(
                name.clone(),
                Moments {
                    m: zeros.clone(),
                    v: zeros,
                },
            );
        }
        Ok(Self {
            config,
            params,
            moments,
            step: 0,
        })
    }

    /// Perform a single optimization step
    ///
    /// Only gradients of this optimizer's own parameters are read from
    /// `grads`. Returns how many parameters were updated.
    pub fn step(&mut self, grads: &GradStore) -> Result<usize> {
        let update = self.prepare(grads)?;
        self.commit(update)
    }

    /// Compute the next parameter values and moments without writing them
    ///
    /// Parameters without a gradient are left out of the update.
    pub fn prepare(&self, grads: &GradStore) -> Result<PendingUpdate> {
        let step = self.step + 1;
        let t = step as i32;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;

        let mut entries = Vec::new();
        for (index, (name, var)) in self.params.iter().enumerate() {
            let Some(grad) = grads.get(var.as_tensor()) else {
                log::debug!("no gradient for '{}', skipping", name);
                continue;
            };
            let Some(state) = self.moments.get(name) else {
                continue;
            };

            // m = beta1 * m + (1 - beta1) * grad
            let m = ((&state.m * beta1)? + (grad * (1.0 - beta1))?)?;
            // v = beta2 * v + (1 - beta2) * grad^2
            let v = ((&state.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&m / (1.0 - beta1.powi(t)))?;
            let v_hat = (&v / (1.0 - beta2.powi(t)))?;
            let update = ((m_hat / (v_hat.sqrt()? + eps)?)? * lr)?;

            let param = var.as_tensor();
            let decayed = if weight_decay > 0.0 {
                (param * (1.0 - lr * weight_decay))?
            } else {
                param.clone()
            };
            entries.push(PendingEntry {
                index,
                value: (decayed - update)?,
                moments: Moments { m, v },
            });
        }
        Ok(PendingUpdate { step, entries })
    }

    /// Write an update computed by [`Adam::prepare`]
    ///
    /// Values are checked against their parameters before the first write.
    pub fn commit(&mut self, update: PendingUpdate) -> Result<usize> {
        for entry in &update.entries {
            let Some((name, var)) = self.params.get(entry.index) else {
                return Err(crate::CycleGanError::Config(format!(
                    "update refers to parameter {} of {}",
                    entry.index,
                    self.params.len()
                )));
            };
            if entry.value.dims() != var.dims() || entry.value.dtype() != var.dtype() {
                return Err(crate::CycleGanError::shape_mismatch(
                    format!("update of '{}'", name),
                    var.dims(),
                    entry.value.dims(),
                ));
            }
        }

        let updated = update.entries.len();
        for entry in update.entries {
            let (name, var) = &self.params[entry.index];
            var.set(&entry.value)?;
            self.moments.insert(name.clone(), entry.moments);
        }
        self.step = update.step;
        Ok(updated)
    }

    /// Number of completed steps
    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    /// Detached copy of the step counter and all moments
    pub fn state(&self) -> Result<OptimizerState> {
        let mut moments = BTreeMap::new();
        for (name, state) in &self.moments {
            moments.insert(
                name.clone(),
                Moments {
                    m: state.m.copy()?,
                    v: state.v.copy()?,
                },
            );
        }
        Ok(OptimizerState {
            step: self.step,
            moments,
        })
    }

    /// Check that `state` covers exactly this optimizer's parameters
    pub fn check_compatible(&self, state: &OptimizerState) -> std::result::Result<(), String> {
        if state.moments.len() != self.params.len() {
            return Err(format!(
                "expected moments for {} parameters, found {}",
                self.params.len(),
                state.moments.len()
            ));
        }
        for (name, var) in &self.params {
            let moments = state
                .moments
                .get(name)
                .ok_or_else(|| format!("missing moments for '{}'", name))?;
            for (label, tensor) in [("m", &moments.m), ("v", &moments.v)] {
                if tensor.dims() != var.dims() {
                    return Err(format!(
                        "moment {} of '{}' has shape {:?}, parameter has {:?}",
                        label,
                        name,
                        tensor.dims(),
                        var.dims()
                    ));
                }
            }
        }
        Ok(())
    }

    /// Replace the step counter and moments; nothing changes unless `state` fits
    pub fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        self.check_compatible(state)
            .map_err(crate::CycleGanError::Config)?;
        let device = self.device();
        let mut moments = BTreeMap::new();
        for (name, m) in &state.moments {
            moments.insert(
                name.clone(),
                Moments {
                    m: m.m.to_device(&device)?.copy()?,
                    v: m.v.to_device(&device)?.copy()?,
                },
            );
        }
        self.moments = moments;
        self.step = state.step;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn replace_moments(&mut self, name: &str, moments: Moments) {
        self.moments.insert(name.to_string(), moments);
    }

    fn device(&self) -> Device {
        self.params
            .first()
            .map(|(_, var)| var.device().clone())
            .unwrap_or(Device::Cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn single_param(values: &[f32]) -> Result<(String, Var)> {
        let var = Var::from_tensor(&Tensor::new(values, &Device::Cpu)?)?;
        Ok(("w".to_string(), var))
    }

    #[test]
    fn test_adam_creation() -> Result<()> {
        let optimizer = Adam::new(vec![single_param(&[1.0, 2.0])?], AdamConfig::default())?;

        assert_eq!(optimizer.learning_rate(), 2e-4);
        assert_eq!(optimizer.step_count(), 0);
        let state = optimizer.state()?;
        assert_eq!(state.moments["w"].m.to_vec1::<f32>()?, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() -> Result<()> {
        let (name, var) = single_param(&[1.0, -1.0])?;
        let config = AdamConfig {
            lr: 0.1,
            eps: 1e-12,
            ..Default::default()
        };
        let mut optimizer = Adam::new(vec![(name, var.clone())], config)?;

        let loss = (var.as_tensor() * 3.0)?.sum_all()?;
        let grads = loss.backward()?;
        assert_eq!(optimizer.step(&grads)?, 1);

        // First bias-corrected step is lr * sign(grad)
        let w = var.as_tensor().to_vec1::<f32>()?;
        assert!((w[0] - 0.9).abs() < 1e-5);
        assert!((w[1] + 1.1).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_adam_ignores_foreign_gradients() -> Result<()> {
        let (name, mine) = single_param(&[1.0])?;
        let other = Var::new(&[5.0f32], &Device::Cpu)?;
        let mut optimizer = Adam::new(vec![(name, mine.clone())], AdamConfig::default())?;

        let grads = other.as_tensor().sqr()?.sum_all()?.backward()?;
        assert_eq!(optimizer.step(&grads)?, 0);
        assert_eq!(mine.as_tensor().to_vec1::<f32>()?, vec![1.0]);
        assert_eq!(optimizer.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_adam_zero_gradient_keeps_parameters() -> Result<()> {
        let (name, var) = single_param(&[0.5, 0.25])?;
        let mut optimizer = Adam::new(vec![(name, var.clone())], AdamConfig::default())?;

        let grads = (var.as_tensor() * 0.0)?.sum_all()?.backward()?;
        optimizer.step(&grads)?;

        assert_eq!(var.as_tensor().to_vec1::<f32>()?, vec![0.5, 0.25]);
        Ok(())
    }

    #[test]
    fn test_state_roundtrip() -> Result<()> {
        let (name, var) = single_param(&[1.0, 2.0, 3.0])?;
        let mut source = Adam::new(vec![(name.clone(), var.clone())], AdamConfig::default())?;
        let grads = var.as_tensor().sqr()?.sum_all()?.backward()?;
        source.step(&grads)?;

        let state = source.state()?;
        let tensors: HashMap<String, Tensor> = state.to_tensors().into_iter().collect();
        let rebuilt = OptimizerState::from_tensors(state.step, tensors).unwrap();

        let mut target = Adam::new(vec![(name, var)], AdamConfig::default())?;
        target.load_state(&rebuilt)?;

        assert_eq!(target.step_count(), 1);
        let a = source.state()?.moments["w"].v.to_vec1::<f32>()?;
        let b = target.state()?.moments["w"].v.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_load_state_rejects_mismatch() -> Result<()> {
        let mut optimizer = Adam::new(vec![single_param(&[1.0, 2.0])?], AdamConfig::default())?;
        let other = Adam::new(vec![single_param(&[1.0, 2.0, 3.0])?], AdamConfig::default())?;

        let state = other.state()?;
        assert!(optimizer.check_compatible(&state).is_err());
        assert!(optimizer.load_state(&state).is_err());
        assert_eq!(optimizer.state()?.moments["w"].m.dims(), &[2]);

        let mut partial = HashMap::new();
        partial.insert("w.m".to_string(), Tensor::zeros(2, DType::F32, &Device::Cpu)?);
        assert!(OptimizerState::from_tensors(0, partial).is_err());
        Ok(())
    }

    #[test]
    fn test_prepare_writes_nothing_until_commit() -> Result<()> {
        let (name, var) = single_param(&[1.0, -1.0])?;
        let mut optimizer = Adam::new(vec![(name, var.clone())], AdamConfig::default())?;
        let grads = (var.as_tensor() * 2.0)?.sum_all()?.backward()?;

        let update = optimizer.prepare(&grads)?;
        assert_eq!(var.as_tensor().to_vec1::<f32>()?, vec![1.0, -1.0]);
        assert_eq!(optimizer.step_count(), 0);
        assert_eq!(optimizer.state()?.moments["w"].m.to_vec1::<f32>()?, vec![0.0, 0.0]);

        assert_eq!(optimizer.commit(update)?, 1);
        assert_ne!(var.as_tensor().to_vec1::<f32>()?, vec![1.0, -1.0]);
        assert_eq!(optimizer.step_count(), 1);
        Ok(())
    }

    #[test]
    fn test_commit_rejects_foreign_update() -> Result<()> {
        let (name, var) = single_param(&[1.0, 2.0, 3.0])?;
        let source = Adam::new(vec![(name, var.clone())], AdamConfig::default())?;
        let grads = var.as_tensor().sqr()?.sum_all()?.backward()?;
        let update = source.prepare(&grads)?;

        let (other_name, other) = single_param(&[5.0, 6.0])?;
        let mut target = Adam::new(vec![(other_name, other.clone())], AdamConfig::default())?;

        assert!(target.commit(update).is_err());
        assert_eq!(other.as_tensor().to_vec1::<f32>()?, vec![5.0, 6.0]);
        assert_eq!(target.step_count(), 0);
        Ok(())
    }
}
