/// Networks and the bank of four independently parameterized models
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, ModuleT, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::utils::count_parameters;
use crate::{CycleGanError, Result};

pub mod discriminator;
pub mod generator;
pub mod loader;

pub use discriminator::PatchDiscriminator;
pub use generator::UNetGenerator;

/// Named parameter tensors of one network, ordered by name
pub type ParameterSet = BTreeMap<String, Tensor>;

/// One of the two unpaired image distributions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Domain {
    X,
    Y,
}

impl Domain {
    pub fn other(self) -> Self {
        match self {
            Domain::X => Domain::Y,
            Domain::Y => Domain::X,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::X => write!(f, "X"),
            Domain::Y => write!(f, "Y"),
        }
    }
}

/// Identifies one of the four trainable networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkId {
    /// X -> Y
    GeneratorG,
    /// Y -> X
    GeneratorF,
    DiscriminatorX,
    DiscriminatorY,
}

impl NetworkId {
    pub const ALL: [NetworkId; 4] = [
        NetworkId::GeneratorG,
        NetworkId::GeneratorF,
        NetworkId::DiscriminatorX,
        NetworkId::DiscriminatorY,
    ];

    /// Stable name used for files and logs
    pub fn name(self) -> &'static str {
        match self {
            NetworkId::GeneratorG => "generator_g",
            NetworkId::GeneratorF => "generator_f",
            NetworkId::DiscriminatorX => "discriminator_x",
            NetworkId::DiscriminatorY => "discriminator_y",
        }
    }

    pub fn is_generator(self) -> bool {
        matches!(self, NetworkId::GeneratorG | NetworkId::GeneratorF)
    }

    /// Domain this network produces (generators) or judges (discriminators)
    pub fn domain(self) -> Domain {
        match self {
            NetworkId::GeneratorG | NetworkId::DiscriminatorY => Domain::Y,
            NetworkId::GeneratorF | NetworkId::DiscriminatorX => Domain::X,
        }
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per network
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PerNetwork<T> {
    pub generator_g: T,
    pub generator_f: T,
    pub discriminator_x: T,
    pub discriminator_y: T,
}

impl<T> PerNetwork<T> {
    pub fn from_fn(mut f: impl FnMut(NetworkId) -> T) -> Self {
        Self {
            generator_g: f(NetworkId::GeneratorG),
            generator_f: f(NetworkId::GeneratorF),
            discriminator_x: f(NetworkId::DiscriminatorX),
            discriminator_y: f(NetworkId::DiscriminatorY),
        }
    }

    pub fn try_from_fn<E>(mut f: impl FnMut(NetworkId) -> std::result::Result<T, E>) -> std::result::Result<Self, E> {
        Ok(Self {
            generator_g: f(NetworkId::GeneratorG)?,
            generator_f: f(NetworkId::GeneratorF)?,
            discriminator_x: f(NetworkId::DiscriminatorX)?,
            discriminator_y: f(NetworkId::DiscriminatorY)?,
        })
    }

    pub fn get(&self, id: NetworkId) -> &T {
        match id {
            NetworkId::GeneratorG => &self.generator_g,
            NetworkId::GeneratorF => &self.generator_f,
            NetworkId::DiscriminatorX => &self.discriminator_x,
            NetworkId::DiscriminatorY => &self.discriminator_y,
        }
    }

    pub fn get_mut(&mut self, id: NetworkId) -> &mut T {
        match id {
            NetworkId::GeneratorG => &mut self.generator_g,
            NetworkId::GeneratorF => &mut self.generator_f,
            NetworkId::DiscriminatorX => &mut self.discriminator_x,
            NetworkId::DiscriminatorY => &mut self.discriminator_y,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (NetworkId, &T)> {
        NetworkId::ALL.into_iter().map(move |id| (id, self.get(id)))
    }
}

/// A differentiable module together with the variables it owns
pub struct Network<M> {
    id: NetworkId,
    varmap: VarMap,
    module: M,
    device: Device,
}

impl<M> Network<M> {
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Trainable variables sorted by name
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    /// Total number of scalar parameters
    pub fn num_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, var)| count_parameters(var.as_tensor()))
            .sum()
    }

    /// Detached copies of every parameter
    pub fn snapshot(&self) -> Result<ParameterSet> {
        let mut set = ParameterSet::new();
        for (name, var) in self.named_parameters() {
            set.insert(name, var.as_tensor().copy()?);
        }
        Ok(set)
    }

    /// Check that `set` has exactly this network's parameter names and shapes
    pub fn check_compatible(&self, set: &ParameterSet) -> std::result::Result<(), String> {
        let params = self.named_parameters();
        if params.len() != set.len() {
            return Err(format!(
                "expected {} parameter tensors, found {}",
                params.len(),
                set.len()
            ));
        }
        for (name, var) in &params {
            let tensor = set
                .get(name)
                .ok_or_else(|| format!("missing parameter '{}'", name))?;
            if tensor.dims() != var.dims() {
                return Err(format!(
                    "parameter '{}' has shape {:?}, model expects {:?}",
                    name,
                    tensor.dims(),
                    var.dims()
                ));
            }
            if tensor.dtype() != var.dtype() {
                return Err(format!(
                    "parameter '{}' has dtype {:?}, model expects {:?}",
                    name,
                    tensor.dtype(),
                    var.dtype()
                ));
            }
        }
        Ok(())
    }

    /// Overwrite every parameter from `set`; nothing is written unless all of it fits
    pub fn load_parameters(&self, set: &ParameterSet) -> Result<()> {
        self.check_compatible(set)
            .map_err(|reason| CycleGanError::Config(format!("{}: {}", self.id, reason)))?;
        for (name, var) in self.named_parameters() {
            if let Some(tensor) = set.get(&name) {
                var.set(&tensor.to_device(&self.device)?)?;
            }
        }
        Ok(())
    }

    /// Reset every parameter to zero
    pub fn zero_parameters(&self) -> Result<()> {
        for (_, var) in self.named_parameters() {
            var.set(&var.as_tensor().zeros_like()?)?;
        }
        Ok(())
    }

    /// Write parameters to a safetensors file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let set = self.snapshot()?;
        let metadata = [("network".to_string(), self.id.name().to_string())]
            .into_iter()
            .collect();
        loader::write_tensors(path.as_ref(), &set, metadata)
    }

    /// Read parameters from a safetensors file written by [`Network::save`]
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let (tensors, _metadata) = loader::read_tensors(path.as_ref(), &self.device)?;
        let set: ParameterSet = tensors.into_iter().collect();
        self.load_parameters(&set)
    }
}

impl<M: ModuleT> Network<M> {
    /// Run the module; `train` selects training-mode behavior such as dropout
    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.module.forward_t(xs, train)?)
    }
}

pub type Generator = Network<UNetGenerator>;
pub type Discriminator = Network<PatchDiscriminator>;

impl Generator {
    pub fn new(id: NetworkId, config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let module = UNetGenerator::new(config, vb)?;
        Ok(Self {
            id,
            varmap,
            module,
            device: device.clone(),
        })
    }
}

impl Discriminator {
    pub fn new(id: NetworkId, config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let module = PatchDiscriminator::new(config, vb)?;
        Ok(Self {
            id,
            varmap,
            module,
            device: device.clone(),
        })
    }
}

/// The four networks of a CycleGAN, each with its own variables
pub struct ModelBank {
    pub generator_g: Generator,
    pub generator_f: Generator,
    pub discriminator_x: Discriminator,
    pub discriminator_y: Discriminator,
    config: ModelConfig,
}

impl ModelBank {
    /// Create freshly initialized networks
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let bank = Self {
            generator_g: Generator::new(NetworkId::GeneratorG, config, device)?,
            generator_f: Generator::new(NetworkId::GeneratorF, config, device)?,
            discriminator_x: Discriminator::new(NetworkId::DiscriminatorX, config, device)?,
            discriminator_y: Discriminator::new(NetworkId::DiscriminatorY, config, device)?,
            config: config.clone(),
        };

        for id in NetworkId::ALL {
            let domain = id.domain();
            if id.is_generator() {
                log::debug!(
                    "{} ({} -> {}): {} parameters",
                    id,
                    domain.other(),
                    domain,
                    bank.num_parameters(id)
                );
            } else {
                log::debug!("{} (judges {}): {} parameters", id, domain, bank.num_parameters(id));
            }
        }
        Ok(bank)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn named_parameters(&self, id: NetworkId) -> Vec<(String, Var)> {
        match id {
            NetworkId::GeneratorG => self.generator_g.named_parameters(),
            NetworkId::GeneratorF => self.generator_f.named_parameters(),
            NetworkId::DiscriminatorX => self.discriminator_x.named_parameters(),
            NetworkId::DiscriminatorY => self.discriminator_y.named_parameters(),
        }
    }

    pub fn num_parameters(&self, id: NetworkId) -> usize {
        match id {
            NetworkId::GeneratorG => self.generator_g.num_parameters(),
            NetworkId::GeneratorF => self.generator_f.num_parameters(),
            NetworkId::DiscriminatorX => self.discriminator_x.num_parameters(),
            NetworkId::DiscriminatorY => self.discriminator_y.num_parameters(),
        }
    }

    pub fn snapshot(&self) -> Result<PerNetwork<ParameterSet>> {
        Ok(PerNetwork {
            generator_g: self.generator_g.snapshot()?,
            generator_f: self.generator_f.snapshot()?,
            discriminator_x: self.discriminator_x.snapshot()?,
            discriminator_y: self.discriminator_y.snapshot()?,
        })
    }

    pub fn check_compatible(&self, sets: &PerNetwork<ParameterSet>) -> std::result::Result<(), String> {
        let prefixed = |id: NetworkId, r: std::result::Result<(), String>| {
            r.map_err(|reason| format!("{}: {}", id, reason))
        };
        prefixed(NetworkId::GeneratorG, self.generator_g.check_compatible(&sets.generator_g))?;
        prefixed(NetworkId::GeneratorF, self.generator_f.check_compatible(&sets.generator_f))?;
        prefixed(
            NetworkId::DiscriminatorX,
            self.discriminator_x.check_compatible(&sets.discriminator_x),
        )?;
        prefixed(
            NetworkId::DiscriminatorY,
            self.discriminator_y.check_compatible(&sets.discriminator_y),
        )
    }

    /// Load all four parameter sets, or none of them
    pub fn load_parameters(&self, sets: &PerNetwork<ParameterSet>) -> Result<()> {
        self.check_compatible(sets).map_err(CycleGanError::Config)?;
        self.generator_g.load_parameters(&sets.generator_g)?;
        self.generator_f.load_parameters(&sets.generator_f)?;
        self.discriminator_x.load_parameters(&sets.discriminator_x)?;
        self.discriminator_y.load_parameters(&sets.discriminator_y)
    }

    /// Reset all four networks to zero weights
    pub fn zero_parameters(&self) -> Result<()> {
        self.generator_g.zero_parameters()?;
        self.generator_f.zero_parameters()?;
        self.discriminator_x.zero_parameters()?;
        self.discriminator_y.zero_parameters()
    }
}
