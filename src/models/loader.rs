/// Safetensors I/O and the final-model directory
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;

use super::{ModelBank, NetworkId};
use crate::config::ModelConfig;
use crate::utils::write_atomic;
use crate::{CycleGanError, Result};

const WEIGHTS_FILE: &str = "weights.safetensors";
const CONFIG_FILE: &str = "config.json";

/// Serialize named tensors plus string metadata to a safetensors file
///
/// The file is written to a temporary sibling and renamed into place.
pub fn write_tensors(
    path: &Path,
    tensors: &BTreeMap<String, Tensor>,
    metadata: HashMap<String, String>,
) -> Result<()> {
    let data = safetensors::serialize(
        tensors.iter().map(|(name, tensor)| (name.as_str(), tensor)),
        &Some(metadata),
    )?;
    write_atomic(path, &data)
}

/// Read every tensor and the metadata of a safetensors file
pub fn read_tensors(
    path: &Path,
    device: &Device,
) -> Result<(HashMap<String, Tensor>, HashMap<String, String>)> {
    let data = std::fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&data)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let tensors = candle_core::safetensors::load_buffer(&data, device)?;
    Ok((tensors, metadata))
}

/// Directory holding one network's final weights and topology
pub fn final_model_dir(model_dir: &Path, id: NetworkId) -> PathBuf {
    model_dir.join(id.name())
}

/// Persist all four networks to `model_dir/<network>/`
///
/// Independent of the rotating checkpoints; each directory is overwritten.
pub fn save_final_models(bank: &ModelBank, model_dir: &Path) -> Result<()> {
    let config_json = serde_json::to_string_pretty(bank.config())?;

    for id in NetworkId::ALL {
        let dir = final_model_dir(model_dir, id);
        std::fs::create_dir_all(&dir)?;
        let weights = dir.join(WEIGHTS_FILE);
        match id {
            NetworkId::GeneratorG => bank.generator_g.save(&weights)?,
            NetworkId::GeneratorF => bank.generator_f.save(&weights)?,
            NetworkId::DiscriminatorX => bank.discriminator_x.save(&weights)?,
            NetworkId::DiscriminatorY => bank.discriminator_y.save(&weights)?,
        }
        write_atomic(&dir.join(CONFIG_FILE), config_json.as_bytes())?;
        log::info!("Saved final {} to {}", id, dir.display());
    }
    Ok(())
}

/// Read the topology stored next to a final model
pub fn load_final_config(model_dir: &Path, id: NetworkId) -> Result<ModelConfig> {
    let path = final_model_dir(model_dir, id).join(CONFIG_FILE);
    let text = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Rebuild a bank from the final-model directory
///
/// The topology comes from GeneratorG's `config.json`; networks whose
/// weights are missing keep their fresh initialization.
pub fn load_final_models(model_dir: &Path, device: &Device) -> Result<ModelBank> {
    let config = load_final_config(model_dir, NetworkId::GeneratorG)?;
    let bank = ModelBank::new(&config, device)?;

    for id in NetworkId::ALL {
        let weights = final_model_dir(model_dir, id).join(WEIGHTS_FILE);
        if !weights.exists() {
            log::warn!("No final weights for {} at {}", id, weights.display());
            continue;
        }
        match id {
            NetworkId::GeneratorG => bank.generator_g.load(&weights)?,
            NetworkId::GeneratorF => bank.generator_f.load(&weights)?,
            NetworkId::DiscriminatorX => bank.discriminator_x.load(&weights)?,
            NetworkId::DiscriminatorY => bank.discriminator_y.load(&weights)?,
        }
    }

    if !final_model_dir(model_dir, NetworkId::GeneratorG).join(WEIGHTS_FILE).exists() {
        return Err(CycleGanError::Config(format!(
            "no trained generator_g under {}",
            model_dir.display()
        )));
    }
    Ok(bank)
}
