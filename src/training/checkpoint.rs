/// Rotating checkpoints of the full training state with safetensors
///
/// Layout under the checkpoint root:
///
/// ```text
/// checkpoint.json              manifest of retained checkpoints, oldest first
/// ckpt-<index>/
///     state.json               epoch, step and topology
///     <network>.safetensors    parameters, one file per network
///     <network>.optimizer.safetensors
/// ```
///
/// A checkpoint is written into a hidden staging directory and renamed into
/// place, so a directory named `ckpt-<index>` is always complete.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::Device;

use super::optimizer::OptimizerState;
use super::step::{TrainingSnapshot, TrainingState};
use crate::config::ModelConfig;
use crate::models::loader::{read_tensors, write_tensors};
use crate::models::{NetworkId, ParameterSet, PerNetwork};
use crate::utils::write_atomic;
use crate::{CycleGanError, Result};

const MANIFEST_FILE: &str = "checkpoint.json";
const STATE_FILE: &str = "state.json";
const DIR_PREFIX: &str = "ckpt-";
const STAGING_PREFIX: &str = ".ckpt-";
const STAGING_SUFFIX: &str = ".partial";
const STEP_KEY: &str = "step";

/// Contents of `state.json`
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    pub index: usize,
    /// Completed epochs at save time
    pub epoch: usize,
    pub global_step: usize,
    pub model: ModelConfig,
    /// RFC 3339 creation time
    pub created_at: String,
}

/// A retained checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHandle {
    pub index: usize,
    pub epoch: usize,
    pub global_step: usize,
    pub path: PathBuf,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct Manifest {
    next_index: usize,
    checkpoints: Vec<ManifestEntry>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ManifestEntry {
    index: usize,
    epoch: usize,
    global_step: usize,
}

/// Removes a staging directory unless the checkpoint was committed
struct StagingDir {
    path: PathBuf,
    committed: bool,
}

impl StagingDir {
    fn create(path: PathBuf) -> Result<Self> {
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            committed: false,
        })
    }

    fn commit(mut self, target: &Path) -> Result<()> {
        if target.exists() {
            log::warn!("Replacing unlisted checkpoint directory {}", target.display());
            std::fs::remove_dir_all(target)?;
        }
        std::fs::rename(&self.path, target)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                log::warn!("Failed to clean up {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Saves, lists, evicts and restores checkpoints under one directory
pub struct CheckpointManager {
    root: PathBuf,
    max_to_keep: usize,
    retained: Vec<CheckpointHandle>,
    next_index: usize,
}

impl CheckpointManager {
    /// Open (or create) a checkpoint directory
    ///
    /// Leftover staging directories from an interrupted save are deleted.
    pub fn open<P: AsRef<Path>>(root: P, max_to_keep: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        remove_stale_staging(&root)?;

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            let text = std::fs::read_to_string(&manifest_path)?;
            serde_json::from_str::<Manifest>(&text)
                .map_err(|e| CycleGanError::corrupt(&manifest_path, e.to_string()))?
        } else {
            scan_checkpoints(&root)?
        };

        let mut retained = Vec::new();
        for entry in manifest.checkpoints {
            let path = checkpoint_dir(&root, entry.index);
            if !path.is_dir() {
                log::warn!("Checkpoint {} listed but missing on disk", path.display());
                continue;
            }
            retained.push(CheckpointHandle {
                index: entry.index,
                epoch: entry.epoch,
                global_step: entry.global_step,
                path,
            });
        }
        retained.sort_by_key(|h| h.index);

        let next_index = retained
            .last()
            .map(|h| h.index + 1)
            .unwrap_or(1)
            .max(manifest.next_index)
            .max(1);

        log::debug!(
            "Opened {} with {} checkpoints",
            root.display(),
            retained.len()
        );
        Ok(Self {
            root,
            max_to_keep: max_to_keep.max(1),
            retained,
            next_index,
        })
    }

    /// Retained checkpoints, oldest first
    pub fn checkpoints(&self) -> &[CheckpointHandle] {
        &self.retained
    }

    /// Most recently created checkpoint
    pub fn latest(&self) -> Option<&CheckpointHandle> {
        self.retained.last()
    }

    /// Persist a snapshot as a new checkpoint and evict the oldest ones
    /// beyond `max_to_keep`
    ///
    /// Either the whole checkpoint becomes visible or none of it does; on
    /// error the retained set is left as it was.
    pub fn save(
        &mut self,
        snapshot: &TrainingSnapshot,
        model: &ModelConfig,
    ) -> Result<CheckpointHandle> {
        let index = self.next_index;
        let staging = StagingDir::create(
            self.root
                .join(format!("{}{}{}", STAGING_PREFIX, index, STAGING_SUFFIX)),
        )?;

        for id in NetworkId::ALL {
            let network = [("network".to_string(), id.name().to_string())];
            write_tensors(
                &parameters_file(&staging.path, id),
                snapshot.parameters.get(id),
                network.iter().cloned().collect(),
            )?;

            let optimizer = snapshot.optimizers.get(id);
            let mut metadata: HashMap<String, String> = network.into_iter().collect();
            metadata.insert(STEP_KEY.to_string(), optimizer.step.to_string());
            write_tensors(
                &optimizer_file(&staging.path, id),
                &optimizer.to_tensors(),
                metadata,
            )?;
        }

        let metadata = CheckpointMetadata {
            index,
            epoch: snapshot.epoch,
            global_step: snapshot.global_step,
            model: model.clone(),
            created_at: chrono::Local::now().to_rfc3339(),
        };
        write_atomic(
            &staging.path.join(STATE_FILE),
            serde_json::to_string_pretty(&metadata)?.as_bytes(),
        )?;

        let path = checkpoint_dir(&self.root, index);
        staging.commit(&path)?;

        let handle = CheckpointHandle {
            index,
            epoch: snapshot.epoch,
            global_step: snapshot.global_step,
            path,
        };
        let mut retained = self.retained.clone();
        retained.push(handle.clone());
        let excess = retained.len().saturating_sub(self.max_to_keep);
        let evicted: Vec<CheckpointHandle> = retained.drain(..excess).collect();

        // The manifest decides what is retained; until it is written the new
        // directory is not part of the set.
        if let Err(e) = self.write_manifest(&retained, index + 1) {
            if let Err(cleanup) = std::fs::remove_dir_all(&handle.path) {
                log::warn!("Failed to remove {}: {}", handle.path.display(), cleanup);
            }
            return Err(e);
        }
        self.retained = retained;
        self.next_index = index + 1;

        for old in evicted {
            log::debug!("Evicting checkpoint {}", old.path.display());
            if let Err(e) = std::fs::remove_dir_all(&old.path) {
                log::warn!("Failed to remove {}: {}", old.path.display(), e);
            }
        }

        log::info!(
            "Saved checkpoint {} (epoch {}, step {})",
            handle.path.display(),
            handle.epoch,
            handle.global_step
        );
        Ok(handle)
    }

    /// Read all eight sub-states of a checkpoint
    ///
    /// Any unreadable file or malformed content is reported as
    /// `CorruptCheckpoint`.
    pub fn load(&self, handle: &CheckpointHandle, device: &Device) -> Result<TrainingSnapshot> {
        let corrupt = |reason: String| CycleGanError::corrupt(&handle.path, reason);

        let state_path = handle.path.join(STATE_FILE);
        let text = std::fs::read_to_string(&state_path)
            .map_err(|e| corrupt(format!("{}: {}", STATE_FILE, e)))?;
        let metadata: CheckpointMetadata = serde_json::from_str(&text)
            .map_err(|e| corrupt(format!("{}: {}", STATE_FILE, e)))?;

        let parameters = PerNetwork::try_from_fn(|id| -> Result<ParameterSet> {
            let path = parameters_file(&handle.path, id);
            let (tensors, _) = read_tensors(&path, device)
                .map_err(|e| corrupt(format!("{} parameters: {}", id, e)))?;
            Ok(tensors.into_iter().collect())
        })?;

        let optimizers = PerNetwork::try_from_fn(|id| -> Result<OptimizerState> {
            let path = optimizer_file(&handle.path, id);
            let (tensors, metadata) = read_tensors(&path, device)
                .map_err(|e| corrupt(format!("{} optimizer: {}", id, e)))?;
            let step = metadata
                .get(STEP_KEY)
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| corrupt(format!("{} optimizer: missing step", id)))?;
            OptimizerState::from_tensors(step, tensors)
                .map_err(|reason| corrupt(format!("{} optimizer: {}", id, reason)))
        })?;

        Ok(TrainingSnapshot {
            parameters,
            optimizers,
            epoch: metadata.epoch,
            global_step: metadata.global_step,
        })
    }

    /// Restore `state` from a checkpoint, all or nothing
    ///
    /// Fails with `CorruptCheckpoint` if any sub-state cannot be read or does
    /// not match the topology of `state`; `state` is untouched in that case.
    pub fn restore(&self, handle: &CheckpointHandle, state: &mut TrainingState) -> Result<()> {
        let snapshot = self.load(handle, state.device())?;
        state
            .check_compatible(&snapshot)
            .map_err(|reason| CycleGanError::corrupt(&handle.path, reason))?;
        state.apply(&snapshot)?;

        log::info!(
            "Restored checkpoint {} (epoch {}, step {})",
            handle.path.display(),
            snapshot.epoch,
            snapshot.global_step
        );
        Ok(())
    }

    fn write_manifest(&self, retained: &[CheckpointHandle], next_index: usize) -> Result<()> {
        let manifest = Manifest {
            next_index,
            checkpoints: retained
                .iter()
                .map(|h| ManifestEntry {
                    index: h.index,
                    epoch: h.epoch,
                    global_step: h.global_step,
                })
                .collect(),
        };
        write_atomic(
            &self.root.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?.as_bytes(),
        )
    }
}

fn checkpoint_dir(root: &Path, index: usize) -> PathBuf {
    root.join(format!("{}{}", DIR_PREFIX, index))
}

fn parameters_file(dir: &Path, id: NetworkId) -> PathBuf {
    dir.join(format!("{}.safetensors", id.name()))
}

fn optimizer_file(dir: &Path, id: NetworkId) -> PathBuf {
    dir.join(format!("{}.optimizer.safetensors", id.name()))
}

fn remove_stale_staging(root: &Path) -> Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(STAGING_PREFIX) && name.ends_with(STAGING_SUFFIX) {
            log::warn!("Removing interrupted checkpoint {}", entry.path().display());
            std::fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

/// Rebuild a manifest from `ckpt-<index>` directories
fn scan_checkpoints(root: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::default();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(index) = name
            .strip_prefix(DIR_PREFIX)
            .and_then(|s| s.parse::<usize>().ok())
        else {
            continue;
        };

        let state = std::fs::read_to_string(entry.path().join(STATE_FILE))
            .map_err(CycleGanError::from)
            .and_then(|text| Ok(serde_json::from_str::<CheckpointMetadata>(&text)?));
        match state {
            Ok(metadata) => manifest.checkpoints.push(ManifestEntry {
                index,
                epoch: metadata.epoch,
                global_step: metadata.global_step,
            }),
            Err(e) => log::warn!("Ignoring {}: {}", entry.path().display(), e),
        }
    }
    manifest.checkpoints.sort_by_key(|e| e.index);
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrainingConfig;
    use crate::models::ModelBank;
    use crate::training::losses::LossEngine;
    use crate::training::step::train_step;
    use candle_core::Tensor;

    fn fresh_state() -> Result<TrainingState> {
        let models = ModelBank::new(&ModelConfig::small(16), &Device::Cpu)?;
        TrainingState::new(models, &TrainingConfig::default())
    }

    fn trained_state() -> Result<TrainingState> {
        let mut state = fresh_state()?;
        let x = Tensor::randn(0f32, 0.5, (1, 16, 16, 3), &Device::Cpu)?;
        let y = Tensor::randn(0f32, 0.5, (1, 16, 16, 3), &Device::Cpu)?;
        train_step(&mut state, &LossEngine::new(10.0), &x, &y)?;
        state.epoch = 1;
        Ok(state)
    }

    fn save(manager: &mut CheckpointManager, state: &TrainingState) -> Result<CheckpointHandle> {
        manager.save(&state.snapshot()?, state.model_config())
    }

    fn values(tensor: &Tensor) -> Result<Vec<f32>> {
        Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
    }

    #[test]
    fn test_empty_directory() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = CheckpointManager::open(dir.path(), 5)?;
        assert!(manager.latest().is_none());
        assert!(manager.checkpoints().is_empty());
        Ok(())
    }

    #[test]
    fn test_roundtrip_is_bit_identical() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = CheckpointManager::open(dir.path(), 5)?;
        let source = trained_state()?;
        let handle = save(&mut manager, &source)?;
        assert_eq!(handle.index, 1);

        let mut target = fresh_state()?;
        manager.restore(&handle, &mut target)?;

        assert_eq!(target.epoch, 1);
        assert_eq!(target.global_step, 1);
        let a = source.snapshot()?;
        let b = target.snapshot()?;
        for id in NetworkId::ALL {
            for (name, tensor) in a.parameters.get(id) {
                assert_eq!(values(tensor)?, values(&b.parameters.get(id)[name])?);
            }
            let (ma, mb) = (a.optimizers.get(id), b.optimizers.get(id));
            assert_eq!(ma.step, mb.step);
            for (name, moments) in &ma.moments {
                assert_eq!(values(&moments.m)?, values(&mb.moments[name].m)?);
                assert_eq!(values(&moments.v)?, values(&mb.moments[name].v)?);
            }
        }
        Ok(())
    }

    #[test]
    fn test_retention_keeps_most_recent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = CheckpointManager::open(dir.path(), 3)?;
        let mut state = fresh_state()?;

        for epoch in 1..=7 {
            state.epoch = epoch;
            save(&mut manager, &state)?;
        }

        let kept: Vec<usize> = manager.checkpoints().iter().map(|h| h.index).collect();
        assert_eq!(kept, vec![5, 6, 7]);
        assert_eq!(manager.latest().map(|h| h.epoch), Some(7));
        assert!(!checkpoint_dir(dir.path(), 4).exists());
        assert!(checkpoint_dir(dir.path(), 5).exists());

        let reopened = CheckpointManager::open(dir.path(), 3)?;
        assert_eq!(reopened.checkpoints(), manager.checkpoints());
        Ok(())
    }

    #[test]
    fn test_corrupt_file_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = CheckpointManager::open(dir.path(), 5)?;
        let handle = save(&mut manager, &trained_state()?)?;

        let victim = optimizer_file(&handle.path, NetworkId::DiscriminatorY);
        let bytes = std::fs::read(&victim)?;
        std::fs::write(&victim, &bytes[..bytes.len() / 2])?;

        let mut target = fresh_state()?;
        let before = target.snapshot()?;
        let err = manager.restore(&handle, &mut target);
        assert!(matches!(err, Err(CycleGanError::CorruptCheckpoint { .. })));

        // Nothing was applied
        assert_eq!(target.global_step, 0);
        let after = target.snapshot()?;
        for (name, tensor) in &before.parameters.generator_g {
            assert_eq!(values(tensor)?, values(&after.parameters.generator_g[name])?);
        }
        Ok(())
    }

    #[test]
    fn test_topology_mismatch_is_corrupt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = CheckpointManager::open(dir.path(), 5)?;
        let handle = save(&mut manager, &fresh_state()?)?;

        let mut wide = ModelConfig::small(16);
        wide.discriminator.base_filters = 8;
        let models = ModelBank::new(&wide, &Device::Cpu)?;
        let mut target = TrainingState::new(models, &TrainingConfig::default())?;

        let err = manager.restore(&handle, &mut target);
        assert!(matches!(err, Err(CycleGanError::CorruptCheckpoint { .. })));
        Ok(())
    }

    fn checkpoint_names(root: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with(DIR_PREFIX) || name.starts_with(STAGING_PREFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    #[test]
    fn test_failed_save_leaves_retained_set() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = CheckpointManager::open(dir.path(), 5)?;
        let state = fresh_state()?;
        save(&mut manager, &state)?;
        let before = manager.checkpoints().to_vec();

        // A plain file where the next checkpoint directory goes
        let blocker = checkpoint_dir(dir.path(), 2);
        std::fs::write(&blocker, b"not a directory")?;

        assert!(save(&mut manager, &state).is_err());
        assert_eq!(manager.checkpoints(), &before[..]);
        assert_eq!(manager.latest().map(|h| h.index), Some(1));
        assert!(blocker.is_file());
        assert!(!dir.path().join(".ckpt-2.partial").exists());
        assert_eq!(checkpoint_names(dir.path())?, vec!["ckpt-1", "ckpt-2"]);

        std::fs::remove_file(&blocker)?;
        let handle = save(&mut manager, &state)?;
        assert_eq!(handle.index, 2);
        assert_eq!(CheckpointManager::open(dir.path(), 5)?.checkpoints(), manager.checkpoints());
        Ok(())
    }

    #[test]
    fn test_failed_manifest_write_rolls_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = CheckpointManager::open(dir.path(), 1)?;
        let state = fresh_state()?;
        save(&mut manager, &state)?;

        // A non-empty directory in place of the manifest makes its rename fail
        let manifest = dir.path().join(MANIFEST_FILE);
        std::fs::remove_file(&manifest)?;
        std::fs::create_dir_all(manifest.join("blocker"))?;

        assert!(save(&mut manager, &state).is_err());
        assert_eq!(manager.latest().map(|h| h.index), Some(1));
        assert_eq!(checkpoint_names(dir.path())?, vec!["ckpt-1"]);

        std::fs::remove_dir_all(&manifest)?;
        let handle = save(&mut manager, &state)?;

        let kept: Vec<usize> = manager.checkpoints().iter().map(|h| h.index).collect();
        assert_eq!(kept, vec![handle.index]);
        assert_eq!(
            checkpoint_names(dir.path())?,
            vec![format!("{}{}", DIR_PREFIX, handle.index)]
        );
        Ok(())
    }

    #[test]
    fn test_stale_staging_is_removed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stale = dir.path().join(".ckpt-3.partial");
        std::fs::create_dir_all(&stale)?;
        std::fs::write(stale.join("generator_g.safetensors"), b"half")?;

        let manager = CheckpointManager::open(dir.path(), 5)?;

        assert!(!stale.exists());
        assert!(manager.latest().is_none());
        Ok(())
    }

    #[test]
    fn test_scan_without_manifest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut manager = CheckpointManager::open(dir.path(), 5)?;
        let state = fresh_state()?;
        save(&mut manager, &state)?;
        save(&mut manager, &state)?;
        std::fs::remove_file(dir.path().join(MANIFEST_FILE))?;

        let reopened = CheckpointManager::open(dir.path(), 5)?;

        assert_eq!(reopened.latest().map(|h| h.index), Some(2));
        assert_eq!(reopened.next_index, 3);
        Ok(())
    }
}
