//! Driver checkpoint state and the JSON checkpoint store

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::collaborators::CheckpointStore;
use crate::error::{KolosalError, Result};
use crate::nas::CandidatePool;
use crate::ranking::RankingState;

/// Everything needed to resume a run.
///
/// `epoch` counts completed epochs; `iterations_in_epoch` counts update groups
/// already consumed from epoch `epoch + 1` (zero for an end-of-epoch save).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub iterations_in_epoch: usize,
    pub end_of_epoch: bool,
    pub num_updates: u64,
    pub lr: f64,
    /// Validation loss measured right before this save
    pub val_loss: Option<f64>,
    /// Lowest validation loss seen so far
    pub best_loss: Option<f64>,
    pub ranking: RankingState,
    /// Kept so a resumed run compares losses of the same candidates in the same order
    pub candidate_pool: Option<CandidatePool>,
    /// Set once the ranking check asked the run to stop
    #[serde(default)]
    pub stop_requested: bool,
    /// Opaque trainer state
    #[serde(default)]
    pub trainer: serde_json::Value,
}

impl TrainingState {
    /// Whether this save holds the best validation loss so far
    pub fn is_best(&self) -> bool {
        matches!((self.val_loss, self.best_loss), (Some(v), Some(b)) if v <= b)
    }
}

const LAST: &str = "checkpoint_last.json";
const BEST: &str = "checkpoint_best.json";

/// Writes checkpoints as pretty JSON files in one directory:
/// `checkpoint{epoch}.json` at epoch ends, `checkpoint_{epoch}_{updates}.json` mid-epoch,
/// `checkpoint_best.json` when validation improved, and always `checkpoint_last.json`.
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    dir: PathBuf,
}

impl JsonCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_path(&self) -> PathBuf {
        self.dir.join(LAST)
    }

    pub fn best_path(&self) -> PathBuf {
        self.dir.join(BEST)
    }

    /// File name of the epoch or mid-epoch checkpoint for `state`
    pub fn checkpoint_name(state: &TrainingState) -> String {
        if state.end_of_epoch {
            format!("checkpoint{}.json", state.epoch)
        } else {
            format!("checkpoint_{}_{}.json", state.epoch + 1, state.num_updates)
        }
    }

    /// Read a checkpoint file
    pub fn read(path: impl AsRef<Path>) -> Result<TrainingState> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| KolosalError::CheckpointError(format!("{}: {}", path.display(), e)))
    }
}

/// Write through a temporary file so readers never see a partial checkpoint
fn write_atomic(path: &Path, text: &str) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl CheckpointStore for JsonCheckpointStore {
    fn save(&mut self, state: &TrainingState) -> Result<()> {
        let text = serde_json::to_string_pretty(state)?;

        let named = self.dir.join(Self::checkpoint_name(state));
        write_atomic(&named, &text)?;
        if state.is_best() {
            write_atomic(&self.best_path(), &text)?;
        }
        write_atomic(&self.last_path(), &text)?;

        info!(
            path = %named.display(),
            epoch = state.epoch,
            updates = state.num_updates,
            "Saved checkpoint"
        );
        Ok(())
    }

    fn load(&mut self) -> Result<Option<TrainingState>> {
        let path = self.last_path();
        if !path.exists() {
            return Ok(None);
        }
        let state = Self::read(&path)?;
        info!(
            path = %path.display(),
            epoch = state.epoch,
            updates = state.num_updates,
            "Loaded checkpoint"
        );
        Ok(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::{ArchitectureSampler, SearchSpace, TaskKind};

    fn sample_state() -> TrainingState {
        let sampler = ArchitectureSampler::new(SearchSpace::translation_default(), TaskKind::translation_wmt()).unwrap();
        TrainingState {
            epoch: 3,
            iterations_in_epoch: 0,
            end_of_epoch: true,
            num_updates: 120,
            lr: 5e-4,
            val_loss: Some(4.2),
            best_loss: Some(4.2),
            ranking: RankingState {
                previous_losses: vec![4.1, 4.3, 4.2],
                previous_correlation: 0.33,
                stability_counter: 2,
            },
            candidate_pool: Some(CandidatePool::seeded(&sampler, 3, 100, 1).unwrap()),
            stop_requested: false,
            trainer: serde_json::json!({"step": 120}),
        }
    }

    #[test]
    fn test_checkpoint_names() {
        let mut state = sample_state();
        assert_eq!(JsonCheckpointStore::checkpoint_name(&state), "checkpoint3.json");
        state.end_of_epoch = false;
        assert_eq!(JsonCheckpointStore::checkpoint_name(&state), "checkpoint_4_120.json");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonCheckpointStore::new(dir.path().join("ckpt")).unwrap();
        assert!(store.load().unwrap().is_none());

        let state = sample_state();
        store.save(&state).unwrap();

        assert!(store.dir().join("checkpoint3.json").exists());
        assert!(store.best_path().exists());
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[test]
    fn test_best_only_on_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonCheckpointStore::new(dir.path()).unwrap();

        let mut state = sample_state();
        state.val_loss = Some(5.0);
        store.save(&state).unwrap();
        assert!(!store.best_path().exists());
        assert!(store.last_path().exists());
    }

    #[test]
    fn test_corrupt_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonCheckpointStore::new(dir.path()).unwrap();
        std::fs::write(store.last_path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(KolosalError::CheckpointError(_))));
    }
}
