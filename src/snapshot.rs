//! Snapshot persistence: state, cycle counters, RNG state and the ledger
//! tail hash, serialised as one JSON document per snapshot.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::rng::RngState;
use crate::state::EngineState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineCounters {
    pub cycles: u64,
    pub promotions: u64,
    pub rollbacks: u64,
    pub aborts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotData {
    pub id: String,
    pub tag: Option<String>,
    pub ts: String,
    pub state: EngineState,
    pub counters: EngineCounters,
    pub rng_state: RngState,
    pub tail_hash: String,
    pub config_hash: String,
}

fn snapshot_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("snapshot_{id}.json"))
}

/// Derive a stable snapshot id from the state hash and the ledger tail.
pub fn snapshot_id(state: &EngineState, tail_hash: &str) -> String {
    let mut h = Sha256::new();
    h.update(state.compute_hash().as_bytes());
    h.update(tail_hash.as_bytes());
    hex::encode(h.finalize())[..12].to_string()
}

pub fn save(dir: &Path, snap: &SnapshotData) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating snapshot dir {}", dir.display()))?;
    let path = snapshot_path(dir, &snap.id);
    let raw = serde_json::to_string_pretty(snap)?;
    std::fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub fn load(dir: &Path, id: &str) -> Result<SnapshotData> {
    let path = snapshot_path(dir, id);
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let snap: SnapshotData = serde_json::from_str(&raw)?;
    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::DeterministicRng;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = EngineState::new();
        state.rsi = 0.77;
        state.cycle = 9;
        let rng = DeterministicRng::new(42);
        let snap = SnapshotData {
            id: snapshot_id(&state, "tail"),
            tag: Some("test".to_string()),
            ts: "2025-01-01T00:00:00Z".to_string(),
            state: state.clone(),
            counters: EngineCounters {
                cycles: 9,
                promotions: 7,
                rollbacks: 1,
                aborts: 1,
            },
            rng_state: rng.state(),
            tail_hash: "tail".to_string(),
            config_hash: "cfg0".to_string(),
        };
        save(dir.path(), &snap).unwrap();

        let loaded = load(dir.path(), &snap.id).unwrap();
        assert_eq!(loaded.state.compute_hash(), state.compute_hash());
        assert_eq!(loaded.rng_state, rng.state());
        assert_eq!(loaded.counters.promotions, 7);
        assert_eq!(loaded.tail_hash, "tail");
    }

    #[test]
    fn test_snapshot_id_is_deterministic() {
        let state = EngineState::new();
        assert_eq!(snapshot_id(&state, "t"), snapshot_id(&state, "t"));
        assert_ne!(snapshot_id(&state, "t"), snapshot_id(&state, "u"));
        assert_eq!(snapshot_id(&state, "t").len(), 12);
    }

    #[test]
    fn test_load_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path(), "nope").is_err());
    }
}
