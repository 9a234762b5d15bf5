// =============================================================================
// File cache — positions.json and universe_cache.json
// =============================================================================
//
// The file cache is the middle leg of the three-way state (broker, file,
// store). It exists so that a restart can show intent before the database is
// reachable, and so the reconciler has a second local witness. All writes use
// the atomic tmp + rename pattern.
//
// positions.json is namespaced by mode: { "PAPER": [ ... ], "REAL": [ ... ] }.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, warn};

use crate::position::Position;
use crate::types::Mode;

/// `data/universe_cache.json` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseCacheFile {
    pub trade_date: String,
    pub selection_method: String,
    pub stocks: Vec<String>,
}

/// Paths and IO for the on-disk cache files.
#[derive(Debug, Clone)]
pub struct FileCache {
    positions_path: PathBuf,
    universe_path: PathBuf,
}

impl FileCache {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self {
            positions_path: dir.join("positions.json"),
            universe_path: dir.join("universe_cache.json"),
        }
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    /// Open positions for `mode`. A missing or unreadable file is an empty
    /// list — the reconciler treats the broker as truth anyway.
    pub fn load_positions(&self, mode: Mode) -> Vec<Position> {
        let all: HashMap<String, Vec<Position>> = match read_json(&self.positions_path) {
            Ok(Some(map)) => map,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(
                    path = %self.positions_path.display(),
                    error = %e,
                    "unreadable positions cache, treating as empty"
                );
                return Vec::new();
            }
        };
        all.get(mode.as_str()).cloned().unwrap_or_default()
    }

    /// Replace the position list for `mode`, leaving other modes untouched.
    pub fn save_positions(&self, mode: Mode, positions: &[Position]) -> Result<()> {
        let mut all: HashMap<String, Vec<Position>> =
            read_json(&self.positions_path).unwrap_or(None).unwrap_or_default();
        all.insert(mode.as_str().to_string(), positions.to_vec());
        write_json(&self.positions_path, &all)?;
        info!(
            mode = %mode,
            count = positions.len(),
            path = %self.positions_path.display(),
            "positions cache saved"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Universe
    // -------------------------------------------------------------------------

    pub fn load_universe(&self) -> Option<UniverseCacheFile> {
        match read_json(&self.universe_path) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    path = %self.universe_path.display(),
                    error = %e,
                    "unreadable universe cache, ignoring"
                );
                None
            }
        }
    }

    pub fn save_universe(&self, cache: &UniverseCacheFile) -> Result<()> {
        write_json(&self.universe_path, cache)?;
        info!(
            trade_date = %cache.trade_date,
            count = cache.stocks.len(),
            "universe cache saved"
        );
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value =
        serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(value).context("failed to serialise json")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename tmp to {}", path.display()))?;
    Ok(())
}
