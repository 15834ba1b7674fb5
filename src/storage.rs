/// Durable state for the list sync service
///
/// Holds the stream cursor and the known list members in a single
/// pretty-printed JSON document. Every save replaces the whole document
/// atomically, so the cursor and the member set are always observed together.

use crate::error::{Result, SyncError};
use crate::membership::MembershipStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Jetstream cursor: `time_us` of the last fully processed message
pub type Cursor = i64;

/// On-disk state document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub cursor: Option<Cursor>,

    /// `None` until the first reconciliation, which distinguishes a cold
    /// start from a list that is genuinely empty.
    #[serde(default)]
    pub list_members: Option<Vec<String>>,

    /// Fields written by other tools are carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// File-backed store for `PersistedState`
pub struct StateStore {
    path: PathBuf,
    /// Fields seen at load time, written back on every save
    extra: Map<String, Value>,
}

impl StateStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            extra: Map::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state, or a fresh one if nothing was saved yet
    pub fn load(&mut self) -> Result<PersistedState> {
        if !self.path.exists() {
            log::debug!("No state file at {}, starting fresh", self.path.display());
            return Ok(PersistedState::default());
        }

        let text = fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(PersistedState::default());
        }

        let state: PersistedState = serde_json::from_str(&text).map_err(|e| {
            SyncError::Storage(format!(
                "Corrupt state file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        self.extra = state.extra.clone();

        Ok(state)
    }

    /// Atomically persist the cursor together with the member set
    pub fn save(&self, cursor: Option<Cursor>, members: &MembershipStore) -> Result<()> {
        let state = PersistedState {
            cursor,
            list_members: Some(members.to_vec()),
            extra: self.extra.clone(),
        };

        let json = serde_json::to_vec_pretty(&state)?;
        write_atomic(&self.path, &json).map_err(|e| {
            SyncError::Storage(format!(
                "Failed to write state to {}: {}",
                self.path.display(),
                e
            ))
        })?;

        log::debug!(
            "Saved state: cursor={:?}, members={}",
            cursor,
            members.len()
        );
        Ok(())
    }
}

/// Replace `path` with `bytes` via temp file + fsync + rename, then fsync
/// the directory so the rename itself survives a power loss.
/// Creates the parent directory when missing.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    sync_dir(parent)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
