use crate::provider::{RunConclusion, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

/// File name of the persisted watch registry inside the data directory.
pub const REGISTRY_FILE_NAME: &str = "watched_runs.json";

/// Represents different registry persistence failure possibilities.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("could not access watch registry; {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode watch registry; {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One run under observation. Wire format and in-memory format are identical:
/// the registry file is a JSON map keyed by run id holding these records
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedRun {
    pub run_id: u64,
    pub workflow_name: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,

    /// Credential used for polling; scoped to this watch.
    pub token: String,

    /// First line of the head commit message, for notification bodies.
    #[serde(default)]
    pub commit_message: String,

    /// Wall-clock epoch ms of run creation.
    pub start_time: u64,

    /// Computed once at watch-start, immutable thereafter.
    pub estimated_duration_ms: u64,

    pub last_status: RunStatus,
    pub last_conclusion: Option<RunConclusion>,

    /// Epoch ms of the last successful poll.
    pub last_checked_at: u64,

    /// Set at most once, only after fetch+verify completes; while
    /// `last_status != completed` this must be unset.
    #[serde(default)]
    pub cached_artifact_path: Option<PathBuf>,

    /// The artifact for this run proved permanently unfetchable (corrupt
    /// archive, no payload). Terminal; excluded from further polling.
    #[serde(default)]
    pub artifact_failed: bool,
}

impl WatchedRun {
    /// Whether this entry has reached a state the poll loop never leaves:
    /// artifact ready or artifact permanently failed.
    pub fn is_settled(&self) -> bool {
        self.cached_artifact_path.is_some() || self.artifact_failed
    }
}

/// Durable registry of watched runs. All access is read-modify-write against
/// the file on disk; the file is replaced atomically (write to temp, rename)
/// so a process kill mid-write never corrupts it.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: &Path) -> Self {
        Registry {
            path: path.to_path_buf(),
        }
    }

    /// Load the registry from disk. A missing file is an empty registry, not
    /// an error.
    pub async fn load(&self) -> Result<HashMap<u64, WatchedRun>, RegistryError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        let entries: HashMap<u64, WatchedRun> = serde_json::from_slice(&raw)?;
        Ok(entries)
    }

    /// Persist the registry atomically: serialize to a temp file beside the
    /// target, then rename over it.
    pub async fn save(&self, entries: &HashMap<u64, WatchedRun>) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let raw = serde_json::to_vec_pretty(entries)?;

        let temp_path = self
            .path
            .with_extension(format!("json.{}.tmp", Uuid::now_v7()));
        tokio::fs::write(&temp_path, &raw).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(entries = entries.len(), path = %self.path.display(), "Persisted watch registry");

        Ok(())
    }
}
