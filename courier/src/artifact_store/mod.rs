use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Default bound on how many unpacked artifacts are kept on disk.
pub const DEFAULT_MAX_ENTRIES: usize = 5;

/// Represents different artifact cache failure possibilities.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Failed to start due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init artifact cache; {0}")]
    FailedPrecondition(String),

    #[error("could not access artifact cache; {0}")]
    Io(#[from] std::io::Error),
}

/// Content-addressed on-device cache of unpacked build artifacts, bounded by
/// entry count with oldest-by-modification-time eviction.
///
/// Every registered entry points at an existing, fully-unpacked payload;
/// in-flight downloads live in a scratch area on the same filesystem so the
/// final registration is a single rename. Partially-prepared artifacts are
/// never visible under management.
#[derive(Debug)]
pub struct ArtifactStore {
    artifacts_dir: PathBuf,
    scratch_dir: PathBuf,
    max_entries: usize,
}

impl ArtifactStore {
    pub fn new(root: &Path, max_entries: usize) -> Result<Self, StoreError> {
        if max_entries == 0 {
            return Err(StoreError::FailedPrecondition(
                "artifact cache must allow at least one entry".into(),
            ));
        }

        let artifacts_dir = root.join("artifacts");
        let scratch_dir = root.join("scratch");
        fs::create_dir_all(&artifacts_dir)?;
        fs::create_dir_all(&scratch_dir)?;

        Ok(ArtifactStore {
            artifacts_dir,
            scratch_dir,
            max_entries,
        })
    }

    /// Look up a previously cached artifact by id. Stat-only; never mutates.
    pub fn is_cached(&self, artifact_id: u64) -> Option<PathBuf> {
        let prefix = format!("{artifact_id}-");

        let entries = fs::read_dir(&self.artifacts_dir).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                return Some(entry.path());
            }
        }

        None
    }

    /// Register a fully-prepared payload file under management. The source
    /// must live on the same filesystem (use [`Self::new_scratch_dir`]) so
    /// the move is an atomic rename. Evicts down to `max_entries - 1` first
    /// so the insertion never leaves the store over its bound.
    pub fn put(&self, artifact_id: u64, source: &Path) -> Result<PathBuf, StoreError> {
        // Re-registering an id replaces the old entry rather than duplicating it.
        if let Some(existing) = self.is_cached(artifact_id) {
            fs::remove_file(&existing)?;
        }

        self.evict_if_needed(self.max_entries)?;

        let file_name = source
            .file_name()
            .map(|n| sanitize_file_name(&n.to_string_lossy()))
            .unwrap_or_else(|| "payload".to_string());
        let target = self.artifacts_dir.join(format!("{artifact_id}-{file_name}"));

        fs::rename(source, &target)?;

        debug!(artifact_id, path = %target.display(), "Cached artifact payload");

        Ok(target)
    }

    /// Delete oldest-by-modification-time entries until the store holds at
    /// most `max_entries - 1`, making room for one insertion.
    ///
    /// Evicting an entry the user is mid-install on is an accepted race;
    /// installs read the file once and the window is small.
    pub fn evict_if_needed(&self, max_entries: usize) -> Result<(), StoreError> {
        let mut entries: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();

        for entry in fs::read_dir(&self.artifacts_dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_file() {
                let modified = metadata.modified()?;
                entries.push((entry.path(), modified));
            }
        }

        entries.sort_by_key(|(_, modified)| *modified);

        let keep = max_entries.saturating_sub(1);
        while entries.len() > keep {
            let (path, _) = entries.remove(0);
            fs::remove_file(&path)?;
            info!(path = %path.display(), "Evicted cached artifact");
        }

        Ok(())
    }

    /// Create a unique scratch directory for an in-flight download/unpack.
    /// Lives beside the managed entries so the final handoff is a rename.
    pub fn new_scratch_dir(&self) -> Result<PathBuf, StoreError> {
        let dir = self.scratch_dir.join(Uuid::now_v7().to_string());
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Best-effort removal of a scratch directory; failures are ignored since
    /// scratch space is reclaimed wholesale on the next store init anyway.
    pub fn discard_scratch_dir(&self, dir: &Path) {
        if dir.starts_with(&self.scratch_dir) {
            let _ = fs::remove_dir_all(dir);
        }
    }
}

/// Keep payload file names predictable and shell-safe; mirrors how branch and
/// artifact names are sanitized before they hit the filesystem.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
