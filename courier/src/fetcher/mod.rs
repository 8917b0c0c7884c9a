use crate::artifact_store::{sanitize_file_name, ArtifactStore, StoreError};
use crate::installer::{Installer, InstallerError, RELEASE_ARTIFACT_NAME};
use crate::provider::{Artifact, CiProvider, ProviderError};
use futures::StreamExt;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::Display;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// How deep inside an unpacked archive the payload scan descends. Known
/// archive shapes put the package at the root or one folder down; the limit
/// only guards against pathological archives.
const PAYLOAD_SCAN_MAX_DEPTH: usize = 5;

/// Represents different artifact fetch failure possibilities.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// Download failed. Retryable by the caller on its next natural poll
    /// tick; never retried internally.
    #[error("could not download artifact; {0}")]
    Network(String),

    /// The archive would not unpack or contained no installable payload.
    /// Permanent for this artifact.
    #[error("artifact archive corrupt; {0}")]
    ArtifactCorrupt(String),

    /// A native install was required and no sink could take it.
    #[error("no install sink available; {0}")]
    InstallerUnavailable(String),

    /// Local disk failure while staging or registering the payload.
    #[error("could not persist artifact; {0}")]
    Storage(String),
}

impl From<ProviderError> for FetchError {
    fn from(e: ProviderError) -> Self {
        FetchError::Network(e.to_string())
    }
}

impl From<StoreError> for FetchError {
    fn from(e: StoreError) -> Self {
        FetchError::Storage(e.to_string())
    }
}

/// Coarse human-readable phases emitted while a fetch runs. On the full
/// install path the sequence is always `Resolving URL... -> Downloading... ->
/// Unzipping... -> Installing...`; [`ArtifactFetcher::fetch`] emits the first
/// three and [`ArtifactFetcher::deliver`] the last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FetchPhase {
    #[strum(serialize = "Resolving URL...")]
    ResolvingUrl,

    #[strum(serialize = "Downloading...")]
    Downloading,

    #[strum(serialize = "Unzipping...")]
    Unzipping,

    #[strum(serialize = "Installing...")]
    Installing,
}

/// Incremental download progress: bytes written so far, the expected total
/// when the transport reported one, and whether the archive is fully on
/// disk. Exactly one report per download carries `complete = true` and it is
/// always the last; feed all three straight into [`progress_fraction`].
pub type ProgressFn = Box<dyn Fn(u64, Option<u64>, bool) + Send + Sync>;

pub type PhaseFn = Box<dyn Fn(FetchPhase) + Send + Sync>;

/// How a fetched payload ultimately reached the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The platform package installer was launched.
    Installed(PathBuf),

    /// Exported through the generic share sheet.
    Shared(PathBuf),

    /// No sink available; the path itself is the deliverable.
    PathOnly(PathBuf),
}

pub struct FetchRequest {
    pub artifact: Artifact,

    /// Credential for the resolve step; never forwarded to redirect targets.
    pub token: String,

    /// Branch the run built; only used to label scratch files.
    pub branch: String,

    /// Suppress the install/share side effect entirely and return just the
    /// cached path. The background watcher always sets this; it must not
    /// attempt a foreground install action itself.
    pub download_only: bool,

    pub on_progress: Option<ProgressFn>,
    pub on_phase: Option<PhaseFn>,
}

impl Debug for FetchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRequest")
            .field("artifact", &self.artifact)
            .field("branch", &self.branch)
            .field("download_only", &self.download_only)
            .finish_non_exhaustive()
    }
}

/// UI-facing progress fraction for a download. While in flight the fraction
/// is clamped to 0.99 so a spurious 100% is never shown before the archive is
/// fully on disk; exactly 1.0 is reported only once `complete` is set.
pub fn progress_fraction(written: u64, expected: Option<u64>, complete: bool) -> f64 {
    if complete {
        return 1.0;
    }

    match expected {
        Some(expected) if expected > 0 => (written as f64 / expected as f64).min(0.99),
        _ => 0.0,
    }
}

/// Resolves the redirect-chained artifact download URL, streams the archive
/// to scratch space, unpacks it, locates the installable payload, and hands
/// it to the artifact cache. A failure at any stage leaves no store entry and
/// no scratch files behind.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    provider: Arc<dyn CiProvider>,
    store: Arc<ArtifactStore>,
    installer: Option<Arc<dyn Installer>>,
    payload_extension: String,
}

impl ArtifactFetcher {
    pub fn new(
        provider: Arc<dyn CiProvider>,
        store: Arc<ArtifactStore>,
        installer: Option<Arc<dyn Installer>>,
        payload_extension: &str,
    ) -> Self {
        ArtifactFetcher {
            provider,
            store,
            installer,
            payload_extension: payload_extension.trim_start_matches('.').to_string(),
        }
    }

    /// Download, unpack, and cache an artifact; returns the installable
    /// payload's cached path. With `download_only` unset, proceeds to
    /// [`Self::deliver`] afterwards.
    pub async fn fetch(&self, req: FetchRequest) -> Result<PathBuf, FetchError> {
        let scratch = self.store.new_scratch_dir()?;

        let result = self.fetch_into(&scratch, &req).await;

        // The payload was renamed out of scratch on success; everything still
        // in there is disposable either way.
        self.store.discard_scratch_dir(&scratch);

        let cached = result?;

        if !req.download_only {
            self.deliver(&cached, &req.artifact.name, req.on_phase.as_ref())
                .await?;
        }

        Ok(cached)
    }

    async fn fetch_into(
        &self,
        scratch: &Path,
        req: &FetchRequest,
    ) -> Result<PathBuf, FetchError> {
        emit_phase(req.on_phase.as_ref(), FetchPhase::ResolvingUrl);
        let resolved = self
            .provider
            .resolve_download_url(&req.artifact.archive_download_url, &req.token)
            .await?;

        emit_phase(req.on_phase.as_ref(), FetchPhase::Downloading);
        let archive_name = format!(
            "{}-{}.zip",
            sanitize_file_name(&req.artifact.name),
            sanitize_file_name(&req.branch),
        );
        let archive_path = scratch.join(archive_name);
        let written = self
            .download_to(&archive_path, &resolved, &req.token, req.on_progress.as_ref())
            .await?;

        // Fully on disk; only now may 100% be reported.
        if let Some(on_progress) = req.on_progress.as_ref() {
            on_progress(written, Some(written), true);
        }

        debug!(
            artifact_id = req.artifact.id,
            bytes = written,
            "Artifact archive downloaded"
        );

        emit_phase(req.on_phase.as_ref(), FetchPhase::Unzipping);
        let unpack_dir = scratch.join("unpacked");
        let payload = self.unpack_and_locate(&archive_path, &unpack_dir).await?;

        let cached = self.store.put(req.artifact.id, &payload)?;

        info!(
            artifact_id = req.artifact.id,
            path = %cached.display(),
            "Artifact payload cached"
        );

        Ok(cached)
    }

    async fn download_to(
        &self,
        target: &Path,
        resolved: &crate::provider::ResolvedDownload,
        token: &str,
        on_progress: Option<&ProgressFn>,
    ) -> Result<u64, FetchError> {
        let byte_stream = self.provider.download(resolved, token).await?;
        let expected = byte_stream.content_length;
        let mut stream = byte_stream.stream;

        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| FetchError::Storage(e.to_string()))?;

        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::Storage(e.to_string()))?;

            written += chunk.len() as u64;
            if let Some(on_progress) = on_progress {
                on_progress(written, expected, false);
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::Storage(e.to_string()))?;

        Ok(written)
    }

    /// Unpack the archive into `unpack_dir` and locate the installable
    /// payload inside. Both unzip failures and a missing payload mean the
    /// artifact itself is bad.
    async fn unpack_and_locate(
        &self,
        archive_path: &Path,
        unpack_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        let archive_path = archive_path.to_path_buf();
        let unpack_dir = unpack_dir.to_path_buf();
        let extension = self.payload_extension.clone();

        tokio::task::spawn_blocking(move || {
            unzip_archive(&archive_path, &unpack_dir)
                .map_err(FetchError::ArtifactCorrupt)?;

            find_payload(&unpack_dir, &extension, 0).ok_or_else(|| {
                FetchError::ArtifactCorrupt(format!(
                    "no .{extension} payload found in unpacked archive"
                ))
            })
        })
        .await
        .map_err(|e| FetchError::Storage(format!("unpack task panicked; {e}")))?
    }

    /// Install or share a cached payload. Emits the `Installing...` phase.
    /// Direct install is only attempted for the designated release artifact;
    /// everything else goes through the generic share sink, and with no sink
    /// at all the path itself is handed back to the caller to surface.
    pub async fn deliver(
        &self,
        path: &Path,
        artifact_name: &str,
        on_phase: Option<&PhaseFn>,
    ) -> Result<Delivery, FetchError> {
        emit_phase(on_phase, FetchPhase::Installing);

        let Some(installer) = &self.installer else {
            return Ok(Delivery::PathOnly(path.to_path_buf()));
        };

        if artifact_name == RELEASE_ARTIFACT_NAME {
            match installer.install(path).await {
                Ok(true) => return Ok(Delivery::Installed(path.to_path_buf())),
                Ok(false) => {
                    debug!(path = %path.display(), "Installer declined; falling back to share");
                }
                Err(InstallerError::Unavailable(reason)) => {
                    debug!(reason, "No direct install sink; falling back to share");
                }
                Err(InstallerError::Failed(reason)) => {
                    warn!(reason, "Install invocation failed; falling back to share");
                    if !installer.share_available() {
                        return Err(FetchError::InstallerUnavailable(reason));
                    }
                }
            }
        }

        if installer.share_available() {
            match installer.share(path).await {
                Ok(_) => return Ok(Delivery::Shared(path.to_path_buf())),
                Err(e) => warn!(error = %e, "Share sink failed; surfacing path"),
            }
        }

        Ok(Delivery::PathOnly(path.to_path_buf()))
    }
}

fn emit_phase(on_phase: Option<&PhaseFn>, phase: FetchPhase) {
    if let Some(on_phase) = on_phase {
        on_phase(phase);
    }
}

/// Extract every entry of a zip archive under `dest_dir`. Entry names are
/// mangled so hostile archives cannot escape the destination.
fn unzip_archive(archive_path: &Path, dest_dir: &Path) -> Result<(), String> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| format!("could not open archive; {e}"))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| format!("could not read archive; {e}"))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| format!("could not read archive entry; {e}"))?;

        let outpath = dest_dir.join(entry.mangled_name());

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .map_err(|e| format!("could not create directory; {e}"))?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("could not create directory; {e}"))?;
            }
            let mut outfile = std::fs::File::create(&outpath)
                .map_err(|e| format!("could not create file; {e}"))?;
            std::io::copy(&mut entry, &mut outfile)
                .map_err(|e| format!("could not extract file; {e}"))?;
        }
    }

    Ok(())
}

/// Find the first file with the payload extension, scanning the current
/// directory's files before descending into subdirectories.
fn find_payload(dir: &Path, extension: &str, depth: usize) -> Option<PathBuf> {
    if depth > PAYLOAD_SCAN_MAX_DEPTH {
        return None;
    }

    let entries: Vec<_> = std::fs::read_dir(dir).ok()?.flatten().collect();

    for entry in &entries {
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case(extension))
        {
            return Some(path);
        }
    }

    for entry in &entries {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_payload(&path, extension, depth + 1) {
                return Some(found);
            }
        }
    }

    None
}
