use async_trait::async_trait;
use std::fmt::Debug;
use std::path::Path;

/// Artifact name whose payload may be installed directly rather than shared.
pub const RELEASE_ARTIFACT_NAME: &str = "app-release";

/// Represents different install sink failure possibilities.
#[derive(thiserror::Error, Debug)]
pub enum InstallerError {
    /// No native install/share sink exists on this platform. Permanent;
    /// callers fall back to surfacing the file path.
    #[error("no install sink available; {0}")]
    Unavailable(String),

    /// The sink exists but the invocation failed, e.g. the OS package
    /// installer rejected the intent or the user denied a permission.
    #[error("install invocation failed; {0}")]
    Failed(String),
}

/// Native package-install and share capability, implemented by platform code.
/// Courier only ever hands it fully-prepared payload paths from the artifact
/// cache.
#[async_trait]
pub trait Installer: Debug + Send + Sync {
    /// Launch the platform package installer for the payload at `path`.
    /// Returns whether the installer UI was actually presented.
    async fn install(&self, path: &Path) -> Result<bool, InstallerError>;

    /// Generic share/export action for platforms or payloads where a direct
    /// install is not possible.
    async fn share(&self, path: &Path) -> Result<bool, InstallerError>;

    /// Whether a share/export sink exists at all.
    fn share_available(&self) -> bool;
}
