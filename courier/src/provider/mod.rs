pub mod github;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;
use strum::{Display, EnumString};

/// Represents different CI provider failure possibilities.
#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    /// Failed to init due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init ci provider; {0}")]
    FailedPrecondition(String),

    /// Failed to communicate with the provider due to a network error or other transient fault.
    /// Safe to retry on the next scheduled poll.
    #[error("could not connect to ci provider; {0}")]
    Network(String),

    /// The provider answered, but not with what we asked for.
    #[error("unexpected ci provider response; status: {status}; body: {body}")]
    UnexpectedResponse { status: u16, body: String },

    /// The provider's response body did not match the documented shape.
    #[error("could not parse ci provider response; {0}")]
    Malformed(String),
}

/// Lifecycle status of a workflow run as reported by the provider.
#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum RunStatus {
    Queued,

    InProgress,

    /// The run has finished; consult [`RunConclusion`] for how it ended.
    Completed,

    /// Statuses this crate does not know about (providers add new ones, e.g.
    /// `waiting`). Treated as non-terminal.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Terminal result of a completed workflow run.
#[derive(
    Debug, Clone, Display, Default, PartialEq, EnumString, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum RunConclusion {
    Success,

    Failure,

    Cancelled,

    Skipped,

    TimedOut,

    ActionRequired,

    /// Conclusions this crate does not know about. Treated as non-success.
    #[default]
    #[serde(other)]
    Unknown,
}

/// First line of the commit a run was started for; only the pieces the
/// notification body needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadCommit {
    #[serde(default)]
    pub message: String,
}

/// One execution instance of a CI workflow. Validated at the network
/// boundary; unknown statuses collapse into catch-all variants rather than
/// failing the whole poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Opaque provider-assigned run identifier.
    pub id: u64,

    /// Workflow name; historical runs of the same name feed the duration estimate.
    pub name: String,

    pub head_branch: String,

    pub head_sha: String,

    pub status: RunStatus,

    /// Only present once `status` is `Completed`.
    pub conclusion: Option<RunConclusion>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub html_url: String,

    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
}

impl Run {
    /// Epoch milliseconds of run creation. Provider timestamps predate the
    /// epoch never in practice; clamp to zero rather than panic if they do.
    pub fn created_at_milli(&self) -> u64 {
        u64::try_from(self.created_at.timestamp_millis()).unwrap_or(0)
    }
}

/// A named binary bundle produced by a run, fetched as a zip archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: u64,

    pub name: String,

    pub size_in_bytes: u64,

    #[serde(default)]
    pub url: String,

    /// Endpoint that answers with a redirect to the actual blob; see
    /// [`CiProvider::resolve_download_url`].
    pub archive_download_url: String,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub expired: bool,
}

/// Where an artifact blob actually lives once redirects are peeled off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDownload {
    pub url: String,

    /// Whether the bearer token should accompany the download request.
    /// False whenever the blob lives on a third-party host the redirect
    /// pointed us at; forwarding auth there corrupts the download.
    pub forward_auth: bool,
}

/// A streaming artifact download. `content_length` is whatever the transport
/// reported and may be absent.
pub struct ByteStream {
    pub content_length: Option<u64>,
    pub stream: Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>,
}

impl Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// The interface between courier and a CI provider's REST surface.
/// All calls authenticate via bearer token header.
#[async_trait]
pub trait CiProvider: Debug + Send + Sync {
    /// List the most recent runs for a repository, newest first, optionally
    /// filtered by branch.
    async fn list_runs(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        branch: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Run>, ProviderError>;

    /// Fetch the current state of a single run.
    async fn get_run(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Run, ProviderError>;

    /// List artifacts produced by a run.
    async fn list_artifacts(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<Artifact>, ProviderError>;

    /// Resolve an `archive_download_url` to the concrete blob location by
    /// issuing a manual, non-following request and capturing the `Location`
    /// header. Redirects are never followed automatically here: the auth
    /// header must not leak to third-party redirect targets, and resumable
    /// downloads need a concrete final URL.
    async fn resolve_download_url(
        &self,
        url: &str,
        token: &str,
    ) -> Result<ResolvedDownload, ProviderError>;

    /// Open a streaming download of a resolved blob URL.
    async fn download(
        &self,
        resolved: &ResolvedDownload,
        token: &str,
    ) -> Result<ByteStream, ProviderError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")] // This handles case insensitivity during deserialization
pub enum Engine {
    #[default]
    Github,
}

pub fn init_provider(
    config: &crate::conf::Provider,
) -> Result<Arc<dyn CiProvider>, ProviderError> {
    #[allow(clippy::match_single_binding)]
    match config.engine {
        Engine::Github => {
            let Some(github_config) = &config.github else {
                return Err(ProviderError::FailedPrecondition(
                    "Github engine settings not found in config".into(),
                ));
            };

            let engine = github::Github::new(&github_config.api_base_url)?;
            Ok(Arc::new(engine))
        }
    }
}
