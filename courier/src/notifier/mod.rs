use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;
use strum::{Display, EnumString};

/// Represents different notification presentation failure possibilities.
#[derive(thiserror::Error, Debug)]
pub enum NotifierError {
    #[error("could not schedule notification; {0}")]
    ScheduleFailed(String),

    #[error("could not dismiss notification; {0}")]
    DismissFailed(String),
}

/// Which notification channel a message belongs to. Progress updates are
/// silent and replaceable; results make noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    Progress,
    Result,
}

impl Channel {
    /// Platform channel identifier, matching the channels the host app
    /// registers at startup.
    pub fn channel_id(&self) -> &'static str {
        match self {
            Channel::Progress => "watcher_progress",
            Channel::Result => "watcher_result",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    Low,
    High,
}

/// An action button attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyAction {
    /// Offer to install the cached payload at `path`.
    Install { path: PathBuf },
}

/// A fully-composed notification ready for the platform layer. The `id` is
/// stable per watched run so successive updates replace rather than stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub body: String,

    /// Compact single-line variant for collapsed presentation.
    pub small_text: Option<String>,

    pub channel: Channel,
    pub priority: Priority,

    /// Sticky notifications cannot be swiped away; used for in-flight
    /// progress so the tracker survives until a terminal state.
    pub sticky: bool,

    /// Whether tapping the notification dismisses it.
    pub auto_dismiss: bool,

    /// 0-100; implementors with a native progress-bar channel render it,
    /// others fall back to text only.
    pub progress_percent: Option<u8>,

    pub action: Option<NotifyAction>,
}

/// Local notification presentation, implemented by platform code.
#[async_trait]
pub trait Notifier: Debug + Send + Sync {
    async fn schedule(&self, notification: Notification) -> Result<(), NotifierError>;

    async fn dismiss(&self, id: &str) -> Result<(), NotifierError>;
}

/// Compact progress line shown while a run is in flight:
/// `<branch> • <percent>% • ~<minsLeft>m left`.
pub fn progress_line(branch: &str, percent: u8, mins_left: u64) -> String {
    format!("{branch} • {percent}% • ~{mins_left}m left")
}

/// Expanded progress body carrying repo and commit context under the
/// compact line.
pub fn progress_body(
    branch: &str,
    percent: u8,
    mins_left: u64,
    owner: &str,
    repo: &str,
    commit_message: &str,
) -> String {
    let commit = if commit_message.is_empty() {
        "No commit message"
    } else {
        commit_message
    };

    format!(
        "{}\nRepo: {owner}/{repo}\nCommit: {commit}",
        progress_line(branch, percent, mins_left)
    )
}

/// Notification title for a watched run.
pub fn run_title(workflow_name: &str) -> String {
    format!("Build: {workflow_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn progress_line_format() {
        assert_eq!(progress_line("main", 50, 5), "main • 50% • ~5m left");
    }

    #[test]
    fn progress_body_includes_repo_and_commit() {
        let body = progress_body("feature/x", 12, 9, "octo", "app", "fix: crash on boot");
        assert_eq!(
            body,
            "feature/x • 12% • ~9m left\nRepo: octo/app\nCommit: fix: crash on boot"
        );
    }

    #[test]
    fn progress_body_defaults_empty_commit_message() {
        let body = progress_body("main", 0, 5, "octo", "app", "");
        assert!(body.ends_with("Commit: No commit message"));
    }
}
