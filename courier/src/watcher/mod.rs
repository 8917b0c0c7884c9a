use crate::{
    artifact_store::ArtifactStore,
    epoch_milli, estimator,
    fetcher::{ArtifactFetcher, FetchError, FetchRequest},
    notifier::{self, Channel, Notification, Notifier, NotifyAction, Priority},
    provider::{self, Artifact, CiProvider, Run, RunStatus},
    registry::{Registry, RegistryError, WatchedRun, REGISTRY_FILE_NAME},
};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Artifact name fragments that identify an installable app bundle, in
/// preference order. Checked before falling back to plain recency.
pub const ARTIFACT_PRIORITIES: [&str; 5] =
    ["app-release", "app-debug", "release", "debug", "build"];

/// What a background-scheduler invocation should report back to the OS.
/// Failures are caught and converted; this entry point never propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundTaskResult {
    /// At least one watched run was checked.
    NewData,

    /// Nothing to do, or another poll was already in flight.
    NoData,

    /// The tick could not run at all (e.g. the registry was unreadable).
    Failed,
}

/// Outcome of one `poll_all` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed { checked: usize, failures: usize },

    /// Another invocation held the guard; this one did nothing.
    AlreadyRunning,
}

/// Clears the in-progress flag however the poll exits.
struct PollGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Persistent registry of CI runs under observation plus the polling loop
/// that advances them toward an installable artifact.
///
/// Cheap to clone; all state is shared. The two trigger sources (foreground
/// ticker, OS background scheduler) call the same [`Self::poll_all`], which
/// is guarded so overlapping invocations collapse into one — a duplicate
/// concurrent poll would double-fetch artifacts and duplicate notifications.
#[derive(Debug, Clone)]
pub struct RunWatcher {
    provider: Arc<dyn CiProvider>,
    notifier: Arc<dyn Notifier>,
    fetcher: Arc<ArtifactFetcher>,
    registry: Arc<Registry>,

    /// In-memory view of the registry. The lock also serializes every
    /// load/save of the registry file; a disk write outside it could rename
    /// a stale snapshot over a newer one.
    watched: Arc<Mutex<HashMap<u64, WatchedRun>>>,
    polling: Arc<AtomicBool>,
    history_sample_size: u32,
}

impl RunWatcher {
    pub fn new(
        provider: Arc<dyn CiProvider>,
        notifier: Arc<dyn Notifier>,
        fetcher: Arc<ArtifactFetcher>,
        registry: Arc<Registry>,
        history_sample_size: u32,
    ) -> Self {
        RunWatcher {
            provider,
            notifier,
            fetcher,
            registry,
            watched: Arc::new(Mutex::new(HashMap::new())),
            polling: Arc::new(AtomicBool::new(false)),
            history_sample_size,
        }
    }

    /// Assemble a watcher and its owned services from configuration. The
    /// notifier and optional installer come from platform code.
    pub fn from_config(
        config: &crate::conf::Config,
        notifier: Arc<dyn Notifier>,
        installer: Option<Arc<dyn crate::installer::Installer>>,
    ) -> Result<Self> {
        let provider = provider::init_provider(&config.provider)?;

        let data_root = match &config.store.path {
            Some(path) => PathBuf::from(path),
            None => dirs::cache_dir()
                .ok_or_else(|| anyhow!("could not determine a cache directory for this user"))?
                .join("courier"),
        };

        let store = Arc::new(ArtifactStore::new(&data_root, config.store.max_entries)?);
        let fetcher = Arc::new(ArtifactFetcher::new(
            provider.clone(),
            store,
            installer,
            &config.fetcher.payload_extension,
        ));
        let registry = Arc::new(Registry::new(&data_root.join(REGISTRY_FILE_NAME)));

        Ok(RunWatcher::new(
            provider,
            notifier,
            fetcher,
            registry,
            config.watcher.history_sample_size,
        ))
    }

    /// Reload the registry from disk into memory. Call once at startup so
    /// `is_watching` answers correctly before the first poll; every entry
    /// found here resumes polling on the next tick.
    pub async fn init(&self) -> Result<usize, RegistryError> {
        let entries = self.registry.load().await?;
        let count = entries.len();

        if count > 0 {
            info!(watched = count, "Resuming watches from persisted registry");
        }

        *self.watched.lock().await = entries;
        Ok(count)
    }

    /// Start observing a run. Computes the duration estimate from recent
    /// history of the same workflow, persists the entry (overwriting any
    /// previous watch of the same run), emits the first progress
    /// notification, and triggers an out-of-band poll.
    pub async fn watch(&self, run: &Run, token: &str, owner: &str, repo: &str) -> Result<()> {
        let history = match self
            .provider
            .list_runs(token, owner, repo, None, self.history_sample_size)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                // The estimator falls back to its default; a failed history
                // fetch must not block the watch itself.
                warn!(error = %e, run_id = run.id, "Could not fetch run history for estimation");
                Vec::new()
            }
        };

        let estimated_duration_ms = estimator::estimate(&history, &run.name);

        let entry = WatchedRun {
            run_id: run.id,
            workflow_name: run.name.clone(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: run.head_branch.clone(),
            token: token.to_string(),
            commit_message: first_line(run),
            start_time: run.created_at_milli(),
            estimated_duration_ms,
            last_status: run.status.clone(),
            last_conclusion: run.conclusion.clone(),
            last_checked_at: epoch_milli(),
            cached_artifact_path: None,
            artifact_failed: false,
        };

        info!(
            run_id = run.id,
            workflow = run.name,
            estimated_duration_ms,
            "Watching run"
        );

        // Read-modify-write against disk, held under the lock so a poll pass
        // persisting concurrently cannot overwrite this entry with its own
        // older snapshot. Disk is written before memory so a failed save
        // leaves both in their prior state.
        {
            let mut watched = self.watched.lock().await;
            let mut entries = self.registry.load().await?;
            entries.insert(entry.run_id, entry.clone());
            self.registry
                .save(&entries)
                .await
                .context("could not persist watch registry")?;
            *watched = entries;
        }

        self.send_progress_notification(&entry, epoch_milli()).await;

        // Out-of-band poll so status updates don't wait for the next tick.
        let watcher = self.clone();
        tokio::spawn(async move {
            if let Err(e) = watcher.poll_all().await {
                error!(error = %e, "Out-of-band poll after watch failed");
            }
        });

        Ok(())
    }

    /// Stop observing a run. Takes effect for in-flight polls at their next
    /// per-run checkpoint; an artifact fetch already running for this run is
    /// allowed to finish and its result is discarded.
    pub async fn unwatch(&self, run_id: u64) -> Result<()> {
        {
            let mut watched = self.watched.lock().await;
            let mut entries = self.registry.load().await?;
            entries.remove(&run_id);
            self.registry
                .save(&entries)
                .await
                .context("could not persist watch registry")?;
            *watched = entries;
        }

        if let Err(e) = self.notifier.dismiss(&run_id.to_string()).await {
            warn!(run_id, error = %e, "Could not dismiss notification for unwatched run");
        }

        info!(run_id, "Unwatched run");

        Ok(())
    }

    pub async fn is_watching(&self, run_id: u64) -> bool {
        self.watched.lock().await.contains_key(&run_id)
    }

    /// Poll every watched run that hasn't settled yet. Safe to call from
    /// multiple triggers: a second invocation while one is in flight is a
    /// no-op. Per-run failures are isolated; they never abort the batch and
    /// the entry is retried on the next tick.
    pub async fn poll_all(&self) -> Result<PollOutcome> {
        if self
            .polling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Poll already in flight; skipping");
            return Ok(PollOutcome::AlreadyRunning);
        }
        let _guard = PollGuard {
            flag: self.polling.clone(),
        };

        // Pick up whatever the last process wrote; in-memory state from
        // before a restart is never trusted. Held under the lock so a
        // watch/unwatch committing mid-reload is not clobbered.
        let entries = {
            let mut watched = self.watched.lock().await;
            let entries = self
                .registry
                .load()
                .await
                .context("could not load watch registry")?;
            *watched = entries.clone();
            entries
        };

        let run_ids: Vec<u64> = entries
            .values()
            .filter(|entry| !entry.is_settled())
            .map(|entry| entry.run_id)
            .collect();

        if run_ids.is_empty() {
            return Ok(PollOutcome::Completed {
                checked: 0,
                failures: 0,
            });
        }

        let mut checked = 0;
        let mut failures = 0;

        for run_id in run_ids {
            match self.poll_one(run_id).await {
                Ok(true) => checked += 1,
                Ok(false) => {}
                Err(e) => {
                    failures += 1;
                    error!(run_id, error = format!("{e:#}"), "Could not poll watched run");
                }
            }
        }

        debug!(checked, failures, "Poll pass finished");

        Ok(PollOutcome::Completed { checked, failures })
    }

    /// Background-scheduler entry point. Never panics or propagates; the OS
    /// only understands a coarse task-result signal.
    pub async fn background_tick(&self) -> BackgroundTaskResult {
        match self.poll_all().await {
            Ok(PollOutcome::AlreadyRunning) => BackgroundTaskResult::NoData,
            Ok(PollOutcome::Completed { checked: 0, .. }) => BackgroundTaskResult::NoData,
            Ok(PollOutcome::Completed { .. }) => BackgroundTaskResult::NewData,
            Err(e) => {
                error!(error = format!("{e:#}"), "Background tick failed");
                BackgroundTaskResult::Failed
            }
        }
    }

    /// Spawn the foreground polling loop. The returned handle aborts it when
    /// the host app goes to the background.
    pub fn start_foreground_ticker(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let watcher = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = watcher.poll_all().await {
                    error!(error = format!("{e:#}"), "Scheduled poll failed");
                }
            }
        })
    }

    /// One run's poll iteration. Returns false when the run was skipped
    /// (unwatched or already settled since the batch snapshot).
    async fn poll_one(&self, run_id: u64) -> Result<bool> {
        // Unwatch takes effect here, at the top of each iteration.
        let item = {
            let watched = self.watched.lock().await;
            match watched.get(&run_id) {
                Some(entry) if !entry.is_settled() => entry.clone(),
                _ => return Ok(false),
            }
        };

        let fresh = self
            .provider
            .get_run(&item.token, &item.owner, &item.repo, run_id)
            .await
            .context("could not fetch run status")?;

        let was_terminal = item.last_status == RunStatus::Completed;

        let mut updated = item.clone();
        updated.branch = fresh.head_branch.clone();
        updated.commit_message = first_line(&fresh);
        updated.last_status = fresh.status.clone();
        updated.last_conclusion = fresh.conclusion.clone();
        updated.last_checked_at = epoch_milli();

        if fresh.status != RunStatus::Completed {
            self.update_entry(updated.clone()).await?;
            self.send_progress_notification(&updated, epoch_milli()).await;
            return Ok(true);
        }

        if fresh.conclusion == Some(provider::RunConclusion::Success) {
            self.handle_success(updated).await?;
            return Ok(true);
        }

        // Terminal non-success. Notify once, on the transition; the entry
        // stays until the user unwatches it.
        let conclusion = fresh
            .conclusion
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let is_transition = !was_terminal || item.last_conclusion != fresh.conclusion;
        self.update_entry(updated.clone()).await?;

        if is_transition {
            info!(run_id, conclusion, "Watched run finished without success");
            self.notify(Notification {
                id: run_id.to_string(),
                title: notifier::run_title(&updated.workflow_name),
                body: format!("Build {conclusion}"),
                small_text: None,
                channel: Channel::Result,
                priority: Priority::High,
                sticky: false,
                auto_dismiss: true,
                progress_percent: None,
                action: None,
            })
            .await;
        }

        Ok(true)
    }

    /// Terminal success: locate the best artifact, fetch it in download-only
    /// mode, and flip the entry to artifact-ready.
    async fn handle_success(&self, mut updated: WatchedRun) -> Result<()> {
        let run_id = updated.run_id;

        self.notify(Notification {
            id: run_id.to_string(),
            title: notifier::run_title(&updated.workflow_name),
            body: "Downloading artifact...".to_string(),
            small_text: None,
            channel: Channel::Progress,
            priority: Priority::Low,
            sticky: true,
            auto_dismiss: false,
            progress_percent: Some(100),
            action: None,
        })
        .await;

        let artifacts = self
            .provider
            .list_artifacts(&updated.token, &updated.owner, &updated.repo, run_id)
            .await
            .context("could not list run artifacts")?;

        let Some(artifact) = best_artifact(&artifacts) else {
            // Artifacts sometimes lag the run's completion; leave the entry
            // unsettled so the next tick retries.
            warn!(run_id, "Run succeeded but no artifact is available yet");
            self.update_entry(updated.clone()).await?;
            self.notify(Notification {
                id: run_id.to_string(),
                title: notifier::run_title(&updated.workflow_name),
                body: "No artifact found".to_string(),
                small_text: None,
                channel: Channel::Progress,
                priority: Priority::Low,
                sticky: true,
                auto_dismiss: false,
                progress_percent: None,
                action: None,
            })
            .await;
            return Ok(());
        };
        let artifact = artifact.clone();

        info!(run_id, artifact = artifact.name, "Fetching artifact for completed run");

        // The watcher never attempts a foreground install action itself.
        let fetch_result = self
            .fetcher
            .fetch(FetchRequest {
                artifact: artifact.clone(),
                token: updated.token.clone(),
                branch: updated.branch.clone(),
                download_only: true,
                on_progress: None,
                on_phase: None,
            })
            .await;

        match fetch_result {
            Ok(path) => {
                // The run may have been unwatched while the fetch ran; the
                // download completed but its result is silently discarded.
                if !self.is_watching(run_id).await {
                    debug!(run_id, "Run unwatched mid-fetch; discarding artifact result");
                    return Ok(());
                }

                updated.cached_artifact_path = Some(path.clone());
                self.update_entry(updated.clone()).await?;

                info!(run_id, path = %path.display(), "Artifact ready to install");

                self.notify(Notification {
                    id: run_id.to_string(),
                    title: notifier::run_title(&updated.workflow_name),
                    body: "Ready to Install".to_string(),
                    small_text: None,
                    channel: Channel::Result,
                    priority: Priority::High,
                    sticky: false,
                    auto_dismiss: false,
                    progress_percent: None,
                    action: Some(NotifyAction::Install { path }),
                })
                .await;
            }
            Err(FetchError::ArtifactCorrupt(reason)) => {
                // Permanent for this artifact; never retried.
                error!(run_id, reason, "Artifact is corrupt");

                updated.artifact_failed = true;
                self.update_entry(updated.clone()).await?;

                self.notify(Notification {
                    id: run_id.to_string(),
                    title: notifier::run_title(&updated.workflow_name),
                    body: "Artifact download failed".to_string(),
                    small_text: None,
                    channel: Channel::Result,
                    priority: Priority::High,
                    sticky: false,
                    auto_dismiss: true,
                    progress_percent: None,
                    action: None,
                })
                .await;
            }
            Err(e) => {
                // Transient; the entry stays unsettled and the next tick
                // retries the whole fetch.
                self.update_entry(updated).await?;
                return Err(e).context("could not fetch artifact");
            }
        }

        Ok(())
    }

    /// Persist a mutated entry, unless the run was unwatched since the poll
    /// snapshot — never resurrect removed entries.
    async fn update_entry(&self, entry: WatchedRun) -> Result<()> {
        let mut watched = self.watched.lock().await;
        if !watched.contains_key(&entry.run_id) {
            return Ok(());
        }

        let mut snapshot = watched.clone();
        snapshot.insert(entry.run_id, entry);
        self.registry
            .save(&snapshot)
            .await
            .context("could not persist watch registry")?;
        *watched = snapshot;

        Ok(())
    }

    async fn send_progress_notification(&self, entry: &WatchedRun, now: u64) {
        let percent = progress_percent(now, entry.start_time, entry.estimated_duration_ms);
        let mins_left = remaining_minutes(now, entry.start_time, entry.estimated_duration_ms);

        let small_text = notifier::progress_line(&entry.branch, percent, mins_left);
        let body = notifier::progress_body(
            &entry.branch,
            percent,
            mins_left,
            &entry.owner,
            &entry.repo,
            &entry.commit_message,
        );

        self.notify(Notification {
            id: entry.run_id.to_string(),
            title: notifier::run_title(&entry.workflow_name),
            body,
            small_text: Some(small_text),
            channel: Channel::Progress,
            priority: Priority::Low,
            sticky: true,
            auto_dismiss: false,
            progress_percent: Some(percent),
            action: None,
        })
        .await;
    }

    /// Notification failures are logged and swallowed; they must not fail a
    /// poll iteration.
    async fn notify(&self, notification: Notification) {
        if let Err(e) = self.notifier.schedule(notification).await {
            warn!(error = %e, "Could not schedule notification");
        }
    }
}

/// Percent complete for the progress bar, derived from elapsed wall-clock
/// time against the estimate and capped at 99 until a terminal state.
pub fn progress_percent(now: u64, start_time: u64, estimated_duration_ms: u64) -> u8 {
    if estimated_duration_ms == 0 {
        return 99;
    }

    let elapsed = now.saturating_sub(start_time) as f64;
    let fraction = (elapsed / estimated_duration_ms as f64).min(0.99);
    (fraction * 100.0).round() as u8
}

/// Whole minutes left until the estimate runs out, rounded up; floors at 0.
pub fn remaining_minutes(now: u64, start_time: u64, estimated_duration_ms: u64) -> u64 {
    let elapsed = now.saturating_sub(start_time);
    estimated_duration_ms.saturating_sub(elapsed).div_ceil(60_000)
}

/// Pick the artifact most likely to be the installable app bundle: walk the
/// priority terms in order and return the first (newest-first) artifact whose
/// name contains the term, else the newest artifact overall.
pub fn best_artifact(artifacts: &[Artifact]) -> Option<&Artifact> {
    if artifacts.is_empty() {
        return None;
    }

    let mut sorted: Vec<&Artifact> = artifacts.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    for term in ARTIFACT_PRIORITIES {
        if let Some(found) = sorted
            .iter()
            .find(|artifact| artifact.name.to_lowercase().contains(term))
        {
            return Some(found);
        }
    }

    Some(sorted[0])
}

fn first_line(run: &Run) -> String {
    run.head_commit
        .as_ref()
        .and_then(|commit| commit.message.lines().next())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests;
