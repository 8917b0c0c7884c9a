use super::*;
use crate::artifact_store::{ArtifactStore, DEFAULT_MAX_ENTRIES};
use crate::notifier::{Notification, Notifier, NotifierError};
use crate::provider::{
    Artifact, ByteStream, CiProvider, HeadCommit, ProviderError, ResolvedDownload, Run,
    RunConclusion, RunStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex as StdMutex;

/// Scriptable provider double: run states and artifact listings are looked up
/// from maps, downloads serve a fixed blob, and call counts are recorded.
#[derive(Debug, Default)]
struct MockProvider {
    history: Vec<Run>,
    runs: StdMutex<HashMap<u64, Run>>,
    artifacts: StdMutex<HashMap<u64, Vec<Artifact>>>,
    blob: Vec<u8>,
    get_run_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

impl MockProvider {
    fn set_run(&self, run: Run) {
        self.runs.lock().unwrap().insert(run.id, run);
    }

    fn set_artifacts(&self, run_id: u64, artifacts: Vec<Artifact>) {
        self.artifacts.lock().unwrap().insert(run_id, artifacts);
    }

    fn get_run_calls(&self) -> usize {
        self.get_run_calls.load(Ordering::SeqCst)
    }

    fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CiProvider for MockProvider {
    async fn list_runs(
        &self,
        _: &str,
        _: &str,
        _: &str,
        _: Option<&str>,
        _: u32,
    ) -> Result<Vec<Run>, ProviderError> {
        Ok(self.history.clone())
    }

    async fn get_run(&self, _: &str, _: &str, _: &str, run_id: u64) -> Result<Run, ProviderError> {
        self.get_run_calls.fetch_add(1, Ordering::SeqCst);
        self.runs
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .ok_or_else(|| ProviderError::Network("unknown run".into()))
    }

    async fn list_artifacts(
        &self,
        _: &str,
        _: &str,
        _: &str,
        run_id: u64,
    ) -> Result<Vec<Artifact>, ProviderError> {
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn resolve_download_url(
        &self,
        _: &str,
        _: &str,
    ) -> Result<ResolvedDownload, ProviderError> {
        Ok(ResolvedDownload {
            url: "https://blobs.example.com/artifact.zip".to_string(),
            forward_auth: false,
        })
    }

    async fn download(&self, _: &ResolvedDownload, _: &str) -> Result<ByteStream, ProviderError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let blob = self.blob.clone();
        let len = blob.len() as u64;
        Ok(ByteStream {
            content_length: Some(len),
            stream: Box::pin(futures::stream::iter(vec![Ok(bytes::Bytes::from(blob))])),
        })
    }
}

#[derive(Debug, Default)]
struct MockNotifier {
    scheduled: StdMutex<Vec<Notification>>,
    dismissed: StdMutex<Vec<String>>,
}

impl MockNotifier {
    fn scheduled(&self) -> Vec<Notification> {
        self.scheduled.lock().unwrap().clone()
    }

    fn results(&self) -> Vec<Notification> {
        self.scheduled()
            .into_iter()
            .filter(|n| n.channel == Channel::Result)
            .collect()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn schedule(&self, notification: Notification) -> Result<(), NotifierError> {
        self.scheduled.lock().unwrap().push(notification);
        Ok(())
    }

    async fn dismiss(&self, id: &str) -> Result<(), NotifierError> {
        self.dismissed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

struct Harness {
    watcher: RunWatcher,
    provider: Arc<MockProvider>,
    notifier: Arc<MockNotifier>,
    store: Arc<ArtifactStore>,
    registry: Arc<Registry>,
    _tmp: Option<tempfile::TempDir>,
}

fn harness_at(root: &Path, provider: MockProvider) -> Harness {
    let provider = Arc::new(provider);
    let notifier = Arc::new(MockNotifier::default());
    let store = Arc::new(ArtifactStore::new(root, DEFAULT_MAX_ENTRIES).unwrap());
    let fetcher = Arc::new(ArtifactFetcher::new(
        provider.clone(),
        store.clone(),
        None,
        "apk",
    ));
    let registry = Arc::new(Registry::new(&root.join(REGISTRY_FILE_NAME)));

    let watcher = RunWatcher::new(
        provider.clone(),
        notifier.clone(),
        fetcher,
        registry.clone(),
        20,
    );

    Harness {
        watcher,
        provider,
        notifier,
        store,
        registry,
        _tmp: None,
    }
}

fn harness(provider: MockProvider) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut harness = harness_at(tmp.path(), provider);
    harness._tmp = Some(tmp);
    harness
}

fn run(id: u64, status: RunStatus, conclusion: Option<RunConclusion>) -> Run {
    Run {
        id,
        name: "android-build".to_string(),
        head_branch: "main".to_string(),
        head_sha: "abc123".to_string(),
        status,
        conclusion,
        created_at: "2024-05-01T10:00:00Z".parse().unwrap(),
        updated_at: "2024-05-01T10:10:00Z".parse().unwrap(),
        html_url: String::new(),
        head_commit: Some(HeadCommit {
            message: "fix: crash on boot\n\nlonger explanation".to_string(),
        }),
    }
}

fn artifact(id: u64, name: &str, created_at: &str) -> Artifact {
    Artifact {
        id,
        name: name.to_string(),
        size_in_bytes: 1024,
        url: String::new(),
        archive_download_url: format!("https://api.example.com/artifacts/{id}/zip"),
        created_at: created_at.parse::<DateTime<Utc>>().unwrap(),
        expired: false,
    }
}

fn entry(run_id: u64) -> WatchedRun {
    WatchedRun {
        run_id,
        workflow_name: "android-build".to_string(),
        owner: "octo".to_string(),
        repo: "app".to_string(),
        branch: "main".to_string(),
        token: "tok".to_string(),
        commit_message: "fix: crash on boot".to_string(),
        start_time: epoch_milli() - 300_000,
        estimated_duration_ms: 600_000,
        last_status: RunStatus::InProgress,
        last_conclusion: None,
        last_checked_at: epoch_milli(),
        cached_artifact_path: None,
        artifact_failed: false,
    }
}

async fn seed(harness: &Harness, entries: Vec<WatchedRun>) {
    let map: HashMap<u64, WatchedRun> = entries.into_iter().map(|e| (e.run_id, e)).collect();
    harness.registry.save(&map).await.unwrap();
}

fn apk_zip() -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default();
        writer.start_file("app-release.apk", options).unwrap();
        writer.write_all(b"binary-payload").unwrap();
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

#[test]
fn progress_percent_halfway() {
    assert_eq!(progress_percent(1_000_300_000, 1_000_000_000, 600_000), 50);
    assert_eq!(remaining_minutes(1_000_300_000, 1_000_000_000, 600_000), 5);
}

#[test]
fn progress_percent_caps_at_99() {
    // Ten times past the estimate.
    assert_eq!(progress_percent(7_000_000, 1_000_000, 600_000), 99);
    assert_eq!(remaining_minutes(7_000_000, 1_000_000, 600_000), 0);
}

#[test]
fn progress_percent_with_no_estimate() {
    assert_eq!(progress_percent(1_000, 0, 0), 99);
}

#[test]
fn best_artifact_prefers_priority_terms_over_recency() {
    let artifacts = vec![
        artifact(1, "lint-report", "2024-05-01T12:00:00Z"),
        artifact(2, "app-debug", "2024-05-01T10:00:00Z"),
    ];

    assert_eq!(best_artifact(&artifacts).unwrap().id, 2);
}

#[test]
fn best_artifact_matches_case_insensitively() {
    let artifacts = vec![artifact(1, "APP-RELEASE-v2", "2024-05-01T10:00:00Z")];
    assert_eq!(best_artifact(&artifacts).unwrap().id, 1);
}

#[test]
fn best_artifact_takes_newest_among_equal_matches() {
    let artifacts = vec![
        artifact(1, "app-release-old", "2024-05-01T10:00:00Z"),
        artifact(2, "app-release-new", "2024-05-02T10:00:00Z"),
    ];

    assert_eq!(best_artifact(&artifacts).unwrap().id, 2);
}

#[test]
fn best_artifact_falls_back_to_newest() {
    let artifacts = vec![
        artifact(1, "coverage", "2024-05-01T10:00:00Z"),
        artifact(2, "screenshots", "2024-05-02T10:00:00Z"),
    ];

    assert_eq!(best_artifact(&artifacts).unwrap().id, 2);
}

#[test]
fn best_artifact_empty_is_none() {
    assert_eq!(best_artifact(&[]), None);
}

#[tokio::test]
async fn watch_estimates_persists_and_notifies() {
    let mut provider = MockProvider::default();
    // Two finished runs of the same workflow, ten minutes each.
    provider.history = vec![
        run(1, RunStatus::Completed, Some(RunConclusion::Success)),
        run(2, RunStatus::Completed, Some(RunConclusion::Success)),
    ];
    let harness = harness(provider);

    let watched = run(10, RunStatus::InProgress, None);
    harness.provider.set_run(watched.clone());

    harness
        .watcher
        .watch(&watched, "tok", "octo", "app")
        .await
        .unwrap();

    assert!(harness.watcher.is_watching(10).await);

    let persisted = harness.registry.load().await.unwrap();
    let entry = persisted.get(&10).unwrap();
    assert_eq!(entry.estimated_duration_ms, 600_000);
    assert_eq!(entry.commit_message, "fix: crash on boot");

    // The first progress notification fires before any poll tick.
    let scheduled = harness.notifier.scheduled();
    let first = scheduled.first().unwrap();
    assert_eq!(first.id, "10");
    assert_eq!(first.channel, Channel::Progress);
    assert_eq!(first.title, "Build: android-build");
}

#[tokio::test]
async fn poll_composes_progress_notification() {
    let harness = harness(MockProvider::default());
    harness
        .provider
        .set_run(run(10, RunStatus::InProgress, None));
    // Five of an estimated ten minutes elapsed.
    seed(&harness, vec![entry(10)]).await;

    let outcome = harness.watcher.poll_all().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            checked: 1,
            failures: 0
        }
    );

    let scheduled = harness.notifier.scheduled();
    let progress = scheduled.last().unwrap();
    assert_eq!(progress.channel, Channel::Progress);
    assert_eq!(progress.progress_percent, Some(50));
    assert_eq!(
        progress.small_text.as_deref(),
        Some("main • 50% • ~5m left")
    );
    assert!(progress.body.contains("Repo: octo/app"));
    assert!(progress.body.contains("Commit: fix: crash on boot"));
    assert!(progress.sticky);
}

#[tokio::test]
async fn success_fetches_artifact_and_offers_install() {
    let mut provider = MockProvider::default();
    provider.blob = apk_zip();
    let harness = harness(provider);

    harness
        .provider
        .set_run(run(10, RunStatus::Completed, Some(RunConclusion::Success)));
    harness.provider.set_artifacts(
        10,
        vec![
            artifact(55, "lint-report", "2024-05-01T11:00:00Z"),
            artifact(56, "app-release", "2024-05-01T10:30:00Z"),
        ],
    );
    seed(&harness, vec![entry(10)]).await;

    let outcome = harness.watcher.poll_all().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            checked: 1,
            failures: 0
        }
    );

    // The payload landed in the cache and the entry points at it.
    let cached = harness.store.is_cached(56).unwrap();
    let persisted = harness.registry.load().await.unwrap();
    assert_eq!(
        persisted.get(&10).unwrap().cached_artifact_path,
        Some(cached.clone())
    );

    let results = harness.notifier.results();
    assert_eq!(results.len(), 1);
    let ready = &results[0];
    assert_eq!(ready.body, "Ready to Install");
    assert_eq!(ready.priority, Priority::High);
    assert!(!ready.auto_dismiss);
    assert_eq!(ready.action, Some(NotifyAction::Install { path: cached }));

    // Settled: the next pass doesn't touch the provider for this run.
    let calls_before = harness.provider.get_run_calls();
    let outcome = harness.watcher.poll_all().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            checked: 0,
            failures: 0
        }
    );
    assert_eq!(harness.provider.get_run_calls(), calls_before);
    assert_eq!(harness.notifier.results().len(), 1);
}

#[tokio::test]
async fn non_success_notifies_once_on_transition() {
    let harness = harness(MockProvider::default());
    harness
        .provider
        .set_run(run(10, RunStatus::Completed, Some(RunConclusion::Failure)));
    seed(&harness, vec![entry(10)]).await;

    harness.watcher.poll_all().await.unwrap();

    let results = harness.notifier.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].body, "Build failure");

    // Still watched and still polled, but no repeat notification while the
    // conclusion is unchanged.
    harness.watcher.poll_all().await.unwrap();
    assert!(harness.watcher.is_watching(10).await);
    assert_eq!(harness.provider.get_run_calls(), 2);
    assert_eq!(harness.notifier.results().len(), 1);
}

#[tokio::test]
async fn corrupt_artifact_settles_the_entry() {
    let mut provider = MockProvider::default();
    provider.blob = b"this is not a zip archive".to_vec();
    let harness = harness(provider);

    harness
        .provider
        .set_run(run(10, RunStatus::Completed, Some(RunConclusion::Success)));
    harness
        .provider
        .set_artifacts(10, vec![artifact(56, "app-release", "2024-05-01T10:30:00Z")]);
    seed(&harness, vec![entry(10)]).await;

    let outcome = harness.watcher.poll_all().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            checked: 1,
            failures: 0
        }
    );

    let persisted = harness.registry.load().await.unwrap();
    let entry = persisted.get(&10).unwrap();
    assert!(entry.artifact_failed);
    assert_eq!(entry.cached_artifact_path, None);

    let results = harness.notifier.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].body, "Artifact download failed");

    // Permanent: never fetched again.
    let downloads = harness.provider.download_calls();
    harness.watcher.poll_all().await.unwrap();
    assert_eq!(harness.provider.download_calls(), downloads);
}

#[tokio::test]
async fn unwatch_removes_entry_and_dismisses() {
    let harness = harness(MockProvider::default());
    harness
        .provider
        .set_run(run(10, RunStatus::InProgress, None));
    seed(&harness, vec![entry(10)]).await;
    harness.watcher.init().await.unwrap();

    harness.watcher.unwatch(10).await.unwrap();

    assert!(!harness.watcher.is_watching(10).await);
    assert_eq!(harness.registry.load().await.unwrap().len(), 0);
    assert_eq!(
        *harness.notifier.dismissed.lock().unwrap(),
        vec!["10".to_string()]
    );

    let outcome = harness.watcher.poll_all().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            checked: 0,
            failures: 0
        }
    );
    assert_eq!(harness.provider.get_run_calls(), 0);
}

#[tokio::test]
async fn concurrent_polls_collapse_into_one() {
    let mut provider = MockProvider::default();
    provider.blob = apk_zip();
    let harness = harness(provider);

    harness
        .provider
        .set_run(run(10, RunStatus::Completed, Some(RunConclusion::Success)));
    harness
        .provider
        .set_artifacts(10, vec![artifact(56, "app-release", "2024-05-01T10:30:00Z")]);
    seed(&harness, vec![entry(10)]).await;

    let (first, second) = tokio::join!(harness.watcher.poll_all(), harness.watcher.poll_all());
    let outcomes = [first.unwrap(), second.unwrap()];

    assert!(outcomes.contains(&PollOutcome::AlreadyRunning));
    assert!(outcomes.contains(&PollOutcome::Completed {
        checked: 1,
        failures: 0
    }));

    // Exactly one fetch and one ready notification despite two triggers.
    assert_eq!(harness.provider.download_calls(), 1);
    assert_eq!(harness.notifier.results().len(), 1);
}

#[tokio::test]
async fn watch_during_poll_pass_is_not_lost() {
    // A watch landing while a poll pass is mid-flight (including its artifact
    // download and registry saves) must survive on disk, whichever side
    // persists last.
    for _ in 0..25 {
        let mut provider = MockProvider::default();
        provider.blob = apk_zip();
        let harness = harness(provider);

        harness
            .provider
            .set_run(run(10, RunStatus::Completed, Some(RunConclusion::Success)));
        harness
            .provider
            .set_artifacts(10, vec![artifact(56, "app-release", "2024-05-01T10:30:00Z")]);
        harness.provider.set_run(run(20, RunStatus::InProgress, None));
        seed(&harness, vec![entry(10)]).await;

        let run_20 = run(20, RunStatus::InProgress, None);
        let (poll, watched) = tokio::join!(
            harness.watcher.poll_all(),
            harness.watcher.watch(&run_20, "tok", "octo", "app"),
        );
        poll.unwrap();
        watched.unwrap();

        let persisted = harness.registry.load().await.unwrap();
        assert!(persisted.contains_key(&10), "run 10 vanished from disk");
        assert!(persisted.contains_key(&20), "run 20 vanished from disk");
    }
}

#[tokio::test]
async fn per_run_failures_do_not_abort_the_pass() {
    let harness = harness(MockProvider::default());
    // Run 11 exists; run 10 errors on every status fetch.
    harness
        .provider
        .set_run(run(11, RunStatus::InProgress, None));
    let mut broken = entry(10);
    broken.workflow_name = "broken-build".to_string();
    seed(&harness, vec![broken, entry(11)]).await;

    let outcome = harness.watcher.poll_all().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            checked: 1,
            failures: 1
        }
    );

    // The healthy run still produced its progress update.
    assert!(harness
        .notifier
        .scheduled()
        .iter()
        .any(|n| n.id == "11" && n.channel == Channel::Progress));
}

#[tokio::test]
async fn registry_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();

    {
        let harness = harness_at(tmp.path(), MockProvider::default());
        let watched = run(10, RunStatus::InProgress, None);
        harness.provider.set_run(watched.clone());
        harness
            .watcher
            .watch(&watched, "tok", "octo", "app")
            .await
            .unwrap();
    }

    // Fresh process: nothing shared but the files on disk.
    let harness = harness_at(tmp.path(), MockProvider::default());
    harness
        .provider
        .set_run(run(10, RunStatus::InProgress, None));

    assert_eq!(harness.watcher.init().await.unwrap(), 1);
    assert!(harness.watcher.is_watching(10).await);

    let outcome = harness.watcher.poll_all().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Completed {
            checked: 1,
            failures: 0
        }
    );
}

#[tokio::test]
async fn background_tick_maps_outcomes() {
    let harness = harness(MockProvider::default());

    // Empty registry: nothing checked.
    assert_eq!(
        harness.watcher.background_tick().await,
        BackgroundTaskResult::NoData
    );

    harness
        .provider
        .set_run(run(10, RunStatus::InProgress, None));
    seed(&harness, vec![entry(10)]).await;

    assert_eq!(
        harness.watcher.background_tick().await,
        BackgroundTaskResult::NewData
    );
}
