use crate::provider::{Run, RunConclusion, RunStatus};

/// Fallback estimate when history contains no usable samples: 5 minutes.
pub const DEFAULT_ESTIMATE_MS: u64 = 300_000;

/// Expected duration in milliseconds for a workflow, computed as the
/// arithmetic mean of historical successful runs of the same name.
///
/// A sample's duration is `updated_at - created_at`; samples where the
/// provider reports `updated_at < created_at` are excluded. With zero valid
/// samples the fixed default is returned. Pure and infallible; callers never
/// need to handle an estimation error.
pub fn estimate(historical: &[Run], workflow_name: &str) -> u64 {
    let durations: Vec<u64> = historical
        .iter()
        .filter(|run| {
            run.name == workflow_name
                && run.status == RunStatus::Completed
                && run.conclusion == Some(RunConclusion::Success)
        })
        .filter_map(|run| {
            let millis = run
                .updated_at
                .signed_duration_since(run.created_at)
                .num_milliseconds();
            u64::try_from(millis).ok()
        })
        .collect();

    if durations.is_empty() {
        return DEFAULT_ESTIMATE_MS;
    }

    let total: u64 = durations.iter().sum();
    total / durations.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn run(
        name: &str,
        status: RunStatus,
        conclusion: Option<RunConclusion>,
        duration_ms: i64,
    ) -> Run {
        let created_at: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        Run {
            id: 1,
            name: name.to_string(),
            head_branch: "main".to_string(),
            head_sha: "abc".to_string(),
            status,
            conclusion,
            created_at,
            updated_at: created_at + Duration::milliseconds(duration_ms),
            html_url: String::new(),
            head_commit: None,
        }
    }

    #[test]
    fn no_samples_returns_default() {
        assert_eq!(estimate(&[], "build"), DEFAULT_ESTIMATE_MS);
    }

    #[rstest]
    #[case::wrong_name(run("other", RunStatus::Completed, Some(RunConclusion::Success), 60_000))]
    #[case::not_completed(run("build", RunStatus::InProgress, None, 60_000))]
    #[case::failed(run("build", RunStatus::Completed, Some(RunConclusion::Failure), 60_000))]
    #[case::negative_duration(run("build", RunStatus::Completed, Some(RunConclusion::Success), -1))]
    fn unusable_samples_return_default(#[case] sample: Run) {
        assert_eq!(estimate(&[sample], "build"), DEFAULT_ESTIMATE_MS);
    }

    #[test]
    fn mean_of_valid_samples() {
        let history = vec![
            run("build", RunStatus::Completed, Some(RunConclusion::Success), 120_000),
            run("build", RunStatus::Completed, Some(RunConclusion::Success), 240_000),
            run("build", RunStatus::Completed, Some(RunConclusion::Success), 360_000),
            // Ignored: different workflow and a failure.
            run("deploy", RunStatus::Completed, Some(RunConclusion::Success), 900_000),
            run("build", RunStatus::Completed, Some(RunConclusion::Failure), 900_000),
        ];

        assert_eq!(estimate(&history, "build"), 240_000);
    }

    #[test]
    fn zero_duration_is_a_valid_sample() {
        let history = vec![
            run("build", RunStatus::Completed, Some(RunConclusion::Success), 0),
            run("build", RunStatus::Completed, Some(RunConclusion::Success), 100_000),
        ];

        assert_eq!(estimate(&history, "build"), 50_000);
    }
}
