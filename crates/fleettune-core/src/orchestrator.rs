//! Concurrent multi-target configuration updates.
//!
//! [`update_targets`] fans out one worker task per target; each worker
//! fans out one task per requested setting change and joins them by
//! draining exactly as many outcomes as it launched. Nothing is
//! cancelled or retried: every change on every target runs to completion
//! independently, and a failure never affects sibling changes or other
//! targets.
//!
//! Each worker publishes a single aggregated status line of the form
//! `configuration update complete: set cores to 86, failed to set llc
//! to 336, ...` with fragments appended in outcome arrival order. The
//! correlation layer later parses these lines back into per-setting
//! verdicts, so the fragment wording here and in
//! [`crate::correlate`] must stay in lockstep.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::progress::StatusSink;
use crate::settings::ApplyError;
use crate::target::Target;

/// Future type produced by an apply function.
pub type ApplyFuture = Pin<Box<dyn Future<Output = Result<(), ApplyError>> + Send>>;

/// The operation that writes one setting to one target.
pub type ApplyFn = dyn Fn(Arc<dyn Target>, PathBuf) -> ApplyFuture + Send + Sync;

/// One requested setting change, with the value already rendered the way
/// it should appear in status lines.
#[derive(Clone)]
pub struct SettingChange {
    pub name: String,
    pub value: String,
    apply: Arc<ApplyFn>,
}

impl SettingChange {
    pub fn new<F, Fut>(name: impl Into<String>, value: impl Into<String>, apply: F) -> Self
    where
        F: Fn(Arc<dyn Target>, PathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ApplyError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            value: value.into(),
            apply: Arc::new(move |target, dir| Box::pin(apply(target, dir))),
        }
    }
}

impl std::fmt::Debug for SettingChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingChange")
            .field("name", &self.name)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// The outcome of one setting change on one target.
#[derive(Debug, Clone)]
pub struct SettingOutcome {
    pub name: String,
    pub value: String,
    /// `None` on success, the error rendering on failure.
    pub error: Option<String>,
}

impl SettingOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything that happened on one target.
#[derive(Debug, Clone)]
pub struct TargetUpdateResult {
    pub target_name: String,
    /// The aggregated status line published for this target.
    pub status_line: String,
    /// Per-setting outcomes, in the order the changes were requested.
    pub outcomes: Vec<SettingOutcome>,
}

struct SetOutcome {
    slot: usize,
    result: Result<(), ApplyError>,
}

/// Apply every change to every target concurrently.
///
/// Results come back in the order the targets were supplied, regardless
/// of completion order. An empty change list returns immediately without
/// spawning anything.
pub async fn update_targets(
    targets: Vec<Arc<dyn Target>>,
    changes: Vec<SettingChange>,
    local_temp_dir: &Path,
    sink: Arc<dyn StatusSink>,
) -> Vec<TargetUpdateResult> {
    if changes.is_empty() {
        return Vec::new();
    }

    let mut workers = JoinSet::new();
    for (index, target) in targets.into_iter().enumerate() {
        let changes = changes.clone();
        let dir = local_temp_dir.to_path_buf();
        let sink = sink.clone();
        workers
            .spawn(async move { (index, update_single_target(target, changes, dir, sink).await) });
    }

    let mut results: Vec<(usize, TargetUpdateResult)> = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(entry) => results.push(entry),
            Err(err) => warn!(%err, "target worker task failed"),
        }
    }
    // back to the caller-supplied target order
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

async fn update_single_target(
    target: Arc<dyn Target>,
    changes: Vec<SettingChange>,
    local_temp_dir: PathBuf,
    sink: Arc<dyn StatusSink>,
) -> TargetUpdateResult {
    let target_name = target.name().to_string();
    if let Err(err) = sink.update(&target_name, "updating configuration") {
        warn!(target = %target_name, %err, "status update failed");
    }

    let launched = changes.len();
    // slot-indexed message tables, fixed before any task starts
    let success_messages: Vec<String> = changes
        .iter()
        .map(|c| format!("set {} to {}", c.name, c.value))
        .collect();
    let failure_messages: Vec<String> = changes
        .iter()
        .map(|c| format!("failed to set {} to {}", c.name, c.value))
        .collect();

    let (tx, mut rx) = mpsc::channel::<SetOutcome>(launched);
    for (slot, change) in changes.iter().enumerate() {
        let tx = tx.clone();
        let target = target.clone();
        let dir = local_temp_dir.clone();
        let apply = change.apply.clone();
        tokio::spawn(async move {
            let result = (apply)(target, dir).await;
            // exactly one outcome per launched task
            let _ = tx.send(SetOutcome { slot, result }).await;
        });
    }
    drop(tx);

    let mut fragments: Vec<String> = Vec::with_capacity(launched);
    let mut errors: Vec<Option<Option<String>>> = vec![None; launched];
    for _ in 0..launched {
        // recv returns None once every sender is gone, so a panicked
        // apply task cannot wedge the drain
        let Some(outcome) = rx.recv().await else { break };
        match outcome.result {
            Ok(()) => {
                fragments.push(success_messages[outcome.slot].clone());
                errors[outcome.slot] = Some(None);
            }
            Err(err) => {
                debug!(target = %target_name, %err, "setting failed");
                fragments.push(failure_messages[outcome.slot].clone());
                errors[outcome.slot] = Some(Some(err.to_string()));
            }
        }
    }
    // slots with no outcome had their task die before reporting
    for (slot, entry) in errors.iter_mut().enumerate() {
        if entry.is_none() {
            fragments.push(failure_messages[slot].clone());
            *entry = Some(Some("apply task terminated unexpectedly".to_string()));
        }
    }

    let status_line = format!("configuration update complete: {}", fragments.join(", "));
    if let Err(err) = sink.update(&target_name, &status_line) {
        warn!(target = %target_name, %err, "status update failed");
    }

    let outcomes = changes
        .into_iter()
        .zip(errors)
        .map(|(change, error)| SettingOutcome {
            name: change.name,
            value: change.value,
            error: error.unwrap_or(None),
        })
        .collect();
    TargetUpdateResult {
        target_name,
        status_line,
        outcomes,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::progress::MemorySink;
    use crate::target::{RawTarget, RecordedIdentity};

    fn test_target(name: &str) -> Arc<dyn Target> {
        Arc::new(RawTarget::new(name, RecordedIdentity::default()))
    }

    fn ok_change(name: &str, value: &str) -> SettingChange {
        SettingChange::new(name, value, |_, _| async { Ok(()) })
    }

    fn failing_change(name: &str, value: &str) -> SettingChange {
        SettingChange::new(name, value, |_, _| async {
            Err(ApplyError::Invalid {
                setting: "test",
                reason: "forced failure".to_string(),
            })
        })
    }

    #[tokio::test]
    async fn every_change_produces_an_outcome() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let targets = vec![test_target("t1"), test_target("t2")];
        let changes = vec![
            ok_change("cores", "86"),
            ok_change("tdp", "350"),
            ok_change("gov", "performance"),
        ];
        let results =
            update_targets(targets, changes, dir.path(), sink.clone()).await;
        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.outcomes.len(), 3);
            assert!(result.outcomes.iter().all(SettingOutcome::succeeded));
        }
        // results are in caller order even though completion order varies
        assert_eq!(results[0].target_name, "t1");
        assert_eq!(results[1].target_name, "t2");
    }

    #[tokio::test]
    async fn failure_does_not_suppress_siblings() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let changes = vec![
            ok_change("cores", "86"),
            failing_change("llc", "336"),
            ok_change("tdp", "350"),
        ];
        let results =
            update_targets(vec![test_target("gnr")], changes, dir.path(), sink.clone()).await;
        let result = &results[0];
        assert!(result.status_line.starts_with("configuration update complete: "));
        assert!(result.status_line.contains("set cores to 86"));
        assert!(result.status_line.contains("failed to set llc to 336"));
        assert!(result.status_line.contains("set tdp to 350"));
        assert!(result.outcomes[0].succeeded());
        assert!(!result.outcomes[1].succeeded());
        assert!(result.outcomes[2].succeeded());
    }

    #[tokio::test]
    async fn slow_change_still_reports() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let slow = SettingChange::new("llc", "336", |_, _| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(ApplyError::Invalid {
                setting: "test",
                reason: "slow failure".to_string(),
            })
        });
        let changes = vec![ok_change("cores", "86"), slow];
        let results =
            update_targets(vec![test_target("t")], changes, dir.path(), sink).await;
        assert_eq!(results[0].outcomes.len(), 2);
        assert!(!results[0].outcomes[1].succeeded());
        // fast success arrives first in the status line
        assert!(results[0]
            .status_line
            .starts_with("configuration update complete: set cores to 86"));
    }

    #[tokio::test]
    async fn empty_change_set_short_circuits() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let results =
            update_targets(vec![test_target("t")], Vec::new(), dir.path(), sink.clone()).await;
        assert!(results.is_empty());
        assert!(sink.updates().is_empty());
    }

    #[tokio::test]
    async fn per_target_failures_are_independent() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let llc = SettingChange::new("llc", "336", |target: Arc<dyn Target>, _| async move {
            if target.name() == "t2" {
                Err(ApplyError::Invalid {
                    setting: "test",
                    reason: "fails on t2 only".to_string(),
                })
            } else {
                Ok(())
            }
        });
        let changes = vec![ok_change("cores", "86"), llc];
        let results = update_targets(
            vec![test_target("t1"), test_target("t2")],
            changes,
            dir.path(),
            sink.clone(),
        )
        .await;
        assert!(results[0].status_line.contains("set llc to 336"));
        assert!(!results[0].status_line.contains("failed"));
        assert!(results[1].status_line.contains("failed to set llc to 336"));
        let latest = sink.latest();
        assert_eq!(latest["t1"], results[0].status_line);
        assert_eq!(latest["t2"], results[1].status_line);
    }

    #[tokio::test]
    async fn broken_sink_does_not_disrupt_outcomes() {
        struct BrokenSink;
        impl StatusSink for BrokenSink {
            fn update(&self, _target: &str, _message: &str) -> std::io::Result<()> {
                Err(std::io::Error::other("display gone"))
            }
        }

        let dir = TempDir::new().unwrap();
        let changes = vec![ok_change("cores", "86"), failing_change("llc", "336")];
        let results =
            update_targets(vec![test_target("t")], changes, dir.path(), Arc::new(BrokenSink))
                .await;
        assert_eq!(results[0].outcomes.len(), 2);
        assert!(results[0].outcomes[0].succeeded());
        assert!(!results[0].outcomes[1].succeeded());
        assert!(results[0]
            .status_line
            .starts_with("configuration update complete: "));
    }

    #[tokio::test]
    async fn status_line_fragments_arrive_in_completion_order() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(MemorySink::new());
        let slow_first = SettingChange::new("cores", "86", |_, _| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        });
        let changes = vec![slow_first, ok_change("tdp", "350")];
        let results =
            update_targets(vec![test_target("t")], changes, dir.path(), sink).await;
        assert_eq!(
            results[0].status_line,
            "configuration update complete: set tdp to 350, set cores to 86"
        );
        // outcomes stay in request order regardless
        assert_eq!(results[0].outcomes[0].name, "cores");
        assert_eq!(results[0].outcomes[1].name, "tdp");
    }
}
