//! Retroactive fix engine.
//!
//! A merge event changes which source records count as the same entity, so
//! anything computed from the absorbed records is stale. This module looks
//! up registered dependents per merged source id and dispatches one
//! notification per impacted artifact to an external recalculation service.
//! It triggers recomputation; it never recomputes anything itself.
//!
//! Dispatch is concurrent with per-target fault isolation: one dependent's
//! failure never blocks the others, failures are retried with bounded
//! exponential backoff, and exhausted targets are reported, not dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AurumError, AurumResult, DispatchError, ValidationError};
use crate::record::GoldenId;

/// Reason attached to every merge-triggered recalculation.
pub const MERGE_REASON: &str = "entity_resolution_merge";

/// A downstream artifact registered as depending on a source record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependent {
    /// Identifier of the dependent artifact (e.g. a materialized KPI).
    pub artifact_id: String,

    /// Artifact kind (e.g. "kpi_value").
    pub kind: String,
}

/// A downstream artifact that must be recalculated after a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactResult {
    /// Identifier of the impacted artifact.
    pub impacted_id: String,

    /// Artifact kind.
    pub kind: String,

    /// Always [`MERGE_REASON`] for merge-triggered recalculation.
    pub reason: String,
}

/// Message-per-artifact payload handed to the [`Notifier`].
///
/// Carries enough context for the consumer to act idempotently; no wire
/// format is mandated beyond serde serializability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactNotification {
    /// Identifier of the impacted artifact.
    pub impacted_id: String,

    /// Artifact kind.
    pub kind: String,

    /// Always [`MERGE_REASON`].
    pub reason: String,

    /// The golden record the sources merged into.
    pub golden_record_id: GoldenId,

    /// All source record ids absorbed by the merge, sorted.
    pub merged_source_ids: Vec<String>,
}

impl ImpactNotification {
    /// The impact this notification announces.
    #[must_use]
    pub fn impact(&self) -> ImpactResult {
        ImpactResult {
            impacted_id: self.impacted_id.clone(),
            kind: self.kind.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Lookup of downstream artifacts depending on a source record.
///
/// Implementations must bound the call by `timeout`; the engine never
/// waits indefinitely on a collaborator.
pub trait DependencyLookup: Send + Sync {
    /// Returns the artifacts registered as depending on `source_record_id`.
    fn dependents_of(
        &self,
        source_record_id: &str,
        timeout: Duration,
    ) -> Result<Vec<Dependent>, DispatchError>;
}

/// Transport used to deliver one notification per impacted artifact.
///
/// Implementations must bound the call by `timeout`.
pub trait Notifier: Send + Sync {
    /// Delivers a single notification.
    fn notify(
        &self,
        notification: &ImpactNotification,
        timeout: Duration,
    ) -> Result<(), DispatchError>;
}

/// Cooperative cancellation flag for an in-flight batch.
///
/// Cancellation stops new dispatches from starting; already-dispatched
/// notifications run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Retry, timeout, and concurrency budget for downstream dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-call timeout handed to collaborators.
    pub timeout: Duration,

    /// Attempts per target, including the first. Must be at least 1.
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles per retry.
    pub initial_backoff: Duration,

    /// Worker threads for concurrent dispatch.
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            workers: 4,
        }
    }
}

impl DispatchConfig {
    /// Fail-fast validation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::ZeroDispatchAttempts);
        }
        Ok(())
    }
}

/// A dependent-lookup that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedLookup {
    /// Source record whose dependents could not be looked up.
    pub source_record_id: String,

    /// Final error, rendered for the operator report.
    pub reason: String,

    /// Attempts made before giving up.
    pub attempts: u32,
}

/// A notification that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDispatch {
    /// Target artifact that was never successfully notified.
    pub impacted_id: String,

    /// Final error, rendered for the operator report.
    pub reason: String,

    /// Attempts made before giving up.
    pub attempts: u32,
}

/// Outcome of one retroactive-fix run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchReport {
    /// Successfully notified impacts, sorted by impacted id.
    pub sent: Vec<ImpactResult>,

    /// Targets that exhausted their retry budget, sorted by impacted id.
    pub failed: Vec<FailedDispatch>,

    /// Source ids whose dependent lookup failed.
    pub failed_lookups: Vec<FailedLookup>,

    /// Targets skipped because the batch was cancelled first.
    pub cancelled: usize,
}

enum DispatchOutcome {
    Sent(ImpactResult),
    Failed(FailedDispatch),
    Cancelled,
}

fn retry_backoff<T>(
    cfg: &DispatchConfig,
    mut op: impl FnMut() -> Result<T, DispatchError>,
) -> Result<T, (DispatchError, u32)> {
    let mut backoff = cfg.initial_backoff;
    let mut attempt = 1u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                let retryable = AurumError::from(err.clone()).is_retryable();
                if attempt >= cfg.max_attempts || !retryable {
                    return Err((err, attempt));
                }
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

/// Finds and triggers recalculation of artifacts invalidated by a merge.
pub struct RetroactiveFixEngine {
    lookup: Arc<dyn DependencyLookup>,
    notifier: Arc<dyn Notifier>,
    config: DispatchConfig,
}

impl RetroactiveFixEngine {
    /// Creates an engine over the given collaborators.
    #[must_use]
    pub fn new(
        lookup: Arc<dyn DependencyLookup>,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            lookup,
            notifier,
            config,
        }
    }

    /// Runs the fix for one merge event.
    ///
    /// Re-running with the same `(golden_record_id, merged_source_ids)`
    /// produces the same impact set: dependents are deduplicated by
    /// impacted id before dispatch, so a consumer that also dedupes sees
    /// no duplicate side effects.
    ///
    /// # Errors
    ///
    /// Only configuration problems abort; lookup and delivery failures are
    /// reported in the [`DispatchReport`].
    pub fn run(
        &self,
        golden_record_id: GoldenId,
        merged_source_ids: &[String],
        cancel: &CancelToken,
    ) -> AurumResult<DispatchReport> {
        self.config.validate()?;

        let mut sorted_sources: Vec<String> = merged_source_ids.to_vec();
        sorted_sources.sort_unstable();
        sorted_sources.dedup();

        let mut report = DispatchReport::default();

        // Dedupe by impacted id across all merged sources; a KPI depending
        // on two absorbed records is still recalculated once.
        let mut targets: std::collections::BTreeMap<String, Dependent> =
            std::collections::BTreeMap::new();
        for source_id in &sorted_sources {
            match retry_backoff(&self.config, || {
                self.lookup.dependents_of(source_id, self.config.timeout)
            }) {
                Ok(dependents) => {
                    for dependent in dependents {
                        targets
                            .entry(dependent.artifact_id.clone())
                            .or_insert(dependent);
                    }
                }
                Err((err, attempts)) => {
                    warn!(
                        source_record_id = %source_id,
                        error = %err,
                        attempts,
                        "dependent lookup failed"
                    );
                    report.failed_lookups.push(FailedLookup {
                        source_record_id: source_id.clone(),
                        reason: err.to_string(),
                        attempts,
                    });
                }
            }
        }

        let notifications: Vec<ImpactNotification> = targets
            .into_values()
            .map(|dependent| ImpactNotification {
                impacted_id: dependent.artifact_id,
                kind: dependent.kind,
                reason: MERGE_REASON.to_string(),
                golden_record_id,
                merged_source_ids: sorted_sources.clone(),
            })
            .collect();

        let outcomes = self.dispatch_all(notifications, cancel);
        for outcome in outcomes {
            match outcome {
                DispatchOutcome::Sent(impact) => report.sent.push(impact),
                DispatchOutcome::Failed(failure) => report.failed.push(failure),
                DispatchOutcome::Cancelled => report.cancelled += 1,
            }
        }

        report.sent.sort_by(|a, b| a.impacted_id.cmp(&b.impacted_id));
        report
            .failed
            .sort_by(|a, b| a.impacted_id.cmp(&b.impacted_id));

        debug!(
            golden_record_id = %golden_record_id,
            sent = report.sent.len(),
            failed = report.failed.len(),
            failed_lookups = report.failed_lookups.len(),
            cancelled = report.cancelled,
            "retroactive fix complete"
        );

        Ok(report)
    }

    fn dispatch_one(&self, notification: &ImpactNotification) -> DispatchOutcome {
        match retry_backoff(&self.config, || {
            self.notifier.notify(notification, self.config.timeout)
        }) {
            Ok(()) => DispatchOutcome::Sent(notification.impact()),
            Err((err, attempts)) => {
                warn!(
                    impacted_id = %notification.impacted_id,
                    error = %err,
                    attempts,
                    "notification dispatch failed"
                );
                DispatchOutcome::Failed(FailedDispatch {
                    impacted_id: notification.impacted_id.clone(),
                    reason: err.to_string(),
                    attempts,
                })
            }
        }
    }

    fn dispatch_all(
        &self,
        notifications: Vec<ImpactNotification>,
        cancel: &CancelToken,
    ) -> Vec<DispatchOutcome> {
        if notifications.is_empty() {
            return Vec::new();
        }

        let workers = self.config.workers.max(1).min(notifications.len());
        if workers <= 1 {
            return notifications
                .iter()
                .map(|n| {
                    if cancel.is_cancelled() {
                        DispatchOutcome::Cancelled
                    } else {
                        self.dispatch_one(n)
                    }
                })
                .collect();
        }

        let (task_tx, task_rx) = bounded::<&ImpactNotification>(notifications.len());
        let (result_tx, result_rx) = bounded::<DispatchOutcome>(notifications.len());

        thread::scope(|scope| {
            for i in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                thread::Builder::new()
                    .name(format!("aurum-dispatch-{i}"))
                    .spawn_scoped(scope, move || {
                        while let Ok(notification) = task_rx.recv() {
                            // Cancellation gates the *start* of a dispatch;
                            // in-flight deliveries always complete.
                            let outcome = if cancel.is_cancelled() {
                                DispatchOutcome::Cancelled
                            } else {
                                self.dispatch_one(notification)
                            };
                            let _ = result_tx.send(outcome);
                        }
                    })
                    .expect("failed to spawn aurum dispatch worker");
            }
            drop(result_tx);

            for notification in &notifications {
                let _ = task_tx.send(notification);
            }
            drop(task_tx);

            result_rx.iter().collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StaticLookup {
        deps: HashMap<String, Vec<Dependent>>,
    }

    impl DependencyLookup for StaticLookup {
        fn dependents_of(
            &self,
            source_record_id: &str,
            _timeout: Duration,
        ) -> Result<Vec<Dependent>, DispatchError> {
            Ok(self.deps.get(source_record_id).cloned().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        delivered: Mutex<Vec<ImpactNotification>>,
        fail_ids: Vec<String>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(
            &self,
            notification: &ImpactNotification,
            _timeout: Duration,
        ) -> Result<(), DispatchError> {
            if self.fail_ids.contains(&notification.impacted_id) {
                return Err(DispatchError::DeliveryFailed {
                    message: "synthetic failure".to_string(),
                });
            }
            self.delivered.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn dep(artifact: &str) -> Dependent {
        Dependent {
            artifact_id: artifact.to_string(),
            kind: "kpi_value".to_string(),
        }
    }

    fn engine(
        deps: HashMap<String, Vec<Dependent>>,
        fail_ids: Vec<String>,
    ) -> (RetroactiveFixEngine, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier {
            delivered: Mutex::new(Vec::new()),
            fail_ids,
        });
        let cfg = DispatchConfig {
            initial_backoff: Duration::from_millis(1),
            ..DispatchConfig::default()
        };
        let engine = RetroactiveFixEngine::new(
            Arc::new(StaticLookup { deps }),
            notifier.clone(),
            cfg,
        );
        (engine, notifier)
    }

    fn golden(ids: &[&str]) -> (GoldenId, Vec<String>) {
        let ids: Vec<String> = ids.iter().map(|s| (*s).to_string()).collect();
        (GoldenId::from_members(ids.iter()), ids)
    }

    #[test]
    fn test_merge_triggers_known_dependent() {
        let mut deps = HashMap::new();
        deps.insert(
            "user_1_crm".to_string(),
            vec![dep("kpi_customer_lifetime_value")],
        );
        let (engine, notifier) = engine(deps, Vec::new());
        let (gid, sources) = golden(&["user_1_crm", "user_1_web"]);

        let report = engine.run(gid, &sources, &CancelToken::new()).unwrap();

        assert_eq!(report.sent.len(), 1);
        assert_eq!(report.sent[0].impacted_id, "kpi_customer_lifetime_value");
        assert_eq!(report.sent[0].reason, MERGE_REASON);

        let delivered = notifier.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].golden_record_id, gid);
        assert_eq!(delivered[0].merged_source_ids, sources);
    }

    #[test]
    fn test_shared_dependent_notified_once() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), vec![dep("kpi_shared")]);
        deps.insert("b".to_string(), vec![dep("kpi_shared")]);
        let (engine, notifier) = engine(deps, Vec::new());
        let (gid, sources) = golden(&["a", "b"]);

        let report = engine.run(gid, &sources, &CancelToken::new()).unwrap();
        assert_eq!(report.sent.len(), 1);
        assert_eq!(notifier.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), vec![dep("kpi_1"), dep("kpi_2")]);
        let (engine, _) = engine(deps, Vec::new());
        let (gid, sources) = golden(&["a", "b"]);

        let first = engine.run(gid, &sources, &CancelToken::new()).unwrap();
        let second = engine.run(gid, &sources, &CancelToken::new()).unwrap();
        assert_eq!(first.sent, second.sent);
    }

    #[test]
    fn test_one_failure_does_not_block_others() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), vec![dep("kpi_bad"), dep("kpi_good")]);
        let (engine, notifier) = engine(deps, vec!["kpi_bad".to_string()]);
        let (gid, sources) = golden(&["a", "b"]);

        let report = engine.run(gid, &sources, &CancelToken::new()).unwrap();

        assert_eq!(report.sent.len(), 1);
        assert_eq!(report.sent[0].impacted_id, "kpi_good");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].impacted_id, "kpi_bad");
        assert_eq!(report.failed[0].attempts, 3);
        assert_eq!(notifier.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_lookup_failure_is_reported_not_fatal() {
        struct FailingLookup;
        impl DependencyLookup for FailingLookup {
            fn dependents_of(
                &self,
                source_record_id: &str,
                timeout: Duration,
            ) -> Result<Vec<Dependent>, DispatchError> {
                if source_record_id == "bad" {
                    Err(DispatchError::LookupTimeout {
                        source_record_id: source_record_id.to_string(),
                        duration_ms: timeout.as_millis() as u64,
                    })
                } else {
                    Ok(vec![Dependent {
                        artifact_id: "kpi_ok".to_string(),
                        kind: "kpi_value".to_string(),
                    }])
                }
            }
        }

        let notifier = Arc::new(RecordingNotifier::default());
        let cfg = DispatchConfig {
            initial_backoff: Duration::from_millis(1),
            ..DispatchConfig::default()
        };
        let engine = RetroactiveFixEngine::new(Arc::new(FailingLookup), notifier, cfg);
        let (gid, sources) = golden(&["bad", "good"]);

        let report = engine.run(gid, &sources, &CancelToken::new()).unwrap();
        assert_eq!(report.failed_lookups.len(), 1);
        assert_eq!(report.failed_lookups[0].source_record_id, "bad");
        assert_eq!(report.sent.len(), 1);
    }

    #[test]
    fn test_cancelled_run_dispatches_nothing_new() {
        let mut deps = HashMap::new();
        deps.insert("a".to_string(), vec![dep("kpi_1"), dep("kpi_2")]);
        let (engine, notifier) = engine(deps, Vec::new());
        let (gid, sources) = golden(&["a", "b"]);

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = engine.run(gid, &sources, &cancel).unwrap();

        assert!(report.sent.is_empty());
        assert_eq!(report.cancelled, 2);
        assert!(notifier.delivered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_zero_attempts_is_fatal() {
        let (engine, _) = engine(HashMap::new(), Vec::new());
        let bad = RetroactiveFixEngine {
            config: DispatchConfig {
                max_attempts: 0,
                ..DispatchConfig::default()
            },
            ..engine
        };
        let (gid, sources) = golden(&["a"]);
        let err = bad.run(gid, &sources, &CancelToken::new()).unwrap_err();
        assert!(err.is_validation());
    }
}
