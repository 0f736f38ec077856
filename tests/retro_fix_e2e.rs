use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aurum::{
    BlockingConfig, BlockingStrategy, CancelToken, DispatchConfig, DispatchError,
    ImpactNotification, InMemoryDependencyIndex, InMemoryGoldenSink, MatcherConfig, Notifier,
    PipelineConfig, ResolutionPipeline, SourceRecord,
};
use chrono::Utc;

/// Notifier that permanently rejects configured targets and counts every
/// delivery attempt.
struct FlakyNotifier {
    reject: Vec<String>,
    attempts: AtomicUsize,
    delivered: std::sync::Mutex<Vec<ImpactNotification>>,
}

impl FlakyNotifier {
    fn new(reject: &[&str]) -> Self {
        Self {
            reject: reject.iter().map(|s| (*s).to_string()).collect(),
            attempts: AtomicUsize::new(0),
            delivered: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Notifier for FlakyNotifier {
    fn notify(
        &self,
        notification: &ImpactNotification,
        _timeout: Duration,
    ) -> Result<(), DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject.contains(&notification.impacted_id) {
            return Err(DispatchError::DeliveryFailed {
                message: "endpoint rejected payload".to_string(),
            });
        }
        self.delivered.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        matcher: MatcherConfig {
            blocking: BlockingConfig {
                attribute: "email".to_string(),
                strategy: BlockingStrategy::Exact,
            },
            ..MatcherConfig::default()
        },
        dispatch: DispatchConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            ..DispatchConfig::default()
        },
    }
}

fn merge_batch() -> Vec<SourceRecord> {
    let now = Utc::now();
    vec![
        SourceRecord::new("u1_crm", "crm", "customer", now)
            .with_attr("name", "John Doe")
            .with_attr("email", "john@example.com"),
        SourceRecord::new("u1_web", "web", "customer", now)
            .with_attr("name", "Jon Doe")
            .with_attr("email", "john@example.com"),
    ]
}

#[test]
fn failing_target_does_not_block_healthy_target() {
    let lookup = Arc::new(InMemoryDependencyIndex::new());
    lookup.register("u1_crm", "kpi_broken", "kpi_value");
    lookup.register("u1_web", "kpi_healthy", "kpi_value");

    let notifier = Arc::new(FlakyNotifier::new(&["kpi_broken"]));
    let sink = Arc::new(InMemoryGoldenSink::new());
    let pipeline = ResolutionPipeline::new(lookup, notifier.clone(), sink, config());

    let summary = pipeline
        .run_batch(merge_batch(), &CancelToken::new())
        .unwrap();

    assert_eq!(summary.notifications_sent, 1);
    assert_eq!(summary.notifications_failed.len(), 1);
    assert_eq!(summary.notifications_failed[0].impacted_id, "kpi_broken");
    assert_eq!(summary.notifications_failed[0].attempts, 2);

    let delivered = notifier.delivered.lock().unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].impacted_id, "kpi_healthy");
}

#[test]
fn retries_are_bounded_then_reported() {
    let lookup = Arc::new(InMemoryDependencyIndex::new());
    lookup.register("u1_crm", "kpi_broken", "kpi_value");

    let notifier = Arc::new(FlakyNotifier::new(&["kpi_broken"]));
    let sink = Arc::new(InMemoryGoldenSink::new());
    let pipeline = ResolutionPipeline::new(lookup, notifier.clone(), sink, config());

    let summary = pipeline
        .run_batch(merge_batch(), &CancelToken::new())
        .unwrap();

    // max_attempts = 2: one initial try plus one retry, then reported.
    assert_eq!(notifier.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(summary.notifications_failed.len(), 1);
    assert!(summary.notifications_failed[0]
        .reason
        .contains("endpoint rejected payload"));
}

#[test]
fn dependents_of_both_merged_sources_are_notified() {
    let lookup = Arc::new(InMemoryDependencyIndex::new());
    lookup.register("u1_crm", "kpi_from_crm", "kpi_value");
    lookup.register("u1_web", "kpi_from_web", "kpi_value");

    let notifier = Arc::new(FlakyNotifier::new(&[]));
    let sink = Arc::new(InMemoryGoldenSink::new());
    let pipeline = ResolutionPipeline::new(lookup, notifier.clone(), sink, config());

    let summary = pipeline
        .run_batch(merge_batch(), &CancelToken::new())
        .unwrap();

    assert_eq!(summary.notifications_sent, 2);
    let delivered = notifier.delivered.lock().unwrap();
    let mut ids: Vec<&str> = delivered.iter().map(|n| n.impacted_id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["kpi_from_crm", "kpi_from_web"]);

    // Every notification carries the full merge context.
    for n in delivered.iter() {
        assert_eq!(n.reason, "entity_resolution_merge");
        assert_eq!(
            n.merged_source_ids,
            vec!["u1_crm".to_string(), "u1_web".to_string()]
        );
    }
}
