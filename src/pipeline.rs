//! Batch orchestration: match → cluster → merge → publish → retroactive fix.
//!
//! The pipeline is a batch job, not a request/response service. Each run
//! owns its match set, cluster set, and golden-record set; nothing carries
//! over between batches. Collaborators sit behind traits so the core never
//! depends on a concrete store or transport.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AurumResult, DispatchError};
use crate::cluster::cluster_matches;
use crate::impact::{
    CancelToken, DependencyLookup, DispatchConfig, FailedDispatch, FailedLookup, Notifier,
    RetroactiveFixEngine,
};
use crate::matcher::{match_batch, MatcherConfig, SkippedRecord};
use crate::merge::{merge_clusters, GoldenRecord, RejectedCluster};
use crate::record::SourceRecord;

/// Publication boundary for the golden-record set.
///
/// The downstream store/API is owned by an external service; this trait
/// defines only the payload handoff.
pub trait GoldenRecordSink: Send + Sync {
    /// Publishes one batch's complete golden-record set.
    fn publish(&self, records: &[GoldenRecord]) -> Result<(), DispatchError>;
}

/// Full pipeline configuration.
///
/// Merge parallelism reuses the matcher's worker budget; both stages are
/// compute-bound over the same batch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Blocking, scoring, and threshold configuration.
    pub matcher: MatcherConfig,

    /// Downstream retry/timeout budget.
    pub dispatch: DispatchConfig,
}

impl PipelineConfig {
    /// Fail-fast validation; a misconfigured pipeline aborts the batch.
    pub fn validate(&self) -> AurumResult<()> {
        self.matcher.validate()?;
        self.dispatch.validate()?;
        Ok(())
    }
}

/// Operator-facing report for one batch run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Total records received.
    pub records_processed: usize,

    /// Distinct entity types in the batch.
    pub entity_types: usize,

    /// Records excluded for data-quality reasons, with reasons.
    pub records_skipped: Vec<SkippedRecord>,

    /// Clusters formed across all entity types.
    pub clusters_formed: usize,

    /// Golden records produced.
    pub golden_records_produced: usize,

    /// Clusters rejected during merge, with reasons.
    pub rejected_clusters: Vec<RejectedCluster>,

    /// Impact notifications delivered.
    pub notifications_sent: usize,

    /// Notifications that exhausted their retry budget.
    pub notifications_failed: Vec<FailedDispatch>,

    /// Dependent lookups that exhausted their retry budget.
    pub failed_lookups: Vec<FailedLookup>,

    /// Notifications skipped because the run was cancelled.
    pub notifications_cancelled: usize,

    /// Whether the golden-record set was published.
    pub published: bool,
}

/// The entity-resolution batch pipeline.
pub struct ResolutionPipeline {
    sink: Arc<dyn GoldenRecordSink>,
    fix: RetroactiveFixEngine,
    config: PipelineConfig,
}

impl ResolutionPipeline {
    /// Creates a pipeline over the given collaborators.
    #[must_use]
    pub fn new(
        lookup: Arc<dyn DependencyLookup>,
        notifier: Arc<dyn Notifier>,
        sink: Arc<dyn GoldenRecordSink>,
        config: PipelineConfig,
    ) -> Self {
        let fix = RetroactiveFixEngine::new(lookup, notifier, config.dispatch.clone());
        Self { sink, fix, config }
    }

    /// Runs one batch end to end.
    ///
    /// Records are grouped by `entity_type`; matching never crosses types.
    /// The golden-record set is published in full after every cluster has
    /// merged; a cancelled run publishes nothing rather than a partial
    /// set, and stops issuing new notifications while letting in-flight
    /// dispatches complete.
    ///
    /// # Errors
    ///
    /// Configuration and invariant violations abort the run; data-quality
    /// problems and downstream failures are reported in the summary.
    pub fn run_batch(
        &self,
        records: Vec<SourceRecord>,
        cancel: &CancelToken,
    ) -> AurumResult<BatchSummary> {
        self.config.validate()?;

        let mut summary = BatchSummary {
            records_processed: records.len(),
            ..BatchSummary::default()
        };

        let mut groups: BTreeMap<String, Vec<SourceRecord>> = BTreeMap::new();
        for record in records {
            groups
                .entry(record.entity_type.clone())
                .or_default()
                .push(record);
        }
        summary.entity_types = groups.len();

        let mut golden_records: Vec<GoldenRecord> = Vec::new();

        for (entity_type, group) in &groups {
            let outcome = match_batch(group, &self.config.matcher)?;

            let skipped_ids: std::collections::BTreeSet<&str> = outcome
                .skipped
                .iter()
                .map(|s| s.record_id.as_str())
                .collect();
            summary.records_skipped.extend(outcome.skipped.clone());

            // Excluded records take no part in the batch output.
            let eligible_ids: Vec<String> = group
                .iter()
                .filter(|r| !skipped_ids.contains(r.record_id.as_str()))
                .map(|r| r.record_id.clone())
                .collect();

            let clusters = cluster_matches(&eligible_ids, &outcome.matches);
            summary.clusters_formed += clusters.len();

            let merged = merge_clusters(&clusters, group, self.config.matcher.workers)?;
            summary.rejected_clusters.extend(merged.rejected);

            info!(
                entity_type = %entity_type,
                records = group.len(),
                matches = outcome.matches.len(),
                clusters = clusters.len(),
                golden_records = merged.golden_records.len(),
                "entity type resolved"
            );

            golden_records.extend(merged.golden_records);
        }

        summary.golden_records_produced = golden_records.len();

        if cancel.is_cancelled() {
            warn!("batch cancelled before publication; golden records withheld");
            return Ok(summary);
        }

        if !golden_records.is_empty() {
            self.sink.publish(&golden_records)?;
        }
        summary.published = true;

        for golden in &golden_records {
            // A singleton changes no identity; nothing downstream is stale.
            if golden.source_record_ids.len() < 2 {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }
            let merged_ids: Vec<String> = golden.source_record_ids.iter().cloned().collect();
            let report = self.fix.run(golden.golden_id, &merged_ids, cancel)?;
            summary.notifications_sent += report.sent.len();
            summary.notifications_failed.extend(report.failed);
            summary.failed_lookups.extend(report.failed_lookups);
            summary.notifications_cancelled += report.cancelled;
        }

        info!(
            records = summary.records_processed,
            golden_records = summary.golden_records_produced,
            skipped = summary.records_skipped.len(),
            notifications_sent = summary.notifications_sent,
            notifications_failed = summary.notifications_failed.len(),
            "batch complete"
        );

        Ok(summary)
    }
}
