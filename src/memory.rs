//! In-memory downstream collaborators.
//!
//! Thread-safe reference implementations of the downstream traits, intended
//! for embedded usage and tests. Production deployments supply their own
//! implementations over a real store and message transport.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crate::error::DispatchError;
use crate::impact::{Dependent, DependencyLookup, ImpactNotification, Notifier};
use crate::merge::GoldenRecord;
use crate::pipeline::GoldenRecordSink;

fn lock_err(context: &'static str) -> DispatchError {
    DispatchError::DeliveryFailed {
        message: format!("poisoned lock: {context}"),
    }
}

/// In-memory dependency index: source record id → dependent artifacts.
#[derive(Debug, Default)]
pub struct InMemoryDependencyIndex {
    deps: RwLock<HashMap<String, Vec<Dependent>>>,
}

impl InMemoryDependencyIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `artifact_id` as depending on `source_record_id`.
    pub fn register(
        &self,
        source_record_id: impl Into<String>,
        artifact_id: impl Into<String>,
        kind: impl Into<String>,
    ) {
        let mut deps = self.deps.write().unwrap_or_else(|e| e.into_inner());
        deps.entry(source_record_id.into())
            .or_default()
            .push(Dependent {
                artifact_id: artifact_id.into(),
                kind: kind.into(),
            });
    }
}

impl DependencyLookup for InMemoryDependencyIndex {
    fn dependents_of(
        &self,
        source_record_id: &str,
        _timeout: Duration,
    ) -> Result<Vec<Dependent>, DispatchError> {
        let deps = self
            .deps
            .read()
            .map_err(|_| lock_err("dependency_index"))?;
        Ok(deps.get(source_record_id).cloned().unwrap_or_default())
    }
}

/// Notifier that records every delivered notification.
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    delivered: Mutex<Vec<ImpactNotification>>,
}

impl CollectingNotifier {
    /// Creates an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything delivered so far.
    #[must_use]
    pub fn delivered(&self) -> Vec<ImpactNotification> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Notifier for CollectingNotifier {
    fn notify(
        &self,
        notification: &ImpactNotification,
        _timeout: Duration,
    ) -> Result<(), DispatchError> {
        self.delivered
            .lock()
            .map_err(|_| lock_err("collecting_notifier"))?
            .push(notification.clone());
        Ok(())
    }
}

/// Golden-record sink that keeps published batches in memory.
#[derive(Debug, Default)]
pub struct InMemoryGoldenSink {
    batches: RwLock<Vec<Vec<GoldenRecord>>>,
}

impl InMemoryGoldenSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every batch published so far.
    #[must_use]
    pub fn published(&self) -> Vec<Vec<GoldenRecord>> {
        self.batches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// All golden records across published batches.
    #[must_use]
    pub fn all_records(&self) -> Vec<GoldenRecord> {
        self.published().into_iter().flatten().collect()
    }
}

impl GoldenRecordSink for InMemoryGoldenSink {
    fn publish(&self, records: &[GoldenRecord]) -> Result<(), DispatchError> {
        self.batches
            .write()
            .map_err(|_| lock_err("golden_sink"))?
            .push(records.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::GoldenId;

    #[test]
    fn test_dependency_index_register_and_lookup() {
        let index = InMemoryDependencyIndex::new();
        index.register("src_1", "kpi_a", "kpi_value");
        index.register("src_1", "kpi_b", "kpi_value");

        let deps = index
            .dependents_of("src_1", Duration::from_millis(10))
            .unwrap();
        assert_eq!(deps.len(), 2);

        let none = index
            .dependents_of("unknown", Duration::from_millis(10))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_collecting_notifier_records_deliveries() {
        let notifier = CollectingNotifier::new();
        let ids = vec!["a".to_string(), "b".to_string()];
        let notification = ImpactNotification {
            impacted_id: "kpi_a".to_string(),
            kind: "kpi_value".to_string(),
            reason: crate::impact::MERGE_REASON.to_string(),
            golden_record_id: GoldenId::from_members(ids.iter()),
            merged_source_ids: ids,
        };
        notifier
            .notify(&notification, Duration::from_millis(10))
            .unwrap();
        assert_eq!(notifier.delivered(), vec![notification]);
    }
}
