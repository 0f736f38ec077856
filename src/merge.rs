//! Golden-record merge with survivorship and lineage.
//!
//! Each cluster collapses into exactly one [`GoldenRecord`]. Survivorship
//! is deterministic: members are sorted by capture timestamp descending
//! (ties broken by record id, then source system, ascending), and for every
//! attribute the first member defining it wins. The newest record wins the
//! attributes it supplies; older records fill the gaps it leaves.
//!
//! Every emitted attribute carries exactly one lineage entry naming the
//! supplying record, the value taken, and why it survived. A golden record
//! is immutable after creation: later merge events produce a new record
//! with a new id, never an in-place update.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cluster::Cluster;
use crate::error::{AurumError, AurumResult, DataQualityError, ValidationError};
use crate::record::{GoldenId, SourceRecord};
use crate::value::AttributeValue;

/// Why a lineage entry's value survived the merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurvivorshipReason {
    /// Supplied by the most recent cluster member.
    MostRecent,

    /// The most recent member left this attribute undefined; an older
    /// member filled the gap.
    GapFill,
}

/// Audit-trail entry mapping one golden attribute back to its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    /// Attribute name in the golden record.
    pub attribute: String,

    /// Record that supplied the surviving value.
    pub source_record_id: String,

    /// The value taken.
    pub value: AttributeValue,

    /// Why this value survived.
    pub reason: SurvivorshipReason,

    /// Capture timestamp of the supplying record.
    pub timestamp: DateTime<Utc>,
}

/// The single authoritative merged representation of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenRecord {
    /// Deterministic identifier derived from the member record ids.
    pub golden_id: GoldenId,

    /// Entity type shared by all cluster members.
    pub entity_type: String,

    /// Merged attribute mapping.
    pub attributes: BTreeMap<String, AttributeValue>,

    /// Union of all cluster member record ids.
    pub source_record_ids: BTreeSet<String>,

    /// One entry per attribute in `attributes`.
    pub lineage: Vec<LineageEntry>,

    /// When this golden record was produced.
    pub created_at: DateTime<Utc>,
}

impl GoldenRecord {
    /// Looks up the lineage entry for an attribute.
    #[must_use]
    pub fn lineage_for(&self, attribute: &str) -> Option<&LineageEntry> {
        self.lineage.iter().find(|e| e.attribute == attribute)
    }
}

/// A cluster excluded from the batch output, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedCluster {
    /// Member record ids of the rejected cluster.
    pub members: Vec<String>,

    /// Human-readable rejection reason.
    pub reason: String,
}

/// Output of merging a batch's clusters.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Golden records in cluster order.
    pub golden_records: Vec<GoldenRecord>,

    /// Clusters excluded for data-quality reasons.
    pub rejected: Vec<RejectedCluster>,
}

/// Survivorship sort: newest first; ties by record id, then source system,
/// both ascending. Total and deterministic.
fn survivorship_order(a: &SourceRecord, b: &SourceRecord) -> std::cmp::Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| a.record_id.cmp(&b.record_id))
        .then_with(|| a.source_system.cmp(&b.source_system))
}

/// Merges one cluster of records into a golden record.
///
/// # Errors
///
/// - [`ValidationError::EmptyCluster`]: programming error, fatal.
/// - [`DataQualityError::EntityTypeMismatch`]: members disagree on entity
///   type; the caller excludes the cluster and continues the batch.
pub fn merge_cluster(members: &[&SourceRecord]) -> AurumResult<GoldenRecord> {
    if members.is_empty() {
        return Err(ValidationError::EmptyCluster.into());
    }

    let mut ordered: Vec<&SourceRecord> = members.to_vec();
    ordered.sort_by(|a, b| survivorship_order(a, b));

    let head = ordered[0];
    for member in &ordered[1..] {
        if member.entity_type != head.entity_type {
            return Err(DataQualityError::EntityTypeMismatch {
                expected: head.entity_type.clone(),
                found: member.entity_type.clone(),
                record_id: member.record_id.clone(),
            }
            .into());
        }
    }

    // Collect every attribute name any member defines, then let the first
    // definer in survivorship order win it.
    let mut attribute_names: BTreeSet<&str> = BTreeSet::new();
    for member in &ordered {
        for (name, value) in &member.attributes {
            if !value.is_null() {
                attribute_names.insert(name.as_str());
            }
        }
    }

    let mut attributes = BTreeMap::new();
    let mut lineage = Vec::with_capacity(attribute_names.len());

    for name in attribute_names {
        for member in &ordered {
            let Some(value) = member.non_null_attr(name) else {
                continue;
            };
            let reason = if member.record_id == head.record_id
                && member.source_system == head.source_system
            {
                SurvivorshipReason::MostRecent
            } else {
                SurvivorshipReason::GapFill
            };
            attributes.insert(name.to_string(), value.clone());
            lineage.push(LineageEntry {
                attribute: name.to_string(),
                source_record_id: member.record_id.clone(),
                value: value.clone(),
                reason,
                timestamp: member.timestamp,
            });
            break;
        }
    }

    let source_record_ids: BTreeSet<String> =
        ordered.iter().map(|m| m.record_id.clone()).collect();
    let member_ids: Vec<String> = source_record_ids.iter().cloned().collect();

    Ok(GoldenRecord {
        golden_id: GoldenId::from_members(member_ids.iter()),
        entity_type: head.entity_type.clone(),
        attributes,
        source_record_ids,
        lineage,
        created_at: Utc::now(),
    })
}

fn resolve_members<'a>(
    cluster: &Cluster,
    records_by_id: &HashMap<&str, &'a SourceRecord>,
) -> AurumResult<Vec<&'a SourceRecord>> {
    cluster
        .members
        .iter()
        .map(|id| {
            records_by_id.get(id.as_str()).copied().ok_or_else(|| {
                AurumError::internal(format!("cluster references unknown record '{id}'"))
            })
        })
        .collect()
}

/// Merges every cluster of a batch, in parallel across clusters.
///
/// Merging is independent per cluster but sequential within one (the
/// sort-and-fill algorithm is inherently ordered). Data-quality rejections
/// are collected and logged; validation and internal errors abort.
pub fn merge_clusters(
    clusters: &[Cluster],
    records: &[SourceRecord],
    workers: usize,
) -> AurumResult<MergeOutcome> {
    let mut records_by_id: HashMap<&str, &SourceRecord> = HashMap::with_capacity(records.len());
    for record in records {
        records_by_id.insert(record.record_id.as_str(), record);
    }

    let member_sets: Vec<Vec<&SourceRecord>> = clusters
        .iter()
        .map(|cluster| resolve_members(cluster, &records_by_id))
        .collect::<AurumResult<_>>()?;

    let workers = workers.max(1).min(member_sets.len().max(1));
    let results: Vec<(usize, AurumResult<GoldenRecord>)> = if workers <= 1 {
        member_sets
            .iter()
            .enumerate()
            .map(|(i, members)| (i, merge_cluster(members)))
            .collect()
    } else {
        let (task_tx, task_rx) = bounded::<(usize, &Vec<&SourceRecord>)>(member_sets.len());
        let (result_tx, result_rx) =
            bounded::<(usize, AurumResult<GoldenRecord>)>(member_sets.len());

        thread::scope(|scope| {
            for i in 0..workers {
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                thread::Builder::new()
                    .name(format!("aurum-merge-{i}"))
                    .spawn_scoped(scope, move || {
                        while let Ok((idx, members)) = task_rx.recv() {
                            let _ = result_tx.send((idx, merge_cluster(members)));
                        }
                    })
                    .expect("failed to spawn aurum merge worker");
            }
            drop(result_tx);

            for task in member_sets.iter().enumerate() {
                let _ = task_tx.send(task);
            }
            drop(task_tx);

            result_rx.iter().collect()
        })
    };

    let mut indexed: Vec<(usize, AurumResult<GoldenRecord>)> = results;
    indexed.sort_by_key(|(i, _)| *i);

    let mut outcome = MergeOutcome::default();
    for (idx, result) in indexed {
        match result {
            Ok(golden) => outcome.golden_records.push(golden),
            Err(AurumError::DataQuality(err)) => {
                warn!(cluster = idx, error = %err, "cluster rejected during merge");
                outcome.rejected.push(RejectedCluster {
                    members: clusters[idx].members.clone(),
                    reason: err.to_string(),
                });
            }
            Err(fatal) => return Err(fatal),
        }
    }

    Ok(outcome)
}
