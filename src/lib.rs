//! # Aurum - Deterministic Entity Resolution
//!
//! Aurum resolves multiple, possibly inconsistent, records about the same
//! real-world entity into a single authoritative golden record, and
//! propagates the consequences of that resolution to dependent computations.
//!
//! ## Core Concepts
//!
//! - **SourceRecord**: one system's immutable view of an entity at a point in time
//! - **Cluster**: a maximal set of records transitively connected by above-threshold matches
//! - **GoldenRecord**: the merged representation, with attribute-level lineage
//! - **Retroactive Fix**: triggered recalculation of artifacts that depended on merged records
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use aurum::{
//!     CancelToken, InMemoryDependencyIndex, CollectingNotifier, InMemoryGoldenSink,
//!     PipelineConfig, ResolutionPipeline, SourceRecord,
//! };
//! use chrono::Utc;
//!
//! let lookup = Arc::new(InMemoryDependencyIndex::new());
//! let notifier = Arc::new(CollectingNotifier::new());
//! let sink = Arc::new(InMemoryGoldenSink::new());
//! let pipeline = ResolutionPipeline::new(lookup, notifier, sink, PipelineConfig::default());
//!
//! let records = vec![
//!     SourceRecord::new("cust_1", "crm", "customer", Utc::now())
//!         .with_attr("name", "John Doe")
//!         .with_attr("email", "john@example.com"),
//! ];
//! let summary = pipeline.run_batch(records, &CancelToken::new())?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod record;
pub mod value;

// Resolution stages
pub mod cluster;
pub mod matcher;
pub mod merge;

// Downstream propagation
pub mod impact;
pub mod memory;
pub mod pipeline;

// Re-export primary types at crate root for convenience
pub use cluster::{cluster_matches, Cluster};
pub use error::{AurumError, AurumResult, DataQualityError, DispatchError, ValidationError};
pub use impact::{
    CancelToken, Dependent, DependencyLookup, DispatchConfig, DispatchReport, FailedDispatch,
    FailedLookup, ImpactNotification, ImpactResult, Notifier, RetroactiveFixEngine, MERGE_REASON,
};
pub use matcher::{
    match_batch, score_pair, BlockingConfig, BlockingStrategy, MatchField, MatchOutcome,
    MatchResult, MatcherConfig, SimilarityMethod, SkippedRecord,
};
pub use memory::{CollectingNotifier, InMemoryDependencyIndex, InMemoryGoldenSink};
pub use merge::{
    merge_cluster, merge_clusters, GoldenRecord, LineageEntry, MergeOutcome, RejectedCluster,
    SurvivorshipReason,
};
pub use pipeline::{BatchSummary, GoldenRecordSink, PipelineConfig, ResolutionPipeline};
pub use record::{GoldenId, SourceRecord};
pub use value::AttributeValue;
