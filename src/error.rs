//! Error types for Aurum.
//!
//! All errors are strongly typed using thiserror and follow the batch
//! taxonomy: validation errors are fatal (the pipeline is misconfigured),
//! data-quality errors exclude the offending record or cluster from the
//! batch output, and dispatch errors are transient downstream failures
//! subject to bounded retry.

use thiserror::Error;

/// Fatal configuration and invariant violations.
///
/// These indicate the pipeline is mis-wired rather than facing bad data,
/// so a batch run aborts when one is raised.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Match threshold {value} is out of range [0.0, 1.0]")]
    ThresholdOutOfRange {
        value: f64,
    },

    #[error("Matcher requires at least one scoring field")]
    NoMatchFields,

    #[error("Match field '{attribute}' has non-positive weight {weight}")]
    NonPositiveWeight {
        attribute: String,
        weight: f64,
    },

    #[error("Blocking attribute cannot be empty")]
    EmptyBlockingAttribute,

    #[error("Blocking prefix length must be at least 1")]
    ZeroPrefixLength,

    #[error("Invalid blocking extract pattern: {reason}")]
    InvalidExtractPattern {
        reason: String,
    },

    #[error("Cannot merge an empty cluster")]
    EmptyCluster,

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Dispatch retry budget must allow at least one attempt")]
    ZeroDispatchAttempts,
}

/// Data-quality problems with individual records or clusters.
///
/// These are logged and excluded from the batch output; they never abort
/// the batch.
#[derive(Debug, Clone, Error)]
pub enum DataQualityError {
    #[error("Record '{record_id}' is missing blocking attribute '{attribute}'")]
    MissingBlockingAttribute {
        record_id: String,
        attribute: String,
    },

    #[error("Record '{record_id}' produced an empty blocking key from attribute '{attribute}'")]
    EmptyBlockingKey {
        record_id: String,
        attribute: String,
    },

    #[error("Cluster mixes entity types: expected '{expected}', record '{record_id}' has '{found}'")]
    EntityTypeMismatch {
        expected: String,
        found: String,
        record_id: String,
    },
}

/// Transient failures talking to downstream collaborators.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("Dependent lookup for '{source_record_id}' timed out after {duration_ms}ms")]
    LookupTimeout {
        source_record_id: String,
        duration_ms: u64,
    },

    #[error("Notification to '{impacted_id}' timed out after {duration_ms}ms")]
    NotifyTimeout {
        impacted_id: String,
        duration_ms: u64,
    },

    #[error("Delivery failed: {message}")]
    DeliveryFailed {
        message: String,
    },

    #[error("Downstream channel disconnected: {path}")]
    Disconnected {
        path: String,
    },
}

/// Top-level error type for Aurum.
#[derive(Debug, Error)]
pub enum AurumError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Data quality error: {0}")]
    DataQuality(#[from] DataQualityError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl AurumError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a data-quality error.
    #[must_use]
    pub const fn is_data_quality(&self) -> bool {
        matches!(self, Self::DataQuality(_))
    }

    /// Returns true if this is a dispatch error.
    #[must_use]
    pub const fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            // Configuration and bad data won't change on retry.
            Self::Validation(_) | Self::DataQuality(_) => false,
            Self::Dispatch(e) => matches!(
                e,
                DispatchError::LookupTimeout { .. }
                    | DispatchError::NotifyTimeout { .. }
                    | DispatchError::DeliveryFailed { .. }
            ),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for Aurum operations.
pub type AurumResult<T> = Result<T, AurumError>;
