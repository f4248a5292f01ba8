// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the pipeline.
//!
//! Errors split into two families:
//! - **Fatal** ([`PipelineError::SourceUnavailable`], [`PipelineError::TargetUnavailable`],
//!   [`PipelineError::BatchAborted`]): unwind to the caller of the batch operation.
//! - **Recoverable** ([`CoercionError`], [`TransformError`], missing parents, cache
//!   serialization): handled at record/group granularity, skipped and counted.
//!
//! A duplicate natural key is not an error at all; it is the
//! [`LoadOutcome::SkippedDuplicate`](crate::load::LoadOutcome::SkippedDuplicate) outcome.

use thiserror::Error;

use crate::load::LoadSummary;
use crate::storage::traits::StorageError;

/// Failure to convert a source-native value into its transport form (or back).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoercionError {
    #[error("Unsupported type: {type_name}")]
    UnsupportedType { type_name: String },
    #[error("Invalid temporal value '{input}': {reason}")]
    InvalidTemporal { input: String, reason: String },
    #[error("Invalid number '{input}'")]
    InvalidNumber { input: String },
    #[error("row has {values} values for {columns} columns")]
    RowWidth { values: usize, columns: usize },
}

/// What went wrong while shaping a row or group.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformErrorKind {
    #[error(transparent)]
    Coercion(#[from] CoercionError),
    #[error("missing column '{0}'")]
    MissingColumn(String),
    #[error("missing field '{0}'")]
    MissingField(String),
    #[error("unexpected shape: {0}")]
    Shape(String),
    #[error("invalid member encoding: {0}")]
    InvalidMember(String),
}

/// A transformation failure scoped to one unit (a row, a group, a hash record).
///
/// Callers skip the unit and continue with the rest of the input.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to transform '{unit}': {kind}")]
pub struct TransformError {
    /// Identifier of the failing unit (natural key, row index, or cache key)
    pub unit: String,
    pub kind: TransformErrorKind,
}

impl TransformError {
    pub fn new(unit: impl Into<String>, kind: impl Into<TransformErrorKind>) -> Self {
        Self {
            unit: unit.into(),
            kind: kind.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    #[error("Unsupported type: {type_name}")]
    UnsupportedType { type_name: String },

    #[error(transparent)]
    Transformation(#[from] TransformError),

    #[error("Missing parent reference {collection}/{key}")]
    MissingParentReference { collection: String, key: String },

    #[error("Cache serialization failed: {0}")]
    CacheSerialization(String),

    /// Connectivity was lost mid-batch. `summary` holds whatever had
    /// accumulated before the abort.
    #[error("Batch aborted: {reason}")]
    BatchAborted {
        summary: Box<LoadSummary>,
        reason: String,
    },
}

impl PipelineError {
    /// Whether this error should stop the current batch.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable(_) | Self::TargetUnavailable(_) | Self::BatchAborted { .. }
        )
    }

    /// Partial summary carried by an aborted batch.
    #[must_use]
    pub fn partial_summary(&self) -> Option<&LoadSummary> {
        match self {
            Self::BatchAborted { summary, .. } => Some(summary),
            _ => None,
        }
    }

    pub(crate) fn target(err: StorageError) -> Self {
        Self::TargetUnavailable(err.to_string())
    }

    pub(crate) fn source(err: StorageError) -> Self {
        Self::SourceUnavailable(err.to_string())
    }
}

impl From<CoercionError> for PipelineError {
    fn from(err: CoercionError) -> Self {
        match err {
            CoercionError::UnsupportedType { type_name } => Self::UnsupportedType { type_name },
            other => Self::Transformation(TransformError::new("<value>", other)),
        }
    }
}
