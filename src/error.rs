//! Error types for the refresh engine.
//!
//! All errors are represented by [`DtError`] and propagated via
//! `Result<T, DtError>` throughout the crate. Local retry is never performed
//! by the core (see `spec.md` §7) — every failure is surfaced to the caller,
//! who decides whether to retry a batch, widen a subset, or escalate.

use std::fmt;

/// Primary error type for the refresh engine.
#[derive(Debug, thiserror::Error)]
pub enum DtError {
    /// Source extraction or query rewriting failed to parse the query.
    /// No state change has occurred.
    #[error("bad query: {0}")]
    BadQuery(String),

    /// Registering this view would create a cycle in the dependency graph.
    /// No state change has occurred.
    #[error("cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// Registration of an already-registered name. No state change.
    #[error("dynamic table already exists: {0}")]
    AlreadyExists(String),

    /// Refresh or drop of an unknown view. No state change.
    #[error("dynamic table not found: {0}")]
    NotFound(String),

    /// Drop was blocked by one or more referencing views. No state change.
    #[error("cannot drop '{0}': referenced by {}", .1.join(", "))]
    HasDependents(String, Vec<String>),

    /// A DML or catalog call against the engine failed. The engine
    /// transaction has been rolled back by the time this is returned.
    #[error("engine error at {stage}: {cause}")]
    EngineError { stage: String, cause: String },

    /// Query rewriting failed after a query had already parsed cleanly
    /// (e.g. during pin application). Fatal — the refresh must not fall
    /// back to an unpinned query, since that would break snapshot
    /// isolation. No DML has been attempted.
    #[error("rewrite failed: {0}")]
    RewriteFailed(String),

    /// The metadata store itself failed (connection, transaction, or
    /// constraint violation) independent of any engine call.
    #[error("metadata store error: {0}")]
    MetadataError(String),

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DtError {
    /// Classify the error for monitoring and caller decision-making.
    pub fn kind(&self) -> DtErrorKind {
        match self {
            DtError::BadQuery(_)
            | DtError::Cycle(_)
            | DtError::AlreadyExists(_)
            | DtError::NotFound(_)
            | DtError::HasDependents(_, _) => DtErrorKind::User,

            DtError::EngineError { .. } | DtError::RewriteFailed(_) => DtErrorKind::Engine,

            DtError::MetadataError(_) => DtErrorKind::Metadata,

            DtError::Internal(_) => DtErrorKind::Internal,
        }
    }

    /// Whether this error left any state unchanged (i.e. no partial write
    /// could have occurred). Matches the "no state change" annotations in
    /// `spec.md` §7.
    pub fn is_no_op_failure(&self) -> bool {
        matches!(
            self,
            DtError::BadQuery(_)
                | DtError::Cycle(_)
                | DtError::AlreadyExists(_)
                | DtError::NotFound(_)
                | DtError::HasDependents(_, _)
                | DtError::RewriteFailed(_)
        )
    }
}

/// Classification of error kind, used by callers deciding whether to retry,
/// widen a refresh subset, or escalate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtErrorKind {
    User,
    Engine,
    Metadata,
    Internal,
}

impl fmt::Display for DtErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DtErrorKind::User => write!(f, "USER"),
            DtErrorKind::Engine => write!(f, "ENGINE"),
            DtErrorKind::Metadata => write!(f, "METADATA"),
            DtErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_errors_are_no_op_failures() {
        assert!(DtError::NotFound("x".into()).is_no_op_failure());
        assert!(DtError::Cycle(vec!["a".into(), "b".into()]).is_no_op_failure());
        assert!(!DtError::EngineError {
            stage: "insert".into(),
            cause: "boom".into()
        }
        .is_no_op_failure());
    }

    #[test]
    fn cycle_message_joins_path() {
        let err = DtError::Cycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "cycle detected: a -> b -> a");
    }

    #[test]
    fn kind_classification() {
        assert_eq!(DtError::BadQuery("x".into()).kind(), DtErrorKind::User);
        assert_eq!(
            DtError::EngineError {
                stage: "s".into(),
                cause: "c".into()
            }
            .kind(),
            DtErrorKind::Engine
        );
        assert_eq!(
            DtError::MetadataError("x".into()).kind(),
            DtErrorKind::Metadata
        );
        assert_eq!(DtError::Internal("x".into()).kind(), DtErrorKind::Internal);
    }
}
