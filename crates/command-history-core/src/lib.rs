//! Command history model shared by the repository, the storage adapters and the CLI.
//!
//! A command's history is one fixed-schema Core document plus three overflow
//! fragments (audit map, status map, export destinations) held in blob storage.
//! Every fragment tracks its own dirty bit so callers can write back exactly
//! what they changed.

use std::fmt::{Display, Formatter};

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

mod command;
mod config;
mod documents;
mod fragments;
mod ids;
mod lease;
mod query;
mod record;
mod storage;
mod subject;
mod tracked;

pub use command::PrivacyCommand;
pub use config::{CommandHistoryConfig, MAX_RETENTION_DAYS};
pub use documents::{
    AuditDocument, BlobKind, BlobPayload, CoreDocument, ExportDestinationDocument, StatusDocument,
};
pub use fragments::{Fragment, FragmentSet};
pub use ids::{AgentId, AssetGroupId, BlobPointer, CommandId, Etag};
pub use lease::LeaseReceipt;
pub use query::{
    build_history_query, build_incomplete_exports_query, build_partially_ingested_query,
    build_replay_query, ConfiguredRequesterAliases, CreatedTimeRange, ExportFilter, QueryParameter,
    QuerySpec, QueryValue, RequesterAliasLookup, SubjectTypeFilter,
};
pub use record::{
    ApplicabilityReasonCode, AssetGroupKey, AuditRecord, BlobSlot, BlobState,
    CommandHistoryRecord, CoreRecord, ExportDestination, IngestionStatus, OperationContext,
    PrivacyCommandType, QueueStorageType, StatusRecord, WeightedMoniker,
};
pub use storage::{
    BlobStore, Clock, CreatedBlob, DocumentStore, FeatureFlagSource, QueryPage, StaticFeatureFlags,
    StoredCoreDocument, SystemClock, ENABLE_EXPORT_COMMAND_REPLAY,
};
pub use subject::{PrivacySubject, SubjectType};
pub use tracked::{Tracked, TrackedList, TrackedMap};

/// Storage failure classes shared by every backing store.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// Optimistic-concurrency or duplicate-key violation.
    Conflict,
    /// The backing store rate-limited the call.
    Throttle,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Throttle => "throttle",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CommandHistoryError {
    #[error("storage error ({kind}): {message}")]
    Storage { kind: ErrorKind, message: String },
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl CommandHistoryError {
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Storage {
            kind: ErrorKind::Conflict,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn throttle(message: impl Into<String>) -> Self {
        Self::Storage {
            kind: ErrorKind::Throttle,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Storage {
            kind: ErrorKind::Unknown,
            message: message.into(),
        }
    }

    /// Storage error kind, or `None` for programmer and data errors.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Storage { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.kind() == Some(ErrorKind::Conflict)
    }

    #[must_use]
    pub fn is_throttle(&self) -> bool {
        self.kind() == Some(ErrorKind::Throttle)
    }
}

pub type Result<T, E = CommandHistoryError> = std::result::Result<T, E>;

/// Parses an RFC3339 timestamp and requires a UTC offset.
///
/// # Errors
/// Returns [`CommandHistoryError::InvalidArgument`] when parsing fails or
/// the timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).map_err(|err| {
        CommandHistoryError::InvalidArgument(format!("invalid RFC3339 timestamp `{value}`: {err}"))
    })?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CommandHistoryError::InvalidArgument(format!(
            "timestamp MUST be UTC (offset Z): {value}"
        )));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339.
///
/// # Errors
/// Returns [`CommandHistoryError::Serialization`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&Rfc3339)
        .map_err(|err| CommandHistoryError::Serialization(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// True for the zero-valued timestamp some writers persist instead of null.
#[must_use]
pub fn is_default_timestamp(value: OffsetDateTime) -> bool {
    value.year() <= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn parse_rfc3339_rejects_non_utc_offsets() {
        let err = match parse_rfc3339_utc("2026-02-07T12:00:00+02:00") {
            Ok(_) => panic!("expected non-UTC timestamp to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("MUST be UTC"));
    }

    #[test]
    fn rfc3339_formatting_round_trips() {
        let parsed = must(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }

    #[test]
    fn default_timestamp_detection_only_matches_year_one() {
        let zero = must(parse_rfc3339_utc("0001-01-01T00:00:00Z"));
        let real = must(parse_rfc3339_utc("2019-01-01T00:00:00Z"));
        assert!(is_default_timestamp(zero));
        assert!(!is_default_timestamp(real));
    }

    #[test]
    fn error_kind_is_exposed_only_for_storage_errors() {
        assert!(CommandHistoryError::conflict("dup").is_conflict());
        assert!(CommandHistoryError::throttle("busy").is_throttle());
        assert_eq!(
            CommandHistoryError::InvalidOperation("nope".to_string()).kind(),
            None
        );
        assert_eq!(
            CommandHistoryError::unknown("boom").to_string(),
            "storage error (unknown): boom"
        );
    }
}
