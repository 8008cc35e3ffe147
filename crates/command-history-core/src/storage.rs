//! Narrow seams onto the backing stores and the ambient collaborators.
//!
//! Adapters map their native failures onto [`crate::ErrorKind`] before
//! returning, so the repository only ever sees `CommandHistoryError::Storage`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::documents::{BlobKind, BlobPayload, CoreDocument};
use crate::ids::{BlobPointer, CommandId, Etag};
use crate::query::QuerySpec;
use crate::Result;

pub const ENABLE_EXPORT_COMMAND_REPLAY: &str = "PCF.EnableExportCommandReplay";

#[derive(Debug, Clone, PartialEq)]
pub struct StoredCoreDocument {
    pub document: CoreDocument,
    pub etag: Etag,
}

/// One page of a cross-partition scan. `continuation` is `None` on the last page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPage {
    pub documents: Vec<StoredCoreDocument>,
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedBlob {
    pub pointer: BlobPointer,
    pub etag: Etag,
}

#[allow(clippy::missing_errors_doc)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn point_query(&self, command_id: CommandId) -> Result<Option<StoredCoreDocument>>;

    /// Fails with `Conflict` when a document with the same id exists.
    async fn insert(&self, document: &CoreDocument) -> Result<Etag>;

    /// Fails with `Conflict` when the stored etag differs from `etag`.
    async fn replace(&self, document: &CoreDocument, etag: &Etag) -> Result<Etag>;

    async fn cross_partition_query(
        &self,
        query: &QuerySpec,
        continuation: Option<&str>,
        max_item_count: usize,
    ) -> Result<QueryPage>;

    /// Same scan as [`DocumentStore::cross_partition_query`] with the page
    /// size left to the store.
    async fn max_parallelism_cross_partition_query(
        &self,
        query: &QuerySpec,
        continuation: Option<&str>,
    ) -> Result<QueryPage>;
}

#[allow(clippy::missing_errors_doc)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn create_blob(&self, payload: &BlobPayload) -> Result<CreatedBlob>;

    async fn read_blob(&self, pointer: &BlobPointer, kind: BlobKind) -> Result<(BlobPayload, Etag)>;

    /// Fails with `Conflict` when the stored etag differs from `etag`.
    async fn replace_blob(
        &self,
        pointer: &BlobPointer,
        payload: &BlobPayload,
        etag: &Etag,
    ) -> Result<Etag>;
}

#[async_trait]
pub trait FeatureFlagSource: Send + Sync {
    async fn is_feature_flag_enabled(&self, name: &str, default: bool) -> bool;
}

/// Flags fixed at construction, typically from [`crate::CommandHistoryConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticFeatureFlags {
    flags: BTreeMap<String, bool>,
}

impl StaticFeatureFlags {
    #[must_use]
    pub fn new(flags: BTreeMap<String, bool>) -> Self {
        Self { flags }
    }

    #[must_use]
    pub fn with_flag(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.flags.insert(name.into(), enabled);
        self
    }
}

#[async_trait]
impl FeatureFlagSource for StaticFeatureFlags {
    async fn is_feature_flag_enabled(&self, name: &str, default: bool) -> bool {
        self.flags.get(name).copied().unwrap_or(default)
    }
}

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        crate::now_utc()
    }
}
