//! Async repository over a document store (Core) and a blob store (overflow fragments).
//!
//! Correctness rests on storage-side optimistic concurrency: duplicate inserts
//! and stale etags surface as `Conflict`, throttling surfaces as `Throttle`, and
//! neither is retried here.

use command_history_core::{
    build_history_query, build_incomplete_exports_query, build_partially_ingested_query,
    build_replay_query, AssetGroupKey, BlobKind, BlobPayload, BlobStore, Clock,
    CommandHistoryConfig, CommandHistoryError, CommandHistoryRecord, CommandId, CoreDocument,
    CreatedBlob, CreatedTimeRange, DocumentStore, Etag, ExportFilter, FeatureFlagSource,
    Fragment, FragmentSet, LeaseReceipt, OperationContext, PrivacyCommand, PrivacyCommandType,
    PrivacySubject, RequesterAliasLookup, Result, StaticFeatureFlags, StatusRecord,
    StoredCoreDocument, SubjectTypeFilter, SystemClock, ENABLE_EXPORT_COMMAND_REPLAY,
};
use futures::future::try_join_all;
use time::{Date, Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// Records from one page of a scan plus the token to resume it.
pub type RecordPage = (Vec<CommandHistoryRecord>, Option<String>);

pub struct CommandHistoryRepository<D, B, F = StaticFeatureFlags, C = SystemClock> {
    documents: D,
    blobs: B,
    flags: F,
    clock: C,
    config: CommandHistoryConfig,
    aliases: Box<dyn RequesterAliasLookup>,
}

impl<D, B, F, C> CommandHistoryRepository<D, B, F, C>
where
    D: DocumentStore,
    B: BlobStore,
    F: FeatureFlagSource,
    C: Clock,
{
    /// # Errors
    /// Returns [`CommandHistoryError::Configuration`] when `config` is invalid.
    pub fn new(
        documents: D,
        blobs: B,
        flags: F,
        clock: C,
        config: CommandHistoryConfig,
    ) -> Result<Self> {
        config.validate()?;
        let aliases = Box::new(config.requester_aliases());
        Ok(Self {
            documents,
            blobs,
            flags,
            clock,
            config,
            aliases,
        })
    }

    /// Replaces the alias groups taken from configuration.
    #[must_use]
    pub fn with_requester_aliases(mut self, aliases: impl RequesterAliasLookup + 'static) -> Self {
        self.aliases = Box::new(aliases);
        self
    }

    #[must_use]
    pub fn config(&self) -> &CommandHistoryConfig {
        &self.config
    }

    #[must_use]
    pub fn documents(&self) -> &D {
        &self.documents
    }

    #[must_use]
    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    /// Point read. Returns `Ok(None)` when no Core document exists.
    ///
    /// Blob fragments named in `fragments` are read concurrently when their
    /// pointer is set; the returned record is clean and carries an operation
    /// context.
    ///
    /// # Errors
    /// [`CommandHistoryError::InvalidOperation`] for an empty fragment set,
    /// otherwise any storage error.
    pub async fn query(
        &self,
        command_id: CommandId,
        fragments: FragmentSet,
    ) -> Result<Option<CommandHistoryRecord>> {
        if fragments.is_empty() {
            return Err(CommandHistoryError::InvalidOperation(
                "cannot query command history with an empty fragment set".to_string(),
            ));
        }

        match self.documents.point_query(command_id).await? {
            Some(stored) => Ok(Some(self.hydrate(stored, fragments).await?)),
            None => {
                debug!(command_id = %command_id, "command history not found");
                Ok(None)
            }
        }
    }

    /// Subject/requester/command-type scan over the max-age window.
    ///
    /// # Errors
    /// Fails with `Throttle` once `max_query_results` Core documents match,
    /// otherwise any storage error.
    pub async fn query_by_subject(
        &self,
        subject: Option<&PrivacySubject>,
        requester: Option<&str>,
        command_types: &[PrivacyCommandType],
        oldest_created_time: OffsetDateTime,
        fragments: FragmentSet,
    ) -> Result<Vec<CommandHistoryRecord>> {
        let floor = self
            .clock
            .now_utc()
            .checked_sub(days(self.config.max_age_days_for_query))
            .unwrap_or_else(earliest_time);
        let oldest = oldest_created_time.max(floor);
        let query = build_history_query(
            subject,
            self.aliases.as_ref(),
            requester,
            command_types,
            CreatedTimeRange::since(oldest),
        );

        let mut matches = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .documents
                .max_parallelism_cross_partition_query(&query, continuation.as_deref())
                .await?;
            matches.extend(page.documents);
            if matches.len() >= self.config.max_query_results {
                warn!(
                    query = %query.text,
                    limit = self.config.max_query_results,
                    "command history query matched too many results"
                );
                return Err(CommandHistoryError::throttle(format!(
                    "too many results: at least {} command history records matched",
                    self.config.max_query_results
                )));
            }

            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }

        self.hydrate_all(matches, fragments).await
    }

    /// Creates the three fragment blobs concurrently, then the Core document.
    ///
    /// Returns `Ok(false)` when any blob create or the Core insert conflicts.
    /// Blobs created before the failure is observed are left in place. On
    /// success the record receives a fresh operation context and is clean.
    ///
    /// # Errors
    /// [`CommandHistoryError::InvalidOperation`] for a record that was already
    /// read or inserted; any non-conflict storage error is returned unchanged.
    pub async fn try_insert(&self, record: &mut CommandHistoryRecord) -> Result<bool> {
        let command_id = record.command_id();
        if record.operation_context().is_some() {
            return Err(CommandHistoryError::InvalidOperation(format!(
                "command history {command_id} already has an operation context and cannot be inserted"
            )));
        }

        let audit = BlobPayload::from_record(record, BlobKind::Audit);
        let status = BlobPayload::from_record(record, BlobKind::Status);
        let export = BlobPayload::from_record(record, BlobKind::Export);
        let (audit, status, export) = tokio::join!(
            self.blobs.create_blob(&audit),
            self.blobs.create_blob(&status),
            self.blobs.create_blob(&export),
        );

        let outcomes = [
            (BlobKind::Audit, audit),
            (BlobKind::Status, status),
            (BlobKind::Export, export),
        ];
        let mut conflicted = None;
        for (kind, outcome) in &outcomes {
            match outcome {
                Err(err) if err.is_conflict() => {
                    if conflicted.is_none() {
                        conflicted = Some(*kind);
                    }
                }
                Err(err) => {
                    warn!(
                        command_id = %command_id,
                        fragment = kind.as_str(),
                        error = %err,
                        "abandoning command history insert"
                    );
                    return Err(err.clone());
                }
                Ok(_) => {}
            }
        }
        if let Some(kind) = conflicted {
            info!(
                command_id = %command_id,
                fragment = kind.as_str(),
                "command history blob create conflicted; insert abandoned"
            );
            return Ok(false);
        }

        let mut context = OperationContext::new(command_id, FragmentSet::ALL, None);
        for (kind, outcome) in outcomes {
            if let (Ok(created), Some(slot)) = (outcome, context.slot_mut(kind.fragment())) {
                slot.pointer = Some(created.pointer);
                slot.etag = Some(created.etag);
            }
        }

        let mut document = CoreDocument::from_record(record);
        for kind in BlobKind::ALL {
            let pointer = context
                .slot(kind.fragment())
                .and_then(|slot| slot.pointer.clone());
            document.set_pointer(kind.fragment(), pointer);
        }
        document.ttl = Some(self.time_to_live(document.crt));

        match self.documents.insert(&document).await {
            Ok(etag) => {
                context.core_etag = Some(etag);
                record.set_operation_context(context);
                record.clear_dirty();
                debug!(command_id = %command_id, "inserted command history");
                Ok(true)
            }
            Err(err) if err.is_conflict() => {
                info!(command_id = %command_id, "command history already exists");
                Ok(false)
            }
            Err(err) => {
                warn!(
                    command_id = %command_id,
                    fragment = Fragment::Core.as_str(),
                    error = %err,
                    "abandoning command history insert"
                );
                Err(err)
            }
        }
    }

    /// Writes back exactly the fragments in `fragments`.
    ///
    /// The requested set must equal the record's dirty set and must have been
    /// read into the record. Blob fragments that were never created are
    /// created; the rest are replaced under their captured etag. Core is
    /// replaced when requested or when a new blob pointer has to be recorded.
    ///
    /// # Errors
    /// [`CommandHistoryError::InvalidOperation`] when the request is invalid,
    /// before any write. Storage errors (`Conflict` on a stale etag) leave the
    /// record untouched; the caller must re-query.
    pub async fn replace(
        &self,
        record: &mut CommandHistoryRecord,
        fragments: FragmentSet,
    ) -> Result<()> {
        let command_id = record.command_id();
        let changed = record.get_changed_fragments();
        let Some(context) = record.operation_context() else {
            return Err(CommandHistoryError::InvalidOperation(format!(
                "command history {command_id} has no operation context; query or insert it first"
            )));
        };
        if fragments.is_empty() {
            return Err(CommandHistoryError::InvalidOperation(
                "cannot replace command history with an empty fragment set".to_string(),
            ));
        }
        if !context.fragments_read.contains(fragments) {
            return Err(CommandHistoryError::InvalidOperation(format!(
                "cannot replace fragments {} of command history {command_id}: only {} were read",
                fragments, context.fragments_read
            )));
        }
        if changed != fragments {
            return Err(CommandHistoryError::InvalidOperation(format!(
                "cannot replace fragments {fragments} of command history {command_id}: changed fragments are {changed}"
            )));
        }

        let mut next = context.clone();
        let (audit, status, export) = tokio::join!(
            self.write_fragment(record, &next, fragments, BlobKind::Audit),
            self.write_fragment(record, &next, fragments, BlobKind::Status),
            self.write_fragment(record, &next, fragments, BlobKind::Export),
        );

        let mut pointer_created = false;
        for (kind, outcome) in [
            (BlobKind::Audit, audit),
            (BlobKind::Status, status),
            (BlobKind::Export, export),
        ] {
            let Some(written) = outcome? else {
                continue;
            };
            if let Some(slot) = next.slot_mut(kind.fragment()) {
                pointer_created |= slot.pointer.is_none();
                slot.pointer = Some(written.pointer);
                slot.etag = Some(written.etag);
            }
        }

        if fragments.has(Fragment::Core) || pointer_created {
            let etag = next.core_etag.clone().ok_or_else(|| {
                CommandHistoryError::InvalidOperation(format!(
                    "command history {command_id} has no Core etag to replace against"
                ))
            })?;
            let mut document = CoreDocument::from_record(record);
            for kind in BlobKind::ALL {
                document.set_pointer(
                    kind.fragment(),
                    next.slot(kind.fragment()).and_then(|slot| slot.pointer.clone()),
                );
            }
            document.ttl = Some(self.time_to_live(document.crt));
            next.core_etag = Some(self.documents.replace(&document, &etag).await?);
        }

        record.set_operation_context(next);
        record.clear_dirty_fragments(fragments);
        info!(
            command_id = %command_id,
            fragments = %fragments,
            pointer_created,
            "replaced command history"
        );
        Ok(())
    }

    /// True only when the receipt's (agent, asset group) has a real completion time.
    ///
    /// # Errors
    /// Any storage error.
    pub async fn query_is_complete_by_agent(&self, receipt: &LeaseReceipt) -> Result<bool> {
        let Some(record) = self
            .query(receipt.command_id, FragmentSet::CORE | FragmentSet::STATUS)
            .await?
        else {
            return Ok(false);
        };

        let key = AssetGroupKey::new(receipt.agent_id, receipt.asset_group_id);
        Ok(record
            .status_map()
            .get(&key)
            .is_some_and(StatusRecord::is_completed))
    }

    /// Rebuilds the command an agent leased, overlaid with the receipt's queue context.
    ///
    /// Export commands additionally carry the destination recorded for the
    /// receipt's (agent, asset group).
    ///
    /// # Errors
    /// A storage error of kind `Unknown` when an export that is not globally
    /// complete has no destination for the receipt; otherwise any storage or
    /// serialization error.
    pub async fn query_privacy_command(
        &self,
        receipt: &LeaseReceipt,
    ) -> Result<Option<PrivacyCommand>> {
        let is_export = receipt.command_type == PrivacyCommandType::Export;
        let fragments = if is_export {
            FragmentSet::CORE | FragmentSet::EXPORT
        } else {
            FragmentSet::CORE
        };
        let Some(record) = self.query(receipt.command_id, fragments).await? else {
            return Ok(None);
        };
        let Some(mut command) =
            PrivacyCommand::from_history(record.command_id(), record.core(), receipt)?
        else {
            return Ok(None);
        };

        if is_export {
            let key = AssetGroupKey::new(receipt.agent_id, receipt.asset_group_id);
            command.export_destination = record.export_destination_for(key).cloned();
            if command.export_destination.is_none() && !record.core().is_globally_complete {
                warn!(
                    command_id = %receipt.command_id,
                    agent_id = %receipt.agent_id,
                    asset_group_id = %receipt.asset_group_id,
                    "export destination missing for leased command"
                );
                return Err(CommandHistoryError::unknown(format!(
                    "no export destination for command {} agent {} asset group {}",
                    receipt.command_id, receipt.agent_id, receipt.asset_group_id
                )));
            }
        }

        Ok(Some(command))
    }

    /// One page of the replay window `[start, end)`, Core only.
    ///
    /// Exports are excluded unless `export_only` is set and the export replay
    /// flag is on, in which case no command type is excluded at all.
    ///
    /// # Errors
    /// Any storage error.
    pub async fn get_commands_for_replay(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        subject_filter: Option<SubjectTypeFilter>,
        export_only: bool,
        continuation: Option<&str>,
    ) -> Result<RecordPage> {
        let include_exports = export_only
            && self
                .flags
                .is_feature_flag_enabled(ENABLE_EXPORT_COMMAND_REPLAY, false)
                .await;
        let query = build_replay_query(start, end, subject_filter, include_exports);
        let page = self
            .documents
            .cross_partition_query(&query, continuation, self.config.replay_page_size)
            .await?;
        debug!(
            matched = page.documents.len(),
            include_exports,
            has_more = page.continuation.is_some(),
            "replay page read"
        );

        let records = page
            .documents
            .into_iter()
            .map(|stored| core_only(stored, FragmentSet::CORE))
            .collect();
        Ok((records, page.continuation))
    }

    /// Every export in `[start, end]` that has not completed globally, across all pages.
    ///
    /// # Errors
    /// [`CommandHistoryError::InvalidArgument`] when `start` is after `end`,
    /// otherwise any storage error.
    pub async fn query_incomplete_exports(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
        is_aad: bool,
        fragments: FragmentSet,
    ) -> Result<Vec<CommandHistoryRecord>> {
        if start > end {
            return Err(CommandHistoryError::InvalidArgument(format!(
                "incomplete export window start {start} is after end {end}"
            )));
        }

        let query = build_incomplete_exports_query(start, end, is_aad);
        let mut matches = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .documents
                .cross_partition_query(&query, continuation.as_deref(), self.config.scan_page_size)
                .await?;
            matches.extend(page.documents);
            continuation = page.continuation;
            if continuation.is_none() {
                break;
            }
        }

        self.hydrate_all(matches, fragments).await
    }

    /// One page of commands whose ingested count lags the total, with Status loaded.
    ///
    /// # Errors
    /// Any storage error.
    pub async fn query_partially_ingested_commands(
        &self,
        oldest: OffsetDateTime,
        newest: OffsetDateTime,
        max_item_count: usize,
        filter: ExportFilter,
        continuation: Option<&str>,
    ) -> Result<RecordPage> {
        let query = build_partially_ingested_query(oldest, newest, filter);
        let page = self
            .documents
            .cross_partition_query(&query, continuation, max_item_count)
            .await?;
        let records = self
            .hydrate_all(page.documents, FragmentSet::CORE | FragmentSet::STATUS)
            .await?;
        Ok((records, page.continuation))
    }

    async fn hydrate(
        &self,
        stored: StoredCoreDocument,
        fragments: FragmentSet,
    ) -> Result<CommandHistoryRecord> {
        let document = &stored.document;
        let (audit, status, export) = tokio::join!(
            self.read_fragment(document, fragments, BlobKind::Audit),
            self.read_fragment(document, fragments, BlobKind::Status),
            self.read_fragment(document, fragments, BlobKind::Export),
        );
        let (audit, status, export) = (audit?, status?, export?);

        let mut record = core_only(stored, fragments);
        let Some(mut context) = record.operation_context().cloned() else {
            return Ok(record);
        };
        if let Some((payload, etag)) = audit {
            *record.audit_map_mut() = payload.into_audit_map()?;
            context.audit.etag = Some(etag);
        }
        if let Some((payload, etag)) = status {
            *record.status_map_mut() = payload.into_status_map()?;
            context.status.etag = Some(etag);
        }
        if let Some((payload, etag)) = export {
            *record.export_destinations_mut() = payload.into_export_destinations()?;
            context.export.etag = Some(etag);
        }

        record.set_operation_context(context);
        record.clear_dirty();
        Ok(record)
    }

    async fn hydrate_all(
        &self,
        documents: Vec<StoredCoreDocument>,
        fragments: FragmentSet,
    ) -> Result<Vec<CommandHistoryRecord>> {
        try_join_all(
            documents
                .into_iter()
                .map(|stored| self.hydrate(stored, fragments)),
        )
        .await
    }

    async fn read_fragment(
        &self,
        document: &CoreDocument,
        fragments: FragmentSet,
        kind: BlobKind,
    ) -> Result<Option<(BlobPayload, Etag)>> {
        if !fragments.has(kind.fragment()) {
            return Ok(None);
        }
        match document.pointer(kind.fragment()) {
            Some(pointer) => Ok(Some(self.blobs.read_blob(pointer, kind).await?)),
            None => Ok(None),
        }
    }

    async fn write_fragment(
        &self,
        record: &CommandHistoryRecord,
        context: &OperationContext,
        fragments: FragmentSet,
        kind: BlobKind,
    ) -> Result<Option<CreatedBlob>> {
        if !fragments.has(kind.fragment()) {
            return Ok(None);
        }

        let payload = BlobPayload::from_record(record, kind);
        let slot = context.slot(kind.fragment()).cloned().unwrap_or_default();
        match (slot.pointer, slot.etag) {
            (None, _) => self.blobs.create_blob(&payload).await.map(Some),
            (Some(pointer), Some(etag)) => {
                let etag = self.blobs.replace_blob(&pointer, &payload, &etag).await?;
                Ok(Some(CreatedBlob { pointer, etag }))
            }
            (Some(pointer), None) => Err(CommandHistoryError::InvalidOperation(format!(
                "{} blob {pointer} of command history {} was never read",
                kind.as_str(),
                record.command_id()
            ))),
        }
    }

    /// Seconds from now until `created + default_time_to_live_days`, at least one.
    /// Expiry past the last representable date saturates there.
    fn time_to_live(&self, created: OffsetDateTime) -> i64 {
        let expires = created
            .checked_add(days(self.config.default_time_to_live_days))
            .unwrap_or_else(latest_time);
        (expires - self.clock.now_utc()).whole_seconds().max(1)
    }
}

/// Record holding only Core; blob slots know their pointers but nothing is loaded.
fn core_only(stored: StoredCoreDocument, fragments: FragmentSet) -> CommandHistoryRecord {
    let StoredCoreDocument { document, etag } = stored;
    let mut context = OperationContext::new(
        document.id,
        fragments | FragmentSet::CORE,
        Some(etag),
    );
    for kind in BlobKind::ALL {
        if let Some(slot) = context.slot_mut(kind.fragment()) {
            slot.pointer = document.pointer(kind.fragment()).cloned();
        }
    }

    CommandHistoryRecord::from_parts(
        document.to_core_record(),
        Default::default(),
        Default::default(),
        Default::default(),
        context,
    )
}

fn days(count: u32) -> Duration {
    Duration::days(i64::from(count))
}

fn earliest_time() -> OffsetDateTime {
    Date::MIN.midnight().assume_utc()
}

fn latest_time() -> OffsetDateTime {
    Date::MAX.midnight().assume_utc()
}
