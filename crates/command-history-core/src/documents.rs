//! Persisted shapes of the Core document and the three blob payloads.
//!
//! The Core document uses the short field names the query builder filters on
//! (`ct`, `s`, `crt`, `c`, ...). Blob payloads are plain JSON arrays.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::fragments::Fragment;
use crate::ids::{AgentId, AssetGroupId, BlobPointer, CommandId};
use crate::record::{
    ApplicabilityReasonCode, AssetGroupKey, AuditRecord, CommandHistoryRecord, CoreRecord,
    ExportDestination, IngestionStatus, PrivacyCommandType, QueueStorageType, StatusRecord,
    WeightedMoniker,
};
use crate::subject::PrivacySubject;
use crate::tracked::{TrackedList, TrackedMap};
use crate::{CommandHistoryError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreDocument {
    pub id: CommandId,
    pub ct: PrivacyCommandType,
    #[serde(default)]
    pub s: Option<PrivacySubject>,
    #[serde(default)]
    pub r: Option<String>,
    #[serde(default)]
    pub ctx: Option<String>,
    #[serde(with = "time::serde::timestamp")]
    pub crt: OffsetDateTime,
    #[serde(default)]
    pub c: bool,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub cpt: Option<OffsetDateTime>,
    #[serde(default)]
    pub tcc: Option<i64>,
    #[serde(default)]
    pub ccc: Option<i64>,
    #[serde(default)]
    pub icc: Option<i64>,
    #[serde(default)]
    pub idsv: Option<i64>,
    #[serde(default)]
    pub iav: Option<String>,
    #[serde(default)]
    pub wml: Vec<WeightedMoniker>,
    #[serde(default)]
    pub qst: QueueStorageType,
    #[serde(default)]
    pub pxs: Option<String>,
    #[serde(default)]
    pub fedu: Option<String>,
    #[serde(default)]
    pub syn: bool,
    #[serde(default)]
    pub abp: Option<BlobPointer>,
    #[serde(default)]
    pub sbp: Option<BlobPointer>,
    #[serde(default)]
    pub ebp: Option<BlobPointer>,
    /// Seconds until the store may expire the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl CoreDocument {
    /// Snapshot of the record's Core fields plus whatever pointers its context holds.
    #[must_use]
    pub fn from_record(record: &CommandHistoryRecord) -> Self {
        let core = record.core();
        let pointer = |fragment: Fragment| {
            record
                .operation_context()
                .and_then(|context| context.slot(fragment))
                .and_then(|slot| slot.pointer.clone())
        };

        Self {
            id: record.command_id(),
            ct: core.command_type,
            s: core.subject.clone(),
            r: core.requester.clone(),
            ctx: core.context.clone(),
            crt: core.created_time,
            c: core.is_globally_complete,
            cpt: core.completed_time,
            tcc: core.total_command_count,
            ccc: core.completed_command_count,
            icc: core.ingested_command_count,
            idsv: core.ingestion_data_set_version,
            iav: core.ingestion_assembly_version.clone(),
            wml: core.weighted_moniker_list.clone(),
            qst: core.queue_storage_type,
            pxs: core.raw_pxs_command.clone(),
            fedu: core.final_export_destination_uri.clone(),
            syn: core.is_synthetic,
            abp: pointer(Fragment::Audit),
            sbp: pointer(Fragment::Status),
            ebp: pointer(Fragment::Export),
            ttl: None,
        }
    }

    #[must_use]
    pub fn to_core_record(&self) -> CoreRecord {
        CoreRecord {
            command_type: self.ct,
            subject: self.s.clone(),
            requester: self.r.clone(),
            context: self.ctx.clone(),
            created_time: self.crt,
            is_globally_complete: self.c,
            completed_time: self.cpt,
            total_command_count: self.tcc,
            completed_command_count: self.ccc,
            ingested_command_count: self.icc,
            ingestion_data_set_version: self.idsv,
            ingestion_assembly_version: self.iav.clone(),
            weighted_moniker_list: self.wml.clone(),
            queue_storage_type: self.qst,
            raw_pxs_command: self.pxs.clone(),
            final_export_destination_uri: self.fedu.clone(),
            is_synthetic: self.syn,
        }
    }

    /// Pointer stored for a blob-backed fragment; always `None` for Core.
    #[must_use]
    pub fn pointer(&self, fragment: Fragment) -> Option<&BlobPointer> {
        match fragment {
            Fragment::Core => None,
            Fragment::Audit => self.abp.as_ref(),
            Fragment::Status => self.sbp.as_ref(),
            Fragment::Export => self.ebp.as_ref(),
        }
    }

    pub fn set_pointer(&mut self, fragment: Fragment, pointer: Option<BlobPointer>) {
        match fragment {
            Fragment::Core => {}
            Fragment::Audit => self.abp = pointer,
            Fragment::Status => self.sbp = pointer,
            Fragment::Export => self.ebp = pointer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuditDocument {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    #[serde(default)]
    pub applicability_reason_code: ApplicabilityReasonCode,
    #[serde(default)]
    pub debug_text: Option<String>,
    #[serde(default)]
    pub ingestion_status: IngestionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusDocument {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    #[serde(default)]
    pub claimed_variants: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ingestion_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub soft_delete_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub delinked: bool,
    #[serde(default)]
    pub force_completed: bool,
    #[serde(default)]
    pub affected_rows: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExportDestinationDocument {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub destination_uri: String,
    #[serde(default)]
    pub destination_path: Option<String>,
}

/// Which overflow fragment a blob holds.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum BlobKind {
    Audit,
    Status,
    Export,
}

impl BlobKind {
    pub const ALL: [BlobKind; 3] = [Self::Audit, Self::Status, Self::Export];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.fragment().as_str()
    }

    #[must_use]
    pub fn fragment(self) -> Fragment {
        match self {
            Self::Audit => Fragment::Audit,
            Self::Status => Fragment::Status,
            Self::Export => Fragment::Export,
        }
    }

    #[must_use]
    pub fn from_fragment(fragment: Fragment) -> Option<Self> {
        match fragment {
            Fragment::Core => None,
            Fragment::Audit => Some(Self::Audit),
            Fragment::Status => Some(Self::Status),
            Fragment::Export => Some(Self::Export),
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Fragment::parse(value).and_then(Self::from_fragment)
    }
}

/// Body of one overflow blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobPayload {
    Audit(Vec<AuditDocument>),
    Status(Vec<StatusDocument>),
    Export(Vec<ExportDestinationDocument>),
}

impl BlobPayload {
    #[must_use]
    pub fn kind(&self) -> BlobKind {
        match self {
            Self::Audit(_) => BlobKind::Audit,
            Self::Status(_) => BlobKind::Status,
            Self::Export(_) => BlobKind::Export,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Audit(items) => items.len(),
            Self::Status(items) => items.len(),
            Self::Export(items) => items.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload for `kind` built from the record's current fragment contents.
    #[must_use]
    pub fn from_record(record: &CommandHistoryRecord, kind: BlobKind) -> Self {
        match kind {
            BlobKind::Audit => Self::Audit(
                record
                    .audit_map()
                    .iter()
                    .map(|(key, audit)| AuditDocument {
                        agent_id: key.agent_id,
                        asset_group_id: key.asset_group_id,
                        applicability_reason_code: audit.applicability_reason_code,
                        debug_text: audit.debug_text.clone(),
                        ingestion_status: audit.ingestion_status,
                    })
                    .collect(),
            ),
            BlobKind::Status => Self::Status(
                record
                    .status_map()
                    .iter()
                    .map(|(key, status)| StatusDocument {
                        agent_id: key.agent_id,
                        asset_group_id: key.asset_group_id,
                        claimed_variants: status.claimed_variants.clone(),
                        ingestion_time: status.ingestion_time,
                        completed_time: status.completed_time,
                        soft_delete_time: status.soft_delete_time,
                        delinked: status.delinked,
                        force_completed: status.force_completed,
                        affected_rows: status.affected_rows,
                    })
                    .collect(),
            ),
            BlobKind::Export => Self::Export(
                record
                    .export_destinations()
                    .iter()
                    .map(|destination| ExportDestinationDocument {
                        agent_id: destination.agent_id,
                        asset_group_id: destination.asset_group_id,
                        destination_uri: destination.destination_uri.clone(),
                        destination_path: destination.destination_path.clone(),
                    })
                    .collect(),
            ),
        }
    }

    /// # Errors
    /// Returns [`CommandHistoryError::Serialization`] when encoding fails.
    pub fn to_json(&self) -> Result<String> {
        let encoded = match self {
            Self::Audit(items) => serde_json::to_string(items),
            Self::Status(items) => serde_json::to_string(items),
            Self::Export(items) => serde_json::to_string(items),
        };
        encoded.map_err(|err| {
            CommandHistoryError::Serialization(format!(
                "failed to encode {} blob: {err}",
                self.kind().as_str()
            ))
        })
    }

    /// # Errors
    /// Returns [`CommandHistoryError::Serialization`] when `raw` is not a valid
    /// payload of the given kind.
    pub fn from_json(kind: BlobKind, raw: &str) -> Result<Self> {
        let decoded = match kind {
            BlobKind::Audit => serde_json::from_str(raw).map(Self::Audit),
            BlobKind::Status => serde_json::from_str(raw).map(Self::Status),
            BlobKind::Export => serde_json::from_str(raw).map(Self::Export),
        };
        decoded.map_err(|err| {
            CommandHistoryError::Serialization(format!(
                "failed to decode {} blob: {err}",
                kind.as_str()
            ))
        })
    }

    /// # Errors
    /// Returns [`CommandHistoryError::Serialization`] for a non-audit payload.
    pub fn into_audit_map(self) -> Result<TrackedMap<AssetGroupKey, AuditRecord>> {
        match self {
            Self::Audit(items) => Ok(items
                .into_iter()
                .map(|item| {
                    (
                        AssetGroupKey::new(item.agent_id, item.asset_group_id),
                        AuditRecord {
                            applicability_reason_code: item.applicability_reason_code,
                            debug_text: item.debug_text,
                            ingestion_status: item.ingestion_status,
                        },
                    )
                })
                .collect()),
            other => Err(mismatched(BlobKind::Audit, other.kind())),
        }
    }

    /// # Errors
    /// Returns [`CommandHistoryError::Serialization`] for a non-status payload.
    pub fn into_status_map(self) -> Result<TrackedMap<AssetGroupKey, StatusRecord>> {
        match self {
            Self::Status(items) => Ok(items
                .into_iter()
                .map(|item| {
                    (
                        AssetGroupKey::new(item.agent_id, item.asset_group_id),
                        StatusRecord {
                            claimed_variants: item.claimed_variants,
                            ingestion_time: item.ingestion_time,
                            completed_time: item.completed_time,
                            soft_delete_time: item.soft_delete_time,
                            delinked: item.delinked,
                            force_completed: item.force_completed,
                            affected_rows: item.affected_rows,
                        },
                    )
                })
                .collect()),
            other => Err(mismatched(BlobKind::Status, other.kind())),
        }
    }

    /// # Errors
    /// Returns [`CommandHistoryError::Serialization`] for a non-export payload.
    pub fn into_export_destinations(self) -> Result<TrackedList<ExportDestination>> {
        match self {
            Self::Export(items) => Ok(items
                .into_iter()
                .map(|item| ExportDestination {
                    agent_id: item.agent_id,
                    asset_group_id: item.asset_group_id,
                    destination_uri: item.destination_uri,
                    destination_path: item.destination_path,
                })
                .collect()),
            other => Err(mismatched(BlobKind::Export, other.kind())),
        }
    }
}

fn mismatched(expected: BlobKind, actual: BlobKind) -> CommandHistoryError {
    CommandHistoryError::Serialization(format!(
        "expected {} blob payload, found {}",
        expected.as_str(),
        actual.as_str()
    ))
}
