use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::fragments::{Fragment, FragmentSet};
use crate::ids::{AgentId, AssetGroupId, BlobPointer, CommandId, Etag};
use crate::subject::PrivacySubject;
use crate::tracked::{Tracked, TrackedList, TrackedMap};
use crate::CommandHistoryError;

/// Command taxonomy subset. Persisted as the integer code under `ct`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "i64", into = "i64")]
pub enum PrivacyCommandType {
    None,
    Delete,
    Export,
    AccountClose,
    AgeOut,
}

impl PrivacyCommandType {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Delete => 1,
            Self::Export => 2,
            Self::AccountClose => 3,
            Self::AgeOut => 4,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Delete),
            2 => Some(Self::Export),
            3 => Some(Self::AccountClose),
            4 => Some(Self::AgeOut),
            _ => None,
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "delete" => Some(Self::Delete),
            "export" => Some(Self::Export),
            "accountclose" | "account_close" => Some(Self::AccountClose),
            "ageout" | "age_out" => Some(Self::AgeOut),
            _ => None,
        }
    }
}

impl TryFrom<i64> for PrivacyCommandType {
    type Error = CommandHistoryError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| {
            CommandHistoryError::Serialization(format!("unknown command type code: {code}"))
        })
    }
}

impl From<PrivacyCommandType> for i64 {
    fn from(value: PrivacyCommandType) -> Self {
        value.code()
    }
}

/// Backing store of the agent queue that leased a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(try_from = "i64", into = "i64")]
pub enum QueueStorageType {
    #[default]
    Undefined,
    AzureCosmosDb,
    AzureQueueStorage,
}

impl TryFrom<i64> for QueueStorageType {
    type Error = CommandHistoryError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Undefined),
            1 => Ok(Self::AzureCosmosDb),
            2 => Ok(Self::AzureQueueStorage),
            _ => Err(CommandHistoryError::Serialization(format!(
                "unknown queue storage type code: {code}"
            ))),
        }
    }
}

impl From<QueueStorageType> for i64 {
    fn from(value: QueueStorageType) -> Self {
        match value {
            QueueStorageType::Undefined => 0,
            QueueStorageType::AzureCosmosDb => 1,
            QueueStorageType::AzureQueueStorage => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WeightedMoniker {
    pub moniker: String,
    pub weight: u32,
}

/// Fixed-schema part of a command's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreRecord {
    pub command_type: PrivacyCommandType,
    #[serde(default)]
    pub subject: Option<PrivacySubject>,
    #[serde(default)]
    pub requester: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_time: OffsetDateTime,
    #[serde(default)]
    pub is_globally_complete: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub total_command_count: Option<i64>,
    #[serde(default)]
    pub completed_command_count: Option<i64>,
    #[serde(default)]
    pub ingested_command_count: Option<i64>,
    #[serde(default)]
    pub ingestion_data_set_version: Option<i64>,
    #[serde(default)]
    pub ingestion_assembly_version: Option<String>,
    #[serde(default)]
    pub weighted_moniker_list: Vec<WeightedMoniker>,
    #[serde(default)]
    pub queue_storage_type: QueueStorageType,
    #[serde(default)]
    pub raw_pxs_command: Option<String>,
    #[serde(default)]
    pub final_export_destination_uri: Option<String>,
    #[serde(default)]
    pub is_synthetic: bool,
}

impl CoreRecord {
    #[must_use]
    pub fn new(command_type: PrivacyCommandType, created_time: OffsetDateTime) -> Self {
        Self {
            command_type,
            subject: None,
            requester: None,
            context: None,
            created_time,
            is_globally_complete: false,
            completed_time: None,
            total_command_count: None,
            completed_command_count: None,
            ingested_command_count: None,
            ingestion_data_set_version: None,
            ingestion_assembly_version: None,
            weighted_moniker_list: Vec::new(),
            queue_storage_type: QueueStorageType::Undefined,
            raw_pxs_command: None,
            final_export_destination_uri: None,
            is_synthetic: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ApplicabilityReasonCode {
    #[default]
    None,
    AssetGroupInfoIsDeprecated,
    AssetGroupInfoIsInvalid,
    DoesNotMatchAssetGroupCapability,
    DoesNotMatchAssetGroupDataTypes,
    DoesNotMatchAssetGroupSubjects,
    DoesNotMatchAssetGroupSupportedCloudInstances,
    FilteredByVariant,
    TipAgentIsNotOnline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum IngestionStatus {
    #[default]
    Unknown,
    SendingToAgent,
    SentToAgent,
    DroppedDueToFiltering,
    DroppedByApplyingVariant,
    DroppedDueToOfflineAgent,
}

/// Why and how a command was (or was not) routed to one asset group.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct AuditRecord {
    pub applicability_reason_code: ApplicabilityReasonCode,
    pub debug_text: Option<String>,
    pub ingestion_status: IngestionStatus,
}

/// Completion detail reported by one agent for one asset group.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct StatusRecord {
    pub claimed_variants: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ingestion_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub soft_delete_time: Option<OffsetDateTime>,
    pub delinked: bool,
    pub force_completed: bool,
    pub affected_rows: Option<i64>,
}

impl StatusRecord {
    /// Completed with a real timestamp, not a zero-valued placeholder.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed_time
            .is_some_and(|completed| !crate::is_default_timestamp(completed))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExportDestination {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub destination_uri: String,
    pub destination_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AssetGroupKey {
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
}

impl AssetGroupKey {
    #[must_use]
    pub fn new(agent_id: AgentId, asset_group_id: AssetGroupId) -> Self {
        Self {
            agent_id,
            asset_group_id,
        }
    }
}

/// Where a blob-backed fragment lives and which version of it was observed.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct BlobSlot {
    pub pointer: Option<BlobPointer>,
    pub etag: Option<Etag>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BlobState {
    /// No blob exists; the first write must create one.
    NeverCreated,
    /// The pointer is known but the blob was not read.
    Unloaded,
    Loaded,
}

impl BlobSlot {
    #[must_use]
    pub fn state(&self) -> BlobState {
        match (&self.pointer, &self.etag) {
            (None, _) => BlobState::NeverCreated,
            (Some(_), None) => BlobState::Unloaded,
            (Some(_), Some(_)) => BlobState::Loaded,
        }
    }
}

/// Pointers and etags observed when a record was loaded (or inserted).
///
/// Supplies the optimistic-concurrency tokens for a later replace and tells
/// create apart from replace for each blob fragment.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OperationContext {
    pub command_id: CommandId,
    pub fragments_read: FragmentSet,
    pub core_etag: Option<Etag>,
    pub audit: BlobSlot,
    pub status: BlobSlot,
    pub export: BlobSlot,
}

impl OperationContext {
    #[must_use]
    pub fn new(command_id: CommandId, fragments_read: FragmentSet, core_etag: Option<Etag>) -> Self {
        Self {
            command_id,
            fragments_read,
            core_etag,
            audit: BlobSlot::default(),
            status: BlobSlot::default(),
            export: BlobSlot::default(),
        }
    }

    /// Blob slot for a blob-backed fragment; `None` for Core.
    #[must_use]
    pub fn slot(&self, fragment: Fragment) -> Option<&BlobSlot> {
        match fragment {
            Fragment::Core => None,
            Fragment::Audit => Some(&self.audit),
            Fragment::Status => Some(&self.status),
            Fragment::Export => Some(&self.export),
        }
    }

    pub fn slot_mut(&mut self, fragment: Fragment) -> Option<&mut BlobSlot> {
        match fragment {
            Fragment::Core => None,
            Fragment::Audit => Some(&mut self.audit),
            Fragment::Status => Some(&mut self.status),
            Fragment::Export => Some(&mut self.export),
        }
    }
}

/// Aggregate root for one command: Core plus three overflow fragments.
///
/// Each fragment is held in its own tracking container, so a mutation through
/// any accessor dirties exactly the fragment it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandHistoryRecord {
    command_id: CommandId,
    core: Tracked<CoreRecord>,
    audit_map: TrackedMap<AssetGroupKey, AuditRecord>,
    status_map: TrackedMap<AssetGroupKey, StatusRecord>,
    export_destinations: TrackedList<ExportDestination>,
    context: Option<OperationContext>,
}

impl CommandHistoryRecord {
    /// A brand-new record that has never been stored.
    #[must_use]
    pub fn new(command_id: CommandId, core: CoreRecord) -> Self {
        Self {
            command_id,
            core: Tracked::new(core),
            audit_map: TrackedMap::new(),
            status_map: TrackedMap::new(),
            export_destinations: TrackedList::new(),
            context: None,
        }
    }

    /// Assembles a record from stored parts. The result starts fully clean.
    #[must_use]
    pub fn from_parts(
        core: CoreRecord,
        audit_map: TrackedMap<AssetGroupKey, AuditRecord>,
        status_map: TrackedMap<AssetGroupKey, StatusRecord>,
        export_destinations: TrackedList<ExportDestination>,
        context: OperationContext,
    ) -> Self {
        let mut record = Self {
            command_id: context.command_id,
            core: Tracked::new(core),
            audit_map,
            status_map,
            export_destinations,
            context: Some(context),
        };
        record.clear_dirty();
        record
    }

    #[must_use]
    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    #[must_use]
    pub fn core(&self) -> &CoreRecord {
        self.core.get()
    }

    pub fn core_mut(&mut self) -> &mut CoreRecord {
        self.core.get_mut()
    }

    #[must_use]
    pub fn audit_map(&self) -> &TrackedMap<AssetGroupKey, AuditRecord> {
        &self.audit_map
    }

    pub fn audit_map_mut(&mut self) -> &mut TrackedMap<AssetGroupKey, AuditRecord> {
        &mut self.audit_map
    }

    #[must_use]
    pub fn status_map(&self) -> &TrackedMap<AssetGroupKey, StatusRecord> {
        &self.status_map
    }

    pub fn status_map_mut(&mut self) -> &mut TrackedMap<AssetGroupKey, StatusRecord> {
        &mut self.status_map
    }

    #[must_use]
    pub fn export_destinations(&self) -> &TrackedList<ExportDestination> {
        &self.export_destinations
    }

    pub fn export_destinations_mut(&mut self) -> &mut TrackedList<ExportDestination> {
        &mut self.export_destinations
    }

    #[must_use]
    pub fn export_destination_for(&self, key: AssetGroupKey) -> Option<&ExportDestination> {
        self.export_destinations.find(|destination| {
            destination.agent_id == key.agent_id && destination.asset_group_id == key.asset_group_id
        })
    }

    #[must_use]
    pub fn get_changed_fragments(&self) -> FragmentSet {
        let mut changed = FragmentSet::NONE;
        if self.core.is_dirty() {
            changed |= FragmentSet::CORE;
        }
        if self.audit_map.is_dirty() {
            changed |= FragmentSet::AUDIT;
        }
        if self.status_map.is_dirty() {
            changed |= FragmentSet::STATUS;
        }
        if self.export_destinations.is_dirty() {
            changed |= FragmentSet::EXPORT;
        }
        changed
    }

    pub fn clear_dirty(&mut self) {
        self.clear_dirty_fragments(FragmentSet::ALL);
    }

    pub fn clear_dirty_fragments(&mut self, fragments: FragmentSet) {
        for fragment in fragments.iter() {
            match fragment {
                Fragment::Core => self.core.clear_dirty(),
                Fragment::Audit => self.audit_map.clear_dirty(),
                Fragment::Status => self.status_map.clear_dirty(),
                Fragment::Export => self.export_destinations.clear_dirty(),
            }
        }
    }

    /// Context captured when the record was read or inserted; `None` for new records.
    #[must_use]
    pub fn operation_context(&self) -> Option<&OperationContext> {
        self.context.as_ref()
    }

    pub fn operation_context_mut(&mut self) -> Option<&mut OperationContext> {
        self.context.as_mut()
    }

    pub fn set_operation_context(&mut self, context: OperationContext) {
        self.context = Some(context);
    }
}
