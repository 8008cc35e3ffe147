use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::ids::{AgentId, AssetGroupId, CommandId};
use crate::lease::LeaseReceipt;
use crate::record::{CoreRecord, ExportDestination, PrivacyCommandType, QueueStorageType};
use crate::subject::PrivacySubject;
use crate::{CommandHistoryError, Result};

/// A command as an agent sees it: persisted history overlaid with queue context.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PrivacyCommand {
    pub command_id: CommandId,
    pub command_type: PrivacyCommandType,
    pub subject: Option<PrivacySubject>,
    pub requester: Option<String>,
    pub context: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub agent_id: AgentId,
    pub asset_group_id: AssetGroupId,
    pub asset_group_qualifier: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_visible_time: Option<OffsetDateTime>,
    pub lease_receipt: LeaseReceipt,
    pub queue_storage_type: QueueStorageType,
    pub cloud_instance: Option<String>,
    pub is_synthetic: bool,
    pub export_destination: Option<ExportDestination>,
    /// The original request body as received at ingestion.
    pub raw_payload: Value,
}

impl PrivacyCommand {
    /// Rebuilds the command from its Core record and the receipt it was leased under.
    ///
    /// Returns `None` when no request body was persisted.
    ///
    /// # Errors
    /// Returns [`CommandHistoryError::Serialization`] when the persisted body is
    /// not valid JSON.
    pub fn from_history(
        command_id: CommandId,
        core: &CoreRecord,
        receipt: &LeaseReceipt,
    ) -> Result<Option<Self>> {
        let Some(raw) = core
            .raw_pxs_command
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
        else {
            return Ok(None);
        };

        let raw_payload = serde_json::from_str(raw).map_err(|err| {
            CommandHistoryError::Serialization(format!(
                "stored request body for command {command_id} is not JSON: {err}"
            ))
        })?;

        Ok(Some(Self {
            command_id,
            command_type: core.command_type,
            subject: core.subject.clone(),
            requester: core.requester.clone(),
            context: core.context.clone(),
            timestamp: core.created_time,
            agent_id: receipt.agent_id,
            asset_group_id: receipt.asset_group_id,
            asset_group_qualifier: receipt.asset_group_qualifier.clone(),
            next_visible_time: receipt.approximate_expiration_time,
            lease_receipt: receipt.clone(),
            queue_storage_type: receipt.effective_queue_storage_type(),
            cloud_instance: receipt.cloud_instance.clone(),
            is_synthetic: core.is_synthetic,
            export_destination: None,
            raw_payload,
        }))
    }
}
