use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{AgentId, AssetGroupId, CommandId};
use crate::record::{PrivacyCommandType, QueueStorageType};
use crate::subject::SubjectType;
use crate::{CommandHistoryError, Result};

/// Proof that an agent holds a dequeued command, plus queue-only context.
///
/// Never persisted by the repository. On the wire it is compact JSON,
/// gzip-compressed and base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseReceipt {
    #[serde(rename = "v")]
    pub version: i64,
    #[serde(rename = "dm", default)]
    pub database_moniker: String,
    #[serde(rename = "cid")]
    pub command_id: CommandId,
    #[serde(rename = "tk", default)]
    pub token: String,
    #[serde(rename = "gid")]
    pub asset_group_id: AssetGroupId,
    #[serde(rename = "aid")]
    pub agent_id: AgentId,
    #[serde(rename = "st")]
    pub subject_type: SubjectType,
    #[serde(rename = "agq", default)]
    pub asset_group_qualifier: Option<String>,
    #[serde(rename = "et", default, with = "time::serde::rfc3339::option")]
    pub approximate_expiration_time: Option<OffsetDateTime>,
    #[serde(rename = "ct")]
    pub command_type: PrivacyCommandType,
    #[serde(rename = "ci", default)]
    pub cloud_instance: Option<String>,
    #[serde(rename = "cts", default, with = "time::serde::rfc3339::option")]
    pub command_created_time: Option<OffsetDateTime>,
    #[serde(rename = "qst", default)]
    pub queue_storage_type: QueueStorageType,
}

impl LeaseReceipt {
    pub const CURRENT_VERSION: i64 = 3;
    const MINIMUM_QUEUE_STORAGE_VERSION: i64 = 3;

    #[must_use]
    pub fn new(
        command_id: CommandId,
        agent_id: AgentId,
        asset_group_id: AssetGroupId,
        subject_type: SubjectType,
        command_type: PrivacyCommandType,
    ) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            database_moniker: String::new(),
            command_id,
            token: String::new(),
            asset_group_id,
            agent_id,
            subject_type,
            asset_group_qualifier: None,
            approximate_expiration_time: None,
            command_type,
            cloud_instance: None,
            command_created_time: None,
            queue_storage_type: QueueStorageType::Undefined,
        }
    }

    /// Receipts issued before queue storage was recorded all came from the document-store queue.
    #[must_use]
    pub fn effective_queue_storage_type(&self) -> QueueStorageType {
        if self.version < Self::MINIMUM_QUEUE_STORAGE_VERSION {
            QueueStorageType::AzureCosmosDb
        } else {
            self.queue_storage_type
        }
    }

    /// # Errors
    /// Returns [`CommandHistoryError::Serialization`] when encoding or
    /// compression fails.
    pub fn serialize(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|err| {
            CommandHistoryError::Serialization(format!("failed to encode lease receipt: {err}"))
        })?;

        let compress_failed = |err: std::io::Error| {
            CommandHistoryError::Serialization(format!("failed to compress lease receipt: {err}"))
        };
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json).map_err(compress_failed)?;
        let compressed = encoder.finish().map_err(compress_failed)?;
        Ok(STANDARD.encode(compressed))
    }

    /// # Errors
    /// Returns [`CommandHistoryError::InvalidArgument`] when the value is not
    /// base64, not gzip, or not a receipt.
    pub fn parse(value: &str) -> Result<Self> {
        let compressed = STANDARD.decode(value.trim()).map_err(|err| {
            CommandHistoryError::InvalidArgument(format!("lease receipt is not base64: {err}"))
        })?;

        let mut json = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut json)
            .map_err(|err| {
                CommandHistoryError::InvalidArgument(format!(
                    "lease receipt is not gzip-compressed JSON: {err}"
                ))
            })?;

        serde_json::from_str(&json).map_err(|err| {
            CommandHistoryError::InvalidArgument(format!("invalid lease receipt payload: {err}"))
        })
    }

    #[must_use]
    pub fn try_parse(value: &str) -> Option<Self> {
        Self::parse(value).ok()
    }
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

    fn fixture_receipt() -> LeaseReceipt {
        let mut receipt = LeaseReceipt::new(
            CommandId::random(),
            AgentId::random(),
            AssetGroupId::random(),
            SubjectType::Msa,
            PrivacyCommandType::Delete,
        );
        receipt.token = "opaque-token".to_string();
        receipt.asset_group_qualifier = Some("AssetType=AzureBlob".to_string());
        receipt.approximate_expiration_time =
            Some(must(crate::parse_rfc3339_utc("2026-02-07T12:05:00Z")));
        receipt.queue_storage_type = QueueStorageType::AzureQueueStorage;
        receipt
    }

    #[test]
    fn serialized_receipt_parses_back() {
        let receipt = fixture_receipt();
        let encoded = must(receipt.serialize());
        assert!(!encoded.contains('{'));
        assert_eq!(must(LeaseReceipt::parse(&encoded)), receipt);
    }

    #[test]
    fn wire_json_uses_short_field_names() {
        let value = match serde_json::to_value(fixture_receipt()) {
            Ok(value) => value,
            Err(err) => panic!("failed to encode receipt: {err}"),
        };
        assert_eq!(value["v"], serde_json::json!(3));
        assert_eq!(value["st"], serde_json::json!("msa"));
        assert_eq!(value["qst"], serde_json::json!(2));
    }

    #[test]
    fn old_versions_report_document_store_queue() {
        let mut receipt = fixture_receipt();
        assert_eq!(
            receipt.effective_queue_storage_type(),
            QueueStorageType::AzureQueueStorage
        );
        receipt.version = 2;
        assert_eq!(
            receipt.effective_queue_storage_type(),
            QueueStorageType::AzureCosmosDb
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(LeaseReceipt::try_parse("not a receipt").is_none());
        let plain_base64 = STANDARD.encode(b"{}");
        let err = match LeaseReceipt::parse(&plain_base64) {
            Ok(_) => panic!("expected uncompressed payload to be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, CommandHistoryError::InvalidArgument(_)));
    }
}
