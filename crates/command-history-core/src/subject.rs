use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The data subject a privacy command targets.
///
/// Persisted inside the Core document under `s`, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PrivacySubject {
    #[serde(rename_all = "camelCase")]
    Msa {
        puid: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anid: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Aad { object_id: Uuid, tenant_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Device { global_device_id: i64 },
    #[serde(rename_all = "camelCase")]
    Demographic {
        #[serde(default)]
        names: Vec<String>,
        #[serde(default)]
        emails: Vec<String>,
        #[serde(default)]
        phones: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    EdgeBrowser { edge_browser_id: i64 },
}

impl PrivacySubject {
    #[must_use]
    pub fn subject_type(&self) -> SubjectType {
        match self {
            Self::Msa { .. } => SubjectType::Msa,
            Self::Aad { .. } => SubjectType::Aad,
            Self::Device { .. } => SubjectType::Device,
            Self::Demographic { .. } => SubjectType::Demographic,
            Self::EdgeBrowser { .. } => SubjectType::EdgeBrowser,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SubjectType {
    Msa,
    Aad,
    Device,
    Demographic,
    EdgeBrowser,
}

impl SubjectType {
    /// Value stored in `c.s.type`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Msa => "msa",
            Self::Aad => "aad",
            Self::Device => "device",
            Self::Demographic => "demographic",
            Self::EdgeBrowser => "edgeBrowser",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "msa" => Some(Self::Msa),
            "aad" => Some(Self::Aad),
            "device" => Some(Self::Device),
            "demographic" => Some(Self::Demographic),
            "edgebrowser" => Some(Self::EdgeBrowser),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_tag_matches_query_field_names() {
        let subject = PrivacySubject::Aad {
            object_id: Uuid::nil(),
            tenant_id: Uuid::nil(),
        };
        let value = match serde_json::to_value(&subject) {
            Ok(value) => value,
            Err(err) => panic!("failed to encode subject: {err}"),
        };
        assert_eq!(value["type"], serde_json::json!("aad"));
        assert!(value.get("objectId").is_some());

        let msa = match serde_json::to_value(PrivacySubject::Msa {
            puid: 42,
            anid: None,
        }) {
            Ok(value) => value,
            Err(err) => panic!("failed to encode msa subject: {err}"),
        };
        assert_eq!(msa, serde_json::json!({"type": "msa", "puid": 42}));
    }

    #[test]
    fn subject_type_parse_accepts_stored_spelling() {
        for subject_type in [
            SubjectType::Msa,
            SubjectType::Aad,
            SubjectType::Device,
            SubjectType::Demographic,
            SubjectType::EdgeBrowser,
        ] {
            assert_eq!(SubjectType::parse(subject_type.as_str()), Some(subject_type));
        }
        assert_eq!(SubjectType::parse("martian"), None);
    }
}
