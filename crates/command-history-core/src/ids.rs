use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::CommandHistoryError;

macro_rules! guid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(Uuid);

        impl $name {
            #[must_use]
            pub fn new(value: Uuid) -> Self {
                Self(value)
            }

            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            #[must_use]
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Parses either the hyphenated or the bare hex form.
            ///
            /// # Errors
            /// Returns [`CommandHistoryError::InvalidArgument`] for malformed input.
            pub fn parse(value: &str) -> Result<Self, CommandHistoryError> {
                Uuid::parse_str(value.trim()).map(Self).map_err(|err| {
                    CommandHistoryError::InvalidArgument(format!(
                        "invalid {}: {value} ({err})",
                        $label
                    ))
                })
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }

        impl FromStr for $name {
            type Err = CommandHistoryError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::parse(value)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(serde::de::Error::custom)
            }
        }
    };
}

guid_id!(
    /// Primary key for a command's whole history. Canonical form is 32 lowercase hex digits.
    CommandId,
    "command id"
);
guid_id!(AgentId, "agent id");
guid_id!(AssetGroupId, "asset group id");

/// Optimistic-concurrency token issued by a store on every write.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Etag(String);

impl Etag {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Etag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Physical location of an overflow fragment in blob storage.
///
/// Assigned by the blob store on create and never changed afterwards.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BlobPointer {
    #[serde(rename = "accountName")]
    pub account_name: String,
    #[serde(rename = "containerName")]
    pub container_name: String,
    #[serde(rename = "blobName")]
    pub blob_name: String,
}

impl Display for BlobPointer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.account_name, self.container_name, self.blob_name
        )
    }
}
