use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::ConfiguredRequesterAliases;
use crate::storage::StaticFeatureFlags;
use crate::CommandHistoryError;

/// Upper bound for the day-count knobs; keeps time arithmetic in range.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Tunables for the command history repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandHistoryConfig {
    pub max_age_days_for_query: u32,
    pub default_time_to_live_days: u32,
    pub max_query_results: usize,
    pub replay_page_size: usize,
    pub scan_page_size: usize,
    pub requester_alias_groups: Vec<Vec<String>>,
    pub feature_flags: BTreeMap<String, bool>,
}

impl Default for CommandHistoryConfig {
    fn default() -> Self {
        Self {
            max_age_days_for_query: 60,
            default_time_to_live_days: 90,
            max_query_results: 5000,
            replay_page_size: 1000,
            scan_page_size: 1000,
            requester_alias_groups: Vec::new(),
            feature_flags: BTreeMap::new(),
        }
    }
}

impl CommandHistoryConfig {
    /// Validates numeric knobs and alias groups.
    ///
    /// # Errors
    /// Returns [`CommandHistoryError::Configuration`] when a knob is zero, a
    /// day count exceeds [`MAX_RETENTION_DAYS`], or an alias group is empty.
    pub fn validate(&self) -> Result<(), CommandHistoryError> {
        for (name, value) in [
            (
                "max_age_days_for_query",
                usize::try_from(self.max_age_days_for_query).unwrap_or(usize::MAX),
            ),
            (
                "default_time_to_live_days",
                usize::try_from(self.default_time_to_live_days).unwrap_or(usize::MAX),
            ),
            ("max_query_results", self.max_query_results),
            ("replay_page_size", self.replay_page_size),
            ("scan_page_size", self.scan_page_size),
        ] {
            if value == 0 {
                return Err(CommandHistoryError::Configuration(format!(
                    "{name} MUST be >= 1"
                )));
            }
        }

        for (name, value) in [
            ("max_age_days_for_query", self.max_age_days_for_query),
            ("default_time_to_live_days", self.default_time_to_live_days),
        ] {
            if value > MAX_RETENTION_DAYS {
                return Err(CommandHistoryError::Configuration(format!(
                    "{name} MUST be <= {MAX_RETENTION_DAYS}"
                )));
            }
        }

        for (index, group) in self.requester_alias_groups.iter().enumerate() {
            if group.iter().all(|member| member.trim().is_empty()) {
                return Err(CommandHistoryError::Configuration(format!(
                    "requester_alias_groups[{index}] MUST name at least one requester"
                )));
            }
        }

        Ok(())
    }

    /// Decodes and validates a config from JSON. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns [`CommandHistoryError::Configuration`] when decoding fails or
    /// the decoded values are rejected by [`Self::validate`].
    pub fn from_json(value: &Value) -> Result<Self, CommandHistoryError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            CommandHistoryError::Configuration(format!("invalid command history config JSON: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn requester_aliases(&self) -> ConfiguredRequesterAliases {
        ConfiguredRequesterAliases::new(self.requester_alias_groups.clone())
    }

    #[must_use]
    pub fn feature_flags(&self) -> StaticFeatureFlags {
        StaticFeatureFlags::new(self.feature_flags.clone())
    }
}
