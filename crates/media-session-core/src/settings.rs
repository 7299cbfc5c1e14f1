//! Policy configuration for the session layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the acquisition arbiter does when a held resource is requested again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreemptionPolicy {
    /// Move the grant to the new holder and notify the previous one.
    #[default]
    RevokeAndNotify,
    /// Refuse the new request until the resource is released.
    Reject,
}

/// Session-wide policy settings.
///
/// Every field has a default, so a partial JSON document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// How long a node may stay idle before it is suspended.
    pub suspend_timeout_ms: u64,
    /// Arbiter preemption policy.
    pub preemption: PreemptionPolicy,
    /// Sample rate of converter nodes.
    pub convert_rate: u32,
    /// Channel count of converter nodes when the target does not declare one.
    pub convert_channels: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            suspend_timeout_ms: 3000,
            preemption: PreemptionPolicy::default(),
            convert_rate: 48_000,
            convert_channels: 2,
        }
    }
}

impl SessionSettings {
    /// Parse settings from a JSON document.
    ///
    /// # Errors
    /// Returns error if the document is not valid JSON or has wrong types.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Idle time before suspension.
    #[must_use]
    pub const fn suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.suspend_timeout_ms)
    }
}
