//! Bridge health reporting
//!
//! A point-in-time view of one overflow bridge suitable for a status
//! endpoint or a periodic log line.

use std::path::PathBuf;

use serde::Serialize;

/// Health status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Records flow straight through
    Healthy,
    /// Consumers are behind and records are waiting on disk
    Degraded,
    /// The worker died; records put now will never be delivered
    Unhealthy,
}

impl HealthStatus {
    /// Check if the bridge still delivers records
    pub fn is_delivering(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Health of a single bridge
#[derive(Debug, Clone, Serialize)]
pub struct BridgeHealth {
    /// Bridge topic
    pub topic: String,
    /// Current health status
    pub status: HealthStatus,
    /// Whether spilling is enabled
    pub enabled: bool,
    /// Whether the worker thread is running
    pub worker_alive: bool,
    /// Records waiting on disk
    pub spilled_pending: usize,
    /// Records lost to I/O or codec failures so far
    pub dropped: u64,
    /// Working directory, if spilling is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spill_directory: Option<PathBuf>,
    /// Optional message describing the status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl BridgeHealth {
    /// Serialize to JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_delivering());
        assert!(HealthStatus::Degraded.is_delivering());
        assert!(!HealthStatus::Unhealthy.is_delivering());
    }

    #[test]
    fn test_health_serialization() {
        let health = BridgeHealth {
            topic: "EHA".to_string(),
            status: HealthStatus::Degraded,
            enabled: true,
            worker_alive: true,
            spilled_pending: 17,
            dropped: 0,
            spill_directory: None,
            message: Some("17 records spilled".to_string()),
        };

        let json = health.to_json();
        assert!(json.contains("\"status\":\"degraded\""));
        assert!(json.contains("\"spilled_pending\":17"));
        assert!(!json.contains("spill_directory"));
    }
}
