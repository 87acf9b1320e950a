//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name this node presents to the group.
    pub node_name: String,
    /// State-request protocol version to emit (0, 1 or 2; 1+ carries an
    /// incremental descriptor next to the snapshot request).
    pub str_proto_ver: u8,
    /// Interval between retries of a transiently failing state request.
    pub sst_retry_ms: u64,
    /// Preferred donor, empty for group choice.
    pub donor_hint: String,
    /// Whether commit ordering runs through its own monitor.
    pub commit_order: CommitOrder,
    /// Admission-depth budget of the ordering monitors.
    pub monitor_depth: i64,
    pub applier_threads: usize,
    /// Location of the persistent safety marker.
    pub safety_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: "node".to_string(),
            str_proto_ver: 1,
            sst_retry_ms: 1_000,
            donor_hint: String::new(),
            commit_order: CommitOrder::Ordered,
            monitor_depth: 16_384,
            applier_threads: 2,
            safety_path: PathBuf::from("strand_state.json"),
        }
    }
}

impl Config {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.sst_retry_ms)
    }

    pub fn commit_ordered(&self) -> bool {
        self.commit_order == CommitOrder::Ordered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOrder {
    /// Commits are not serialized; the storage engine orders them.
    Bypass,
    /// Commits pass the commit monitor in global order.
    Ordered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.str_proto_ver, 1);
        assert!(config.commit_ordered());
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"node_name":"n1","commit_order":"bypass"}"#).unwrap();
        assert_eq!(config.node_name, "n1");
        assert!(!config.commit_ordered());
        assert_eq!(config.monitor_depth, 16_384);
    }

    #[test]
    fn roundtrips_through_json() {
        let config = Config {
            node_name: "n2".into(),
            str_proto_ver: 2,
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_name, "n2");
        assert_eq!(back.str_proto_ver, 2);
    }
}
