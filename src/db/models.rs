use serde::{Deserialize, Serialize};

use crate::utils::{bytes_to_gb, ports_unique, round_float};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    /// Opaque public token used in profile URLs.
    pub identity: String,
    pub name: String,
    /// Quota in GB, 0 means unlimited.
    pub quota: f64,
    pub usage: f64,
    pub usage_bytes: i64,
    /// Unix milliseconds of the last usage reset.
    pub usage_reset_at: i64,
    pub enabled: bool,
    pub shadowsocks_password: String,
    pub shadowsocks_method: String,
    pub created_at: i64,
}

impl User {
    /// Adds traffic and keeps `usage` in step with `usage_bytes`.
    pub fn add_usage(&mut self, bytes: i64) {
        self.usage_bytes += bytes;
        self.usage = bytes_to_gb(self.usage_bytes);
    }

    pub fn quota_exceeded(&self) -> bool {
        self.quota > 0.0 && self.usage > self.quota
    }

    pub fn reset_usage(&mut self, now_ms: i64) {
        self.usage = 0.0;
        self.usage_bytes = 0;
        self.enabled = true;
        self.usage_reset_at = now_ms;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Processing,
    Available,
    Dirty,
    Unavailable,
}

impl NodeStatus {
    /// Nodes the outdated-node worker retries between full syncs.
    pub fn is_outdated(self) -> bool {
        matches!(self, NodeStatus::Processing | NodeStatus::Unavailable)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    pub id: i64,
    pub host: String,
    pub http_token: String,
    pub http_port: u16,
    /// Accumulated traffic in GB, unscaled. See [`Node::scaled_usage`].
    pub usage: f64,
    #[serde(default)]
    pub usage_bytes: i64,
    pub status: NodeStatus,
}

impl Node {
    pub fn new(id: i64, host: impl Into<String>, http_port: u16, http_token: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            http_token: http_token.into(),
            http_port,
            usage: 0.0,
            usage_bytes: 0,
            status: NodeStatus::Processing,
        }
    }

    pub fn add_usage(&mut self, bytes: i64) {
        self.usage_bytes += bytes;
        self.usage = bytes_to_gb(self.usage_bytes);
    }

    /// Usage as shown to admins.
    pub fn scaled_usage(&self, traffic_ratio: f64) -> f64 {
        round_float(self.usage * traffic_ratio, 2)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    #[default]
    Nothing,
    Monthly,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Settings {
    /// Public address advertised to clients and nodes.
    pub host: String,
    pub ss_relay_port: u16,
    pub ss_reverse_port: u16,
    pub ss_direct_port: u16,
    pub traffic_ratio: f64,
    #[serde(default)]
    pub reset_policy: ResetPolicy,
    /// Fallback HTTP proxy base URL for node pushes.
    #[serde(default)]
    pub proxy_server: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ss_relay_port: 0,
            ss_reverse_port: 0,
            ss_direct_port: 0,
            traffic_ratio: 1.0,
            reset_policy: ResetPolicy::Nothing,
            proxy_server: None,
        }
    }
}

impl Settings {
    pub fn relay_enabled(&self) -> bool {
        self.ss_relay_port > 0
    }

    pub fn reverse_enabled(&self) -> bool {
        self.ss_reverse_port > 0
    }

    pub fn direct_enabled(&self) -> bool {
        self.ss_direct_port > 0
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy_server.as_deref().filter(|p| !p.is_empty())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host is required".to_string());
        }
        if !ports_unique(&[self.ss_relay_port, self.ss_reverse_port, self.ss_direct_port]) {
            return Err("relay, reverse and direct ports must be distinct".to_string());
        }
        if self.traffic_ratio <= 0.0 {
            return Err("traffic_ratio must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Stats {
    /// Total traffic in GB, unscaled. See [`Stats::scaled_usage`].
    pub total_usage: f64,
    #[serde(default)]
    pub total_usage_bytes: i64,
    pub total_usage_reset_at: i64,
}

impl Stats {
    pub fn add_usage(&mut self, bytes: i64) {
        self.total_usage_bytes += bytes;
        self.total_usage = bytes_to_gb(self.total_usage_bytes);
    }

    pub fn scaled_usage(&self, traffic_ratio: f64) -> f64 {
        round_float(self.total_usage * traffic_ratio, 2)
    }
}

/// The whole persisted document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Content {
    pub settings: Settings,
    pub stats: Stats,
    pub users: Vec<User>,
    pub nodes: Vec<Node>,
}

impl Content {
    pub fn count_active_users(&self) -> usize {
        self.users.iter().filter(|u| u.enabled).count()
    }

    /// Rebuilds byte counters missing from documents that only stored GB,
    /// so the next pass adds to the stored usage instead of replacing it.
    pub fn backfill_usage_bytes(&mut self) {
        let gb_to_bytes = |gb: f64| (gb * 1_000_000_000.0).round() as i64;
        if self.stats.total_usage_bytes == 0 && self.stats.total_usage > 0.0 {
            self.stats.total_usage_bytes = gb_to_bytes(self.stats.total_usage);
        }
        for node in self.nodes.iter_mut() {
            if node.usage_bytes == 0 && node.usage > 0.0 {
                node.usage_bytes = gb_to_bytes(node.usage);
            }
        }
    }

    pub fn find_node_mut(&mut self, id: i64) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(quota: f64) -> User {
        User {
            id: 1,
            identity: "abc".to_string(),
            name: "alice".to_string(),
            quota,
            usage: 0.0,
            usage_bytes: 0,
            usage_reset_at: 0,
            enabled: true,
            shadowsocks_password: "secret".to_string(),
            shadowsocks_method: "chacha20-ietf-poly1305".to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn test_usage_tracks_bytes() {
        let mut u = user(5.0);
        u.add_usage(100_000_000);
        assert_eq!(u.usage, 0.1);
        u.add_usage(6_442_450_944);
        assert_eq!(u.usage, 6.54);
        assert!(u.quota_exceeded());
    }

    #[test]
    fn test_zero_quota_is_unlimited() {
        let mut u = user(0.0);
        u.add_usage(1_000_000_000_000);
        assert!(!u.quota_exceeded());
    }

    #[test]
    fn test_settings_reject_duplicate_ports() {
        let mut s = Settings::default();
        assert!(s.validate().is_ok());
        s.ss_relay_port = 9000;
        s.ss_direct_port = 9000;
        assert!(s.validate().is_err());
        s.ss_direct_port = 9001;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_ratio_change_never_shrinks_stored_usage() {
        let mut stats = Stats::default();
        let mut node = Node::new(1, "n", 1, "t");
        stats.add_usage(1_000_000_000);
        node.add_usage(1_000_000_000);
        assert_eq!(stats.scaled_usage(2.0), 2.0);
        assert_eq!(node.scaled_usage(2.0), 2.0);

        // Admin lowers the ratio, then a little more traffic arrives.
        stats.add_usage(1);
        node.add_usage(1);
        assert_eq!(stats.total_usage, 1.0);
        assert_eq!(node.usage, 1.0);
        assert_eq!(stats.scaled_usage(1.0), 1.0);
        assert_eq!(stats.scaled_usage(0.5), 0.5);
    }

    #[test]
    fn test_backfill_keeps_usage_from_gb_only_documents() {
        let json = r#"{
            "settings": {"host": "h", "ss_relay_port": 0, "ss_reverse_port": 0, "ss_direct_port": 0, "traffic_ratio": 1.0},
            "stats": {"total_usage": 12.5, "total_usage_reset_at": 0},
            "users": [],
            "nodes": [{"id": 1, "host": "n", "http_token": "t", "http_port": 1, "usage": 3.25, "status": "available"}]
        }"#;
        let mut content: Content = serde_json::from_str(json).unwrap();
        content.backfill_usage_bytes();

        content.stats.add_usage(10_000_000);
        content.nodes[0].add_usage(10_000_000);
        assert_eq!(content.stats.total_usage, 12.51);
        assert_eq!(content.nodes[0].usage, 3.26);
    }

    #[test]
    fn test_node_status_wire_format() {
        let json = serde_json::to_string(&NodeStatus::Unavailable).unwrap();
        assert_eq!(json, "\"unavailable\"");
        assert!(NodeStatus::Processing.is_outdated());
        assert!(!NodeStatus::Dirty.is_outdated());
    }
}
