use std::collections::HashMap;

use crate::db::models::Content;
use crate::writer::{DIRECT_TAG, FOREIGN_TAG, RELAY_TAG, REVERSE_TAG};
use crate::xray::stats::{Counter, CounterKey, CounterKind};

/// Bytes gathered from one stats pass, keyed by what they are billed to.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UsageBatch {
    pub users: HashMap<i64, i64>,
    pub nodes: HashMap<i64, i64>,
    pub total: i64,
}

/// Node id encoded in a per-node tag such as `foreign-3` or `relay-3`.
fn node_id(tag: &str, prefix: &str) -> Option<i64> {
    tag.strip_prefix(prefix)?.strip_prefix('-')?.parse().ok()
}

impl UsageBatch {
    /// Folds the hub engine's counters: user traffic, per-node tunnel legs
    /// and the user-facing inbounds that make up the global total.
    pub fn add_local(&mut self, counters: &[Counter]) {
        for counter in counters {
            let Some(key) = counter.key() else {
                continue;
            };
            match key.kind {
                CounterKind::User => self.add_user(&key, counter.value),
                CounterKind::Inbound => {
                    if matches!(key.tag.as_str(), RELAY_TAG | REVERSE_TAG | DIRECT_TAG) {
                        self.total += counter.value;
                    } else if let Some(id) = node_id(&key.tag, FOREIGN_TAG) {
                        *self.nodes.entry(id).or_default() += counter.value;
                    }
                }
                CounterKind::Outbound => {
                    if let Some(id) = node_id(&key.tag, RELAY_TAG) {
                        *self.nodes.entry(id).or_default() += counter.value;
                    }
                }
                CounterKind::Other(_) => {}
            }
        }
    }

    /// Node configs carry no hub tags, so only user counters are billed.
    pub fn add_remote(&mut self, counters: &[Counter]) {
        for counter in counters {
            if let Some(key) = counter.key() {
                self.add_user(&key, counter.value);
            }
        }
    }

    fn add_user(&mut self, key: &CounterKey, value: i64) {
        if let Some(id) = key.user_id() {
            *self.users.entry(id).or_default() += value;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.nodes.is_empty() && self.total == 0
    }

    /// Folds the whole batch into `content`, then disables every user now over
    /// quota. Returns whether any user was disabled.
    pub fn apply(&self, content: &mut Content) -> bool {
        for user in content.users.iter_mut() {
            if let Some(bytes) = self.users.get(&user.id) {
                user.add_usage(*bytes);
            }
        }
        for node in content.nodes.iter_mut() {
            if let Some(bytes) = self.nodes.get(&node.id) {
                node.add_usage(*bytes);
            }
        }
        if self.total != 0 {
            content.stats.add_usage(self.total);
        }

        let mut disabled = false;
        for user in content.users.iter_mut().filter(|u| u.enabled) {
            if user.quota_exceeded() {
                user.enabled = false;
                disabled = true;
            }
        }
        disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Node, User};

    fn user(id: i64, quota: f64, usage_bytes: i64) -> User {
        User {
            id,
            identity: String::new(),
            name: format!("user-{id}"),
            quota,
            usage: crate::utils::bytes_to_gb(usage_bytes),
            usage_bytes,
            usage_reset_at: 0,
            enabled: true,
            shadowsocks_password: format!("secret-{id}"),
            shadowsocks_method: "chacha20-ietf-poly1305".to_string(),
            created_at: 0,
        }
    }

    #[test]
    fn test_local_counters_are_routed_by_tag() {
        let mut batch = UsageBatch::default();
        batch.add_local(&[
            Counter::new("user>>>1>>>traffic>>>uplink", 10),
            Counter::new("user>>>1>>>traffic>>>downlink", 5),
            Counter::new("inbound>>>relay>>>traffic>>>uplink", 100),
            Counter::new("inbound>>>direct>>>traffic>>>downlink", 50),
            Counter::new("inbound>>>foreign-3>>>traffic>>>uplink", 7),
            Counter::new("outbound>>>relay-3>>>traffic>>>downlink", 8),
            Counter::new("inbound>>>api>>>traffic>>>uplink", 999),
            Counter::new("outbound>>>freedom>>>traffic>>>uplink", 999),
            Counter::new("garbage", 999),
        ]);
        assert_eq!(batch.users.get(&1), Some(&15));
        assert_eq!(batch.nodes.get(&3), Some(&15));
        assert_eq!(batch.total, 150);
    }

    #[test]
    fn test_remote_counters_only_bill_users() {
        let mut batch = UsageBatch::default();
        batch.add_remote(&[
            Counter::new("user>>>2>>>traffic>>>uplink", 10),
            Counter::new("inbound>>>direct>>>traffic>>>uplink", 10),
        ]);
        assert_eq!(batch.users.get(&2), Some(&10));
        assert_eq!(batch.total, 0);
        assert!(batch.nodes.is_empty());
    }

    #[test]
    fn test_apply_stores_unscaled_usage() {
        let mut content = Content::default();
        content.settings.traffic_ratio = 2.0;
        content.users.push(user(1, 1.0, 0));
        content.nodes.push(Node::new(3, "n", 1, "t"));

        let batch = UsageBatch {
            users: HashMap::from([(1, 600_000_000)]),
            nodes: HashMap::from([(3, 1_000_000_000)]),
            total: 1_500_000_000,
        };
        assert!(!batch.apply(&mut content));
        assert_eq!(content.users[0].usage, 0.6);
        assert!(content.users[0].enabled);
        assert_eq!(content.nodes[0].usage, 1.0);
        assert_eq!(content.stats.total_usage, 1.5);
        assert_eq!(content.nodes[0].scaled_usage(content.settings.traffic_ratio), 2.0);
        assert_eq!(content.stats.scaled_usage(content.settings.traffic_ratio), 3.0);

        // A lower ratio afterwards only changes what is displayed.
        content.settings.traffic_ratio = 1.0;
        UsageBatch {
            total: 1,
            ..Default::default()
        }
        .apply(&mut content);
        assert_eq!(content.stats.total_usage, 1.5);
        assert_eq!(content.stats.scaled_usage(content.settings.traffic_ratio), 1.5);
    }

    #[test]
    fn test_quota_evaluated_after_whole_batch() {
        let mut content = Content::default();
        content.users.push(user(1, 5.0, 100_000_000));
        content.users.push(user(2, 0.0, 0));
        content.users.push(user(3, 1.0, 0));

        let batch = UsageBatch {
            users: HashMap::from([(1, 6_442_450_944), (2, 50_000_000_000), (3, 1_000_000_000)]),
            ..Default::default()
        };
        assert!(batch.apply(&mut content));
        assert!(!content.users[0].enabled);
        assert_eq!(content.users[0].usage, 6.54);
        assert_eq!(content.users[0].usage_bytes, 6_542_450_944);
        // Unlimited, and exactly at quota, stay enabled.
        assert!(content.users[1].enabled);
        assert!(content.users[2].enabled);
    }
}
