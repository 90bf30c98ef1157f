use serde::{Deserialize, Serialize};

/// Separator the engine uses inside counter names.
const DELIMITER: &str = ">>>";

/// A raw traffic counter, as reported by the engine's stats RPC and by nodes' `/v1/stats`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub name: String,
    pub value: i64,
}

impl Counter {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn key(&self) -> Option<CounterKey> {
        CounterKey::parse(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterKind {
    User,
    Inbound,
    Outbound,
    Other(String),
}

/// Parsed form of `<kind>>>><tag>[>>><extra>]`, e.g. `user>>>42>>>traffic>>>uplink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterKey {
    pub kind: CounterKind,
    pub tag: String,
    pub sub_tag: Option<String>,
}

impl CounterKey {
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.splitn(3, DELIMITER);
        let kind = match parts.next()? {
            "user" => CounterKind::User,
            "inbound" => CounterKind::Inbound,
            "outbound" => CounterKind::Outbound,
            "" => return None,
            other => CounterKind::Other(other.to_string()),
        };
        let tag = parts.next().filter(|t| !t.is_empty())?.to_string();
        let sub_tag = parts.next().map(str::to_string);
        Some(Self { kind, tag, sub_tag })
    }

    /// User id for `user>>>` counters.
    pub fn user_id(&self) -> Option<i64> {
        match self.kind {
            CounterKind::User => self.tag.parse().ok(),
            _ => None,
        }
    }
}
