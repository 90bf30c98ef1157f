//! Engine configuration document.
//!
//! The structs mirror the engine's JSON schema closely enough that
//! `serde_json::to_vec(&config)` is the file the engine reads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const API_TAG: &str = "api";
pub const FREEDOM_TAG: &str = "freedom";

/// Cipher used for user-facing inbounds when a user has no method recorded.
pub const SHADOWSOCKS_METHOD: &str = "chacha20-ietf-poly1305";
/// Cipher used for the hub <-> node tunnel legs.
pub const SHADOWSOCKS_2022_METHOD: &str = "2022-blake3-aes-256-gcm";

/// Control-plane port baked into remote configs; nodes rebind it locally.
pub const DEFAULT_API_PORT: u16 = 3411;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Log {
    pub loglevel: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Client {
    pub password: String,
    pub method: String,
    /// The engine reports per-user counters under this key, so it carries the user id.
    pub email: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct InboundSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clients: Vec<Client>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Inbound {
    pub tag: String,
    pub protocol: String,
    pub listen: String,
    pub port: u16,
    pub settings: InboundSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutboundServer {
    pub address: String,
    pub port: u16,
    pub method: String,
    pub password: String,
    #[serde(default)]
    pub uot: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct OutboundSettings {
    pub servers: Vec<OutboundServer>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub network: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    pub tag: String,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettings>,
}

impl Outbound {
    /// First upstream server, if this is a proxy outbound.
    pub fn server(&self) -> Option<&OutboundServer> {
        self.settings.as_ref().and_then(|s| s.servers.first())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Dns {
    pub servers: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Api {
    pub tag: String,
    pub services: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Policy {
    pub levels: BTreeMap<String, BTreeMap<String, bool>>,
    pub system: BTreeMap<String, bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    #[serde(rename = "type")]
    pub rule_type: String,
    pub inbound_tag: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balancer_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,
}

impl Rule {
    /// Routes everything arriving on `inbound` to a fixed outbound.
    pub fn to_outbound(inbound: impl Into<String>, outbound: impl Into<String>) -> Self {
        Self {
            rule_type: "field".to_string(),
            inbound_tag: vec![inbound.into()],
            outbound_tag: Some(outbound.into()),
            balancer_tag: None,
            domain: Vec::new(),
        }
    }

    /// Routes everything arriving on `inbound` through a balancer group.
    pub fn to_balancer(inbound: impl Into<String>, balancer: impl Into<String>) -> Self {
        Self {
            rule_type: "field".to_string(),
            inbound_tag: vec![inbound.into()],
            outbound_tag: None,
            balancer_tag: Some(balancer.into()),
            domain: Vec::new(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain.push(domain.into());
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Balancer {
    pub tag: String,
    pub selector: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub domain_strategy: String,
    pub domain_matcher: String,
    pub rules: Vec<Rule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub balancers: Vec<Balancer>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReverseItem {
    pub tag: String,
    pub domain: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Reverse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bridges: Vec<ReverseItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub portals: Vec<ReverseItem>,
}

impl Reverse {
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty() && self.portals.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub log: Log,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub dns: Dns,
    pub stats: BTreeMap<String, serde_json::Value>,
    pub api: Api,
    pub policy: Policy,
    pub routing: Routing,
    #[serde(default)]
    pub reverse: Reverse,
}

impl EngineConfig {
    /// The minimal valid document: a loopback control-plane inbound on `api_port`,
    /// a `freedom` egress and the routing rule that wires the API.
    pub fn skeleton(log_level: &str, api_port: u16) -> Self {
        let user_levels = BTreeMap::from([
            ("statsUserUplink".to_string(), true),
            ("statsUserDownlink".to_string(), true),
        ]);
        let system = [
            "statsInboundUplink",
            "statsInboundDownlink",
            "statsOutboundUplink",
            "statsOutboundDownlink",
        ]
        .into_iter()
        .map(|k| (k.to_string(), true))
        .collect();

        Self {
            log: Log {
                loglevel: log_level.to_string(),
            },
            inbounds: vec![Inbound {
                tag: API_TAG.to_string(),
                protocol: "dokodemo-door".to_string(),
                listen: "127.0.0.1".to_string(),
                port: api_port,
                settings: InboundSettings {
                    address: Some("127.0.0.1".to_string()),
                    network: Some("tcp".to_string()),
                    ..Default::default()
                },
            }],
            outbounds: vec![Outbound {
                tag: FREEDOM_TAG.to_string(),
                protocol: "freedom".to_string(),
                settings: None,
                stream_settings: None,
            }],
            dns: Dns {
                servers: vec![
                    "8.8.8.8".to_string(),
                    "8.8.4.4".to_string(),
                    "localhost".to_string(),
                ],
            },
            stats: BTreeMap::new(),
            api: Api {
                tag: API_TAG.to_string(),
                services: vec!["StatsService".to_string()],
            },
            policy: Policy {
                levels: BTreeMap::from([("0".to_string(), user_levels)]),
                system,
            },
            routing: Routing {
                domain_strategy: "AsIs".to_string(),
                domain_matcher: "hybrid".to_string(),
                rules: vec![Rule::to_outbound(API_TAG, API_TAG)],
                balancers: Vec::new(),
            },
            reverse: Reverse::default(),
        }
    }

    pub fn shadowsocks_inbound(
        tag: impl Into<String>,
        key: String,
        method: &str,
        network: &str,
        port: u16,
        clients: Vec<Client>,
    ) -> Inbound {
        Inbound {
            tag: tag.into(),
            protocol: "shadowsocks".to_string(),
            listen: "0.0.0.0".to_string(),
            port,
            settings: InboundSettings {
                clients,
                network: Some(network.to_string()),
                method: Some(method.to_string()),
                password: Some(key),
                ..Default::default()
            },
        }
    }

    pub fn shadowsocks_outbound(
        tag: impl Into<String>,
        address: impl Into<String>,
        key: String,
        method: &str,
        port: u16,
    ) -> Outbound {
        Outbound {
            tag: tag.into(),
            protocol: "shadowsocks".to_string(),
            settings: Some(OutboundSettings {
                servers: vec![OutboundServer {
                    address: address.into(),
                    port,
                    method: method.to_string(),
                    password: key,
                    uot: true,
                }],
            }),
            stream_settings: Some(StreamSettings {
                network: "tcp".to_string(),
            }),
        }
    }

    pub fn find_inbound(&self, tag: &str) -> Option<&Inbound> {
        self.inbounds.iter().find(|i| i.tag == tag)
    }

    pub fn find_outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == tag)
    }

    pub fn find_balancer(&self, tag: &str) -> Option<&Balancer> {
        self.routing.balancers.iter().find(|b| b.tag == tag)
    }

    pub fn find_balancer_mut(&mut self, tag: &str) -> Option<&mut Balancer> {
        self.routing.balancers.iter_mut().find(|b| b.tag == tag)
    }

    pub fn api_port(&self) -> Option<u16> {
        self.find_inbound(API_TAG).map(|i| i.port)
    }

    /// Every port the document listens on or dials, in declaration order.
    pub fn ports(&self) -> Vec<u16> {
        let inbound_ports = self.inbounds.iter().map(|i| i.port);
        let outbound_ports = self
            .outbounds
            .iter()
            .filter_map(|o| o.settings.as_ref())
            .flat_map(|s| s.servers.iter().map(|srv| srv.port));
        inbound_ports.chain(outbound_ports).collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        match self.api_port() {
            None => return Err("api inbound not found".to_string()),
            Some(0) => return Err("api inbound has no port".to_string()),
            Some(_) => {}
        }
        if let Some(inbound) = self.inbounds.iter().find(|i| i.port == 0) {
            return Err(format!("inbound {} has no port", inbound.tag));
        }
        for rule in &self.routing.rules {
            if rule.outbound_tag.is_none() && rule.balancer_tag.is_none() {
                return Err(format!("rule for {:?} has no target", rule.inbound_tag));
            }
            if let Some(balancer) = &rule.balancer_tag {
                if self.find_balancer(balancer).is_none() {
                    return Err(format!("rule references unknown balancer {balancer}"));
                }
            }
        }
        Ok(())
    }
}
