//! Turns users, nodes and settings into engine configs for the hub and for
//! each node.
//!
//! The hub side exposes user-facing inbounds (`relay`, `reverse`, `direct`)
//! and routes `relay`/`reverse` traffic into balancers whose selectors list one
//! entry per node. Each node gets a reverse-tunnel inbound (`foreign-<id>`)
//! bound to a portal (`portal-<id>`) and, with relay on, a relay outbound
//! (`relay-<id>`). The node side mirrors those legs. Portal and bridge are
//! paired only through [`portal_domain`].

use thiserror::Error;
use tracing::{debug, warn};

use crate::db::models::{Node, Settings, User};
use crate::ports::PortAllocator;
use crate::utils::key32;
use crate::xray::config::{
    Balancer, Client, DEFAULT_API_PORT, EngineConfig, FREEDOM_TAG, ReverseItem, Rule,
    SHADOWSOCKS_2022_METHOD, SHADOWSOCKS_METHOD,
};

pub const RELAY_TAG: &str = "relay";
pub const REVERSE_TAG: &str = "reverse";
pub const DIRECT_TAG: &str = "direct";
pub const PORTAL_BALANCER_TAG: &str = "portal";
pub const BRIDGE_TAG: &str = "bridge";
pub const FOREIGN_TAG: &str = "foreign";
const TUNNEL_DOMAIN: &str = "google.com";

#[derive(Error, Debug)]
pub enum SynthError {
    #[error("No free port left to allocate")]
    NoFreePort,
    #[error("Port allocation failed: {0}")]
    Io(#[source] std::io::Error),
}

/// Synthetic domain pairing the hub portal with the node bridge.
pub fn portal_domain(node_id: i64) -> String {
    format!("s{node_id}.{TUNNEL_DOMAIN}")
}

pub fn foreign_tag(node_id: i64) -> String {
    format!("{FOREIGN_TAG}-{node_id}")
}

pub fn portal_tag(node_id: i64) -> String {
    format!("portal-{node_id}")
}

pub fn relay_tag(node_id: i64) -> String {
    format!("{RELAY_TAG}-{node_id}")
}

/// Whether `local` carries every hub-side leg the enabled features need for
/// the node. A node added after the last synthesis is not wired yet.
pub fn node_wired(node_id: i64, local: &EngineConfig, settings: &Settings) -> bool {
    let relay = !settings.relay_enabled() || local.find_outbound(&relay_tag(node_id)).is_some();
    let reverse = !settings.reverse_enabled() || local.find_inbound(&foreign_tag(node_id)).is_some();
    relay && reverse
}

#[derive(Debug, Clone)]
pub struct ConfigSynthesizer {
    log_level: String,
}

impl ConfigSynthesizer {
    pub fn new(log_level: impl Into<String>) -> Self {
        Self {
            log_level: log_level.into(),
        }
    }

    fn clients(users: &[User]) -> Vec<Client> {
        users
            .iter()
            .filter(|u| u.enabled)
            .map(|u| Client {
                password: u.shadowsocks_password.clone(),
                method: u.shadowsocks_method.clone(),
                email: u.id.to_string(),
            })
            .collect()
    }

    pub fn local_config(
        &self,
        users: &[User],
        nodes: &[Node],
        settings: &Settings,
    ) -> Result<EngineConfig, SynthError> {
        let mut ports = PortAllocator::new();
        ports.reserve([
            settings.ss_relay_port,
            settings.ss_reverse_port,
            settings.ss_direct_port,
        ]);

        let mut config = EngineConfig::skeleton(&self.log_level, ports.allocate()?);
        let clients = Self::clients(users);

        if !clients.is_empty() {
            for (tag, port) in [
                (RELAY_TAG, settings.ss_relay_port),
                (REVERSE_TAG, settings.ss_reverse_port),
                (DIRECT_TAG, settings.ss_direct_port),
            ] {
                if port > 0 {
                    config.inbounds.push(EngineConfig::shadowsocks_inbound(
                        tag,
                        key32(),
                        SHADOWSOCKS_METHOD,
                        "tcp,udp",
                        port,
                        clients.clone(),
                    ));
                }
            }

            if settings.direct_enabled() {
                config.routing.rules.push(Rule::to_outbound(DIRECT_TAG, FREEDOM_TAG));
            }
            if !nodes.is_empty() {
                if settings.relay_enabled() {
                    config.routing.rules.push(Rule::to_balancer(RELAY_TAG, RELAY_TAG));
                }
                if settings.reverse_enabled() {
                    config
                        .routing
                        .rules
                        .push(Rule::to_balancer(REVERSE_TAG, PORTAL_BALANCER_TAG));
                }
            }
        }

        if !nodes.is_empty() {
            if settings.relay_enabled() {
                config.routing.balancers.push(Balancer {
                    tag: RELAY_TAG.to_string(),
                    selector: Vec::new(),
                });
            }
            if settings.reverse_enabled() {
                config.routing.balancers.push(Balancer {
                    tag: PORTAL_BALANCER_TAG.to_string(),
                    selector: Vec::new(),
                });
            }
        }

        for node in nodes {
            if settings.reverse_enabled() {
                config.inbounds.push(EngineConfig::shadowsocks_inbound(
                    foreign_tag(node.id),
                    key32(),
                    SHADOWSOCKS_2022_METHOD,
                    "tcp",
                    ports.allocate()?,
                    Vec::new(),
                ));
                config.reverse.portals.push(ReverseItem {
                    tag: portal_tag(node.id),
                    domain: portal_domain(node.id),
                });
                config
                    .routing
                    .rules
                    .push(Rule::to_outbound(foreign_tag(node.id), portal_tag(node.id)));
                if let Some(balancer) = config.find_balancer_mut(PORTAL_BALANCER_TAG) {
                    balancer.selector.push(portal_tag(node.id));
                }
            }

            if settings.relay_enabled() {
                config.outbounds.push(EngineConfig::shadowsocks_outbound(
                    relay_tag(node.id),
                    node.host.clone(),
                    key32(),
                    SHADOWSOCKS_2022_METHOD,
                    ports.allocate()?,
                ));
                if let Some(balancer) = config.find_balancer_mut(RELAY_TAG) {
                    balancer.selector.push(relay_tag(node.id));
                }
            }
        }

        debug!(
            inbounds = config.inbounds.len(),
            outbounds = config.outbounds.len(),
            "Local engine config synthesized."
        );
        Ok(config)
    }

    /// Builds the node's config from the hub's current local config. Legs the
    /// local config has no counterpart for (node added since the last
    /// synthesis) are left out.
    pub fn remote_config(&self, node: &Node, local: &EngineConfig, settings: &Settings) -> EngineConfig {
        let mut config = EngineConfig::skeleton(&self.log_level, DEFAULT_API_PORT);

        if settings.relay_enabled() {
            match local.find_outbound(&relay_tag(node.id)).and_then(|o| o.server()) {
                Some(server) => {
                    config.inbounds.push(EngineConfig::shadowsocks_inbound(
                        DIRECT_TAG,
                        server.password.clone(),
                        &server.method,
                        "tcp",
                        server.port,
                        Vec::new(),
                    ));
                    config.routing.rules.push(Rule::to_outbound(DIRECT_TAG, FREEDOM_TAG));
                }
                None => warn!(node_id = node.id, "Relay outbound missing in local config."),
            }
        }

        if settings.reverse_enabled() {
            let foreign = local.find_inbound(&foreign_tag(node.id));
            match foreign.and_then(|i| Some((i, i.settings.password.clone()?, i.settings.method.clone()?))) {
                Some((inbound, password, method)) => {
                    config.outbounds.push(EngineConfig::shadowsocks_outbound(
                        FOREIGN_TAG,
                        settings.host.clone(),
                        password,
                        &method,
                        inbound.port,
                    ));
                    config.reverse.bridges.push(ReverseItem {
                        tag: BRIDGE_TAG.to_string(),
                        domain: portal_domain(node.id),
                    });
                    config.routing.rules.push(
                        Rule::to_outbound(BRIDGE_TAG, FOREIGN_TAG)
                            .with_domain(format!("full:{}", portal_domain(node.id))),
                    );
                    config.routing.rules.push(Rule::to_outbound(BRIDGE_TAG, FREEDOM_TAG));
                }
                None => warn!(node_id = node.id, "Reverse inbound missing in local config."),
            }
        }

        config
    }
}
