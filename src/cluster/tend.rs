//! Tend Loop
//!
//! One cycle, on the `fleetkv-tend` thread:
//!
//! ```text
//! 1. no nodes?          seed from configured hosts
//! 2. every node         login if needed, info check request:
//!                         node                  -> identity check
//!                         *-generation          -> schedule refreshes
//!                         services              -> candidate hosts
//! 3. peers changed      peers-* request, validate and add new nodes
//! 4. partitions changed replicas request, rebuild partition map (copy on write)
//! 5. racks changed      rack-ids request, swap node rack snapshot
//! 6. remove             inactive nodes and nodes over the failure limit
//! 7. idle sweep         sync pools here, async pools on their loops
//! ```

use crate::cluster::node::{self, features, Node, NodeInfo};
use crate::cluster::partition;
use crate::cluster::peers::{self, Peer};
use crate::cluster::rack::Racks;
use crate::cluster::Cluster;
use crate::config::Host;
use crate::error::{Error, Result};
use crate::net::Connection;
use crate::protocol::info::{self, InfoResponse};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Entry point of the tend thread.
pub(super) fn run(cluster: Arc<Cluster>) {
    let interval = cluster.ctx.config.tend_interval;
    debug!("Tend thread started");

    while cluster.ctx.tend.wait(interval) {
        cluster.tend();
    }

    debug!("Tend thread stopped");
}

/// Work discovered while refreshing nodes.
#[derive(Default)]
struct TendPass {
    new_nodes: Vec<Arc<Node>>,
    partition_refresh: Vec<Arc<Node>>,
    rack_refresh: Vec<Arc<Node>>,
    service_hosts: Vec<Host>,
}

impl TendPass {
    fn knows(&self, nodes: &[Arc<Node>], name: &str) -> bool {
        nodes.iter().chain(self.new_nodes.iter()).any(|n| n.name() == name)
    }

    fn knows_address(&self, nodes: &[Arc<Node>], addr: &SocketAddr) -> bool {
        nodes
            .iter()
            .chain(self.new_nodes.iter())
            .any(|n| n.addresses().contains(addr))
    }
}

impl Cluster {
    pub(crate) fn tend(&self) {
        if self.is_closed() {
            return;
        }
        let started = Instant::now();
        let before = self.nodes.load();
        let mut nodes: Vec<Arc<Node>> = before.as_ref().clone();
        let mut changed = false;

        if nodes.is_empty() {
            changed |= self.seed_nodes(&mut nodes);
        }

        let mut pass = TendPass::default();
        let mut i = 0;
        while i < nodes.len() {
            let node = Arc::clone(&nodes[i]);
            i += 1;

            if let Err(e) = self.refresh_node(&node, &nodes, &mut pass) {
                self.node_failed(&node, &e);
            }

            let hosts = std::mem::take(&mut pass.service_hosts);
            for host in hosts {
                self.add_service_host(&host, &nodes, &mut pass);
            }

            if !pass.new_nodes.is_empty() {
                nodes.append(&mut pass.new_nodes);
                changed = true;
            }
        }

        if !pass.partition_refresh.is_empty() {
            self.refresh_partitions(&pass.partition_refresh);
        }
        for node in &pass.rack_refresh {
            if let Err(e) = refresh_racks(node) {
                self.node_failed(node, &e);
            }
        }

        changed |= self.remove_nodes(&mut nodes);
        if changed {
            self.nodes.store(Arc::new(nodes));
        }

        self.sweep_idle();
        trace!(elapsed = ?started.elapsed(), "Tend cycle finished");
    }

    fn seed_nodes(&self, nodes: &mut Vec<Arc<Node>>) -> bool {
        let mut added = false;
        for host in &self.ctx.config.hosts {
            match self.validate_host(host, None) {
                Ok(info) => {
                    if nodes.iter().any(|n| n.name() == info.name) {
                        debug!(host = %host, node = %info.name, "Seed is an alias of a known node");
                        continue;
                    }
                    nodes.push(Node::new(info, Arc::clone(&self.ctx)));
                    added = true;
                }
                Err(e) => warn!(host = %host, error = %e, "Seed failed"),
            }
        }
        added
    }

    fn check_request(&self, node: &Node) -> Vec<&'static str> {
        let config = &self.ctx.config;
        if node.has_feature(features::PEERS) {
            let mut names = vec!["node", "peers-generation", "partition-generation"];
            if config.rack_aware {
                names.push("rebalance-generation");
            }
            names
        } else if config.use_services_alternate {
            vec!["node", "partition-generation", "services-alternate"]
        } else {
            vec!["node", "partition-generation", "services"]
        }
    }

    fn refresh_node(&self, node: &Arc<Node>, nodes: &[Arc<Node>], pass: &mut TendPass) -> Result<()> {
        if !node.is_active() {
            return Ok(());
        }
        node.refresh_session()?;

        let names = self.check_request(node);
        let response = node.tend_info(&names)?;

        let reported = response.require("node")?;
        if reported != node.name() {
            node.deactivate();
            return Err(Error::NodeMismatch {
                expected: node.name().to_string(),
                received: reported.to_string(),
            });
        }

        for (name, value) in response.iter() {
            match name {
                "node" => {}
                "peers-generation" => {
                    let generation = info::parse_generation(name, value)?;
                    if generation != node.peers_generation() {
                        debug!(node = %node.name(), generation, "Peers changed");
                        self.refresh_peers(node, nodes, pass)?;
                    }
                }
                "partition-generation" => {
                    let generation = info::parse_generation(name, value)?;
                    if generation != node.partition_generation() {
                        pass.partition_refresh.push(Arc::clone(node));
                    }
                }
                "rebalance-generation" => {
                    let generation = info::parse_generation(name, value)?;
                    if generation != node.rebalance_generation() {
                        pass.rack_refresh.push(Arc::clone(node));
                    }
                }
                "services" | "services-alternate" => {
                    pass.service_hosts.extend(peers::parse_services(value)?);
                }
                other => {
                    return Err(Error::Protocol(format!("unexpected info name '{}'", other)));
                }
            }
        }

        node.reset_failures();
        Ok(())
    }

    fn peers_command(&self) -> &'static str {
        match &self.ctx.tls {
            Some(_) if self.ctx.config.tls.as_ref().is_some_and(|t| t.use_alternate_peers) => {
                "peers-tls-alt"
            }
            Some(_) => "peers-tls-std",
            None if self.ctx.config.use_services_alternate => "peers-clear-alt",
            None => "peers-clear-std",
        }
    }

    fn refresh_peers(&self, node: &Arc<Node>, nodes: &[Arc<Node>], pass: &mut TendPass) -> Result<()> {
        let command = self.peers_command();
        let response = node.tend_info(&["peers-generation", command])?;
        let list = peers::parse_peers(response.require(command)?)?;

        for peer in &list.peers {
            if pass.knows(nodes, &peer.node_name) {
                continue;
            }
            match self.validate_peer(peer) {
                Ok(info) => pass.new_nodes.push(Node::new(info, Arc::clone(&self.ctx))),
                Err(e) => warn!(peer = %peer.node_name, error = %e, "Peer validation failed"),
            }
        }

        node.set_peers_count(list.peers.len());
        node.set_peers_generation(list.generation);
        Ok(())
    }

    fn validate_peer(&self, peer: &Peer) -> Result<NodeInfo> {
        let mut last_err = None;
        for host in &peer.hosts {
            match self.validate_host(host, Some(&peer.node_name)) {
                Ok(info) => return Ok(info),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::InvalidNode(format!("peer {} has no hosts", peer.node_name))
        }))
    }

    fn add_service_host(&self, host: &Host, nodes: &[Arc<Node>], pass: &mut TendPass) {
        let addrs = match host.resolve() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(host = %host, error = %e, "Cannot resolve service host");
                return;
            }
        };
        if addrs.iter().any(|a| pass.knows_address(nodes, a)) {
            return;
        }

        match self.validate_host(host, None) {
            Ok(info) if pass.knows(nodes, &info.name) => {
                debug!(host = %host, node = %info.name, "Service host is an alias");
            }
            Ok(info) => pass.new_nodes.push(Node::new(info, Arc::clone(&self.ctx))),
            Err(e) => warn!(host = %host, error = %e, "Service host validation failed"),
        }
    }

    /// Connects to a host, logs in and asks for its name and features.
    pub(crate) fn validate_host(&self, host: &Host, expected: Option<&str>) -> Result<NodeInfo> {
        let addrs = host.resolve()?;
        let tls_name = match (&host.tls_name, &self.ctx.tls) {
            (Some(name), _) => Some(name.clone()),
            (None, Some(_)) => Some(host.name.clone()),
            (None, None) => None,
        };

        let mut last_err = None;
        for &addr in &addrs {
            match self.validate_address(addr, tls_name.as_deref()) {
                Ok((name, features, session, conn)) => {
                    if let Some(expected) = expected {
                        if expected != name {
                            last_err = Some(Error::NodeMismatch {
                                expected: expected.to_string(),
                                received: name,
                            });
                            continue;
                        }
                    }
                    return Ok(NodeInfo {
                        name,
                        tls_name,
                        addresses: addrs.clone(),
                        primary: addr,
                        features,
                        session,
                        conn: Some(conn),
                    });
                }
                Err(e) => last_err = Some(e.with_context(addr.to_string())),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::InvalidNode(format!("no address for {}", host))))
    }

    fn validate_address(
        &self,
        addr: SocketAddr,
        tls_name: Option<&str>,
    ) -> Result<(String, u32, Option<crate::auth::Session>, Connection)> {
        let config = &self.ctx.config;
        let tls = match (&self.ctx.tls, tls_name) {
            (Some(ctx), Some(name)) => Some((ctx, name)),
            (Some(_), None) => return Err(Error::Tls("missing TLS name".into())),
            _ => None,
        };
        let mut conn = Connection::connect(addr, config.connect_timeout, tls)?;

        let session = match &config.auth {
            Some(auth) => node::login(&mut conn, auth, config.login_timeout)?,
            None => None,
        };

        let names = ["node", "features"];
        let body = conn.info(&info::encode_request(&names), config.info_policy.timeout)?;
        let response = InfoResponse::parse(&body, &names)?;
        let name = response.require("node")?.to_string();
        if name.is_empty() {
            return Err(Error::InvalidNode(format!("{} reported an empty name", addr)));
        }
        let features = features::parse(response.get("features").unwrap_or(""));
        Ok((name, features, session, conn))
    }

    fn refresh_partitions(&self, refresh: &[Arc<Node>]) {
        let mut map = self.partitions.load().as_ref().clone();
        let mut changed = false;

        for node in refresh {
            if !node.is_active() {
                continue;
            }
            let command = if node.has_feature(features::REPLICAS) {
                "replicas"
            } else {
                "replicas-all"
            };

            let result = node
                .tend_info(&["partition-generation", command])
                .and_then(|response| {
                    let generation =
                        info::parse_generation("partition-generation", response.require("partition-generation")?)?;
                    partition::apply_replicas(
                        &mut map,
                        node,
                        response.require(command)?,
                        command == "replicas",
                    )?;
                    Ok(generation)
                });

            match result {
                Ok(generation) => {
                    node.set_partition_generation(generation);
                    changed = true;
                }
                Err(e) => self.node_failed(node, &e),
            }
        }

        if changed {
            self.partitions.store(Arc::new(map));
        }
    }

    fn node_failed(&self, node: &Arc<Node>, err: &Error) {
        node.close_info_connection();
        let failures = node.record_failure();
        match err.root() {
            Error::NodeMismatch { .. } => {
                error!(node = %node, error = %err, "Node identity changed")
            }
            _ => warn!(node = %node, failures, error = %err, "Node refresh failed"),
        }
    }

    fn remove_nodes(&self, nodes: &mut Vec<Arc<Node>>) -> bool {
        let max_failures = self.ctx.config.max_node_failures;
        let (keep, removed): (Vec<_>, Vec<_>) = nodes
            .drain(..)
            .partition(|n| n.is_active() && n.failures() < max_failures);
        *nodes = keep;

        if removed.is_empty() {
            return false;
        }

        let mut map = self.partitions.load().as_ref().clone();
        let mut cleared = 0;
        for node in &removed {
            info!(node = %node, "Remove node");
            node.deactivate();
            node.close();
            if let Some(loops) = &self.loops {
                loops.close_node(node);
            }
            cleared += partition::remove_node(&mut map, node);
        }
        if cleared > 0 {
            debug!(cleared, "Cleared partitions of removed nodes");
            self.partitions.store(Arc::new(map));
        }
        true
    }

    fn sweep_idle(&self) {
        let nodes = self.nodes.load();
        for node in nodes.iter() {
            let closed = node.close_idle_connections();
            if closed > 0 {
                debug!(node = %node.name(), closed, "Closed idle connections");
            }
        }
        if let Some(loops) = &self.loops {
            loops.sweep_idle(&nodes);
        }
    }
}

fn refresh_racks(node: &Arc<Node>) -> Result<()> {
    let response = node.tend_info(&["rebalance-generation", "rack-ids"])?;
    let generation =
        info::parse_generation("rebalance-generation", response.require("rebalance-generation")?)?;
    let racks = Racks::parse(response.require("rack-ids")?)?;
    debug!(node = %node.name(), racks = ?racks, "Updated racks");
    node.set_racks(racks);
    node.set_rebalance_generation(generation);
    Ok(())
}
