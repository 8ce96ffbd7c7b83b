//! Cluster Node
//!
//! A [`Node`] is one server in the cluster. It is shared as `Arc<Node>`:
//! the node list, partition tables and every in-flight command hold a
//! reference, so a node removed by the tend thread stays usable until the
//! last command using it finishes.
//!
//! ## State
//!
//! ```text
//! identity    name, tls name, addresses (+ last good index), features
//! health      active flag, tend failure count
//! tend state  peers / partition / rebalance generations, rack snapshot
//! security    session token, "login needed" flag
//! pools       sync pools, async pools (one per loop), pipe pools (one per loop)
//! ```

use crate::auth::{self, Session};
use crate::cluster::rack::Racks;
use crate::cluster::snapshot::Snapshot;
use crate::cluster::ClusterContext;
use crate::error::{Error, Result};
use crate::event::{AsyncConnection, PipeHandle};
use crate::net::conn::op_timeout;
use crate::net::pool::scan_order;
use crate::net::{split_capacity, AddressList, Connection, ConnectionPool};
use crate::protocol::header::msg_type;
use crate::protocol::info::{self, InfoResponse};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Feature flags reported by the `features` info command.
pub mod features {
    pub const PEERS: u32 = 1;
    pub const REPLICAS: u32 = 1 << 1;
    pub const PIPELINING: u32 = 1 << 2;

    pub fn parse(value: &str) -> u32 {
        value.split(';').fold(0, |acc, f| {
            acc | match f.trim() {
                "peers" => PEERS,
                "replicas" => REPLICAS,
                "pipelining" => PIPELINING,
                _ => 0,
            }
        })
    }
}

/// What validation learned about a new node.
pub struct NodeInfo {
    pub name: String,
    pub tls_name: Option<String>,
    pub addresses: Vec<SocketAddr>,
    pub primary: SocketAddr,
    pub features: u32,
    pub session: Option<Session>,
    /// The validated connection, reused as the node's info connection.
    pub conn: Option<Connection>,
}

pub struct Node {
    name: String,
    tls_name: Option<String>,
    addresses: AddressList,
    features: u32,
    ctx: Arc<ClusterContext>,

    racks: Snapshot<Racks>,
    peers_generation: AtomicU32,
    partition_generation: AtomicU32,
    rebalance_generation: AtomicU32,
    peers_count: AtomicUsize,

    active: AtomicBool,
    failures: AtomicU32,
    perform_login: AtomicBool,
    session: RwLock<Option<Arc<Session>>>,

    sync_pools: Vec<ConnectionPool<Connection>>,
    sync_iter: AtomicUsize,
    async_pools: Vec<ConnectionPool<AsyncConnection>>,
    pipe_pools: Vec<ConnectionPool<PipeHandle>>,
    info_conn: Mutex<Option<Connection>>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("address", &self.addresses.primary())
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addresses.primary() {
            Some(addr) => write!(f, "{} {}", self.name, addr),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Node {
    pub(crate) fn new(info: NodeInfo, ctx: Arc<ClusterContext>) -> Arc<Node> {
        let config = &ctx.config;
        let sync_pools = split_capacity(config.max_conns_per_node, config.conn_pools_per_node)
            .into_iter()
            .map(ConnectionPool::new)
            .collect();
        let async_pools = split_capacity(config.async_max_conns_per_node, config.event_loops)
            .into_iter()
            .map(ConnectionPool::new)
            .collect();
        let pipe_pools = split_capacity(config.pipe_max_conns_per_node, config.event_loops)
            .into_iter()
            .map(ConnectionPool::new)
            .collect();

        let addresses = AddressList::new(&info.addresses, Some(info.primary));
        info!(node = %info.name, addr = %info.primary, "Add node");

        Arc::new(Node {
            name: info.name,
            tls_name: info.tls_name,
            addresses,
            features: info.features,
            racks: Snapshot::new(Racks::default()),
            peers_generation: AtomicU32::new(u32::MAX),
            partition_generation: AtomicU32::new(u32::MAX),
            rebalance_generation: AtomicU32::new(u32::MAX),
            peers_count: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            failures: AtomicU32::new(0),
            perform_login: AtomicBool::new(false),
            session: RwLock::new(info.session.map(Arc::new)),
            sync_pools,
            sync_iter: AtomicUsize::new(0),
            async_pools,
            pipe_pools,
            info_conn: Mutex::new(info.conn),
            ctx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addresses(&self) -> &AddressList {
        &self.addresses
    }

    pub fn primary_address(&self) -> Option<SocketAddr> {
        self.addresses.primary()
    }

    pub(crate) fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    /// Name checked against the server certificate.
    pub fn tls_name(&self) -> Option<&str> {
        self.tls_name.as_deref()
    }

    pub fn has_feature(&self, feature: u32) -> bool {
        self.features & feature != 0
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stops routing commands to this node. Never undone.
    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            warn!(node = %self.name, "Node deactivated");
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_failures(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    pub fn has_rack(&self, namespace: &str, rack: i32) -> bool {
        self.racks.load().has_rack(namespace, rack)
    }

    pub(crate) fn set_racks(&self, racks: Racks) {
        self.racks.store(Arc::new(racks));
    }

    pub fn peers_generation(&self) -> u32 {
        self.peers_generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_peers_generation(&self, generation: u32) {
        self.peers_generation.store(generation, Ordering::Release);
    }

    pub fn partition_generation(&self) -> u32 {
        self.partition_generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_partition_generation(&self, generation: u32) {
        self.partition_generation.store(generation, Ordering::Release);
    }

    /// Makes the next tend cycle re-read this node's partitions.
    pub(crate) fn force_partition_refresh(&self) {
        self.partition_generation.store(u32::MAX, Ordering::Release);
    }

    pub fn rebalance_generation(&self) -> u32 {
        self.rebalance_generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_rebalance_generation(&self, generation: u32) {
        self.rebalance_generation.store(generation, Ordering::Release);
    }

    pub fn peers_count(&self) -> usize {
        self.peers_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_peers_count(&self, count: usize) {
        self.peers_count.store(count, Ordering::Relaxed);
    }

    pub(crate) fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    pub(crate) fn set_session(&self, session: Option<Session>) {
        *self.session.write() = session.map(Arc::new);
    }

    /// Asks the tend thread to log in again, waking it right away.
    pub fn signal_login(&self) {
        if self
            .perform_login
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(node = %self.name, "Login requested");
            self.ctx.tend.wake();
        }
    }

    pub(crate) fn login_requested(&self) -> bool {
        self.perform_login.load(Ordering::Acquire)
    }

    // ---------------------------------------------------------------------
    // Sync connections
    // ---------------------------------------------------------------------

    /// Takes a pooled connection or opens a new one.
    pub fn get_connection(&self, deadline: Option<Instant>) -> Result<Connection> {
        let max = self.sync_pools.len();
        let initial = self.sync_iter.fetch_add(1, Ordering::Relaxed) % max;
        let max_idle = self.ctx.config.max_socket_idle;

        for index in scan_order(initial, max) {
            let pool = &self.sync_pools[index];

            while let Some(conn) = pool.pop() {
                if conn.is_valid(max_idle) {
                    return Ok(conn);
                }
                debug!(node = %self.name, "Discarding stale connection");
                drop(conn);
                pool.release_slot();
            }

            if pool.try_reserve() {
                return match self.create_connection(deadline) {
                    Ok(mut conn) => {
                        conn.pool = index;
                        Ok(conn)
                    }
                    Err(e) => {
                        pool.release_slot();
                        Err(e)
                    }
                };
            }
        }

        Err(Error::NoMoreConnections {
            node: self.name.clone(),
            limit: self.ctx.config.max_conns_per_node,
        })
    }

    /// Returns a healthy connection to its pool.
    pub fn put_connection(&self, mut conn: Connection) {
        conn.touch();
        let pool = &self.sync_pools[conn.pool];
        if let Err(conn) = pool.push(conn) {
            drop(conn);
            pool.release_slot();
        }
    }

    /// Closes a connection whose stream can no longer be trusted.
    pub fn close_connection(&self, conn: Connection) {
        let pool = &self.sync_pools[conn.pool];
        drop(conn);
        pool.release_slot();
    }

    fn connect_timeout(&self, deadline: Option<Instant>) -> Result<Duration> {
        Ok(op_timeout(Some(self.ctx.config.connect_timeout), deadline)?
            .unwrap_or(self.ctx.config.connect_timeout))
    }

    pub(crate) fn create_connection(&self, deadline: Option<Instant>) -> Result<Connection> {
        let timeout = self.connect_timeout(deadline)?;
        let tls = self
            .ctx
            .tls
            .as_ref()
            .map(|t| (t, self.tls_name.as_deref().unwrap_or(&self.name)));

        let mut conn = self
            .addresses
            .connect_with(|addr| Connection::connect(addr, timeout, tls))
            .map_err(|e| e.with_context(format!("node {}", self.name)))?;
        self.authenticate(&mut conn)?;
        Ok(conn)
    }

    /// Authenticates a new connection with the session token, or logs in
    /// when there is no session yet.
    fn authenticate(&self, conn: &mut Connection) -> Result<()> {
        let Some(auth_config) = &self.ctx.config.auth else {
            return Ok(());
        };
        let timeout = self.ctx.config.login_timeout;

        if let Some(session) = self.session() {
            let request = auth::encode_authenticate(&auth_config.user, &session.token);
            let (_, body) = conn.round_trip(&request, msg_type::ADMIN, timeout)?;
            if let Err(e) = auth::check_authenticate(&body) {
                self.signal_login();
                return Err(e.with_context(format!("node {}", self)));
            }
            return Ok(());
        }

        let session = login(conn, auth_config, timeout)?;
        self.set_session(session);
        Ok(())
    }

    /// Closes sync connections idle longer than `max_socket_idle`.
    pub(crate) fn close_idle_connections(&self) -> usize {
        let max_idle = self.ctx.config.max_socket_idle;
        if max_idle.is_zero() {
            return 0;
        }
        self.sync_pools
            .iter()
            .map(|pool| pool.sweep(|conn| conn.idle_for() > max_idle))
            .sum()
    }

    pub fn sync_open_count(&self) -> usize {
        self.sync_pools.iter().map(|p| p.open_count()).sum()
    }

    // ---------------------------------------------------------------------
    // Async connections (touched only by the owning worker loop)
    // ---------------------------------------------------------------------

    pub(crate) fn async_pool(&self, loop_index: usize) -> Result<&ConnectionPool<AsyncConnection>> {
        self.async_pools
            .get(loop_index)
            .ok_or_else(|| Error::InvalidArgument(format!("no event loop {}", loop_index)))
    }

    pub(crate) fn pipe_pool(&self, loop_index: usize) -> Result<&ConnectionPool<PipeHandle>> {
        self.pipe_pools
            .get(loop_index)
            .ok_or_else(|| Error::InvalidArgument(format!("no event loop {}", loop_index)))
    }

    pub fn async_open_count(&self) -> usize {
        self.async_pools.iter().map(|p| p.open_count()).sum()
    }

    // ---------------------------------------------------------------------
    // Info
    // ---------------------------------------------------------------------

    /// Runs an info request on the node's dedicated tend connection.
    ///
    /// Any failure closes that connection so the next call reconnects.
    pub(crate) fn tend_info(&self, names: &[&str]) -> Result<InfoResponse> {
        let timeout = self.ctx.config.info_policy.timeout;
        let mut guard = self.info_conn.lock();

        if guard.is_none() {
            *guard = Some(self.create_connection(Some(Instant::now() + timeout))?);
        }

        let result = match guard.as_mut() {
            Some(conn) => conn
                .info(&info::encode_request(names), timeout)
                .and_then(|body| InfoResponse::parse(&body, names)),
            None => Err(Error::Closed),
        };

        if result.is_err() {
            *guard = None;
        }
        result
    }

    /// Logs in on the tend connection when a login was requested or the
    /// session is about to expire.
    pub(crate) fn refresh_session(&self) -> Result<()> {
        let Some(auth_config) = &self.ctx.config.auth else {
            return Ok(());
        };
        let expiring = self
            .session()
            .map_or(true, |s| s.needs_refresh(Instant::now()));
        if !self.login_requested() && !expiring {
            return Ok(());
        }

        let timeout = self.ctx.config.login_timeout;
        let mut guard = self.info_conn.lock();
        if guard.is_none() {
            *guard = Some(self.create_connection(Some(Instant::now() + timeout))?);
        }
        let result = match guard.as_mut() {
            Some(conn) => login(conn, auth_config, timeout),
            None => Err(Error::Closed),
        };

        match result {
            Ok(session) => {
                self.set_session(session);
                self.perform_login.store(false, Ordering::Release);
                info!(node = %self.name, "Login succeeded");
                Ok(())
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    pub(crate) fn close_info_connection(&self) {
        self.info_conn.lock().take();
    }

    /// User facing info request on a pooled connection.
    pub fn info(&self, names: &[&str], timeout: Duration) -> Result<InfoResponse> {
        let mut conn = self.get_connection(Some(Instant::now() + timeout))?;
        match conn.info(&info::encode_request(names), timeout) {
            Ok(body) => {
                self.put_connection(conn);
                InfoResponse::parse(&body, names)
            }
            Err(e) => {
                self.close_connection(conn);
                Err(e.with_context(format!("node {}", self)))
            }
        }
    }

    /// Drains the sync pools and the info connection. Async pools are
    /// drained by their worker loops.
    pub(crate) fn close(&self) {
        self.close_info_connection();
        let closed: usize = self.sync_pools.iter().map(|p| p.drain()).sum();
        debug!(node = %self.name, closed, "Closed node connections");
    }
}

pub(crate) fn login(
    conn: &mut Connection,
    auth_config: &crate::config::AuthConfig,
    timeout: Duration,
) -> Result<Option<Session>> {
    let request = auth::encode_login(&auth_config.user, &auth_config.credential);
    let (_, body) = conn.round_trip(&request, msg_type::ADMIN, timeout)?;
    auth::parse_login(&body, Instant::now())
}
