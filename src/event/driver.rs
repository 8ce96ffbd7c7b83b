//! Async Command Driver
//!
//! Runs on a worker loop. Resolves the node, takes a connection from the
//! loop's async pool (or opens one), then feeds socket readiness into the
//! [`AsyncCommand`] until it finishes.
//!
//! ## Timers
//!
//! ```text
//! socket timer   fires every socket_timeout; re-arms while reads keep
//!                arriving, fails the attempt after a silent period
//! total deadline checked whenever the socket timer fires and between retries
//! ```

use crate::auth;
use crate::cluster::node::features;
use crate::cluster::{Cluster, Node};
use crate::command::{should_retry, Route};
use crate::error::{Error, Result};
use crate::event::io::{Interest, NonBlockingIo, Transport};
use crate::event::pipeline;
use crate::event::state::{AsyncCommand, Step};
use crate::net::conn::op_timeout;
use crate::net::ConnectionPool;
use crate::policy::BasePolicy;
use crate::protocol::ResponseParser;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// A pooled non-blocking connection, owned by one worker loop.
#[derive(Debug)]
pub struct AsyncConnection {
    transport: Transport,
    last_used: Instant,
}

impl AsyncConnection {
    fn new(transport: Transport) -> Self {
        Self {
            transport,
            last_used: Instant::now(),
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn is_valid(&mut self, max_idle: Duration) -> bool {
        if !max_idle.is_zero() && self.idle_for() > max_idle {
            return false;
        }
        self.transport.is_idle()
    }
}

/// Everything an async command needs besides the cluster.
pub(crate) struct AsyncRequest<P> {
    pub route: Route,
    pub request: Bytes,
    pub parser: P,
    pub policy: BasePolicy,
    pub is_write: bool,
    pub pipeline: bool,
}

/// The retry loop of an async command.
pub(crate) async fn execute<P>(
    cluster: Arc<Cluster>,
    loop_index: usize,
    req: AsyncRequest<P>,
) -> Result<P>
where
    P: ResponseParser + Clone + Send + 'static,
{
    let AsyncRequest {
        route,
        request,
        parser,
        policy,
        is_write,
        pipeline,
    } = req;
    let deadline = policy.deadline();
    let socket_timeout = policy.socket_timeout();
    let mut iteration = 0;

    loop {
        let result = match route.resolve(&cluster, iteration) {
            Ok(node) => {
                let cmd = AsyncCommand::new(request.clone(), parser.clone());
                if pipeline && node.has_feature(features::PIPELINING) {
                    pipeline::submit(&node, loop_index, cmd, is_write, socket_timeout, deadline).await
                } else {
                    attempt(&node, loop_index, cmd, is_write, socket_timeout, deadline).await
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(parser) => return Ok(parser),
            Err(e) if should_retry(&e, iteration, &policy, deadline) => {
                debug!(iteration, error = %e, "Retrying async command");
                iteration += 1;
                if !policy.sleep_between_retries.is_zero() {
                    tokio::time::sleep(policy.sleep_between_retries).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn attempt<P: ResponseParser>(
    node: &Arc<Node>,
    loop_index: usize,
    mut cmd: AsyncCommand<P>,
    is_write: bool,
    socket_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Result<P> {
    let pool = node.async_pool(loop_index)?;
    let (mut conn, fresh) = acquire(node, pool, deadline).await?;
    let auth = if fresh { auth_request(node) } else { None };
    cmd.start(fresh, conn.transport.is_tls(), auth);

    match drive(&mut conn.transport, &mut cmd, socket_timeout, deadline).await {
        Ok(()) => {
            release(pool, conn);
            Ok(cmd.into_parser())
        }
        Err(e) => {
            if e.is_fatal_for_connection() {
                drop(conn);
                pool.release_slot();
            } else {
                release(pool, conn);
            }
            if matches!(e.root(), Error::Auth { .. }) {
                node.signal_login();
            }
            Err(e
                .set_in_doubt(is_write && cmd.is_sent())
                .with_context(format!("node {}", node)))
        }
    }
}

fn release(pool: &ConnectionPool<AsyncConnection>, mut conn: AsyncConnection) {
    conn.last_used = Instant::now();
    if let Err(conn) = pool.push(conn) {
        drop(conn);
        pool.release_slot();
    }
}

/// Pops a valid pooled connection or opens a new one. The flag is true for
/// new connections.
async fn acquire(
    node: &Node,
    pool: &ConnectionPool<AsyncConnection>,
    deadline: Option<Instant>,
) -> Result<(AsyncConnection, bool)> {
    let max_idle = node.context().config.max_socket_idle;
    while let Some(mut conn) = pool.pop() {
        if conn.is_valid(max_idle) {
            return Ok((conn, false));
        }
        trace!(node = %node.name(), "Discarding stale async connection");
        drop(conn);
        pool.release_slot();
    }

    if !pool.try_reserve() {
        return Err(Error::NoMoreConnections {
            node: node.name().to_string(),
            limit: node.context().config.async_max_conns_per_node,
        });
    }
    match connect(node, deadline).await {
        Ok(transport) => Ok((AsyncConnection::new(transport), true)),
        Err(e) => {
            pool.release_slot();
            Err(e)
        }
    }
}

/// Authenticate request for a new connection when the node holds a session.
pub(crate) fn auth_request(node: &Node) -> Option<Bytes> {
    let user = &node.context().config.auth.as_ref()?.user;
    let session = node.session()?;
    Some(auth::encode_authenticate(user, &session.token))
}

/// Opens a socket to the node with address fallback. The TLS session is
/// created here; its handshake runs inside the state machine.
pub(crate) async fn connect(node: &Node, deadline: Option<Instant>) -> Result<Transport> {
    let ctx = node.context();
    let connect_timeout = ctx.config.connect_timeout;
    let timeout = op_timeout(Some(connect_timeout), deadline)?.unwrap_or(connect_timeout);
    let addresses = node.addresses();

    let mut last_err = None;
    for index in addresses.connect_order() {
        let addr = addresses.addrs()[index];
        match connect_addr(addr, timeout).await {
            Ok(tcp) => {
                addresses.mark_success(index);
                let transport = match &ctx.tls {
                    Some(tls) => Transport::Tls {
                        tcp,
                        tls: Box::new(tls.connect(node.tls_name().unwrap_or(node.name()))?),
                    },
                    None => Transport::Tcp(tcp),
                };
                trace!(node = %node.name(), addr = %addr, "Opened async connection");
                return Ok(transport);
            }
            Err(e) => {
                debug!(node = %node.name(), addr = %addr, error = %e, "Async connect failed");
                last_err = Some(e.with_context(addr.to_string()));
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| Error::InvalidNode("node has no addresses".into()))
        .with_context(format!("node {}", node.name())))
}

async fn connect_addr(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Timeout(format!("connect to {}", addr)))?
        .map_err(|e| Error::connection(format!("connect to {}", addr), e))?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

/// Repeating socket timer.
struct SocketTimer {
    timeout: Option<Duration>,
    fires_at: Option<Instant>,
}

impl SocketTimer {
    fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            fires_at: timeout.map(|t| Instant::now() + t),
        }
    }

    fn rearm(&mut self, now: Instant) {
        self.fires_at = self.timeout.map(|t| now + t);
    }

    /// Earliest of the socket timer and the total deadline.
    fn next_wake(&self, deadline: Option<Instant>) -> Option<Instant> {
        match (self.fires_at, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Feeds readiness into the command until it is done or failed.
pub(crate) async fn drive<P: ResponseParser>(
    transport: &mut Transport,
    cmd: &mut AsyncCommand<P>,
    socket_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Result<()> {
    let mut timer = SocketTimer::new(socket_timeout);
    let mut step = cmd.on_ready(transport);

    loop {
        match step {
            Step::Done => return Ok(()),
            Step::Failed(e) => return Err(e),
            Step::Written => {
                return Err(Error::Protocol("pipelined command on a plain connection".into()))
            }
            Step::Wait(interest) => {
                wait_ready(transport, interest, cmd, &mut timer, deadline).await?;
                step = cmd.on_ready(transport);
            }
        }
    }
}

async fn wait_ready<P: ResponseParser>(
    transport: &Transport,
    interest: Interest,
    cmd: &mut AsyncCommand<P>,
    timer: &mut SocketTimer,
    deadline: Option<Instant>,
) -> Result<()> {
    loop {
        let Some(wake) = timer.next_wake(deadline) else {
            return transport.ready(interest).await;
        };

        tokio::select! {
            ready = transport.ready(interest) => return ready,
            _ = tokio::time::sleep_until(wake.into()) => {
                let now = Instant::now();
                if deadline.is_some_and(|d| now >= d) {
                    return Err(Error::Timeout("total deadline exceeded".into()));
                }
                if timer.fires_at.is_some_and(|at| now >= at) {
                    if !cmd.take_event_received() {
                        return Err(Error::Timeout("socket timeout".into()));
                    }
                    timer.rearm(now);
                }
            }
        }
    }
}
