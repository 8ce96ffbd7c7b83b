//! Cluster Module
//!
//! The cluster owns the node list and the partition map, both as
//! swappable snapshots, and runs the tend thread that keeps them in line
//! with the servers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Cluster                             │
//! │                                                              │
//! │   nodes: Snapshot<Vec<Arc<Node>>>                            │
//! │   partitions: Snapshot<HashMap<ns, Arc<PartitionTable>>>     │
//! │                                                              │
//! │        ▲ swap                            ▲ load (commands)   │
//! │        │                                 │                   │
//! │  ┌─────┴──────────────┐         ┌────────┴─────────┐         │
//! │  │   tend thread      │         │   dispatcher     │         │
//! │  │ (every interval or │         │ digest -> pid -> │         │
//! │  │  on signal_login)  │         │ replica -> node  │         │
//! │  └────────────────────┘         └──────────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod node;
pub mod partition;
pub mod peers;
pub mod rack;
pub mod snapshot;
mod tend;

pub use node::Node;
pub use partition::{PartitionMap, PartitionTable};
pub use rack::Racks;
pub use snapshot::Snapshot;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::event::EventLoopGroup;
use crate::net::TlsContext;
use crate::policy::Replica;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};

/// Wakes the tend thread early or tells it to stop.
#[derive(Debug)]
pub struct TendSignal {
    state: Mutex<TendState>,
    cond: Condvar,
}

#[derive(Debug)]
struct TendState {
    running: bool,
    wake: bool,
}

impl TendSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(TendState {
                running: true,
                wake: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn wake(&self) {
        let mut state = self.state.lock();
        state.wake = true;
        self.cond.notify_one();
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        self.cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Sleeps up to `interval` unless woken. Returns false once stopped.
    fn wait(&self, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if state.running && !state.wake {
            self.cond.wait_for(&mut state, interval);
        }
        state.wake = false;
        state.running
    }

    #[cfg(test)]
    pub(crate) fn take_wake(&self) -> bool {
        std::mem::replace(&mut self.state.lock().wake, false)
    }
}

/// Settings and shared handles every node needs.
#[derive(Debug)]
pub struct ClusterContext {
    pub config: ClientConfig,
    pub tls: Option<TlsContext>,
    pub tend: TendSignal,
}

impl ClusterContext {
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        let tls = config.tls.as_ref().map(TlsContext::new).transpose()?;
        Ok(Arc::new(Self {
            config,
            tls,
            tend: TendSignal::new(),
        }))
    }
}

pub struct Cluster {
    ctx: Arc<ClusterContext>,
    nodes: Snapshot<Vec<Arc<Node>>>,
    partitions: Snapshot<PartitionMap>,
    any_counter: AtomicUsize,
    random_counter: AtomicUsize,
    loops: Option<Arc<EventLoopGroup>>,
    tend_thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Cluster {
    /// Seeds the cluster, runs the first tend cycle and starts the tend thread.
    pub fn connect(config: ClientConfig, loops: Option<Arc<EventLoopGroup>>) -> Result<Arc<Cluster>> {
        config.validate()?;
        let ctx = ClusterContext::new(config)?;

        let cluster = Arc::new(Cluster {
            ctx,
            nodes: Snapshot::new(Vec::new()),
            partitions: Snapshot::new(PartitionMap::new()),
            any_counter: AtomicUsize::new(0),
            random_counter: AtomicUsize::new(0),
            loops,
            tend_thread: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        cluster.tend();

        if cluster.nodes().is_empty() {
            if cluster.ctx.config.fail_if_not_connected {
                cluster.close();
                return Err(Error::Connection {
                    message: "failed to connect to any seed host".into(),
                    source: std::io::Error::from(std::io::ErrorKind::NotConnected),
                });
            }
            warn!("No seed host reachable, will keep trying");
        }

        let tend_cluster = Arc::clone(&cluster);
        let handle = std::thread::Builder::new()
            .name("fleetkv-tend".into())
            .spawn(move || tend::run(tend_cluster))
            .map_err(|e| Error::connection("cannot spawn tend thread", e))?;
        *cluster.tend_thread.lock() = Some(handle);

        info!(nodes = cluster.nodes().len(), "Cluster connected");
        Ok(cluster)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.ctx.config
    }

    pub fn event_loops(&self) -> Option<&Arc<EventLoopGroup>> {
        self.loops.as_ref()
    }

    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.load()
    }

    pub fn partitions(&self) -> Arc<PartitionMap> {
        self.partitions.load()
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.nodes().iter().any(|n| n.is_active())
    }

    pub fn get_node(&self, name: &str) -> Result<Arc<Node>> {
        self.nodes()
            .iter()
            .find(|n| n.name() == name)
            .cloned()
            .ok_or_else(|| Error::InvalidNode(format!("node {} not found", name)))
    }

    /// Next active node in round-robin order.
    pub fn random_node(&self) -> Result<Arc<Node>> {
        let nodes = self.nodes();
        let start = self.random_counter.fetch_add(1, Ordering::Relaxed);
        (0..nodes.len())
            .map(|i| &nodes[(start + i) % nodes.len()])
            .find(|n| n.is_active())
            .cloned()
            .ok_or_else(|| Error::InvalidNode("cluster is empty".into()))
    }

    /// Resolves the node for a partition according to the replica policy.
    pub fn partition_node(
        &self,
        namespace: &str,
        partition_id: usize,
        replica: Replica,
        iteration: u32,
    ) -> Result<Arc<Node>> {
        let map = self.partitions.load();
        let table = map.get(namespace).ok_or_else(|| {
            Error::InvalidNode(format!("no partition map for namespace {}", namespace))
        })?;

        let config = &self.ctx.config;
        let rack = (config.rack_aware && replica == Replica::PreferRack).then_some(config.rack_id);

        if let Some(node) =
            table.select(namespace, partition_id, replica, iteration, rack, &self.any_counter)
        {
            return Ok(node);
        }
        if table.sc_mode {
            return Err(Error::InvalidNode(format!(
                "partition {}:{} unavailable",
                namespace, partition_id
            )));
        }
        self.random_node()
    }

    /// Runs a tend cycle as soon as possible.
    pub fn signal_tend(&self) {
        self.ctx.tend.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the tend thread and closes every node's connections.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ctx.tend.stop();

        let handle = self.tend_thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!("Tend thread panicked");
            }
        }

        let nodes = self.nodes.store(Arc::new(Vec::new()));
        for node in nodes.iter() {
            node.deactivate();
            node.close();
            if let Some(loops) = &self.loops {
                loops.close_node(node);
            }
        }
        self.partitions.store(Arc::new(PartitionMap::new()));
        info!("Cluster closed");
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.nodes().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_tend_signal_wakes_early() {
        let signal = Arc::new(TendSignal::new());
        let waker = Arc::clone(&signal);
        let start = Instant::now();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        assert!(signal.wait(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_tend_signal_stop() {
        let signal = TendSignal::new();
        signal.stop();
        assert!(!signal.wait(Duration::from_secs(5)));
        assert!(!signal.is_running());
    }

    #[test]
    fn test_connect_without_seeds_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ClientConfig::with_hosts(vec![crate::config::Host::new("127.0.0.1", port)]);
        let err = Cluster::connect(config, None).unwrap_err();
        assert_eq!(err.code(), crate::error::ResultCode::CONNECTION);
    }
}
