//! Event Loops
//!
//! Async commands run on a fixed group of worker loops. Each loop is a
//! dedicated thread driving a single-threaded tokio runtime with a
//! `LocalSet`, and each node keeps one async pool and one pipe pool per
//! loop. A connection is only ever used by the loop that opened it.
//!
//! ```text
//!   caller ──spawn(index, f)──► [loop 0: current_thread rt + LocalSet]
//!      ▲                          │  driver::execute ─► AsyncCommand
//!      └──────── oneshot ◄────────┘  pipeline tasks (one per pipe conn)
//!
//!   tend thread ──execute(index, task)──► sweep idle / close node pools
//! ```
//!
//! Loops are picked round robin with [`EventLoopGroup::next`] unless the
//! caller names one.

pub mod driver;
pub mod io;
pub mod pipeline;
pub mod state;

pub use driver::AsyncConnection;
pub use io::{Interest, IoProgress, NonBlockingIo, Transport};
pub use pipeline::PipeHandle;
pub use state::{AsyncCommand, State, Step};

use crate::cluster::Node;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Work item executed on a loop thread.
pub type LoopTask = Box<dyn FnOnce(&LoopContext) + Send>;

/// Handed to every task; identifies the loop it runs on.
#[derive(Debug)]
pub struct LoopContext {
    index: usize,
}

impl LoopContext {
    pub fn index(&self) -> usize {
        self.index
    }
}

struct EventLoop {
    index: usize,
    tx: Mutex<Option<mpsc::UnboundedSender<LoopTask>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// A fixed set of worker loops.
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Starts `count` loop threads.
    pub fn new(count: usize) -> Result<Arc<Self>> {
        if count == 0 {
            return Err(Error::InvalidArgument("event loop count must be positive".into()));
        }

        let mut loops = Vec::with_capacity(count);
        for index in 0..count {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| Error::connection("cannot build event loop runtime", e))?;
            let (tx, rx) = mpsc::unbounded_channel();

            let thread = std::thread::Builder::new()
                .name(format!("fleetkv-loop-{}", index))
                .spawn(move || run_loop(runtime, index, rx))
                .map_err(|e| Error::connection("cannot spawn event loop thread", e))?;

            loops.push(EventLoop {
                index,
                tx: Mutex::new(Some(tx)),
                thread: Mutex::new(Some(thread)),
            });
        }

        info!(loops = count, "Started event loops");
        Ok(Arc::new(Self {
            loops,
            next: AtomicUsize::new(0),
        }))
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Next loop index in round-robin order.
    pub fn next(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len()
    }

    /// Queues a task on loop `index`.
    pub fn execute(&self, index: usize, task: LoopTask) -> Result<()> {
        let event_loop = self
            .loops
            .get(index)
            .ok_or_else(|| Error::InvalidArgument(format!("no event loop {}", index)))?;
        let tx = event_loop.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(task).map_err(|_| Error::Closed),
            None => Err(Error::Closed),
        }
    }

    /// Runs the future built by `f` as a local task on loop `index` and
    /// returns a receiver for its output.
    pub fn spawn<T, F, Fut>(&self, index: usize, f: F) -> Result<oneshot::Receiver<T>>
    where
        T: Send + 'static,
        F: FnOnce(usize) -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(
            index,
            Box::new(move |ctx: &LoopContext| {
                let fut = f(ctx.index());
                tokio::task::spawn_local(async move {
                    let _ = tx.send(fut.await);
                });
            }),
        )?;
        Ok(rx)
    }

    /// Closes idle async and dead or idle pipelined connections on every
    /// loop.
    pub(crate) fn sweep_idle(&self, nodes: &Arc<Vec<Arc<Node>>>) {
        for event_loop in &self.loops {
            let nodes = Arc::clone(nodes);
            let task: LoopTask = Box::new(move |ctx: &LoopContext| {
                for node in nodes.iter() {
                    let closed = sweep_node(node, ctx.index());
                    if closed > 0 {
                        debug!(node = %node.name(), event_loop = ctx.index(), closed, "Closed idle async connections");
                    }
                }
            });
            if self.execute(event_loop.index, task).is_err() {
                return;
            }
        }
    }

    /// Drains a removed node's pools on every loop.
    pub(crate) fn close_node(&self, node: &Arc<Node>) {
        for event_loop in &self.loops {
            let target = Arc::clone(node);
            let task: LoopTask = Box::new(move |ctx: &LoopContext| drain_node(&target, ctx.index()));
            if self.execute(event_loop.index, task).is_err() {
                drain_node(node, event_loop.index);
            }
        }
    }

    /// Stops every loop. Tasks still running on a loop are dropped.
    pub fn shutdown(&self) {
        for event_loop in &self.loops {
            event_loop.tx.lock().take();
        }
        let current = std::thread::current().id();
        for event_loop in &self.loops {
            let handle = event_loop.thread.lock().take();
            if let Some(handle) = handle {
                if handle.thread().id() != current && handle.join().is_err() {
                    warn!(event_loop = event_loop.index, "Event loop thread panicked");
                }
            }
        }
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("loops", &self.loops.len())
            .finish()
    }
}

fn run_loop(runtime: tokio::runtime::Runtime, index: usize, mut rx: mpsc::UnboundedReceiver<LoopTask>) {
    let local = tokio::task::LocalSet::new();
    let ctx = LoopContext { index };
    local.block_on(&runtime, async move {
        while let Some(task) = rx.recv().await {
            task(&ctx);
        }
    });
    debug!(event_loop = index, "Event loop stopped");
}

fn sweep_node(node: &Node, index: usize) -> usize {
    let max_idle = node.context().config.max_socket_idle;
    let mut closed = 0;
    if let Ok(pool) = node.async_pool(index) {
        if !max_idle.is_zero() {
            closed += pool.sweep(|conn| conn.idle_for() > max_idle);
        }
    }
    if let Ok(pool) = node.pipe_pool(index) {
        closed += pool.sweep(|handle| {
            !handle.is_alive() || (!max_idle.is_zero() && handle.idle_for() > max_idle)
        });
    }
    closed
}

fn drain_node(node: &Node, index: usize) {
    let async_closed = node.async_pool(index).map(|p| p.drain()).unwrap_or(0);
    let pipe_closed = node.pipe_pool(index).map(|p| p.drain()).unwrap_or(0);
    if async_closed + pipe_closed > 0 {
        debug!(node = %node.name(), event_loop = index, async_closed, pipe_closed, "Closed async connections");
    }
}
