//! Pipelined Connections
//!
//! A pipelined connection keeps several requests in flight. Each one runs
//! in a task on the worker loop that owns the socket:
//!
//! ```text
//!  PipeHandle ──(mpsc)──► queued ──► writer slot ──► readers (FIFO)
//!                                       │               │
//!                         write ready ──┘               └── read ready (head)
//! ```
//!
//! * one writer at a time; it joins the reader queue once its request is out
//! * read readiness goes to the head reader, or to the writer while no
//!   reader exists (TLS handshake and authentication of a new connection)
//! * a server error fails only the reader that received it
//! * any other failure fails every queued, writing and reading command
//!
//! The pipe pool holds one [`PipeHandle`] per connection. Commands pop the
//! handle, submit and push it straight back, so others can pipeline behind
//! them. Dropping the last handle lets the task finish the requests in
//! flight and close the socket.

use crate::cluster::Node;
use crate::error::{Error, Result};
use crate::event::driver;
use crate::event::io::{Interest, NonBlockingIo, Transport};
use crate::event::state::{AsyncCommand, Step};
use crate::net::ConnectionPool;
use crate::protocol::ResponseParser;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// A command as seen by the pipeline task, with its result channel.
pub(crate) trait PipeCommand: Send {
    fn start(&mut self, fresh: bool, tls: bool, auth: Option<Bytes>);
    fn on_ready(&mut self, io: &mut dyn NonBlockingIo) -> Step;
    fn take_event_received(&mut self) -> bool;
    fn complete(self: Box<Self>, result: Result<()>);
}

struct Pending<P> {
    cmd: AsyncCommand<P>,
    is_write: bool,
    done: oneshot::Sender<Result<P>>,
}

impl<P: ResponseParser + Send> PipeCommand for Pending<P> {
    fn start(&mut self, fresh: bool, tls: bool, auth: Option<Bytes>) {
        self.cmd.start(fresh, tls, auth);
    }

    fn on_ready(&mut self, io: &mut dyn NonBlockingIo) -> Step {
        self.cmd.on_ready(io)
    }

    fn take_event_received(&mut self) -> bool {
        self.cmd.take_event_received()
    }

    fn complete(self: Box<Self>, result: Result<()>) {
        let Pending { cmd, is_write, done } = *self;
        let result = match result {
            Ok(()) => Ok(cmd.into_parser()),
            Err(e) => Err(e.set_in_doubt(is_write && cmd.is_sent())),
        };
        // The caller may have given up at its deadline.
        let _ = done.send(result);
    }
}

type BoxedCommand = Box<dyn PipeCommand>;

/// Pool entry for one pipelined connection.
#[derive(Debug)]
pub struct PipeHandle {
    tx: mpsc::UnboundedSender<BoxedCommand>,
    alive: Arc<AtomicBool>,
    last_used: Instant,
}

impl PipeHandle {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn send(&self, cmd: BoxedCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| aborted("pipeline connection closed"))
    }
}

fn aborted(cause: impl std::fmt::Display) -> Error {
    Error::connection(
        format!("pipeline aborted: {}", cause),
        io::Error::from(io::ErrorKind::ConnectionAborted),
    )
}

/// Queues a command on a pipelined connection and waits for its response.
pub(crate) async fn submit<P>(
    node: &Arc<Node>,
    loop_index: usize,
    cmd: AsyncCommand<P>,
    is_write: bool,
    socket_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Result<P>
where
    P: ResponseParser + Send + 'static,
{
    let pool = node.pipe_pool(loop_index)?;
    let mut handle = acquire(node, pool, socket_timeout, deadline).await?;

    let (tx, rx) = oneshot::channel();
    let sent = handle.send(Box::new(Pending {
        cmd: cmd.pipelined(),
        is_write,
        done: tx,
    }));

    handle.last_used = Instant::now();
    if handle.is_alive() {
        if let Err(handle) = pool.push(handle) {
            drop(handle);
            pool.release_slot();
        }
    } else {
        drop(handle);
        pool.release_slot();
    }
    sent?;

    let response = match deadline {
        Some(d) => tokio::time::timeout_at(d.into(), rx)
            .await
            .map_err(|_| Error::Timeout("total deadline exceeded".into()))?,
        None => rx.await,
    };
    response
        .map_err(|_| aborted("pipeline task stopped"))?
        .map_err(|e| e.with_context(format!("node {}", node)))
}

async fn acquire(
    node: &Arc<Node>,
    pool: &ConnectionPool<PipeHandle>,
    socket_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Result<PipeHandle> {
    while let Some(handle) = pool.pop() {
        if handle.is_alive() {
            return Ok(handle);
        }
        drop(handle);
        pool.release_slot();
    }

    if !pool.try_reserve() {
        return Err(Error::NoMoreConnections {
            node: node.name().to_string(),
            limit: node.context().config.pipe_max_conns_per_node,
        });
    }
    let transport = match driver::connect(node, deadline).await {
        Ok(t) => t,
        Err(e) => {
            pool.release_slot();
            return Err(e);
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let alive = Arc::new(AtomicBool::new(true));
    let pipeline = Pipeline::new(transport, driver::auth_request(node), socket_timeout);
    tokio::task::spawn_local(pipeline.run(rx, Arc::clone(&alive), node.name().to_string()));
    debug!(node = %node.name(), "Opened pipelined connection");

    Ok(PipeHandle {
        tx,
        alive,
        last_used: Instant::now(),
    })
}

/// State of one pipelined connection, owned by its task.
struct Pipeline {
    transport: Transport,
    auth: Option<Bytes>,
    fresh: bool,
    writer: Option<BoxedCommand>,
    writer_wait: Interest,
    readers: VecDeque<BoxedCommand>,
    reader_wait: Interest,
    queued: VecDeque<BoxedCommand>,
    socket_timeout: Option<Duration>,
    progress: bool,
}

impl Pipeline {
    fn new(transport: Transport, auth: Option<Bytes>, socket_timeout: Option<Duration>) -> Self {
        Self {
            transport,
            auth,
            fresh: true,
            writer: None,
            writer_wait: Interest::Write,
            readers: VecDeque::new(),
            reader_wait: Interest::Read,
            queued: VecDeque::new(),
            socket_timeout,
            progress: false,
        }
    }

    fn is_busy(&self) -> bool {
        self.writer.is_some() || !self.readers.is_empty() || !self.queued.is_empty()
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<BoxedCommand>,
        alive: Arc<AtomicBool>,
        node: String,
    ) {
        let mut rx_open = true;
        let mut timer: Option<Instant> = None;

        let outcome = loop {
            if let Err(e) = self.fill_writer() {
                break Err(e);
            }
            if !self.is_busy() {
                timer = None;
                if !rx_open {
                    break Ok(());
                }
            } else if timer.is_none() {
                self.progress = false;
                timer = self.socket_timeout.map(|t| Instant::now() + t);
            }

            let (want_read, want_write) = self.interest();
            let sleep_at = timer;
            let sleep = async move {
                match sleep_at {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            let step = tokio::select! {
                msg = rx.recv(), if rx_open => {
                    match msg {
                        Some(cmd) => self.queued.push_back(cmd),
                        None => rx_open = false,
                    }
                    Ok(())
                }
                ready = self.transport.ready_for(want_read, want_write) => {
                    ready.and_then(|(readable, writable)| self.on_ready(readable, writable))
                }
                _ = sleep => {
                    if std::mem::take(&mut self.progress) {
                        timer = self.socket_timeout.map(|t| Instant::now() + t);
                        Ok(())
                    } else {
                        Err(Error::Timeout("pipeline socket timeout".into()))
                    }
                }
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        alive.store(false, Ordering::Release);
        if let Err(e) = outcome {
            warn!(node = %node, error = %e, "Pipelined connection failed");
            rx.close();
            while let Ok(cmd) = rx.try_recv() {
                self.queued.push_back(cmd);
            }
            self.abort(e);
        }
        trace!(node = %node, "Pipelined connection closed");
    }

    /// Readiness to watch. Readers blocked on a TLS write must not watch
    /// reads: an unconsumed readable event would wake the task forever.
    /// Without readers, reads are watched to feed the writer or to notice
    /// a peer closing an idle pipe.
    fn interest(&self) -> (bool, bool) {
        let want_write = (self.writer.is_some() && self.writer_wait == Interest::Write)
            || (!self.readers.is_empty() && self.reader_wait == Interest::Write);
        let want_read = self.readers.is_empty() || self.reader_wait == Interest::Read;
        (want_read, want_write)
    }

    fn on_ready(&mut self, readable: bool, writable: bool) -> Result<()> {
        if writable {
            if self.writer.is_some() && self.writer_wait == Interest::Write {
                self.step_writer()?;
            }
            if !self.readers.is_empty() && self.reader_wait == Interest::Write {
                self.step_readers()?;
            }
        }
        if readable {
            if !self.readers.is_empty() {
                if self.reader_wait == Interest::Read {
                    self.step_readers()?;
                }
            } else if self.writer.is_some() && self.writer_wait == Interest::Read {
                self.step_writer()?;
            } else if !self.transport.is_idle() {
                return Err(aborted("unexpected data or close on idle pipeline"));
            }
        }
        Ok(())
    }

    fn fill_writer(&mut self) -> Result<()> {
        if self.writer.is_none() && self.next_writer() {
            self.step_writer()?;
        }
        Ok(())
    }

    fn next_writer(&mut self) -> bool {
        let Some(mut next) = self.queued.pop_front() else {
            return false;
        };
        let auth = if self.fresh { self.auth.take() } else { None };
        next.start(self.fresh, self.transport.is_tls(), auth);
        self.fresh = false;
        self.writer = Some(next);
        true
    }

    fn step_writer(&mut self) -> Result<()> {
        while let Some(mut writer) = self.writer.take() {
            let step = writer.on_ready(&mut self.transport);
            if writer.take_event_received() {
                self.progress = true;
            }
            match step {
                Step::Wait(interest) => {
                    self.writer_wait = interest;
                    self.writer = Some(writer);
                    return Ok(());
                }
                Step::Written => {
                    self.readers.push_back(writer);
                    self.next_writer();
                }
                Step::Done => {
                    writer.complete(Ok(()));
                    self.next_writer();
                }
                Step::Failed(e) => {
                    let abort = aborted(&e);
                    writer.complete(Err(e));
                    return Err(abort);
                }
            }
        }
        Ok(())
    }

    fn step_readers(&mut self) -> Result<()> {
        self.reader_wait = Interest::Read;
        while let Some(reader) = self.readers.front_mut() {
            let step = reader.on_ready(&mut self.transport);
            if reader.take_event_received() {
                self.progress = true;
            }
            match step {
                Step::Wait(interest) => {
                    self.reader_wait = interest;
                    return Ok(());
                }
                Step::Done => {
                    if let Some(reader) = self.readers.pop_front() {
                        reader.complete(Ok(()));
                    }
                }
                Step::Failed(e) if !e.is_fatal_for_connection() => {
                    if let Some(reader) = self.readers.pop_front() {
                        reader.complete(Err(e));
                    }
                }
                Step::Failed(e) => {
                    let abort = aborted(&e);
                    if let Some(reader) = self.readers.pop_front() {
                        reader.complete(Err(e));
                    }
                    return Err(abort);
                }
                Step::Written => {
                    return Err(Error::Protocol("reader wrote a request".into()));
                }
            }
        }
        Ok(())
    }

    /// Fails every command still held by the connection.
    fn abort(&mut self, err: Error) {
        let cause = err.to_string();
        let mut first = Some(err);
        let commands: Vec<BoxedCommand> = self
            .readers
            .drain(..)
            .chain(self.writer.take())
            .chain(self.queued.drain(..))
            .collect();
        for cmd in commands {
            let e = first.take().unwrap_or_else(|| aborted(&cause));
            cmd.complete(Err(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::{msg_type, MessageHeader, ProtoHeader};
    use crate::protocol::response::tests::message;
    use crate::protocol::RecordParser;
    use crate::value::Value;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn response(code: u8, value: i64) -> Vec<u8> {
        let body = message(
            MessageHeader {
                result_code: code,
                ..MessageHeader::default()
            },
            &[("v", value)],
        );
        let mut frame = ProtoHeader::new(msg_type::MESSAGE, body.len()).encode().to_vec();
        frame.extend(body);
        frame
    }

    async fn start_pipeline() -> (mpsc::UnboundedSender<BoxedCommand>, Arc<AtomicBool>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));
        let pipeline = Pipeline::new(Transport::Tcp(client), None, Some(Duration::from_secs(5)));
        tokio::task::spawn_local(pipeline.run(rx, Arc::clone(&alive), "A".into()));
        (tx, alive, server)
    }

    fn queue(
        tx: &mpsc::UnboundedSender<BoxedCommand>,
        request: &'static [u8],
    ) -> oneshot::Receiver<Result<RecordParser>> {
        let (done, rx) = oneshot::channel();
        let cmd = AsyncCommand::new(Bytes::from_static(request), RecordParser::new(&[], true)).pipelined();
        assert!(tx
            .send(Box::new(Pending {
                cmd,
                is_write: false,
                done
            }))
            .is_ok());
        rx
    }

    fn pending(request: &'static [u8]) -> BoxedCommand {
        let (done, _rx) = oneshot::channel::<Result<RecordParser>>();
        let cmd = AsyncCommand::new(Bytes::from_static(request), RecordParser::new(&[], true)).pipelined();
        Box::new(Pending {
            cmd,
            is_write: false,
            done,
        })
    }

    #[tokio::test]
    async fn test_reader_blocked_on_write_stops_watching_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let mut pipeline = Pipeline::new(Transport::Tcp(client), None, None);

        // Idle: reads are watched to notice a closed peer.
        assert_eq!(pipeline.interest(), (true, false));

        pipeline.readers.push_back(pending(b"one"));
        assert_eq!(pipeline.interest(), (true, false));

        pipeline.reader_wait = Interest::Write;
        assert_eq!(pipeline.interest(), (false, true));

        pipeline.writer = Some(pending(b"two"));
        pipeline.writer_wait = Interest::Write;
        pipeline.reader_wait = Interest::Read;
        assert_eq!(pipeline.interest(), (true, true));
    }

    #[tokio::test]
    async fn test_responses_match_request_order() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (tx, _alive, mut server) = start_pipeline().await;
                let first = queue(&tx, b"one");
                let second = queue(&tx, b"two");

                let mut requests = [0u8; 6];
                server.read_exact(&mut requests).await.unwrap();
                assert_eq!(&requests, b"onetwo");

                let mut both = response(0, 1);
                both.extend(response(0, 2));
                server.write_all(&both).await.unwrap();

                let a = first.await.unwrap().unwrap().record.unwrap();
                let b = second.await.unwrap().unwrap().record.unwrap();
                assert_eq!(a.get("v"), Some(&Value::Int(1)));
                assert_eq!(b.get("v"), Some(&Value::Int(2)));
            })
            .await;
    }

    #[tokio::test]
    async fn test_server_error_fails_only_its_reader() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (tx, alive, mut server) = start_pipeline().await;
                let first = queue(&tx, b"one");
                let second = queue(&tx, b"two");

                let mut requests = [0u8; 6];
                server.read_exact(&mut requests).await.unwrap();

                let mut both = response(14, 0);
                both.extend(response(0, 2));
                server.write_all(&both).await.unwrap();

                let err = first.await.unwrap().unwrap_err();
                assert_eq!(err.code(), crate::error::ResultCode::KEY_BUSY);
                assert!(second.await.unwrap().is_ok());
                assert!(alive.load(Ordering::Acquire));
            })
            .await;
    }

    #[tokio::test]
    async fn test_socket_error_fails_every_command() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (tx, alive, mut server) = start_pipeline().await;
                let first = queue(&tx, b"one");
                let second = queue(&tx, b"two");

                let mut requests = [0u8; 6];
                server.read_exact(&mut requests).await.unwrap();
                drop(server);

                assert!(first.await.unwrap().unwrap_err().is_retriable());
                assert!(second.await.unwrap().unwrap_err().is_retriable());
                assert!(!alive.load(Ordering::Acquire));
            })
            .await;
    }
}
