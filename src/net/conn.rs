//! Blocking Connections
//!
//! Sync commands run on blocking sockets. Every socket operation gets a
//! timeout of `min(socket_timeout, time left until the deadline)`, so one
//! slow read can never outlive the command.

use crate::error::{Error, Result};
use crate::net::tls::TlsContext;
use crate::protocol::header::{msg_type, ProtoHeader, PROTO_SIZE};
use rustls::{ClientConnection, StreamOwned};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};
use tracing::trace;

enum Stream {
    Tcp(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Tcp(s) => s,
            Stream::Tls(s) => s.get_ref(),
        }
    }
}

/// A pooled blocking connection to one node.
pub struct Connection {
    stream: Stream,
    addr: SocketAddr,
    last_used: Instant,
    /// Index of the sync pool the connection belongs to.
    pub(crate) pool: usize,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("tls", &matches!(self.stream, Stream::Tls(_)))
            .field("pool", &self.pool)
            .finish()
    }
}

/// Time budget for the next socket operation.
pub fn op_timeout(socket_timeout: Option<Duration>, deadline: Option<Instant>) -> Result<Option<Duration>> {
    let remaining = match deadline {
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                return Err(Error::Timeout("total deadline exceeded".into()));
            }
            Some(d - now)
        }
        None => None,
    };
    Ok(match (socket_timeout, remaining) {
        (Some(s), Some(r)) => Some(s.min(r)),
        (s, r) => s.or(r),
    })
}

impl Connection {
    /// Opens a TCP connection and runs the TLS handshake when `tls` is set.
    pub fn connect(
        addr: SocketAddr,
        timeout: Duration,
        tls: Option<(&TlsContext, &str)>,
    ) -> Result<Connection> {
        let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::Timeout(format!("connect to {}", addr))
            }
            _ => Error::connection(format!("connect to {}", addr), e),
        })?;
        tcp.set_nodelay(true)?;

        let stream = match tls {
            Some((ctx, server_name)) => {
                tcp.set_read_timeout(Some(timeout))?;
                tcp.set_write_timeout(Some(timeout))?;
                let mut session = ctx.connect(server_name)?;
                let mut tcp = tcp;
                while session.is_handshaking() {
                    session
                        .complete_io(&mut tcp)
                        .map_err(|e| Error::Tls(format!("handshake with {}: {}", addr, e)))?;
                }
                Stream::Tls(Box::new(StreamOwned::new(session, tcp)))
            }
            None => Stream::Tcp(tcp),
        };

        trace!(addr = %addr, "Opened connection");
        Ok(Connection {
            stream,
            addr,
            last_used: Instant::now(),
            pool: 0,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Checks that a pooled connection can be reused: not idle too long,
    /// not closed by the peer and no stray bytes waiting to be read.
    pub fn is_valid(&self, max_idle: Duration) -> bool {
        if !max_idle.is_zero() && self.idle_for() > max_idle {
            return false;
        }
        if let Stream::Tls(s) = &self.stream {
            if s.conn.wants_write() {
                return false;
            }
        }
        socket_is_idle(self.stream.tcp())
    }

    fn apply_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let tcp = self.stream.tcp();
        tcp.set_read_timeout(timeout)?;
        tcp.set_write_timeout(timeout)?;
        Ok(())
    }

    pub fn write_all(&mut self, buf: &[u8], socket_timeout: Option<Duration>, deadline: Option<Instant>) -> Result<()> {
        self.apply_timeout(op_timeout(socket_timeout, deadline)?)?;
        let result = match &mut self.stream {
            Stream::Tcp(s) => s.write_all(buf).and_then(|_| s.flush()),
            Stream::Tls(s) => s.write_all(buf).and_then(|_| s.flush()),
        };
        result.map_err(|e| map_io(e, "write"))
    }

    pub fn read_exact(&mut self, buf: &mut [u8], socket_timeout: Option<Duration>, deadline: Option<Instant>) -> Result<()> {
        self.apply_timeout(op_timeout(socket_timeout, deadline)?)?;
        let result = match &mut self.stream {
            Stream::Tcp(s) => s.read_exact(buf),
            Stream::Tls(s) => s.read_exact(buf),
        };
        result.map_err(|e| map_io(e, "read"))
    }

    /// Reads one frame of the expected kind.
    pub fn read_frame(
        &mut self,
        expected_kind: u8,
        socket_timeout: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Result<(ProtoHeader, Vec<u8>)> {
        let mut raw = [0u8; PROTO_SIZE];
        self.read_exact(&mut raw, socket_timeout, deadline)?;
        let header = ProtoHeader::decode(&raw)?;
        header.validate(expected_kind)?;

        let mut body = vec![0u8; header.size];
        self.read_exact(&mut body, socket_timeout, deadline)?;
        Ok((header, body))
    }

    /// Sends a request and reads one response frame.
    pub fn round_trip(
        &mut self,
        request: &[u8],
        expected_kind: u8,
        timeout: Duration,
    ) -> Result<(ProtoHeader, Vec<u8>)> {
        let deadline = Some(Instant::now() + timeout);
        self.write_all(request, None, deadline)?;
        let frame = self.read_frame(expected_kind, None, deadline)?;
        self.touch();
        Ok(frame)
    }

    /// Runs an info request and returns the response body.
    pub fn info(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let (_, body) = self.round_trip(request, msg_type::INFO, timeout)?;
        Ok(body)
    }
}

fn map_io(err: io::Error, op: &str) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            Error::Timeout(format!("socket {}", op))
        }
        io::ErrorKind::UnexpectedEof => Error::connection(format!("{}: connection closed by peer", op), err),
        _ => Error::connection(format!("socket {}", op), err),
    }
}

/// Non-blocking peek: an idle socket has nothing to read and is not at EOF.
fn socket_is_idle(tcp: &TcpStream) -> bool {
    if tcp.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let idle = matches!(tcp.peek(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock);
    tcp.set_nonblocking(false).is_ok() && idle
}
