//! Non-blocking Transport
//!
//! The async state machine never awaits a socket directly. It calls the
//! `try_*` methods of a [`NonBlockingIo`] and, when one of them cannot make
//! progress, tells the driver which readiness to wait for.
//!
//! ## TLS
//!
//! For TLS connections rustls sits between the command buffer and the
//! socket. A plaintext write may need the socket to become readable first
//! (and a read may need it writable), so every call reports what it is
//! blocked on:
//!
//! ```text
//! IoProgress::Done(n)    n bytes moved
//! IoProgress::WouldBlock wait for the readiness matching the operation
//! IoProgress::NeedRead   wait for read readiness whatever the operation
//! IoProgress::NeedWrite  wait for write readiness whatever the operation
//! IoProgress::Closed     the peer closed the connection
//! ```

use crate::error::{Error, Result};
use rustls::ClientConnection;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Readiness a blocked operation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoProgress {
    Done(usize),
    WouldBlock,
    NeedRead,
    NeedWrite,
    Closed,
}

pub trait NonBlockingIo {
    /// Accepts up to `buf.len()` bytes. For TLS the bytes may still sit in
    /// the record buffer; call [`NonBlockingIo::flush`] to push them out.
    fn try_write(&mut self, buf: &[u8]) -> Result<IoProgress>;

    /// Returns buffered plaintext first; `WouldBlock` only once both the
    /// TLS session and the socket are empty.
    fn try_read(&mut self, buf: &mut [u8]) -> Result<IoProgress>;

    /// Drives the TLS handshake. `Done(0)` once it is complete.
    fn handshake(&mut self) -> Result<IoProgress>;

    /// Pushes buffered TLS records to the socket. `Done(0)` once empty.
    fn flush(&mut self) -> Result<IoProgress>;
}

/// `Read`/`Write` over a tokio socket's non-blocking calls, for rustls.
struct SocketAdapter<'a>(&'a TcpStream);

impl Read for SocketAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for SocketAdapter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A connected socket owned by one worker loop.
pub enum Transport {
    Tcp(TcpStream),
    Tls {
        tcp: TcpStream,
        tls: Box<ClientConnection>,
    },
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp(tcp) => f.debug_tuple("Tcp").field(&tcp.peer_addr().ok()).finish(),
            Transport::Tls { tcp, .. } => f.debug_tuple("Tls").field(&tcp.peer_addr().ok()).finish(),
        }
    }
}

fn socket_error(op: &str, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut => Error::Timeout(format!("socket {}", op)),
        _ => Error::connection(format!("socket {}", op), err),
    }
}

fn tls_error(err: rustls::Error) -> Error {
    Error::Tls(err.to_string())
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }

    pub fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Tcp(tcp) => tcp,
            Transport::Tls { tcp, .. } => tcp,
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.tcp().peer_addr().ok()
    }

    /// Waits until the socket is ready for `interest`.
    pub async fn ready(&self, interest: Interest) -> Result<()> {
        let interest = match interest {
            Interest::Read => tokio::io::Interest::READABLE,
            Interest::Write => tokio::io::Interest::WRITABLE,
        };
        self.tcp()
            .ready(interest)
            .await
            .map(|_| ())
            .map_err(|e| socket_error("poll", e))
    }

    /// Waits for any of the requested readiness and reports which fired.
    pub async fn ready_for(&self, read: bool, write: bool) -> Result<(bool, bool)> {
        let interest = match (read, write) {
            (true, true) => tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            (false, true) => tokio::io::Interest::WRITABLE,
            _ => tokio::io::Interest::READABLE,
        };
        let ready = self
            .tcp()
            .ready(interest)
            .await
            .map_err(|e| socket_error("poll", e))?;
        Ok((ready.is_readable(), ready.is_writable()))
    }

    /// A pooled socket is reusable when nothing is waiting to be read and
    /// the peer has not closed it.
    pub fn is_idle(&mut self) -> bool {
        if let Transport::Tls { tls, .. } = self {
            if tls.wants_write() {
                return false;
            }
        }
        let mut probe = [0u8; 1];
        matches!(self.tcp().try_read(&mut probe), Err(e) if e.kind() == io::ErrorKind::WouldBlock)
    }

    /// Writes pending TLS records. Returns the blocking progress, if any.
    fn write_records(tcp: &TcpStream, tls: &mut ClientConnection) -> Result<Option<IoProgress>> {
        while tls.wants_write() {
            match tls.write_tls(&mut SocketAdapter(tcp)) {
                Ok(0) => return Ok(Some(IoProgress::Closed)),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Some(IoProgress::NeedWrite))
                }
                Err(e) => return Err(socket_error("write", e)),
            }
        }
        Ok(None)
    }

    /// Reads one batch of TLS records and decrypts them.
    fn read_records(tcp: &TcpStream, tls: &mut ClientConnection) -> Result<Option<IoProgress>> {
        match tls.read_tls(&mut SocketAdapter(tcp)) {
            Ok(0) => Ok(Some(IoProgress::Closed)),
            Ok(_) => {
                tls.process_new_packets().map_err(tls_error)?;
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Some(IoProgress::NeedRead)),
            Err(e) => Err(socket_error("read", e)),
        }
    }
}

impl NonBlockingIo for Transport {
    fn try_write(&mut self, buf: &[u8]) -> Result<IoProgress> {
        match self {
            Transport::Tcp(tcp) => match tcp.try_write(buf) {
                Ok(0) if !buf.is_empty() => Ok(IoProgress::Closed),
                Ok(n) => Ok(IoProgress::Done(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoProgress::WouldBlock),
                Err(e) => Err(socket_error("write", e)),
            },
            Transport::Tls { tcp, tls } => {
                if let Some(blocked) = Self::write_records(tcp, tls)? {
                    return Ok(blocked);
                }
                let accepted = tls.writer().write(buf).map_err(|e| socket_error("write", e))?;
                if accepted == 0 && !buf.is_empty() {
                    return Ok(IoProgress::NeedWrite);
                }
                // Records that do not fit the socket now go out on flush.
                match Self::write_records(tcp, tls)? {
                    Some(IoProgress::Closed) => Ok(IoProgress::Closed),
                    _ => Ok(IoProgress::Done(accepted)),
                }
            }
        }
    }

    fn try_read(&mut self, buf: &mut [u8]) -> Result<IoProgress> {
        match self {
            Transport::Tcp(tcp) => match tcp.try_read(buf) {
                Ok(0) if !buf.is_empty() => Ok(IoProgress::Closed),
                Ok(n) => Ok(IoProgress::Done(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoProgress::WouldBlock),
                Err(e) => Err(socket_error("read", e)),
            },
            Transport::Tls { tcp, tls } => loop {
                match tls.reader().read(buf) {
                    Ok(0) if !buf.is_empty() => return Ok(IoProgress::Closed),
                    Ok(n) => return Ok(IoProgress::Done(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(socket_error("read", e)),
                }

                match Self::read_records(tcp, tls)? {
                    Some(IoProgress::NeedRead) => return Ok(IoProgress::WouldBlock),
                    Some(other) => return Ok(other),
                    None => {}
                }
                // Key updates and alerts can queue records mid-read.
                if let Some(blocked) = Self::write_records(tcp, tls)? {
                    return Ok(blocked);
                }
            },
        }
    }

    fn handshake(&mut self) -> Result<IoProgress> {
        let Transport::Tls { tcp, tls } = self else {
            return Ok(IoProgress::Done(0));
        };
        loop {
            if let Some(blocked) = Self::write_records(tcp, tls)? {
                return Ok(blocked);
            }
            if !tls.is_handshaking() {
                return Ok(IoProgress::Done(0));
            }
            if !tls.wants_read() {
                return Ok(IoProgress::NeedRead);
            }
            if let Some(blocked) = Self::read_records(tcp, tls)? {
                return Ok(blocked);
            }
        }
    }

    fn flush(&mut self) -> Result<IoProgress> {
        match self {
            Transport::Tcp(_) => Ok(IoProgress::Done(0)),
            Transport::Tls { tcp, tls } => Ok(Self::write_records(tcp, tls)?.unwrap_or(IoProgress::Done(0))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted transport: each call pops the next step. Reads serve bytes
    /// from `incoming`, writes append to `written`.
    #[derive(Default)]
    pub(crate) struct MockIo {
        pub incoming: Vec<u8>,
        pub read_pos: usize,
        pub written: Vec<u8>,
        /// Largest chunk a single call moves.
        pub chunk: usize,
        /// Blocking results returned before a read or write makes progress.
        pub read_stalls: VecDeque<IoProgress>,
        pub write_stalls: VecDeque<IoProgress>,
        pub handshake_steps: VecDeque<IoProgress>,
    }

    impl MockIo {
        pub(crate) fn new(incoming: Vec<u8>, chunk: usize) -> Self {
            Self {
                incoming,
                chunk,
                ..Default::default()
            }
        }
    }

    impl NonBlockingIo for MockIo {
        fn try_write(&mut self, buf: &[u8]) -> Result<IoProgress> {
            if let Some(stall) = self.write_stalls.pop_front() {
                return Ok(stall);
            }
            let n = buf.len().min(self.chunk);
            self.written.extend_from_slice(&buf[..n]);
            Ok(IoProgress::Done(n))
        }

        fn try_read(&mut self, buf: &mut [u8]) -> Result<IoProgress> {
            if let Some(stall) = self.read_stalls.pop_front() {
                return Ok(stall);
            }
            let left = self.incoming.len() - self.read_pos;
            if left == 0 {
                return Ok(IoProgress::WouldBlock);
            }
            let n = buf.len().min(self.chunk).min(left);
            buf[..n].copy_from_slice(&self.incoming[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            Ok(IoProgress::Done(n))
        }

        fn handshake(&mut self) -> Result<IoProgress> {
            Ok(self.handshake_steps.pop_front().unwrap_or(IoProgress::Done(0)))
        }

        fn flush(&mut self) -> Result<IoProgress> {
            Ok(IoProgress::Done(0))
        }
    }

    #[tokio::test]
    async fn test_tcp_transport_moves_bytes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut transport = Transport::Tcp(client);
        assert!(transport.is_idle());

        transport.ready(Interest::Write).await.unwrap();
        assert_eq!(transport.try_write(b"ping").unwrap(), IoProgress::Done(4));

        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        tokio::io::AsyncWriteExt::write_all(&mut server, b"pong").await.unwrap();
        transport.ready(Interest::Read).await.unwrap();
        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            match transport.try_read(&mut buf[got..]).unwrap() {
                IoProgress::Done(n) => got += n,
                IoProgress::WouldBlock => transport.ready(Interest::Read).await.unwrap(),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_closed_peer_is_not_idle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        drop(server);

        let mut transport = Transport::Tcp(client);
        transport.ready(Interest::Read).await.unwrap();
        assert!(!transport.is_idle());
    }
}
