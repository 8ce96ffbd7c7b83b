//! Async Command State Machine
//!
//! One [`AsyncCommand`] carries a single request through a connection
//! without ever blocking. The driver calls [`AsyncCommand::on_ready`]
//! whenever the socket may have made progress; the command moves as far as
//! it can and answers with the readiness it needs next.
//!
//! ```text
//! Connecting ──► TlsHandshake ──► AuthWrite ──► AuthReadHeader ──► AuthReadBody
//!     │              │                                                   │
//!     │ (plain)      │ (no session)                                      │
//!     ▼              ▼                                                   ▼
//!  CommandWrite ◄────┴───────────────────────────────────────────────────┘
//!     │
//!     ▼
//!  CommandReadHeader ──► CommandReadBody ──► Done
//!        ▲                     │
//!        └── frame not final ──┘
//!
//!  any failure ──► Error
//! ```
//!
//! Pooled connections start at `CommandWrite`. Header and body reads resume
//! at a cursor, so a frame may arrive one byte at a time.

use crate::auth;
use crate::error::{Error, Result};
use crate::event::io::{Interest, IoProgress, NonBlockingIo};
use crate::protocol::header::{msg_type, ProtoHeader, PROTO_SIZE};
use crate::protocol::ResponseParser;
use bytes::Bytes;
use std::io;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    TlsHandshake,
    AuthWrite,
    AuthReadHeader,
    AuthReadBody,
    CommandWrite,
    CommandReadHeader,
    CommandReadBody,
    Done,
    Error,
}

/// What the driver should do after an `on_ready` call.
#[derive(Debug)]
pub enum Step {
    /// Park until the socket is ready for this interest.
    Wait(Interest),
    /// Pipelined request fully written; the response is read later.
    Written,
    Done,
    Failed(Error),
}

pub struct AsyncCommand<P> {
    state: State,
    request: Bytes,
    auth: Option<Bytes>,
    tls: bool,
    pipelined: bool,
    parser: P,

    offset: usize,
    header: [u8; PROTO_SIZE],
    kind: u8,
    body: Vec<u8>,
    body_len: usize,
    sent: bool,
    event_received: bool,
}

impl<P> std::fmt::Debug for AsyncCommand<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCommand")
            .field("state", &self.state)
            .field("request_len", &self.request.len())
            .field("offset", &self.offset)
            .finish()
    }
}

fn closed(op: &str) -> Error {
    Error::connection(
        format!("{}: connection closed by peer", op),
        io::Error::from(io::ErrorKind::UnexpectedEof),
    )
}

fn blocked(progress: IoProgress, natural: Interest, op: &str) -> Result<Step> {
    match progress {
        IoProgress::WouldBlock => Ok(Step::Wait(natural)),
        IoProgress::NeedRead => Ok(Step::Wait(Interest::Read)),
        IoProgress::NeedWrite => Ok(Step::Wait(Interest::Write)),
        IoProgress::Closed => Err(closed(op)),
        IoProgress::Done(_) => Err(Error::Protocol(format!("{}: no progress", op))),
    }
}

/// Reads into `buf[*offset..]` until full. `None` once complete.
fn fill(
    io: &mut dyn NonBlockingIo,
    buf: &mut [u8],
    offset: &mut usize,
    event_received: &mut bool,
) -> Result<Option<Step>> {
    while *offset < buf.len() {
        match io.try_read(&mut buf[*offset..])? {
            IoProgress::Done(n) => {
                *offset += n;
                *event_received = true;
            }
            other => return blocked(other, Interest::Read, "read").map(Some),
        }
    }
    Ok(None)
}

impl<P: ResponseParser> AsyncCommand<P> {
    pub fn new(request: Bytes, parser: P) -> Self {
        Self {
            state: State::CommandWrite,
            request,
            auth: None,
            tls: false,
            pipelined: false,
            parser,
            offset: 0,
            header: [0; PROTO_SIZE],
            kind: 0,
            body: Vec::new(),
            body_len: 0,
            sent: false,
            event_received: false,
        }
    }

    /// Marks the command as one of several in flight on a connection.
    pub fn pipelined(mut self) -> Self {
        self.pipelined = true;
        self
    }

    /// Rewinds the command for an attempt on a new connection (`fresh`) or
    /// a pooled one. `auth` is the authenticate request for fresh
    /// connections to a secured cluster.
    pub fn start(&mut self, fresh: bool, tls: bool, auth: Option<Bytes>) {
        self.state = if fresh {
            State::Connecting
        } else {
            State::CommandWrite
        };
        self.tls = tls;
        self.auth = auth;
        self.offset = 0;
        self.body_len = 0;
        self.sent = false;
        self.event_received = false;
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// True once the whole request has left the client, even if the
    /// command failed afterwards.
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn is_reading_response(&self) -> bool {
        matches!(self.state, State::CommandReadHeader | State::CommandReadBody)
    }

    /// Socket timer check: returns whether a read made progress since the
    /// last check and clears the flag.
    pub fn take_event_received(&mut self) -> bool {
        std::mem::replace(&mut self.event_received, false)
    }

    pub fn parser(&self) -> &P {
        &self.parser
    }

    pub fn into_parser(self) -> P {
        self.parser
    }

    pub fn on_ready(&mut self, io: &mut dyn NonBlockingIo) -> Step {
        match self.advance(io) {
            Ok(step) => step,
            Err(e) => {
                self.state = State::Error;
                Step::Failed(e)
            }
        }
    }

    fn advance(&mut self, io: &mut dyn NonBlockingIo) -> Result<Step> {
        loop {
            match self.state {
                State::Connecting => {
                    self.state = if self.tls {
                        State::TlsHandshake
                    } else {
                        self.after_handshake()
                    };
                }
                State::TlsHandshake => match io.handshake()? {
                    IoProgress::Done(_) => self.state = self.after_handshake(),
                    other => return blocked(other, Interest::Read, "TLS handshake"),
                },
                State::AuthWrite => {
                    let request = self.auth.clone().unwrap_or_default();
                    if let Some(step) = self.write(io, &request)? {
                        return Ok(step);
                    }
                    self.state = State::AuthReadHeader;
                }
                State::AuthReadHeader => {
                    if let Some(step) = self.read_header(io, msg_type::ADMIN)? {
                        return Ok(step);
                    }
                    self.state = State::AuthReadBody;
                }
                State::AuthReadBody => {
                    if let Some(step) = self.read_body(io)? {
                        return Ok(step);
                    }
                    auth::check_authenticate(&self.body[..self.body_len])?;
                    self.offset = 0;
                    self.state = State::CommandWrite;
                }
                State::CommandWrite => {
                    let request = self.request.clone();
                    if let Some(step) = self.write(io, &request)? {
                        return Ok(step);
                    }
                    self.sent = true;
                    self.state = State::CommandReadHeader;
                    if self.pipelined {
                        return Ok(Step::Written);
                    }
                }
                State::CommandReadHeader => {
                    if let Some(step) = self.read_header(io, msg_type::MESSAGE)? {
                        return Ok(step);
                    }
                    self.state = State::CommandReadBody;
                }
                State::CommandReadBody => {
                    if let Some(step) = self.read_body(io)? {
                        return Ok(step);
                    }
                    let done = self.parser.parse(self.kind, &self.body[..self.body_len])?;
                    if done {
                        self.state = State::Done;
                        return Ok(Step::Done);
                    }
                    self.state = State::CommandReadHeader;
                }
                State::Done => return Ok(Step::Done),
                State::Error => return Err(Error::Protocol("command already failed".into())),
            }
        }
    }

    fn after_handshake(&self) -> State {
        if self.auth.is_some() {
            State::AuthWrite
        } else {
            State::CommandWrite
        }
    }

    /// Writes `buf` from the cursor and flushes. Write completion resets
    /// the cursor and the socket timer's event flag.
    fn write(&mut self, io: &mut dyn NonBlockingIo, buf: &[u8]) -> Result<Option<Step>> {
        while self.offset < buf.len() {
            match io.try_write(&buf[self.offset..])? {
                IoProgress::Done(n) => self.offset += n,
                other => return blocked(other, Interest::Write, "write").map(Some),
            }
        }
        match io.flush()? {
            IoProgress::Done(_) => {}
            other => return blocked(other, Interest::Write, "write").map(Some),
        }
        self.offset = 0;
        self.event_received = false;
        Ok(None)
    }

    fn read_header(&mut self, io: &mut dyn NonBlockingIo, expected_kind: u8) -> Result<Option<Step>> {
        if let Some(step) = fill(io, &mut self.header, &mut self.offset, &mut self.event_received)? {
            return Ok(Some(step));
        }
        let header = ProtoHeader::decode(&self.header)?;
        header.validate(expected_kind)?;

        self.kind = header.kind;
        self.body_len = header.size;
        if self.body.len() < header.size {
            self.body.resize(header.size, 0);
        }
        self.offset = 0;
        Ok(None)
    }

    fn read_body(&mut self, io: &mut dyn NonBlockingIo) -> Result<Option<Step>> {
        let body = &mut self.body[..self.body_len];
        if let Some(step) = fill(io, body, &mut self.offset, &mut self.event_received)? {
            return Ok(Some(step));
        }
        self.offset = 0;
        Ok(None)
    }
}
