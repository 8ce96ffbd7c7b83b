//! Error Types
//!
//! Every fallible operation in the client returns [`Result<T>`], whose error
//! side is the [`Error`] enum below. Each variant maps onto a numeric
//! [`ResultCode`], so a caller can always get a stable code plus a readable
//! message, no matter how deep the failure started.
//!
//! ## Taxonomy
//!
//! ```text
//! client      InvalidArgument, Closed, Compression
//! connection  Connection, Tls, Timeout
//! protocol    Protocol
//! cluster     InvalidNode, NodeMismatch, NoMoreConnections
//! security    Auth
//! server      Server (result code reported by the cluster)
//! ```
//!
//! Context (node name, address) is layered on with [`Error::with_context`]
//! as an error crosses subsystem boundaries. The wrapped cause is kept, so
//! [`Error::root`] and [`Error::code`] still see the original failure.

use std::fmt;
use std::io;
use thiserror::Error;

/// Numeric status code carried by every error.
///
/// Non-negative values are reported by the server, negative values are
/// produced by the client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub i32);

impl ResultCode {
    pub const CONNECTION: ResultCode = ResultCode(-10);
    pub const TLS_ERROR: ResultCode = ResultCode(-9);
    pub const INVALID_NODE: ResultCode = ResultCode(-8);
    pub const NO_MORE_CONNECTIONS: ResultCode = ResultCode(-7);
    pub const CLIENT_ABORT: ResultCode = ResultCode(-5);
    pub const PARAMETER_CLIENT: ResultCode = ResultCode(-2);
    pub const CLIENT: ResultCode = ResultCode(-1);

    pub const OK: ResultCode = ResultCode(0);
    pub const SERVER_ERROR: ResultCode = ResultCode(1);
    pub const KEY_NOT_FOUND: ResultCode = ResultCode(2);
    pub const GENERATION_ERROR: ResultCode = ResultCode(3);
    pub const PARAMETER_ERROR: ResultCode = ResultCode(4);
    pub const KEY_EXISTS: ResultCode = ResultCode(5);
    pub const BIN_EXISTS: ResultCode = ResultCode(6);
    pub const CLUSTER_KEY_MISMATCH: ResultCode = ResultCode(7);
    pub const SERVER_MEM_ERROR: ResultCode = ResultCode(8);
    pub const TIMEOUT: ResultCode = ResultCode(9);
    pub const PARTITION_UNAVAILABLE: ResultCode = ResultCode(11);
    pub const BIN_TYPE_ERROR: ResultCode = ResultCode(12);
    pub const RECORD_TOO_BIG: ResultCode = ResultCode(13);
    pub const KEY_BUSY: ResultCode = ResultCode(14);
    pub const BIN_NOT_FOUND: ResultCode = ResultCode(17);
    pub const DEVICE_OVERLOAD: ResultCode = ResultCode(18);
    pub const FILTERED_OUT: ResultCode = ResultCode(27);
    pub const SECURITY_NOT_ENABLED: ResultCode = ResultCode(52);
    pub const INVALID_USER: ResultCode = ResultCode(60);
    pub const INVALID_CREDENTIAL: ResultCode = ResultCode(65);
    pub const EXPIRED_SESSION: ResultCode = ResultCode(66);
    pub const NOT_AUTHENTICATED: ResultCode = ResultCode(80);
    pub const UDF_BAD_RESPONSE: ResultCode = ResultCode(100);

    /// Server conditions that are expected to clear up on their own.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ResultCode::TIMEOUT
                | ResultCode::PARTITION_UNAVAILABLE
                | ResultCode::KEY_BUSY
                | ResultCode::DEVICE_OVERLOAD
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ResultCode::CONNECTION => "connection error",
            ResultCode::TLS_ERROR => "TLS error",
            ResultCode::INVALID_NODE => "invalid node",
            ResultCode::NO_MORE_CONNECTIONS => "no more connections",
            ResultCode::CLIENT_ABORT => "client abort",
            ResultCode::PARAMETER_CLIENT => "invalid client parameter",
            ResultCode::CLIENT => "client error",
            ResultCode::OK => "ok",
            ResultCode::SERVER_ERROR => "server error",
            ResultCode::KEY_NOT_FOUND => "key not found",
            ResultCode::GENERATION_ERROR => "generation error",
            ResultCode::PARAMETER_ERROR => "parameter error",
            ResultCode::KEY_EXISTS => "key exists",
            ResultCode::BIN_EXISTS => "bin exists",
            ResultCode::CLUSTER_KEY_MISMATCH => "cluster key mismatch",
            ResultCode::SERVER_MEM_ERROR => "server memory error",
            ResultCode::TIMEOUT => "timeout",
            ResultCode::PARTITION_UNAVAILABLE => "partition unavailable",
            ResultCode::BIN_TYPE_ERROR => "bin type error",
            ResultCode::RECORD_TOO_BIG => "record too big",
            ResultCode::KEY_BUSY => "key busy",
            ResultCode::BIN_NOT_FOUND => "bin not found",
            ResultCode::DEVICE_OVERLOAD => "device overload",
            ResultCode::FILTERED_OUT => "filtered out",
            ResultCode::SECURITY_NOT_ENABLED => "security not enabled",
            ResultCode::INVALID_USER => "invalid user",
            ResultCode::INVALID_CREDENTIAL => "invalid credential",
            ResultCode::EXPIRED_SESSION => "expired session",
            ResultCode::NOT_AUTHENTICATED => "not authenticated",
            ResultCode::UDF_BAD_RESPONSE => "UDF bad response",
            _ => "unknown result code",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Errors produced by the client.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied argument was rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Socket level failure: refused, reset, closed by peer.
    #[error("{message}: {source}")]
    Connection {
        message: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    /// A connect, socket or total deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The byte stream can no longer be trusted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A node answered with a different name than the one we track.
    #[error("node name changed from {expected} to {received}")]
    NodeMismatch { expected: String, received: String },

    /// No usable node for the request.
    #[error("invalid node: {0}")]
    InvalidNode(String),

    #[error("Max node {node} connections would be exceeded: {limit}")]
    NoMoreConnections { node: String, limit: usize },

    #[error("authentication failed: {code}")]
    Auth { code: ResultCode },

    /// Result code reported by the server for this request.
    #[error("server returned {code}")]
    Server { code: ResultCode, in_doubt: bool },

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("client is closed")]
    Closed,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn connection(message: impl Into<String>, source: io::Error) -> Self {
        Error::Connection {
            message: message.into(),
            source,
        }
    }

    pub fn server(code: ResultCode) -> Self {
        Error::Server {
            code,
            in_doubt: false,
        }
    }

    /// Wraps the error with extra diagnostic context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping any context layers.
    pub fn root(&self) -> &Error {
        let mut err = self;
        while let Error::Context { source, .. } = err {
            err = source;
        }
        err
    }

    pub fn code(&self) -> ResultCode {
        match self.root() {
            Error::InvalidArgument(_) => ResultCode::PARAMETER_CLIENT,
            Error::Connection { .. } => ResultCode::CONNECTION,
            Error::Tls(_) => ResultCode::TLS_ERROR,
            Error::Timeout(_) => ResultCode::TIMEOUT,
            Error::Protocol(_) => ResultCode::CLIENT,
            Error::NodeMismatch { .. } => ResultCode::INVALID_NODE,
            Error::InvalidNode(_) => ResultCode::INVALID_NODE,
            Error::NoMoreConnections { .. } => ResultCode::NO_MORE_CONNECTIONS,
            Error::Auth { code } => *code,
            Error::Server { code, .. } => *code,
            Error::Compression(_) => ResultCode::CLIENT,
            Error::Closed => ResultCode::CLIENT_ABORT,
            Error::Context { .. } => ResultCode::CLIENT,
        }
    }

    /// Whether the dispatcher may repeat the request on a fresh connection.
    pub fn is_retriable(&self) -> bool {
        match self.root() {
            Error::Connection { .. }
            | Error::Timeout(_)
            | Error::NoMoreConnections { .. }
            | Error::InvalidNode(_) => true,
            Error::Server { code, .. } => code.is_transient(),
            _ => false,
        }
    }

    /// Errors after which the connection is left in an unknown state.
    pub fn is_fatal_for_connection(&self) -> bool {
        !matches!(self.root(), Error::Server { .. })
    }

    /// True when a write may have been applied even though it failed.
    pub fn in_doubt(&self) -> bool {
        matches!(self.root(), Error::Server { in_doubt: true, .. })
    }

    pub(crate) fn set_in_doubt(self, sent: bool) -> Self {
        match self {
            Error::Server { code, .. } => Error::Server {
                code,
                in_doubt: sent,
            },
            Error::Context { context, source } => Error::Context {
                context,
                source: Box::new(source.set_in_doubt(sent)),
            },
            other => other,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::Timeout(format!("socket: {}", err))
            }
            _ => Error::connection("socket error", err),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}
