//! Client Configuration
//!
//! [`ClientConfig`] collects everything the cluster, the pools and the
//! dispatcher need. Every field has a default; usually only `hosts` is set.
//!
//! ```ignore
//! use fleetkv::{ClientConfig, Host};
//!
//! let mut config = ClientConfig::default();
//! config.hosts = Host::parse_list("10.0.0.1:3000,10.0.0.2:3000", 3000)?;
//! config.event_loops = 2;
//! ```

use crate::error::{Error, Result};
use crate::policy::{BatchPolicy, InfoPolicy, ReadPolicy, WritePolicy};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Default server port.
pub const DEFAULT_PORT: u16 = 3000;

/// A seed or peer address.
///
/// Accepted forms: `host`, `host:port`, `host:tls_name:port`, `[v6]:port`
/// and `[v6]:tls_name:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    pub name: String,
    pub tls_name: Option<String>,
    pub port: u16,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            tls_name: None,
            port,
        }
    }

    pub fn parse(s: &str, default_port: u16) -> Result<Host> {
        let s = s.trim();
        let invalid = || Error::InvalidArgument(format!("invalid host: {:?}", s));

        let (name, rest) = if let Some(stripped) = s.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(invalid)?;
            let rest = &stripped[end + 1..];
            let rest = match rest.strip_prefix(':') {
                Some(r) => r,
                None if rest.is_empty() => "",
                None => return Err(invalid()),
            };
            (&stripped[..end], rest)
        } else {
            match s.split_once(':') {
                Some((name, rest)) => (name, rest),
                None => (s, ""),
            }
        };

        if name.is_empty() {
            return Err(invalid());
        }

        let (tls_name, port) = match rest.split_once(':') {
            Some((tls, port)) => (Some(tls.to_string()), port),
            None => (None, rest),
        };

        let port = if port.is_empty() {
            default_port
        } else {
            port.parse().map_err(|_| invalid())?
        };

        Ok(Host {
            name: name.to_string(),
            tls_name,
            port,
        })
    }

    /// Parses a comma separated host list.
    pub fn parse_list(s: &str, default_port: u16) -> Result<Vec<Host>> {
        s.split(',')
            .filter(|h| !h.trim().is_empty())
            .map(|h| Host::parse(h, default_port))
            .collect()
    }

    /// Resolves the host into socket addresses.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.name.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::connection(format!("cannot resolve {}", self), e))?
            .collect();

        if addrs.is_empty() {
            return Err(Error::InvalidArgument(format!("no addresses for {}", self)));
        }
        Ok(addrs)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.contains(':') {
            write!(f, "[{}]:{}", self.name, self.port)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

/// User credentials.
///
/// `credential` is sent as is: callers pass the already hashed password.
#[derive(Clone)]
pub struct AuthConfig {
    pub user: String,
    pub credential: Vec<u8>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("user", &self.user)
            .field("credential", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM file with trusted roots.
    pub ca_file: Option<PathBuf>,
    /// In-memory PEM with trusted roots, used when `ca_file` is unset.
    pub ca_pem: Option<Vec<u8>>,
    /// Use the `*-alt` peer lists when discovering nodes.
    pub use_alternate_peers: bool,
}

/// Configuration for [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed hosts used until the first node is discovered.
    pub hosts: Vec<Host>,
    pub auth: Option<AuthConfig>,
    pub tls: Option<TlsConfig>,

    /// Timeout for establishing a single TCP connection.
    pub connect_timeout: Duration,
    /// Timeout for the login round trip on new connections.
    pub login_timeout: Duration,
    /// Interval between tend cycles.
    pub tend_interval: Duration,

    /// Sync connections allowed per node, spread across `conn_pools_per_node`.
    pub max_conns_per_node: usize,
    pub conn_pools_per_node: usize,
    /// Async connections allowed per node, spread across event loops.
    pub async_max_conns_per_node: usize,
    /// Pipelined connections allowed per node, spread across event loops.
    pub pipe_max_conns_per_node: usize,
    /// Pooled connections idle longer than this are closed.
    pub max_socket_idle: Duration,

    /// Number of worker event loops. Zero disables async commands.
    pub event_loops: usize,

    pub rack_aware: bool,
    pub rack_id: i32,
    /// Ask nodes for `services-alternate` instead of `services`.
    pub use_services_alternate: bool,
    /// Consecutive tend failures before a node is dropped.
    pub max_node_failures: u32,
    /// Fail [`crate::Client::new`] when no seed can be reached.
    pub fail_if_not_connected: bool,

    pub read_policy: ReadPolicy,
    pub write_policy: WritePolicy,
    pub batch_policy: BatchPolicy,
    pub info_policy: InfoPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: vec![Host::new("127.0.0.1", DEFAULT_PORT)],
            auth: None,
            tls: None,
            connect_timeout: Duration::from_secs(1),
            login_timeout: Duration::from_secs(5),
            tend_interval: Duration::from_secs(1),
            max_conns_per_node: 100,
            conn_pools_per_node: 1,
            async_max_conns_per_node: 100,
            pipe_max_conns_per_node: 64,
            max_socket_idle: Duration::from_secs(55),
            event_loops: 0,
            rack_aware: false,
            rack_id: 0,
            use_services_alternate: false,
            max_node_failures: 5,
            fail_if_not_connected: true,
            read_policy: ReadPolicy::default(),
            write_policy: WritePolicy::default(),
            batch_policy: BatchPolicy::default(),
            info_policy: InfoPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_hosts(hosts: Vec<Host>) -> Self {
        Self {
            hosts,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::InvalidArgument("no seed hosts".into()));
        }
        if self.conn_pools_per_node == 0 {
            return Err(Error::InvalidArgument(
                "conn_pools_per_node must be at least 1".into(),
            ));
        }
        if self.max_conns_per_node < self.conn_pools_per_node {
            return Err(Error::InvalidArgument(format!(
                "max_conns_per_node {} is less than conn_pools_per_node {}",
                self.max_conns_per_node, self.conn_pools_per_node
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_forms() {
        assert_eq!(Host::parse("a.example", 3000).unwrap(), Host::new("a.example", 3000));
        assert_eq!(Host::parse("10.0.0.1:3100", 3000).unwrap(), Host::new("10.0.0.1", 3100));

        let tls = Host::parse("10.0.0.1:cluster-a:4333", 3000).unwrap();
        assert_eq!(tls.tls_name.as_deref(), Some("cluster-a"));
        assert_eq!(tls.port, 4333);

        let v6 = Host::parse("[fe80::1]:3000", 3100).unwrap();
        assert_eq!(v6.name, "fe80::1");
        assert_eq!(v6.port, 3000);
        assert_eq!(v6.to_string(), "[fe80::1]:3000");

        assert_eq!(Host::parse("[::1]", 3100).unwrap().port, 3100);
    }

    #[test]
    fn test_parse_host_errors() {
        assert!(Host::parse("", 3000).is_err());
        assert!(Host::parse("a:notaport", 3000).is_err());
        assert!(Host::parse("[::1", 3000).is_err());
    }

    #[test]
    fn test_parse_list() {
        let hosts = Host::parse_list("a:1, b:2,", 3000).unwrap();
        assert_eq!(hosts, vec![Host::new("a", 1), Host::new("b", 2)]);
    }

    #[test]
    fn test_validate() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_ok());

        config.conn_pools_per_node = 0;
        assert!(config.validate().is_err());

        config.conn_pools_per_node = 4;
        config.max_conns_per_node = 3;
        assert!(config.validate().is_err());
    }
}
