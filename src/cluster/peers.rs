//! Peer Discovery
//!
//! Nodes with the `peers` feature answer `peers-clear-std` (and the TLS /
//! alternate variants) with:
//!
//! ```text
//! <generation>,<default port>,[[<name>,<tls name>,[<host>[:port],...]],...]
//! ```
//!
//! Older nodes answer `services` with `host:port;host:port`.

use crate::config::Host;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub node_name: String,
    pub tls_name: Option<String>,
    pub hosts: Vec<Host>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerList {
    pub generation: u32,
    pub peers: Vec<Peer>,
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", c as char)))
        }
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Text up to (not including) the next `,` or `]`. Brackets of an IPv6
    /// literal are kept.
    fn token(&mut self) -> &'a str {
        let start = self.pos;
        let mut depth = 0;
        while let Some(c) = self.peek() {
            match c {
                b'[' => depth += 1,
                b']' if depth == 0 => break,
                b']' => depth -= 1,
                b',' if depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        &self.input[start..self.pos]
    }

    fn error(&self, what: &str) -> Error {
        Error::Protocol(format!("invalid peers at {}: {}", self.pos, what))
    }
}

pub fn parse_peers(value: &str) -> Result<PeerList> {
    let mut cur = Cursor {
        input: value.trim(),
        pos: 0,
    };

    let generation = cur
        .token()
        .parse()
        .map_err(|_| cur.error("generation"))?;
    cur.expect(b',')?;
    let port_token = cur.token();
    let default_port = if port_token.is_empty() {
        crate::config::DEFAULT_PORT
    } else {
        port_token.parse().map_err(|_| cur.error("default port"))?
    };
    cur.expect(b',')?;
    cur.expect(b'[')?;

    let mut peers = Vec::new();
    while cur.eat(b'[') {
        let node_name = cur.token().to_string();
        cur.expect(b',')?;
        let tls = cur.token();
        let tls_name = (!tls.is_empty()).then(|| tls.to_string());
        cur.expect(b',')?;
        cur.expect(b'[')?;

        let mut hosts = Vec::new();
        while cur.peek() != Some(b']') {
            let mut host = Host::parse(cur.token(), default_port)
                .map_err(|_| cur.error("host"))?;
            host.tls_name = tls_name.clone();
            hosts.push(host);
            if !cur.eat(b',') {
                break;
            }
        }
        cur.expect(b']')?;
        cur.expect(b']')?;

        if node_name.is_empty() {
            return Err(cur.error("empty node name"));
        }
        peers.push(Peer {
            node_name,
            tls_name,
            hosts,
        });

        if !cur.eat(b',') {
            break;
        }
    }
    cur.expect(b']')?;

    Ok(PeerList { generation, peers })
}

pub fn parse_services(value: &str) -> Result<Vec<Host>> {
    value
        .trim()
        .split(';')
        .filter(|s| !s.is_empty())
        .map(|s| Host::parse(s, crate::config::DEFAULT_PORT))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_peer_list() {
        let list = parse_peers("4,3000,[]").unwrap();
        assert_eq!(list.generation, 4);
        assert!(list.peers.is_empty());
    }

    #[test]
    fn test_peers_with_default_port_and_ipv6() {
        let list = parse_peers(
            "12,3000,[[BB9020011AC4202,,[10.0.0.2]],[BB9030011AC4202,tls-b,[10.0.0.3:4333,[2001:db8::3]:4333]]]",
        )
        .unwrap();

        assert_eq!(list.generation, 12);
        assert_eq!(list.peers.len(), 2);

        let first = &list.peers[0];
        assert_eq!(first.node_name, "BB9020011AC4202");
        assert_eq!(first.tls_name, None);
        assert_eq!(first.hosts, vec![Host::new("10.0.0.2", 3000)]);

        let second = &list.peers[1];
        assert_eq!(second.tls_name.as_deref(), Some("tls-b"));
        assert_eq!(second.hosts.len(), 2);
        assert_eq!(second.hosts[1].name, "2001:db8::3");
        assert_eq!(second.hosts[1].port, 4333);
        assert_eq!(second.hosts[1].tls_name.as_deref(), Some("tls-b"));
    }

    #[test]
    fn test_truncated_peers_rejected() {
        assert!(parse_peers("12,3000,[[A,,[10.0.0.2]").is_err());
        assert!(parse_peers("x,3000,[]").is_err());
        assert!(parse_peers("1,3000").is_err());
    }

    #[test]
    fn test_services() {
        let hosts = parse_services("10.0.0.2:3000;10.0.0.3:3001;").unwrap();
        assert_eq!(
            hosts,
            vec![Host::new("10.0.0.2", 3000), Host::new("10.0.0.3", 3001)]
        );
        assert!(parse_services("").unwrap().is_empty());
    }
}
