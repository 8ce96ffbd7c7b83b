//! Info Protocol
//!
//! The text side channel used for cluster metadata. A request is a list of
//! newline terminated names sent as the body of an `INFO` frame:
//!
//! ```text
//! node\npartition-generation\n
//! ```
//!
//! The response carries one `name<TAB>value` line per requested name, in
//! any order. A line without a tab is a name with an empty value.

use crate::error::{Error, Result};
use crate::protocol::header::{msg_type, ProtoHeader, PROTO_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

pub fn encode_request(names: &[&str]) -> Bytes {
    let body_len: usize = names.iter().map(|n| n.len() + 1).sum();
    let mut buf = BytesMut::with_capacity(PROTO_SIZE + body_len);
    buf.put_slice(&ProtoHeader::new(msg_type::INFO, body_len).encode());
    for name in names {
        buf.put_slice(name.as_bytes());
        buf.put_u8(b'\n');
    }
    buf.freeze()
}

/// Splits a response body into name/value pairs.
pub fn parse_pairs(body: &str) -> Vec<(&str, &str)> {
    body.split('\n')
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('\t') {
            Some((name, value)) => (name, value),
            None => (line, ""),
        })
        .collect()
}

/// Parsed info response that only contains names we asked for.
#[derive(Debug, Default)]
pub struct InfoResponse {
    pairs: Vec<(String, String)>,
}

impl InfoResponse {
    pub fn parse(body: &[u8], requested: &[&str]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|e| Error::Protocol(format!("info response is not utf-8: {}", e)))?;

        let mut pairs = Vec::with_capacity(requested.len());
        for (name, value) in parse_pairs(text) {
            if !requested.contains(&name) {
                return Err(Error::Protocol(format!(
                    "did not request info '{}'",
                    name
                )));
            }
            pairs.push((name.to_string(), value.to_string()));
        }
        Ok(Self { pairs })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Like [`InfoResponse::get`] but a missing name is a protocol error.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::Protocol(format!("info response missing '{}'", name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.pairs
    }
}

/// Parses a numeric generation value.
pub fn parse_generation(name: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid {}: {:?}", name, value)))
}
