//! Rack Assignments
//!
//! `rack-ids` reports one rack per namespace: `ns1:1;ns2:1;`. Nearly every
//! cluster places all namespaces of a node on the same rack, so that case
//! is stored as a single id instead of a table. Both shapes answer the same
//! question: does this node serve rack R for namespace N?

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Racks {
    /// Every reported namespace is on this rack.
    Uniform(i32),
    PerNamespace(Vec<(String, i32)>),
}

impl Default for Racks {
    fn default() -> Self {
        Racks::PerNamespace(Vec::new())
    }
}

impl Racks {
    pub fn parse(value: &str) -> Result<Racks> {
        let mut entries: Vec<(String, i32)> = Vec::new();

        for entry in value.trim().split(';').filter(|e| !e.is_empty()) {
            let (ns, rack) = entry
                .split_once(':')
                .ok_or_else(|| Error::Protocol(format!("invalid rack entry: {:?}", entry)))?;
            if ns.is_empty() || ns.len() > crate::key::MAX_NAMESPACE {
                return Err(Error::Protocol(format!("invalid rack namespace: {:?}", ns)));
            }
            let rack = rack
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid rack id: {:?}", rack)))?;
            entries.push((ns.to_string(), rack));
        }

        Ok(Racks::from_entries(entries))
    }

    pub fn from_entries(entries: Vec<(String, i32)>) -> Racks {
        match entries.first() {
            Some(&(_, first)) if entries.iter().all(|(_, r)| *r == first) => Racks::Uniform(first),
            _ => Racks::PerNamespace(entries),
        }
    }

    pub fn has_rack(&self, namespace: &str, rack: i32) -> bool {
        match self {
            Racks::Uniform(id) => *id == rack,
            Racks::PerNamespace(entries) => entries
                .iter()
                .any(|(ns, id)| ns == namespace && *id == rack),
        }
    }
}
