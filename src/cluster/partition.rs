//! Partition Tables
//!
//! Each namespace has a table of [`N_PARTITIONS`] entries naming the master
//! and prole node. Tables are immutable: the tend thread copies the map,
//! applies every node's `replicas` answer and swaps the new map in.
//!
//! ## `replicas` Format
//!
//! ```text
//! ns:[regime,]replica_count,<b64 bitmap master>,<b64 bitmap prole>,...;ns2:...
//! ```
//!
//! Bit `pid` of a bitmap (`bitmap[pid >> 3] & (0x80 >> (pid & 7))`) says the
//! reporting node owns that partition for that replica level. Only the
//! first two levels are tracked.

use crate::cluster::node::Node;
use crate::error::{Error, Result};
use crate::key::{MAX_NAMESPACE, N_PARTITIONS};
use crate::policy::Replica;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Size of an encoded partition bitmap.
pub const BITMAP_SIZE: usize = N_PARTITIONS.div_ceil(8);

fn encoded_bitmap_len() -> usize {
    BITMAP_SIZE.div_ceil(3) * 4
}

#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub master: Option<Arc<Node>>,
    pub prole: Option<Arc<Node>>,
    pub regime: u32,
}

impl Partition {
    fn replica(&self, index: usize) -> Option<&Arc<Node>> {
        if index == 0 {
            self.master.as_ref()
        } else {
            self.prole.as_ref()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PartitionTable {
    pub partitions: Vec<Partition>,
    /// Strong consistency namespace: never fall back to a random node.
    pub sc_mode: bool,
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self {
            partitions: vec![Partition::default(); N_PARTITIONS],
            sc_mode: false,
        }
    }
}

pub type PartitionMap = HashMap<String, Arc<PartitionTable>>;

fn same_node(a: Option<&Arc<Node>>, b: &Arc<Node>) -> bool {
    a.is_some_and(|a| Arc::ptr_eq(a, b))
}

fn usable(node: Option<&Arc<Node>>) -> Option<Arc<Node>> {
    node.filter(|n| n.is_active()).cloned()
}

impl PartitionTable {
    fn update(&mut self, pid: usize, node: &Arc<Node>, master: bool, owns: bool, regime: u32) {
        let p = &mut self.partitions[pid];

        if master {
            if owns {
                if regime >= p.regime {
                    if !same_node(p.master.as_ref(), node) {
                        if let Some(old) = p.master.take() {
                            // The old master has a stale view of this partition.
                            old.force_partition_refresh();
                        }
                        p.master = Some(Arc::clone(node));
                    }
                    if regime > p.regime {
                        p.regime = regime;
                    }
                }
            } else if same_node(p.master.as_ref(), node) {
                p.master = None;
            }
        } else if owns {
            if !same_node(p.prole.as_ref(), node) {
                p.prole = Some(Arc::clone(node));
            }
        } else if same_node(p.prole.as_ref(), node) {
            p.prole = None;
        }
    }

    /// Picks the node for a partition according to the replica policy.
    pub fn select(
        &self,
        namespace: &str,
        pid: usize,
        replica: Replica,
        iteration: u32,
        rack_id: Option<i32>,
        any_counter: &AtomicUsize,
    ) -> Option<Arc<Node>> {
        let p = &self.partitions[pid];

        match replica {
            Replica::Master => usable(p.master.as_ref()),
            Replica::Any => {
                let start = any_counter.fetch_add(1, Ordering::Relaxed);
                sequence(p, start)
            }
            Replica::Sequence => sequence(p, iteration as usize),
            Replica::PreferRack => {
                if let Some(rack) = rack_id {
                    for index in 0..2 {
                        if let Some(node) = usable(p.replica(index)) {
                            if node.has_rack(namespace, rack) {
                                return Some(node);
                            }
                        }
                    }
                }
                sequence(p, iteration as usize)
            }
        }
    }
}

fn sequence(p: &Partition, start: usize) -> Option<Arc<Node>> {
    (0..2).find_map(|i| usable(p.replica((start + i) % 2)))
}

/// Applies one node's `replicas` (or `replicas-all`) answer to `map`.
///
/// Returns the number of namespaces touched.
pub fn apply_replicas(
    map: &mut PartitionMap,
    node: &Arc<Node>,
    value: &str,
    has_regime: bool,
) -> Result<usize> {
    let expected_len = encoded_bitmap_len();
    let mut touched = 0;

    for entry in value.trim().split(';').filter(|e| !e.is_empty()) {
        let (ns, rest) = entry
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("invalid replicas entry: {:.40}", entry)))?;
        if ns.is_empty() || ns.len() > MAX_NAMESPACE {
            return Err(Error::Protocol(format!("invalid partition namespace {:?}", ns)));
        }

        let mut parts = rest.split(',');
        let regime = if has_regime {
            parse_number(parts.next(), "regime")?
        } else {
            0
        };
        let replica_count = parse_number(parts.next(), "replica count")? as usize;

        let mut bitmaps = Vec::with_capacity(2);
        for level in 0..replica_count {
            let encoded = parts.next().ok_or_else(|| {
                Error::Protocol(format!("{}: missing bitmap for replica {}", ns, level))
            })?;
            if encoded.len() != expected_len {
                return Err(Error::Protocol(format!(
                    "{}: bitmap length {} expected {}",
                    ns,
                    encoded.len(),
                    expected_len
                )));
            }
            if level < 2 {
                let bitmap = STANDARD
                    .decode(encoded)
                    .map_err(|e| Error::Protocol(format!("{}: invalid bitmap: {}", ns, e)))?;
                if bitmap.len() != BITMAP_SIZE {
                    return Err(Error::Protocol(format!("{}: bitmap decodes to {} bytes", ns, bitmap.len())));
                }
                bitmaps.push(bitmap);
            }
        }

        let table = map.entry(ns.to_string()).or_insert_with(|| {
            info!(namespace = %ns, "Creating partition table");
            Arc::new(PartitionTable::default())
        });
        let table = Arc::make_mut(table);
        if regime != 0 {
            table.sc_mode = true;
        }

        for (level, bitmap) in bitmaps.iter().enumerate() {
            for pid in 0..N_PARTITIONS {
                let owns = bitmap[pid >> 3] & (0x80 >> (pid & 7)) != 0;
                table.update(pid, node, level == 0, owns, regime);
            }
        }
        touched += 1;
    }

    debug!(node = %node.name(), namespaces = touched, "Applied partition map");
    Ok(touched)
}

/// Clears every slot that still names `node`. Tables without such a slot
/// are left shared with the previous map.
pub fn remove_node(map: &mut PartitionMap, node: &Arc<Node>) -> usize {
    let mut cleared = 0;
    for table in map.values_mut() {
        let referenced = table.partitions.iter().any(|p| {
            same_node(p.master.as_ref(), node) || same_node(p.prole.as_ref(), node)
        });
        if !referenced {
            continue;
        }
        for p in Arc::make_mut(table).partitions.iter_mut() {
            if same_node(p.master.as_ref(), node) {
                p.master = None;
                cleared += 1;
            }
            if same_node(p.prole.as_ref(), node) {
                p.prole = None;
                cleared += 1;
            }
        }
    }
    cleared
}

fn parse_number(part: Option<&str>, what: &str) -> Result<u32> {
    part.and_then(|p| p.trim().parse().ok())
        .ok_or_else(|| Error::Protocol(format!("invalid partition {}", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::tests::test_node;

    fn bitmap(owned: impl Fn(usize) -> bool) -> String {
        let mut bytes = vec![0u8; BITMAP_SIZE];
        for pid in 0..N_PARTITIONS {
            if owned(pid) {
                bytes[pid >> 3] |= 0x80 >> (pid & 7);
            }
        }
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_bitmap_length_constant() {
        assert_eq!(BITMAP_SIZE, 512);
        assert_eq!(encoded_bitmap_len(), 684);
    }

    #[test]
    fn test_master_and_prole_assignment() {
        let a = test_node("A");
        let b = test_node("B");
        let mut map = PartitionMap::new();

        let value_a = format!("test:2,{},{};", bitmap(|p| p % 2 == 0), bitmap(|p| p % 2 == 1));
        let value_b = format!("test:2,{},{};", bitmap(|p| p % 2 == 1), bitmap(|p| p % 2 == 0));
        assert_eq!(apply_replicas(&mut map, &a, &value_a, false).unwrap(), 1);
        apply_replicas(&mut map, &b, &value_b, false).unwrap();

        let table = &map["test"];
        assert!(!table.sc_mode);
        assert!(Arc::ptr_eq(table.partitions[0].master.as_ref().unwrap(), &a));
        assert!(Arc::ptr_eq(table.partitions[0].prole.as_ref().unwrap(), &b));
        assert!(Arc::ptr_eq(table.partitions[1].master.as_ref().unwrap(), &b));
    }

    #[test]
    fn test_regime_blocks_stale_master() {
        let a = test_node("A");
        let b = test_node("B");
        let mut map = PartitionMap::new();
        let all = bitmap(|_| true);

        apply_replicas(&mut map, &a, &format!("test:5,1,{}", all), true).unwrap();
        apply_replicas(&mut map, &b, &format!("test:4,1,{}", all), true).unwrap();

        let table = &map["test"];
        assert!(table.sc_mode);
        assert!(Arc::ptr_eq(table.partitions[7].master.as_ref().unwrap(), &a));
        assert_eq!(table.partitions[7].regime, 5);
    }

    #[test]
    fn test_replaced_master_forces_refresh() {
        let a = test_node("A");
        let b = test_node("B");
        let mut map = PartitionMap::new();
        let all = bitmap(|_| true);

        apply_replicas(&mut map, &a, &format!("test:1,{}", all), false).unwrap();
        a.set_partition_generation(3);
        apply_replicas(&mut map, &b, &format!("test:1,{}", all), false).unwrap();

        assert_eq!(a.partition_generation(), u32::MAX);
        assert!(Arc::ptr_eq(map["test"].partitions[0].master.as_ref().unwrap(), &b));
    }

    #[test]
    fn test_copy_on_write_keeps_old_snapshot() {
        let a = test_node("A");
        let b = test_node("B");
        let mut map = PartitionMap::new();
        apply_replicas(&mut map, &a, &format!("test:1,{}", bitmap(|_| true)), false).unwrap();
        let old = map.clone();

        apply_replicas(&mut map, &b, &format!("test:1,{}", bitmap(|_| true)), false).unwrap();
        assert!(Arc::ptr_eq(old["test"].partitions[0].master.as_ref().unwrap(), &a));
        assert!(Arc::ptr_eq(map["test"].partitions[0].master.as_ref().unwrap(), &b));
    }

    #[test]
    fn test_remove_node_releases_its_slots() {
        let a = test_node("A");
        let b = test_node("B");
        let mut map = PartitionMap::new();
        let value = format!("test:2,{},{}", bitmap(|p| p % 2 == 0), bitmap(|p| p % 2 == 1));
        apply_replicas(&mut map, &a, &value, false).unwrap();
        apply_replicas(&mut map, &b, &format!("other:1,{}", bitmap(|_| true)), false).unwrap();
        let before = map.clone();

        assert_eq!(remove_node(&mut map, &a), N_PARTITIONS);

        let table = &map["test"];
        assert!(table.partitions.iter().all(|p| p.master.is_none() && p.prole.is_none()));
        assert!(Arc::ptr_eq(&map["other"], &before["other"]));
        drop(before);
        assert_eq!(Arc::strong_count(&a), 1);
        assert_eq!(remove_node(&mut map, &a), 0);
    }

    #[test]
    fn test_bad_bitmap_rejected() {
        let a = test_node("A");
        let mut map = PartitionMap::new();
        assert!(apply_replicas(&mut map, &a, "test:1,AAAA", false).is_err());
        assert!(apply_replicas(&mut map, &a, "test:x,AAAA", false).is_err());
        let long_ns = format!("{}:1,{}", "n".repeat(32), bitmap(|_| true));
        assert!(apply_replicas(&mut map, &a, &long_ns, false).is_err());
    }

    #[test]
    fn test_sequence_flips_on_retry() {
        let a = test_node("A");
        let b = test_node("B");
        let mut map = PartitionMap::new();
        let value = format!("test:2,{},{}", bitmap(|_| true), bitmap(|_| false));
        apply_replicas(&mut map, &a, &value, false).unwrap();
        let value = format!("test:2,{},{}", bitmap(|_| false), bitmap(|_| true));
        apply_replicas(&mut map, &b, &value, false).unwrap();

        let table = &map["test"];
        let counter = AtomicUsize::new(0);
        let first = table.select("test", 9, Replica::Sequence, 0, None, &counter).unwrap();
        let retry = table.select("test", 9, Replica::Sequence, 1, None, &counter).unwrap();
        assert_eq!(first.name(), "A");
        assert_eq!(retry.name(), "B");

        a.deactivate();
        let master = table.select("test", 9, Replica::Master, 0, None, &counter);
        assert!(master.is_none());
        let fallback = table.select("test", 9, Replica::Sequence, 0, None, &counter).unwrap();
        assert_eq!(fallback.name(), "B");
    }

    #[test]
    fn test_prefer_rack() {
        let a = test_node("A");
        let b = test_node("B");
        b.set_racks(crate::cluster::rack::Racks::Uniform(2));
        let mut map = PartitionMap::new();
        let value = format!("test:2,{},{}", bitmap(|_| true), bitmap(|_| false));
        apply_replicas(&mut map, &a, &value, false).unwrap();
        let value = format!("test:2,{},{}", bitmap(|_| false), bitmap(|_| true));
        apply_replicas(&mut map, &b, &value, false).unwrap();

        let counter = AtomicUsize::new(0);
        let node = map["test"]
            .select("test", 0, Replica::PreferRack, 0, Some(2), &counter)
            .unwrap();
        assert_eq!(node.name(), "B");
    }
}
