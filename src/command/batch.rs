//! Batch reads.
//!
//! Keys are grouped by the node that owns their partition and each group
//! becomes one batch-index request. Responses carry the key's position in
//! the caller's slice, so results land in caller order whatever the
//! grouping.

use crate::cluster::{Cluster, Node};
use crate::command::{sync, Route};
use crate::error::{Error, Result};
use crate::event::driver::{self, AsyncRequest};
use crate::key::Key;
use crate::policy::BatchPolicy;
use crate::protocol::command::encode_batch_read;
use crate::protocol::BatchParser;
use crate::value::Record;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Keys routed to one node, as positions in the caller's key slice.
#[derive(Debug)]
pub(crate) struct BatchGroup {
    pub node: Arc<Node>,
    pub offsets: Vec<usize>,
}

/// Groups keys by node in order of first appearance.
pub(crate) fn group_by_node(
    keys: &[Key],
    mut resolve: impl FnMut(&Key) -> Result<Arc<Node>>,
) -> Result<Vec<BatchGroup>> {
    let mut groups: Vec<BatchGroup> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for (offset, key) in keys.iter().enumerate() {
        let node = resolve(key)?;
        match by_name.get(node.name()) {
            Some(&i) => groups[i].offsets.push(offset),
            None => {
                by_name.insert(node.name().to_string(), groups.len());
                groups.push(BatchGroup {
                    node,
                    offsets: vec![offset],
                });
            }
        }
    }
    Ok(groups)
}

fn plan(
    cluster: &Cluster,
    policy: &BatchPolicy,
    keys: &[Key],
    bins: Option<&[&str]>,
    metadata_only: bool,
) -> Result<Vec<(BatchGroup, Bytes)>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }
    let groups = group_by_node(keys, |key| {
        Route::key(key, policy.replica).resolve(cluster, 0)
    })?;
    trace!(keys = keys.len(), nodes = groups.len(), "Planned batch");

    groups
        .into_iter()
        .map(|group| {
            let request = encode_batch_read(
                &policy.base,
                policy.read_mode_ap,
                keys,
                &group.offsets,
                bins,
                metadata_only,
            )?;
            Ok((group, request))
        })
        .collect()
}

/// Moves the records a group received into their caller positions.
fn merge(results: &mut [Option<Record>], offsets: &[usize], parser: BatchParser) {
    let mut records = parser.records;
    for &offset in offsets {
        if let Some(record) = records.get_mut(offset).and_then(Option::take) {
            results[offset] = Some(record);
        }
    }
}

/// Reads `keys` on the caller's thread, one node after another.
pub fn execute(
    cluster: &Cluster,
    policy: &BatchPolicy,
    keys: &[Key],
    bins: Option<&[&str]>,
    metadata_only: bool,
) -> Result<Vec<Option<Record>>> {
    let mut results = vec![None; keys.len()];

    for (group, request) in plan(cluster, policy, keys, bins, metadata_only)? {
        let mut parser = BatchParser::new(keys.len(), !metadata_only);
        sync::execute(
            cluster,
            &Route::Node(Arc::clone(&group.node)),
            &request,
            &mut parser,
            &policy.base,
            false,
        )?;
        merge(&mut results, &group.offsets, parser);
    }
    Ok(results)
}

/// Reads `keys` on worker loop `loop_index`, all nodes concurrently.
pub(crate) async fn execute_async(
    cluster: Arc<Cluster>,
    loop_index: usize,
    policy: BatchPolicy,
    keys: Vec<Key>,
    metadata_only: bool,
) -> Result<Vec<Option<Record>>> {
    let n_keys = keys.len();
    let mut tasks = Vec::new();

    for (group, request) in plan(&cluster, &policy, &keys, None, metadata_only)? {
        let req = AsyncRequest {
            route: Route::Node(group.node),
            request,
            parser: BatchParser::new(n_keys, !metadata_only),
            policy: policy.base.clone(),
            is_write: false,
            pipeline: false,
        };
        let task = tokio::task::spawn_local(driver::execute(Arc::clone(&cluster), loop_index, req));
        tasks.push((group.offsets, task));
    }

    let mut results = vec![None; n_keys];
    let mut first_error = None;
    for (offsets, task) in tasks {
        match task.await {
            Ok(Ok(parser)) => merge(&mut results, &offsets, parser),
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(_) => {
                first_error.get_or_insert(Error::Closed);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::tests::test_node;
    use crate::value::Value;

    fn keys(n: i64) -> Vec<Key> {
        (0..n).map(|i| Key::new("test", "s", i).unwrap()).collect()
    }

    #[test]
    fn test_groups_keep_first_appearance_order() {
        let a = test_node("A");
        let b = test_node("B");
        let keys = keys(5);

        let groups = group_by_node(&keys, |key| {
            let node = match key.user_key {
                Some(Value::Int(i)) if i % 2 == 1 => &b,
                _ => &a,
            };
            Ok(Arc::clone(node))
        })
        .unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].node.name(), "A");
        assert_eq!(groups[0].offsets, vec![0, 2, 4]);
        assert_eq!(groups[1].node.name(), "B");
        assert_eq!(groups[1].offsets, vec![1, 3]);
    }

    #[test]
    fn test_group_fails_when_a_key_has_no_node() {
        let keys = keys(3);
        let err = group_by_node(&keys, |_| Err(Error::InvalidNode("empty".into()))).unwrap_err();
        assert!(matches!(err, Error::InvalidNode(_)));
    }

    #[test]
    fn test_merge_places_records_by_offset() {
        let mut results: Vec<Option<Record>> = vec![None; 4];

        let mut parser = BatchParser::new(4, true);
        parser.records[3] = Some(Record::default());
        parser.records[1] = Some(Record {
            generation: 7,
            ..Record::default()
        });
        merge(&mut results, &[1, 3], parser);

        assert!(results[0].is_none());
        assert_eq!(results[1].as_ref().unwrap().generation, 7);
        assert!(results[2].is_none());
        assert!(results[3].is_some());
    }
}
