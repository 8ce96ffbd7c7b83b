//! Commands on worker event loops, direct and pipelined.

mod common;

use common::FakeNode;
use fleetkv::key::N_PARTITIONS;
use fleetkv::{Bin, Client, Key, Operation, Value};
use tokio_test::assert_ok;

fn key(id: i64) -> Key {
    Key::new("test", "users", id).unwrap()
}

/// Seeding blocks, so the client is built off the runtime threads.
async fn client_for(node: &FakeNode) -> Client {
    let mut config = node.config();
    config.event_loops = 2;
    let client = tokio::task::spawn_blocking(move || Client::new(config))
        .await
        .unwrap();
    assert_ok!(client)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_put_get_remove() {
    let node = FakeNode::start("A");
    let client = client_for(&node).await;
    let k = key(1);

    assert_eq!(assert_ok!(client.get_async(None, &k, false).await), None);
    assert_ok!(client.put_async(None, &k, &[Bin::new("name", "bob")], false).await);
    assert!(node.contains(&k));

    let record = assert_ok!(client.get_async(None, &k, false).await).expect("record");
    assert_eq!(record.get("name"), Some(&Value::from("bob")));
    assert!(assert_ok!(client.exists_async(None, &k, false).await));

    assert!(assert_ok!(client.remove_async(None, &k, false).await));
    assert!(!assert_ok!(client.exists_async(None, &k, false).await));

    tokio::task::spawn_blocking(move || client.close()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_operate() {
    let node = FakeNode::start("A");
    let client = client_for(&node).await;
    let k = key(2);

    let ops = [Operation::put(&Bin::new("n", 1)), Operation::add(&Bin::new("n", 4)), Operation::get("n")];
    let record = assert_ok!(client.operate_async(None, &k, &ops, false).await).expect("record");
    assert_eq!(record.get("n"), Some(&Value::Int(5)));

    tokio::task::spawn_blocking(move || client.close()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pipelined_commands_share_connections() {
    let node = FakeNode::start("A");
    let client = client_for(&node).await;
    let keys: Vec<Key> = (0..8).map(key).collect();

    for (i, k) in keys.iter().enumerate() {
        assert_ok!(client.put_async(None, k, &[Bin::new("i", i as i64)], true).await);
    }

    let (a, b, c, d) = tokio::join!(
        client.get_async(None, &keys[0], true),
        client.get_async(None, &keys[3], true),
        client.get_async(None, &keys[5], true),
        client.get_async(None, &keys[7], true),
    );
    for (record, expected) in [(a, 0), (b, 3), (c, 5), (d, 7)] {
        let record = assert_ok!(record).expect("record");
        assert_eq!(record.get("i"), Some(&Value::Int(expected)));
    }

    // Seed and tend connections plus pipes reused across the twelve commands.
    assert!(node.connections() <= 2 + 4);

    tokio::task::spawn_blocking(move || client.close()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_async_batch_across_nodes() {
    let a = FakeNode::start("A");
    let b = FakeNode::start("B");
    a.set_ownership(|pid| pid < N_PARTITIONS / 2);
    b.set_ownership(|pid| pid >= N_PARTITIONS / 2);
    a.set_services(&b.host());

    let client = client_for(&a).await;
    let keys: Vec<Key> = (0..16).map(key).collect();
    for (i, k) in keys.iter().enumerate().filter(|(i, _)| i % 2 == 0) {
        assert_ok!(client.put_async(None, k, &[Bin::new("i", i as i64)], false).await);
    }

    let records = assert_ok!(client.batch_get_async(None, &keys).await);
    assert_eq!(records.len(), keys.len());
    for (i, record) in records.iter().enumerate() {
        if i % 2 == 0 {
            let record = record.as_ref().expect("record");
            assert_eq!(record.get("i"), Some(&Value::Int(i as i64)));
        } else {
            assert!(record.is_none());
        }
    }
    assert!(a.commands() > 0);
    assert!(b.commands() > 0);

    tokio::task::spawn_blocking(move || client.close()).await.unwrap();
}
