//! In-process fake cluster node for integration tests.
//!
//! Each node listens on an ephemeral port and serves every connection on
//! its own thread: info requests from the tend thread, single record
//! commands and batch-index reads against an in-memory store.

#![allow(dead_code)]

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use fleetkv::key::N_PARTITIONS;
use fleetkv::protocol::command::field_type;
use fleetkv::protocol::header::{info1, info2, info3};
use fleetkv::protocol::{msg_type, MessageHeader, ProtoHeader, MSG_HEADER_SIZE, PROTO_SIZE};
use fleetkv::value::particle;
use fleetkv::{ClientConfig, Host, Key};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Bins = Vec<(String, u8, Vec<u8>)>;

#[derive(Debug, Clone, Default)]
struct StoredRecord {
    generation: u32,
    bins: Bins,
}

impl StoredRecord {
    fn set(&mut self, name: String, particle: u8, value: Vec<u8>) {
        match self.bins.iter_mut().find(|(n, _, _)| *n == name) {
            Some(bin) => {
                bin.1 = particle;
                bin.2 = value;
            }
            None => self.bins.push((name, particle, value)),
        }
    }

    fn get(&self, name: &str) -> Option<&(String, u8, Vec<u8>)> {
        self.bins.iter().find(|(n, _, _)| n == name)
    }
}

struct Shared {
    name: Mutex<String>,
    features: String,
    services: Mutex<String>,
    partition_generation: AtomicUsize,
    peers_generation: AtomicUsize,
    replicas: Mutex<String>,
    store: Mutex<HashMap<[u8; 20], StoredRecord>>,
    commands: AtomicUsize,
    connections: AtomicUsize,
    partition_requests: AtomicUsize,
    peers_requests: AtomicUsize,
}

/// A fake node owning every partition of namespace `test` until told
/// otherwise.
pub struct FakeNode {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
}

impl FakeNode {
    pub fn start(name: &str) -> FakeNode {
        Self::start_with_features(name, "pipelining")
    }

    pub fn start_with_features(name: &str, features: &str) -> FakeNode {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            name: Mutex::new(name.to_string()),
            features: features.to_string(),
            services: Mutex::new(String::new()),
            partition_generation: AtomicUsize::new(1),
            peers_generation: AtomicUsize::new(3),
            replicas: Mutex::new(replicas_value(|_| true)),
            store: Mutex::new(HashMap::new()),
            commands: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            partition_requests: AtomicUsize::new(0),
            peers_requests: AtomicUsize::new(0),
        });

        let accept_shared = Arc::clone(&shared);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                accept_shared.connections.fetch_add(1, Ordering::Relaxed);
                let shared = Arc::clone(&accept_shared);
                std::thread::spawn(move || serve(shared, stream));
            }
        });

        FakeNode { addr, shared }
    }

    /// Client settings pointing at this node with a fast tend interval.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::with_hosts(vec![Host::new("127.0.0.1", self.addr.port())]);
        config.tend_interval = Duration::from_millis(50);
        config
    }

    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Masters only the partitions `owns` accepts and bumps the generation.
    pub fn set_ownership(&self, owns: impl Fn(usize) -> bool) {
        *self.shared.replicas.lock() = replicas_value(owns);
        self.shared.partition_generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Announces a new partition generation without changing ownership.
    pub fn set_partition_generation(&self, generation: usize) {
        self.shared.partition_generation.store(generation, Ordering::Relaxed);
    }

    /// Number of `replicas-all` requests served.
    pub fn partition_requests(&self) -> usize {
        self.shared.partition_requests.load(Ordering::Relaxed)
    }

    /// Number of `peers-clear-std` requests served.
    pub fn peers_requests(&self) -> usize {
        self.shared.peers_requests.load(Ordering::Relaxed)
    }

    pub fn set_services(&self, services: &str) {
        *self.shared.services.lock() = services.to_string();
    }

    pub fn rename(&self, name: &str) {
        *self.shared.name.lock() = name.to_string();
    }

    /// Number of record commands (single or batch) served.
    pub fn commands(&self) -> usize {
        self.shared.commands.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.shared.store.lock().contains_key(&key.digest)
    }
}

/// Polls `check` until it holds or five seconds passed.
pub fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

fn replicas_value(owns: impl Fn(usize) -> bool) -> String {
    let mut bitmap = vec![0u8; N_PARTITIONS / 8];
    for pid in (0..N_PARTITIONS).filter(|&pid| owns(pid)) {
        bitmap[pid >> 3] |= 0x80 >> (pid & 7);
    }
    format!("test:1,{}", STANDARD.encode(bitmap))
}

fn serve(shared: Arc<Shared>, mut stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    loop {
        let mut head = [0u8; PROTO_SIZE];
        if stream.read_exact(&mut head).is_err() {
            return;
        }
        let Ok(proto) = ProtoHeader::decode(&head) else {
            return;
        };
        let mut body = vec![0u8; proto.size];
        if stream.read_exact(&mut body).is_err() {
            return;
        }

        let response = match proto.kind {
            msg_type::INFO => frame(msg_type::INFO, info_response(&shared, &body)),
            msg_type::MESSAGE => {
                shared.commands.fetch_add(1, Ordering::Relaxed);
                frame(msg_type::MESSAGE, message_response(&shared, &body))
            }
            _ => return,
        };
        if stream.write_all(&response).is_err() {
            return;
        }
    }
}

fn frame(kind: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = ProtoHeader::new(kind, body.len()).encode().to_vec();
    out.extend(body);
    out
}

fn info_response(shared: &Shared, body: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(body);
    let mut out = String::new();
    for name in text.split('\n').filter(|n| !n.is_empty()) {
        let value = match name {
            "node" => shared.name.lock().clone(),
            "features" => shared.features.clone(),
            "partition-generation" => shared.partition_generation.load(Ordering::Relaxed).to_string(),
            "peers-generation" => shared.peers_generation.load(Ordering::Relaxed).to_string(),
            "peers-clear-std" => {
                shared.peers_requests.fetch_add(1, Ordering::Relaxed);
                format!("{},,[]", shared.peers_generation.load(Ordering::Relaxed))
            }
            "services" | "services-alternate" => shared.services.lock().clone(),
            "replicas-all" => {
                shared.partition_requests.fetch_add(1, Ordering::Relaxed);
                shared.replicas.lock().clone()
            }
            "build" => "1.0.0".to_string(),
            _ => String::new(),
        };
        out.push_str(name);
        out.push('\t');
        out.push_str(&value);
        out.push('\n');
    }
    out.into_bytes()
}

struct Request {
    header: MessageHeader,
    digest: [u8; 20],
    batch: Option<Vec<u8>>,
    ops: Vec<(u8, u8, String, Vec<u8>)>,
}

fn be32(buf: &[u8], at: usize) -> usize {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize
}

fn parse_request(body: &[u8]) -> Request {
    let header = MessageHeader::decode(body).unwrap();
    let mut pos = MSG_HEADER_SIZE;
    let mut digest = [0u8; 20];
    let mut batch = None;

    for _ in 0..header.n_fields {
        let size = be32(body, pos);
        let kind = body[pos + 4];
        let data = &body[pos + 5..pos + 4 + size];
        match kind {
            field_type::DIGEST => digest.copy_from_slice(data),
            field_type::BATCH_INDEX => batch = Some(data.to_vec()),
            _ => {}
        }
        pos += 4 + size;
    }

    let mut ops = Vec::new();
    for _ in 0..header.n_ops {
        let size = be32(body, pos);
        let op = body[pos + 4];
        let particle = body[pos + 5];
        let name_len = body[pos + 7] as usize;
        let name = String::from_utf8_lossy(&body[pos + 8..pos + 8 + name_len]).to_string();
        let value = body[pos + 8 + name_len..pos + 4 + size].to_vec();
        ops.push((op, particle, name, value));
        pos += 4 + size;
    }

    Request {
        header,
        digest,
        batch,
        ops,
    }
}

fn record_message(code: u8, generation: u32, index: u32, info3: u8, bins: &[&(String, u8, Vec<u8>)]) -> Vec<u8> {
    let mut buf = bytes::BytesMut::new();
    MessageHeader {
        info3,
        result_code: code,
        generation,
        transaction_ttl: index,
        n_ops: bins.len() as u16,
        ..MessageHeader::default()
    }
    .write_to(&mut buf);
    let mut out = buf.to_vec();
    for (name, particle, value) in bins {
        out.extend(((4 + name.len() + value.len()) as u32).to_be_bytes());
        out.push(1);
        out.push(*particle);
        out.push(0);
        out.push(name.len() as u8);
        out.extend(name.as_bytes());
        out.extend(value);
    }
    out
}

const OK: u8 = 0;
const NOT_FOUND: u8 = 2;

fn message_response(shared: &Shared, body: &[u8]) -> Vec<u8> {
    let req = parse_request(body);
    let h = req.header;

    if let Some(entries) = &req.batch {
        return batch_response(shared, h.info1, entries);
    }

    let mut store = shared.store.lock();

    if h.info2 & info2::WRITE != 0 {
        if h.info2 & info2::DELETE != 0 {
            let code = if store.remove(&req.digest).is_some() { OK } else { NOT_FOUND };
            return record_message(code, 0, 0, 0, &[]);
        }

        let exists = store.contains_key(&req.digest);
        if !exists && req.ops.iter().any(|(op, ..)| *op == 11) {
            return record_message(NOT_FOUND, 0, 0, 0, &[]);
        }
        let record = store.entry(req.digest).or_default();
        for (op, particle, name, value) in &req.ops {
            match op {
                2 => record.set(name.clone(), *particle, value.clone()),
                5 => {
                    let current = record
                        .get(name)
                        .map(|(_, _, v)| i64::from_be_bytes(v[..8].try_into().unwrap()))
                        .unwrap_or(0);
                    let add = i64::from_be_bytes(value[..8].try_into().unwrap());
                    record.set(name.clone(), particle::INTEGER, (current + add).to_be_bytes().to_vec());
                }
                9 | 10 => {
                    let current = record.get(name).map(|(_, _, v)| v.clone()).unwrap_or_default();
                    let joined = if *op == 9 {
                        [current, value.clone()].concat()
                    } else {
                        [value.clone(), current].concat()
                    };
                    record.set(name.clone(), particle::STRING, joined);
                }
                _ => {}
            }
        }
        record.generation += 1;

        let reads: Vec<&(String, u8, Vec<u8>)> = req
            .ops
            .iter()
            .filter(|(op, ..)| *op == 1)
            .filter_map(|(_, _, name, _)| record.get(name))
            .collect();
        return record_message(OK, record.generation, 0, 0, &reads);
    }

    let Some(record) = store.get(&req.digest) else {
        return record_message(NOT_FOUND, 0, 0, 0, &[]);
    };
    let bins = selected_bins(record, h.info1, req.ops.iter().map(|(_, _, name, _)| name.as_str()));
    record_message(OK, record.generation, 0, 0, &bins)
}

fn selected_bins<'a, 'n>(
    record: &'a StoredRecord,
    info1_flags: u8,
    names: impl Iterator<Item = &'n str>,
) -> Vec<&'a (String, u8, Vec<u8>)> {
    if info1_flags & info1::GET_NOBINDATA != 0 {
        Vec::new()
    } else if info1_flags & info1::GET_ALL != 0 {
        record.bins.iter().collect()
    } else {
        names.filter_map(|n| record.get(n)).collect()
    }
}

fn batch_response(shared: &Shared, info1_flags: u8, entries: &[u8]) -> Vec<u8> {
    let store = shared.store.lock();
    let count = be32(entries, 0);
    let mut pos = 5;
    let mut flags = info1_flags;
    let mut names: Vec<String> = Vec::new();
    let mut out = Vec::new();

    for _ in 0..count {
        let index = be32(entries, pos) as u32;
        let mut digest = [0u8; 20];
        digest.copy_from_slice(&entries[pos + 4..pos + 24]);
        let repeat = entries[pos + 24];
        pos += 25;

        if repeat == 0 {
            flags = entries[pos];
            let n_fields = u16::from_be_bytes([entries[pos + 1], entries[pos + 2]]);
            let n_ops = u16::from_be_bytes([entries[pos + 3], entries[pos + 4]]);
            pos += 5;
            for _ in 0..n_fields {
                pos += 4 + be32(entries, pos);
            }
            names.clear();
            for _ in 0..n_ops {
                let size = be32(entries, pos);
                let name_len = entries[pos + 7] as usize;
                names.push(String::from_utf8_lossy(&entries[pos + 8..pos + 8 + name_len]).to_string());
                pos += 4 + size;
            }
        }

        match store.get(&digest) {
            Some(record) => {
                let bins = selected_bins(record, flags, names.iter().map(String::as_str));
                out.extend(record_message(OK, record.generation, index, 0, &bins));
            }
            None => out.extend(record_message(NOT_FOUND, 0, index, 0, &[])),
        }
    }

    out.extend(record_message(OK, 0, 0, info3::LAST, &[]));
    out
}
