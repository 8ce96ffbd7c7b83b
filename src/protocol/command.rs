//! Request Encoding
//!
//! [`MessageBuilder`] lays a command out in one flat buffer:
//!
//! ```text
//! [proto header][message header][field]*[op]*
//!
//! field = [u32 size = len(data) + 1][u8 type][data]
//! op    = [u32 size = 4 + len(name) + len(value)][u8 op][u8 particle][u8 0][u8 len(name)][name][value]
//! ```
//!
//! The proto header and the field/op counts are patched in by
//! [`MessageBuilder::finish`], which also applies compression.

use crate::error::{Error, Result};
use crate::key::Key;
use crate::policy::{
    BasePolicy, CommitLevel, GenerationPolicy, ReadModeAp, ReadPolicy, RecordExists, WritePolicy,
};
use crate::protocol::compression;
use crate::protocol::header::{
    info1, info2, info3, msg_type, MessageHeader, ProtoHeader, MSG_HEADER_SIZE, PROTO_SIZE,
};
use crate::value::{check_bin_name, Bin, Value};
use bytes::{BufMut, Bytes, BytesMut};

pub mod field_type {
    pub const NAMESPACE: u8 = 0;
    pub const SET: u8 = 1;
    pub const KEY: u8 = 2;
    pub const DIGEST: u8 = 4;
    pub const UDF_PACKAGE_NAME: u8 = 30;
    pub const UDF_FUNCTION: u8 = 31;
    pub const UDF_ARGLIST: u8 = 32;
    pub const UDF_OP: u8 = 33;
    pub const BATCH_INDEX: u8 = 41;
}

/// Bin operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read = 1,
    Write = 2,
    CdtRead = 3,
    CdtModify = 4,
    Incr = 5,
    Append = 9,
    Prepend = 10,
    Touch = 11,
    Delete = 14,
}

impl OpKind {
    pub fn is_write(self) -> bool {
        !matches!(self, OpKind::Read | OpKind::CdtRead)
    }
}

/// One bin operation inside an `operate` command.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OpKind,
    pub bin_name: String,
    pub value: Value,
}

impl Operation {
    pub fn get(bin_name: impl Into<String>) -> Self {
        Self::new(OpKind::Read, bin_name, Value::Nil)
    }

    pub fn put(bin: &Bin) -> Self {
        Self::new(OpKind::Write, bin.name.clone(), bin.value.clone())
    }

    pub fn add(bin: &Bin) -> Self {
        Self::new(OpKind::Incr, bin.name.clone(), bin.value.clone())
    }

    pub fn append(bin: &Bin) -> Self {
        Self::new(OpKind::Append, bin.name.clone(), bin.value.clone())
    }

    pub fn prepend(bin: &Bin) -> Self {
        Self::new(OpKind::Prepend, bin.name.clone(), bin.value.clone())
    }

    pub fn touch() -> Self {
        Self::new(OpKind::Touch, "", Value::Nil)
    }

    pub fn delete() -> Self {
        Self::new(OpKind::Delete, "", Value::Nil)
    }

    /// A collection operation whose payload comes from the serializer.
    pub fn cdt(kind: OpKind, bin_name: impl Into<String>, payload: Value) -> Self {
        Self::new(kind, bin_name, payload)
    }

    fn new(kind: OpKind, bin_name: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            bin_name: bin_name.into(),
            value,
        }
    }
}

pub struct MessageBuilder {
    buf: BytesMut,
    header: MessageHeader,
}

impl MessageBuilder {
    pub fn new(header: MessageHeader) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_bytes(0, PROTO_SIZE + MSG_HEADER_SIZE);
        Self {
            buf,
            header: MessageHeader {
                n_fields: 0,
                n_ops: 0,
                ..header
            },
        }
    }

    pub fn field(&mut self, kind: u8, data: &[u8]) {
        self.field_header(kind, data.len());
        self.buf.put_slice(data);
    }

    fn field_header(&mut self, kind: u8, len: usize) {
        self.buf.put_u32(len as u32 + 1);
        self.buf.put_u8(kind);
        self.header.n_fields += 1;
    }

    /// Namespace, set, digest and optionally the user key.
    pub fn key(&mut self, key: &Key, send_key: bool) {
        self.field(field_type::NAMESPACE, key.namespace.as_bytes());
        if !key.set.is_empty() {
            self.field(field_type::SET, key.set.as_bytes());
        }
        self.field(field_type::DIGEST, &key.digest);

        if send_key {
            if let Some(user_key) = &key.user_key {
                self.field_header(field_type::KEY, user_key.encoded_size() + 1);
                self.buf.put_u8(user_key.particle_type());
                user_key.write_to(&mut self.buf);
            }
        }
    }

    pub fn op(&mut self, op: &Operation) -> Result<()> {
        check_bin_name(&op.bin_name)?;
        let name = op.bin_name.as_bytes();
        self.buf
            .put_u32((4 + name.len() + op.value.encoded_size()) as u32);
        self.buf.put_u8(op.kind as u8);
        self.buf.put_u8(op.value.particle_type());
        self.buf.put_u8(0);
        self.buf.put_u8(name.len() as u8);
        self.buf.put_slice(name);
        op.value.write_to(&mut self.buf);
        self.header.n_ops += 1;
        Ok(())
    }

    /// Writes headers and compresses when the frame exceeds `threshold`.
    pub fn finish(mut self, compression_threshold: usize) -> Result<Bytes> {
        let body_size = self.buf.len() - PROTO_SIZE;
        let mut head = BytesMut::with_capacity(PROTO_SIZE + MSG_HEADER_SIZE);
        head.put_slice(&ProtoHeader::new(msg_type::MESSAGE, body_size).encode());
        self.header.write_to(&mut head);
        self.buf[..PROTO_SIZE + MSG_HEADER_SIZE].copy_from_slice(&head);

        if compression_threshold > 0 && self.buf.len() > compression_threshold {
            return compression::compress(&self.buf);
        }
        Ok(self.buf.freeze())
    }
}

fn read_header(policy: &ReadPolicy, info1_flags: u8) -> MessageHeader {
    let mut info1 = info1_flags;
    if policy.read_mode_ap == ReadModeAp::All {
        info1 |= info1::READ_MODE_AP_ALL;
    }
    MessageHeader {
        info1,
        transaction_ttl: policy.base.server_timeout_ms(),
        ..MessageHeader::default()
    }
}

fn write_header(policy: &WritePolicy, info1: u8, info2_flags: u8) -> MessageHeader {
    let mut info2 = info2_flags;
    let mut info3 = 0u8;
    let mut generation = 0;

    match policy.generation_policy {
        GenerationPolicy::None => {}
        GenerationPolicy::ExpectEqual => {
            info2 |= info2::GENERATION;
            generation = policy.generation;
        }
        GenerationPolicy::ExpectGreater => {
            info2 |= info2::GENERATION_GT;
            generation = policy.generation;
        }
    }

    match policy.record_exists {
        RecordExists::Update => {}
        RecordExists::UpdateOnly => info3 |= info3::UPDATE_ONLY,
        RecordExists::Replace => info3 |= info3::CREATE_OR_REPLACE,
        RecordExists::ReplaceOnly => info3 |= info3::REPLACE_ONLY,
        RecordExists::CreateOnly => info2 |= info2::CREATE_ONLY,
    }

    if policy.commit_level == CommitLevel::Master {
        info3 |= info3::COMMIT_MASTER;
    }
    if policy.durable_delete {
        info2 |= info2::DURABLE_DELETE;
    }

    MessageHeader {
        info1,
        info2,
        info3,
        generation,
        expiration: policy.expiration,
        transaction_ttl: policy.base.server_timeout_ms(),
        ..MessageHeader::default()
    }
}

/// Reads the whole record, or only `bins` when given.
pub fn encode_read(policy: &ReadPolicy, key: &Key, bins: Option<&[&str]>) -> Result<Bytes> {
    let flags = match bins {
        Some(b) if !b.is_empty() => info1::READ,
        _ => info1::READ | info1::GET_ALL,
    };
    let mut builder = MessageBuilder::new(read_header(policy, flags));
    builder.key(key, false);
    for name in bins.unwrap_or_default() {
        builder.op(&Operation::get(*name))?;
    }
    builder.finish(policy.base.compression_threshold)
}

/// Reads only the record metadata.
pub fn encode_exists(policy: &ReadPolicy, key: &Key) -> Result<Bytes> {
    let mut builder = MessageBuilder::new(read_header(
        policy,
        info1::READ | info1::GET_NOBINDATA,
    ));
    builder.key(key, false);
    builder.finish(policy.base.compression_threshold)
}

/// Applies the same operation kind to every bin (put, add, append, prepend).
pub fn encode_write(policy: &WritePolicy, key: &Key, kind: OpKind, bins: &[Bin]) -> Result<Bytes> {
    if bins.is_empty() {
        return Err(Error::InvalidArgument("no bins to write".into()));
    }
    let mut builder = MessageBuilder::new(write_header(policy, 0, info2::WRITE));
    builder.key(key, policy.send_key);
    for bin in bins {
        builder.op(&Operation::new(kind, bin.name.clone(), bin.value.clone()))?;
    }
    builder.finish(policy.base.compression_threshold)
}

pub fn encode_delete(policy: &WritePolicy, key: &Key) -> Result<Bytes> {
    let mut builder = MessageBuilder::new(write_header(
        policy,
        0,
        info2::WRITE | info2::DELETE,
    ));
    builder.key(key, false);
    builder.finish(policy.base.compression_threshold)
}

pub fn encode_touch(policy: &WritePolicy, key: &Key) -> Result<Bytes> {
    let mut builder = MessageBuilder::new(write_header(policy, 0, info2::WRITE));
    builder.key(key, policy.send_key);
    builder.op(&Operation::touch())?;
    builder.finish(policy.base.compression_threshold)
}

/// Mixed reads and writes on one record, applied atomically by the server.
pub fn encode_operate(policy: &WritePolicy, key: &Key, ops: &[Operation]) -> Result<Bytes> {
    if ops.is_empty() {
        return Err(Error::InvalidArgument("no operations".into()));
    }

    let mut info1 = 0u8;
    let mut info2 = 0u8;
    let mut reads_all = false;
    let mut writes = false;

    for op in ops {
        if op.kind.is_write() {
            writes = true;
        } else {
            info1 |= info1::READ;
            if op.kind == OpKind::Read && op.bin_name.is_empty() {
                reads_all = true;
            }
        }
    }
    if reads_all {
        info1 |= info1::GET_ALL;
    }
    if writes {
        info2 |= info2::WRITE | info2::RESPOND_ALL_OPS;
    }

    let mut builder = MessageBuilder::new(write_header(policy, info1, info2));
    builder.key(key, writes && policy.send_key);
    for op in ops {
        if op.kind == OpKind::Read && op.bin_name.is_empty() {
            continue;
        }
        builder.op(op)?;
    }
    builder.finish(policy.base.compression_threshold)
}

/// Invokes a server side function. `args` is the packed argument list.
pub fn encode_apply(
    policy: &WritePolicy,
    key: &Key,
    package: &str,
    function: &str,
    args: &Value,
) -> Result<Bytes> {
    let mut builder = MessageBuilder::new(write_header(policy, 0, info2::WRITE));
    builder.key(key, policy.send_key);
    builder.field(field_type::UDF_PACKAGE_NAME, package.as_bytes());
    builder.field(field_type::UDF_FUNCTION, function.as_bytes());

    let mut arglist = BytesMut::with_capacity(args.encoded_size());
    args.write_to(&mut arglist);
    builder.field(field_type::UDF_ARGLIST, &arglist);
    builder.finish(policy.base.compression_threshold)
}

/// One batch-index request for the keys routed to a single node.
///
/// `offsets` are positions in the caller's key slice. Responses carry that
/// position back in `transaction_ttl`.
pub fn encode_batch_read(
    policy: &BasePolicy,
    read_mode_ap: ReadModeAp,
    keys: &[Key],
    offsets: &[usize],
    bins: Option<&[&str]>,
    metadata_only: bool,
) -> Result<Bytes> {
    for name in bins.unwrap_or_default() {
        check_bin_name(name)?;
    }

    let mut read_flags = if metadata_only {
        info1::READ | info1::GET_NOBINDATA
    } else {
        match bins {
            Some(b) if !b.is_empty() => info1::READ,
            _ => info1::READ | info1::GET_ALL,
        }
    };
    if read_mode_ap == ReadModeAp::All {
        read_flags |= info1::READ_MODE_AP_ALL;
    }

    let mut entries = BytesMut::with_capacity(5 + offsets.len() * 32);
    entries.put_u32(offsets.len() as u32);
    entries.put_u8(1);

    let mut prev: Option<&Key> = None;
    for &offset in offsets {
        let key = &keys[offset];
        entries.put_u32(offset as u32);
        entries.put_slice(&key.digest);

        if prev.is_some_and(|p| p.namespace == key.namespace) {
            entries.put_u8(1);
            continue;
        }

        let names = bins.unwrap_or_default();
        entries.put_u8(0);
        entries.put_u8(read_flags);
        entries.put_u16(1);
        entries.put_u16(if metadata_only { 0 } else { names.len() as u16 });

        entries.put_u32(key.namespace.len() as u32 + 1);
        entries.put_u8(field_type::NAMESPACE);
        entries.put_slice(key.namespace.as_bytes());

        if !metadata_only {
            for name in names {
                entries.put_u32(4 + name.len() as u32);
                entries.put_u8(OpKind::Read as u8);
                entries.put_u8(0);
                entries.put_u8(0);
                entries.put_u8(name.len() as u8);
                entries.put_slice(name.as_bytes());
            }
        }
        prev = Some(key);
    }

    let header = MessageHeader {
        info1: read_flags | info1::BATCH,
        transaction_ttl: policy.server_timeout_ms(),
        ..MessageHeader::default()
    };
    let mut builder = MessageBuilder::new(header);
    builder.field(field_type::BATCH_INDEX, &entries);
    builder.finish(policy.compression_threshold)
}
