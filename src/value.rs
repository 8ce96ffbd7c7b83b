//! Record Values
//!
//! Scalars (integer, float, string, blob) are encoded by the codec itself.
//! Everything else (lists, maps, geojson, ...) belongs to an external
//! serializer: the client only carries those bytes around as
//! [`Value::Packed`] together with their particle type, and never looks
//! inside.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;

/// Particle type tags used on the wire.
pub mod particle {
    pub const NULL: u8 = 0;
    pub const INTEGER: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const STRING: u8 = 3;
    pub const BLOB: u8 = 4;
    pub const BOOL: u8 = 17;
    pub const HLL: u8 = 18;
    pub const MAP: u8 = 19;
    pub const LIST: u8 = 20;
    pub const GEOJSON: u8 = 23;
}

/// Longest bin name accepted by the server.
pub const MAX_BIN_NAME: usize = 15;

/// A bin or key value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    /// Opaque bytes produced by an external serializer.
    Packed { particle: u8, bytes: Bytes },
}

impl Value {
    pub fn particle_type(&self) -> u8 {
        match self {
            Value::Nil => particle::NULL,
            Value::Int(_) => particle::INTEGER,
            Value::Float(_) => particle::FLOAT,
            Value::String(_) => particle::STRING,
            Value::Blob(_) => particle::BLOB,
            Value::Packed { particle, .. } => *particle,
        }
    }

    /// Number of bytes [`Value::write_to`] will emit.
    pub fn encoded_size(&self) -> usize {
        match self {
            Value::Nil => 0,
            Value::Int(_) | Value::Float(_) => 8,
            Value::String(s) => s.len(),
            Value::Blob(b) => b.len(),
            Value::Packed { bytes, .. } => bytes.len(),
        }
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Value::Nil => {}
            Value::Int(v) => buf.put_i64(*v),
            Value::Float(v) => buf.put_f64(*v),
            Value::String(s) => buf.put_slice(s.as_bytes()),
            Value::Blob(b) => buf.put_slice(b),
            Value::Packed { bytes, .. } => buf.put_slice(bytes),
        }
    }

    /// Decodes a particle read off the wire.
    pub fn from_particle(particle_type: u8, data: &[u8]) -> Result<Value> {
        match particle_type {
            particle::NULL => Ok(Value::Nil),
            particle::INTEGER => {
                let raw: [u8; 8] = data.try_into().map_err(|_| {
                    Error::Protocol(format!("integer particle of {} bytes", data.len()))
                })?;
                Ok(Value::Int(i64::from_be_bytes(raw)))
            }
            particle::FLOAT => {
                let raw: [u8; 8] = data.try_into().map_err(|_| {
                    Error::Protocol(format!("float particle of {} bytes", data.len()))
                })?;
                Ok(Value::Float(f64::from_be_bytes(raw)))
            }
            particle::STRING => String::from_utf8(data.to_vec())
                .map(Value::String)
                .map_err(|e| Error::Protocol(format!("string particle: {}", e))),
            particle::BLOB => Ok(Value::Blob(data.to_vec())),
            other => Ok(Value::Packed {
                particle: other,
                bytes: Bytes::copy_from_slice(data),
            }),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "<blob {} bytes>", b.len()),
            Value::Packed { particle, bytes } => {
                write!(f, "<particle {} {} bytes>", particle, bytes.len())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

/// A named value inside a record.
#[derive(Debug, Clone, PartialEq)]
pub struct Bin {
    pub name: String,
    pub value: Value,
}

impl Bin {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

pub(crate) fn check_bin_name(name: &str) -> Result<()> {
    if name.len() > MAX_BIN_NAME {
        return Err(Error::InvalidArgument(format!(
            "bin name too long: {} (max {})",
            name, MAX_BIN_NAME
        )));
    }
    Ok(())
}

/// A record as returned by reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub bins: HashMap<String, Value>,
    pub generation: u32,
    /// Server void time in seconds, 0 when the record never expires.
    pub expiration: u32,
}

impl Record {
    pub fn get(&self, bin: &str) -> Option<&Value> {
        self.bins.get(bin)
    }
}
