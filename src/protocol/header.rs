//! Frame Headers
//!
//! Every frame starts with an 8 byte big-endian proto header:
//!
//! ```text
//! ┌─────────┬──────┬──────────────────────────────┐
//! │ version │ type │ body size (48 bits)          │
//! │   u8    │  u8  │                              │
//! └─────────┴──────┴──────────────────────────────┘
//! ```
//!
//! Command frames (`type == MESSAGE`) continue with a 22 byte message header
//! followed by fields and operations.

use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};

pub const PROTO_VERSION: u8 = 2;
pub const PROTO_SIZE: usize = 8;
pub const MSG_HEADER_SIZE: usize = 22;

/// Largest frame body the client accepts.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;
/// Largest info response body the client accepts.
pub const MAX_INFO_SIZE: usize = 512 * 1024;

pub mod msg_type {
    pub const INFO: u8 = 1;
    pub const ADMIN: u8 = 2;
    pub const MESSAGE: u8 = 3;
    pub const COMPRESSED: u8 = 4;
}

pub mod info1 {
    pub const READ: u8 = 1;
    pub const GET_ALL: u8 = 1 << 1;
    pub const BATCH: u8 = 1 << 3;
    pub const GET_NOBINDATA: u8 = 1 << 5;
    pub const READ_MODE_AP_ALL: u8 = 1 << 6;
}

pub mod info2 {
    pub const WRITE: u8 = 1;
    pub const DELETE: u8 = 1 << 1;
    pub const GENERATION: u8 = 1 << 2;
    pub const GENERATION_GT: u8 = 1 << 3;
    pub const DURABLE_DELETE: u8 = 1 << 4;
    pub const CREATE_ONLY: u8 = 1 << 5;
    pub const RESPOND_ALL_OPS: u8 = 1 << 7;
}

pub mod info3 {
    pub const LAST: u8 = 1;
    pub const COMMIT_MASTER: u8 = 1 << 1;
    pub const UPDATE_ONLY: u8 = 1 << 3;
    pub const CREATE_OR_REPLACE: u8 = 1 << 4;
    pub const REPLACE_ONLY: u8 = 1 << 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    pub version: u8,
    pub kind: u8,
    pub size: usize,
}

impl ProtoHeader {
    pub fn new(kind: u8, size: usize) -> Self {
        Self {
            version: PROTO_VERSION,
            kind,
            size,
        }
    }

    pub fn encode(&self) -> [u8; PROTO_SIZE] {
        let word = ((self.version as u64) << 56)
            | ((self.kind as u64) << 48)
            | (self.size as u64 & 0xffff_ffff_ffff);
        word.to_be_bytes()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let raw: [u8; PROTO_SIZE] = buf
            .get(..PROTO_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Protocol(format!("short proto header: {} bytes", buf.len())))?;
        let word = u64::from_be_bytes(raw);

        Ok(Self {
            version: (word >> 56) as u8,
            kind: (word >> 48) as u8,
            size: (word & 0xffff_ffff_ffff) as usize,
        })
    }

    /// Rejects corrupt or oversized length fields before any allocation.
    pub fn validate(&self, expected_kind: u8) -> Result<()> {
        if self.version != PROTO_VERSION {
            return Err(Error::Protocol(format!(
                "unexpected proto version {}",
                self.version
            )));
        }

        match (expected_kind, self.kind) {
            (msg_type::INFO, msg_type::INFO) => {
                if self.size == 0 || self.size > MAX_INFO_SIZE {
                    return Err(Error::Protocol(format!(
                        "invalid info response size {}",
                        self.size
                    )));
                }
            }
            (msg_type::MESSAGE, msg_type::MESSAGE | msg_type::COMPRESSED)
            | (msg_type::ADMIN, msg_type::ADMIN) => {
                if self.size > MAX_MESSAGE_SIZE {
                    return Err(Error::Protocol(format!(
                        "invalid message size {}",
                        self.size
                    )));
                }
            }
            (expected, actual) => {
                return Err(Error::Protocol(format!(
                    "expected frame type {}, received {}",
                    expected, actual
                )))
            }
        }
        Ok(())
    }
}

/// The fixed header of a command or response message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub info1: u8,
    pub info2: u8,
    pub info3: u8,
    pub result_code: u8,
    pub generation: u32,
    pub expiration: u32,
    /// Server side timeout on requests, batch index on batch responses.
    pub transaction_ttl: u32,
    pub n_fields: u16,
    pub n_ops: u16,
}

impl MessageHeader {
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(MSG_HEADER_SIZE as u8);
        buf.put_u8(self.info1);
        buf.put_u8(self.info2);
        buf.put_u8(self.info3);
        buf.put_u8(0);
        buf.put_u8(self.result_code);
        buf.put_u32(self.generation);
        buf.put_u32(self.expiration);
        buf.put_u32(self.transaction_ttl);
        buf.put_u16(self.n_fields);
        buf.put_u16(self.n_ops);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < MSG_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "short message header: {} bytes",
                buf.len()
            )));
        }
        if buf[0] as usize != MSG_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "unexpected message header size {}",
                buf[0]
            )));
        }

        let be32 = |at: usize| u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let be16 = |at: usize| u16::from_be_bytes([buf[at], buf[at + 1]]);

        Ok(Self {
            info1: buf[1],
            info2: buf[2],
            info3: buf[3],
            result_code: buf[5],
            generation: be32(6),
            expiration: be32(10),
            transaction_ttl: be32(14),
            n_fields: be16(18),
            n_ops: be16(20),
        })
    }

    pub fn is_last(&self) -> bool {
        self.info3 & info3::LAST != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_header_layout() {
        let header = ProtoHeader::new(msg_type::MESSAGE, 0x0102_0304);
        assert_eq!(header.encode(), [2, 3, 0, 0, 1, 2, 3, 4]);
        assert_eq!(ProtoHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_validate_rejects_oversized() {
        let header = ProtoHeader::new(msg_type::MESSAGE, MAX_MESSAGE_SIZE + 1);
        assert!(header.validate(msg_type::MESSAGE).is_err());

        let info = ProtoHeader::new(msg_type::INFO, 0);
        assert!(info.validate(msg_type::INFO).is_err());

        let info = ProtoHeader::new(msg_type::INFO, MAX_INFO_SIZE + 1);
        assert!(info.validate(msg_type::INFO).is_err());
    }

    #[test]
    fn test_validate_accepts_compressed_message() {
        let header = ProtoHeader::new(msg_type::COMPRESSED, 100);
        assert!(header.validate(msg_type::MESSAGE).is_ok());
        assert!(header.validate(msg_type::INFO).is_err());
    }

    #[test]
    fn test_message_header_fields() {
        let header = MessageHeader {
            info1: info1::READ,
            info3: info3::LAST,
            result_code: 2,
            generation: 7,
            expiration: 100,
            transaction_ttl: 3,
            n_fields: 1,
            n_ops: 2,
            ..MessageHeader::default()
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);

        assert_eq!(buf.len(), MSG_HEADER_SIZE);
        assert_eq!(buf[0], 22);
        let decoded = MessageHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_last());
    }
}
