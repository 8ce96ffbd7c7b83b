//! Response Decoding
//!
//! Both the blocking path and the async state machine read whole frames and
//! hand each frame body to a [`ResponseParser`]. A parser returns `true`
//! once it has seen the final frame; multi-record responses (batch) return
//! `false` until a message with the `LAST` flag arrives.

use crate::error::{Error, Result, ResultCode};
use crate::protocol::compression;
use crate::protocol::header::{msg_type, MessageHeader, MSG_HEADER_SIZE};
use crate::value::{Record, Value};
use std::collections::HashMap;

pub trait ResponseParser {
    /// Consumes one frame body. Returns `Ok(true)` when the response is complete.
    fn parse(&mut self, kind: u8, body: &[u8]) -> Result<bool>;
}

/// Reads the message header plus bins of one message starting at `body[0]`.
/// Returns the header, the record and the number of bytes consumed.
pub fn parse_message(body: &[u8], with_bins: bool) -> Result<(MessageHeader, Record, usize)> {
    let header = MessageHeader::decode(body)?;
    let mut pos = MSG_HEADER_SIZE;

    for _ in 0..header.n_fields {
        let size = read_u32(body, pos)? as usize;
        pos = pos
            .checked_add(4 + size)
            .filter(|&p| p <= body.len())
            .ok_or_else(|| Error::Protocol("field overruns message".into()))?;
    }

    let mut record = Record {
        bins: HashMap::with_capacity(header.n_ops as usize),
        generation: header.generation,
        expiration: header.expiration,
    };

    for _ in 0..header.n_ops {
        let op_size = read_u32(body, pos)? as usize;
        if op_size < 4 || pos + 4 + op_size > body.len() {
            return Err(Error::Protocol(format!("invalid op size {}", op_size)));
        }
        let particle_type = body[pos + 5];
        let name_len = body[pos + 7] as usize;
        if name_len + 4 > op_size {
            return Err(Error::Protocol(format!("invalid bin name length {}", name_len)));
        }
        let name_start = pos + 8;
        let value_start = name_start + name_len;
        let end = pos + 4 + op_size;

        if with_bins {
            let name = std::str::from_utf8(&body[name_start..value_start])
                .map_err(|e| Error::Protocol(format!("bin name: {}", e)))?
                .to_string();
            let value = Value::from_particle(particle_type, &body[value_start..end])?;
            record.bins.insert(name, value);
        }
        pos = end;
    }

    Ok((header, record, pos))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32> {
    buf.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::Protocol("truncated message".into()))
}

/// Unwraps a compressed frame body when needed.
fn frame_body<'a>(kind: u8, body: &'a [u8], scratch: &'a mut Vec<u8>) -> Result<&'a [u8]> {
    match kind {
        msg_type::MESSAGE => Ok(body),
        msg_type::COMPRESSED => {
            let (_, inner) = compression::decompress(body)?;
            *scratch = inner;
            Ok(scratch.as_slice())
        }
        other => Err(Error::Protocol(format!("unexpected frame type {}", other))),
    }
}

/// Parser for single record commands.
///
/// Result codes other than OK and `accept` become [`Error::Server`], so the
/// dispatcher can retry transient ones.
#[derive(Debug, Clone)]
pub struct RecordParser {
    accept: &'static [ResultCode],
    with_bins: bool,
    pub code: ResultCode,
    pub record: Option<Record>,
}

impl RecordParser {
    pub fn new(accept: &'static [ResultCode], with_bins: bool) -> Self {
        Self {
            accept,
            with_bins,
            code: ResultCode::OK,
            record: None,
        }
    }
}

impl ResponseParser for RecordParser {
    fn parse(&mut self, kind: u8, body: &[u8]) -> Result<bool> {
        let mut scratch = Vec::new();
        let body = frame_body(kind, body, &mut scratch)?;
        let (header, record, _) = parse_message(body, self.with_bins)?;
        let code = ResultCode(header.result_code as i32);

        if code != ResultCode::OK && !self.accept.contains(&code) {
            return Err(Error::server(code));
        }
        self.code = code;
        if code == ResultCode::OK {
            self.record = Some(record);
        }
        Ok(true)
    }
}

/// Parser for batch-index responses.
#[derive(Debug, Clone)]
pub struct BatchParser {
    with_bins: bool,
    pub records: Vec<Option<Record>>,
}

impl BatchParser {
    pub fn new(n_keys: usize, with_bins: bool) -> Self {
        Self {
            with_bins,
            records: vec![None; n_keys],
        }
    }
}

impl ResponseParser for BatchParser {
    fn parse(&mut self, kind: u8, body: &[u8]) -> Result<bool> {
        let mut scratch = Vec::new();
        let body = frame_body(kind, body, &mut scratch)?;
        let mut pos = 0;

        while pos < body.len() {
            let (header, record, used) = parse_message(&body[pos..], self.with_bins)?;
            pos += used;
            let code = ResultCode(header.result_code as i32);

            if header.is_last() {
                if code != ResultCode::OK && code != ResultCode::KEY_NOT_FOUND {
                    return Err(Error::server(code));
                }
                return Ok(true);
            }

            let index = header.transaction_ttl as usize;
            let slot = self.records.get_mut(index).ok_or_else(|| {
                Error::Protocol(format!("batch index {} out of range", index))
            })?;
            if code == ResultCode::OK {
                *slot = Some(record);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::header::info3;
    use crate::value::particle;
    use bytes::{BufMut, BytesMut};

    /// A response message with the given integer bins.
    pub(crate) fn message(header: MessageHeader, bins: &[(&str, i64)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        MessageHeader {
            n_ops: bins.len() as u16,
            ..header
        }
        .write_to(&mut buf);
        for (name, value) in bins {
            buf.put_u32(4 + name.len() as u32 + 8);
            buf.put_u8(1);
            buf.put_u8(particle::INTEGER);
            buf.put_u8(0);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
            buf.put_i64(*value);
        }
        buf.to_vec()
    }

    #[test]
    fn test_record_parser_reads_bins() {
        let body = message(
            MessageHeader {
                generation: 3,
                ..MessageHeader::default()
            },
            &[("a", 1), ("b", 2)],
        );
        let mut parser = RecordParser::new(&[ResultCode::KEY_NOT_FOUND], true);
        assert!(parser.parse(msg_type::MESSAGE, &body).unwrap());

        let record = parser.record.unwrap();
        assert_eq!(record.generation, 3);
        assert_eq!(record.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_record_parser_accepts_not_found() {
        let body = message(
            MessageHeader {
                result_code: 2,
                ..MessageHeader::default()
            },
            &[],
        );
        let mut parser = RecordParser::new(&[ResultCode::KEY_NOT_FOUND], true);
        assert!(parser.parse(msg_type::MESSAGE, &body).unwrap());
        assert_eq!(parser.code, ResultCode::KEY_NOT_FOUND);
        assert!(parser.record.is_none());
    }

    #[test]
    fn test_record_parser_surfaces_server_error() {
        let body = message(
            MessageHeader {
                result_code: 14,
                ..MessageHeader::default()
            },
            &[],
        );
        let mut parser = RecordParser::new(&[], true);
        let err = parser.parse(msg_type::MESSAGE, &body).unwrap_err();
        assert_eq!(err.code(), ResultCode::KEY_BUSY);
        assert!(err.is_retriable());
    }

    #[test]
    fn test_truncated_op_is_protocol_error() {
        let mut body = message(MessageHeader::default(), &[("a", 1)]);
        body.truncate(body.len() - 3);
        let mut parser = RecordParser::new(&[], true);
        assert!(matches!(
            parser.parse(msg_type::MESSAGE, &body),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_batch_parser_needs_last_flag() {
        let mut parser = BatchParser::new(3, true);

        let mut frame = message(
            MessageHeader {
                transaction_ttl: 2,
                ..MessageHeader::default()
            },
            &[("v", 20)],
        );
        frame.extend(message(
            MessageHeader {
                result_code: 2,
                transaction_ttl: 0,
                ..MessageHeader::default()
            },
            &[],
        ));
        assert!(!parser.parse(msg_type::MESSAGE, &frame).unwrap());

        let last = message(
            MessageHeader {
                info3: info3::LAST,
                ..MessageHeader::default()
            },
            &[],
        );
        assert!(parser.parse(msg_type::MESSAGE, &last).unwrap());

        assert!(parser.records[0].is_none());
        assert!(parser.records[1].is_none());
        assert_eq!(parser.records[2].as_ref().unwrap().get("v"), Some(&Value::Int(20)));
    }

    #[test]
    fn test_batch_index_out_of_range() {
        let mut parser = BatchParser::new(1, true);
        let frame = message(
            MessageHeader {
                transaction_ttl: 5,
                ..MessageHeader::default()
            },
            &[],
        );
        assert!(parser.parse(msg_type::MESSAGE, &frame).is_err());
    }
}
