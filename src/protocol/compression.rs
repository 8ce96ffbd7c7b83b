//! Payload Compression
//!
//! A compressed frame wraps a complete original frame (proto header
//! included):
//!
//! ```text
//! [proto header: type=COMPRESSED][u64 original size][zlib(original frame)]
//! ```

use crate::error::{Error, Result};
use crate::protocol::header::{msg_type, ProtoHeader, PROTO_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compresses a full frame. Any failure aborts the send.
pub fn compress(frame: &[u8]) -> Result<Bytes> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(frame.len() / 2), Compression::default());
    encoder
        .write_all(frame)
        .map_err(|e| Error::Compression(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| Error::Compression(e.to_string()))?;

    let body_size = 8 + compressed.len();
    let mut buf = BytesMut::with_capacity(PROTO_SIZE + body_size);
    buf.put_slice(&ProtoHeader::new(msg_type::COMPRESSED, body_size).encode());
    buf.put_u64(frame.len() as u64);
    buf.put_slice(&compressed);
    Ok(buf.freeze())
}

/// Inflates the body of a compressed frame and returns the inner frame body
/// (the bytes after the inner proto header) with the inner header.
pub fn decompress(body: &[u8]) -> Result<(ProtoHeader, Vec<u8>)> {
    if body.len() < 8 {
        return Err(Error::Protocol("compressed body too short".into()));
    }
    let mut size_raw = [0u8; 8];
    size_raw.copy_from_slice(&body[..8]);
    let original_size = u64::from_be_bytes(size_raw) as usize;

    if original_size < PROTO_SIZE || original_size > crate::protocol::header::MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!(
            "invalid uncompressed size {}",
            original_size
        )));
    }

    // One byte past the declared size is enough to detect an oversized stream.
    let mut frame = Vec::with_capacity(original_size);
    ZlibDecoder::new(&body[8..])
        .take(original_size as u64 + 1)
        .read_to_end(&mut frame)
        .map_err(|e| Error::Protocol(format!("inflate failed: {}", e)))?;

    if frame.len() != original_size {
        return Err(Error::Protocol(format!(
            "uncompressed size {} does not match header {}",
            frame.len(),
            original_size
        )));
    }

    let header = ProtoHeader::decode(&frame)?;
    header.validate(msg_type::MESSAGE)?;
    if header.kind == msg_type::COMPRESSED || header.size != frame.len() - PROTO_SIZE {
        return Err(Error::Protocol("invalid inner frame".into()));
    }
    frame.drain(..PROTO_SIZE);
    Ok((header, frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_frame_restores_original() {
        let body = vec![7u8; 4000];
        let mut frame = ProtoHeader::new(msg_type::MESSAGE, body.len()).encode().to_vec();
        frame.extend_from_slice(&body);

        let packed = compress(&frame).unwrap();
        assert!(packed.len() < frame.len());

        let header = ProtoHeader::decode(&packed).unwrap();
        assert_eq!(header.kind, msg_type::COMPRESSED);
        assert_eq!(header.size, packed.len() - PROTO_SIZE);

        let (inner, restored) = decompress(&packed[PROTO_SIZE..]).unwrap();
        assert_eq!(inner.kind, msg_type::MESSAGE);
        assert_eq!(restored, body);
    }

    #[test]
    fn test_stream_longer_than_declared_size_is_rejected() {
        let body = vec![0u8; 1 << 20];
        let mut frame = ProtoHeader::new(msg_type::MESSAGE, body.len()).encode().to_vec();
        frame.extend_from_slice(&body);
        let packed = compress(&frame).unwrap();

        // Claim the inflated frame is 30 bytes.
        let mut tampered = packed[PROTO_SIZE..].to_vec();
        tampered[..8].copy_from_slice(&30u64.to_be_bytes());

        let err = decompress(&tampered).unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol error: uncompressed size 31 does not match header 30"
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut body = 100u64.to_be_bytes().to_vec();
        body.extend_from_slice(b"not zlib at all");
        assert!(decompress(&body).is_err());
    }
}
