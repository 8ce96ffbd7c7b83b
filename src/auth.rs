//! Login and Session Authentication
//!
//! Admin frames carry a 16 byte header followed by typed fields:
//!
//! ```text
//! [proto header: type=ADMIN][0][result][command][n_fields][12 x 0][field]*
//!
//! field = [u32 size = len(data) + 1][u8 id][data]
//! ```
//!
//! The tend thread logs in with the user credential and keeps the returned
//! session token on the node. New connections then authenticate with that
//! token, which is cheaper than a full login.

use crate::error::{Error, Result, ResultCode};
use crate::protocol::header::{msg_type, ProtoHeader, PROTO_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::time::{Duration, Instant};

pub const ADMIN_HEADER_SIZE: usize = 16;

mod command {
    pub const AUTHENTICATE: u8 = 0;
    pub const LOGIN: u8 = 20;
}

mod field {
    pub const USER: u8 = 0;
    pub const CREDENTIAL: u8 = 3;
    pub const SESSION_TOKEN: u8 = 5;
    pub const SESSION_TTL: u8 = 6;
}

/// Session token handed out by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: Vec<u8>,
    pub expiration: Option<Instant>,
}

impl Session {
    /// True once the session is close enough to expiry that the tend thread
    /// should log in again.
    pub fn needs_refresh(&self, now: Instant) -> bool {
        self.expiration.is_some_and(|exp| now >= exp)
    }
}

struct AdminBuilder {
    buf: BytesMut,
}

impl AdminBuilder {
    fn new(command: u8, n_fields: u8) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_bytes(0, PROTO_SIZE);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(command);
        buf.put_u8(n_fields);
        buf.put_bytes(0, 12);
        Self { buf }
    }

    fn field(mut self, id: u8, data: &[u8]) -> Self {
        self.buf.put_u32(data.len() as u32 + 1);
        self.buf.put_u8(id);
        self.buf.put_slice(data);
        self
    }

    fn finish(mut self) -> Bytes {
        let size = self.buf.len() - PROTO_SIZE;
        self.buf[..PROTO_SIZE].copy_from_slice(&ProtoHeader::new(msg_type::ADMIN, size).encode());
        self.buf.freeze()
    }
}

pub fn encode_login(user: &str, credential: &[u8]) -> Bytes {
    AdminBuilder::new(command::LOGIN, 2)
        .field(field::USER, user.as_bytes())
        .field(field::CREDENTIAL, credential)
        .finish()
}

pub fn encode_authenticate(user: &str, token: &[u8]) -> Bytes {
    AdminBuilder::new(command::AUTHENTICATE, 2)
        .field(field::USER, user.as_bytes())
        .field(field::SESSION_TOKEN, token)
        .finish()
}

/// Result code of an admin response body.
pub fn result_code(body: &[u8]) -> Result<ResultCode> {
    if body.len() < ADMIN_HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "admin response too short: {} bytes",
            body.len()
        )));
    }
    Ok(ResultCode(body[1] as i32))
}

/// Checks an authenticate response.
pub fn check_authenticate(body: &[u8]) -> Result<()> {
    match result_code(body)? {
        ResultCode::OK | ResultCode::SECURITY_NOT_ENABLED => Ok(()),
        code => Err(Error::Auth { code }),
    }
}

/// Decodes a login response. `None` means the server runs without security.
pub fn parse_login(body: &[u8], now: Instant) -> Result<Option<Session>> {
    match result_code(body)? {
        ResultCode::OK => {}
        ResultCode::SECURITY_NOT_ENABLED => return Ok(None),
        code => return Err(Error::Auth { code }),
    }

    let n_fields = body[3];
    let mut pos = ADMIN_HEADER_SIZE;
    let mut token = None;
    let mut ttl = None;

    for _ in 0..n_fields {
        let raw = body
            .get(pos..pos + 5)
            .ok_or_else(|| Error::Protocol("truncated admin field".into()))?;
        let len = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        let id = raw[4];
        if len == 0 {
            return Err(Error::Protocol("invalid admin field size".into()));
        }
        let data = body
            .get(pos + 5..pos + 4 + len)
            .ok_or_else(|| Error::Protocol("truncated admin field".into()))?;

        match id {
            field::SESSION_TOKEN => token = Some(data.to_vec()),
            field::SESSION_TTL if data.len() == 4 => {
                ttl = Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            _ => {}
        }
        pos += 4 + len;
    }

    let token = token.ok_or_else(|| Error::Protocol("login response without session token".into()))?;

    // Refresh a minute before the server drops the session.
    let expiration = ttl
        .filter(|&secs| secs > 60)
        .map(|secs| now + Duration::from_secs(secs as u64 - 60));

    Ok(Some(Session { token, expiration }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_response(code: u8, fields: &[(u8, &[u8])]) -> Vec<u8> {
        let mut body = vec![0, code, 0, fields.len() as u8];
        body.extend_from_slice(&[0u8; 12]);
        for (id, data) in fields {
            body.extend_from_slice(&(data.len() as u32 + 1).to_be_bytes());
            body.push(*id);
            body.extend_from_slice(data);
        }
        body
    }

    #[test]
    fn test_login_frame_layout() {
        let frame = encode_login("admin", b"hash");
        let header = ProtoHeader::decode(&frame).unwrap();
        assert_eq!(header.kind, msg_type::ADMIN);
        assert_eq!(header.size, frame.len() - PROTO_SIZE);

        let body = &frame[PROTO_SIZE..];
        assert_eq!(body[2], command::LOGIN);
        assert_eq!(body[3], 2);
        assert_eq!(&body[16..20], &6u32.to_be_bytes());
        assert_eq!(body[20], field::USER);
        assert_eq!(&body[21..26], b"admin");
    }

    #[test]
    fn test_parse_login_session() {
        let now = Instant::now();
        let body = login_response(
            0,
            &[
                (field::SESSION_TOKEN, b"tok"),
                (field::SESSION_TTL, &3600u32.to_be_bytes()),
            ],
        );
        let session = parse_login(&body, now).unwrap().unwrap();
        assert_eq!(session.token, b"tok");
        assert_eq!(session.expiration, Some(now + Duration::from_secs(3540)));
        assert!(!session.needs_refresh(now));
    }

    #[test]
    fn test_security_disabled() {
        let body = login_response(52, &[]);
        assert_eq!(parse_login(&body, Instant::now()).unwrap(), None);
        assert!(check_authenticate(&body).is_ok());
    }

    #[test]
    fn test_bad_credential() {
        let body = login_response(65, &[]);
        let err = parse_login(&body, Instant::now()).unwrap_err();
        assert_eq!(err.code(), ResultCode::INVALID_CREDENTIAL);
        assert!(check_authenticate(&body).is_err());
    }
}
