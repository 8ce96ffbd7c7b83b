//! Record Keys
//!
//! A key names a record by namespace, set and user key. What actually
//! travels to the server (and decides placement) is the 20 byte digest:
//!
//! ```text
//! digest       = RIPEMD-160( set_name || particle_type || user_key_bytes )
//! partition_id = u16_le(digest[0..2]) & (N_PARTITIONS - 1)
//! ```

use crate::error::{Error, Result};
use crate::value::{particle, Value};
use ripemd::{Digest, Ripemd160};
use std::fmt;

/// Number of partitions every namespace is split into.
pub const N_PARTITIONS: usize = 4096;

/// Longest namespace name accepted by the server.
pub const MAX_NAMESPACE: usize = 31;

pub const DIGEST_SIZE: usize = 20;

#[derive(Clone, PartialEq)]
pub struct Key {
    pub namespace: String,
    pub set: String,
    /// The original user key. Only sent when the write policy asks for it.
    pub user_key: Option<Value>,
    pub digest: [u8; DIGEST_SIZE],
}

impl Key {
    pub fn new(
        namespace: impl Into<String>,
        set: impl Into<String>,
        user_key: impl Into<Value>,
    ) -> Result<Key> {
        let namespace = namespace.into();
        let set = set.into();
        let user_key = user_key.into();
        check_namespace(&namespace)?;
        let digest = compute_digest(&set, &user_key)?;

        Ok(Key {
            namespace,
            set,
            user_key: Some(user_key),
            digest,
        })
    }

    /// Builds a key from a digest computed elsewhere.
    pub fn from_digest(
        namespace: impl Into<String>,
        set: impl Into<String>,
        digest: [u8; DIGEST_SIZE],
    ) -> Result<Key> {
        let namespace = namespace.into();
        check_namespace(&namespace)?;
        Ok(Key {
            namespace,
            set: set.into(),
            user_key: None,
            digest,
        })
    }

    pub fn partition_id(&self) -> usize {
        partition_id(&self.digest)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:", self.namespace, self.set)?;
        match &self.user_key {
            Some(v) => write!(f, "{}:", v)?,
            None => write!(f, "-:")?,
        }
        for b in &self.digest {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

pub fn partition_id(digest: &[u8; DIGEST_SIZE]) -> usize {
    (u16::from_le_bytes([digest[0], digest[1]]) as usize) & (N_PARTITIONS - 1)
}

pub(crate) fn check_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.len() > MAX_NAMESPACE {
        return Err(Error::InvalidArgument(format!(
            "namespace must be 1..={} bytes: {:?}",
            MAX_NAMESPACE, namespace
        )));
    }
    Ok(())
}

fn compute_digest(set: &str, user_key: &Value) -> Result<[u8; DIGEST_SIZE]> {
    let mut hasher = Ripemd160::new();
    hasher.update(set.as_bytes());

    match user_key {
        Value::Int(v) => {
            hasher.update([particle::INTEGER]);
            hasher.update(v.to_be_bytes());
        }
        Value::String(s) => {
            hasher.update([particle::STRING]);
            hasher.update(s.as_bytes());
        }
        Value::Blob(b) => {
            hasher.update([particle::BLOB]);
            hasher.update(b);
        }
        other => {
            return Err(Error::InvalidArgument(format!(
                "unsupported key type: particle {}",
                other.particle_type()
            )))
        }
    }

    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_deterministic() {
        let a = Key::new("test", "users", "alice").unwrap();
        let b = Key::new("test", "users", "alice").unwrap();
        let c = Key::new("test", "users", "bob").unwrap();

        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn test_set_and_type_change_digest() {
        let a = Key::new("test", "users", "1").unwrap();
        let b = Key::new("test", "orders", "1").unwrap();
        let c = Key::new("test", "users", 1i64).unwrap();

        assert_ne!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn test_partition_id_uses_low_bits_little_endian() {
        let mut digest = [0u8; DIGEST_SIZE];
        digest[0] = 0x34;
        digest[1] = 0xf2;
        assert_eq!(partition_id(&digest), 0x0234);
    }

    #[test]
    fn test_partition_id_in_range() {
        for i in 0..200i64 {
            let key = Key::new("test", "s", i).unwrap();
            assert!(key.partition_id() < N_PARTITIONS);
        }
    }

    #[test]
    fn test_invalid_namespace() {
        assert!(Key::new("", "s", 1i64).is_err());
        assert!(Key::new("n".repeat(32), "s", 1i64).is_err());
    }

    #[test]
    fn test_float_key_rejected() {
        assert!(Key::new("test", "s", 1.5f64).is_err());
    }
}
