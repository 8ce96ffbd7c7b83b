//! Node Addresses and Connect Fallback
//!
//! A node can be reachable on several addresses. IPv4 addresses are kept
//! before IPv6 ones and an index remembers which address worked last.
//! Connecting tries, in order:
//!
//! 1. the remembered address
//! 2. the rest of that family, forward with wrap-around
//! 3. every address of the other family
//!
//! The remembered index is only a hint, so it is stored with relaxed
//! ordering.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct AddressList {
    addrs: Vec<SocketAddr>,
    /// Number of IPv4 addresses at the front of `addrs`.
    v4_count: usize,
    index: AtomicUsize,
}

impl AddressList {
    /// Builds the list and points the hint at `primary` when present.
    pub fn new(addrs: &[SocketAddr], primary: Option<SocketAddr>) -> Self {
        let mut sorted: Vec<SocketAddr> = Vec::with_capacity(addrs.len());
        for addr in addrs.iter().filter(|a| a.is_ipv4()).chain(addrs.iter().filter(|a| a.is_ipv6())) {
            if !sorted.contains(addr) {
                sorted.push(*addr);
            }
        }
        let v4_count = sorted.iter().filter(|a| a.is_ipv4()).count();
        let index = primary
            .and_then(|p| sorted.iter().position(|a| *a == p))
            .unwrap_or(0);

        Self {
            addrs: sorted,
            v4_count,
            index: AtomicUsize::new(index),
        }
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.addrs.contains(addr)
    }

    /// The address most likely to work.
    pub fn primary(&self) -> Option<SocketAddr> {
        self.addrs.get(self.index.load(Ordering::Relaxed)).copied()
    }

    /// Indexes of `addrs` in connect order.
    pub fn connect_order(&self) -> Vec<usize> {
        let len = self.addrs.len();
        if len == 0 {
            return Vec::new();
        }
        let index = self.index.load(Ordering::Relaxed).min(len - 1);
        let (family, other) = if index < self.v4_count {
            (0..self.v4_count, self.v4_count..len)
        } else {
            (self.v4_count..len, 0..self.v4_count)
        };

        let mut order = Vec::with_capacity(len);
        order.push(index);
        order.extend(index + 1..family.end);
        order.extend(family.start..index);
        order.extend(other);
        order
    }

    /// Records that `index` worked.
    pub fn mark_success(&self, index: usize) {
        if self.index.load(Ordering::Relaxed) != index {
            debug!(addr = %self.addrs[index], "Switching primary node address");
            self.index.store(index, Ordering::Relaxed);
        }
    }

    /// Tries every address in connect order with `connect`.
    pub fn connect_with<T>(&self, mut connect: impl FnMut(SocketAddr) -> Result<T>) -> Result<T> {
        let mut last_err = None;
        for index in self.connect_order() {
            let addr = self.addrs[index];
            match connect(addr) {
                Ok(conn) => {
                    self.mark_success(index);
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Connect attempt failed");
                    last_err = Some(e.with_context(addr.to_string()));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::InvalidNode("node has no addresses".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_fallback_reaches_third_address() {
        let a = addr("10.0.0.1:3000");
        let b = addr("10.0.0.2:3000");
        let c = addr("10.0.0.3:3000");
        let list = AddressList::new(&[a, b, c], Some(a));

        let mut tried = Vec::new();
        let result = list.connect_with(|addr| {
            tried.push(addr);
            if addr == c {
                Ok(addr)
            } else {
                Err(Error::connection(
                    "refused",
                    io::Error::from(io::ErrorKind::ConnectionRefused),
                ))
            }
        });

        assert_eq!(result.unwrap(), c);
        assert_eq!(tried, vec![a, b, c]);
        assert_eq!(list.primary(), Some(c));
    }

    #[test]
    fn test_order_wraps_within_family_then_switches() {
        let list = AddressList::new(
            &[
                addr("[::1]:3000"),
                addr("10.0.0.1:3000"),
                addr("10.0.0.2:3000"),
                addr("10.0.0.3:3000"),
                addr("[::2]:3000"),
            ],
            Some(addr("10.0.0.2:3000")),
        );
        // v4 first: [10.1, 10.2, 10.3, ::1, ::2], hint at 1
        assert_eq!(list.connect_order(), vec![1, 2, 0, 3, 4]);

        list.mark_success(4);
        assert_eq!(list.connect_order(), vec![4, 3, 0, 1, 2]);
    }

    #[test]
    fn test_all_fail_keeps_hint_and_reports_address() {
        let a = addr("10.0.0.1:3000");
        let list = AddressList::new(&[a], None);
        let err = list
            .connect_with(|_| -> Result<()> { Err(Error::Timeout("connect".into())) })
            .unwrap_err();
        assert!(err.to_string().contains("10.0.0.1:3000"));
        assert_eq!(list.primary(), Some(a));
    }

    #[test]
    fn test_duplicates_removed() {
        let a = addr("10.0.0.1:3000");
        let list = AddressList::new(&[a, a], None);
        assert_eq!(list.len(), 1);
    }
}
