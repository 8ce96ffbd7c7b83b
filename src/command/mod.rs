//! Command Dispatch
//!
//! Every single-record command follows the same loop, blocking or async:
//!
//! ```text
//!   iteration = 0
//!   loop:
//!     node   = route.resolve(cluster, iteration)   partition map + replica policy
//!     conn   = node pool (or new connection)
//!     write request, read frames until the parser is done
//!     ok            -> connection back to the pool, return
//!     server error  -> connection back to the pool
//!     other error   -> connection closed
//!     retriable && iteration < max_retries && deadline allows
//!                   -> sleep, iteration += 1, again
//! ```
//!
//! The iteration number feeds replica selection, so `Sequence` moves from
//! master to prole on the first retry.

pub mod batch;
pub mod sync;

use crate::cluster::{Cluster, Node};
use crate::error::{Error, Result};
use crate::key::Key;
use crate::policy::{BasePolicy, Replica};
use std::sync::Arc;
use std::time::Instant;

/// Where a command goes.
#[derive(Debug, Clone)]
pub enum Route {
    /// The node owning a partition, chosen by replica policy.
    Partition {
        namespace: String,
        partition_id: usize,
        replica: Replica,
    },
    /// A fixed node (batch groups, info).
    Node(Arc<Node>),
}

impl Route {
    pub fn key(key: &Key, replica: Replica) -> Self {
        Route::Partition {
            namespace: key.namespace.clone(),
            partition_id: key.partition_id(),
            replica,
        }
    }

    pub fn resolve(&self, cluster: &Cluster, iteration: u32) -> Result<Arc<Node>> {
        match self {
            Route::Partition {
                namespace,
                partition_id,
                replica,
            } => cluster.partition_node(namespace, *partition_id, *replica, iteration),
            Route::Node(node) if node.is_active() => Ok(Arc::clone(node)),
            Route::Node(node) => Err(Error::InvalidNode(format!(
                "node {} is no longer active",
                node.name()
            ))),
        }
    }
}

/// Whether a failed attempt may be repeated.
pub(crate) fn should_retry(
    err: &Error,
    iteration: u32,
    policy: &BasePolicy,
    deadline: Option<Instant>,
) -> bool {
    if !err.is_retriable() || iteration >= policy.max_retries {
        return false;
    }
    deadline.map_or(true, |d| Instant::now() + policy.sleep_between_retries < d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use std::io;
    use std::time::Duration;

    fn timeout() -> Error {
        Error::Timeout("socket read".into())
    }

    #[test]
    fn test_retry_bounded_by_max_retries() {
        let policy = BasePolicy {
            max_retries: 2,
            ..BasePolicy::default()
        };
        assert!(should_retry(&timeout(), 0, &policy, None));
        assert!(should_retry(&timeout(), 1, &policy, None));
        assert!(!should_retry(&timeout(), 2, &policy, None));
    }

    #[test]
    fn test_retry_respects_deadline() {
        let policy = BasePolicy {
            max_retries: 5,
            sleep_between_retries: Duration::from_millis(50),
            ..BasePolicy::default()
        };
        let soon = Some(Instant::now() + Duration::from_millis(10));
        assert!(!should_retry(&timeout(), 0, &policy, soon));

        let later = Some(Instant::now() + Duration::from_secs(10));
        assert!(should_retry(&timeout(), 0, &policy, later));
    }

    #[test]
    fn test_retry_classes() {
        let policy = BasePolicy::default();
        let refused = Error::connection("connect", io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(should_retry(&refused, 0, &policy, None));
        assert!(should_retry(&Error::server(ResultCode::KEY_BUSY), 0, &policy, None));
        assert!(!should_retry(&Error::server(ResultCode::KEY_EXISTS), 0, &policy, None));
        assert!(!should_retry(&Error::Protocol("bad".into()), 0, &policy, None));
        assert!(!should_retry(
            &Error::NodeMismatch {
                expected: "A".into(),
                received: "B".into()
            },
            0,
            &policy,
            None
        ));
    }
}
