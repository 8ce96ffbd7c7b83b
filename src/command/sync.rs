//! Blocking command execution on the caller's thread.

use crate::cluster::{Cluster, Node};
use crate::command::{should_retry, Route};
use crate::error::Result;
use crate::net::Connection;
use crate::policy::BasePolicy;
use crate::protocol::header::msg_type;
use crate::protocol::ResponseParser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Runs one request with the retry loop. `parser` collects the response.
pub fn execute<P: ResponseParser>(
    cluster: &Cluster,
    route: &Route,
    request: &[u8],
    parser: &mut P,
    policy: &BasePolicy,
    is_write: bool,
) -> Result<()> {
    let deadline = policy.deadline();
    let socket_timeout = policy.socket_timeout();
    let mut iteration = 0;

    loop {
        let result = route.resolve(cluster, iteration).and_then(|node| {
            attempt(&node, request, parser, socket_timeout, deadline, is_write)
        });

        match result {
            Ok(()) => return Ok(()),
            Err(e) if should_retry(&e, iteration, policy, deadline) => {
                debug!(iteration, error = %e, "Retrying command");
                iteration += 1;
                if !policy.sleep_between_retries.is_zero() {
                    std::thread::sleep(policy.sleep_between_retries);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

fn attempt<P: ResponseParser>(
    node: &Arc<Node>,
    request: &[u8],
    parser: &mut P,
    socket_timeout: Option<Duration>,
    deadline: Option<Instant>,
    is_write: bool,
) -> Result<()> {
    let mut conn = node.get_connection(deadline)?;
    let mut sent = false;

    match exchange(&mut conn, request, parser, socket_timeout, deadline, &mut sent) {
        Ok(()) => {
            node.put_connection(conn);
            Ok(())
        }
        Err(e) => {
            if e.is_fatal_for_connection() {
                node.close_connection(conn);
            } else {
                node.put_connection(conn);
            }
            Err(e
                .set_in_doubt(is_write && sent)
                .with_context(format!("node {}", node)))
        }
    }
}

fn exchange<P: ResponseParser>(
    conn: &mut Connection,
    request: &[u8],
    parser: &mut P,
    socket_timeout: Option<Duration>,
    deadline: Option<Instant>,
    sent: &mut bool,
) -> Result<()> {
    conn.write_all(request, socket_timeout, deadline)?;
    *sent = true;

    loop {
        let (header, body) = conn.read_frame(msg_type::MESSAGE, socket_timeout, deadline)?;
        if parser.parse(header.kind, &body)? {
            return Ok(());
        }
    }
}
