//! # fleetkv - Cluster-Aware Client Engine for a Partitioned Key-Value Database
//!
//! fleetkv talks to a cluster of database nodes over a binary command
//! protocol. It discovers and follows the cluster topology, keeps pooled
//! connections to every node, and runs single-record and batch commands with
//! retry and failover, either blocking on the caller's thread or on a small
//! group of worker event loops.
//!
//! ## Features
//!
//! - **Topology tracking**: a tend thread follows peers, partition ownership
//!   and racks, replacing each table as one immutable snapshot
//! - **Bounded pools**: per-node pools with an atomic admission counter
//! - **Async state machine**: one explicit state per command, resumable after
//!   any partial read or write, with TLS and authentication
//! - **Pipelining**: many requests in flight per connection, answers matched
//!   in order
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Client                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────────────────┐ │
//! │  │  sync ops   │───>│ Dispatcher  │───>│ Cluster                      │ │
//! │  │ (caller)    │    │ retry loop  │    │  nodes      Snapshot<Vec>    │ │
//! │  └─────────────┘    └──────┬──────┘    │  partitions Snapshot<Map>    │ │
//! │  ┌─────────────┐           │           └──────────────▲───────────────┘ │
//! │  │ async ops   │───┐       ▼                          │                 │
//! │  └─────────────┘   │  ┌─────────────┐      ┌──────────┴──────────┐      │
//! │                    │  │ Node pools  │      │    tend thread      │      │
//! │                    │  │ sync/async/ │      │ node, peers, parts, │      │
//! │                    │  │ pipeline    │      │ racks, idle sweep   │      │
//! │                    │  └─────────────┘      └─────────────────────┘      │
//! │                    ▼                                                    │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                       EventLoopGroup                             │   │
//! │  │ ┌────────┐ ┌────────┐ ┌────────┐   each: current_thread runtime  │   │
//! │  │ │ loop 0 │ │ loop 1 │ │ ...N   │   + LocalSet, AsyncCommand      │   │
//! │  │ └────────┘ └────────┘ └────────┘   state machines, pipelines     │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use fleetkv::{Bin, Client, ClientConfig, Host, Key};
//!
//! # async fn run() -> fleetkv::Result<()> {
//! let mut config = ClientConfig::with_hosts(vec![Host::new("127.0.0.1", 3000)]);
//! config.event_loops = 2;
//! let client = Client::new(config)?;
//!
//! let key = Key::new("test", "users", "alice")?;
//! client.put(None, &key, &[Bin::new("visits", 1)])?;
//!
//! let record = client.get_async(None, &key, true).await?;
//! println!("{:?}", record);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: wire codec (headers, commands, responses, info text)
//! - [`cluster`]: nodes, partition and rack tables, the tend loop
//! - [`net`]: blocking connections, pools, address fallback, TLS
//! - [`event`]: worker loops and the async command state machine
//! - [`command`]: dispatcher and batch execution
//! - [`client`]: the public operations
//!
//! ## Design Highlights
//!
//! ### Snapshots
//!
//! Commands clone an `Arc` of the current node list or partition map and
//! work from that. The tend thread builds a new table and swaps it in, so a
//! node can never be freed under a running command.
//!
//! ### Retry
//!
//! Connection failures, timeouts, pool exhaustion and transient server codes
//! are retried while the policy's retry count and total deadline allow. The
//! iteration number feeds replica selection, so reads move to a prole copy
//! after the master failed.

pub mod auth;
pub mod client;
pub mod cluster;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod key;
pub mod net;
pub mod policy;
pub mod protocol;
pub mod value;

// Re-export commonly used types for convenience
pub use client::Client;
pub use cluster::{Cluster, Node};
pub use config::{AuthConfig, ClientConfig, Host, TlsConfig, DEFAULT_PORT};
pub use error::{Error, Result, ResultCode};
pub use event::EventLoopGroup;
pub use key::Key;
pub use policy::{
    BasePolicy, BatchPolicy, CommitLevel, GenerationPolicy, InfoPolicy, ReadModeAp, ReadPolicy,
    RecordExists, Replica, WritePolicy,
};
pub use protocol::{InfoResponse, OpKind, Operation};
pub use value::{Bin, Record, Value};

/// Version of fleetkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
