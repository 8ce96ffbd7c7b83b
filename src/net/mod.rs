//! Networking Module
//!
//! Sockets, pools and TLS, shared by the blocking path and the worker loops.
//!
//! ```text
//!   Node ──┬── sync pools   [ConnectionPool<Connection>; conn_pools_per_node]
//!          ├── async pools  [ConnectionPool<AsyncConnection>; event_loops]
//!          └── pipe pools   [ConnectionPool<PipeHandle>; event_loops]
//! ```

pub mod address;
pub mod conn;
pub mod pool;
pub mod tls;

pub use address::AddressList;
pub use conn::Connection;
pub use pool::{split_capacity, ConnectionPool};
pub use tls::TlsContext;
