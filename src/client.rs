//! Client
//!
//! The public entry point. A [`Client`] owns the cluster (and with it the
//! tend thread) plus the worker loops used by the `*_async` operations.
//!
//! Every operation takes an optional policy; `None` means the default from
//! [`ClientConfig`].
//!
//! ```no_run
//! use fleetkv::{Bin, Client, ClientConfig, Host, Key};
//!
//! let client = Client::new(ClientConfig::with_hosts(vec![Host::new("127.0.0.1", 3000)]))?;
//! let key = Key::new("test", "users", "alice")?;
//! client.put(None, &key, &[Bin::new("visits", 1)])?;
//! let record = client.get(None, &key)?;
//! # Ok::<(), fleetkv::Error>(())
//! ```

use crate::cluster::{Cluster, Node};
use crate::command::{batch, sync, Route};
use crate::config::ClientConfig;
use crate::error::{Error, Result, ResultCode};
use crate::event::driver::{self, AsyncRequest};
use crate::event::EventLoopGroup;
use crate::key::Key;
use crate::policy::{BasePolicy, BatchPolicy, ReadPolicy, Replica, WritePolicy};
use crate::protocol::command::{self as encode, OpKind, Operation};
use crate::protocol::{InfoResponse, RecordParser, ResponseParser};
use crate::value::{Bin, Record, Value};
use bytes::Bytes;
use std::sync::Arc;
use tracing::info;

const NOT_FOUND: &[ResultCode] = &[ResultCode::KEY_NOT_FOUND];

/// Handle to a cluster. Cheap to share behind an `Arc`.
pub struct Client {
    cluster: Arc<Cluster>,
    loops: Option<Arc<EventLoopGroup>>,
}

impl Client {
    /// Starts the worker loops (when `event_loops > 0`) and connects to the
    /// seed hosts. Blocks until the first tend cycle finished.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let loops = match config.event_loops {
            0 => None,
            n => Some(EventLoopGroup::new(n)?),
        };
        let cluster = match Cluster::connect(config, loops.clone()) {
            Ok(cluster) => cluster,
            Err(e) => {
                if let Some(loops) = &loops {
                    loops.shutdown();
                }
                return Err(e);
            }
        };
        Ok(Self { cluster, loops })
    }

    /// Stops the tend thread and the worker loops and closes all connections.
    pub fn close(&self) {
        if self.cluster.is_closed() {
            return;
        }
        self.cluster.close();
        if let Some(loops) = &self.loops {
            loops.shutdown();
        }
        info!("Client closed");
    }

    pub fn is_connected(&self) -> bool {
        self.cluster.is_connected()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.cluster.nodes()
    }

    pub fn config(&self) -> &ClientConfig {
        self.cluster.config()
    }

    fn check_open(&self) -> Result<()> {
        if self.cluster.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn read_policy<'a>(&'a self, policy: Option<&'a ReadPolicy>) -> &'a ReadPolicy {
        policy.unwrap_or(&self.config().read_policy)
    }

    fn write_policy<'a>(&'a self, policy: Option<&'a WritePolicy>) -> &'a WritePolicy {
        policy.unwrap_or(&self.config().write_policy)
    }

    fn batch_policy<'a>(&'a self, policy: Option<&'a BatchPolicy>) -> &'a BatchPolicy {
        policy.unwrap_or(&self.config().batch_policy)
    }

    // ---------------------------------------------------------------------
    // Info
    // ---------------------------------------------------------------------

    /// Sends an info request to any active node.
    pub fn info(&self, names: &[&str]) -> Result<InfoResponse> {
        self.check_open()?;
        let node = self.cluster.random_node()?;
        node.info(names, self.config().info_policy.timeout)
    }

    /// Sends an info request to the named node.
    pub fn info_node(&self, node: &str, names: &[&str]) -> Result<InfoResponse> {
        self.check_open()?;
        let node = self.cluster.get_node(node)?;
        node.info(names, self.config().info_policy.timeout)
    }

    // ---------------------------------------------------------------------
    // Blocking single record commands
    // ---------------------------------------------------------------------

    fn run(
        &self,
        route: Route,
        request: &[u8],
        mut parser: RecordParser,
        policy: &BasePolicy,
        is_write: bool,
    ) -> Result<RecordParser> {
        self.check_open()?;
        sync::execute(&self.cluster, &route, request, &mut parser, policy, is_write)?;
        Ok(parser)
    }

    /// Reads all bins. `None` when the record does not exist.
    pub fn get(&self, policy: Option<&ReadPolicy>, key: &Key) -> Result<Option<Record>> {
        let policy = self.read_policy(policy);
        let request = encode::encode_read(policy, key, None)?;
        let parser = self.run(
            Route::key(key, policy.replica),
            &request,
            RecordParser::new(NOT_FOUND, true),
            &policy.base,
            false,
        )?;
        Ok(parser.record)
    }

    /// Reads the named bins only.
    pub fn select(
        &self,
        policy: Option<&ReadPolicy>,
        key: &Key,
        bins: &[&str],
    ) -> Result<Option<Record>> {
        let policy = self.read_policy(policy);
        let request = encode::encode_read(policy, key, Some(bins))?;
        let parser = self.run(
            Route::key(key, policy.replica),
            &request,
            RecordParser::new(NOT_FOUND, true),
            &policy.base,
            false,
        )?;
        Ok(parser.record)
    }

    pub fn exists(&self, policy: Option<&ReadPolicy>, key: &Key) -> Result<bool> {
        let policy = self.read_policy(policy);
        let request = encode::encode_exists(policy, key)?;
        let parser = self.run(
            Route::key(key, policy.replica),
            &request,
            RecordParser::new(NOT_FOUND, false),
            &policy.base,
            false,
        )?;
        Ok(parser.code == ResultCode::OK)
    }

    fn write(&self, policy: Option<&WritePolicy>, key: &Key, kind: OpKind, bins: &[Bin]) -> Result<()> {
        let policy = self.write_policy(policy);
        let request = encode::encode_write(policy, key, kind, bins)?;
        self.run(
            Route::key(key, Replica::Master),
            &request,
            RecordParser::new(&[], false),
            &policy.base,
            true,
        )?;
        Ok(())
    }

    pub fn put(&self, policy: Option<&WritePolicy>, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write(policy, key, OpKind::Write, bins)
    }

    pub fn append(&self, policy: Option<&WritePolicy>, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write(policy, key, OpKind::Append, bins)
    }

    pub fn prepend(&self, policy: Option<&WritePolicy>, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write(policy, key, OpKind::Prepend, bins)
    }

    /// Adds integer values to existing bins.
    pub fn add(&self, policy: Option<&WritePolicy>, key: &Key, bins: &[Bin]) -> Result<()> {
        self.write(policy, key, OpKind::Incr, bins)
    }

    /// Resets the record's time to live.
    pub fn touch(&self, policy: Option<&WritePolicy>, key: &Key) -> Result<()> {
        let policy = self.write_policy(policy);
        let request = encode::encode_touch(policy, key)?;
        self.run(
            Route::key(key, Replica::Master),
            &request,
            RecordParser::new(&[], false),
            &policy.base,
            true,
        )?;
        Ok(())
    }

    /// Deletes the record. Returns whether it existed.
    pub fn remove(&self, policy: Option<&WritePolicy>, key: &Key) -> Result<bool> {
        let policy = self.write_policy(policy);
        let request = encode::encode_delete(policy, key)?;
        let parser = self.run(
            Route::key(key, Replica::Master),
            &request,
            RecordParser::new(NOT_FOUND, false),
            &policy.base,
            true,
        )?;
        Ok(parser.code == ResultCode::OK)
    }

    /// Applies `ops` atomically. Returns the bins produced by read ops.
    pub fn operate(
        &self,
        policy: Option<&WritePolicy>,
        key: &Key,
        ops: &[Operation],
    ) -> Result<Option<Record>> {
        let policy = self.write_policy(policy);
        let request = encode::encode_operate(policy, key, ops)?;
        let parser = self.run(
            Route::key(key, Replica::Master),
            &request,
            RecordParser::new(&[], true),
            &policy.base,
            is_write(ops),
        )?;
        Ok(parser.record)
    }

    /// Runs a server side function against one record and returns its result.
    pub fn apply(
        &self,
        policy: Option<&WritePolicy>,
        key: &Key,
        package: &str,
        function: &str,
        args: &Value,
    ) -> Result<Option<Value>> {
        let policy = self.write_policy(policy);
        let request = encode::encode_apply(policy, key, package, function, args)?;
        let parser = self.run(
            Route::key(key, Replica::Master),
            &request,
            RecordParser::new(&[], true),
            &policy.base,
            true,
        )?;
        udf_result(parser.record)
    }

    // ---------------------------------------------------------------------
    // Batch
    // ---------------------------------------------------------------------

    /// Reads many records. Results follow the order of `keys`.
    pub fn batch_get(
        &self,
        policy: Option<&BatchPolicy>,
        keys: &[Key],
        bins: Option<&[&str]>,
    ) -> Result<Vec<Option<Record>>> {
        self.check_open()?;
        batch::execute(&self.cluster, self.batch_policy(policy), keys, bins, false)
    }

    pub fn batch_exists(&self, policy: Option<&BatchPolicy>, keys: &[Key]) -> Result<Vec<bool>> {
        self.check_open()?;
        let records = batch::execute(&self.cluster, self.batch_policy(policy), keys, None, true)?;
        Ok(records.iter().map(Option::is_some).collect())
    }

    // ---------------------------------------------------------------------
    // Async
    // ---------------------------------------------------------------------

    /// Runs a command on the next worker loop and waits for its result.
    async fn run_async<P>(
        &self,
        route: Route,
        request: Bytes,
        parser: P,
        policy: &BasePolicy,
        is_write: bool,
        pipeline: bool,
    ) -> Result<P>
    where
        P: ResponseParser + Clone + Send + 'static,
    {
        self.check_open()?;
        let loops = self.event_loops()?;
        let cluster = Arc::clone(&self.cluster);
        let req = AsyncRequest {
            route,
            request,
            parser,
            policy: policy.clone(),
            is_write,
            pipeline,
        };
        let rx = loops.spawn(loops.next(), move |index| driver::execute(cluster, index, req))?;
        rx.await.map_err(|_| Error::Closed)?
    }

    fn event_loops(&self) -> Result<&Arc<EventLoopGroup>> {
        self.loops
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("async commands need event_loops > 0".into()))
    }

    pub async fn get_async(
        &self,
        policy: Option<&ReadPolicy>,
        key: &Key,
        pipeline: bool,
    ) -> Result<Option<Record>> {
        let policy = self.read_policy(policy);
        let request = encode::encode_read(policy, key, None)?;
        let parser = self
            .run_async(
                Route::key(key, policy.replica),
                request,
                RecordParser::new(NOT_FOUND, true),
                &policy.base,
                false,
                pipeline,
            )
            .await?;
        Ok(parser.record)
    }

    pub async fn exists_async(
        &self,
        policy: Option<&ReadPolicy>,
        key: &Key,
        pipeline: bool,
    ) -> Result<bool> {
        let policy = self.read_policy(policy);
        let request = encode::encode_exists(policy, key)?;
        let parser = self
            .run_async(
                Route::key(key, policy.replica),
                request,
                RecordParser::new(NOT_FOUND, false),
                &policy.base,
                false,
                pipeline,
            )
            .await?;
        Ok(parser.code == ResultCode::OK)
    }

    pub async fn put_async(
        &self,
        policy: Option<&WritePolicy>,
        key: &Key,
        bins: &[Bin],
        pipeline: bool,
    ) -> Result<()> {
        let policy = self.write_policy(policy);
        let request = encode::encode_write(policy, key, OpKind::Write, bins)?;
        self.run_async(
            Route::key(key, Replica::Master),
            request,
            RecordParser::new(&[], false),
            &policy.base,
            true,
            pipeline,
        )
        .await?;
        Ok(())
    }

    pub async fn remove_async(
        &self,
        policy: Option<&WritePolicy>,
        key: &Key,
        pipeline: bool,
    ) -> Result<bool> {
        let policy = self.write_policy(policy);
        let request = encode::encode_delete(policy, key)?;
        let parser = self
            .run_async(
                Route::key(key, Replica::Master),
                request,
                RecordParser::new(NOT_FOUND, false),
                &policy.base,
                true,
                pipeline,
            )
            .await?;
        Ok(parser.code == ResultCode::OK)
    }

    pub async fn operate_async(
        &self,
        policy: Option<&WritePolicy>,
        key: &Key,
        ops: &[Operation],
        pipeline: bool,
    ) -> Result<Option<Record>> {
        let policy = self.write_policy(policy);
        let request = encode::encode_operate(policy, key, ops)?;
        let parser = self
            .run_async(
                Route::key(key, Replica::Master),
                request,
                RecordParser::new(&[], true),
                &policy.base,
                is_write(ops),
                pipeline,
            )
            .await?;
        Ok(parser.record)
    }

    pub async fn apply_async(
        &self,
        policy: Option<&WritePolicy>,
        key: &Key,
        package: &str,
        function: &str,
        args: &Value,
        pipeline: bool,
    ) -> Result<Option<Value>> {
        let policy = self.write_policy(policy);
        let request = encode::encode_apply(policy, key, package, function, args)?;
        let parser = self
            .run_async(
                Route::key(key, Replica::Master),
                request,
                RecordParser::new(&[], true),
                &policy.base,
                true,
                pipeline,
            )
            .await?;
        udf_result(parser.record)
    }

    /// Batch read on a worker loop, one concurrent request per node.
    pub async fn batch_get_async(
        &self,
        policy: Option<&BatchPolicy>,
        keys: &[Key],
    ) -> Result<Vec<Option<Record>>> {
        self.check_open()?;
        let loops = self.event_loops()?;
        let cluster = Arc::clone(&self.cluster);
        let policy = self.batch_policy(policy).clone();
        let keys = keys.to_vec();
        let rx = loops.spawn(loops.next(), move |index| {
            batch::execute_async(cluster, index, policy, keys, false)
        })?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cluster", &self.cluster)
            .field("loops", &self.loops)
            .finish()
    }
}

fn is_write(ops: &[Operation]) -> bool {
    ops.iter().any(|op| op.kind.is_write())
}

/// Server side functions answer with a `SUCCESS` or `FAILURE` bin.
fn udf_result(record: Option<Record>) -> Result<Option<Value>> {
    let Some(mut record) = record else {
        return Ok(None);
    };
    if let Some(failure) = record.bins.remove("FAILURE") {
        return Err(Error::server(ResultCode::UDF_BAD_RESPONSE).with_context(failure.to_string()));
    }
    Ok(record.bins.remove("SUCCESS"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udf_success_bin() {
        let mut record = Record::default();
        record.bins.insert("SUCCESS".into(), Value::Int(3));
        assert_eq!(udf_result(Some(record)).unwrap(), Some(Value::Int(3)));
        assert_eq!(udf_result(None).unwrap(), None);
    }

    #[test]
    fn test_udf_failure_bin() {
        let mut record = Record::default();
        record.bins.insert("FAILURE".into(), Value::from("bad arg"));
        let err = udf_result(Some(record)).unwrap_err();
        assert_eq!(err.code(), ResultCode::UDF_BAD_RESPONSE);
        assert!(err.to_string().starts_with("bad arg"));
    }

    #[test]
    fn test_operate_write_detection() {
        assert!(!is_write(&[Operation::get("a")]));
        assert!(is_write(&[Operation::get("a"), Operation::touch()]));
    }
}
