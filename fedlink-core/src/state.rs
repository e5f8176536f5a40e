use crate::task::{ConfigRecord, Run, TaskIns, TaskRes};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;

/// Persistence trait for all link-server state.
///
/// The Fleet and Driver servicers operate exclusively through this
/// trait. Every cross-entity invariant (referential integrity to runs,
/// at-most-once delivery, ancestry matching, the credential singleton)
/// lives behind it.
#[async_trait]
pub trait LinkState: Send + Sync {
    // ── Task instructions ──

    /// Validate and insert an instruction, minting its task id.
    /// Returns `None` when validation fails or the run is unknown.
    async fn store_task_ins(&self, ins: TaskIns) -> Result<Option<String>>;

    /// Atomic fetch-and-mark-delivered. `node_id` of `None` selects
    /// instructions addressed anonymously; `Some(0)` is rejected, as
    /// is a zero `limit`. A returned instruction is never returned to
    /// any later call.
    async fn get_task_ins(
        &self,
        node_id: Option<u64>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskIns>>;

    // ── Task results ──

    /// Symmetric to [`store_task_ins`](Self::store_task_ins); no
    /// matching happens at insert time.
    async fn store_task_res(&self, res: TaskRes) -> Result<Option<String>>;

    /// For each submitted instruction id: its undelivered reply if one
    /// arrived, or a synthesized unavailable-reply when the consumer
    /// node is offline, up to `limit` rows. Substitutes are never
    /// persisted.
    async fn get_task_res(
        &self,
        task_ids: &HashSet<String>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskRes>>;

    // ── Bookkeeping ──

    /// Row count, delivered rows included.
    async fn num_task_ins(&self) -> Result<u64>;
    async fn num_task_res(&self) -> Result<u64>;

    /// Delete delivered instruction/reply pairs among `task_ids`.
    /// Undelivered rows are never deleted.
    async fn delete_tasks(&self, task_ids: &HashSet<String>) -> Result<()>;

    // ── Nodes ──

    /// Register a node under a fresh random id. Fails when the public
    /// key is already bound or the id draw collides.
    async fn create_node(&self, ping_interval: f64, public_key: Option<&[u8]>) -> Result<u64>;

    /// Remove a node; when a public key is supplied it must match.
    /// Fails when no row is affected.
    async fn delete_node(&self, node_id: u64, public_key: Option<&[u8]>) -> Result<()>;

    /// All nodes inside their online horizon. Empty when the run is
    /// unknown; the run id gates nothing beyond existence.
    async fn get_nodes(&self, run_id: u64) -> Result<HashSet<u64>>;

    async fn get_node_id(&self, public_key: &[u8]) -> Result<Option<u64>>;

    /// Renew a node's online horizon. False when the node is unknown.
    async fn acknowledge_ping(&self, node_id: u64, ping_interval: f64) -> Result<bool>;

    // ── Runs ──

    /// Mint a run id and record the bundle reference: by content hash
    /// when one is given, by id/version pair otherwise.
    async fn create_run(
        &self,
        fab_id: &str,
        fab_version: &str,
        fab_hash: &str,
        override_config: ConfigRecord,
    ) -> Result<u64>;

    async fn get_run(&self, run_id: u64) -> Result<Option<Run>>;

    // ── Server credential (at most one row) ──

    /// Fails when a credential row already exists.
    async fn store_server_private_public_key(
        &self,
        private_key: &[u8],
        public_key: &[u8],
    ) -> Result<()>;
    async fn get_server_private_key(&self) -> Result<Option<Vec<u8>>>;
    async fn get_server_public_key(&self) -> Result<Option<Vec<u8>>>;

    // ── Registered node public keys (append-only allow-list) ──

    async fn store_node_public_keys(&self, public_keys: HashSet<Vec<u8>>) -> Result<()>;
    async fn store_node_public_key(&self, public_key: Vec<u8>) -> Result<()>;
    async fn get_node_public_keys(&self) -> Result<HashSet<Vec<u8>>>;
}
