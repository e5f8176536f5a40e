use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key→scalar overrides attached to a run; stored as a JSON text column.
pub type ConfigRecord = BTreeMap<String, ConfigValue>;

/// A scalar config value. Never structured data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
}

/// Producer or consumer address of a task.
///
/// Addressing invariant: `anonymous` implies `node_id == 0`, and a
/// named address implies `node_id != 0`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeRef {
    pub node_id: u64,
    pub anonymous: bool,
}

/// Body shared by instructions and results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Task {
    pub producer: NodeRef,
    pub consumer: NodeRef,
    /// RFC 3339 creation stamp, set by the pushing surface.
    pub created_at: String,
    /// RFC 3339 delivery stamp; "" until the row is handed out, never
    /// cleared afterwards.
    pub delivered_at: String,
    /// Epoch seconds at push time.
    pub pushed_at: f64,
    /// Seconds of validity.
    pub ttl: f64,
    /// Prior task ids, oldest first. Empty for root instructions; a
    /// reply carries exactly the one id it answers.
    pub ancestry: Vec<String>,
    pub task_type: String,
    /// Opaque serialized payload; the store never looks inside.
    pub recordset: Vec<u8>,
}

/// A work item addressed from a producer (driver or anonymous) to a
/// consumer node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskIns {
    /// uuid4, minted by the store on insert.
    pub task_id: String,
    pub group_id: String,
    pub run_id: u64,
    pub task: Task,
}

/// A reply to a specific instruction, matched by ancestry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskRes {
    pub task_id: String,
    pub group_id: String,
    pub run_id: u64,
    pub task: Task,
}

/// A logical training job. Immutable once created.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Run {
    pub run_id: u64,
    pub fab_id: String,
    pub fab_version: String,
    pub fab_hash: String,
    pub override_config: ConfigRecord,
}

/// An application bundle addressed by content hash.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fab {
    pub hash_str: String,
    pub content: Vec<u8>,
}

/// Current instant as fractional epoch seconds (UTC).
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1e6
}

/// Current instant as RFC 3339, the format of `created_at`/`delivered_at`.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
