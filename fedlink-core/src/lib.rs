//! Core state layer of the fedlink coordination fabric: domain types,
//! the id codec, task validation, node liveness, and the `LinkState`
//! store trait with its SQLite implementation. The RPC servicers in
//! `fedlink-server` operate exclusively through this crate.

pub mod id;
pub mod liveness;
pub mod state;
pub mod state_sqlite;
pub mod task;
pub mod validate;
