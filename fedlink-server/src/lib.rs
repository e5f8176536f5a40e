//! RPC surface of the fedlink link server: the Fleet, Driver, and Exec
//! servicers, the run executor, and the FAB content provider. Every
//! handler is a thin skin over `fedlink_core::state::LinkState`.

pub mod driver;
pub mod exec;
pub mod executor;
pub mod fab;
pub mod fleet;
pub mod grpc;

/// Upper bound on a single RPC message. Model-weight payloads ride in
/// recordsets, so the default transport cap is far too small.
pub const GRPC_MAX_MESSAGE_LENGTH: usize = 1024 * 1024 * 1024;
