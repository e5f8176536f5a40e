//! Node-side half of the fedlink fabric: the `Connection` abstraction
//! a SuperNode talks to the link server through (request/response
//! gRPC, byte-envelope adapter, or REST — one capability set, one
//! shared retry invoker), the message codec, and the ClientAppIo
//! servicer that faces the workload process.

pub mod appio;
pub mod codec;
pub mod connection;
pub mod grpc_adapter;
pub mod grpc_rere;
pub mod rest;
pub mod retry;

pub mod proto {
    tonic::include_proto!("fedlink.v1");
}

/// Ping interval a fresh connection registers with, in seconds.
pub const PING_DEFAULT_INTERVAL: f64 = 30.0;
