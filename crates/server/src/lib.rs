//! gRPC front end and fan-out client for the suffix-tree cache.
//!
//! The binary in this crate runs one update server per host: it creates
//! the shared arena and accepts `UpdateCache` RPCs from inference
//! workers. The [`client`] module is the worker-side library that fans
//! each update out to every cache host discovered from the environment.

pub mod client;
pub mod config;
pub mod logging;
pub mod service;
pub mod shutdown;

// Generated protobuf code for proto/suffix_cache.proto, committed so the
// build does not require protoc. Regenerate with tonic-build when the
// schema changes.
pub mod proto {
    include!("proto/specache.v1.rs");
}
