//! Runtime and client for the `homo.Function` unary RPC service.
//!
//! The wire schema lives in the `function_proto` crate. This crate hosts
//! function handlers behind a tonic server, calls them with retries, and
//! carries the config, logging and metrics plumbing around both.

pub mod client;
pub mod config;
pub mod invocation_cache;
pub mod message;
pub mod metrics;
pub mod runtime;
pub mod service;
pub mod tracing;

pub use function_proto::FunctionMessage;

#[cfg(test)]
mod testing;
