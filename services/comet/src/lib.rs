//! Comet node library crate.
//!
//! # Purpose
//! Exposes the node subsystems (config, subscribe transports, admin RPC,
//! membership, offline-store client) to the comet binary and integration tests.
pub mod config;
pub mod membership;
pub mod message_client;
pub mod node;
pub mod rpc;
pub mod transport;

pub use node::CometNode;
