//! Bridge between a local accounting engine and its web/desktop clients.

pub mod auth;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod relay;
pub mod serializer;

pub use error::BridgeError;
