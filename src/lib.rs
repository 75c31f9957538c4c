// ABOUTME: Local-first change synchronization between embedded replicas and a server
// ABOUTME: Client/server sync engine, wire codec, and reactive query cache

pub mod cache;
pub mod client;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod schema;
pub mod server;

pub use error::SyncError;
