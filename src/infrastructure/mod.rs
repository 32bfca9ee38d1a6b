//! Adapters for the domain ports: event stores and participant channels.

pub mod channel;
pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
