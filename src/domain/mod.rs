//! Domain model: event records, coordination commands and the ports the
//! application layer talks through.

pub mod batch;
pub mod command;
pub mod event;
pub mod message;
pub mod ports;
