//! Outer surfaces: participant sessions, the in-process loopback participant
//! and the CSV formats of the command line tool.

pub mod csv;
pub mod loopback;
pub mod session;
