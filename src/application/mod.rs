//! Application layer: ingestion of participant events, the coordinator that
//! turns recorded participations into confirm/cancel dispatch, and the
//! registry of live participant channels.

pub mod coordinator;
pub mod ingestion;
pub mod registry;
pub mod unit_of_work;
