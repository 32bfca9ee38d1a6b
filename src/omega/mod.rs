//! Participant side: the transaction context, the interceptor that reports
//! local units of work to the coordinator, and the runtime that executes the
//! confirm/cancel commands sent back.

pub mod context;
pub mod interceptor;
pub mod runtime;
