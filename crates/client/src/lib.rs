//! Embedding facade for PTQ: register tracepoints, install queries, invoke
//! tracepoints with baggage, and collect results.

mod session;

pub mod engine;

pub use engine::Engine;
pub use ptq_execution::{Baggage, QueryResults, Value};
