#![deny(missing_docs)]

//! Runtime side of PTQ: evaluates compiled advice against observed values and baggage.
//!
//! Architecture role:
//! - values observed at tracepoints and carried in bags
//! - template expression interpreter for lets and wheres
//! - baggage with its three bag storage disciplines
//! - emit sinks and the per-advice interpreter
//!
//! Key modules:
//! - [`advice`]
//! - [`baggage`]
//! - [`emit`]
//! - [`expressions`]
//! - [`value`]

pub mod advice;
pub mod baggage;
pub mod emit;
pub mod expressions;
pub mod value;

pub use advice::{Advice, AdviceStats};
pub use baggage::{create_bag, Bag, BagEntry, Baggage, FilterBag, GroupedBag, Row, TupleBag};
pub use emit::{Emit, EmitGrouped, EmitRegistry, EmitTuples, QueryResults};
pub use expressions::{ExprError, TemplateExpr};
pub use value::Value;
