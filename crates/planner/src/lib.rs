//! Query model, optimizer, and compiler for causal tracing queries.
//!
//! Architecture role:
//! - builds query trees over tracepoints joined by happened-before edges
//! - rewrites them so filtering, derived values, and partial aggregation run upstream
//! - flattens them into one serializable [`AdviceSpec`] per tracepoint
//!
//! Key modules:
//! - [`query`] / [`vars`]: AST, builder, and the variable arena
//! - [`optimizer`]
//! - [`compiler`] / [`advice_spec`]
//! - [`query_frontend`]: textual grammar
//! - [`explain`]

pub mod advice_spec;
pub mod compiler;
pub mod explain;
pub mod optimizer;
pub mod query;
pub mod query_frontend;
pub mod tracepoint;
pub mod vars;

pub use advice_spec::*;
pub use compiler::{compile_query, CompilerContext};
pub use explain::{explain_advice, explain_query};
pub use optimizer::{Optimizer, OptimizerConfig};
pub use query::{Aggregate, PtQuery, QuerySource, Stage, WhereCondition};
pub use query_frontend::QueryCatalog;
pub use tracepoint::Tracepoint;
pub use vars::{VarArena, VarDef, VarId};
