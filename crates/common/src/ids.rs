//! Typed identifiers shared between the compiler, baggage, and emit sinks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of an installed query; also the output id of its emit sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one compiled unit of a query.
///
/// A unit that packs uses it to address its bag inside baggage; the
/// consuming unit unpacks the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BagId {
    /// Query this unit was compiled from.
    pub query: QueryId,
    /// Position of the unit in compilation order.
    pub seq: u32,
}

impl BagId {
    pub fn new(query: QueryId, seq: u32) -> Self {
        Self { query, seq }
    }
}

impl fmt::Display for BagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.query, self.seq)
    }
}
