//! Flat, serializable execution plan produced by the compiler.
//!
//! Every variable reference is a plain name that is unique within one
//! [`AdviceSpec`]; no variable identity survives compilation.

use std::fmt;
use std::str::FromStr;

use ptq_common::{BagId, PtqError, QueryId, Result};
use serde::{Deserialize, Serialize};

/// Aggregation primitive supported by grouped bags and grouped emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggKind {
    Count,
    Sum,
    Min,
    Max,
}

impl AggKind {
    /// Aggregation that combines partial results of `self`.
    pub fn combiner(self) -> AggKind {
        match self {
            AggKind::Min => AggKind::Min,
            AggKind::Max => AggKind::Max,
            AggKind::Count | AggKind::Sum => AggKind::Sum,
        }
    }
}

impl fmt::Display for AggKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggKind::Count => "COUNT",
            AggKind::Sum => "SUM",
            AggKind::Min => "MIN",
            AggKind::Max => "MAX",
        };
        f.write_str(s)
    }
}

impl FromStr for AggKind {
    type Err = PtqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "COUNT" => Ok(AggKind::Count),
            "SUM" => Ok(AggKind::Sum),
            "MIN" => Ok(AggKind::Min),
            "MAX" => Ok(AggKind::Max),
            other => Err(PtqError::Parse(format!("unknown aggregation {other}"))),
        }
    }
}

/// Which row a filter bag keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    First,
    MostRecent,
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKind::First => f.write_str("FIRST"),
            FilterKind::MostRecent => f.write_str("MOSTRECENT"),
        }
    }
}

impl FromStr for FilterKind {
    type Err = PtqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "FIRST" => Ok(FilterKind::First),
            "MOSTRECENT" | "MOST_RECENT" => Ok(FilterKind::MostRecent),
            other => Err(PtqError::Parse(format!("unknown filter {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Variable holding the operand (pack/emit) or the result (unpack).
    pub name: String,
    pub how: AggKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TupleSpec {
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub kind: FilterKind,
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBySpec {
    pub group_by: Vec<String>,
    pub aggregates: Vec<AggregateSpec>,
}

/// Storage discipline and row layout of one bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BagSpec {
    Tuple(TupleSpec),
    Filter(FilterSpec),
    GroupBy(GroupBySpec),
}

impl BagSpec {
    /// Number of values in one row of this bag.
    pub fn arity(&self) -> usize {
        match self {
            BagSpec::Tuple(t) => t.vars.len(),
            BagSpec::Filter(f) => f.vars.len(),
            BagSpec::GroupBy(g) => g.group_by.len() + g.aggregates.len(),
        }
    }

    /// Names bound or read by this spec, in row order.
    pub fn names(&self) -> Vec<&str> {
        match self {
            BagSpec::Tuple(t) => t.vars.iter().map(String::as_str).collect(),
            BagSpec::Filter(f) => f.vars.iter().map(String::as_str).collect(),
            BagSpec::GroupBy(g) => g
                .group_by
                .iter()
                .map(String::as_str)
                .chain(g.aggregates.iter().map(|a| a.name.as_str()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LetSpec {
    pub name: String,
    pub expr: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhereSpec {
    pub expr: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpackSpec {
    pub bag_id: BagId,
    pub bag: BagSpec,
}

/// Terminal action of an advice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputSpec {
    Pack { bag_id: BagId, bag: BagSpec },
    Emit { output_id: QueryId, bag: BagSpec },
}

impl OutputSpec {
    pub fn bag(&self) -> &BagSpec {
        match self {
            OutputSpec::Pack { bag, .. } | OutputSpec::Emit { bag, .. } => bag,
        }
    }
}

/// One compiled, per-tracepoint execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdviceSpec {
    pub observe: Vec<String>,
    pub unpack: Vec<UnpackSpec>,
    pub lets: Vec<LetSpec>,
    pub wheres: Vec<WhereSpec>,
    pub output: OutputSpec,
}

/// An advice plus where it is woven.
///
/// `exports[i]` is the tracepoint field supplying `advice.observe[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaveSpec {
    pub advice_id: BagId,
    pub tracepoint: String,
    pub exports: Vec<String>,
    pub advice: AdviceSpec,
}

/// Everything one query compiles to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAdvice {
    pub query_id: QueryId,
    pub weaves: Vec<WeaveSpec>,
}

impl QueryAdvice {
    /// The weave that emits final results.
    pub fn emitter(&self) -> Option<&WeaveSpec> {
        self.weaves
            .iter()
            .find(|w| matches!(w.advice.output, OutputSpec::Emit { .. }))
    }
}
