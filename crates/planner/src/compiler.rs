//! Flattens an optimized query tree into one [`AdviceSpec`] per stage.
//!
//! Upstream stages are compiled first and always pack; only the root stage
//! emits. Each compiled unit gets its own [`BagId`] from the query id and a
//! per-query sequence number, and its own variable naming registry.

use std::collections::{HashMap, HashSet};

use ptq_common::{BagId, PtqError, QueryId, Result};
use tracing::debug;

use crate::advice_spec::{
    AdviceSpec, AggKind, AggregateSpec, BagSpec, FilterSpec, GroupBySpec, LetSpec, OutputSpec,
    QueryAdvice, TupleSpec, UnpackSpec, WeaveSpec, WhereSpec,
};
use crate::query::{Aggregate, PtQuery, Stage};
use crate::vars::{VarArena, VarDef, VarId};

/// Hands out query identifiers.
///
/// Replaces process-wide counters: two contexts produce the same ids for
/// the same sequence of compilations.
#[derive(Debug, Clone)]
pub struct CompilerContext {
    next_query: u64,
}

impl Default for CompilerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerContext {
    pub fn new() -> Self {
        Self { next_query: 1 }
    }

    pub fn next_query_id(&mut self) -> QueryId {
        let id = QueryId(self.next_query);
        self.next_query += 1;
        id
    }

    /// Compile `query` under a freshly allocated query id.
    pub fn compile(&mut self, query: &PtQuery, vars: &VarArena) -> Result<QueryAdvice> {
        let query_id = self.next_query_id();
        compile_query(query_id, query, vars)
    }
}

/// Compile `query` under a caller-chosen id.
pub fn compile_query(query_id: QueryId, query: &PtQuery, vars: &VarArena) -> Result<QueryAdvice> {
    let mut compiler = QueryCompiler {
        vars,
        query_id,
        next_seq: 0,
        weaves: Vec::new(),
    };
    compiler.compile_stage(query, false)?;
    debug!(query_id = %query_id, units = compiler.weaves.len(), "compiled query");
    Ok(QueryAdvice {
        query_id,
        weaves: compiler.weaves,
    })
}

struct QueryCompiler<'a> {
    vars: &'a VarArena,
    query_id: QueryId,
    next_seq: u32,
    weaves: Vec<WeaveSpec>,
}

impl QueryCompiler<'_> {
    fn compile_stage(&mut self, q: &PtQuery, pack: bool) -> Result<BagId> {
        let tracepoint = q.source().tracepoint().name().to_string();
        let mut names = VarNames::new(self.vars);
        let mut bound: HashSet<VarId> = HashSet::new();

        let mut observe = Vec::with_capacity(q.observed().len());
        let mut exports = Vec::with_capacity(q.observed().len());
        for (field, id) in q.observed() {
            observe.push(names.name(*id));
            exports.push(field.clone());
            bound.insert(*id);
        }

        let mut unpack = Vec::with_capacity(q.happened_before().len());
        for upstream in q.happened_before().values() {
            let bag_id = self.compile_stage(upstream, true)?;
            let (bag, provided) = bag_spec(upstream, true, &mut names, BagRole::Unpack);
            bound.extend(provided);
            unpack.push(UnpackSpec { bag_id, bag });
        }

        let lets = self.compile_lets(q, &mut names, &mut bound, &tracepoint)?;

        let mut wheres = Vec::with_capacity(q.conditions().len());
        for cond in q.conditions() {
            if let Some(missing) = cond.args.iter().find(|a| !bound.contains(a)) {
                return Err(PtqError::Planning(format!(
                    "where '{}' at {tracepoint} reads unresolved variable {}",
                    cond.expr,
                    self.vars.label(*missing)
                )));
            }
            wheres.push(WhereSpec {
                expr: cond.expr.clone(),
                args: cond.args.iter().map(|a| names.name(*a)).collect(),
            });
        }

        let (bag, read) = bag_spec(q, pack, &mut names, BagRole::Output);
        if let Some(missing) = read.iter().find(|v| !bound.contains(v)) {
            return Err(PtqError::Planning(format!(
                "{} at {tracepoint} reads unresolved variable {}",
                if pack { "pack" } else { "emit" },
                self.vars.label(*missing)
            )));
        }

        let advice_id = BagId::new(self.query_id, self.next_seq);
        self.next_seq += 1;
        let output = if pack {
            OutputSpec::Pack {
                bag_id: advice_id,
                bag,
            }
        } else {
            if let Stage::Filter { kind } = q.stage() {
                return Err(PtqError::Unsupported(format!(
                    "a {kind} filter stage cannot emit results"
                )));
            }
            OutputSpec::Emit {
                output_id: self.query_id,
                bag,
            }
        };

        self.weaves.push(WeaveSpec {
            advice_id,
            tracepoint,
            exports,
            advice: AdviceSpec {
                observe,
                unpack,
                lets,
                wheres,
                output,
            },
        });
        Ok(advice_id)
    }

    /// Lets in an order where every input is bound before use.
    fn compile_lets(
        &self,
        q: &PtQuery,
        names: &mut VarNames<'_>,
        bound: &mut HashSet<VarId>,
        tracepoint: &str,
    ) -> Result<Vec<LetSpec>> {
        let mut pending: Vec<VarId> = q.constructed().values().copied().collect();
        let mut lets = Vec::with_capacity(pending.len());
        while !pending.is_empty() {
            let ready = pending.iter().position(|id| {
                self.vars
                    .dependencies(*id)
                    .iter()
                    .all(|d| bound.contains(d))
            });
            let Some(idx) = ready else {
                let stuck = pending[0];
                let missing = self
                    .vars
                    .dependencies(stuck)
                    .into_iter()
                    .find(|d| !bound.contains(d))
                    .map(|d| self.vars.label(d))
                    .unwrap_or_default();
                return Err(PtqError::Planning(format!(
                    "let {} at {tracepoint} reads unresolved variable {missing}",
                    self.vars.label(stuck)
                )));
            };
            let id = pending.remove(idx);
            let VarDef::Let { expr, args, .. } = self.vars.get(id) else {
                return Err(PtqError::Planning(format!(
                    "{} is constructed but is not a let",
                    self.vars.label(id)
                )));
            };
            lets.push(LetSpec {
                name: names.name(id),
                expr: expr.clone(),
                args: args.iter().map(|a| names.name(*a)).collect(),
            });
            bound.insert(id);
        }
        Ok(lets)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BagRole {
    /// Names are the variables the bag binds.
    Unpack,
    /// Names are the variables the stage reads to fill the bag.
    Output,
}

/// Row layout of `q`'s bag, and the variables it binds or reads.
fn bag_spec(
    q: &PtQuery,
    pack: bool,
    names: &mut VarNames<'_>,
    role: BagRole,
) -> (BagSpec, Vec<VarId>) {
    match q.stage() {
        Stage::Filter { kind } => {
            let vars: Vec<VarId> = q.outputs().iter().copied().collect();
            let spec = BagSpec::Filter(FilterSpec {
                kind: *kind,
                vars: vars.iter().map(|v| names.name(*v)).collect(),
            });
            (spec, vars)
        }
        Stage::GroupBy {
            group_by,
            aggregates,
        } => {
            let (keys, aggs) = if pack {
                (pack_group_keys(q, group_by, aggregates), pack_aggregates(q, aggregates))
            } else {
                (group_by.clone(), aggregates.clone())
            };
            let mut touched = keys.clone();
            let aggregates = aggs
                .iter()
                .map(|a| {
                    let var = match (role, a.kind, a.input) {
                        (BagRole::Unpack, _, _) | (_, AggKind::Count, _) | (_, _, None) => a.var,
                        (BagRole::Output, _, Some(input)) => input,
                    };
                    if role == BagRole::Unpack || a.kind != AggKind::Count {
                        touched.push(var);
                    }
                    AggregateSpec {
                        name: names.name(var),
                        how: a.kind,
                    }
                })
                .collect();
            let spec = BagSpec::GroupBy(GroupBySpec {
                group_by: keys.iter().map(|v| names.name(*v)).collect(),
                aggregates,
            });
            (spec, touched)
        }
        Stage::Select { selected } if !pack => {
            let spec = BagSpec::Tuple(TupleSpec {
                vars: selected.iter().map(|v| names.name(*v)).collect(),
            });
            (spec, selected.clone())
        }
        Stage::Select { .. } | Stage::Partial => {
            let vars: Vec<VarId> = q.outputs().iter().copied().collect();
            let spec = BagSpec::Tuple(TupleSpec {
                vars: vars.iter().map(|v| names.name(*v)).collect(),
            });
            (spec, vars)
        }
    }
}

/// Group keys packed by a grouped stage: its declared keys, plus every other
/// non-aggregate output a consumer needs.
fn pack_group_keys(q: &PtQuery, group_by: &[VarId], aggregates: &[Aggregate]) -> Vec<VarId> {
    let mut keys = group_by.to_vec();
    for v in q.outputs() {
        if !keys.contains(v) && !aggregates.iter().any(|a| a.var == *v) {
            keys.push(*v);
        }
    }
    keys
}

fn pack_aggregates(q: &PtQuery, aggregates: &[Aggregate]) -> Vec<Aggregate> {
    aggregates
        .iter()
        .filter(|a| q.outputs().contains(&a.var))
        .copied()
        .collect()
}

/// Per-unit registry assigning each variable a unique name in first-seen order.
struct VarNames<'a> {
    vars: &'a VarArena,
    names: HashMap<VarId, String>,
}

impl<'a> VarNames<'a> {
    fn new(vars: &'a VarArena) -> Self {
        Self {
            vars,
            names: HashMap::new(),
        }
    }

    fn name(&mut self, id: VarId) -> String {
        let next = self.names.len();
        let vars = self.vars;
        self.names
            .entry(id)
            .or_insert_with(|| format!("{next}.{}", vars.label(id)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ptq_common::{BagId, QueryId};

    use super::{compile_query, CompilerContext};
    use crate::advice_spec::{AggKind, BagSpec, FilterKind, OutputSpec};
    use crate::query::PtQuery;
    use crate::tracepoint::Tracepoint;
    use crate::vars::VarArena;

    fn tp(name: &str, exports: &[&str]) -> Arc<Tracepoint> {
        Arc::new(Tracepoint::new(name, exports.iter().copied()))
    }

    #[test]
    fn single_stage_emits_selected_vars() {
        let mut vars = VarArena::new();
        let q = PtQuery::from(tp("t0", &["a", "b"]))
            .let_var(&mut vars, "c", "{}+{}", &["a", "b"])
            .unwrap()
            .select(&mut vars, &["c"])
            .unwrap();
        let advice = compile_query(QueryId(9), &q, &vars).unwrap();
        assert_eq!(advice.weaves.len(), 1);
        let w = &advice.weaves[0];
        assert_eq!(w.tracepoint, "t0");
        assert_eq!(w.exports, vec!["a", "b"]);
        assert_eq!(w.advice.observe, vec!["0.a", "1.b"]);
        assert_eq!(w.advice.lets[0].name, "2.c");
        assert_eq!(w.advice.lets[0].args, vec!["0.a", "1.b"]);
        match &w.advice.output {
            OutputSpec::Emit { output_id, bag } => {
                assert_eq!(*output_id, QueryId(9));
                assert_eq!(bag.names(), vec!["2.c"]);
            }
            other => panic!("expected emit, got {other:?}"),
        }
    }

    #[test]
    fn upstreams_pack_into_the_bag_their_consumer_unpacks() {
        let mut vars = VarArena::new();
        let q = PtQuery::from_named("x", tp("t0", &["a"]))
            .unwrap()
            .happened_before_tracepoint(&mut vars, "y", tp("t1", &["b"]), None)
            .unwrap()
            .select(&mut vars, &["x.a", "y.b"])
            .unwrap();
        let mut ctx = CompilerContext::new();
        let advice = ctx.compile(&q, &vars).unwrap();
        assert_eq!(advice.query_id, QueryId(1));
        assert_eq!(advice.weaves.len(), 2);

        let up = &advice.weaves[0];
        assert_eq!(up.tracepoint, "t1");
        assert_eq!(up.advice_id, BagId::new(QueryId(1), 0));
        let OutputSpec::Pack { bag_id, bag } = &up.advice.output else {
            panic!("upstream must pack");
        };
        assert_eq!(*bag_id, up.advice_id);
        assert_eq!(bag, &BagSpec::Tuple(super::TupleSpec { vars: vec!["0.b".into()] }));

        let root = advice.emitter().unwrap();
        assert_eq!(root.advice_id, BagId::new(QueryId(1), 1));
        assert_eq!(root.advice.unpack.len(), 1);
        assert_eq!(root.advice.unpack[0].bag_id, up.advice_id);
        assert_eq!(ctx.next_query_id(), QueryId(2));
    }

    #[test]
    fn unpack_follows_upstream_stage_kind() {
        let mut vars = VarArena::new();
        let grouped = PtQuery::from(tp("t1", &["host", "delta"]))
            .group_by(&mut vars, &["host"])
            .unwrap()
            .aggregate(&mut vars, "delta", AggKind::Sum)
            .unwrap();
        let q = PtQuery::from_named("x", tp("t0", &["a"]))
            .unwrap()
            .happened_before_join(&mut vars, "g", &grouped, None)
            .unwrap()
            .happened_before_tracepoint(&mut vars, "f", tp("t2", &["c"]), Some(FilterKind::First))
            .unwrap()
            .select(&mut vars, &["g.host", "g.SUM(delta)", "f.c"])
            .unwrap();
        let advice = compile_query(QueryId(3), &q, &vars).unwrap();
        let root = advice.emitter().unwrap();
        let kinds: Vec<&BagSpec> = root.advice.unpack.iter().map(|u| &u.bag).collect();
        assert!(matches!(kinds[0], BagSpec::Filter(f) if f.kind == FilterKind::First));
        match kinds[1] {
            BagSpec::GroupBy(g) => {
                assert_eq!(g.group_by.len(), 1);
                assert_eq!(g.aggregates.len(), 1);
                assert_eq!(g.aggregates[0].how, AggKind::Sum);
                assert!(g.aggregates[0].name.ends_with("SUM(delta)"));
            }
            other => panic!("expected groupby unpack, got {other:?}"),
        }

        // The grouped upstream packs the operand, not the aggregate.
        let packer = advice
            .weaves
            .iter()
            .find(|w| w.tracepoint == "t1")
            .unwrap();
        match packer.advice.output.bag() {
            BagSpec::GroupBy(g) => assert!(g.aggregates[0].name.ends_with(".delta")),
            other => panic!("expected groupby pack, got {other:?}"),
        }
    }

    #[test]
    fn unresolvable_where_fails_before_any_advice_exists() {
        let mut vars = VarArena::new();
        let mut q = PtQuery::from_named("x", tp("t0", &["a"]))
            .unwrap()
            .happened_before_tracepoint(&mut vars, "y", tp("t1", &["b"]), None)
            .unwrap()
            .where_clause(&mut vars, "{}>{}", &["x.a", "y.b"])
            .unwrap();
        // Drop what the upstream delivers.
        Arc::make_mut(q.happened_before.get_mut("y").unwrap())
            .outputs
            .clear();
        let err = compile_query(QueryId(1), &q, &vars).unwrap_err();
        assert!(err.to_string().contains("unresolved variable b"), "{err}");
    }
}
