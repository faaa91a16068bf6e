use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::trace;

use crate::advice_spec::AggKind;
use crate::query::{Aggregate, PtQuery, Stage};
use crate::vars::{VarArena, VarDef, VarId};

/// Configuration knobs for the rewrite passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptimizerConfig {
    /// Move derived variables into upstream stages that output all their inputs.
    pub push_lets: bool,
    /// Move predicates into upstream stages that output all their inputs.
    pub push_wheres: bool,
    /// Split grouped aggregations into upstream partials plus local combiners.
    pub push_aggregates: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            push_lets: true,
            push_wheres: true,
            push_aggregates: true,
        }
    }
}

/// Rewrites a query tree so that computation happens as close as possible
/// to the tracepoints producing its inputs.
///
/// The input query is never modified. Every rewritten stage is a fresh node;
/// variables keep their handles while moving between stages, and new
/// variables (partial aggregates, count products) are allocated in `vars`.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    cfg: OptimizerConfig,
}

impl Optimizer {
    pub fn new(cfg: OptimizerConfig) -> Self {
        Self { cfg }
    }

    /// Pass order per stage:
    /// 1. optimize every upstream
    /// 2. let push-down to fixpoint
    /// 3. where push-down to fixpoint
    /// 4. re-optimize upstreams that received lets or wheres
    /// 5. aggregate push-down (GroupBy only)
    /// 6. prune upstream outputs nobody reads
    pub fn optimize(&self, query: &PtQuery, vars: &mut VarArena) -> PtQuery {
        self.optimize_stage(query, vars)
    }

    fn optimize_stage(&self, query: &PtQuery, vars: &mut VarArena) -> PtQuery {
        let mut q = query.clone();

        // 1) upstreams first
        let aliases: Vec<String> = q.happened_before.keys().cloned().collect();
        for alias in &aliases {
            let optimized = self.optimize_stage(&q.happened_before[alias], vars);
            q.happened_before.insert(alias.clone(), Arc::new(optimized));
        }

        // 2) + 3)
        let mut touched = BTreeSet::new();
        if self.cfg.push_lets {
            while let Some(alias) = push_one_let(&mut q, vars) {
                touched.insert(alias);
            }
        }
        if self.cfg.push_wheres {
            while let Some(alias) = push_one_where(&mut q) {
                touched.insert(alias);
            }
        }

        // 4) pushed elements may sink further
        for alias in touched {
            let optimized = self.optimize_stage(&q.happened_before[&alias], vars);
            q.happened_before.insert(alias, Arc::new(optimized));
        }

        // 5)
        if self.cfg.push_aggregates {
            self.push_aggregates(&mut q, vars);
        }

        // 6)
        prune_upstream_outputs(&mut q, vars);
        q
    }

    // -----------------------------
    // 5) Aggregate push-down
    // -----------------------------

    fn push_aggregates(&self, q: &mut PtQuery, vars: &mut VarArena) {
        let Stage::GroupBy {
            group_by,
            aggregates,
        } = &q.stage
        else {
            return;
        };
        let group_by = group_by.clone();
        let mut aggregates = aggregates.clone();

        let mut residual: BTreeSet<VarId> = BTreeSet::new();
        for id in q.constructed.values() {
            residual.extend(vars.dependencies(*id));
        }
        for cond in &q.conditions {
            residual.extend(cond.args.iter().copied());
        }
        let mut local_needs = residual.clone();
        local_needs.extend(group_by.iter().copied());

        let mut rewritten: BTreeMap<String, PtQuery> = BTreeMap::new();
        for (alias, upstream) in &q.happened_before {
            if matches!(upstream.stage, Stage::GroupBy { .. } | Stage::Filter { .. }) {
                continue;
            }
            let promoted: Vec<usize> = aggregates
                .iter()
                .enumerate()
                .filter(|(_, a)| a.input.is_some_and(|i| upstream.outputs.contains(&i)))
                .map(|(idx, _)| idx)
                .collect();
            if promoted
                .iter()
                .any(|idx| residual.contains(&aggregates[*idx].var))
            {
                continue;
            }

            let keys: Vec<VarId> = group_by
                .iter()
                .filter(|v| upstream.outputs.contains(v))
                .copied()
                .collect();
            let mut partial = (**upstream).clone();
            let mut partials = Vec::with_capacity(promoted.len());
            for idx in promoted {
                let combined = aggregates[idx];
                let pushed = vars.alloc(VarDef::Agg {
                    input: combined.input,
                    kind: combined.kind,
                });
                partials.push(Aggregate {
                    var: pushed,
                    kind: combined.kind,
                    input: combined.input,
                });
                partial.outputs.insert(pushed);
                if let Some(input) = combined.input {
                    if !local_needs.contains(&input) {
                        partial.outputs.remove(&input);
                    }
                }
                aggregates[idx] = Aggregate {
                    var: combined.var,
                    kind: combined.kind.combiner(),
                    input: Some(pushed),
                };
            }
            partial.stage = Stage::GroupBy {
                group_by: keys,
                aggregates: partials,
            };
            trace!(upstream = %alias, "wrapping upstream in partial aggregation");
            rewritten.insert(alias.clone(), partial);
        }

        // COUNT becomes SUM over the product of per-upstream counts.
        if !rewritten.is_empty() {
            for idx in 0..aggregates.len() {
                let agg = aggregates[idx];
                if agg.kind != AggKind::Count || agg.input.is_some() {
                    continue;
                }
                let mut counts = Vec::with_capacity(rewritten.len());
                for partial in rewritten.values_mut() {
                    let count = vars.alloc(VarDef::Agg {
                        input: None,
                        kind: AggKind::Count,
                    });
                    if let Stage::GroupBy { aggregates, .. } = &mut partial.stage {
                        aggregates.push(Aggregate {
                            var: count,
                            kind: AggKind::Count,
                            input: None,
                        });
                    }
                    partial.outputs.insert(count);
                    counts.push(count);
                }
                let name = fresh_name(q, "counts");
                let expr = format!("1{}", "*{}".repeat(counts.len()));
                let product = vars.alloc(VarDef::Let {
                    name: name.clone(),
                    expr,
                    args: counts,
                });
                q.constructed.insert(name, product);
                aggregates[idx] = Aggregate {
                    var: agg.var,
                    kind: AggKind::Sum,
                    input: Some(product),
                };
            }
        }

        q.stage = Stage::GroupBy {
            group_by,
            aggregates,
        };
        for (alias, partial) in rewritten {
            let optimized = self.optimize_stage(&partial, vars);
            q.happened_before.insert(alias, Arc::new(optimized));
        }
    }
}

// -----------------------------
// 2) Let push-down
// -----------------------------

fn accepts_let(upstream: &PtQuery, args: &[VarId]) -> bool {
    match upstream.stage {
        Stage::Partial | Stage::Select { .. } => {
            args.iter().all(|a| upstream.outputs.contains(a))
        }
        Stage::GroupBy { .. } | Stage::Filter { .. } => false,
    }
}

fn push_one_let(q: &mut PtQuery, vars: &VarArena) -> Option<String> {
    let (name, id, alias) = q.constructed.iter().find_map(|(name, id)| {
        let args = vars.dependencies(*id);
        if args.is_empty() {
            return None;
        }
        q.happened_before
            .iter()
            .find(|(_, up)| !up.constructed.contains_key(name) && accepts_let(up, &args))
            .map(|(alias, _)| (name.clone(), *id, alias.clone()))
    })?;

    q.constructed.shift_remove(&name);
    let still_needed = q.needed_vars(vars).contains(&id);
    let upstream = Arc::make_mut(q.happened_before.get_mut(&alias)?);
    upstream.constructed.insert(name.clone(), id);
    if still_needed {
        upstream.outputs.insert(id);
    }
    trace!(var = %name, upstream = %alias, "pushed let");
    Some(alias)
}

// -----------------------------
// 3) Where push-down
// -----------------------------

fn accepts_where(upstream: &PtQuery, args: &[VarId]) -> bool {
    match &upstream.stage {
        Stage::Partial | Stage::Select { .. } => {
            args.iter().all(|a| upstream.outputs.contains(a))
        }
        // Aggregates may never be filtered before aggregation.
        Stage::GroupBy { group_by, .. } => args.iter().all(|a| group_by.contains(a)),
        Stage::Filter { .. } => false,
    }
}

fn push_one_where(q: &mut PtQuery) -> Option<String> {
    let (idx, alias) = q.conditions.iter().enumerate().find_map(|(idx, cond)| {
        if cond.args.is_empty() {
            return None;
        }
        q.happened_before
            .iter()
            .find(|(_, up)| accepts_where(up, &cond.args))
            .map(|(alias, _)| (idx, alias.clone()))
    })?;

    let cond = q.conditions.remove(idx);
    trace!(expr = %cond.expr, upstream = %alias, "pushed where");
    Arc::make_mut(q.happened_before.get_mut(&alias)?)
        .conditions
        .push(cond);
    Some(alias)
}

// -----------------------------
// 6) Output pruning
// -----------------------------

fn prune_upstream_outputs(q: &mut PtQuery, vars: &VarArena) {
    let needed = q.needed_vars(vars);
    for upstream in q.happened_before.values_mut() {
        let unused = upstream.outputs.iter().any(|v| !needed.contains(v));
        if unused {
            let upstream = Arc::make_mut(upstream);
            upstream.outputs.retain(|v| needed.contains(v));
            prune_upstream_outputs(upstream, vars);
        }
    }
}

fn fresh_name(q: &PtQuery, base: &str) -> String {
    if q.is_available(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| q.is_available(candidate))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Optimizer, OptimizerConfig};
    use crate::advice_spec::{AggKind, FilterKind};
    use crate::query::{PtQuery, Stage};
    use crate::tracepoint::Tracepoint;
    use crate::vars::{VarArena, VarDef};

    fn tp(name: &str, exports: &[&str]) -> Arc<Tracepoint> {
        Arc::new(Tracepoint::new(name, exports.iter().copied()))
    }

    fn optimize(q: &PtQuery, vars: &mut VarArena) -> PtQuery {
        Optimizer::default().optimize(q, vars)
    }

    #[test]
    fn pushes_let_whose_inputs_are_upstream() {
        let mut vars = VarArena::new();
        let q = PtQuery::from_named("x", tp("t0", &["a"]))
            .unwrap()
            .happened_before_tracepoint(&mut vars, "y", tp("t1", &["b", "c"]), None)
            .unwrap()
            .let_var(&mut vars, "bc", "{}+{}", &["y.b", "y.c"])
            .unwrap()
            .select(&mut vars, &["x.a", "bc"])
            .unwrap();
        let bc = q.constructed()["bc"];

        let opt = optimize(&q, &mut vars);
        assert!(opt.constructed().is_empty());
        let y = &opt.happened_before()["y"];
        assert_eq!(y.constructed()["bc"], bc);
        // b and c are consumed upstream only.
        assert_eq!(y.outputs().iter().copied().collect::<Vec<_>>(), vec![bc]);
        // Original tree untouched.
        assert_eq!(q.constructed()["bc"], bc);
        assert_eq!(q.happened_before()["y"].outputs().len(), 2);
    }

    #[test]
    fn keeps_let_spanning_stages() {
        let mut vars = VarArena::new();
        let q = PtQuery::from_named("x", tp("t0", &["a"]))
            .unwrap()
            .happened_before_tracepoint(&mut vars, "y", tp("t1", &["b"]), None)
            .unwrap()
            .let_var(&mut vars, "ab", "{}-{}", &["x.a", "y.b"])
            .unwrap()
            .select(&mut vars, &["ab"])
            .unwrap();
        let opt = optimize(&q, &mut vars);
        assert!(opt.constructed().contains_key("ab"));
        assert!(opt.happened_before()["y"].constructed().is_empty());
    }

    #[test]
    fn pushes_where_to_grouped_keys_only() {
        let mut vars = VarArena::new();
        let up = PtQuery::from(tp("t1", &["host", "delta"]))
            .group_by(&mut vars, &["host"])
            .unwrap()
            .aggregate(&mut vars, "delta", AggKind::Sum)
            .unwrap();
        let q = PtQuery::from_named("x", tp("t0", &["a"]))
            .unwrap()
            .happened_before_join(&mut vars, "y", &up, None)
            .unwrap()
            .where_clause(&mut vars, "\"{}\"!=\"localhost\"", &["y.host"])
            .unwrap()
            .where_clause(&mut vars, "{}>10", &["y.SUM(delta)"])
            .unwrap()
            .select(&mut vars, &["x.a"])
            .unwrap();
        let opt = optimize(&q, &mut vars);
        assert_eq!(opt.conditions().len(), 1);
        assert_eq!(opt.conditions()[0].expr, "{}>10");
        assert_eq!(opt.happened_before()["y"].conditions().len(), 1);
    }

    #[test]
    fn filters_accept_nothing() {
        let mut vars = VarArena::new();
        let q = PtQuery::from_named("x", tp("t0", &["a"]))
            .unwrap()
            .happened_before_tracepoint(&mut vars, "y", tp("t1", &["b"]), Some(FilterKind::First))
            .unwrap()
            .where_clause(&mut vars, "{}>0", &["y.b"])
            .unwrap()
            .let_var(&mut vars, "b2", "{}*2", &["y.b"])
            .unwrap()
            .select(&mut vars, &["b2"])
            .unwrap();
        let opt = optimize(&q, &mut vars);
        assert_eq!(opt.conditions().len(), 1);
        assert!(opt.constructed().contains_key("b2"));
    }

    #[test]
    fn splits_sum_into_partial_and_combiner() {
        let mut vars = VarArena::new();
        let q = PtQuery::from_named("x", tp("t0", &["host"]))
            .unwrap()
            .happened_before_tracepoint(&mut vars, "y", tp("t1", &["delta"]), None)
            .unwrap()
            .group_by(&mut vars, &["x.host"])
            .unwrap()
            .aggregate(&mut vars, "y.delta", AggKind::Sum)
            .unwrap();
        let opt = optimize(&q, &mut vars);

        let y = &opt.happened_before()["y"];
        let Stage::GroupBy {
            group_by,
            aggregates: partials,
        } = y.stage()
        else {
            panic!("upstream not grouped: {:?}", y.stage());
        };
        assert!(group_by.is_empty());
        assert_eq!(partials.len(), 1);
        assert_eq!(partials[0].kind, AggKind::Sum);

        let Stage::GroupBy { aggregates, .. } = opt.stage() else {
            panic!("not grouped");
        };
        assert_eq!(aggregates[0].kind, AggKind::Sum);
        assert_eq!(aggregates[0].input, Some(partials[0].var));
        assert!(y.outputs().contains(&partials[0].var));
    }

    #[test]
    fn count_becomes_sum_of_count_products() {
        let mut vars = VarArena::new();
        let q = PtQuery::from_named("x", tp("t0", &["host"]))
            .unwrap()
            .happened_before_tracepoint(&mut vars, "y", tp("t1", &["a"]), None)
            .unwrap()
            .happened_before_tracepoint(&mut vars, "z", tp("t2", &["b"]), None)
            .unwrap()
            .group_by(&mut vars, &["x.host"])
            .unwrap()
            .count(&mut vars)
            .unwrap();
        let opt = optimize(&q, &mut vars);

        let counts = opt.constructed()["counts"];
        let VarDef::Let { expr, args, .. } = vars.get(counts) else {
            panic!("counts is not a let");
        };
        assert_eq!(expr, "1*{}*{}");
        assert_eq!(args.len(), 2);
        let Stage::GroupBy { aggregates, .. } = opt.stage() else {
            panic!("not grouped");
        };
        assert_eq!(aggregates[0].kind, AggKind::Sum);
        assert_eq!(aggregates[0].input, Some(counts));
        for alias in ["y", "z"] {
            let up = &opt.happened_before()[alias];
            let Stage::GroupBy { aggregates, .. } = up.stage() else {
                panic!("{alias} not grouped");
            };
            assert_eq!(aggregates.len(), 1);
            assert_eq!(aggregates[0].kind, AggKind::Count);
            assert!(args.contains(&aggregates[0].var));
        }
    }

    #[test]
    fn disabled_passes_leave_query_alone() {
        let mut vars = VarArena::new();
        let q = PtQuery::from_named("x", tp("t0", &["a"]))
            .unwrap()
            .happened_before_tracepoint(&mut vars, "y", tp("t1", &["b"]), None)
            .unwrap()
            .where_clause(&mut vars, "{}>0", &["y.b"])
            .unwrap()
            .group_by(&mut vars, &["x.a"])
            .unwrap()
            .count(&mut vars)
            .unwrap();
        let cfg = OptimizerConfig {
            push_lets: false,
            push_wheres: false,
            push_aggregates: false,
        };
        let opt = Optimizer::new(cfg).optimize(&q, &mut vars);
        assert_eq!(opt.conditions().len(), 1);
        assert_eq!(opt.happened_before()["y"].stage(), &Stage::Partial);
    }
}
