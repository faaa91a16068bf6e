//! Query AST and builder.
//!
//! A [`PtQuery`] is one stage of a causal query: the tracepoint it observes,
//! the derived variables and predicates evaluated there, and the upstream
//! stages it joins through happened-before edges. Builder calls never edit a
//! query in place; each returns a new copy, and upstream stages are shared
//! through `Arc` and copied on write.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use indexmap::IndexMap;
use ptq_common::{PtqError, Result};

use crate::advice_spec::{AggKind, FilterKind};
use crate::tracepoint::Tracepoint;
use crate::vars::{VarArena, VarDef, VarId};

/// Where a stage's observed variables come from.
#[derive(Debug, Clone)]
pub enum QuerySource {
    /// Variables are addressed as `alias.field`.
    Named {
        alias: String,
        tracepoint: Arc<Tracepoint>,
    },
    /// Variables are addressed directly by exported field name.
    Unnamed { tracepoint: Arc<Tracepoint> },
}

impl QuerySource {
    pub fn tracepoint(&self) -> &Arc<Tracepoint> {
        match self {
            QuerySource::Named { tracepoint, .. } | QuerySource::Unnamed { tracepoint } => {
                tracepoint
            }
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            QuerySource::Named { alias, .. } => Some(alias),
            QuerySource::Unnamed { .. } => None,
        }
    }

    /// Whether the query-facing `name` refers to a field of the tracepoint.
    pub fn exports(&self, name: &str) -> bool {
        match self {
            QuerySource::Named { alias, tracepoint } => split_qualified(name)
                .is_some_and(|(left, right)| left == alias && tracepoint.exports(right)),
            QuerySource::Unnamed { tracepoint } => tracepoint.exports(name),
        }
    }

    /// Tracepoint field behind an exported query-facing name.
    pub fn observed_as<'a>(&self, name: &'a str) -> &'a str {
        match self {
            QuerySource::Named { .. } => split_qualified(name).map_or(name, |(_, right)| right),
            QuerySource::Unnamed { .. } => name,
        }
    }

    /// Query-facing name of a tracepoint field.
    pub fn var_name(&self, field: &str) -> String {
        match self {
            QuerySource::Named { alias, .. } => format!("{alias}.{field}"),
            QuerySource::Unnamed { .. } => field.to_string(),
        }
    }

    fn available(&self, name: &str) -> bool {
        match self {
            QuerySource::Named { alias, .. } => name != alias,
            QuerySource::Unnamed { tracepoint } => !tracepoint.exports(name),
        }
    }
}

/// A predicate template over positional argument variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhereCondition {
    pub expr: String,
    pub args: Vec<VarId>,
}

/// One aggregate of a `GroupBy` stage.
///
/// `var` is the variable downstream stages see. `input` is what this stage
/// aggregates: the declared operand, or an upstream partial aggregate after
/// push-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    pub var: VarId,
    pub kind: AggKind,
    pub input: Option<VarId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Still accepting `where` and `let`.
    Partial,
    Select {
        selected: Vec<VarId>,
    },
    GroupBy {
        group_by: Vec<VarId>,
        aggregates: Vec<Aggregate>,
    },
    /// Upstream stage whose bag keeps a single row.
    Filter {
        kind: FilterKind,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Partial => "Partial",
            Stage::Select { .. } => "Select",
            Stage::GroupBy { .. } => "GroupBy",
            Stage::Filter { .. } => "Filter",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PtQuery {
    pub(crate) source: QuerySource,
    pub(crate) observed: BTreeMap<String, VarId>,
    pub(crate) happened_before: BTreeMap<String, Arc<PtQuery>>,
    pub(crate) short_vars: BTreeMap<String, String>,
    pub(crate) constructed: IndexMap<String, VarId>,
    pub(crate) conditions: Vec<WhereCondition>,
    pub(crate) outputs: BTreeSet<VarId>,
    pub(crate) stage: Stage,
}

impl PtQuery {
    /// Start an unnamed query; fields are addressed by their exported name.
    pub fn from(tracepoint: Arc<Tracepoint>) -> PtQuery {
        Self::with_source(QuerySource::Unnamed { tracepoint })
    }

    /// Start a named query; fields are addressed as `alias.field`.
    pub fn from_named(alias: &str, tracepoint: Arc<Tracepoint>) -> Result<PtQuery> {
        if !valid_var_name(alias) {
            return Err(PtqError::Planning(format!("invalid query alias '{alias}'")));
        }
        Ok(Self::with_source(QuerySource::Named {
            alias: alias.to_string(),
            tracepoint,
        }))
    }

    fn with_source(source: QuerySource) -> PtQuery {
        PtQuery {
            source,
            observed: BTreeMap::new(),
            happened_before: BTreeMap::new(),
            short_vars: BTreeMap::new(),
            constructed: IndexMap::new(),
            conditions: Vec::new(),
            outputs: BTreeSet::new(),
            stage: Stage::Partial,
        }
    }

    pub fn source(&self) -> &QuerySource {
        &self.source
    }

    /// Locally observed variables keyed by tracepoint field.
    pub fn observed(&self) -> &BTreeMap<String, VarId> {
        &self.observed
    }

    pub fn happened_before(&self) -> &BTreeMap<String, Arc<PtQuery>> {
        &self.happened_before
    }

    pub fn short_vars(&self) -> &BTreeMap<String, String> {
        &self.short_vars
    }

    /// Derived variables in construction order.
    pub fn constructed(&self) -> &IndexMap<String, VarId> {
        &self.constructed
    }

    pub fn conditions(&self) -> &[WhereCondition] {
        &self.conditions
    }

    /// Variables this stage must deliver to its consumer.
    pub fn outputs(&self) -> &BTreeSet<VarId> {
        &self.outputs
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn where_clause(&self, vars: &mut VarArena, expr: &str, args: &[&str]) -> Result<PtQuery> {
        self.require_partial("where")?;
        let mut next = self.clone();
        let args = args
            .iter()
            .map(|name| next.require_input(vars, name))
            .collect::<Result<Vec<_>>>()?;
        next.conditions.push(WhereCondition {
            expr: expr.to_string(),
            args,
        });
        Ok(next)
    }

    pub fn let_var(
        &self,
        vars: &mut VarArena,
        name: &str,
        expr: &str,
        args: &[&str],
    ) -> Result<PtQuery> {
        self.require_partial("let")?;
        self.check_var_name(name)?;
        let mut next = self.clone();
        let args = args
            .iter()
            .map(|arg| next.require_input(vars, arg))
            .collect::<Result<Vec<_>>>()?;
        let id = vars.alloc(VarDef::Let {
            name: name.to_string(),
            expr: expr.to_string(),
            args,
        });
        next.constructed.insert(name.to_string(), id);
        Ok(next)
    }

    pub fn select(&self, vars: &mut VarArena, keys: &[&str]) -> Result<PtQuery> {
        self.require_partial("select")?;
        let mut next = self.clone();
        let selected = keys
            .iter()
            .map(|key| next.require_input(vars, key))
            .collect::<Result<Vec<_>>>()?;
        next.outputs.extend(selected.iter().copied());
        next.stage = Stage::Select { selected };
        Ok(next)
    }

    pub fn group_by(&self, vars: &mut VarArena, keys: &[&str]) -> Result<PtQuery> {
        self.require_partial("groupby")?;
        let mut next = self.clone();
        let group_by = keys
            .iter()
            .map(|key| next.require_input(vars, key))
            .collect::<Result<Vec<_>>>()?;
        next.outputs.extend(group_by.iter().copied());
        next.stage = Stage::GroupBy {
            group_by,
            aggregates: Vec::new(),
        };
        Ok(next)
    }

    /// Add `kind(name)` to a `GroupBy` stage.
    pub fn aggregate(&self, vars: &mut VarArena, name: &str, kind: AggKind) -> Result<PtQuery> {
        let mut next = self.clone();
        let input = next.require_input(vars, name)?;
        next.push_aggregate(vars, Some(input), kind)?;
        Ok(next)
    }

    pub fn count(&self, vars: &mut VarArena) -> Result<PtQuery> {
        let mut next = self.clone();
        next.push_aggregate(vars, None, AggKind::Count)?;
        Ok(next)
    }

    fn push_aggregate(
        &mut self,
        vars: &mut VarArena,
        input: Option<VarId>,
        kind: AggKind,
    ) -> Result<()> {
        let Stage::GroupBy { aggregates, .. } = &mut self.stage else {
            return Err(PtqError::Planning(format!(
                "{kind} requires a groupby, found {}",
                self.stage.name()
            )));
        };
        let var = vars.alloc(VarDef::Agg { input, kind });
        aggregates.push(Aggregate { var, kind, input });
        self.outputs.insert(var);
        Ok(())
    }

    /// Join `upstream` as a happened-before dependency under `join_var`.
    ///
    /// With a filter, the upstream must still be partial and becomes a
    /// `Filter` stage. An upstream sharing variables with this query (for
    /// example the same named query joined twice) is re-instantiated with
    /// fresh variables first.
    pub fn happened_before_join(
        &self,
        vars: &mut VarArena,
        join_var: &str,
        upstream: &PtQuery,
        filter: Option<FilterKind>,
    ) -> Result<PtQuery> {
        self.check_var_name(join_var)?;
        let upstream = self.prepare_upstream(vars, upstream, filter)?;
        let mut next = self.clone();
        next.happened_before
            .insert(join_var.to_string(), Arc::new(upstream));
        Ok(next)
    }

    /// Join a bare tracepoint; its fields are addressed as `join_var.field`.
    pub fn happened_before_tracepoint(
        &self,
        vars: &mut VarArena,
        join_var: &str,
        tracepoint: Arc<Tracepoint>,
        filter: Option<FilterKind>,
    ) -> Result<PtQuery> {
        let upstream = PtQuery::from(tracepoint);
        self.happened_before_join(vars, join_var, &upstream, filter)
    }

    /// Join `upstream` beneath the existing upstream `via`.
    ///
    /// `join_var` becomes a short variable of this query, so `join_var.field`
    /// resolves as `via.join_var.field`.
    pub fn happened_before_join_via(
        &self,
        vars: &mut VarArena,
        via: &str,
        join_var: &str,
        upstream: &PtQuery,
        filter: Option<FilterKind>,
    ) -> Result<PtQuery> {
        self.check_var_name(join_var)?;
        let existing = self.happened_before.get(via).ok_or_else(|| {
            PtqError::Planning(format!("no upstream named '{via}' to join beneath"))
        })?;
        let upstream = self.prepare_upstream(vars, upstream, filter)?;
        let nested = existing.happened_before_join(vars, join_var, &upstream, None)?;
        let mut next = self.clone();
        next.happened_before.insert(via.to_string(), Arc::new(nested));
        next.short_vars
            .insert(join_var.to_string(), format!("{via}.{join_var}"));
        Ok(next)
    }

    fn prepare_upstream(
        &self,
        vars: &mut VarArena,
        upstream: &PtQuery,
        filter: Option<FilterKind>,
    ) -> Result<PtQuery> {
        let mut ours = BTreeSet::new();
        self.collect_defined(&mut ours);
        let mut theirs = BTreeSet::new();
        upstream.collect_defined(&mut theirs);
        let mut upstream = if ours.is_disjoint(&theirs) {
            upstream.clone()
        } else {
            upstream.instantiate(vars)
        };
        if let Some(kind) = filter {
            if upstream.stage != Stage::Partial {
                return Err(PtqError::Planning(format!(
                    "cannot apply {kind} to a {} query",
                    upstream.stage.name()
                )));
            }
            upstream.stage = Stage::Filter { kind };
        }
        Ok(upstream)
    }

    /// Whether `name` can be declared without shadowing anything visible here.
    pub fn is_available(&self, name: &str) -> bool {
        valid_var_name(name)
            && !self.constructed.contains_key(name)
            && !self.happened_before.contains_key(name)
            && !self.short_vars.contains_key(name)
            && self.source.available(name)
    }

    fn check_var_name(&self, name: &str) -> Result<()> {
        if self.is_available(name) {
            Ok(())
        } else {
            Err(PtqError::Planning(format!(
                "variable name '{name}' is invalid or already in use"
            )))
        }
    }

    fn require_partial(&self, op: &str) -> Result<()> {
        match self.stage {
            Stage::Partial => Ok(()),
            _ => Err(PtqError::Planning(format!(
                "{op} cannot follow {}",
                self.stage.name()
            ))),
        }
    }

    /// Resolve `name` to a variable usable at this stage.
    ///
    /// Lookup order: short variables, constructed lets, the source's exports
    /// (observing the field on first use), then one `.`-qualified hop into a
    /// happened-before upstream, which must output the remainder.
    pub(crate) fn require_input(&mut self, vars: &mut VarArena, name: &str) -> Result<VarId> {
        if let Some(full) = self.short_vars.get(name).cloned() {
            return self.require_input(vars, &full);
        }
        if let Some(id) = self.constructed.get(name) {
            return Ok(*id);
        }
        if self.source.exports(name) {
            let field = self.source.observed_as(name).to_string();
            if let Some(id) = self.observed.get(&field) {
                return Ok(*id);
            }
            let id = vars.alloc(VarDef::Observed {
                source: self.source.alias().unwrap_or_default().to_string(),
                field: field.clone(),
            });
            self.observed.insert(field, id);
            return Ok(id);
        }
        let Some((left, right)) = split_qualified(name) else {
            return Err(unknown_var(name));
        };
        if let Some(full) = self.short_vars.get(left).cloned() {
            return self.require_input(vars, &format!("{full}.{right}"));
        }
        match self.happened_before.get_mut(left) {
            Some(upstream) => Arc::make_mut(upstream).require_output(vars, right),
            None => Err(unknown_var(name)),
        }
    }

    /// Resolve `name` and mark it as delivered to the consumer.
    pub(crate) fn require_output(&mut self, vars: &mut VarArena, name: &str) -> Result<VarId> {
        if let Stage::GroupBy { .. } = self.stage {
            return self.require_grouped_output(vars, name);
        }
        let id = self.require_input(vars, name)?;
        if let Stage::Select { selected } = &self.stage {
            if !selected.contains(&id) {
                return Err(PtqError::Planning(format!(
                    "'{name}' is not selected by the upstream query"
                )));
            }
        }
        self.outputs.insert(id);
        Ok(id)
    }

    fn require_grouped_output(&mut self, vars: &mut VarArena, name: &str) -> Result<VarId> {
        if let Some((kind, operand)) = parse_aggregate(name) {
            let input = match operand {
                Some(operand) => Some(self.require_input(vars, operand)?),
                None => None,
            };
            let Stage::GroupBy { aggregates, .. } = &self.stage else {
                return Err(unknown_var(name));
            };
            let found = aggregates
                .iter()
                .find(|a| a.kind == kind && a.input == input)
                .map(|a| a.var)
                .ok_or_else(|| {
                    PtqError::Planning(format!("'{name}' is not aggregated by the upstream query"))
                })?;
            self.outputs.insert(found);
            return Ok(found);
        }
        let id = self.require_input(vars, name)?;
        match &self.stage {
            Stage::GroupBy { group_by, .. } if group_by.contains(&id) => {
                self.outputs.insert(id);
                Ok(id)
            }
            _ => Err(PtqError::Planning(format!(
                "'{name}' is not a group key of the upstream query"
            ))),
        }
    }

    /// Every variable defined anywhere in this tree.
    pub(crate) fn collect_defined(&self, out: &mut BTreeSet<VarId>) {
        out.extend(self.observed.values().copied());
        out.extend(self.constructed.values().copied());
        if let Stage::GroupBy { aggregates, .. } = &self.stage {
            out.extend(aggregates.iter().map(|a| a.var));
        }
        for upstream in self.happened_before.values() {
            upstream.collect_defined(out);
        }
    }

    /// Variables this stage reads or must deliver.
    pub(crate) fn needed_vars(&self, vars: &VarArena) -> BTreeSet<VarId> {
        let mut needed = self.outputs.clone();
        for id in self.constructed.values() {
            needed.extend(vars.dependencies(*id));
        }
        for cond in &self.conditions {
            needed.extend(cond.args.iter().copied());
        }
        match &self.stage {
            Stage::Select { selected } => needed.extend(selected.iter().copied()),
            Stage::GroupBy {
                group_by,
                aggregates,
            } => {
                needed.extend(group_by.iter().copied());
                needed.extend(aggregates.iter().filter_map(|a| a.input));
            }
            Stage::Partial | Stage::Filter { .. } => {}
        }
        needed
    }

    /// Copy of this tree with every defined variable replaced by a fresh one.
    pub(crate) fn instantiate(&self, vars: &mut VarArena) -> PtQuery {
        let mut defined = BTreeSet::new();
        self.collect_defined(&mut defined);
        // Ascending ids visit dependencies before their dependents.
        let mut fresh: HashMap<VarId, VarId> = HashMap::new();
        for id in defined {
            let remap = |v: VarId| *fresh.get(&v).unwrap_or(&v);
            let def = match vars.get(id).clone() {
                VarDef::Let { name, expr, args } => VarDef::Let {
                    name,
                    expr,
                    args: args.into_iter().map(remap).collect(),
                },
                VarDef::Agg { input, kind } => VarDef::Agg {
                    input: input.map(remap),
                    kind,
                },
                observed => observed,
            };
            let new_id = vars.alloc(def);
            fresh.insert(id, new_id);
        }
        self.remap_vars(&|v| *fresh.get(&v).unwrap_or(&v))
    }

    fn remap_vars<F: Fn(VarId) -> VarId>(&self, f: &F) -> PtQuery {
        PtQuery {
            source: self.source.clone(),
            observed: self
                .observed
                .iter()
                .map(|(k, v)| (k.clone(), f(*v)))
                .collect(),
            happened_before: self
                .happened_before
                .iter()
                .map(|(k, q)| (k.clone(), Arc::new(q.remap_vars(f))))
                .collect(),
            short_vars: self.short_vars.clone(),
            constructed: self
                .constructed
                .iter()
                .map(|(k, v)| (k.clone(), f(*v)))
                .collect(),
            conditions: self
                .conditions
                .iter()
                .map(|c| WhereCondition {
                    expr: c.expr.clone(),
                    args: c.args.iter().map(|a| f(*a)).collect(),
                })
                .collect(),
            outputs: self.outputs.iter().map(|v| f(*v)).collect(),
            stage: match &self.stage {
                Stage::Select { selected } => Stage::Select {
                    selected: selected.iter().map(|v| f(*v)).collect(),
                },
                Stage::GroupBy {
                    group_by,
                    aggregates,
                } => Stage::GroupBy {
                    group_by: group_by.iter().map(|v| f(*v)).collect(),
                    aggregates: aggregates
                        .iter()
                        .map(|a| Aggregate {
                            var: f(a.var),
                            kind: a.kind,
                            input: a.input.map(f),
                        })
                        .collect(),
                },
                other => other.clone(),
            },
        }
    }
}

fn unknown_var(name: &str) -> PtqError {
    PtqError::Planning(format!("could not resolve variable '{name}'"))
}

/// Variable and alias names may not contain `.`, which separates hops.
pub fn valid_var_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('.') && !name.chars().any(char::is_whitespace)
}

/// Split `a.b.c` into `("a", "b.c")`.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    name.split_once('.')
        .filter(|(left, right)| !left.is_empty() && !right.is_empty())
}

/// Recognize `COUNT`, `COUNT()`, and `AGG(operand)`.
pub fn parse_aggregate(name: &str) -> Option<(AggKind, Option<&str>)> {
    if name.eq_ignore_ascii_case("COUNT") {
        return Some((AggKind::Count, None));
    }
    let (func, rest) = name.split_once('(')?;
    let operand = rest.strip_suffix(')')?.trim();
    let kind: AggKind = func.trim().parse().ok()?;
    match (kind, operand.is_empty()) {
        (AggKind::Count, true) => Some((kind, None)),
        (_, true) => None,
        (_, false) => Some((kind, Some(operand))),
    }
}
