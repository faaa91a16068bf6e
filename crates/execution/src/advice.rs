//! Interpreter for one compiled [`AdviceSpec`].
//!
//! An [`Advice`] resolves every name of its spec to a slot in a flat row once,
//! at construction. Each invocation then builds the candidate rows (observed
//! values crossed with every unpacked bag), evaluates lets and wheres per row,
//! and delivers the survivors to its bag or emit sink.

use std::collections::HashMap;
use std::sync::Arc;

use ptq_common::{PtqError, Result};
use ptq_planner::{AdviceSpec, AggKind, BagSpec, OutputSpec};
use tracing::{trace, warn};

use crate::baggage::{create_bag, Bag, Baggage, Row};
use crate::emit::{Emit, EmitRegistry};
use crate::expressions::{ExprError, TemplateExpr};
use crate::value::Value;

/// Row counts of one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdviceStats {
    /// Candidate rows built from observed and unpacked values.
    pub rows_in: usize,
    /// Rows dropped by a failing let, or a where that failed or was false.
    pub rows_dropped: usize,
    /// Rows accepted by the bag or emit sink.
    pub rows_out: usize,
}

struct Unpacker {
    bag: Box<dyn Bag>,
    slots: Vec<usize>,
}

struct Template {
    expr: std::result::Result<TemplateExpr, ExprError>,
    args: Vec<usize>,
}

impl Template {
    fn eval(&self, row: &[Value]) -> std::result::Result<Value, ExprError> {
        let expr = self.expr.as_ref().map_err(Clone::clone)?;
        let args: Vec<&Value> = self.args.iter().map(|&i| &row[i]).collect();
        expr.eval(&args)
    }

    fn test(&self, row: &[Value]) -> std::result::Result<bool, ExprError> {
        Ok(matches!(self.eval(row)?, Value::Bool(true)))
    }
}

enum Output {
    Pack(Box<dyn Bag>),
    Emit(Arc<dyn Emit>),
}

/// Executable form of an [`AdviceSpec`].
pub struct Advice {
    spec: AdviceSpec,
    width: usize,
    unpacks: Vec<Unpacker>,
    lets: Vec<(usize, Template)>,
    wheres: Vec<Template>,
    projection: Vec<Option<usize>>,
    output: Output,
}

impl std::fmt::Debug for Advice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advice").field("spec", &self.spec).finish()
    }
}

/// Name to slot bindings while an advice is being built.
#[derive(Default)]
struct Slots {
    by_name: HashMap<String, usize>,
}

impl Slots {
    fn bind(&mut self, name: &str) -> Result<usize> {
        let slot = self.by_name.len();
        if self.by_name.insert(name.to_string(), slot).is_some() {
            return Err(PtqError::InvalidAdvice(format!("'{name}' is bound twice")));
        }
        Ok(slot)
    }

    fn lookup(&self, name: &str, context: &str) -> Result<usize> {
        self.by_name.get(name).copied().ok_or_else(|| {
            PtqError::InvalidAdvice(format!("{context} references unbound '{name}'"))
        })
    }

    fn lookup_all(&self, names: &[String], context: &str) -> Result<Vec<usize>> {
        names.iter().map(|n| self.lookup(n, context)).collect()
    }
}

fn template(expr: &str) -> std::result::Result<TemplateExpr, ExprError> {
    let parsed = TemplateExpr::parse(expr);
    if let Err(e) = &parsed {
        warn!(template = expr, error = %e, "template does not parse; every row will be dropped");
    }
    parsed
}

impl Advice {
    /// Bind every name in `spec` and create its bags and emit sink.
    ///
    /// Fails with [`PtqError::InvalidAdvice`] when a let, where, or output
    /// references a name that no observe, unpack, or earlier let binds.
    /// Templates that do not parse are not an error; they drop rows.
    pub fn new(spec: &AdviceSpec, emits: &EmitRegistry, baggage_enabled: bool) -> Result<Self> {
        let mut slots = Slots::default();
        for name in &spec.observe {
            slots.bind(name)?;
        }

        let mut unpacks = Vec::with_capacity(spec.unpack.len());
        for u in &spec.unpack {
            let names = u.bag.names();
            let bound = names
                .iter()
                .map(|n| slots.bind(n))
                .collect::<Result<Vec<_>>>()?;
            unpacks.push(Unpacker {
                bag: create_bag(u.bag_id, &u.bag, baggage_enabled),
                slots: bound,
            });
        }

        let mut lets = Vec::with_capacity(spec.lets.len());
        for l in &spec.lets {
            let args = slots.lookup_all(&l.args, &format!("let {}", l.name))?;
            let slot = slots.bind(&l.name)?;
            lets.push((
                slot,
                Template {
                    expr: template(&l.expr),
                    args,
                },
            ));
        }

        let mut wheres = Vec::with_capacity(spec.wheres.len());
        for w in &spec.wheres {
            wheres.push(Template {
                args: slots.lookup_all(&w.args, &format!("where {}", w.expr))?,
                expr: template(&w.expr),
            });
        }

        let (projection, output) = match &spec.output {
            OutputSpec::Pack { bag_id, bag } => (
                project(&slots, bag, "pack")?,
                Output::Pack(create_bag(*bag_id, bag, baggage_enabled)),
            ),
            OutputSpec::Emit { output_id, bag } => (
                project(&slots, bag, "emit")?,
                Output::Emit(emits.create(*output_id, bag)),
            ),
        };

        Ok(Self {
            spec: spec.clone(),
            width: slots.by_name.len(),
            unpacks,
            lets,
            wheres,
            projection,
            output,
        })
    }

    /// The spec this advice executes.
    pub fn spec(&self) -> &AdviceSpec {
        &self.spec
    }

    /// Run once for one tracepoint invocation.
    ///
    /// `observed[i]` is the value of `spec().observe[i]`; missing values are
    /// null. Never fails: rows that cannot be evaluated are dropped.
    pub fn advise(&self, baggage: &mut Baggage, observed: &[Value]) -> AdviceStats {
        let unpacked: Vec<Vec<Row>> = self
            .unpacks
            .iter()
            .map(|u| {
                let mut rows = u.bag.unpack(baggage);
                rows.retain(|r| r.len() == u.slots.len());
                rows
            })
            .collect();

        let mut stats = AdviceStats {
            rows_in: unpacked.iter().map(Vec::len).product(),
            ..AdviceStats::default()
        };

        let mut base = vec![Value::Null; self.width];
        for (slot, v) in base.iter_mut().zip(observed) {
            *slot = v.clone();
        }

        let mut survivors = Vec::new();
        for index in 0..stats.rows_in {
            let mut row = base.clone();
            // Mixed-radix decomposition of `index` over the unpacked bags.
            let mut rest = index;
            for (u, rows) in self.unpacks.iter().zip(&unpacked) {
                let picked = &rows[rest % rows.len()];
                rest /= rows.len();
                for (&slot, v) in u.slots.iter().zip(picked) {
                    row[slot] = v.clone();
                }
            }

            match self.evaluate(&mut row) {
                Ok(true) => survivors.push(
                    self.projection
                        .iter()
                        .map(|s| s.map_or(Value::Null, |i| row[i].clone()))
                        .collect::<Row>(),
                ),
                Ok(false) => stats.rows_dropped += 1,
                Err(e) => {
                    trace!(error = %e, "dropped row");
                    stats.rows_dropped += 1;
                }
            }
        }

        if !survivors.is_empty() {
            stats.rows_out = match &self.output {
                Output::Pack(bag) => bag.pack(baggage, survivors),
                Output::Emit(sink) => sink.emit(survivors),
            };
        }
        stats
    }

    /// Lets then wheres; `Ok(false)` when a where rejects the row.
    fn evaluate(&self, row: &mut [Value]) -> std::result::Result<bool, ExprError> {
        for (slot, t) in &self.lets {
            let value = t.eval(row)?;
            row[*slot] = value;
        }
        for w in &self.wheres {
            if !w.test(row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Slots of the values an output bag receives. A COUNT operand need not be
/// bound; it is delivered as null.
fn project(slots: &Slots, bag: &BagSpec, context: &str) -> Result<Vec<Option<usize>>> {
    match bag {
        BagSpec::GroupBy(g) => {
            let mut projection = Vec::with_capacity(bag.arity());
            for key in &g.group_by {
                projection.push(Some(slots.lookup(key, context)?));
            }
            for a in &g.aggregates {
                projection.push(match a.how {
                    AggKind::Count => slots.by_name.get(&a.name).copied(),
                    _ => Some(slots.lookup(&a.name, context)?),
                });
            }
            Ok(projection)
        }
        _ => bag
            .names()
            .into_iter()
            .map(|n| slots.lookup(n, context).map(Some))
            .collect(),
    }
}
