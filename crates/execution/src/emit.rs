//! Emit sinks: where the root unit of a query delivers its rows.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use ptq_common::QueryId;
use ptq_planner::BagSpec;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::baggage::{Groups, Row};

/// Rows reported for one query over one reporting interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResults {
    /// Query the rows belong to.
    pub output_id: QueryId,
    /// Collection time, milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// Reporting interval the rows were accumulated over.
    pub interval_ms: u64,
    /// Raw emitted tuples (select queries).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tuples: Vec<Row>,
    /// One row per group, keys then aggregates (groupby queries).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<Row>,
}

/// Accumulates emitted rows until the next collection.
pub trait Emit: Send + Sync {
    /// Query whose results this sink accumulates.
    fn output_id(&self) -> QueryId;

    /// Accept rows from one advice invocation; returns how many were kept.
    fn emit(&self, rows: Vec<Row>) -> usize;

    /// Drain pending rows. `None` when nothing is pending and empty reports
    /// are disabled.
    fn collect(&self, timestamp_ms: u64, interval_ms: u64) -> Option<QueryResults>;
}

/// Sink keeping every emitted row.
#[derive(Debug)]
pub struct EmitTuples {
    output_id: QueryId,
    arity: usize,
    report_empty: bool,
    pending: Mutex<Vec<Row>>,
}

impl EmitTuples {
    /// Sink for rows of `arity` values.
    pub fn new(output_id: QueryId, arity: usize, report_empty: bool) -> Self {
        Self {
            output_id,
            arity,
            report_empty,
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl Emit for EmitTuples {
    fn output_id(&self) -> QueryId {
        self.output_id
    }

    fn emit(&self, rows: Vec<Row>) -> usize {
        let mut pending = self.pending.lock().expect("emit sink lock poisoned");
        let before = pending.len();
        pending.extend(rows.into_iter().filter(|r| r.len() == self.arity));
        pending.len() - before
    }

    fn collect(&self, timestamp_ms: u64, interval_ms: u64) -> Option<QueryResults> {
        let tuples = std::mem::take(&mut *self.pending.lock().expect("emit sink lock poisoned"));
        if tuples.is_empty() && !self.report_empty {
            return None;
        }
        Some(QueryResults {
            output_id: self.output_id,
            timestamp_ms,
            interval_ms,
            tuples,
            groups: Vec::new(),
        })
    }
}

/// Sink aggregating emitted rows per group, with grouped-bag semantics.
#[derive(Debug)]
pub struct EmitGrouped {
    output_id: QueryId,
    report_empty: bool,
    template: Groups,
    pending: Mutex<Groups>,
}

impl EmitGrouped {
    /// Sink grouping on `spec`'s keys and aggregating its aggregates.
    pub fn new(output_id: QueryId, spec: &ptq_planner::GroupBySpec, report_empty: bool) -> Self {
        let template = Groups::new(
            spec.group_by.len(),
            spec.aggregates.iter().map(|a| a.how).collect(),
        );
        Self {
            output_id,
            report_empty,
            pending: Mutex::new(template.clone()),
            template,
        }
    }
}

impl Emit for EmitGrouped {
    fn output_id(&self) -> QueryId {
        self.output_id
    }

    fn emit(&self, rows: Vec<Row>) -> usize {
        let mut groups = self.pending.lock().expect("emit sink lock poisoned");
        let mut kept = 0;
        for row in &rows {
            if groups.observe(row) {
                kept += 1;
            } else {
                trace!(output = %self.output_id, ?row, "dropped row with invalid group operand");
            }
        }
        kept
    }

    fn collect(&self, timestamp_ms: u64, interval_ms: u64) -> Option<QueryResults> {
        let groups = std::mem::replace(
            &mut *self.pending.lock().expect("emit sink lock poisoned"),
            self.template.clone(),
        );
        if groups.is_empty() && !self.report_empty {
            return None;
        }
        Some(QueryResults {
            output_id: self.output_id,
            timestamp_ms,
            interval_ms,
            tuples: Vec::new(),
            groups: groups.into_rows(),
        })
    }
}

/// Live emit sinks keyed by query id.
#[derive(Default)]
pub struct EmitRegistry {
    report_empty: bool,
    interval_ms: u64,
    sinks: RwLock<BTreeMap<QueryId, Arc<dyn Emit>>>,
}

impl EmitRegistry {
    /// Registry whose sinks report empty intervals when `report_empty` is set
    /// and stamp results with `interval_ms`.
    pub fn new(report_empty: bool, interval_ms: u64) -> Self {
        Self {
            report_empty,
            interval_ms,
            sinks: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create (or replace) the sink for `output_id` shaped by `spec`.
    pub fn create(&self, output_id: QueryId, spec: &BagSpec) -> Arc<dyn Emit> {
        let sink: Arc<dyn Emit> = match spec {
            BagSpec::GroupBy(g) => Arc::new(EmitGrouped::new(output_id, g, self.report_empty)),
            other => Arc::new(EmitTuples::new(output_id, other.arity(), self.report_empty)),
        };
        self.sinks
            .write()
            .expect("emit registry lock poisoned")
            .insert(output_id, Arc::clone(&sink));
        sink
    }

    /// Remove the sink for `output_id`; returns whether one existed.
    pub fn destroy(&self, output_id: QueryId) -> bool {
        self.sinks
            .write()
            .expect("emit registry lock poisoned")
            .remove(&output_id)
            .is_some()
    }

    /// Look up the sink for `output_id`.
    pub fn get(&self, output_id: QueryId) -> Option<Arc<dyn Emit>> {
        self.sinks
            .read()
            .expect("emit registry lock poisoned")
            .get(&output_id)
            .cloned()
    }

    /// Drain every sink, in query id order.
    pub fn collect(&self, timestamp_ms: u64) -> Vec<QueryResults> {
        let sinks: Vec<Arc<dyn Emit>> = self
            .sinks
            .read()
            .expect("emit registry lock poisoned")
            .values()
            .cloned()
            .collect();
        sinks
            .iter()
            .filter_map(|s| s.collect(timestamp_ms, self.interval_ms))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ptq_common::QueryId;
    use ptq_planner::{AggKind, AggregateSpec, BagSpec, GroupBySpec, TupleSpec};

    use super::EmitRegistry;
    use crate::value::Value;

    #[test]
    fn tuples_drain_on_collect() {
        let registry = EmitRegistry::new(false, 500);
        let sink = registry.create(
            QueryId(3),
            &BagSpec::Tuple(TupleSpec {
                vars: vec!["a".to_string()],
            }),
        );
        assert_eq!(sink.emit(vec![vec![Value::Int(1)], vec![]]), 1);
        let results = registry.collect(10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tuples, vec![vec![Value::Int(1)]]);
        assert_eq!(results[0].timestamp_ms, 10);
        assert_eq!(results[0].interval_ms, 500);
        assert!(registry.collect(20).is_empty());
    }

    #[test]
    fn grouped_sink_aggregates_and_reports_empty() {
        let registry = EmitRegistry::new(true, 1000);
        let spec = BagSpec::GroupBy(GroupBySpec {
            group_by: vec!["host".to_string()],
            aggregates: vec![AggregateSpec {
                name: "delta".to_string(),
                how: AggKind::Sum,
            }],
        });
        let sink = registry.create(QueryId(1), &spec);
        sink.emit(vec![
            vec![Value::from("a"), Value::Int(2)],
            vec![Value::from("a"), Value::from("3")],
            vec![Value::from("b"), Value::from("x")],
        ]);
        let results = registry.collect(0);
        assert_eq!(results[0].groups, vec![vec![Value::from("a"), Value::Int(5)]]);

        let empty = registry.collect(1);
        assert_eq!(empty.len(), 1);
        assert!(empty[0].groups.is_empty());

        assert!(registry.destroy(QueryId(1)));
        assert!(registry.collect(2).is_empty());
    }
}
