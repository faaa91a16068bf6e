use indexmap::IndexMap;
use ptq_common::BagId;
use ptq_planner::AggKind;
use tracing::trace;

use super::{Bag, Baggage, Generation, Row};
use crate::value::Value;

/// Running aggregates keyed by group-key tuple.
///
/// Raw rows are `[keys.., operands..]`; partial rows have the same layout
/// with aggregate results in place of operands. Both fold with each kind's
/// combiner, so a partial COUNT is summed.
///
/// Keys compare as typed values: `Int(1)` and `Str("1")` are distinct groups.
#[derive(Debug, Clone)]
pub(crate) struct Groups {
    keys: usize,
    kinds: Vec<AggKind>,
    groups: IndexMap<Vec<Value>, Vec<i64>>,
}

impl Groups {
    pub(crate) fn new(keys: usize, kinds: Vec<AggKind>) -> Self {
        Self {
            keys,
            kinds,
            groups: IndexMap::new(),
        }
    }

    /// Fold one raw row. COUNT ignores its operand; other aggregates need an
    /// integer operand. Returns false when the row is dropped.
    pub(crate) fn observe(&mut self, row: &[Value]) -> bool {
        self.fold(row, true)
    }

    /// Fold one partial row produced by [`Groups::into_rows`].
    pub(crate) fn combine(&mut self, row: &[Value]) -> bool {
        self.fold(row, false)
    }

    fn fold(&mut self, row: &[Value], raw: bool) -> bool {
        if row.len() != self.keys + self.kinds.len() {
            return false;
        }
        let (key, operands) = row.split_at(self.keys);
        let mut values = Vec::with_capacity(operands.len());
        for (kind, v) in self.kinds.iter().zip(operands) {
            let value = match kind {
                AggKind::Count if raw => Some(1),
                _ => v.as_i64(),
            };
            match value {
                Some(x) => values.push(x),
                None => return false,
            }
        }

        match self.groups.get_mut(key) {
            Some(acc) => {
                for ((a, x), kind) in acc.iter_mut().zip(values).zip(&self.kinds) {
                    *a = match kind.combiner() {
                        AggKind::Min => (*a).min(x),
                        AggKind::Max => (*a).max(x),
                        _ => a.wrapping_add(x),
                    };
                }
            }
            None => {
                self.groups.insert(key.to_vec(), values);
            }
        }
        true
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub(crate) fn into_rows(self) -> Vec<Row> {
        self.groups
            .into_iter()
            .map(|(mut key, aggs)| {
                key.extend(aggs.into_iter().map(Value::Int));
                key
            })
            .collect()
    }
}

/// One aggregate row per distinct group key.
///
/// Each pack folds its batch into the ACTIVE partial aggregate and rewrites
/// it as a single entry; unpack combines the partials of every entry in
/// both generations.
#[derive(Debug, Clone)]
pub struct GroupedBag {
    bag_id: BagId,
    keys: usize,
    kinds: Vec<AggKind>,
}

impl GroupedBag {
    /// Bag grouping on the first `keys` values of each row and aggregating
    /// the rest with `kinds`. No kinds means a deduplicated key set.
    pub fn new(bag_id: BagId, keys: usize, kinds: Vec<AggKind>) -> Self {
        Self {
            bag_id,
            keys,
            kinds,
        }
    }

    fn groups(&self) -> Groups {
        Groups::new(self.keys, self.kinds.clone())
    }
}

impl Bag for GroupedBag {
    fn bag_id(&self) -> BagId {
        self.bag_id
    }

    fn pack(&self, baggage: &mut Baggage, rows: Vec<Row>) -> usize {
        let mut batch = self.groups();
        let mut accepted = 0;
        for row in &rows {
            if batch.observe(row) {
                accepted += 1;
            } else {
                trace!(bag = %self.bag_id, ?row, "dropped row with invalid group operand");
            }
        }
        if batch.is_empty() {
            return 0;
        }

        let mut merged = self.groups();
        for (_, entry) in baggage
            .entries(self.bag_id)
            .filter(|(g, _)| *g == Generation::Active)
        {
            for row in &entry.rows {
                merged.combine(row);
            }
        }
        for row in batch.into_rows() {
            merged.combine(&row);
        }
        baggage.replace_active(self.bag_id, merged.into_rows());
        accepted
    }

    fn unpack(&self, baggage: &Baggage) -> Vec<Row> {
        let mut groups = self.groups();
        for (_, entry) in baggage.entries(self.bag_id) {
            for row in &entry.rows {
                groups.combine(row);
            }
        }
        groups.into_rows()
    }
}
