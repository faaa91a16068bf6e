use ptq_common::BagId;
use tracing::trace;

use super::{Bag, Baggage, Generation, Row};

/// Multiset of fixed-arity rows.
#[derive(Debug, Clone)]
pub struct TupleBag {
    bag_id: BagId,
    arity: usize,
}

impl TupleBag {
    /// Bag storing rows of exactly `arity` values.
    pub fn new(bag_id: BagId, arity: usize) -> Self {
        Self { bag_id, arity }
    }
}

impl Bag for TupleBag {
    fn bag_id(&self) -> BagId {
        self.bag_id
    }

    fn pack(&self, baggage: &mut Baggage, rows: Vec<Row>) -> usize {
        let offered = rows.len();
        let rows: Vec<Row> = rows.into_iter().filter(|r| r.len() == self.arity).collect();
        if rows.len() < offered {
            trace!(bag = %self.bag_id, dropped = offered - rows.len(), "tuple arity mismatch");
        }
        let accepted = rows.len();
        if accepted > 0 {
            baggage.push(self.bag_id, rows);
        }
        accepted
    }

    fn unpack(&self, baggage: &Baggage) -> Vec<Row> {
        let mut rows = Vec::new();
        for wanted in [Generation::Active, Generation::Archive] {
            for (_, entry) in baggage.entries(self.bag_id).filter(|(g, _)| *g == wanted) {
                rows.extend(entry.rows.iter().filter(|r| r.len() == self.arity).cloned());
            }
        }
        rows
    }
}
