use ptq_common::BagId;
use ptq_planner::FilterKind;

use super::{Bag, BagEntry, Baggage, Row};

/// Holds at most one logical row: the first ever packed, or the latest.
///
/// Entries are ordered by (clock, version). `FIRST` reads the smallest and
/// refuses packs once any entry exists; `MOST_RECENT` reads the largest and
/// replaces every entry of the bag on each pack.
#[derive(Debug, Clone)]
pub struct FilterBag {
    bag_id: BagId,
    kind: FilterKind,
    arity: usize,
}

impl FilterBag {
    /// Filter bag of `kind` over rows of `arity` values.
    pub fn new(bag_id: BagId, kind: FilterKind, arity: usize) -> Self {
        Self {
            bag_id,
            kind,
            arity,
        }
    }

    fn chosen<'a>(&self, baggage: &'a Baggage) -> Option<&'a BagEntry> {
        let entries = baggage
            .entries(self.bag_id)
            .map(|(_, e)| e)
            .filter(|e| e.rows.first().is_some_and(|r| r.len() == self.arity));
        match self.kind {
            FilterKind::First => entries.min_by_key(|e| e.order_key()),
            FilterKind::MostRecent => entries.max_by_key(|e| e.order_key()),
        }
    }
}

impl Bag for FilterBag {
    fn bag_id(&self) -> BagId {
        self.bag_id
    }

    fn pack(&self, baggage: &mut Baggage, rows: Vec<Row>) -> usize {
        let mut valid = rows.into_iter().filter(|r| r.len() == self.arity);
        match self.kind {
            FilterKind::First => {
                if self.chosen(baggage).is_some() {
                    return 0;
                }
                match valid.next() {
                    Some(row) => {
                        baggage.push(self.bag_id, vec![row]);
                        1
                    }
                    None => 0,
                }
            }
            FilterKind::MostRecent => match valid.last() {
                Some(row) => {
                    baggage.supersede(self.bag_id, vec![row]);
                    1
                }
                None => 0,
            },
        }
    }

    fn unpack(&self, baggage: &Baggage) -> Vec<Row> {
        self.chosen(baggage)
            .and_then(|e| e.rows.first().cloned())
            .into_iter()
            .collect()
    }
}
