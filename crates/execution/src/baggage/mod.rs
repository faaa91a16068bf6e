//! Baggage: the causally propagated container of bags.
//!
//! Every bag keeps its contents as a list of [`BagEntry`]s in two
//! generations. Packs write new ACTIVE entries; [`Baggage::split`] promotes
//! ACTIVE to ARCHIVE before handing a copy to a forked branch, and
//! [`Baggage::join`] unions entries of both branches. Entries are never
//! mutated after they are written, so a join is a set union keyed by entry
//! version and is commutative and associative. The storage discipline is
//! applied when a [`Bag`] reads the entries back.
//!
//! ACTIVE entries are never shared: `split` archives them before copying
//! and `join` consumes the other branch. A bag may therefore fold its
//! ACTIVE entries into one replacement entry on pack.

mod filtered;
mod grouped;
mod tuples;

use std::collections::{BTreeMap, HashSet};

use ptq_common::{BagId, Result};
use ptq_planner::BagSpec;
use serde::{Deserialize, Serialize};

use crate::value::Value;

pub use filtered::FilterBag;
pub use grouped::GroupedBag;
pub(crate) use grouped::Groups;
pub use tuples::TupleBag;

/// One fixed-arity tuple of values.
pub type Row = Vec<Value>;

/// Rows written by one pack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagEntry {
    /// One more than the largest clock visible in the bag at pack time.
    pub clock: u64,
    /// Random identity; breaks clock ties between concurrent branches.
    pub version: u64,
    /// Packed rows.
    pub rows: Vec<Row>,
}

impl BagEntry {
    fn order_key(&self) -> (u64, u64) {
        (self.clock, self.version)
    }
}

/// Which generation an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    /// Written since the last split.
    Active,
    /// Inherited from before the last split.
    Archive,
}

type Namespace = BTreeMap<BagId, Vec<BagEntry>>;

/// Per-request container of bags, owned by exactly one thread at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baggage {
    active: Namespace,
    archive: Namespace,
}

#[derive(Serialize, Deserialize)]
struct WireBag {
    bag: BagId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    active: Vec<BagEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    archive: Vec<BagEntry>,
}

impl Baggage {
    /// Empty baggage.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no bag holds any entry.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.archive.is_empty()
    }

    /// Ids of every bag with at least one entry.
    pub fn bag_ids(&self) -> Vec<BagId> {
        let mut ids: Vec<BagId> = self.active.keys().chain(self.archive.keys()).copied().collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Entries of `bag` across both generations, archive first.
    pub fn entries(&self, bag: BagId) -> impl Iterator<Item = (Generation, &BagEntry)> + '_ {
        let archived = self.archive.get(&bag).into_iter().flatten();
        let active = self.active.get(&bag).into_iter().flatten();
        archived
            .map(|e| (Generation::Archive, e))
            .chain(active.map(|e| (Generation::Active, e)))
    }

    /// Append a new ACTIVE entry holding `rows`.
    pub(crate) fn push(&mut self, bag: BagId, rows: Vec<Row>) {
        let entry = BagEntry {
            clock: self.next_clock(bag),
            version: fresh_version(),
            rows,
        };
        self.active.entry(bag).or_default().push(entry);
    }

    /// Replace the ACTIVE entries of `bag` with one entry holding `rows`.
    pub(crate) fn replace_active(&mut self, bag: BagId, rows: Vec<Row>) {
        let clock = self.next_clock(bag);
        self.active.insert(
            bag,
            vec![BagEntry {
                clock,
                version: fresh_version(),
                rows,
            }],
        );
    }

    /// Replace every entry of `bag`, in both generations, with one ACTIVE
    /// entry holding `rows`.
    pub(crate) fn supersede(&mut self, bag: BagId, rows: Vec<Row>) {
        let clock = self.next_clock(bag);
        self.archive.remove(&bag);
        self.active.insert(
            bag,
            vec![BagEntry {
                clock,
                version: fresh_version(),
                rows,
            }],
        );
    }

    fn next_clock(&self, bag: BagId) -> u64 {
        self.entries(bag).map(|(_, e)| e.clock).max().unwrap_or(0) + 1
    }

    /// Promote every ACTIVE entry to ARCHIVE.
    pub fn archive_active(&mut self) {
        for (bag, entries) in std::mem::take(&mut self.active) {
            self.archive.entry(bag).or_default().extend(entries);
        }
        normalize(&mut self.archive, None);
    }

    /// Fork: archive ACTIVE entries and return a copy for the new branch.
    pub fn split(&mut self) -> Baggage {
        self.archive_active();
        self.clone()
    }

    /// Merge a branch back in; the union of both generations.
    pub fn join(&mut self, other: Baggage) {
        for (bag, entries) in other.archive {
            self.archive.entry(bag).or_default().extend(entries);
        }
        for (bag, entries) in other.active {
            self.active.entry(bag).or_default().extend(entries);
        }
        normalize(&mut self.archive, None);
        let archived: HashSet<u64> = self
            .archive
            .values()
            .flatten()
            .map(|e| e.version)
            .collect();
        normalize(&mut self.active, Some(&archived));
    }

    /// JSON wire form; one record per bag.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire: Vec<WireBag> = self
            .bag_ids()
            .into_iter()
            .map(|bag| WireBag {
                bag,
                active: self.active.get(&bag).cloned().unwrap_or_default(),
                archive: self.archive.get(&bag).cloned().unwrap_or_default(),
            })
            .collect();
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Inverse of [`Baggage::to_bytes`]; empty input is empty baggage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Baggage> {
        let mut baggage = Baggage::new();
        if bytes.is_empty() {
            return Ok(baggage);
        }
        let wire: Vec<WireBag> = serde_json::from_slice(bytes)?;
        for w in wire {
            if !w.active.is_empty() {
                baggage.active.entry(w.bag).or_default().extend(w.active);
            }
            if !w.archive.is_empty() {
                baggage.archive.entry(w.bag).or_default().extend(w.archive);
            }
        }
        let archived: HashSet<u64> = baggage
            .archive
            .values()
            .flatten()
            .map(|e| e.version)
            .collect();
        normalize(&mut baggage.archive, None);
        normalize(&mut baggage.active, Some(&archived));
        Ok(baggage)
    }
}

/// Deduplicate entries by version, drop `exclude`d versions, and order by
/// (clock, version).
fn normalize(ns: &mut Namespace, exclude: Option<&HashSet<u64>>) {
    ns.retain(|_, entries| {
        let mut seen = HashSet::new();
        entries.retain(|e| {
            seen.insert(e.version) && !exclude.is_some_and(|ex| ex.contains(&e.version))
        });
        entries.sort_by_key(BagEntry::order_key);
        !entries.is_empty()
    });
}

fn fresh_version() -> u64 {
    uuid::Uuid::new_v4().as_u128() as u64
}

/// A storage discipline over one bag id.
pub trait Bag: Send + Sync {
    /// The bag this instance reads and writes.
    fn bag_id(&self) -> BagId;

    /// Store `rows` into the ACTIVE generation; returns how many rows were
    /// accepted. Invalid rows are dropped silently.
    fn pack(&self, baggage: &mut Baggage, rows: Vec<Row>) -> usize;

    /// Effective contents across both generations.
    fn unpack(&self, baggage: &Baggage) -> Vec<Row>;
}

/// Bag that packs nothing and unpacks nothing.
#[derive(Debug, Clone, Copy)]
pub struct DisabledBag {
    bag_id: BagId,
}

impl Bag for DisabledBag {
    fn bag_id(&self) -> BagId {
        self.bag_id
    }

    fn pack(&self, _baggage: &mut Baggage, _rows: Vec<Row>) -> usize {
        0
    }

    fn unpack(&self, _baggage: &Baggage) -> Vec<Row> {
        Vec::new()
    }
}

/// Storage discipline for `spec`, or a [`DisabledBag`] when baggage is off.
pub fn create_bag(bag_id: BagId, spec: &BagSpec, enabled: bool) -> Box<dyn Bag> {
    if !enabled {
        return Box::new(DisabledBag { bag_id });
    }
    match spec {
        BagSpec::Tuple(t) => Box::new(TupleBag::new(bag_id, t.vars.len())),
        BagSpec::Filter(f) => Box::new(FilterBag::new(bag_id, f.kind, f.vars.len())),
        BagSpec::GroupBy(g) => Box::new(GroupedBag::new(
            bag_id,
            g.group_by.len(),
            g.aggregates.iter().map(|a| a.how).collect(),
        )),
    }
}
