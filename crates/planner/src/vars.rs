//! Variable arena.
//!
//! Variables are identified by their [`VarId`] handle, never by structure:
//! two lets with the same name and template are distinct variables. Query
//! rewrites move handles between stages; the definitions themselves are
//! never edited once allocated.

use std::fmt;

use crate::advice_spec::AggKind;

/// Opaque handle to a variable allocated in a [`VarArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarDef {
    /// A field exported by the tracepoint of the stage that observes it.
    Observed { source: String, field: String },
    /// A value computed from other variables by an expression template.
    Let {
        name: String,
        expr: String,
        args: Vec<VarId>,
    },
    /// Result of an aggregation; `input` is absent for `COUNT`.
    Agg { input: Option<VarId>, kind: AggKind },
}

#[derive(Debug, Clone, Default)]
pub struct VarArena {
    defs: Vec<VarDef>,
}

impl VarArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, def: VarDef) -> VarId {
        let id = VarId(self.defs.len() as u32);
        self.defs.push(def);
        id
    }

    /// Definition of `id`.
    ///
    /// Panics if `id` was allocated by another arena.
    pub fn get(&self, id: VarId) -> &VarDef {
        &self.defs[id.index()]
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Variables read by `id`.
    pub fn dependencies(&self, id: VarId) -> Vec<VarId> {
        match self.get(id) {
            VarDef::Observed { .. } => Vec::new(),
            VarDef::Let { args, .. } => args.clone(),
            VarDef::Agg { input, .. } => input.iter().copied().collect(),
        }
    }

    /// Short human-readable label, used for compiled names and explain output.
    pub fn label(&self, id: VarId) -> String {
        match self.get(id) {
            VarDef::Observed { field, .. } => field.clone(),
            VarDef::Let { name, .. } => name.clone(),
            VarDef::Agg { input: Some(input), kind } => {
                format!("{kind}({})", self.label(*input))
            }
            VarDef::Agg { input: None, kind } => kind.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{VarArena, VarDef};
    use crate::advice_spec::AggKind;

    #[test]
    fn identical_definitions_are_distinct_vars() {
        let mut vars = VarArena::new();
        let def = VarDef::Observed {
            source: "x".to_string(),
            field: "delta".to_string(),
        };
        let a = vars.alloc(def.clone());
        let b = vars.alloc(def);
        assert_ne!(a, b);
        assert_eq!(vars.get(a), vars.get(b));
    }

    #[test]
    fn labels_nest_through_aggregates() {
        let mut vars = VarArena::new();
        let delta = vars.alloc(VarDef::Observed {
            source: "x".to_string(),
            field: "delta".to_string(),
        });
        let sum = vars.alloc(VarDef::Agg {
            input: Some(delta),
            kind: AggKind::Sum,
        });
        let count = vars.alloc(VarDef::Agg {
            input: None,
            kind: AggKind::Count,
        });
        assert_eq!(vars.label(sum), "SUM(delta)");
        assert_eq!(vars.label(count), "COUNT");
        assert_eq!(vars.dependencies(sum), vec![delta]);
    }
}
