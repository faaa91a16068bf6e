use serde::{Deserialize, Serialize};

/// Fields every instrumented program point can export without extra work.
pub const DEFAULT_EXPORTS: [&str; 6] = [
    "host",
    "timestamp",
    "cpu",
    "thread_id",
    "proc_id",
    "proc_name",
];

/// A named, instrumented program location and the fields it exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracepoint {
    pub name: String,
    pub exports: Vec<String>,
}

impl Tracepoint {
    pub fn new<I, S>(name: impl Into<String>, exports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            exports: exports.into_iter().map(Into::into).collect(),
        }
    }

    /// Same as [`Tracepoint::new`] with [`DEFAULT_EXPORTS`] appended.
    pub fn with_default_exports<I, S>(name: impl Into<String>, exports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tp = Self::new(name, exports);
        for field in DEFAULT_EXPORTS {
            if !tp.exports(field) {
                tp.exports.push(field.to_string());
            }
        }
        tp
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exports(&self, field: &str) -> bool {
        self.exports.iter().any(|e| e == field)
    }
}
