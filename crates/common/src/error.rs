use thiserror::Error;

/// Canonical PTQ error taxonomy used across crates.
///
/// Classification guidance:
/// - [`PtqError::Parse`]: malformed textual query (token sequence, keywords)
/// - [`PtqError::Planning`]: query shape/name issues discovered while building or compiling
/// - [`PtqError::InvalidAdvice`]: a compiled plan that cannot be instantiated
/// - [`PtqError::InvalidConfig`]: config file/environment contract violations
/// - [`PtqError::Unsupported`]: well-formed requests for behavior the engine does not offer
/// - [`PtqError::Io`] / [`PtqError::Json`]: raw std IO and serde_json failures
#[derive(Debug, Error)]
pub enum PtqError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - config file that does not deserialize into `EngineConfig`
    /// - unknown CLI option values
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Textual query grammar failures.
    ///
    /// Examples:
    /// - `join` line without `on x -> y`
    /// - `groupby` not followed by a `select`
    #[error("parse error: {0}")]
    Parse(String),

    /// Query building, optimization, or compilation failures.
    ///
    /// Examples:
    /// - unknown variable in `where`/`let`/`select`
    /// - variable name already observed, constructed, or used as a join alias
    /// - `let` on a stage that already selected or grouped
    #[error("planning error: {0}")]
    Planning(String),

    /// Compiled advice that references names it never binds.
    ///
    /// Examples:
    /// - emit spec naming a variable absent from observe/unpack/let
    /// - where or let argument that no earlier entry binds
    #[error("invalid advice: {0}")]
    InvalidAdvice(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Baggage, spec, or config (de)serialization failures.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Valid request for a shape the engine does not implement.
    ///
    /// Examples:
    /// - emitting from a `Filter` stage
    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Standard PTQ result alias.
pub type Result<T> = std::result::Result<T, PtqError>;
