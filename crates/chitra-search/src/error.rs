use thiserror::Error;

/// Error taxonomy for the search engine.
///
/// Callers match on these three kinds; errors from the inference backend are
/// always wrapped with context and never surface as their own types.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Configuration invalid, snapshot missing or inconsistent, or the model
    /// failed to load. Fatal to the engine instance: the value is never
    /// produced, and the caller may retry construction from scratch.
    #[error("initialization failed: {0:#}")]
    Initialization(anyhow::Error),

    /// Caller-supplied input violates the query contract. Recoverable; the
    /// engine state is unaffected.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Encode/rank failure after input validation passed. Recoverable at the
    /// request level; the engine remains usable.
    #[error("search failed: {0:#}")]
    Search(anyhow::Error),
}
