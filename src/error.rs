//! Plan Cache Error Types

use thiserror::Error;

/// Errors surfaced by the plan cache.
///
/// Everything here is best-effort from the caller's point of view: a failed
/// insert or cleanup never aborts the query, the caller just compiles fresh
/// and runs uncached.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// The plan codec collaborator rejected a serialize/deserialize request
    #[error("Plan codec error: {0}")]
    Codec(String),

    /// Allocation for an entry, clone, or heap failed
    #[error("Resource exhausted: {0}")]
    Exhausted(&'static str),

    /// The insert-or-recompile loop gave up after bounded retries
    #[error("Recompile contention on plan {0}: retries exhausted")]
    RecompileContention(String),
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

impl From<figment::Error> for CacheError {
    fn from(err: figment::Error) -> Self {
        CacheError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::Config("missing capacity".to_string());
        assert_eq!(format!("{err}"), "Configuration error: missing capacity");

        let err = CacheError::Exhausted("plan clone");
        assert_eq!(format!("{err}"), "Resource exhausted: plan clone");
    }
}
