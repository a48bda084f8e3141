//! Error taxonomy for the build engine.
//!
//! Every public, build-facing operation returns [`Result<T>`]. The variants of [`Error`]
//! correspond to the kinds a caller needs to branch on (is this retryable? should it abort the
//! whole invocation?) rather than to implementation details.

use std::path::PathBuf;

use crate::alias::BuildAlias;

/// Convenience alias used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A categorized build error.
///
/// `CacheError` never reaches this enum from inside [`crate::cache`] — cache failures are
/// degraded to a miss (read) or a logged warning (write) at the source, per the cache's own
/// failure semantics. It is still a first-class variant here because the cache module is
/// permitted to surface a `CacheError` when asked to report *why* it degraded, e.g. in
/// diagnostics or `--show-output`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown platform/config/module, malformed alias, missing archetype.
    #[error("configuration error: {message}{}", suggestion.as_deref().map(|s| format!(" (did you mean `{s}`?)")).unwrap_or_default())]
    Configuration {
        message: String,
        suggestion: Option<String>,
    },

    /// A required dependency is not present in the graph, or a cycle was discovered.
    #[error("dependency error: `{from}` depends on `{to}`, which {reason}")]
    Dependency {
        from: BuildAlias,
        to: BuildAlias,
        reason: String,
    },

    /// An action's subprocess exited non-zero.
    #[error("compile error running `{command}`: {stderr}")]
    Compile { command: String, stderr: String },

    /// Cache read/write or archive corruption. Recoverable by construction; surfaced only when
    /// a caller explicitly asks why a cache operation degraded.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Missing input file, permission denied, or any other `std::io::Error` tied to a path.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The build context was cancelled.
    #[error("build cancelled")]
    Cancelled,
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into(), suggestion: None }
    }

    pub fn configuration_with_suggestion(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Configuration { message: message.into(), suggestion: Some(suggestion.into()) }
    }

    pub fn dependency(from: BuildAlias, to: BuildAlias, reason: impl Into<String>) -> Self {
        Self::Dependency { from, to, reason: reason.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// Narrower error type for the action cache, analogous to the way lower-level modules in the
/// source tree (e.g. `compile::project::MaybeCompilerError`) keep their own error enum and fold
/// it into the crate-wide one via `#[from]` rather than inlining every variant at the top level.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache entry corrupted at {path}")]
    Corrupt { path: PathBuf },

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
