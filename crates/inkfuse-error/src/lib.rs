//! Stable error kinds for the InkFuse engine.
//!
//! Every layer of the engine reports failures through [`InkFuseError`]; the
//! variants are the stable vocabulary the executor and its callers dispatch
//! on, not incidental class names.  Decay-time errors surface synchronously
//! to the query builder, runtime errors abort the owning pipeline, and
//! cancellation of a background compile is swallowed by the hybrid arbiter.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Debug, Error)]
pub enum InkFuseError {
    /// The external C compiler exited non-zero or produced no artifact.
    #[error("C compiler failed: {0}")]
    CompilerError(String),

    /// A symbol was missing from a compiled artifact.
    #[error("symbol `{0}` not found in compiled artifact")]
    LinkError(String),

    /// The query uses a feature the engine does not implement.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A text row did not match the relation schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A hash table resized while the aggregation merger was inserting.
    /// Merge tables must be sized ex ante; this indicates a planning bug.
    #[error("hash table resize during aggregation merge")]
    ResizeDuringMerge,

    /// A background compile was cancelled. Not a failure; the hybrid
    /// arbiter observes and swallows it.
    #[error("background job interrupted")]
    Interrupted,

    /// Invariant violation inside the engine (missing IU producer, split
    /// strong link, unbalanced codegen blocks).  Aborts the pipeline.
    #[error("internal error: {0}")]
    Internal(String),

    /// OS-level failure from the backend or ingest path.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, InkFuseError>;

impl InkFuseError {
    /// Build an [`InkFuseError::Internal`] from anything displayable.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Build an [`InkFuseError::Unsupported`] from anything displayable.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = InkFuseError::LinkError("execute".into());
        assert_eq!(
            err.to_string(),
            "symbol `execute` not found in compiled artifact"
        );
    }

    #[test]
    fn io_errors_convert() {
        fn fails() -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(InkFuseError::Io(_))));
    }
}
