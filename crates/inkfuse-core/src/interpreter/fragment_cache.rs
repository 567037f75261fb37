//! The process-wide fragment cache.
//!
//! Populated once, on first use: the whole fragment library is lowered into
//! a single C translation unit, compiled into one shared object, and every
//! fragment symbol is resolved up front.  Afterwards the cache is an
//! immutable map from suboperator identifier to function pointer.

use std::sync::OnceLock;
use std::time::Instant;

use hashbrown::HashMap;
use inkfuse_backend_c::{BackendConfig, CompiledArtifact, InterruptableJob, PipelineFn};
use inkfuse_error::{InkFuseError, Result};

use crate::interpreter::fragment_gen::build_fragment_program;

static CACHE: OnceLock<std::result::Result<FragmentCache, String>> = OnceLock::new();

/// Immutable map from fragment identifier to compiled primitive.
pub struct FragmentCache {
    /// Keeps the shared object mapped for the process lifetime.
    _artifact: CompiledArtifact,
    fragments: HashMap<String, PipelineFn>,
}

impl FragmentCache {
    /// The process-wide cache, populating it on first call.
    pub fn get() -> Result<&'static FragmentCache> {
        match CACHE.get_or_init(FragmentCache::populate) {
            Ok(cache) => Ok(cache),
            Err(msg) => Err(InkFuseError::CompilerError(msg.clone())),
        }
    }

    fn populate() -> std::result::Result<FragmentCache, String> {
        FragmentCache::build().map_err(|err| err.to_string())
    }

    fn build() -> Result<FragmentCache> {
        let started = Instant::now();
        // The artifact name carries the pid so concurrent engine processes
        // sharing one artifact directory do not clobber each other.
        let name = format!("inkfuse_fragments_{}", std::process::id());
        let (program, ids) = build_fragment_program(&name)?;
        let config = BackendConfig::default();
        let job = InterruptableJob::new()?;
        let artifact = CompiledArtifact::compile(&program, &config, &job)?;
        let mut fragments = HashMap::with_capacity(ids.len());
        for id in ids {
            let fct = artifact.get_function(&id)?;
            fragments.insert(id, fct);
        }
        tracing::info!(
            fragments = fragments.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fragment cache populated"
        );
        Ok(FragmentCache {
            _artifact: artifact,
            fragments,
        })
    }

    /// Resolve one primitive by its suboperator identifier.
    pub fn fragment(&self, id: &str) -> Result<PipelineFn> {
        self.fragments.get(id).copied().ok_or_else(|| {
            InkFuseError::internal(format!("no pre-compiled fragment for `{id}`"))
        })
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}
