//! External-compiler invocation and symbol loading.

use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::Instant;

use inkfuse_error::{InkFuseError, Result};
use inkfuse_ir::Program;

use crate::interrupt::InterruptableJob;
use crate::lower::lower_program;

/// Signature of every generated pipeline function:
/// `u8 f(void** global_state, void** thread_params, void* resumption)`.
pub type PipelineFn = unsafe extern "C" fn(*mut *mut c_void, *mut *mut c_void, *mut c_void) -> u8;

/// Where and how to invoke the external C compiler.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Compiler binary, `INKFUSE_CC` or `cc`.
    pub compiler: String,
    /// Directory for generated `.c`/`.so` artifacts.
    pub artifact_dir: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> BackendConfig {
        BackendConfig {
            compiler: std::env::var("INKFUSE_CC").unwrap_or_else(|_| "cc".to_string()),
            artifact_dir: std::env::temp_dir().join("inkfuse"),
        }
    }
}

impl BackendConfig {
    pub fn with_artifact_dir(dir: impl Into<PathBuf>) -> BackendConfig {
        BackendConfig {
            artifact_dir: dir.into(),
            ..BackendConfig::default()
        }
    }

    fn source_path(&self, name: &str) -> PathBuf {
        self.artifact_dir.join(format!("{name}.c"))
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.artifact_dir.join(format!("{name}.so"))
    }
}

/// A loaded shared object produced from one IR program.
pub struct CompiledArtifact {
    library: libloading::Library,
    so_path: PathBuf,
}

impl CompiledArtifact {
    /// Lower, compile, and load `program`.  The compile runs under
    /// `interrupt` and may end with [`InkFuseError::Interrupted`].
    pub fn compile(
        program: &Program,
        config: &BackendConfig,
        interrupt: &InterruptableJob,
    ) -> Result<CompiledArtifact> {
        let source = lower_program(program)?;
        std::fs::create_dir_all(&config.artifact_dir)?;
        let c_path = config.source_path(&program.name);
        let so_path = config.object_path(&program.name);
        std::fs::write(&c_path, source)?;

        let started = Instant::now();
        let mut cmd = Command::new(&config.compiler);
        cmd.arg("-O3")
            .arg("-fPIC")
            .arg("-shared")
            .arg("-o")
            .arg(&so_path)
            .arg(&c_path);
        let exit_code = interrupt.run_command(&mut cmd)?;
        if exit_code != 0 {
            return Err(InkFuseError::CompilerError(format!(
                "{} exited with status {} for {}",
                config.compiler,
                exit_code,
                c_path.display()
            )));
        }
        if !so_path.exists() {
            return Err(InkFuseError::CompilerError(format!(
                "{} produced no artifact at {}",
                config.compiler,
                so_path.display()
            )));
        }
        tracing::debug!(
            program = program.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compiled pipeline program"
        );
        Self::load(&so_path)
    }

    /// Load an already-compiled shared object.
    pub fn load(so_path: &Path) -> Result<CompiledArtifact> {
        // Pin the runtime ABI into the host image before the first dlopen;
        // generated code resolves those symbols against the process.
        static SYMBOL_ANCHOR: OnceLock<usize> = OnceLock::new();
        SYMBOL_ANCHOR.get_or_init(|| {
            inkfuse_runtime::abi::symbol_addresses()
                .iter()
                .fold(0_usize, |acc, (_, addr)| acc.wrapping_add(*addr as usize))
        });
        let library = unsafe { libloading::Library::new(so_path) }.map_err(|err| {
            InkFuseError::CompilerError(format!("cannot load {}: {err}", so_path.display()))
        })?;
        Ok(CompiledArtifact {
            library,
            so_path: so_path.to_path_buf(),
        })
    }

    /// Resolve a pipeline function by symbol name.
    pub fn get_function(&self, name: &str) -> Result<PipelineFn> {
        let symbol = format!("{name}\0");
        let fct: libloading::Symbol<'_, PipelineFn> =
            unsafe { self.library.get(symbol.as_bytes()) }
                .map_err(|_| InkFuseError::LinkError(name.to_string()))?;
        Ok(*fct)
    }

    pub fn so_path(&self) -> &Path {
        &self.so_path
    }
}
