//! Compiler backend seam
//!
//! The actual IR-to-machine-code compiler is an external collaborator; the
//! engine only drives it. Anything implementing [`CompilerBackend`] can be
//! plugged in, including the deterministic doubles in [`crate::testing`].

use shader_cache::ShaderBinary;

use crate::key::ShaderKey;

/// Error reported by the opaque compiler backend.
#[derive(thiserror::Error, Debug, Clone)]
pub enum BackendError {
    #[error("backend compile failed: {0}")]
    Compile(String),
}

/// Opaque IR-to-binary compiler.
pub trait CompilerBackend: Send + Sync {
    /// Compile the IR artifact for one specialization key and wave size.
    fn compile(
        &self,
        ir: &[u8],
        key: &ShaderKey,
        wave_size: u32,
    ) -> Result<ShaderBinary, BackendError>;

    /// Generate the GS copy shader paired with a non-NGG geometry variant.
    fn compile_gs_copy(&self, ir: &[u8], wave_size: u32) -> Result<ShaderBinary, BackendError>;
}
