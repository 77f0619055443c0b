//! Shader variant compilation engine
//!
//! Programs own an immutable IR artifact and a store of compiled variants,
//! each specialized by a [`ShaderKey`]. [`VariantEngine::select`] resolves a
//! key to a ready variant, compiling on demand: canonical variants compile
//! synchronously through the shader cache, optimized variants compile in
//! the background and are never waited on at selection time.

pub mod backend;
pub mod fence;
pub mod key;
pub mod program;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod testing;
pub mod variant;

use std::sync::Arc;

use shader_cache::ShaderCache;

pub use backend::{BackendError, CompilerBackend};
pub use fence::Fence;
pub use key::{MonoKey, OptKey, ShaderKey, ShaderStage, MAX_INLINABLE_UNIFORMS, NUM_SHADER_STAGES};
pub use program::{IrModule, ProgramInfo, ShaderProgram};
pub use scheduler::{CompileQueue, JobHandle};
pub use selector::{normalize_key_on_conflict, KeyConflict, SelectError, MAX_SELECT_RETRIES};
pub use store::{FindResult, VariantStore};
pub use variant::{determine_wave_size, ShaderVariant};

/// Static properties of the device shaders are compiled for.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    /// Whether wave32 is available and profitable for divergent code.
    pub prefers_wave32: bool,
    /// Number of shader engines.
    pub num_se: u32,
    /// Hardware bound on concurrently resident scratch waves.
    pub max_scratch_waves: u32,
    /// The scratch base address is baked into the binary at link time, so
    /// moving the scratch buffer forces a re-link of bound shaders.
    pub scratch_addr_baked_in_binary: bool,
    /// Geometry shading goes through ESGS/GSVS ring buffers.
    pub has_esgs_ring: bool,
    /// Vertex reuse depth used when sizing the GSVS ring.
    pub vertex_reuse_factor: u32,
    /// Hardware merges LS+HS and ES+GS into single waves.
    pub merged_shaders: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            prefers_wave32: true,
            num_se: 2,
            max_scratch_waves: 32 * 2,
            scratch_addr_baked_in_binary: false,
            has_esgs_ring: true,
            vertex_reuse_factor: 16,
            merged_shaders: true,
        }
    }
}

/// Tunables controlling compilation policy.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Block selection until background compiles finish. Debug aid; makes
    /// variant selection deterministic.
    pub sync_compile: bool,
    /// Compile every variant monolithically, skipping shared main parts.
    pub use_monolithic_shaders: bool,
    /// Strip optimization bits from every key before selection.
    pub no_opt_variant: bool,
    /// Ceiling on coexisting inlined-uniform variants per program.
    pub max_inline_variant_count: usize,
    pub num_compiler_threads: usize,
    pub num_low_priority_threads: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            sync_compile: false,
            use_monolithic_shaders: false,
            no_opt_variant: false,
            max_inline_variant_count: 5,
            num_compiler_threads: 2,
            num_low_priority_threads: 1,
        }
    }
}

/// Shared compilation state: the queues, the cache and the backend.
pub struct VariantEngine {
    pub device: DeviceInfo,
    pub options: EngineOptions,
    pub(crate) queue: CompileQueue,
    pub cache: Arc<ShaderCache>,
    pub(crate) backend: Arc<dyn CompilerBackend>,
}

impl VariantEngine {
    pub fn new(
        device: DeviceInfo,
        options: EngineOptions,
        backend: Arc<dyn CompilerBackend>,
    ) -> Arc<Self> {
        Self::with_cache(device, options, backend, Arc::new(ShaderCache::new()))
    }

    /// Build an engine around an existing cache, e.g. one with a disk tier.
    pub fn with_cache(
        device: DeviceInfo,
        options: EngineOptions,
        backend: Arc<dyn CompilerBackend>,
        cache: Arc<ShaderCache>,
    ) -> Arc<Self> {
        let queue = CompileQueue::new(
            options.num_compiler_threads,
            options.num_low_priority_threads,
            options.sync_compile,
        );
        Arc::new(Self {
            device,
            options,
            queue,
            cache,
            backend,
        })
    }
}
