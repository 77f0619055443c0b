//! Shader programs and their shared "main parts"
//!
//! A program owns one immutable IR artifact, the store of compiled
//! variants, and the lazily compiled main parts that non-monolithic
//! variants link against. The program's `ready` fence gates all variant
//! selection: it signals once the initial analysis/compile job has
//! finished, and it must be observed before the program mutex is taken so
//! the initial job can never deadlock against a selecting thread.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use shader_cache::{ir_cache_key, CompileFlags, ShaderBinary};

use crate::backend::BackendError;
use crate::fence::Fence;
use crate::key::{ShaderKey, ShaderStage};
use crate::scheduler::JobHandle;
use crate::store::VariantStore;
use crate::variant::{determine_wave_size, ShaderVariant};
use crate::VariantEngine;

/// Queryable properties of the opaque IR artifact, produced by the
/// caller's shader-info scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramInfo {
    pub has_divergent_loop: bool,
    /// Bytes written per exported vertex when feeding a geometry stage.
    pub esgs_vertex_stride: u32,
    pub gs_input_verts_per_prim: u32,
    pub max_gsvs_emit_size: u32,
}

/// The immutable IR artifact plus its scanned properties.
pub struct IrModule {
    pub bytes: Vec<u8>,
    pub info: ProgramInfo,
}

impl IrModule {
    pub fn new(bytes: Vec<u8>, info: ProgramInfo) -> Self {
        Self { bytes, info }
    }
}

/// Number of distinct main-part linkage shapes (vs / ls / es / ngg / ngg-es).
const NUM_MAIN_PART_SHAPES: usize = 5;

fn main_part_index(key: &ShaderKey) -> usize {
    match (key.as_ls, key.as_es, key.as_ngg) {
        (true, _, _) => 1,
        (false, true, false) => 2,
        (false, false, true) => 3,
        (false, true, true) => 4,
        (false, false, false) => 0,
    }
}

pub(crate) struct ProgramState {
    pub(crate) store: VariantStore,
    main_parts: [Option<Arc<ShaderVariant>>; NUM_MAIN_PART_SHAPES],
}

/// One logical shader: a pipeline stage of one user-supplied program.
pub struct ShaderProgram {
    pub stage: ShaderStage,
    ir: Arc<[u8]>,
    pub info: ProgramInfo,
    pub(crate) compile_flags: CompileFlags,
    /// Signals once the initial analysis/compile has completed.
    pub ready: Arc<Fence>,
    state: Mutex<ProgramState>,
    initial_job: Mutex<Option<JobHandle>>,
}

impl ShaderProgram {
    pub fn new(stage: ShaderStage, ir: IrModule, compile_flags: CompileFlags) -> Arc<Self> {
        Arc::new(Self {
            stage,
            ir: ir.bytes.into(),
            info: ir.info,
            compile_flags,
            ready: Arc::new(Fence::new()),
            state: Mutex::new(ProgramState {
                store: VariantStore::new(),
                main_parts: Default::default(),
            }),
            initial_job: Mutex::new(None),
        })
    }

    pub fn ir(&self) -> &[u8] {
        &self.ir
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ProgramState> {
        self.state.lock()
    }

    /// Number of variants currently owned by this program.
    pub fn variant_count(&self) -> usize {
        self.state.lock().store.len()
    }

    /// Kick off the initial analysis/main-part compile on the normal
    /// queue. Until the job signals `ready`, variant selection blocks.
    pub fn schedule_initial_compile(self: &Arc<Self>, engine: &Arc<VariantEngine>) {
        let program = self.clone();
        let engine_ref = engine.clone();

        let handle = engine.queue.submit(self.ready.clone(), move || {
            let main_key = ShaderKey::new(program.stage);
            if !engine_ref.options.use_monolithic_shaders {
                if let Err(e) = program.ensure_main_part(&engine_ref, &main_key) {
                    // The draw that first needs this program will retry and
                    // surface the failure; the program stays usable.
                    tracing::warn!("initial shader compile failed: {}", e);
                }
            }
            program.ready.signal();
        });
        *self.initial_job.lock() = Some(handle);
    }

    /// Get or synchronously build the shared main part for one linkage
    /// shape. `key` must be a main-part key (canonical except linkage).
    pub(crate) fn ensure_main_part(
        &self,
        engine: &VariantEngine,
        key: &ShaderKey,
    ) -> Result<Arc<ShaderVariant>, BackendError> {
        let mut state = self.state.lock();
        self.ensure_main_part_locked(&mut state, engine, key)
    }

    pub(crate) fn ensure_main_part_locked(
        &self,
        state: &mut ProgramState,
        engine: &VariantEngine,
        key: &ShaderKey,
    ) -> Result<Arc<ShaderVariant>, BackendError> {
        let idx = main_part_index(key);
        if let Some(part) = &state.main_parts[idx] {
            return Ok(part.clone());
        }

        let merged = key.as_ls || key.as_es;
        let wave_size = determine_wave_size(&engine.device, self.info.has_divergent_loop, merged);
        let (binary, copy) = compile_group(engine, &self.ir, self.compile_flags, key, wave_size, true)?;

        // The fence can stay permanently signaled: the part becomes
        // visible globally only after it has been compiled.
        let part = ShaderVariant::new_prebuilt(*key, wave_size, binary);
        if let Some(copy_binary) = copy {
            part.attach_gs_copy(ShaderVariant::new_prebuilt(
                ShaderKey::new(self.stage),
                64,
                copy_binary,
            ));
        }
        state.main_parts[idx] = Some(part.clone());
        Ok(part)
    }

    /// Explicit teardown: drop queued compile jobs and wait out running
    /// ones so no job outlives the program's variants.
    pub fn destroy(&self) {
        if let Some(job) = self.initial_job.lock().take() {
            job.cancel();
            job.wait();
        }

        let variants: Vec<_> = self.state.lock().store.iter().cloned().collect();
        for variant in variants {
            if let Some(job) = variant.take_job() {
                job.cancel();
                job.wait();
            }
        }
    }
}

/// Compile one (key, wave size) through the shader cache: cache hit avoids
/// the backend entirely; a miss compiles and populates both tiers.
/// Non-NGG geometry shaders carry their GS copy shader with them.
pub(crate) fn compile_group(
    engine: &VariantEngine,
    ir: &[u8],
    base_flags: CompileFlags,
    key: &ShaderKey,
    wave_size: u32,
    use_cache: bool,
) -> Result<(ShaderBinary, Option<ShaderBinary>), BackendError> {
    let expect_copy = key.stage == ShaderStage::Geometry && !key.as_ngg;
    let flags = CompileFlags {
        ngg: key.as_ngg,
        wave32: wave_size == 32,
        inline_uniforms: key.opt.inline_uniforms,
        ..base_flags
    };
    let cache_key = ir_cache_key(ir, flags);

    if use_cache {
        if let Some(mut group) = engine.cache.load(&cache_key, expect_copy) {
            let copy = if expect_copy { group.pop() } else { None };
            if let Some(binary) = group.pop() {
                return Ok((binary, copy));
            }
        }
    }

    let binary = engine.backend.compile(ir, key, wave_size)?;
    let copy = if expect_copy {
        Some(engine.backend.compile_gs_copy(ir, wave_size)?)
    } else {
        None
    };

    if use_cache {
        match &copy {
            Some(copy_binary) => engine.cache.insert(
                &cache_key,
                &[binary.clone(), copy_binary.clone()],
                true,
            ),
            None => engine.cache.insert(&cache_key, std::slice::from_ref(&binary), true),
        }
    }
    Ok((binary, copy))
}

/// Build a variant in place: compile (through the cache when the key is
/// canonical), attach the GS copy shader if one is expected, record the
/// outcome and signal the variant's fence.
pub(crate) fn build_variant(engine: &VariantEngine, program: &ShaderProgram, variant: &ShaderVariant) {
    let key = &variant.key;
    let use_cache = !engine.options.use_monolithic_shaders
        && key.mono.is_default()
        && key.opt_is_default(true);

    match compile_group(
        engine,
        program.ir(),
        program.compile_flags,
        key,
        variant.wave_size,
        use_cache,
    ) {
        Ok((binary, copy)) => {
            if let Some(copy_binary) = copy {
                variant.attach_gs_copy(ShaderVariant::new_prebuilt(
                    ShaderKey::new(program.stage),
                    64,
                    copy_binary,
                ));
            }
            variant.finish(Ok(binary));
        }
        Err(e) => variant.finish(Err(e)),
    }
}
