//! Deterministic backend doubles for tests and benchmarks

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use shader_cache::{BinaryType, ShaderBinary, ShaderConfig, ShaderInfo};

use crate::backend::{BackendError, CompilerBackend};
use crate::key::ShaderKey;

/// Backend that derives machine code deterministically from its inputs, so
/// two compiles of the same (IR, key, wave size) produce byte-identical
/// binaries. Supports artificial latency and forced failure.
pub struct StubBackend {
    pub delay: Duration,
    pub fail: bool,
    pub scratch_bytes_per_wave: u32,
    pub esgs_vertex_stride: u32,
    pub gs_input_verts_per_prim: u32,
    pub max_gsvs_emit_size: u32,
    compile_count: AtomicU64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            fail: false,
            scratch_bytes_per_wave: 0,
            esgs_vertex_stride: 16,
            gs_input_verts_per_prim: 3,
            max_gsvs_emit_size: 64,
            compile_count: AtomicU64::new(0),
        }
    }

    /// Backend that takes `delay` for every compile.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// Backend that fails every compile.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    /// Backend whose binaries require scratch memory.
    pub fn with_scratch(scratch_bytes_per_wave: u32) -> Self {
        Self {
            scratch_bytes_per_wave,
            ..Self::new()
        }
    }

    /// Number of compiles performed so far (GS copy shaders included).
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::SeqCst)
    }

    fn make_binary(&self, seed: &[u8]) -> ShaderBinary {
        let digest = blake3::hash(seed).as_bytes().to_vec();
        ShaderBinary {
            binary_type: BinaryType::Raw,
            config: ShaderConfig {
                num_sgprs: 16,
                num_vgprs: 24,
                scratch_bytes_per_wave: self.scratch_bytes_per_wave,
                rsrc1: u32::from_le_bytes(digest[0..4].try_into().unwrap()),
                rsrc2: u32::from_le_bytes(digest[4..8].try_into().unwrap()),
                ..ShaderConfig::default()
            },
            info: ShaderInfo {
                esgs_vertex_stride: self.esgs_vertex_stride,
                gs_input_verts_per_prim: self.gs_input_verts_per_prim,
                max_gsvs_emit_size: self.max_gsvs_emit_size,
                ..ShaderInfo::default()
            },
            exec_size: digest.len() as u32,
            code: digest,
            symbols: vec![],
            ir_text: None,
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerBackend for StubBackend {
    fn compile(
        &self,
        ir: &[u8],
        key: &ShaderKey,
        wave_size: u32,
    ) -> Result<ShaderBinary, BackendError> {
        self.compile_count.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail {
            return Err(BackendError::Compile("stub backend forced failure".into()));
        }

        let mut seed = ir.to_vec();
        seed.extend_from_slice(format!("{:?}/{}", key, wave_size).as_bytes());
        Ok(self.make_binary(&seed))
    }

    fn compile_gs_copy(&self, ir: &[u8], wave_size: u32) -> Result<ShaderBinary, BackendError> {
        self.compile_count.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BackendError::Compile("stub backend forced failure".into()));
        }

        let mut seed = ir.to_vec();
        seed.extend_from_slice(format!("gs-copy/{}", wave_size).as_bytes());
        Ok(self.make_binary(&seed))
    }
}
