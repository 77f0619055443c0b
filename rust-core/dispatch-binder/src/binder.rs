//! Dispatch-time shader binding
//!
//! The binder owns the per-context hardware shader state: which variant is
//! bound to each stage, where its code lives, and how big the shared
//! scratch buffer is. Binding is idempotent on (variant identity, params),
//! and every GPU allocation a bind needs happens before the first register
//! write, so a failed bind leaves both the binder and the command stream
//! untouched.

use std::sync::Arc;

use shader_cache::ShaderConfig;
use variant_engine::{DeviceInfo, ShaderStage, ShaderVariant, NUM_SHADER_STAGES};

use crate::emitter::{GpuAllocator, GpuBuffer, RegisterEmitter};
use crate::BindError;

/// SPI_TMPRING_SIZE: scratch wave count and per-wave size.
pub const SPI_TMPRING_SIZE: u32 = 0x0286E8;

/// Bind-time parameters that are part of the binding's identity: rebinding
/// the same variant with different params re-emits state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindParams {
    /// Byte offset of the entry point inside the code buffer.
    pub code_offset: u64,
    /// Value loaded into the stage's first user data SGPR.
    pub user_data: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BinderStats {
    pub emitted_binds: u64,
    pub skipped_binds: u64,
    pub scratch_reallocs: u64,
    pub relinks: u64,
    pub ring_reallocs: u64,
}

struct BoundShader {
    variant: Arc<ShaderVariant>,
    params: BindParams,
    code_buffer: GpuBuffer,
}

pub struct DispatchBinder<E: RegisterEmitter, A: GpuAllocator> {
    pub(crate) device: DeviceInfo,
    pub(crate) emitter: E,
    pub(crate) allocator: A,
    bound: [Option<BoundShader>; NUM_SHADER_STAGES],
    scratch: Option<GpuBuffer>,
    /// High-water mark; scratch only ever grows.
    max_seen_scratch_bytes_per_wave: u32,
    spi_tmpring: u32,
    pub(crate) esgs_ring: Option<GpuBuffer>,
    pub(crate) gsvs_ring: Option<GpuBuffer>,
    /// ES/GS pair the ring sizes were last computed for.
    pub(crate) last_ring_inputs: Option<(Arc<ShaderVariant>, Arc<ShaderVariant>)>,
    pub(crate) stats: BinderStats,
}

/// PGM_LO, RSRC1, RSRC2 and USER_DATA_0 register addresses per stage.
fn stage_regs(stage: ShaderStage) -> (u32, u32, u32, u32) {
    match stage {
        ShaderStage::Fragment => (0x00B020, 0x00B028, 0x00B02C, 0x00B030),
        ShaderStage::Vertex | ShaderStage::TessEval => (0x00B120, 0x00B128, 0x00B12C, 0x00B130),
        ShaderStage::Geometry => (0x00B220, 0x00B228, 0x00B22C, 0x00B230),
        ShaderStage::TessCtrl => (0x00B420, 0x00B428, 0x00B42C, 0x00B430),
        ShaderStage::Compute => (0x00B830, 0x00B848, 0x00B84C, 0x00B900),
    }
}

fn emit_stage_regs<E: RegisterEmitter>(
    emitter: &mut E,
    stage: ShaderStage,
    code_va: u64,
    config: &ShaderConfig,
    user_data: u32,
) {
    let (pgm_lo, rsrc1, rsrc2, user0) = stage_regs(stage);
    emitter.set_reg(pgm_lo, (code_va >> 8) as u32);
    emitter.set_reg(pgm_lo + 4, (code_va >> 40) as u32);
    emitter.set_reg(rsrc1, config.rsrc1);
    emitter.set_reg(rsrc2, config.rsrc2);
    emitter.set_reg(user0, user_data);
}

impl<E: RegisterEmitter, A: GpuAllocator> DispatchBinder<E, A> {
    pub fn new(device: DeviceInfo, emitter: E, allocator: A) -> Self {
        Self {
            device,
            emitter,
            allocator,
            bound: Default::default(),
            scratch: None,
            max_seen_scratch_bytes_per_wave: 0,
            spi_tmpring: 0,
            esgs_ring: None,
            gsvs_ring: None,
            last_ring_inputs: None,
            stats: BinderStats::default(),
        }
    }

    pub fn stats(&self) -> BinderStats {
        self.stats
    }

    pub fn emitter(&self) -> &E {
        &self.emitter
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    pub fn bound_variant(&self, stage: ShaderStage) -> Option<&Arc<ShaderVariant>> {
        self.bound[stage.index()].as_ref().map(|b| &b.variant)
    }

    pub fn scratch_size(&self) -> u64 {
        self.scratch.map(|b| b.size).unwrap_or(0)
    }

    /// Bind `variant` to its stage. The variant must be ready; binding a
    /// still-compiling or failed variant is a caller bug surfaced as
    /// [`BindError::NotCompiled`].
    pub fn bind(&mut self, variant: &Arc<ShaderVariant>, params: BindParams) -> Result<(), BindError> {
        let binary = variant.binary().ok_or(BindError::NotCompiled)?;
        let config = binary.config;
        let code_size = binary.code.len() as u64;
        let stage = variant.key.stage;
        let idx = stage.index();

        if let Some(bound) = &self.bound[idx] {
            if Arc::ptr_eq(&bound.variant, variant) && bound.params == params {
                self.stats.skipped_binds += 1;
                return Ok(());
            }
        }

        // Allocation phase. State and command stream stay untouched until
        // every buffer this bind needs exists.
        let code_buffer = self
            .allocator
            .allocate(code_size.max(1), 256)
            .map_err(|_| BindError::OutOfGpuMemory)?;

        let needed = config.scratch_bytes_per_wave;
        let mut new_scratch = None;
        let mut relink_buffers: Vec<(usize, GpuBuffer)> = Vec::new();
        if needed > self.max_seen_scratch_bytes_per_wave {
            let size = needed as u64 * self.device.max_scratch_waves as u64;
            let scratch = match self.allocator.allocate(size, 256) {
                Ok(b) => b,
                Err(_) => {
                    self.allocator.free(code_buffer);
                    return Err(BindError::OutOfGpuMemory);
                }
            };

            // Moving the scratch base invalidates bound binaries that
            // reference it, so they get fresh code buffers at the new link
            // address.
            if self.device.scratch_addr_baked_in_binary {
                for (i, slot) in self.bound.iter().enumerate() {
                    let Some(bound) = slot else { continue };
                    if bound.variant.scratch_bytes_per_wave() == 0 {
                        continue;
                    }
                    match self.allocator.allocate(bound.code_buffer.size, 256) {
                        Ok(b) => relink_buffers.push((i, b)),
                        Err(_) => {
                            for (_, b) in relink_buffers {
                                self.allocator.free(b);
                            }
                            self.allocator.free(scratch);
                            self.allocator.free(code_buffer);
                            return Err(BindError::OutOfGpuMemory);
                        }
                    }
                }
            }
            new_scratch = Some(scratch);
        }

        // Commit phase.
        if let Some(scratch) = new_scratch {
            tracing::debug!(
                bytes_per_wave = needed,
                size = scratch.size,
                "scratch buffer grown"
            );
            if let Some(old) = self.scratch.take() {
                self.allocator.free(old);
            }
            self.max_seen_scratch_bytes_per_wave = needed;
            self.scratch = Some(scratch);
            self.stats.scratch_reallocs += 1;

            let scratch_va = scratch.gpu_address;
            for (i, new_code) in relink_buffers {
                if let Some(bound) = self.bound[i].as_mut() {
                    let old = std::mem::replace(&mut bound.code_buffer, new_code);
                    self.allocator.free(old);
                    bound.variant.set_linked_scratch_va(scratch_va);
                    if let Some(bin) = bound.variant.binary() {
                        emit_stage_regs(
                            &mut self.emitter,
                            bound.variant.key.stage,
                            new_code.gpu_address + bound.params.code_offset,
                            &bin.config,
                            bound.params.user_data,
                        );
                    }
                    self.stats.relinks += 1;
                } else {
                    self.allocator.free(new_code);
                }
            }
        }

        let waves = self.device.max_scratch_waves & 0xfff;
        let blocks = self.max_seen_scratch_bytes_per_wave.div_ceil(1024);
        let tmpring = waves | (blocks << 12);
        if tmpring != self.spi_tmpring {
            self.spi_tmpring = tmpring;
            self.emitter.set_reg(SPI_TMPRING_SIZE, tmpring);
        }

        if self.device.scratch_addr_baked_in_binary && needed > 0 {
            if let Some(scratch) = &self.scratch {
                variant.set_linked_scratch_va(scratch.gpu_address);
            }
        }

        emit_stage_regs(
            &mut self.emitter,
            stage,
            code_buffer.gpu_address + params.code_offset,
            &config,
            params.user_data,
        );
        let previous = self.bound[idx].replace(BoundShader {
            variant: variant.clone(),
            params,
            code_buffer,
        });
        if let Some(old) = previous {
            self.allocator.free(old.code_buffer);
        }
        self.stats.emitted_binds += 1;
        Ok(())
    }

    /// Drop the binding for `stage` and release its code buffer.
    pub fn unbind(&mut self, stage: ShaderStage) {
        if let Some(old) = self.bound[stage.index()].take() {
            self.allocator.free(old.code_buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shader_cache::ShaderBinary;
    use variant_engine::ShaderKey;

    use crate::emitter::{BumpAllocator, RecordingEmitter};

    fn variant_with_scratch(stage: ShaderStage, scratch: u32) -> Arc<ShaderVariant> {
        let mut binary = ShaderBinary::default();
        binary.config.scratch_bytes_per_wave = scratch;
        binary.config.rsrc1 = 0x00af_0000;
        binary.config.rsrc2 = 0x0000_0190;
        binary.code = vec![0u8; 512];
        ShaderVariant::new_prebuilt(ShaderKey::new(stage), 64, binary)
    }

    fn binder(device: DeviceInfo) -> DispatchBinder<RecordingEmitter, BumpAllocator> {
        DispatchBinder::new(device, RecordingEmitter::new(), BumpAllocator::new())
    }

    #[test]
    fn test_rebinding_same_variant_emits_nothing() {
        let mut binder = binder(DeviceInfo::default());
        let v = variant_with_scratch(ShaderStage::Compute, 0);

        binder.bind(&v, BindParams::default()).unwrap();
        let writes = binder.emitter().writes.len();
        binder.bind(&v, BindParams::default()).unwrap();

        assert_eq!(binder.emitter().writes.len(), writes);
        assert_eq!(binder.stats().skipped_binds, 1);
        assert_eq!(binder.stats().emitted_binds, 1);
    }

    #[test]
    fn test_changed_params_rebind_and_emit() {
        let mut binder = binder(DeviceInfo::default());
        let v = variant_with_scratch(ShaderStage::Compute, 0);

        binder.bind(&v, BindParams::default()).unwrap();
        let params = BindParams {
            code_offset: 256,
            user_data: 7,
        };
        binder.bind(&v, params).unwrap();

        assert_eq!(binder.stats().emitted_binds, 2);
        assert_eq!(binder.emitter().value_of(0x00B900), Some(7));
    }

    #[test]
    fn test_emits_stage_registers() {
        let mut binder = binder(DeviceInfo::default());
        let v = variant_with_scratch(ShaderStage::Fragment, 0);

        binder.bind(&v, BindParams::default()).unwrap();
        let lo = binder.emitter().value_of(0x00B020).unwrap();
        assert_ne!(lo, 0);
        assert_eq!(binder.emitter().value_of(0x00B028), Some(0x00af_0000));
        assert_eq!(binder.emitter().value_of(0x00B02C), Some(0x0000_0190));
    }

    #[test]
    fn test_scratch_grows_monotonically() {
        let mut binder = binder(DeviceInfo::default());
        let big = variant_with_scratch(ShaderStage::Compute, 4096);
        let small = variant_with_scratch(ShaderStage::Fragment, 1024);

        binder.bind(&big, BindParams::default()).unwrap();
        let size = binder.scratch_size();
        assert_eq!(size, 4096 * binder.device.max_scratch_waves as u64);
        assert_eq!(binder.stats().scratch_reallocs, 1);

        // A smaller requirement reuses the existing buffer.
        binder.bind(&small, BindParams::default()).unwrap();
        assert_eq!(binder.scratch_size(), size);
        assert_eq!(binder.stats().scratch_reallocs, 1);
        assert_eq!(binder.emitter().write_count(SPI_TMPRING_SIZE), 1);
    }

    #[test]
    fn test_scratch_growth_relinks_bound_shaders() {
        let device = DeviceInfo {
            scratch_addr_baked_in_binary: true,
            ..DeviceInfo::default()
        };
        let mut binder = binder(device);
        let first = variant_with_scratch(ShaderStage::Vertex, 1024);
        let second = variant_with_scratch(ShaderStage::Fragment, 8192);

        binder.bind(&first, BindParams::default()).unwrap();
        let old_va = first.linked_scratch_va();
        binder.bind(&second, BindParams::default()).unwrap();

        assert_eq!(binder.stats().scratch_reallocs, 2);
        assert_eq!(binder.stats().relinks, 1);
        assert_ne!(first.linked_scratch_va(), old_va);
        assert_eq!(first.linked_scratch_va(), second.linked_scratch_va());
        // The vertex stage's code registers were re-emitted.
        assert_eq!(binder.emitter().write_count(0x00B120), 2);
    }

    #[test]
    fn test_failed_allocation_leaves_state_untouched() {
        let mut binder = binder(DeviceInfo::default());
        let v = variant_with_scratch(ShaderStage::Compute, 4096);

        binder.allocator_mut().fail_after = Some(1);
        let err = binder.bind(&v, BindParams::default());
        assert!(matches!(err, Err(BindError::OutOfGpuMemory)));

        // The code buffer allocated before the scratch failure was freed.
        assert_eq!(binder.allocator().live_bytes, 0);
        assert!(binder.emitter().writes.is_empty());
        assert_eq!(binder.scratch_size(), 0);
        assert!(binder.bound_variant(ShaderStage::Compute).is_none());
    }

    #[test]
    fn test_bind_unready_variant_is_an_error() {
        let mut binder = binder(DeviceInfo::default());
        let v = ShaderVariant::new(
            ShaderKey::new(ShaderStage::Compute),
            64,
            false,
            false,
            None,
        );
        assert!(matches!(
            binder.bind(&v, BindParams::default()),
            Err(BindError::NotCompiled)
        ));
    }

    #[test]
    fn test_unbind_releases_code_buffer() {
        let mut binder = binder(DeviceInfo::default());
        let v = variant_with_scratch(ShaderStage::Fragment, 0);
        binder.bind(&v, BindParams::default()).unwrap();
        let live = binder.allocator().live_bytes;
        binder.unbind(ShaderStage::Fragment);
        assert!(binder.allocator().live_bytes < live);
        assert!(binder.bound_variant(ShaderStage::Fragment).is_none());
    }
}
