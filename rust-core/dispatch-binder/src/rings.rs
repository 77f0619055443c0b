//! ESGS and GSVS ring buffer sizing
//!
//! On devices that route geometry amplification through memory rings, the
//! ring sizes depend on the bound ES/GS pair. Sizes are recomputed only
//! when that pair changes, and the rings themselves only ever grow; the
//! ring size registers are written only when a ring is reallocated.

use std::sync::Arc;

use variant_engine::ShaderVariant;

use crate::binder::DispatchBinder;
use crate::emitter::{GpuAllocator, RegisterEmitter};
use crate::BindError;

pub const VGT_ESGS_RING_SIZE: u32 = 0x030900;
pub const VGT_GSVS_RING_SIZE: u32 = 0x030904;

/// Geometry subgroups always launch full waves.
const GS_WAVE_SIZE: u64 = 64;

impl<E: RegisterEmitter, A: GpuAllocator> DispatchBinder<E, A> {
    pub fn esgs_ring_size(&self) -> u64 {
        self.esgs_ring.map(|b| b.size).unwrap_or(0)
    }

    pub fn gsvs_ring_size(&self) -> u64 {
        self.gsvs_ring.map(|b| b.size).unwrap_or(0)
    }

    /// Make the geometry rings large enough for the given ES/GS pair.
    /// Both variants must be ready. Either both rings end up sized and the
    /// size registers updated, or nothing changes.
    pub fn ensure_gs_rings(
        &mut self,
        es: &Arc<ShaderVariant>,
        gs: &Arc<ShaderVariant>,
    ) -> Result<(), BindError> {
        if !self.device.has_esgs_ring {
            return Ok(());
        }
        if let Some((last_es, last_gs)) = &self.last_ring_inputs {
            if Arc::ptr_eq(last_es, es) && Arc::ptr_eq(last_gs, gs) {
                return Ok(());
            }
        }
        let es_info = es.binary().ok_or(BindError::NotCompiled)?.info;
        let gs_info = gs.binary().ok_or(BindError::NotCompiled)?.info;

        let num_se = self.device.num_se as u64;
        let max_gs_waves = 32 * num_se;
        let gs_vertex_reuse = self.device.vertex_reuse_factor as u64 * num_se;
        let alignment = 256 * num_se;
        // Hardware limit of just under 64 MiB per shader engine.
        let max_size = ((63_999u64 * 1024 * 1024 / 1000) & !255) * num_se;

        // The ESGS ring must hold at least one reuse window of vertices.
        let min_esgs = (es_info.esgs_vertex_stride as u64 * gs_vertex_reuse * GS_WAVE_SIZE)
            .next_multiple_of(alignment);

        // Recommended sizes: enough for every GS wave in flight twice over.
        let esgs = max_gs_waves
            * 2
            * GS_WAVE_SIZE
            * es_info.esgs_vertex_stride as u64
            * gs_info.gs_input_verts_per_prim as u64;
        let gsvs = max_gs_waves * 2 * GS_WAVE_SIZE * gs_info.max_gsvs_emit_size as u64;

        let esgs = esgs.max(min_esgs).min(max_size).next_multiple_of(alignment);
        let gsvs = gsvs.min(max_size).next_multiple_of(alignment);

        let grow_esgs = esgs > self.esgs_ring_size();
        let grow_gsvs = gsvs > self.gsvs_ring_size();

        // Allocate both rings before touching any state.
        let new_esgs = if grow_esgs {
            Some(
                self.allocator
                    .allocate(esgs, alignment)
                    .map_err(|_| BindError::OutOfGpuMemory)?,
            )
        } else {
            None
        };
        let new_gsvs = if grow_gsvs {
            match self.allocator.allocate(gsvs, alignment) {
                Ok(b) => Some(b),
                Err(_) => {
                    if let Some(b) = new_esgs {
                        self.allocator.free(b);
                    }
                    return Err(BindError::OutOfGpuMemory);
                }
            }
        } else {
            None
        };

        if let Some(ring) = new_esgs {
            tracing::debug!(size = ring.size, "ESGS ring grown");
            if let Some(old) = self.esgs_ring.replace(ring) {
                self.allocator.free(old);
            }
            self.emitter
                .set_reg(VGT_ESGS_RING_SIZE, (ring.size / 256) as u32);
            self.stats.ring_reallocs += 1;
        }
        if let Some(ring) = new_gsvs {
            tracing::debug!(size = ring.size, "GSVS ring grown");
            if let Some(old) = self.gsvs_ring.replace(ring) {
                self.allocator.free(old);
            }
            self.emitter
                .set_reg(VGT_GSVS_RING_SIZE, (ring.size / 256) as u32);
            self.stats.ring_reallocs += 1;
        }

        self.last_ring_inputs = Some((es.clone(), gs.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shader_cache::ShaderBinary;
    use variant_engine::{DeviceInfo, ShaderKey, ShaderStage};

    use crate::binder::BindParams;
    use crate::emitter::{BumpAllocator, RecordingEmitter};

    fn es_variant(stride: u32) -> Arc<ShaderVariant> {
        let mut binary = ShaderBinary::default();
        binary.info.esgs_vertex_stride = stride;
        let mut key = ShaderKey::new(ShaderStage::Vertex);
        key.as_es = true;
        ShaderVariant::new_prebuilt(key, 64, binary)
    }

    fn gs_variant(verts_in: u32, emit_size: u32) -> Arc<ShaderVariant> {
        let mut binary = ShaderBinary::default();
        binary.info.gs_input_verts_per_prim = verts_in;
        binary.info.max_gsvs_emit_size = emit_size;
        ShaderVariant::new_prebuilt(ShaderKey::new(ShaderStage::Geometry), 64, binary)
    }

    fn binder() -> DispatchBinder<RecordingEmitter, BumpAllocator> {
        DispatchBinder::new(DeviceInfo::default(), RecordingEmitter::new(), BumpAllocator::new())
    }

    #[test]
    fn test_ring_sizes_follow_shader_pair() {
        let mut binder = binder();
        let es = es_variant(16);
        let gs = gs_variant(3, 64);

        binder.ensure_gs_rings(&es, &gs).unwrap();
        // max_gs_waves(64) * 2 * wave(64) * stride(16) * verts(3)
        assert_eq!(binder.esgs_ring_size(), 393_216);
        // max_gs_waves(64) * 2 * wave(64) * emit(64)
        assert_eq!(binder.gsvs_ring_size(), 524_288);
        assert_eq!(binder.emitter().value_of(VGT_ESGS_RING_SIZE), Some(1536));
        assert_eq!(binder.emitter().value_of(VGT_GSVS_RING_SIZE), Some(2048));
    }

    #[test]
    fn test_rings_never_shrink() {
        let mut binder = binder();
        binder.ensure_gs_rings(&es_variant(64), &gs_variant(3, 256)).unwrap();
        let esgs = binder.esgs_ring_size();
        let gsvs = binder.gsvs_ring_size();
        assert_eq!(binder.stats().ring_reallocs, 2);

        binder.ensure_gs_rings(&es_variant(4), &gs_variant(3, 16)).unwrap();
        assert_eq!(binder.esgs_ring_size(), esgs);
        assert_eq!(binder.gsvs_ring_size(), gsvs);
        assert_eq!(binder.stats().ring_reallocs, 2);
        assert_eq!(binder.emitter().write_count(VGT_ESGS_RING_SIZE), 1);
    }

    #[test]
    fn test_same_pair_skips_recomputation() {
        let mut binder = binder();
        let es = es_variant(16);
        let gs = gs_variant(3, 64);
        binder.ensure_gs_rings(&es, &gs).unwrap();
        let allocations = binder.allocator().allocations;

        binder.ensure_gs_rings(&es, &gs).unwrap();
        assert_eq!(binder.allocator().allocations, allocations);
    }

    #[test]
    fn test_minimum_esgs_size_applies() {
        let mut binder = binder();
        // Tiny recommended size; the reuse-window minimum dominates.
        let es = es_variant(16);
        let gs = gs_variant(0, 0);
        binder.ensure_gs_rings(&es, &gs).unwrap();
        // stride(16) * reuse(32) * wave(64), aligned to 512
        assert_eq!(binder.esgs_ring_size(), 32_768);
    }

    #[test]
    fn test_ring_allocation_failure_changes_nothing() {
        let mut binder = binder();
        binder.allocator_mut().fail_after = Some(1);
        let err = binder.ensure_gs_rings(&es_variant(16), &gs_variant(3, 64));
        assert!(matches!(err, Err(BindError::OutOfGpuMemory)));
        assert_eq!(binder.allocator().live_bytes, 0);
        assert!(binder.emitter().writes.is_empty());
        assert_eq!(binder.esgs_ring_size(), 0);

        // A later attempt with memory available succeeds from scratch.
        binder.allocator_mut().fail_after = None;
        binder.ensure_gs_rings(&es_variant(16), &gs_variant(3, 64)).unwrap();
        assert_eq!(binder.esgs_ring_size(), 393_216);
    }

    #[test]
    fn test_rings_disabled_without_hardware_support() {
        let device = DeviceInfo {
            has_esgs_ring: false,
            ..DeviceInfo::default()
        };
        let mut binder =
            DispatchBinder::new(device, RecordingEmitter::new(), BumpAllocator::new());
        binder.ensure_gs_rings(&es_variant(16), &gs_variant(3, 64)).unwrap();
        assert_eq!(binder.esgs_ring_size(), 0);
        assert_eq!(binder.allocator().allocations, 0);
    }

    // BindParams is unrelated to rings but shares the binder; make sure a
    // bind between ring updates does not disturb ring state.
    #[test]
    fn test_bind_preserves_ring_state() {
        let mut binder = binder();
        let es = es_variant(16);
        let gs = gs_variant(3, 64);
        binder.ensure_gs_rings(&es, &gs).unwrap();

        binder.bind(&gs, BindParams::default()).unwrap();
        assert_eq!(binder.esgs_ring_size(), 393_216);
        assert_eq!(binder.gsvs_ring_size(), 524_288);
    }
}
