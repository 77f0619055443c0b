//! Hardware abstraction seams for the binder
//!
//! The binder never touches a command stream or GPU heap directly; it goes
//! through these two traits so the dispatch logic can be exercised against
//! recording doubles.

/// Sink for SET_SH_REG style register writes.
pub trait RegisterEmitter {
    fn set_reg(&mut self, addr: u32, value: u32);
}

/// GPU memory region backing shader code, scratch or a ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBuffer {
    pub handle: u64,
    pub gpu_address: u64,
    pub size: u64,
}

#[derive(thiserror::Error, Debug)]
#[error("GPU allocation of {size} bytes failed")]
pub struct AllocError {
    pub size: u64,
}

/// GPU heap allocator. `free` is infallible; failures are the allocator's
/// problem to log.
pub trait GpuAllocator {
    fn allocate(&mut self, size: u64, align: u64) -> Result<GpuBuffer, AllocError>;
    fn free(&mut self, buffer: GpuBuffer);
}

/// Emitter double that records every register write in order.
#[derive(Default)]
pub struct RecordingEmitter {
    pub writes: Vec<(u32, u32)>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent value written to `addr`, if any.
    pub fn value_of(&self, addr: u32) -> Option<u32> {
        self.writes
            .iter()
            .rev()
            .find(|(a, _)| *a == addr)
            .map(|(_, v)| *v)
    }

    pub fn write_count(&self, addr: u32) -> usize {
        self.writes.iter().filter(|(a, _)| *a == addr).count()
    }
}

impl RegisterEmitter for RecordingEmitter {
    fn set_reg(&mut self, addr: u32, value: u32) {
        self.writes.push((addr, value));
    }
}

/// Bump allocator double with optional failure injection.
pub struct BumpAllocator {
    next_address: u64,
    next_handle: u64,
    /// Fail every allocation once this many have succeeded.
    pub fail_after: Option<usize>,
    pub allocations: usize,
    pub frees: usize,
    pub live_bytes: u64,
}

impl BumpAllocator {
    pub fn new() -> Self {
        Self {
            next_address: 0x1000_0000,
            next_handle: 1,
            fail_after: None,
            allocations: 0,
            frees: 0,
            live_bytes: 0,
        }
    }
}

impl Default for BumpAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuAllocator for BumpAllocator {
    fn allocate(&mut self, size: u64, align: u64) -> Result<GpuBuffer, AllocError> {
        if let Some(limit) = self.fail_after {
            if self.allocations >= limit {
                return Err(AllocError { size });
            }
        }
        let align = align.max(1);
        self.next_address = (self.next_address + align - 1) & !(align - 1);
        let buffer = GpuBuffer {
            handle: self.next_handle,
            gpu_address: self.next_address,
            size,
        };
        self.next_handle += 1;
        self.next_address += size;
        self.allocations += 1;
        self.live_bytes += size;
        Ok(buffer)
    }

    fn free(&mut self, buffer: GpuBuffer) {
        self.frees += 1;
        self.live_bytes = self.live_bytes.saturating_sub(buffer.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_allocator_aligns_and_fails_on_cue() {
        let mut alloc = BumpAllocator::new();
        let a = alloc.allocate(100, 256).unwrap();
        let b = alloc.allocate(100, 256).unwrap();
        assert_eq!(a.gpu_address % 256, 0);
        assert_eq!(b.gpu_address % 256, 0);
        assert_ne!(a.handle, b.handle);

        alloc.fail_after = Some(2);
        assert!(alloc.allocate(100, 256).is_err());
    }

    #[test]
    fn test_recording_emitter_tracks_latest_value() {
        let mut em = RecordingEmitter::new();
        em.set_reg(0x10, 1);
        em.set_reg(0x10, 2);
        assert_eq!(em.value_of(0x10), Some(2));
        assert_eq!(em.write_count(0x10), 2);
        assert_eq!(em.value_of(0x14), None);
    }
}
