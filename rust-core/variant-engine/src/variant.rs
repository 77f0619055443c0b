//! Compiled shader variants
//!
//! A variant is one hardware-ready realization of a shader program for one
//! key. Its compiled state follows a single-writer handoff: the compiling
//! thread fully populates the binary slot and failure flag, then signals the
//! ready fence; everyone else waits on the fence before reading.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use shader_cache::ShaderBinary;

use crate::backend::BackendError;
use crate::fence::Fence;
use crate::key::ShaderKey;
use crate::program::ShaderProgram;
use crate::scheduler::JobHandle;
use crate::DeviceInfo;

/// One compiled realization of a shader program for one specialization key.
pub struct ShaderVariant {
    pub key: ShaderKey,
    pub wave_size: u32,
    /// Single compiled unit covering prolog+main+epilog.
    pub is_monolithic: bool,
    /// Built speculatively in the background; selection never blocks on it.
    pub is_optimized: bool,
    ready: Arc<Fence>,
    failed: AtomicBool,
    compiled: OnceLock<ShaderBinary>,
    gs_copy: OnceLock<Arc<ShaderVariant>>,
    /// First stage of a merged hardware stage pair, kept alive for the
    /// lifetime of this variant.
    previous_stage: Option<Arc<ShaderProgram>>,
    /// Pending background compile, cancelled at teardown.
    job: Mutex<Option<JobHandle>>,
    /// Scratch address this binary was last linked against (0 = unlinked).
    /// Written only by the context thread that owns the dispatch state.
    linked_scratch_va: AtomicU64,
}

impl ShaderVariant {
    pub fn new(
        key: ShaderKey,
        wave_size: u32,
        is_monolithic: bool,
        is_optimized: bool,
        previous_stage: Option<Arc<ShaderProgram>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            wave_size,
            is_monolithic,
            is_optimized,
            ready: Arc::new(Fence::new()),
            failed: AtomicBool::new(false),
            compiled: OnceLock::new(),
            gs_copy: OnceLock::new(),
            previous_stage,
            job: Mutex::new(None),
            linked_scratch_va: AtomicU64::new(0),
        })
    }

    /// A main part or GS copy shader: published only after compilation, so
    /// its fence can stay permanently signaled.
    pub fn new_prebuilt(key: ShaderKey, wave_size: u32, binary: ShaderBinary) -> Arc<Self> {
        let variant = Arc::new(Self {
            key,
            wave_size,
            is_monolithic: false,
            is_optimized: false,
            ready: Arc::new(Fence::new_signaled()),
            failed: AtomicBool::new(false),
            compiled: OnceLock::new(),
            gs_copy: OnceLock::new(),
            previous_stage: None,
            job: Mutex::new(None),
            linked_scratch_va: AtomicU64::new(0),
        });
        let _ = variant.compiled.set(binary);
        variant
    }

    pub fn ready(&self) -> bool {
        self.ready.signaled()
    }

    pub fn wait_ready(&self) {
        self.ready.wait();
    }

    /// The fence handed to the compilation scheduler.
    pub fn ready_fence(&self) -> Arc<Fence> {
        self.ready.clone()
    }

    pub fn compilation_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// The compiled binary, if compilation finished successfully.
    pub fn binary(&self) -> Option<&ShaderBinary> {
        self.compiled.get()
    }

    /// The GS copy shader paired with a non-NGG geometry variant.
    pub fn gs_copy(&self) -> Option<&Arc<ShaderVariant>> {
        self.gs_copy.get()
    }

    pub fn previous_stage(&self) -> Option<&Arc<ShaderProgram>> {
        self.previous_stage.as_ref()
    }

    pub fn scratch_bytes_per_wave(&self) -> u32 {
        self.binary()
            .map(|b| b.config.scratch_bytes_per_wave)
            .unwrap_or(0)
    }

    /// Record the outcome of a compile and wake all waiters. The writes
    /// complete strictly before the fence signals.
    pub fn finish(&self, result: Result<ShaderBinary, BackendError>) {
        match result {
            Ok(binary) => {
                let _ = self.compiled.set(binary);
            }
            Err(e) => {
                tracing::error!("failed to build shader variant (stage {:?}): {}", self.key.stage, e);
                self.failed.store(true, Ordering::Release);
            }
        }
        self.ready.signal();
    }

    /// Attach the paired GS copy shader before the owning variant signals.
    pub fn attach_gs_copy(&self, copy: Arc<ShaderVariant>) {
        let _ = self.gs_copy.set(copy);
    }

    pub fn set_job(&self, job: JobHandle) {
        *self.job.lock() = Some(job);
    }

    pub fn take_job(&self) -> Option<JobHandle> {
        self.job.lock().take()
    }

    pub fn linked_scratch_va(&self) -> u64 {
        self.linked_scratch_va.load(Ordering::Relaxed)
    }

    pub fn set_linked_scratch_va(&self, va: u64) {
        self.linked_scratch_va.store(va, Ordering::Relaxed);
    }
}

/// Pick the wave size for a shader. Wave32 only pays off for non-merged
/// shaders with divergent loops on devices that prefer it.
pub fn determine_wave_size(device: &DeviceInfo, has_divergent_loop: bool, merged: bool) -> u32 {
    if device.prefers_wave32 && has_divergent_loop && !merged {
        32
    } else {
        64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShaderStage;

    #[test]
    fn test_finish_success_publishes_binary() {
        let variant = ShaderVariant::new(
            ShaderKey::new(ShaderStage::Fragment),
            64,
            false,
            false,
            None,
        );
        assert!(!variant.ready());
        assert!(variant.binary().is_none());

        variant.finish(Ok(ShaderBinary::default()));
        assert!(variant.ready());
        assert!(!variant.compilation_failed());
        assert!(variant.binary().is_some());
    }

    #[test]
    fn test_finish_failure_still_signals() {
        let variant = ShaderVariant::new(
            ShaderKey::new(ShaderStage::Fragment),
            64,
            false,
            false,
            None,
        );
        variant.finish(Err(BackendError::Compile("nope".into())));

        assert!(variant.ready());
        assert!(variant.compilation_failed());
        assert!(variant.binary().is_none());
        // Waiters must not deadlock on a failed variant.
        variant.wait_ready();
    }

    #[test]
    fn test_wave_size_policy() {
        let wave32_device = DeviceInfo {
            prefers_wave32: true,
            ..DeviceInfo::default()
        };
        assert_eq!(determine_wave_size(&wave32_device, true, false), 32);
        assert_eq!(determine_wave_size(&wave32_device, true, true), 64);
        assert_eq!(determine_wave_size(&wave32_device, false, false), 64);

        let wave64_device = DeviceInfo {
            prefers_wave32: false,
            ..DeviceInfo::default()
        };
        assert_eq!(determine_wave_size(&wave64_device, true, false), 64);
        assert_eq!(determine_wave_size(&wave64_device, false, false), 64);
    }
}
