//! Dispatch-time binding of compiled shader variants
//!
//! [`DispatchBinder`] turns ready [`variant_engine::ShaderVariant`]s into
//! hardware state: per-stage code and resource registers, a monotonically
//! growing scratch buffer, and the ESGS/GSVS geometry rings. It is
//! single-threaded per context and talks to the GPU exclusively through
//! the [`RegisterEmitter`] and [`GpuAllocator`] seams.

pub mod binder;
pub mod emitter;
pub mod rings;

pub use binder::{BindParams, BinderStats, DispatchBinder, SPI_TMPRING_SIZE};
pub use emitter::{AllocError, BumpAllocator, GpuAllocator, GpuBuffer, RecordingEmitter, RegisterEmitter};
pub use rings::{VGT_ESGS_RING_SIZE, VGT_GSVS_RING_SIZE};

#[derive(thiserror::Error, Debug)]
pub enum BindError {
    #[error("shader variant has not finished compiling or failed to compile")]
    NotCompiled,
    #[error("out of GPU memory")]
    OutOfGpuMemory,
}
