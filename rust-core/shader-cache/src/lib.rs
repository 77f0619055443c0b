//! Two-tier shader binary cache with CRC-protected serialization
//!
//! This crate avoids recompiling shader IR the process has already seen:
//! an in-memory hash table bounded by a byte budget, backed by a persistent
//! disk tier that survives process restarts. Compiled binaries cross the
//! tier boundary as length-prefixed, CRC32-checked blobs.

pub mod blob;
pub mod cache;
pub mod disk;
pub mod key;

// Re-export main types
pub use blob::{BinaryType, ShaderBinary, ShaderConfig, ShaderInfo};
pub use cache::{ShaderCache, ShaderCacheStats};
pub use disk::{DiskCache, DiskKey, FsDiskCache};
pub use key::{ir_cache_key, CompileFlags, IrCacheKey};

/// Error types for the shader cache
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("allocation size overflow while serializing shader binary")]
    OutOfMemory,

    #[error("corrupt shader cache blob: {0}")]
    CorruptCache(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
