//! Content-addressed cache keys for compiled shader IR

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Length of an IR cache key in bytes.
pub const IR_CACHE_KEY_SIZE: usize = 20;

/// Compile-time settings that affect code generation but are not derived
/// from the shader IR itself. These are folded into the cache key so that
/// the same IR compiled under different settings never collides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileFlags {
    pub ngg: bool,
    pub from_ir_text: bool,
    pub wave32: bool,
    pub ngg_culling: bool,
    pub record_ir: bool,
    pub has_image_opcodes: bool,
    pub no_infinite_interp: bool,
    pub clamp_div_by_zero: bool,
    pub vrs2x2: bool,
    pub inline_uniforms: bool,
    pub clear_lds: bool,
    /// Bumped whenever the blob layout or backend codegen changes, so stale
    /// disk entries become misses instead of CRC-colliding garbage.
    pub backend_version: u8,
}

impl CompileFlags {
    /// Pack into the 4-byte word hashed ahead of the IR.
    pub fn to_bits(self) -> u32 {
        let mut bits = 0u32;
        if self.ngg {
            bits |= 1 << 0;
        }
        if self.from_ir_text {
            bits |= 1 << 1;
        }
        if self.wave32 {
            bits |= 1 << 2;
        }
        // bit gap kept for retired flags
        if self.ngg_culling {
            bits |= 1 << 4;
        }
        if self.record_ir {
            bits |= 1 << 5;
        }
        if self.has_image_opcodes {
            bits |= 1 << 6;
        }
        if self.no_infinite_interp {
            bits |= 1 << 7;
        }
        if self.clamp_div_by_zero {
            bits |= 1 << 8;
        }
        if self.vrs2x2 {
            bits |= 1 << 10;
        }
        if self.inline_uniforms {
            bits |= 1 << 11;
        }
        if self.clear_lds {
            bits |= 1 << 12;
        }
        bits | (self.backend_version as u32) << 24
    }
}

/// 20-byte content hash identifying one (IR, compile flags) combination.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct IrCacheKey(pub [u8; IR_CACHE_KEY_SIZE]);

impl Hash for IrCacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Bucket on the first dword; equality still compares all 20 bytes.
        state.write(&self.0[..4]);
    }
}

impl fmt::Debug for IrCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IrCacheKey({})", self.to_hex())
    }
}

impl IrCacheKey {
    pub fn as_bytes(&self) -> &[u8; IR_CACHE_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(IR_CACHE_KEY_SIZE * 2);
        for b in self.0 {
            use fmt::Write;
            write!(out, "{:02x}", b).unwrap();
        }
        out
    }
}

/// Compute the cache key for a shader: a content hash over the packed
/// compile-flags word followed by the full serialized IR.
pub fn ir_cache_key(ir: &[u8], flags: CompileFlags) -> IrCacheKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&flags.to_bits().to_le_bytes());
    hasher.update(ir);

    let mut key = [0u8; IR_CACHE_KEY_SIZE];
    key.copy_from_slice(&hasher.finalize().as_bytes()[..IR_CACHE_KEY_SIZE]);
    IrCacheKey(key)
}
