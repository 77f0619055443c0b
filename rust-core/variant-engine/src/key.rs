//! Shader keys: the value describing every compile-time specialization axis
//!
//! A key is a flat record with `opt` as its explicit trailing segment, and
//! `inlined_uniform_values` as the trailing segment of `opt`. Variant lookup
//! compares the prefix (everything before the inlined values) separately
//! from the values themselves, so comparisons are defined as named methods
//! here rather than through layout arithmetic.

use serde::{Deserialize, Serialize};

/// Upper bound on uniform values baked into a variant as constants.
pub const MAX_INLINABLE_UNIFORMS: usize = 4;

/// Pipeline stage a shader program belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderStage {
    #[default]
    Vertex,
    TessCtrl,
    TessEval,
    Geometry,
    Fragment,
    Compute,
}

/// Number of distinct values of [`ShaderStage`].
pub const NUM_SHADER_STAGES: usize = 6;

impl ShaderStage {
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Key bits that force a monolithic compile when any of them is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonoKey {
    pub flags: u32,
}

impl MonoKey {
    pub fn is_default(&self) -> bool {
        *self == MonoKey::default()
    }
}

/// Optimization hints. Variants built from a non-default `opt` segment are
/// "optimized" and compiled speculatively in the background.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptKey {
    /// Mask of output slots the consumer never reads.
    pub kill_outputs: u64,
    /// NGG culling configuration bits.
    pub ngg_culling: u32,
    pub inline_uniforms: bool,
    /// Must remain the last field: prefix comparisons exclude it.
    pub inlined_uniform_values: [u32; MAX_INLINABLE_UNIFORMS],
}

impl OptKey {
    /// Equality over everything except the inlined uniform values.
    fn prefix_eq(&self, other: &OptKey) -> bool {
        self.kill_outputs == other.kill_outputs
            && self.ngg_culling == other.ngg_culling
            && self.inline_uniforms == other.inline_uniforms
    }
}

/// Compile-time specialization key for one shader variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderKey {
    pub stage: ShaderStage,
    /// Compiled as an export shader feeding a geometry stage.
    pub as_es: bool,
    /// Compiled as a local shader feeding a tessellation stage.
    pub as_ls: bool,
    /// Compiled for the NGG geometry pipeline.
    pub as_ngg: bool,
    pub mono: MonoKey,
    /// Must remain the last field: variant-equivalence excludes parts of it.
    pub opt: OptKey,
}

impl ShaderKey {
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            ..Self::default()
        }
    }

    /// Full comparison when uniform inlining is in use, otherwise the
    /// reduced comparison that ignores the inlined values.
    pub fn matches(&self, other: &ShaderKey, inline_uniforms: bool) -> bool {
        if inline_uniforms {
            self == other
        } else {
            self.prefix_matches(other)
        }
    }

    /// Equality over everything except `opt.inlined_uniform_values`.
    pub fn prefix_matches(&self, other: &ShaderKey) -> bool {
        self.stage == other.stage
            && self.as_es == other.as_es
            && self.as_ls == other.as_ls
            && self.as_ngg == other.as_ngg
            && self.mono == other.mono
            && self.opt.prefix_eq(&other.opt)
    }

    /// Whether the `opt` segment carries no optimization request. The
    /// inlined values are ignored when inlining itself is disabled.
    pub fn opt_is_default(&self, inline_uniforms: bool) -> bool {
        let zero = OptKey::default();
        if inline_uniforms {
            self.opt == zero
        } else {
            self.opt.prefix_eq(&zero)
        }
    }

    /// Reset the whole `opt` segment to the canonical unoptimized state.
    pub fn clear_opt(&mut self) {
        self.opt = OptKey::default();
    }

    /// Disable uniform inlining, zeroing the inlined values.
    pub fn clear_inlined_uniforms(&mut self) {
        self.opt.inline_uniforms = false;
        self.opt.inlined_uniform_values = [0; MAX_INLINABLE_UNIFORMS];
    }

    /// The key of the shared main part this variant links against: same
    /// stage linkage, everything else canonical.
    pub fn main_part_key(&self) -> ShaderKey {
        ShaderKey {
            stage: self.stage,
            as_es: self.as_es,
            as_ls: self.as_ls,
            as_ngg: self.as_ngg,
            ..ShaderKey::default()
        }
    }
}
