//! Per-program collection of compiled variants
//!
//! Keys live in their own array next to the variant pointers so the linear
//! scan touches contiguous memory. The store only ever grows; failed
//! variants stay in place (tagged) so a repeated lookup with the same key
//! reports the failure instead of re-triggering compilation.

use std::sync::Arc;

use crate::key::{ShaderKey, MAX_INLINABLE_UNIFORMS};
use crate::variant::ShaderVariant;

/// Result of a store lookup.
pub enum FindResult {
    Found(Arc<ShaderVariant>),
    /// The inlined-uniform variant ceiling was hit for this key prefix; the
    /// caller must retry with inlining disabled. Internal control flow, not
    /// a user-visible error.
    TooManyVariants,
    Missing,
}

/// Growable set of variants owned by one shader program. All mutation
/// happens under the owning program's mutex.
pub struct VariantStore {
    keys: Vec<ShaderKey>,
    variants: Vec<Arc<ShaderVariant>>,
}

impl VariantStore {
    pub fn new() -> Self {
        Self {
            keys: Vec::new(),
            variants: Vec::new(),
        }
    }

    /// Scan for a variant matching `key`. Prefix matches whose inlined
    /// uniform payload differs are counted; once `max_inline_variants` of
    /// them coexist, a new payload reports `TooManyVariants` instead of
    /// `Missing`, so at most that many inlined variants are ever created.
    /// Payloads that already have a variant stay findable at the ceiling.
    pub fn find(&self, key: &ShaderKey, inline_uniforms: bool, max_inline_variants: usize) -> FindResult {
        let mut variant_count = 0usize;

        for (iter_key, variant) in self.keys.iter().zip(&self.variants) {
            if !iter_key.prefix_matches(key) {
                continue;
            }

            // Check the inlined uniform values separately and count the
            // number of variants based on them.
            if inline_uniforms
                && key.opt.inline_uniforms
                && iter_key.opt.inlined_uniform_values != key.opt.inlined_uniform_values
            {
                variant_count += 1;
                if variant_count >= max_inline_variants {
                    return FindResult::TooManyVariants;
                }
                continue;
            }

            return FindResult::Found(variant.clone());
        }

        FindResult::Missing
    }

    /// Append a variant. Capacity grows in +2 steps; appends are rare and
    /// most programs never need more than a couple of variants.
    pub fn push(&mut self, variant: Arc<ShaderVariant>) {
        if self.keys.len() == self.keys.capacity() {
            self.keys.reserve_exact(2);
            self.variants.reserve_exact(2);
        }
        self.keys.push(variant.key);
        self.variants.push(variant);
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ShaderVariant>> {
        self.variants.iter()
    }
}

impl Default for VariantStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShaderStage;

    fn variant_with_values(values: [u32; MAX_INLINABLE_UNIFORMS]) -> Arc<ShaderVariant> {
        let mut key = ShaderKey::new(ShaderStage::Fragment);
        key.opt.inline_uniforms = true;
        key.opt.inlined_uniform_values = values;
        ShaderVariant::new(key, 64, true, true, None)
    }

    #[test]
    fn test_find_exact_inlined_match() {
        let mut store = VariantStore::new();
        store.push(variant_with_values([1, 0, 0, 0]));
        store.push(variant_with_values([2, 0, 0, 0]));

        let mut key = ShaderKey::new(ShaderStage::Fragment);
        key.opt.inline_uniforms = true;
        key.opt.inlined_uniform_values = [2, 0, 0, 0];

        assert!(matches!(store.find(&key, true, 5), FindResult::Found(v) if v.key == key));
    }

    #[test]
    fn test_ceiling_boundary_is_exact() {
        let mut store = VariantStore::new();
        let mut key = ShaderKey::new(ShaderStage::Fragment);
        key.opt.inline_uniforms = true;

        // Four distinct payloads: a fifth may still be created.
        for i in 0..4 {
            store.push(variant_with_values([100 + i, 0, 0, 0]));
        }
        key.opt.inlined_uniform_values = [9999, 0, 0, 0];
        assert!(matches!(store.find(&key, true, 5), FindResult::Missing));

        // At five coexisting payloads the ceiling closes for new ones.
        store.push(variant_with_values([104, 0, 0, 0]));
        assert!(matches!(store.find(&key, true, 5), FindResult::TooManyVariants));
        // A higher ceiling turns the same lookup into a plain miss.
        assert!(matches!(store.find(&key, true, 50), FindResult::Missing));

        // Payloads that already have a variant are still served.
        key.opt.inlined_uniform_values = [102, 0, 0, 0];
        assert!(matches!(store.find(&key, true, 5), FindResult::Found(_)));
    }

    #[test]
    fn test_reduced_comparison_ignores_values() {
        let mut store = VariantStore::new();
        store.push(variant_with_values([1, 2, 3, 4]));

        let mut key = ShaderKey::new(ShaderStage::Fragment);
        key.opt.inline_uniforms = true;
        key.opt.inlined_uniform_values = [5, 6, 7, 8];

        // With inlining comparison disabled the first prefix match wins.
        assert!(matches!(store.find(&key, false, 5), FindResult::Found(_)));
    }

    #[test]
    fn test_different_prefix_is_missing() {
        let mut store = VariantStore::new();
        store.push(variant_with_values([1, 0, 0, 0]));

        let mut key = ShaderKey::new(ShaderStage::Fragment);
        key.opt.inline_uniforms = true;
        key.opt.kill_outputs = 0xf;
        assert!(matches!(store.find(&key, true, 5), FindResult::Missing));
    }
}
