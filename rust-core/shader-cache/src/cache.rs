//! Two-tier shader cache: in-memory hash table + persistent disk tier
//!
//! The memory tier is a single-mutex hash map with explicit byte accounting
//! against a budget; once the budget is exceeded new entries only go to
//! disk. Disk entries are validated (size bookkeeping + blob CRC) on load;
//! anything inconsistent is evicted and reported as a plain miss so that
//! corruption can never fail a draw.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::blob::{decode_group, encode_group, ShaderBinary};
use crate::disk::{DiskCache, DiskKey};
use crate::key::IrCacheKey;

/// Default memory-tier budget: 64 MiB on 32-bit hosts, 1 GiB otherwise.
pub const DEFAULT_MEMORY_BUDGET: usize = if cfg!(target_pointer_width = "32") {
    64 * 1024 * 1024
} else {
    1024 * 1024 * 1024
};

/// Cache performance statistics, tracked per tier. Observability only.
#[derive(Debug, Clone, Default)]
pub struct ShaderCacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub disk_hits: u64,
    pub disk_misses: u64,
    pub entry_count: usize,
    pub current_size: usize,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    disk_hits: AtomicU64,
    disk_misses: AtomicU64,
}

struct MemoryTier {
    entries: HashMap<IrCacheKey, Arc<[u8]>>,
    size: usize,
}

/// Two-tier cache of serialized shader binaries keyed by IR content hash.
pub struct ShaderCache {
    memory: Mutex<MemoryTier>,
    budget: usize,
    disk: Option<Box<dyn DiskCache>>,
    disk_salt: Vec<u8>,
    counters: Counters,
}

impl ShaderCache {
    /// Create a memory-only cache with the default budget.
    pub fn new() -> Self {
        Self::with_budget(DEFAULT_MEMORY_BUDGET)
    }

    /// Create a memory-only cache with an explicit byte budget.
    pub fn with_budget(budget: usize) -> Self {
        Self {
            memory: Mutex::new(MemoryTier {
                entries: HashMap::new(),
                size: 0,
            }),
            budget,
            disk: None,
            disk_salt: Vec::new(),
            counters: Counters::default(),
        }
    }

    /// Attach a disk tier. `salt` scopes disk keys to one installation.
    pub fn with_disk(mut self, disk: Box<dyn DiskCache>, salt: &[u8]) -> Self {
        self.disk = Some(disk);
        self.disk_salt = salt.to_vec();
        self
    }

    /// Insert a compiled shader group (1 blob, or 2 for geometry paired with
    /// its GS copy shader). Assumed not already present; an existing entry
    /// is left untouched. Never fails from the caller's point of view:
    /// serialization or table-insert problems drop the attempt silently.
    pub fn insert(&self, key: &IrCacheKey, group: &[ShaderBinary], to_disk: bool) {
        let memory_full = self.memory.lock().size >= self.budget;
        if memory_full && !to_disk {
            return;
        }

        let blob: Arc<[u8]> = match encode_group(group) {
            Ok(blob) => blob.into(),
            Err(e) => {
                tracing::warn!("dropping shader cache insert: {}", e);
                return;
            }
        };

        {
            let mut memory = self.memory.lock();
            if memory.entries.contains_key(key) {
                return; // already added
            }
            if memory.size < self.budget {
                memory.size += blob.len();
                memory.entries.insert(*key, blob.clone());
            }
        }

        if to_disk {
            if let Some(disk) = &self.disk {
                disk.put(&DiskKey::derive(key, &self.disk_salt), &blob);
            }
        }
    }

    /// Look up a shader group. Checks the memory tier first, the disk tier
    /// on miss. Corrupt disk entries are evicted (best effort) and reported
    /// as a miss. Disk hits are promoted into the memory tier.
    pub fn load(&self, key: &IrCacheKey, expect_copy_shader: bool) -> Option<Vec<ShaderBinary>> {
        let cached = self.memory.lock().entries.get(key).cloned();
        if let Some(blob) = cached {
            match decode_group(&blob, expect_copy_shader) {
                Ok(group) => {
                    self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(group);
                }
                Err(e) => {
                    // Memory entries are written by us; this indicates the
                    // caller's copy-shader expectation changed, not rot.
                    tracing::warn!("in-memory shader cache entry rejected: {}", e);
                }
            }
        }
        self.counters.memory_misses.fetch_add(1, Ordering::Relaxed);

        let disk = self.disk.as_ref()?;
        let disk_key = DiskKey::derive(key, &self.disk_salt);

        if let Some(buffer) = disk.get(&disk_key) {
            match decode_group(&buffer, expect_copy_shader) {
                Ok(group) => {
                    self.promote(key, buffer.into());
                    self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(group);
                }
                Err(e) => {
                    tracing::warn!("evicting corrupt shader disk cache entry: {}", e);
                    disk.remove(&disk_key);
                }
            }
        }

        self.counters.disk_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Bytes currently accounted against the memory budget.
    pub fn current_size(&self) -> usize {
        self.memory.lock().size
    }

    /// Snapshot of the per-tier hit/miss counters.
    pub fn stats(&self) -> ShaderCacheStats {
        let memory = self.memory.lock();
        ShaderCacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            memory_misses: self.counters.memory_misses.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            disk_misses: self.counters.disk_misses.load(Ordering::Relaxed),
            entry_count: memory.entries.len(),
            current_size: memory.size,
        }
    }

    /// Copy a validated disk blob into the memory tier without re-writing
    /// the disk entry.
    fn promote(&self, key: &IrCacheKey, blob: Arc<[u8]>) {
        let mut memory = self.memory.lock();
        if memory.size < self.budget && !memory.entries.contains_key(key) {
            memory.size += blob.len();
            memory.entries.insert(*key, blob);
        }
    }
}

impl Default for ShaderCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::FsDiskCache;
    use crate::key::{ir_cache_key, CompileFlags};

    fn binary_with_code(code: &[u8]) -> ShaderBinary {
        ShaderBinary {
            code: code.to_vec(),
            ..ShaderBinary::default()
        }
    }

    #[test]
    fn test_insert_then_load_is_content_equal() {
        let cache = ShaderCache::new();
        let key = ir_cache_key(b"ir-a", CompileFlags::default());
        let group = vec![binary_with_code(&[1, 2, 3])];

        cache.insert(&key, &group, false);
        assert_eq!(cache.load(&key, false), Some(group));

        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.entry_count, 1);
        assert!(stats.current_size > 0);
    }

    #[test]
    fn test_existing_entry_left_untouched() {
        let cache = ShaderCache::new();
        let key = ir_cache_key(b"ir-a", CompileFlags::default());

        cache.insert(&key, &[binary_with_code(&[1])], false);
        let size_after_first = cache.current_size();
        cache.insert(&key, &[binary_with_code(&[2, 2, 2, 2])], false);

        assert_eq!(cache.current_size(), size_after_first);
        assert_eq!(cache.load(&key, false).unwrap()[0].code, vec![1]);
    }

    #[test]
    fn test_budget_exceeded_skips_memory_tier() {
        let dir = tempfile::tempdir().unwrap();
        let disk = Box::new(FsDiskCache::new(dir.path()).unwrap());
        let cache = ShaderCache::with_budget(1).with_disk(disk, b"test");

        let key_a = ir_cache_key(b"a", CompileFlags::default());
        let key_b = ir_cache_key(b"b", CompileFlags::default());

        // First insert lands in memory (size was still under budget).
        cache.insert(&key_a, &[binary_with_code(&[1])], true);
        assert_eq!(cache.stats().entry_count, 1);

        // Budget is now exceeded: memory is skipped, disk still written.
        cache.insert(&key_b, &[binary_with_code(&[2])], true);
        assert_eq!(cache.stats().entry_count, 1);
        assert!(cache.load(&key_b, false).is_some());
        assert_eq!(cache.stats().disk_hits, 1);
    }

    #[test]
    fn test_disk_hit_promotes_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let key = ir_cache_key(b"ir", CompileFlags::default());

        {
            let disk = Box::new(FsDiskCache::new(dir.path()).unwrap());
            let warm = ShaderCache::new().with_disk(disk, b"test");
            warm.insert(&key, &[binary_with_code(&[7])], true);
        }

        // Fresh process: empty memory tier, same disk directory.
        let disk = Box::new(FsDiskCache::new(dir.path()).unwrap());
        let cache = ShaderCache::new().with_disk(disk, b"test");

        assert!(cache.load(&key, false).is_some());
        assert!(cache.load(&key, false).is_some());

        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_hits, 1);
    }

    #[test]
    fn test_corrupt_disk_entry_is_miss_and_evicted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let key = ir_cache_key(b"ir", CompileFlags::default());

        {
            let disk = Box::new(FsDiskCache::new(dir.path())?);
            let warm = ShaderCache::new().with_disk(disk, b"test");
            warm.insert(&key, &[binary_with_code(&[9, 9, 9])], true);
        }

        // Flip one payload bit in the single on-disk entry.
        let entry = std::fs::read_dir(dir.path())?
            .next()
            .expect("disk cache directory is empty")?
            .path();
        let mut bytes = std::fs::read(&entry)?;
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&entry, &bytes)?;

        let disk = Box::new(FsDiskCache::new(dir.path())?);
        let cache = ShaderCache::new().with_disk(disk, b"test");

        assert!(cache.load(&key, false).is_none());
        assert_eq!(cache.stats().disk_misses, 1);
        // The corrupt entry was evicted.
        assert!(!entry.exists());
        Ok(())
    }

    #[test]
    fn test_geometry_group_with_copy_shader() {
        let cache = ShaderCache::new();
        let key = ir_cache_key(b"gs", CompileFlags::default());
        let group = vec![binary_with_code(&[1]), binary_with_code(&[2])];

        cache.insert(&key, &group, false);
        assert_eq!(cache.load(&key, true), Some(group));
        // Asking for the wrong shape is a miss, not an error.
        assert!(cache.load(&key, false).is_none());
    }
}
