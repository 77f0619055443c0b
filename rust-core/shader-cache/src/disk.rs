//! Persistent disk tier for the shader cache
//!
//! The disk tier is a collaborator: anything content-addressed and
//! crash-consistent at the granularity of one `put` works. The bundled
//! `FsDiskCache` keeps one file per entry and makes `put` atomic with a
//! temp-file rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::key::IrCacheKey;

/// Key used by the disk tier: the IR key re-hashed with an
/// installation-scoped salt, so caches from different driver builds or
/// installs never read each other's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskKey(pub [u8; 20]);

impl DiskKey {
    /// Derive the disk key for an IR key under the given salt.
    pub fn derive(key: &IrCacheKey, salt: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(salt);
        hasher.update(key.as_bytes());

        let mut out = [0u8; 20];
        out.copy_from_slice(&hasher.finalize().as_bytes()[..20]);
        DiskKey(out)
    }

    fn to_hex(self) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(40);
        for b in self.0 {
            write!(out, "{:02x}", b).unwrap();
        }
        out
    }
}

/// Content-addressed persistent blob store.
pub trait DiskCache: Send + Sync {
    fn get(&self, key: &DiskKey) -> Option<Vec<u8>>;
    fn put(&self, key: &DiskKey, data: &[u8]);
    /// Best-effort eviction; failures are not reported.
    fn remove(&self, key: &DiskKey);
}

/// File-per-entry disk cache rooted at a directory.
pub struct FsDiskCache {
    base_path: PathBuf,
}

impl FsDiskCache {
    /// Open (creating if needed) a disk cache at `base_path`.
    pub fn new<P: AsRef<Path>>(base_path: P) -> std::io::Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn entry_path(&self, key: &DiskKey) -> PathBuf {
        self.base_path.join(key.to_hex())
    }
}

impl DiskCache for FsDiskCache {
    fn get(&self, key: &DiskKey) -> Option<Vec<u8>> {
        fs::read(self.entry_path(key)).ok()
    }

    fn put(&self, key: &DiskKey, data: &[u8]) {
        // Write-then-rename keeps the entry either absent or complete.
        let path = self.entry_path(key);
        let tmp = path.with_extension("tmp");
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_data()?;
            fs::rename(&tmp, &path)
        })();

        if let Err(e) = result {
            tracing::warn!("failed to write disk cache entry: {}", e);
            let _ = fs::remove_file(&tmp);
        }
    }

    fn remove(&self, key: &DiskKey) {
        if let Err(e) = fs::remove_file(self.entry_path(key)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to evict disk cache entry: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ir_cache_key, CompileFlags};

    #[test]
    fn test_fs_disk_cache_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = FsDiskCache::new(dir.path())?;
        let key = DiskKey::derive(&ir_cache_key(b"ir", CompileFlags::default()), b"salt");

        assert!(cache.get(&key).is_none());
        cache.put(&key, b"payload");
        assert_eq!(cache.get(&key).as_deref(), Some(&b"payload"[..]));

        cache.remove(&key);
        assert!(cache.get(&key).is_none());
        // Double remove stays silent.
        cache.remove(&key);
        Ok(())
    }

    #[test]
    fn test_disk_key_is_salted() {
        let key = ir_cache_key(b"ir", CompileFlags::default());
        assert_ne!(DiskKey::derive(&key, b"a"), DiskKey::derive(&key, b"b"));
    }
}
