//
// disk_cache.rs
//
// Snapshot-validated cache of on-disk file contents
//

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use lru::LruCache;

/// Snapshot metadata for a file on disk, used to determine cache validity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileSnapshot {
    pub mtime: SystemTime,
    pub size: u64,
}

impl FileSnapshot {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: metadata.len(),
        }
    }

    /// Check if this snapshot matches current disk state
    pub fn matches_disk(&self, current: &FileSnapshot) -> bool {
        self.mtime == current.mtime && self.size == current.size
    }
}

/// Get file snapshot from disk (synchronous).
pub fn get_file_snapshot(path: &Path) -> Option<FileSnapshot> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(FileSnapshot::from_metadata(&metadata))
}

#[derive(Debug, Clone)]
struct CachedFile {
    snapshot: FileSnapshot,
    content: Arc<str>,
}

/// Contents of closed files, re-read whenever the file's mtime or size moves
pub struct DiskCache {
    inner: Mutex<LruCache<PathBuf, CachedFile>>,
}

impl Default for DiskCache {
    fn default() -> Self {
        Self::new(DiskCache::DEFAULT_CAPACITY)
    }
}

impl DiskCache {
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Read a file, serving the cached copy while its snapshot is fresh.
    pub fn read(&self, path: &Path) -> std::io::Result<Arc<str>> {
        let metadata = std::fs::metadata(path)?;
        let current = FileSnapshot::from_metadata(&metadata);

        if let Ok(mut guard) = self.inner.lock() {
            if let Some(cached) = guard.get(path) {
                if cached.snapshot.matches_disk(&current) {
                    return Ok(cached.content.clone());
                }
            }
        }

        let content: Arc<str> = Arc::from(std::fs::read_to_string(path)?);
        if let Ok(mut guard) = self.inner.lock() {
            guard.put(
                path.to_path_buf(),
                CachedFile {
                    snapshot: current,
                    content: content.clone(),
                },
            );
        }
        Ok(content)
    }

    pub fn invalidate(&self, path: &Path) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.pop(path);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_file_snapshot_mismatch_size() {
        let snap1 = FileSnapshot {
            mtime: SystemTime::UNIX_EPOCH,
            size: 100,
        };
        let snap2 = FileSnapshot {
            mtime: SystemTime::UNIX_EPOCH,
            size: 200,
        };
        assert!(!snap1.matches_disk(&snap2));
        assert!(snap1.matches_disk(&snap1.clone()));
    }

    #[test]
    fn test_read_and_cache() {
        let cache = DiskCache::default();
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "package a").unwrap();

        let content = cache.read(temp.path()).unwrap();
        assert_eq!(&*content, "package a\n");
        assert_eq!(cache.len(), 1);

        // Size change is picked up without explicit invalidation
        writeln!(temp, "var x = 1").unwrap();
        let content = cache.read(temp.path()).unwrap();
        assert!(content.contains("var x"));
    }

    #[test]
    fn test_invalidate_and_missing_file() {
        let cache = DiskCache::new(2);
        let temp = NamedTempFile::new().unwrap();
        cache.read(temp.path()).unwrap();
        cache.invalidate(temp.path());
        assert!(cache.is_empty());

        let missing = temp.path().with_extension("missing");
        assert!(cache.read(&missing).is_err());
    }

    #[test]
    fn test_capacity_bound() {
        let cache = DiskCache::new(1);
        let a = NamedTempFile::new().unwrap();
        let b = NamedTempFile::new().unwrap();
        cache.read(a.path()).unwrap();
        cache.read(b.path()).unwrap();
        assert_eq!(cache.len(), 1);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }
}
