// src/watch/hash.rs

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blake3::Hasher;
use tracing::debug;

/// blake3 hex digest and byte length of a file's contents.
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut hasher = Hasher::new();
    let mut file = File::open(path).with_context(|| format!("opening file for hashing: {path:?}"))?;
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hasher.finalize().to_hex().to_string(), size))
}

/// Last content hash seen per file, so that events which did not change the
/// contents (touch, metadata updates, duplicate notifications) are dropped.
#[derive(Debug, Default)]
pub struct ContentCache {
    hashes: HashMap<PathBuf, String>,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `hash` for `path`. Returns false if it equals the cached hash.
    pub fn update(&mut self, path: &Path, hash: &str) -> bool {
        if self.hashes.get(path).is_some_and(|h| h == hash) {
            debug!(?path, "contents unchanged");
            return false;
        }
        self.hashes.insert(path.to_path_buf(), hash.to_string());
        true
    }

    /// Forget `path`. Returns whether it was known.
    pub fn remove(&mut self, path: &Path) -> bool {
        self.hashes.remove(path).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_tracks_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let (h1, size) = hash_file(file.path()).unwrap();
        assert_eq!(size, 5);
        assert_eq!(h1, blake3::hash(b"hello").to_hex().to_string());

        let mut cache = ContentCache::new();
        assert!(cache.update(file.path(), &h1));
        assert!(!cache.update(file.path(), &h1));

        file.write_all(b" world").unwrap();
        let (h2, _) = hash_file(file.path()).unwrap();
        assert!(cache.update(file.path(), &h2));
        assert!(cache.remove(file.path()));
    }
}
