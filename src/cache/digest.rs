//! Content digests, memoized by path + mtime + size so repeated `need_file` calls against an
//! unchanged file don't re-hash it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Sha3};

/// (path, strong content hash), plus the mtime/size pair it was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub path: PathBuf,
    pub hash: [u8; 32],
    pub mtime: SystemTime,
    pub size: u64,
}

impl FileDigest {
    pub fn hex(&self) -> String {
        hex::encode(self.hash)
    }
}

fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3::v256();
    hasher.update(bytes);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

/// A process-wide cache of computed digests keyed by path, invalidated whenever the recorded
/// mtime/size pair no longer matches the filesystem.
#[derive(Default)]
pub struct DigestMemo {
    entries: Mutex<HashMap<PathBuf, FileDigest>>,
}

impl DigestMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the memoized digest for `path`, recomputing it if the file's mtime/size has
    /// changed since it was last hashed (or if this is the first request).
    pub fn digest(&self, path: &Path) -> std::io::Result<FileDigest> {
        let meta = fs::metadata(path)?;
        let mtime = meta.modified()?;
        let size = meta.len();

        {
            let cache = self.entries.lock().unwrap();
            if let Some(existing) = cache.get(path) {
                if existing.mtime == mtime && existing.size == size {
                    return Ok(existing.clone());
                }
            }
        }

        let bytes = fs::read(path)?;
        let digest = FileDigest { path: path.to_path_buf(), hash: hash_bytes(&bytes), mtime, size };
        self.entries.lock().unwrap().insert(path.to_path_buf(), digest.clone());
        Ok(digest)
    }

    /// A listing hash for a directory dependency: the set of immediate
    /// entry names, sorted, hashed together. Does not recurse — directory dependencies track
    /// "what's in this directory", not the contents of its files.
    pub fn directory_listing_hash(&self, dir: &Path) -> std::io::Result<[u8; 32]> {
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        Ok(hash_bytes(names.join("\u{0}").as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_for_unchanged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let memo = DigestMemo::new();
        let d1 = memo.digest(&path).unwrap();
        let d2 = memo.digest(&path).unwrap();
        assert_eq!(d1.hash, d2.hash);
    }

    #[test]
    fn digest_changes_when_content_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello").unwrap();
        let memo = DigestMemo::new();
        let d1 = memo.digest(&path).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        std::fs::write(&path, b"world!!").unwrap();
        let d2 = memo.digest(&path).unwrap();
        assert_ne!(d1.hash, d2.hash);
    }
}
