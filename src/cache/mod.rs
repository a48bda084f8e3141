//! Action Cache: content-addressed memoization of action outputs, persisted to disk as
//! sharded entry/bulk file pairs.

pub mod bulk;
pub mod digest;
pub mod fingerprint;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::contracts::ScmProbe;
use crate::error::{CacheError, Result};

pub use digest::{DigestMemo, FileDigest};
pub use fingerprint::{action_key, bulk_key, Fingerprint, SerializeForFingerprint};

/// One historically seen input-content combination for a given action key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCacheBulk {
    pub bulk_key: Fingerprint,
    /// The recorded *actual* input digests this bulk was produced from; `cache_read` picks the
    /// first bulk whose digests all match the current ones.
    pub input_digests: Vec<FileDigestRecord>,
    pub outputs: Vec<PathBuf>,
}

/// A [`FileDigest`] without its `SystemTime`, which doesn't round-trip through `serde_json`
/// portably across platforms; only the content hash participates in equality for cache
/// matching, mtime is tracked separately for restore-on-inflate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDigestRecord {
    pub path: PathBuf,
    pub hash: [u8; 32],
    pub mtime_unix_secs: u64,
}

impl From<&FileDigest> for FileDigestRecord {
    fn from(d: &FileDigest) -> Self {
        let secs = d.mtime.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs();
        Self { path: d.path.clone(), hash: d.hash, mtime_unix_secs: secs }
    }
}

/// key + ordered list of bulks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionCacheEntry {
    pub bulks: Vec<ActionCacheBulk>,
}

/// The on-disk, fingerprint-addressed action cache.
pub struct ActionCache {
    root: PathBuf,
    seed: u64,
    digests: DigestMemo,
    /// Serializes entry read-modify-write so two concurrent writers for the same key don't
    /// interleave.
    write_lock: Mutex<()>,
}

/// Result of a cache lookup.
pub enum CacheLookup {
    Hit { restored: Vec<PathBuf> },
    Miss,
}

impl ActionCache {
    pub fn new(root: impl Into<PathBuf>, seed: u64) -> Self {
        Self { root: root.into(), seed, digests: DigestMemo::new(), write_lock: Mutex::new(()) }
    }

    fn entry_path(&self, key: Fingerprint) -> PathBuf {
        let (hi, lo) = key.shard();
        self.root.join(hi).join(lo).join(format!("{}.cache.json", key.hex()))
    }

    fn bulk_path(&self, key: Fingerprint) -> PathBuf {
        let (hi, lo) = key.shard();
        self.root.join(hi).join(lo).join(format!("{}.bulk.zip", key.hex()))
    }

    fn load_entry(&self, key: Fingerprint) -> Option<ActionCacheEntry> {
        let path = self.entry_path(key);
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn save_entry(&self, key: Fingerprint, entry: &ActionCacheEntry) -> Result<()> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(CacheError::from)?;
        }
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(entry).map_err(CacheError::from)?;
        std::fs::write(&tmp, bytes).map_err(CacheError::from)?;
        std::fs::rename(&tmp, &path).map_err(CacheError::from)?;
        Ok(())
    }

    /// Consults the SCM probe before computing any cache key; if any declared input is locally
    /// modified, caching is disabled for this action entirely.
    pub fn effective_cache_mode(
        &self,
        declared_inputs: &[PathBuf],
        requested: crate::contracts::CacheMode,
        scm: &dyn ScmProbe,
    ) -> crate::contracts::CacheMode {
        if declared_inputs.iter().any(|p| scm.has_unversioned_modifications(p)) {
            tracing::debug!("disabling cache for action: declared input is locally modified");
            crate::contracts::CacheMode::None
        } else {
            requested
        }
    }

    pub fn digest_memo(&self) -> &DigestMemo {
        &self.digests
    }

    /// `action_key = H(seed, serialize(rules), declared input digests)`.
    pub fn compute_action_key(&self, rules: &impl SerializeForFingerprint, declared: &[FileDigest]) -> Fingerprint {
        action_key(self.seed, rules, declared)
    }

    /// `cache_read`: load the entry, pick the first bulk whose recorded input digests all match
    /// the current ones, and inflate it. Never returns an `Err` that should abort the build —
    /// any failure degrades to [`CacheLookup::Miss`].
    #[tracing::instrument(skip(self, actual_inputs))]
    pub fn cache_read(&self, action_key: Fingerprint, actual_inputs: &[FileDigest], dest_root: &Path) -> CacheLookup {
        let Some(entry) = self.load_entry(action_key) else {
            return CacheLookup::Miss;
        };
        for bulk in &entry.bulks {
            if bulk_matches(bulk, actual_inputs) {
                let bulk_path = self.bulk_path(bulk.bulk_key);
                let mtimes: Vec<_> = bulk
                    .input_digests
                    .iter()
                    .map(|r| (r.path.clone(), std::time::UNIX_EPOCH + std::time::Duration::from_secs(r.mtime_unix_secs)))
                    .collect();
                match bulk::inflate(&bulk_path, dest_root, &mtimes) {
                    Ok(restored) => return CacheLookup::Hit { restored },
                    Err(err) => {
                        tracing::warn!(%err, "cache read degraded to miss: bulk inflate failed");
                        return CacheLookup::Miss;
                    }
                }
            }
        }
        CacheLookup::Miss
    }

    /// `cache_write`: append a new bulk for `actual_inputs` unless one matching it already
    /// exists. Failures are logged and swallowed — a write failure should never fail the build
    /// that produced the outputs it's trying to persist.
    #[tracing::instrument(skip(self, actual_inputs, artifacts))]
    pub fn cache_write(&self, action_key: Fingerprint, actual_inputs: &[FileDigest], artifacts: &[bulk::ArtifactFile]) {
        if let Err(err) = self.try_cache_write(action_key, actual_inputs, artifacts) {
            tracing::error!(%err, "cache write failed, continuing without caching this result");
        }
    }

    fn try_cache_write(&self, action_key: Fingerprint, actual_inputs: &[FileDigest], artifacts: &[bulk::ArtifactFile]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut entry = self.load_entry(action_key).unwrap_or_default();
        let key = bulk_key(action_key, actual_inputs);

        if entry.bulks.iter().any(|b| b.bulk_key == key) {
            return Ok(()); // no-op: an identical bulk is already present.
        }

        let bulk_path = self.bulk_path(key);
        bulk::deflate(&bulk_path, artifacts)?;

        entry.bulks.push(ActionCacheBulk {
            bulk_key: key,
            input_digests: actual_inputs.iter().map(FileDigestRecord::from).collect(),
            outputs: artifacts.iter().map(|a| a.relative_path.clone()).collect(),
        });
        self.save_entry(action_key, &entry)
    }
}

fn bulk_matches(bulk: &ActionCacheBulk, actual_inputs: &[FileDigest]) -> bool {
    if bulk.input_digests.len() != actual_inputs.len() {
        return false;
    }
    actual_inputs.iter().all(|actual| {
        bulk.input_digests.iter().any(|recorded| recorded.path == actual.path && recorded.hash == actual.hash)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::NullScmProbe;
    use std::time::SystemTime;

    #[derive(Serialize)]
    struct Rules {
        args: Vec<String>,
    }

    #[test]
    fn write_then_read_is_a_hit() {
        let cache_dir = tempfile::tempdir().unwrap();
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();

        let cache = ActionCache::new(cache_dir.path(), 0);
        let rules = Rules { args: vec!["-c".into()] };
        let input = FileDigest { path: PathBuf::from("a.cpp"), hash: [1u8; 32], mtime: SystemTime::now(), size: 1 };
        let key = cache.compute_action_key(&rules, &[input.clone()]);

        let artifact_path = src_dir.path().join("a.o");
        std::fs::write(&artifact_path, b"obj").unwrap();
        let artifacts = vec![bulk::ArtifactFile {
            relative_path: PathBuf::from("a.o"),
            absolute_path: artifact_path,
            mtime: SystemTime::now(),
        }];
        cache.cache_write(key, &[input.clone()], &artifacts);

        match cache.cache_read(key, &[input], dest_dir.path()) {
            CacheLookup::Hit { restored } => assert_eq!(restored.len(), 1),
            CacheLookup::Miss => panic!("expected cache hit"),
        }
    }

    #[test]
    fn mismatched_inputs_is_a_miss() {
        let cache_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::new(cache_dir.path(), 0);
        let rules = Rules { args: vec!["-c".into()] };
        let input_a = FileDigest { path: PathBuf::from("a.cpp"), hash: [1u8; 32], mtime: SystemTime::now(), size: 1 };
        let input_b = FileDigest { path: PathBuf::from("a.cpp"), hash: [2u8; 32], mtime: SystemTime::now(), size: 1 };
        let key = cache.compute_action_key(&rules, &[input_a.clone()]);

        match cache.cache_read(key, &[input_b], dest_dir.path()) {
            CacheLookup::Miss => {}
            CacheLookup::Hit { .. } => panic!("expected miss: no entry written yet"),
        }
    }

    #[test]
    fn scm_modification_disables_cache_mode() {
        struct AlwaysModified;
        impl ScmProbe for AlwaysModified {
            fn has_unversioned_modifications(&self, _p: &Path) -> bool {
                true
            }
            fn foreach_local_modification(&self, _cb: &mut dyn FnMut(&Path)) {}
        }
        let cache = ActionCache::new(tempfile::tempdir().unwrap().path(), 0);
        let mode = cache.effective_cache_mode(&[PathBuf::from("a.cpp")], crate::contracts::CacheMode::ReadWrite, &AlwaysModified);
        assert_eq!(mode, crate::contracts::CacheMode::None);

        let mode2 = cache.effective_cache_mode(&[PathBuf::from("a.cpp")], crate::contracts::CacheMode::ReadWrite, &NullScmProbe);
        assert_eq!(mode2, crate::contracts::CacheMode::ReadWrite);
    }
}
