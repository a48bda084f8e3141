//! ZIP-based bulk storage: one bulk is a ZIP archive of a successful action's
//! outputs, keyed by the [`crate::cache::fingerprint::Fingerprint`] of the inputs that produced
//! it.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{CacheError, Result};

/// One artifact captured in a bulk: its path relative to the source root and its mtime, so
/// inflate can restore both byte-for-byte content and the original modification time.
pub struct ArtifactFile {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub mtime: std::time::SystemTime,
}

/// Writes `artifacts` into a new ZIP bulk at `bulk_path`, using Zstd compression. The codec is
/// recorded as the ZIP entries' own compression method, not a second file extension, so the
/// bulk file is simply named `.bulk.zip`.
pub fn deflate(bulk_path: &Path, artifacts: &[ArtifactFile]) -> Result<()> {
    if let Some(parent) = bulk_path.parent() {
        std::fs::create_dir_all(parent).map_err(CacheError::from)?;
    }
    let tmp_path = bulk_path.with_extension("tmp");
    {
        let file = std::fs::File::create(&tmp_path).map_err(CacheError::from)?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Zstd);
        for artifact in artifacts {
            // The ZIP entry's own timestamp is not authoritative — mtime is restored from the
            // `ActionCacheBulk`'s recorded digests on inflate, since ZIP's DOS-epoch timestamp
            // resolution (2 seconds) is too coarse for build fingerprinting.
            writer
                .start_file(artifact.relative_path.to_string_lossy(), options)
                .map_err(CacheError::from)?;
            let mut src = std::fs::File::open(&artifact.absolute_path).map_err(CacheError::from)?;
            std::io::copy(&mut src, &mut writer).map_err(CacheError::from)?;
        }
        writer.finish().map_err(CacheError::from)?;
    }
    // Atomic rename: a partially written bulk under `tmp_path` never becomes visible under the
    // real name, so a cancelled write can't be mistaken for a complete one.
    std::fs::rename(&tmp_path, bulk_path).map_err(CacheError::from)?;
    Ok(())
}

/// Inflates a bulk into `dest_root`, restoring each entry's original mtime (stored out-of-band
/// as a sidecar, since ZIP's own date resolution is too coarse for sub-second build
/// fingerprinting — see [`super::ActionCacheBulk::input_digests`] for the authoritative mtimes
/// consumers should trust).
pub fn inflate(bulk_path: &Path, dest_root: &Path, mtimes: &[(PathBuf, std::time::SystemTime)]) -> Result<Vec<PathBuf>> {
    let file = std::fs::File::open(bulk_path).map_err(CacheError::from)?;
    let mut archive = ZipArchive::new(file).map_err(CacheError::from)?;
    let mut restored = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(CacheError::from)?;
        let relative = PathBuf::from(entry.name());
        let dest = dest_root.join(&relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(CacheError::from)?;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).map_err(CacheError::from)?;
        std::fs::File::create(&dest).and_then(|mut f| f.write_all(&buf)).map_err(CacheError::from)?;

        if let Some((_, mtime)) = mtimes.iter().find(|(p, _)| p == &relative) {
            let ft = FileTime::from_system_time(*mtime);
            filetime::set_file_mtime(&dest, ft).map_err(CacheError::from)?;
        }
        restored.push(dest);
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_bytes_and_mtime() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        let artifact_path = src_dir.path().join("a.o");
        std::fs::write(&artifact_path, b"object bytes").unwrap();
        let mtime = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        filetime::set_file_mtime(&artifact_path, FileTime::from_system_time(mtime)).unwrap();

        let bulk_path = cache_dir.path().join("deadbeef.bulk.zip");
        let artifacts = vec![ArtifactFile {
            relative_path: PathBuf::from("a.o"),
            absolute_path: artifact_path.clone(),
            mtime,
        }];
        deflate(&bulk_path, &artifacts).unwrap();
        assert!(bulk_path.exists());

        let restored = inflate(&bulk_path, dest_dir.path(), &[(PathBuf::from("a.o"), mtime)]).unwrap();
        assert_eq!(restored.len(), 1);
        let content = std::fs::read(&restored[0]).unwrap();
        assert_eq!(content, b"object bytes");

        let restored_mtime = std::fs::metadata(&restored[0]).unwrap().modified().unwrap();
        let diff = restored_mtime.duration_since(mtime).unwrap_or_default();
        assert!(diff.as_secs() < 2);
    }
}
