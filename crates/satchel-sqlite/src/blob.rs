/// Content-addressed attachment storage.
///
/// Each blob lives at `<dir>/<hex-sha1>` of its bytes. Writes stream
/// through a `temp-<uuid>` file in the same directory and finish with a
/// rename, which is atomic on one filesystem and idempotent when two
/// writers race on identical content. Temp files orphaned by a crash are
/// removed by the startup sweep.
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use satchel_core::document::Encoding;
use satchel_core::error::{Result, SatchelError};

const TEMP_PREFIX: &str = "temp-";

pub fn sha1_hex(bytes: &[u8]) -> String {
    let digest = Sha1::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn valid_key(digest: &str) -> bool {
    digest.len() == 40 && digest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open the blob directory, creating it if needed and sweeping
    /// leftover temp files.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = BlobStore { dir: dir.into() };
        fs::create_dir_all(&store.dir)?;
        let swept = store.sweep_temp()?;
        if swept > 0 {
            tracing::debug!(swept, dir = %store.dir.display(), "removed orphaned temp blobs");
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, digest: &str) -> Result<PathBuf> {
        if !valid_key(digest) {
            return Err(SatchelError::BadRequest(format!(
                "invalid blob key: {digest}"
            )));
        }
        Ok(self.dir.join(digest))
    }

    /// Stream `reader` into the store. Returns `(digest, length)`.
    pub fn put(&self, reader: &mut dyn Read) -> Result<(String, u64)> {
        let temp_path = self.dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        let mut file = File::create(&temp_path)?;
        let mut hasher = Sha1::new();
        let mut length: u64 = 0;
        let mut buf = [0u8; 8192];

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&temp_path);
                    return Err(e.into());
                }
            };
            hasher.update(&buf[..n]);
            if let Err(e) = file.write_all(&buf[..n]) {
                drop(file);
                let _ = fs::remove_file(&temp_path);
                return Err(e.into());
            }
            length += n as u64;
        }
        file.sync_all()?;
        drop(file);

        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        // last-writer-wins of identical content
        fs::rename(&temp_path, self.dir.join(&digest))?;
        Ok((digest, length))
    }

    pub fn put_bytes(&self, bytes: &[u8]) -> Result<(String, u64)> {
        let mut cursor = std::io::Cursor::new(bytes);
        self.put(&mut cursor)
    }

    /// Open a blob for streaming reads.
    pub fn get(&self, digest: &str) -> Result<File> {
        let path = self.path_for(digest)?;
        File::open(&path).map_err(|_| SatchelError::DocumentMissing(format!("blob {digest}")))
    }

    pub fn read(&self, digest: &str) -> Result<Vec<u8>> {
        let mut file = self.get(digest)?;
        let mut out = Vec::new();
        file.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Read a blob, inflating it when stored gzip-encoded.
    pub fn read_decoded(&self, digest: &str, encoding: Encoding) -> Result<Vec<u8>> {
        match encoding {
            Encoding::Plain => self.read(digest),
            Encoding::Gzip => {
                let file = self.get(digest)?;
                let mut decoder = GzDecoder::new(file);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    pub fn exists(&self, digest: &str) -> bool {
        self.path_for(digest).map(|p| p.exists()).unwrap_or(false)
    }

    /// Unlink a blob. Idempotent.
    pub fn remove(&self, digest: &str) -> Result<()> {
        let path = self.path_for(digest)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `temp-*` files left behind by interrupted writes.
    pub fn sweep_temp(&self) -> Result<usize> {
        let mut swept = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TEMP_PREFIX) {
                fs::remove_file(entry.path())?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Delete every blob whose digest is not in `live`. Returns the number
    /// removed.
    pub fn retain(&self, live: &HashSet<String>) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            if !live.contains(&name) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path().join("attachments")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, store) = store();
        let (digest, length) = store.put_bytes(b"hello blob").unwrap();
        assert_eq!(length, 10);
        assert_eq!(digest, sha1_hex(b"hello blob"));
        assert!(store.exists(&digest));
        assert_eq!(store.read(&digest).unwrap(), b"hello blob");
    }

    #[test]
    fn identical_content_stores_once() {
        let (_dir, store) = store();
        let (d1, _) = store.put_bytes(b"same").unwrap();
        let (d2, _) = store.put_bytes(b"same").unwrap();
        assert_eq!(d1, d2);

        let files: Vec<_> = fs::read_dir(store.dir()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, store) = store();
        let (digest, _) = store.put_bytes(b"x").unwrap();
        store.remove(&digest).unwrap();
        store.remove(&digest).unwrap();
        assert!(!store.exists(&digest));
    }

    #[test]
    fn sweep_removes_temp_files() {
        let (_dir, store) = store();
        let orphan = store.dir().join("temp-deadbeef");
        fs::write(&orphan, b"partial").unwrap();
        let swept = store.sweep_temp().unwrap();
        assert_eq!(swept, 1);
        assert!(!orphan.exists());
    }

    #[test]
    fn open_sweeps_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attachments");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("temp-leftover"), b"junk").unwrap();

        let store = BlobStore::open(&path).unwrap();
        assert!(!store.dir().join("temp-leftover").exists());
    }

    #[test]
    fn retain_removes_exactly_unreferenced() {
        let (_dir, store) = store();
        let (live, _) = store.put_bytes(b"live").unwrap();
        let (dead, _) = store.put_bytes(b"dead").unwrap();

        let mut keep = HashSet::new();
        keep.insert(live.clone());
        let removed = store.retain(&keep).unwrap();

        assert_eq!(removed, 1);
        assert!(store.exists(&live));
        assert!(!store.exists(&dead));
    }

    #[test]
    fn rejects_bad_keys() {
        let (_dir, store) = store();
        assert!(store.get("../escape").is_err());
        assert!(store.get("short").is_err());
    }

    #[test]
    fn read_decoded_inflates_gzip() {
        let (_dir, store) = store();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"plain text body").unwrap();
        let gz = encoder.finish().unwrap();

        let (digest, _) = store.put_bytes(&gz).unwrap();
        let plain = store.read_decoded(&digest, Encoding::Gzip).unwrap();
        assert_eq!(plain, b"plain text body");
    }
}
