use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;

use crate::storage::{fanout_path, key_hash, BlobCache, CachedBlob, HeaderCache};

// Blobs and header sidecars are content-addressed by sha1(path) with a
// two-level directory fanout. The blob file's mtime is the stored
// last-modified timestamp. Replacement is write-to-temp then rename, so a
// reader never observes a half-written entry.
pub struct DiskStore {
    blob_root: PathBuf,
    header_root: PathBuf,
}

impl DiskStore {
    pub fn new(dir: &Path) -> Result<Self> {
        let blob_root = dir.join("blobs");
        let header_root = dir.join("headers");
        fs::create_dir_all(&blob_root)
            .with_context(|| format!("create blob dir {}", blob_root.display()))?;
        fs::create_dir_all(&header_root)
            .with_context(|| format!("create header dir {}", header_root.display()))?;
        Ok(Self {
            blob_root,
            header_root,
        })
    }

    fn blob_path(&self, path: &str) -> PathBuf {
        fanout_path(&self.blob_root, &key_hash(path))
    }

    fn header_path(&self, path: &str) -> PathBuf {
        let mut file = fanout_path(&self.header_root, &key_hash(path));
        file.set_extension("json");
        file
    }
}

impl BlobCache for DiskStore {
    fn get(&self, path: &str) -> Result<Option<CachedBlob>> {
        let file = self.blob_path(path);
        let meta = match fs::metadata(&file) {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("stat blob"),
        };
        let body = fs::read(&file).with_context(|| format!("read blob {}", file.display()))?;
        let last_modified = meta.modified().context("blob mtime")?;
        Ok(Some(CachedBlob {
            length: body.len() as u64,
            body: Bytes::from(body),
            last_modified,
        }))
    }

    fn put(&self, path: &str, body: &Bytes, last_modified: SystemTime) -> Result<()> {
        let file = self.blob_path(path);
        write_replace(&file, body, Some(last_modified))
    }
}

impl HeaderCache for DiskStore {
    fn get_headers(&self, path: &str) -> Result<Option<HeaderMap>> {
        let file = self.header_path(path);
        let raw = match fs::read(&file) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("read header sidecar"),
        };
        let pairs: Vec<(String, String)> =
            serde_json::from_slice(&raw).context("decode header sidecar")?;
        let mut headers = HeaderMap::with_capacity(pairs.len());
        for (name, value) in pairs {
            let name = match HeaderName::from_bytes(name.as_bytes()) {
                Ok(name) => name,
                Err(_) => continue,
            };
            let value = match HeaderValue::from_str(&value) {
                Ok(value) => value,
                Err(_) => continue,
            };
            headers.append(name, value);
        }
        Ok(Some(headers))
    }

    fn put_headers(&self, path: &str, headers: &HeaderMap) -> Result<()> {
        let pairs: Vec<(&str, &str)> = headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
            .collect();
        let raw = serde_json::to_vec(&pairs).context("encode header sidecar")?;
        let file = self.header_path(path);
        write_replace(&file, &raw, None)
    }
}

fn write_replace(file: &Path, contents: &[u8], mtime: Option<SystemTime>) -> Result<()> {
    let parent = file
        .parent()
        .with_context(|| format!("no parent dir for {}", file.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    let tmp = file.with_extension("tmp");
    let mut out =
        fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    out.write_all(contents)
        .with_context(|| format!("write {}", tmp.display()))?;
    if let Some(mtime) = mtime {
        out.set_modified(mtime)
            .with_context(|| format!("set mtime on {}", tmp.display()))?;
    }
    drop(out);
    fs::rename(&tmp, file)
        .with_context(|| format!("rename into {}", file.display()))?;
    Ok(())
}
