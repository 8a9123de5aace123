use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Result;
use bytes::Bytes;
use http::HeaderMap;
use sha1::{Digest, Sha1};

pub mod disk;
pub mod memory;

pub struct CachedBlob {
    pub body: Bytes,
    pub length: u64,
    pub last_modified: SystemTime,
}

pub trait BlobCache: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<CachedBlob>>;
    fn put(&self, path: &str, body: &Bytes, last_modified: SystemTime) -> Result<()>;
}

pub trait HeaderCache: Send + Sync {
    fn get_headers(&self, path: &str) -> Result<Option<HeaderMap>>;
    fn put_headers(&self, path: &str, headers: &HeaderMap) -> Result<()>;
}

pub(crate) fn key_hash(path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn fanout_path(root: &Path, hash: &str) -> PathBuf {
    root.join(&hash[0..2]).join(&hash[2..4]).join(hash)
}
