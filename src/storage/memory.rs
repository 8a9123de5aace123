use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

use anyhow::Result;
use bytes::Bytes;
use http::HeaderMap;

use crate::storage::{BlobCache, CachedBlob, HeaderCache};

#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, (Bytes, SystemTime)>>,
    headers: RwLock<HashMap<String, HeaderMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobCache for MemoryStore {
    fn get(&self, path: &str) -> Result<Option<CachedBlob>> {
        let blobs = self.blobs.read().expect("blob map");
        Ok(blobs.get(path).map(|(body, last_modified)| CachedBlob {
            body: body.clone(),
            length: body.len() as u64,
            last_modified: *last_modified,
        }))
    }

    fn put(&self, path: &str, body: &Bytes, last_modified: SystemTime) -> Result<()> {
        let mut blobs = self.blobs.write().expect("blob map");
        blobs.insert(path.to_string(), (body.clone(), last_modified));
        Ok(())
    }
}

impl HeaderCache for MemoryStore {
    fn get_headers(&self, path: &str) -> Result<Option<HeaderMap>> {
        let headers = self.headers.read().expect("header map");
        Ok(headers.get(path).cloned())
    }

    fn put_headers(&self, path: &str, headers: &HeaderMap) -> Result<()> {
        let mut map = self.headers.write().expect("header map");
        map.insert(path.to_string(), headers.clone());
        Ok(())
    }
}
