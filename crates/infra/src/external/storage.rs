//! Object storage port.

use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail};

pub trait StorageService: Send + Sync {
    /// Store `bytes` under `key`; returns the object's URL.
    fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> anyhow::Result<String>;

    fn read_back(&self, url: &str) -> anyhow::Result<Vec<u8>>;

    /// Public URL of a key or key prefix.
    fn url_for(&self, key: &str) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// In-memory object store for tests/dev.
#[derive(Debug)]
pub struct InMemoryStorage {
    base_url: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    failing: RwLock<Vec<String>>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new("https://storage.test")
    }
}

impl InMemoryStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            objects: RwLock::new(BTreeMap::new()),
            failing: RwLock::new(Vec::new()),
        }
    }

    /// Uploads whose key contains `fragment` fail.
    pub fn fail_uploads_matching(&self, fragment: impl Into<String>) {
        if let Ok(mut failing) = self.failing.write() {
            failing.push(fragment.into());
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .map(|o| o.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().ok().and_then(|o| o.get(key).cloned())
    }

    fn key_of<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(self.base_url.as_str())?.strip_prefix('/')
    }
}

impl StorageService for InMemoryStorage {
    fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> anyhow::Result<String> {
        let failing = self.failing.read().map_err(|_| anyhow!("storage state poisoned"))?;
        if failing.iter().any(|fragment| key.contains(fragment.as_str())) {
            bail!("upload rejected: {key}");
        }
        drop(failing);

        self.objects
            .write()
            .map_err(|_| anyhow!("storage state poisoned"))?
            .insert(
                key.to_string(),
                StoredObject {
                    bytes: bytes.to_vec(),
                    content_type: content_type.to_string(),
                },
            );
        Ok(self.url_for(key))
    }

    fn read_back(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let key = self
            .key_of(url)
            .ok_or_else(|| anyhow!("not a storage url: {url}"))?;
        self.objects
            .read()
            .map_err(|_| anyhow!("storage state poisoned"))?
            .get(key)
            .map(|o| o.bytes.clone())
            .ok_or_else(|| anyhow!("no object at {url}"))
    }

    fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }
}
