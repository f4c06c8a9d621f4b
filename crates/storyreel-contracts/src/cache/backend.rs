use std::path::{Path, PathBuf};
use std::sync::Mutex;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One cached asset: a data-URI payload plus the bookkeeping the eviction
/// sweep needs. `touched_at` is refreshed on every read, so it encodes
/// recency, not creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub fingerprint: String,
    pub payload: String,
    pub touched_at: i64,
    pub approx_bytes: u64,
}

/// The injected persistence collaborator behind [`super::AssetCache`].
///
/// Implementations take `&self` and handle their own interior mutability
/// so the cache can share them with a detached eviction thread. Durability
/// is expected to be eventual, not immediate.
pub trait StorageBackend: Send + Sync {
    fn fetch(&self, fingerprint: &str) -> anyhow::Result<Option<CacheRecord>>;
    fn store(&self, record: &CacheRecord) -> anyhow::Result<()>;
    fn fetch_all(&self) -> anyhow::Result<Vec<CacheRecord>>;
    fn remove(&self, fingerprint: &str) -> anyhow::Result<()>;
    fn clear(&self) -> anyhow::Result<()>;
}

/// Insertion-ordered in-memory backend; the default for tests and for
/// callers that only want per-process memoization.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<IndexMap<String, CacheRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn fetch(&self, fingerprint: &str) -> anyhow::Result<Option<CacheRecord>> {
        let records = self.lock()?;
        Ok(records.get(fingerprint).cloned())
    }

    fn store(&self, record: &CacheRecord) -> anyhow::Result<()> {
        let mut records = self.lock()?;
        records.insert(record.fingerprint.clone(), record.clone());
        Ok(())
    }

    fn fetch_all(&self) -> anyhow::Result<Vec<CacheRecord>> {
        let records = self.lock()?;
        Ok(records.values().cloned().collect())
    }

    fn remove(&self, fingerprint: &str) -> anyhow::Result<()> {
        let mut records = self.lock()?;
        records.shift_remove(fingerprint);
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        let mut records = self.lock()?;
        records.clear();
        Ok(())
    }
}

impl MemoryBackend {
    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, IndexMap<String, CacheRecord>>> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("memory backend lock poisoned"))
    }
}

/// File-backed backend: a single JSON object keyed by fingerprint.
///
/// The file is re-read before every merge-write, so two handles on the
/// same path converge instead of clobbering each other, matching the
/// protocol of the engine's other JSON-file stores. Fine for the asset
/// counts the cache is bounded to; not a database.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> anyhow::Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow::anyhow!("json file backend lock poisoned"))
    }

    fn read_records(&self) -> Map<String, Value> {
        read_json_object(&self.path).unwrap_or_default()
    }

    fn write_records(&self, records: &Map<String, Value>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &self.path,
            serde_json::to_string_pretty(&Value::Object(records.clone()))?,
        )?;
        Ok(())
    }
}

impl StorageBackend for JsonFileBackend {
    fn fetch(&self, fingerprint: &str) -> anyhow::Result<Option<CacheRecord>> {
        let _guard = self.guard()?;
        let records = self.read_records();
        match records.get(fingerprint) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    fn store(&self, record: &CacheRecord) -> anyhow::Result<()> {
        let _guard = self.guard()?;
        let mut records = self.read_records();
        records.insert(record.fingerprint.clone(), serde_json::to_value(record)?);
        self.write_records(&records)
    }

    fn fetch_all(&self) -> anyhow::Result<Vec<CacheRecord>> {
        let _guard = self.guard()?;
        let records = self.read_records();
        let mut rows = Vec::with_capacity(records.len());
        for value in records.values() {
            rows.push(serde_json::from_value(value.clone())?);
        }
        Ok(rows)
    }

    fn remove(&self, fingerprint: &str) -> anyhow::Result<()> {
        let _guard = self.guard()?;
        let mut records = self.read_records();
        if records.remove(fingerprint).is_some() {
            self.write_records(&records)?;
        }
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        let _guard = self.guard()?;
        self.write_records(&Map::new())
    }
}

fn read_json_object(path: &Path) -> Option<Map<String, Value>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let parsed: Value = serde_json::from_str(&raw).ok()?;
    parsed.as_object().cloned()
}
