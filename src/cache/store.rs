//! Generic single-JSON-file cache with atomic rename-on-write, backing all
//! three caches in this module.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheRecord<V> {
    value: V,
    cached_at: DateTime<Utc>,
    /// Mandatory on every cached entry.
    /// A record whose `prompt_version` field fails to deserialize - e.g.
    /// because it was missing - is dropped at load time rather than
    /// surfacing as a load error, which reproduces the source's "missing
    /// promptVersion is treated as expired" behavior: the entry is simply
    /// not present, so the next `get` is an unconditional miss.
    prompt_version: String,
}

struct Inner<V> {
    records: HashMap<String, CacheRecord<V>>,
    dirty: bool,
}

/// A read-through, write-batched, disk-persisted cache keyed by `String`.
pub struct JsonFileCache<V> {
    path: PathBuf,
    ttl: Option<chrono::Duration>,
    current_prompt_version: String,
    inner: Mutex<Inner<V>>,
}

impl<V> JsonFileCache<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn open(path: &Path, ttl: Option<chrono::Duration>, current_prompt_version: String) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let records: HashMap<String, CacheRecord<V>> = if path.exists() {
            let raw = fs::read_to_string(path)?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                // Deserialize entry-by-entry so a single malformed/missing
                // `prompt_version` record doesn't poison the whole file -
                // it is dropped instead (see `CacheRecord::prompt_version`).
                let raw_map: HashMap<String, serde_json::Value> =
                    serde_json::from_str(&raw).map_err(|e| Error::CacheIo(e.to_string()))?;
                raw_map
                    .into_iter()
                    .filter_map(|(k, v)| serde_json::from_value::<CacheRecord<V>>(v).ok().map(|r| (k, r)))
                    .collect()
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            path: path.to_path_buf(),
            ttl,
            current_prompt_version,
            inner: Mutex::new(Inner { records, dirty: false }),
        })
    }

    /// Read-through get. Returns `None` on miss, expiry, or prompt-version
    /// mismatch; a stale entry found on a version mismatch or TTL expiry is
    /// deleted: "a get returns miss if expired or
    /// version-mismatched, and deletes the stale entry").
    pub fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        let Some(record) = guard.records.get(key) else {
            return None;
        };

        let version_mismatch = record.prompt_version != self.current_prompt_version;
        let expired = self
            .ttl
            .map(|ttl| Utc::now() - record.cached_at > ttl)
            .unwrap_or(false);

        if version_mismatch || expired {
            guard.records.remove(key);
            guard.dirty = true;
            return None;
        }

        Some(record.value.clone())
    }

    /// Write-through set; marks the cache dirty for the next flush.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        guard.records.insert(
            key.into(),
            CacheRecord {
                value,
                cached_at: Utc::now(),
                prompt_version: self.current_prompt_version.clone(),
            },
        );
        guard.dirty = true;
    }

    /// Batch set, used by batch LLM operations.
    pub fn set_many(&self, entries: impl IntoIterator<Item = (String, V)>) {
        for (key, value) in entries {
            self.set(key, value);
        }
    }

    /// Atomic checkpoint: write-temp-then-rename, only if dirty.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        if !guard.dirty {
            return Ok(());
        }

        let serializable: HashMap<&str, &CacheRecord<V>> =
            guard.records.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let json = serde_json::to_string_pretty(&serializable)?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)?;

        guard.dirty = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache mutex poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn get_set_round_trip() {
        let dir = tempdir().unwrap();
        let cache: JsonFileCache<String> = JsonFileCache::open(
            &dir.path().join("c.json"),
            None,
            "v1".to_string(),
        )
        .unwrap();

        cache.set("nsclc", "non-small cell lung cancer".to_string());
        assert_eq!(cache.get("nsclc"), Some("non-small cell lung cancer".to_string()));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn version_mismatch_is_a_miss_and_evicts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.json");
        {
            let cache: JsonFileCache<String> = JsonFileCache::open(&path, None, "v1".to_string()).unwrap();
            cache.set("term", "value".to_string());
            cache.flush().unwrap();
        }

        let cache: JsonFileCache<String> = JsonFileCache::open(&path, None, "v2".to_string()).unwrap();
        assert_eq!(cache.get("term"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn ttl_expiry_is_a_miss() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.json");
        let cache: JsonFileCache<String> =
            JsonFileCache::open(&path, Some(chrono::Duration::seconds(-1)), "v1".to_string()).unwrap();
        cache.set("term", "value".to_string());
        assert_eq!(cache.get("term"), None);
    }

    #[test]
    fn flush_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.json");
        {
            let cache: JsonFileCache<String> = JsonFileCache::open(&path, None, "v1".to_string()).unwrap();
            cache.set("term", "value".to_string());
            cache.flush().unwrap();
        }

        let cache: JsonFileCache<String> = JsonFileCache::open(&path, None, "v1".to_string()).unwrap();
        assert_eq!(cache.get("term"), Some("value".to_string()));
    }

    #[test]
    fn missing_prompt_version_field_is_dropped_not_errored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c.json");
        // Hand-write a cache file where one record lacks `prompt_version`
        // entirely, simulating the source's tolerated-but-buggy shape.
        let raw = serde_json::json!({
            "good": {"value": "v", "cached_at": Utc::now().to_rfc3339(), "prompt_version": "v1"},
            "bad": {"value": "v"}
        });
        fs::write(&path, raw.to_string()).unwrap();

        let cache: JsonFileCache<String> = JsonFileCache::open(&path, None, "v1".to_string()).unwrap();
        assert_eq!(cache.get("good"), Some("v".to_string()));
        assert_eq!(cache.get("bad"), None);
    }
}
