//! Decoded library source cache
//!
//! Decoding base64 CQL and parsing the header happens on every `include`
//! resolution, so decoded sources are kept in memory. Entries are keyed by
//! the stored resource id and `versionId`: a lookup always asks the Library
//! DAO which resource is current, and only the decoding is skipped.

use crate::error::{CqlError, CqlResult};
use crate::library::LibrarySource;
use dashmap::DashMap;
use octofhir_storage::{ResourceDao, SearchParams, StoredResource};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// In-memory cache of decoded CQL libraries
#[derive(Debug)]
pub struct LibrarySourceCache {
    sources: DashMap<String, Arc<LibrarySource>>,
    capacity: usize,
}

impl LibrarySourceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            sources: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Decoded source of a stored Library, reused while its `versionId`
    /// is unchanged.
    pub fn load(&self, stored: &StoredResource) -> CqlResult<Arc<LibrarySource>> {
        let key = Self::make_cache_key(stored);
        if let Some(source) = self.sources.get(&key) {
            tracing::debug!(key = %key, "Library found in cache");
            return Ok(source.clone());
        }

        tracing::debug!(key = %key, "Decoding library source");
        let source = Arc::new(LibrarySource::from_library_resource(&stored.resource)?);
        self.insert(key, source.clone());
        Ok(source)
    }

    fn insert(&self, key: String, source: Arc<LibrarySource>) {
        if self.sources.len() >= self.capacity && !self.sources.contains_key(&key) {
            // The iterator's shard guard must be gone before `remove`.
            let victim = self.sources.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.sources.remove(&victim);
                tracing::debug!(key = %victim, "Evicted library from cache");
            }
        }
        self.sources.insert(key, source);
    }

    /// Loads a library by name from the Library DAO. Without a version the
    /// highest stored version wins.
    pub async fn get_or_load(
        &self,
        name: &str,
        version: Option<&str>,
        dao: &dyn ResourceDao,
    ) -> CqlResult<Arc<LibrarySource>> {
        let mut params = SearchParams::new().with_param("name", name);
        if let Some(v) = version {
            params = params.with_param("version", v);
        }
        let found = dao.search(&params).await?;
        let stored = newest(found.entries).ok_or_else(|| {
            CqlError::LibraryNotFound(match version {
                Some(v) => format!("{name} version {v}"),
                None => name.to_string(),
            })
        })?;
        self.load(&stored)
    }

    /// Drops every cached entry for a library name.
    pub fn invalidate(&self, name: &str) {
        self.sources.retain(|_, source| source.name != name);
    }

    pub fn clear(&self) {
        self.sources.clear();
        tracing::info!("Cleared library cache");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.sources.len(),
            capacity: self.capacity,
        }
    }

    fn make_cache_key(stored: &StoredResource) -> String {
        format!("{}/_history/{}", stored.id, stored.version_id)
    }
}

fn newest(entries: Vec<StoredResource>) -> Option<StoredResource> {
    entries.into_iter().max_by(|a, b| {
        compare_versions(version_of(a), version_of(b))
            .then_with(|| a.last_updated.cmp(&b.last_updated))
    })
}

fn version_of(stored: &StoredResource) -> Option<&str> {
    stored.resource.get("version").and_then(Value::as_str)
}

/// Semver ordering where both sides parse (`1.0` reads as `1.0.0`),
/// plain string ordering otherwise. A missing version sorts first.
fn compare_versions(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match (parse_version(a), parse_version(b)) {
            (Some(va), Some(vb)) => va.cmp(&vb),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => a.cmp(b),
        },
        _ => a.cmp(&b),
    }
}

fn parse_version(version: &str) -> Option<semver::Version> {
    semver::Version::parse(version)
        .or_else(|_| semver::Version::parse(&format!("{version}.0")))
        .or_else(|_| semver::Version::parse(&format!("{version}.0.0")))
        .ok()
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::encode_cql;
    use octofhir_core::ResourceType;
    use octofhir_storage::DaoRegistry;
    use serde_json::json;
    use std::time::Duration;

    fn library(id: &str, name: &str, version: &str, body: &str) -> serde_json::Value {
        json!({
            "resourceType": "Library",
            "id": id,
            "name": name,
            "version": version,
            "content": [{
                "contentType": "text/cql",
                "data": encode_cql(&format!("library {name} version '{version}'\n{body}"))
            }]
        })
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions(Some("1.10"), Some("1.9")), Ordering::Greater);
        assert_eq!(compare_versions(Some("2"), Some("1.9.9")), Ordering::Greater);
        assert_eq!(compare_versions(Some("1.0"), Some("1.0.0")), Ordering::Equal);
        assert_eq!(compare_versions(Some("draft"), Some("0.1")), Ordering::Less);
        assert_eq!(compare_versions(None, Some("0.1")), Ordering::Less);
    }

    #[tokio::test]
    async fn test_get_or_load_follows_stored_version() {
        let registry = DaoRegistry::in_memory([ResourceType::Library]);
        let dao = registry.resource_dao(ResourceType::Library).unwrap();
        dao.create(library("util", "Util", "1.0", "define \"X\": 1"))
            .await
            .unwrap();

        let cache = LibrarySourceCache::new(10);
        let first = cache.get_or_load("Util", Some("1.0"), dao.as_ref()).await.unwrap();
        let again = cache.get_or_load("Util", Some("1.0"), dao.as_ref()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(first.cql.contains("\"X\": 1"));

        dao.update(library("util", "Util", "1.0", "define \"X\": 2"))
            .await
            .unwrap();
        let updated = cache.get_or_load("Util", None, dao.as_ref()).await.unwrap();
        assert!(updated.cql.contains("\"X\": 2"));

        dao.delete("util").await.unwrap();
        let err = cache
            .get_or_load("Util", Some("1.0"), dao.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, CqlError::LibraryNotFound(_)));
    }

    #[tokio::test]
    async fn test_unversioned_lookup_picks_highest_version() {
        let registry = DaoRegistry::in_memory([ResourceType::Library]);
        let dao = registry.resource_dao(ResourceType::Library).unwrap();
        dao.create(library("common-1-10", "Common", "1.10", "")).await.unwrap();
        dao.create(library("common-1-9", "Common", "1.9", "")).await.unwrap();

        let cache = LibrarySourceCache::new(10);
        let latest = cache.get_or_load("Common", None, dao.as_ref()).await.unwrap();
        assert_eq!(latest.identifier(), "Common|1.10");

        dao.create(library("common-2-0", "Common", "2.0", "")).await.unwrap();
        let latest = cache.get_or_load("Common", None, dao.as_ref()).await.unwrap();
        assert_eq!(latest.identifier(), "Common|2.0");

        let pinned = cache.get_or_load("Common", Some("1.9"), dao.as_ref()).await.unwrap();
        assert_eq!(pinned.identifier(), "Common|1.9");

        cache.invalidate("Common");
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_capacity_is_respected() {
        let registry = DaoRegistry::in_memory([ResourceType::Library]);
        let dao = registry.resource_dao(ResourceType::Library).unwrap();
        let stored: Vec<StoredResource> = ["A", "B", "C"]
            .into_iter()
            .map(|name| {
                tokio_test::block_on(dao.create(library(&name.to_lowercase(), name, "1.0", "")))
                    .unwrap()
            })
            .collect();

        let cache = Arc::new(LibrarySourceCache::new(2));
        let worker = cache.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            for entry in &stored {
                worker.load(entry).unwrap();
            }
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("loading past capacity returns");

        assert_eq!(cache.stats(), CacheStats { size: 2, capacity: 2 });
        cache.clear();
        assert_eq!(cache.stats().size, 0);
    }
}
