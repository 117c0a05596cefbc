mod expiring;

use std::{collections::BTreeSet, future::Future, sync::Arc};

use dirsearch_domain::{
    error::{DirectoryError, Result},
    filter::SearchFilter,
    options::{CachingOptions, LdapOptions},
    schema::AttributeMapping,
    types::{AttributeName, DirectoryObject, RawEntry},
};

pub use expiring::{CacheStats, ExpiringCache, Lookup};

fn check_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        Err(DirectoryError::InvalidArgument(
            "cache key must not be empty".to_owned(),
        ))
    } else {
        Ok(())
    }
}

/// Raw directory entries keyed by the filter that selects them.
pub struct EntryCache<E> {
    inner: ExpiringCache<String, E>,
    mapping: Arc<AttributeMapping>,
}

impl<E: RawEntry> EntryCache<E> {
    pub fn new(options: &CachingOptions, mapping: Arc<AttributeMapping>) -> Self {
        Self {
            inner: ExpiringCache::new(options),
            mapping,
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<E>> {
        check_key(key)?;
        Ok(self.inner.get(&key.to_owned()))
    }

    pub fn lookup(&self, key: &str) -> Result<Lookup<E>> {
        check_key(key)?;
        Ok(self.inner.lookup(&key.to_owned()))
    }

    /// Stores `entry` under its DN, identity and account name filters.
    pub fn add(&self, entry: &E) -> Result<()> {
        let keys = entry.cache_keys(&self.mapping);
        if keys.is_empty() {
            return Err(DirectoryError::InvalidArgument(
                "entry has neither a DN, an identity nor an account name".to_owned(),
            ));
        }
        for key in keys {
            self.inner.insert(key, entry.clone());
        }
        Ok(())
    }

    /// Stores `entry` under an extra key that is not derived from the mapping.
    pub fn insert(&self, key: &str, entry: &E) -> Result<()> {
        check_key(key)?;
        self.inner.insert(key.to_owned(), entry.clone());
        Ok(())
    }

    pub async fn get_or_add<F, Fut>(&self, key: &str, fallback: F) -> Result<Option<E>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<E>>>,
    {
        check_key(key)?;
        self.inner.get_or_add_async(key.to_owned(), fallback).await
    }

    /// Looks up `key`, remembering a negative answer from `fallback` as well.
    pub async fn get_or_add_remembering_absence<F, Fut>(
        &self,
        key: &str,
        fallback: F,
    ) -> Result<Option<E>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<E>>>,
    {
        check_key(key)?;
        let entry = self
            .inner
            .get_or_add_remembering_absence_async(key.to_owned(), fallback)
            .await?;
        if let Some(entry) = &entry {
            // Make the entry reachable through its other keys too.
            for other_key in entry.cache_keys(&self.mapping) {
                if other_key != key {
                    self.inner.insert(other_key, entry.clone());
                }
            }
        }
        Ok(entry)
    }

    pub fn stats(&self) -> &CacheStats {
        self.inner.stats()
    }

    pub fn clear(&self) {
        self.inner.clear()
    }
}

/// Mapped users or groups keyed by the filter that selects them.
pub struct ObjectCache<T> {
    inner: ExpiringCache<String, T>,
    mapping: Arc<AttributeMapping>,
}

impl<T: DirectoryObject> ObjectCache<T> {
    pub fn new(options: &CachingOptions, mapping: Arc<AttributeMapping>) -> Self {
        Self {
            inner: ExpiringCache::new(options),
            mapping,
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<T>> {
        check_key(key)?;
        Ok(self.inner.get(&key.to_owned()))
    }

    pub fn add(&self, object: &T) -> Result<()> {
        let keys = object.cache_keys(&self.mapping);
        if keys.is_empty() {
            return Err(DirectoryError::InvalidArgument(
                "object has neither a DN, an identity nor an account name".to_owned(),
            ));
        }
        for key in keys {
            self.inner.insert(key, object.clone());
        }
        Ok(())
    }

    pub async fn get_or_add<F, Fut>(&self, key: &str, fallback: F) -> Result<Option<T>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        check_key(key)?;
        if let Some(object) = self.inner.get(&key.to_owned()) {
            return Ok(Some(object));
        }
        let object = fallback(key.to_owned()).await?;
        if let Some(object) = &object {
            self.inner.insert(key.to_owned(), object.clone());
            for other_key in object.cache_keys(&self.mapping) {
                if other_key != key {
                    self.inner.insert(other_key, object.clone());
                }
            }
        }
        Ok(object)
    }

    pub fn stats(&self) -> &CacheStats {
        self.inner.stats()
    }

    pub fn clear(&self) {
        self.inner.clear()
    }
}

/// Key of a whole result set: the rendered filter, the requested attributes
/// and the size limit the set was truncated to.
#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub struct BulkQueryKey {
    pub filter: String,
    pub attributes: BTreeSet<AttributeName>,
    pub size_limit: Option<usize>,
}

impl BulkQueryKey {
    pub fn new(filter: &SearchFilter, attributes: &[AttributeName]) -> Self {
        Self {
            filter: filter.to_string(),
            attributes: attributes.iter().cloned().collect(),
            size_limit: None,
        }
    }

    pub fn with_size_limit(self, size_limit: Option<usize>) -> Self {
        Self { size_limit, ..self }
    }
}

pub struct BulkResultCache<E> {
    inner: ExpiringCache<BulkQueryKey, Arc<Vec<E>>>,
}

impl<E: RawEntry> BulkResultCache<E> {
    pub fn new(options: &CachingOptions) -> Self {
        Self {
            inner: ExpiringCache::new(options),
        }
    }

    pub fn get(&self, key: &BulkQueryKey) -> Result<Option<Arc<Vec<E>>>> {
        check_key(&key.filter)?;
        Ok(self.inner.get(key))
    }

    /// Returns the cached result set or runs the query. An empty result set
    /// is a valid answer and is cached like any other.
    pub async fn get_or_add<F, Fut>(&self, key: BulkQueryKey, fallback: F) -> Result<Arc<Vec<E>>>
    where
        F: FnOnce(BulkQueryKey) -> Fut,
        Fut: Future<Output = Result<Vec<E>>>,
    {
        check_key(&key.filter)?;
        let entries = self
            .inner
            .get_or_add_async(key, |key| async move {
                fallback(key).await.map(|entries| Some(Arc::new(entries)))
            })
            .await?;
        Ok(entries.unwrap_or_default())
    }

    pub fn stats(&self) -> &CacheStats {
        self.inner.stats()
    }

    pub fn clear(&self) {
        self.inner.clear()
    }
}

/// The caches owned by one search service configuration. Share it with
/// `Arc`; nothing here is global.
pub struct SearchCaches<E, U, G> {
    pub entries: EntryCache<E>,
    pub users: ObjectCache<U>,
    pub groups: ObjectCache<G>,
    pub bulk: BulkResultCache<E>,
}

impl<E, U, G> SearchCaches<E, U, G>
where
    E: RawEntry,
    U: DirectoryObject,
    G: DirectoryObject,
{
    pub fn new(options: &LdapOptions) -> Self {
        let mapping = Arc::new(options.attribute_mapping());
        Self {
            entries: EntryCache::new(&options.caching, mapping.clone()),
            users: ObjectCache::new(&options.caching, mapping.clone()),
            groups: ObjectCache::new(&options.caching, mapping),
            bulk: BulkResultCache::new(&options.caching),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.users.clear();
        self.groups.clear();
        self.bulk.clear();
    }
}
