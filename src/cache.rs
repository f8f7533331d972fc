use std::{fmt::Display, marker::PhantomData, path::PathBuf};

use async_trait::async_trait;
use cached::IOCachedAsync;
use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};

/// On-disk cache of bincode-encoded values in a cacache store. Entries
/// that no longer decode are treated as misses and overwritten on the
/// next `cache_set`.
pub struct CacacheBackend<K, V> {
    root: PathBuf,
    /// when false, `cache_get` always misses and values are recomputed
    refresh: bool,
    _phantom: PhantomData<(K, V)>,
}

impl<K, V> CacacheBackend<K, V> {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            refresh: true,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<K, V> IOCachedAsync<K, V> for CacacheBackend<K, V>
where
    K: Display + Send + Sync,
    V: Serialize + DeserializeOwned + Send + Sync,
{
    type Error = eyre::Error;

    async fn cache_get(&self, key: &K) -> Result<Option<V>, Self::Error> {
        if !self.refresh {
            return Ok(None);
        }
        match cacache::read(&self.root, key.to_string()).await {
            Ok(bytes) => match bincode::deserialize::<V>(&bytes) {
                Ok(value) => {
                    debug!("cache hit for {key}");
                    Ok(Some(value))
                }
                // written by an older layout of the cached type
                Err(err) => {
                    warn!("cached entry for {key} is unreadable, recomputing: {err}");
                    Ok(None)
                }
            },
            Err(cacache::Error::EntryNotFound(_, _)) => {
                debug!("cache miss for {key}");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn cache_set(&self, key: K, val: V) -> Result<Option<V>, Self::Error> {
        let prev = self.cache_get(&key).await?;
        let bytes = bincode::serialize(&val)?;
        cacache::write(&self.root, key.to_string(), bytes).await?;
        Ok(prev)
    }

    async fn cache_remove(&self, key: &K) -> Result<Option<V>, Self::Error> {
        let prev = self.cache_get(key).await?;
        cacache::remove(&self.root, key.to_string()).await?;
        Ok(prev)
    }

    fn cache_set_refresh(&mut self, refresh: bool) -> bool {
        let old = self.refresh;
        self.refresh = refresh;
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::histogram::Histogram1D;

    #[tokio::test]
    async fn test_histogram_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacacheBackend::<String, Histogram1D>::new(dir.path().join("cache"));
        let key = "Run001.bin".to_owned();

        assert!(cache.cache_get(&key).await.unwrap().is_none());

        let mut hist = Histogram1D::new(16, 0.0, 16.0);
        hist.fill(3.5);
        hist.fill(40.0);
        assert!(cache.cache_set(key.clone(), hist.clone()).await.unwrap().is_none());
        assert_eq!(cache.cache_get(&key).await.unwrap(), Some(hist.clone()));

        assert_eq!(cache.cache_remove(&key).await.unwrap(), Some(hist));
        assert!(cache.cache_get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CacacheBackend::<String, u8>::new(dir.path().to_owned());
        writer.cache_set("run".to_owned(), 3).await.unwrap();

        let reader = CacacheBackend::<String, Histogram1D>::new(dir.path().to_owned());
        assert_eq!(reader.cache_get(&"run".to_owned()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_off_bypasses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CacacheBackend::<String, u64>::new(dir.path().to_owned());
        cache.cache_set("key".to_owned(), 7).await.unwrap();
        assert!(cache.cache_set_refresh(false));
        assert_eq!(cache.cache_get(&"key".to_owned()).await.unwrap(), None);
    }
}
