use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::task;

use super::{ObjectStream, RemoteError, RemoteObjectManager};
use crate::cache::{CacheError, LocalCache};
use crate::serialization::Record;
use crate::types::ObjectId;

/// Serves another local cache as a remote store.
///
/// Lets `pull` copy a graph between two cache files with the regular
/// receive pipeline. Cache calls run on the blocking pool.
#[derive(Clone)]
pub struct CachePeer {
    cache: Arc<dyn LocalCache>,
}

impl std::fmt::Debug for CachePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePeer").finish_non_exhaustive()
    }
}

impl CachePeer {
    /// Serves `cache` as a remote.
    pub fn new(cache: Arc<dyn LocalCache>) -> Self {
        Self { cache }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn LocalCache) -> Result<T, CacheError> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        task::spawn_blocking(move || f(cache.as_ref()))
            .await
            .map_err(|err| RemoteError::Unavailable(format!("peer task failed: {err}")))?
            .map_err(RemoteError::from)
    }
}

#[async_trait]
impl RemoteObjectManager for CachePeer {
    async fn has_objects(&self, ids: &[ObjectId]) -> Result<HashMap<ObjectId, bool>, RemoteError> {
        let ids = ids.to_vec();
        self.blocking(move |cache| {
            let present = cache.has_many(&ids)?;
            Ok(ids
                .into_iter()
                .map(|id| {
                    let found = present.contains(&id);
                    (id, found)
                })
                .collect())
        })
        .await
    }

    async fn upload_objects(&self, batch: &[Record], _compress: bool) -> Result<(), RemoteError> {
        let items: Vec<(ObjectId, String)> = batch
            .iter()
            .map(|record| (record.id.clone(), record.json.clone()))
            .collect();
        self.blocking(move |cache| cache.put_batch(&items).map(|_| ()))
            .await
    }

    async fn download_objects(&self, ids: &[ObjectId]) -> Result<ObjectStream, RemoteError> {
        let ids = ids.to_vec();
        let found = self
            .blocking(move |cache| {
                let mut found = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(json) = cache.get(&id)? {
                        found.push((id, json));
                    }
                }
                Ok(found)
            })
            .await?;
        Ok(stream::iter(found.into_iter().map(Ok)).boxed())
    }

    async fn download_single(&self, id: &ObjectId) -> Result<Option<String>, RemoteError> {
        let id = id.clone();
        self.blocking(move |cache| cache.get(&id)).await
    }
}
