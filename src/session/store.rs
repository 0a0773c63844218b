//! The session store: cookie lifecycle plus batched persistence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use chrono::Utc;
use http::{HeaderMap, HeaderValue};
use rand::RngCore;

use crate::batch::{BatcherConfig, MapBatchProcessor, MapBatcher};
use crate::business::reader::{read_one, EntityLoader};
use crate::cache::{Cache, CacheError, CacheKey, CachedValue, MemoryCache, Prefix};
use crate::db::{StoreBackend, StoreError};

use super::cookie::{expired_cookie, read_session_cookie, session_cookie, CookieConfig};
use super::{Session, SessionError, SessionKey, SessionResult, SessionValue};

/// Settings for [`SessionStore`].
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// Cookie parameters; `max_lifetime` doubles as the DB row TTL.
    pub cookie: CookieConfig,
    /// How often touched sessions are persisted.
    pub persist_interval: Duration,
    /// Channel and buffer tuning for the persistence batcher.
    pub batcher: BatcherConfig,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            cookie: CookieConfig::default(),
            persist_interval: Duration::from_secs(10),
            batcher: BatcherConfig::default(),
        }
    }
}

fn cache_key(sid: &str) -> CacheKey {
    CacheKey::text(Prefix::Session, sid)
}

fn db_key(sid: &str) -> String {
    format!("session/{}", sid)
}

/// Generate a fresh opaque 20-byte session ID in its text form.
fn new_session_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

struct PersistProcessor {
    cache: Arc<dyn Cache>,
    backend: Arc<dyn StoreBackend>,
    lifetime: Duration,
}

#[async_trait]
impl MapBatchProcessor<String> for PersistProcessor {
    async fn process(&self, batch: &std::collections::HashMap<String, u64>) -> anyhow::Result<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.lifetime).unwrap_or(chrono::Duration::days(7));
        for sid in batch.keys() {
            let session: Arc<Session> = match self.cache.get(&cache_key(sid)) {
                Ok(value) => match value.downcast() {
                    Ok(session) => session,
                    Err(e) => {
                        log::warn!("session {}: cached value is not a session: {}", sid, e);
                        continue;
                    }
                },
                // Evicted or destroyed since it was touched; nothing to write.
                Err(_) => continue,
            };
            if !session.persistent() {
                continue;
            }
            let bytes = match session.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("session {}: encode failed: {}", sid, e);
                    continue;
                }
            };
            self.backend
                .upsert_cache_row(&db_key(sid), &bytes, expires_at)
                .await?;
        }
        log::debug!("sessions: persisted up to {} touched ids", batch.len());
        Ok(())
    }
}

/// Session lifecycle over the shared cache and the map batcher.
pub struct SessionStore {
    cache: Arc<dyn Cache>,
    backend: Arc<dyn StoreBackend>,
    config: SessionStoreConfig,
    batcher: MapBatcher<String>,
}

impl SessionStore {
    /// Start the store and its persistence loop.
    pub fn start(
        cache: MemoryCache,
        backend: Arc<dyn StoreBackend>,
        config: SessionStoreConfig,
    ) -> Arc<Self> {
        let cache: Arc<dyn Cache> = Arc::new(cache);
        let mut batcher_config = config.batcher.clone();
        batcher_config.flush_delay = config.persist_interval;
        let processor = Arc::new(PersistProcessor {
            cache: cache.clone(),
            backend: backend.clone(),
            lifetime: config.cookie.max_lifetime,
        });
        let batcher = MapBatcher::spawn("sessions", batcher_config, processor);
        Arc::new(Self {
            cache,
            backend,
            config,
            batcher,
        })
    }

    /// Resolve the request's session, creating one when the cookie is
    /// absent or references a session the store no longer knows.
    ///
    /// Returns the session and, for a fresh one, the `Set-Cookie` value the
    /// response must carry.
    pub async fn begin(
        &self,
        request_headers: &HeaderMap,
    ) -> SessionResult<(Arc<Session>, Option<HeaderValue>)> {
        if let Some(sid) = read_session_cookie(&self.config.cookie, request_headers) {
            match self.read(&sid, false).await {
                Ok(session) => {
                    session.touch();
                    return Ok((session, None));
                }
                Err(SessionError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let sid = new_session_id();
        let session = Arc::new(Session::new(sid.clone()));
        if let Err(e) = self
            .cache
            .set(&cache_key(&sid), CachedValue::shared(session.clone()))
        {
            log::warn!("session {}: failed to cache: {}", sid, e);
        }
        let cookie = session_cookie(&self.config.cookie, &sid, request_headers);
        Ok((session, Some(cookie)))
    }

    /// Fetch a session by ID. With `skip_cache` the store row is read
    /// directly, which is how a node picks up another node's writes.
    pub async fn read(&self, sid: &str, skip_cache: bool) -> SessionResult<Arc<Session>> {
        if skip_cache {
            let bytes = match self.backend.cache_row(&db_key(sid)).await {
                Ok(bytes) => bytes,
                Err(StoreError::NotFound) => return Err(SessionError::NotFound),
                Err(e) => return Err(e.into()),
            };
            let session = Arc::new(Session::decode(sid.to_string(), &bytes)?);
            if let Err(e) = self
                .cache
                .set(&cache_key(sid), CachedValue::shared(session.clone()))
            {
                log::warn!("session {}: failed to cache: {}", sid, e);
            }
            return Ok(session);
        }

        let backend = self.backend.clone();
        let owned = sid.to_string();
        let loader = EntityLoader::new(move || {
            let backend = backend.clone();
            let sid = owned.clone();
            async move {
                let bytes = backend.cache_row(&db_key(&sid)).await?;
                Session::decode(sid.clone(), &bytes)
                    .map_err(|e| StoreError::Encoding(e.to_string()))
            }
        });
        match read_one::<Session>(&self.cache, &cache_key(sid), loader).await {
            Ok(session) => Ok(session),
            Err(StoreError::NotFound) | Err(StoreError::Cache(CacheError::NegativeHit)) => {
                Err(SessionError::NotFound)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a value and queue the session for persistence.
    pub async fn put(
        &self,
        session: &Arc<Session>,
        key: SessionKey,
        value: SessionValue,
    ) -> SessionResult<()> {
        session.put(key, value);
        session.touch();
        self.enqueue(session.id()).await
    }

    /// Read a value; reads update last-access and so queue persistence too.
    pub async fn value(
        &self,
        session: &Arc<Session>,
        key: SessionKey,
    ) -> SessionResult<Option<SessionValue>> {
        session.touch();
        let value = session.value(key);
        self.enqueue(session.id()).await?;
        Ok(value)
    }

    /// Remove a value and queue the session for persistence.
    pub async fn remove(&self, session: &Arc<Session>, key: SessionKey) -> SessionResult<()> {
        session.remove(key);
        session.touch();
        self.enqueue(session.id()).await
    }

    /// Destroy a session everywhere and return the clearing cookie.
    pub async fn destroy(&self, sid: &str) -> SessionResult<HeaderValue> {
        self.cache.delete(&cache_key(sid));
        self.backend.delete_cache_row(&db_key(sid)).await?;
        Ok(expired_cookie(&self.config.cookie))
    }

    /// Stop the persistence loop, draining queued session IDs.
    pub async fn shutdown(&self) {
        self.batcher.shutdown().await;
    }

    async fn enqueue(&self, sid: &str) -> SessionResult<()> {
        self.batcher
            .push(sid.to_string())
            .await
            .map_err(|_| SessionError::QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryBackend;

    fn store() -> (Arc<SessionStore>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = SessionStore::start(
            MemoryCache::default(),
            backend.clone(),
            SessionStoreConfig {
                persist_interval: Duration::from_millis(30),
                ..SessionStoreConfig::default()
            },
        );
        (store, backend)
    }

    #[tokio::test]
    async fn test_begin_creates_and_reuses() {
        let (store, _backend) = store();

        let (session, cookie) = store.begin(&HeaderMap::new()).await.unwrap();
        let cookie = cookie.expect("fresh session must set a cookie");

        // Replay the cookie: same session, no new cookie.
        let mut headers = HeaderMap::new();
        let value = cookie.to_str().unwrap().split(';').next().unwrap().to_string();
        headers.insert(http::header::COOKIE, HeaderValue::from_str(&value).unwrap());
        let (again, cookie) = store.begin(&headers).await.unwrap();
        assert!(cookie.is_none());
        assert_eq!(again.id(), session.id());
    }

    #[tokio::test]
    async fn test_unknown_cookie_gets_fresh_session() {
        let (store, _backend) = store();
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::COOKIE,
            HeaderValue::from_static("pc_session=unknown-sid"),
        );
        let (_, cookie) = store.begin(&headers).await.unwrap();
        assert!(cookie.is_some());
    }

    #[tokio::test]
    async fn test_persistent_session_round_trips_through_db() {
        let (store, _backend) = store();
        let (session, _) = store.begin(&HeaderMap::new()).await.unwrap();
        session.set_persistent(true);
        store
            .put(&session, SessionKey::UserId, SessionValue::Int(7))
            .await
            .unwrap();

        // Let the persistence loop flush, then read around the cache.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let from_db = store.read(session.id(), true).await.unwrap();
        assert_eq!(from_db.value(SessionKey::UserId), Some(SessionValue::Int(7)));
    }

    #[tokio::test]
    async fn test_non_persistent_session_never_hits_db() {
        let (store, backend) = store();
        let (session, _) = store.begin(&HeaderMap::new()).await.unwrap();
        store
            .put(&session, SessionKey::UserId, SessionValue::Int(7))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            backend.cache_row(&db_key(session.id())).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_destroy_clears_everything() {
        let (store, _backend) = store();
        let (session, _) = store.begin(&HeaderMap::new()).await.unwrap();
        session.set_persistent(true);
        store
            .put(&session, SessionKey::UserId, SessionValue::Int(7))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let cookie = store.destroy(session.id()).await.unwrap();
        assert!(cookie.to_str().unwrap().contains("Max-Age=-1"));
        assert!(matches!(
            store.read(session.id(), false).await,
            Err(SessionError::NotFound)
        ));
        assert!(matches!(
            store.read(session.id(), true).await,
            Err(SessionError::NotFound)
        ));
    }
}
