//! Sandbox session registry.
//!
//! Maps a logical session identifier to a live remote sandbox. The
//! remote metadata listing is the source of truth; a process-local
//! cache is only a fast path with an explicit staleness window, so a
//! cold process can still reconnect to a sandbox created by a previous
//! one. Resolution is serialized per session key: two concurrent first
//! uses of the same session await one in-flight creation instead of
//! racing to create duplicate (billable) sandboxes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::errors::SandboxError;

use super::client::{SandboxHandle, SandboxService, SESSION_METADATA_KEY};

struct CachedHandle {
    handle: SandboxHandle,
    cached_at: Instant,
}

pub struct SessionRegistry {
    service: Arc<dyn SandboxService>,
    default_template: String,
    sandbox_timeout: Duration,
    cache_ttl: Duration,
    cache: std::sync::Mutex<HashMap<String, CachedHandle>>,
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(service: Arc<dyn SandboxService>, config: &AppConfig) -> Self {
        Self {
            service,
            default_template: config.sandbox_template.clone(),
            sandbox_timeout: config.sandbox_timeout,
            cache_ttl: config.cache_ttl,
            cache: std::sync::Mutex::new(HashMap::new()),
            locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> Arc<dyn SandboxService> {
        Arc::clone(&self.service)
    }

    pub fn default_template(&self) -> &str {
        &self.default_template
    }

    /// Return a usable handle for the session, reconnecting to a live
    /// remote sandbox tagged with it or creating a fresh one. Callers
    /// never need to know which happened. Remote-service failures
    /// propagate uninterpreted.
    pub async fn resolve(
        &self,
        session_id: &str,
        template: Option<&str>,
    ) -> Result<SandboxHandle, SandboxError> {
        let key_lock = self.session_lock(session_id).await;
        let _guard = key_lock.lock().await;

        if let Some(handle) = self.cached(session_id) {
            return Ok(handle);
        }

        let live = self.service.list().await?;
        let existing = live.iter().find(|info| {
            info.metadata.get(SESSION_METADATA_KEY).map(String::as_str) == Some(session_id)
        });

        let handle = if let Some(info) = existing {
            let handle = self.service.connect(&info.sandbox_id).await?;
            self.service
                .set_timeout(&handle.sandbox_id, self.sandbox_timeout)
                .await?;
            tracing::debug!(session = session_id, sandbox = %handle.sandbox_id, "reconnected to live sandbox");
            handle
        } else {
            let template = template.unwrap_or(&self.default_template);
            let metadata = HashMap::from([
                (SESSION_METADATA_KEY.to_string(), session_id.to_string()),
                ("template".to_string(), template.to_string()),
            ]);
            let handle = self
                .service
                .create(template, metadata, self.sandbox_timeout)
                .await?;
            tracing::debug!(session = session_id, sandbox = %handle.sandbox_id, "created sandbox");
            handle
        };

        self.store(session_id, handle.clone());
        Ok(handle)
    }

    /// Forget the session and best-effort kill its remote sandbox.
    pub async fn release(&self, session_id: &str) -> Result<(), SandboxError> {
        let key_lock = self.session_lock(session_id).await;
        let _guard = key_lock.lock().await;

        let cached = self
            .cache
            .lock()
            .expect("registry cache lock poisoned")
            .remove(session_id);

        let sandbox_id = match cached {
            Some(entry) => Some(entry.handle.sandbox_id),
            None => self
                .service
                .list()
                .await?
                .into_iter()
                .find(|info| {
                    info.metadata.get(SESSION_METADATA_KEY).map(String::as_str)
                        == Some(session_id)
                })
                .map(|info| info.sandbox_id),
        };

        if let Some(id) = sandbox_id {
            match self.service.kill(&id).await {
                Ok(()) | Err(SandboxError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        self.locks.lock().await.remove(session_id);
        Ok(())
    }

    async fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cached(&self, session_id: &str) -> Option<SandboxHandle> {
        let cache = self.cache.lock().expect("registry cache lock poisoned");
        cache
            .get(session_id)
            .filter(|entry| entry.cached_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.handle.clone())
    }

    fn store(&self, session_id: &str, handle: SandboxHandle) {
        self.cache.lock().expect("registry cache lock poisoned").insert(
            session_id.to_string(),
            CachedHandle {
                handle,
                cached_at: Instant::now(),
            },
        );
    }
}
