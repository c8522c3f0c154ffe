//! Telemetry delivery queue.
//!
//! A context-owned service (constructed once at bootstrap, injected via
//! `AppState`) that accepts fire-and-forget analytics events, batches
//! them, and flushes to the ingestion endpoint every five seconds. A
//! failed delivery re-inserts the drained batch at the queue head so it
//! leads the next attempt; events are only ever lost if the process
//! dies while they are queued.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub event_name: String,
    pub event_properties: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    pub session_id: String,
}

/// Delivery target for flushed batches.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn deliver(&self, events: &[TelemetryEvent]) -> anyhow::Result<()>;
}

/// POSTs `{ "events": [...] }` to the ingestion endpoint.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TelemetrySink for HttpSink {
    async fn deliver(&self, events: &[TelemetryEvent]) -> anyhow::Result<()> {
        self.client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "events": events }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

struct Inner {
    queue: Mutex<VecDeque<TelemetryEvent>>,
    session_id: String,
    sink: Arc<dyn TelemetrySink>,
    shutdown_tx: watch::Sender<bool>,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TelemetryQueue {
    inner: Arc<Inner>,
}

impl TelemetryQueue {
    /// Create the queue and start its background flusher.
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        let queue = Self::detached(sink);

        let loop_queue = queue.clone();
        let mut shutdown_rx = queue.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => loop_queue.flush().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *queue.inner.ticker.lock().expect("ticker lock poisoned") = Some(handle);
        queue
    }

    /// Create the queue without a background flusher. Flushes must be
    /// driven by hand; used by tests.
    pub(crate) fn detached(sink: Arc<dyn TelemetrySink>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                session_id: uuid::Uuid::new_v4().to_string(),
                sink,
                shutdown_tx,
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Queue one event. Synchronous, never blocks, never fails visibly.
    pub fn track(
        &self,
        event_name: impl Into<String>,
        event_properties: serde_json::Value,
        team_id: Option<String>,
    ) {
        let event = TelemetryEvent {
            event_name: event_name.into(),
            event_properties,
            team_id,
            session_id: self.inner.session_id.clone(),
        };
        match self.inner.queue.lock() {
            Ok(mut queue) => queue.push_back(event),
            Err(_) => tracing::warn!("telemetry queue lock poisoned; event dropped"),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Drain the queue and attempt delivery. The drain happens before the
    /// network call, so events arriving mid-flight start a fresh batch.
    pub async fn flush(&self) {
        let batch: Vec<TelemetryEvent> = {
            let Ok(mut queue) = self.inner.queue.lock() else {
                return;
            };
            if queue.is_empty() {
                return;
            }
            queue.drain(..).collect()
        };

        if let Err(err) = self.inner.sink.deliver(&batch).await {
            tracing::warn!(count = batch.len(), error = %err, "telemetry delivery failed; re-queuing batch");
            if let Ok(mut queue) = self.inner.queue.lock() {
                for event in batch.into_iter().rev() {
                    queue.push_front(event);
                }
            }
        }
    }

    /// Stop the background flusher and drain whatever is still queued.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let handle = self
            .inner
            .ticker
            .lock()
            .ok()
            .and_then(|mut ticker| ticker.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush().await;
    }
}
