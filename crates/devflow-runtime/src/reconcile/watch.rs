//! Typed watch events and the long-lived loop that feeds them to a listener.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::{ReconcileError, ReconcileOutcome};
use crate::engine::EngineError;

/// One change notification for a resource of kind `K`.
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("invalid {kind} watch payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
    #[error("watch stream failed: {0}")]
    Stream(#[source] EngineError),
    #[error("watch source closed")]
    Closed,
}

pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, WatchError>>;

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    object: serde_json::Value,
}

impl<K: DeserializeOwned> WatchEvent<K> {
    /// Decodes one line of a Kubernetes watch stream.
    ///
    /// Blank lines and `BOOKMARK` events yield `Ok(None)`. An `ERROR` event
    /// carries an API status and ends the watch.
    pub fn decode(kind: &'static str, line: &[u8]) -> Result<Option<Self>, WatchError> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(None);
        }
        let invalid = |reason: String| WatchError::InvalidPayload { kind, reason };
        let raw: RawEvent = serde_json::from_slice(line).map_err(|e| invalid(e.to_string()))?;
        let wrap: fn(K) -> Self = match raw.event_type.as_str() {
            "ADDED" => WatchEvent::Added,
            "MODIFIED" => WatchEvent::Modified,
            "DELETED" => WatchEvent::Deleted,
            "BOOKMARK" => return Ok(None),
            "ERROR" => {
                let status = raw
                    .object
                    .get("code")
                    .and_then(|c| c.as_u64())
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or(500);
                let message = raw
                    .object
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or_default()
                    .to_string();
                return Err(WatchError::Stream(EngineError::Api { status, message }));
            }
            other => return Err(invalid(format!("unknown event type {other:?}"))),
        };
        let object = serde_json::from_value(raw.object).map_err(|e| invalid(e.to_string()))?;
        Ok(Some(wrap(object)))
    }
}

/// Source of watch events for one resource kind.
#[async_trait]
pub trait ResourceWatcher<K>: Send + Sync {
    /// Opens a stream. [WatchError::Closed] means the source is gone for good.
    async fn watch(&self) -> Result<EventStream<K>, WatchError>;
}

/// Consumer of watch events for one resource kind.
#[async_trait]
pub trait ResourceListener<K>: Send + Sync {
    async fn on_event(&self, resource: &K) -> Result<ReconcileOutcome, ReconcileError>;
}

/// In-process [ResourceWatcher] fed through an mpsc channel. Yields a single
/// stream; later `watch` calls report [WatchError::Closed].
pub struct ChannelWatcher<K> {
    receiver: Mutex<Option<mpsc::Receiver<Result<WatchEvent<K>, WatchError>>>>,
}

impl<K: Send + 'static> ChannelWatcher<K> {
    pub fn new(
        capacity: usize,
    ) -> (mpsc::Sender<Result<WatchEvent<K>, WatchError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                receiver: Mutex::new(Some(rx)),
            },
        )
    }
}

#[async_trait]
impl<K: Send + 'static> ResourceWatcher<K> for ChannelWatcher<K> {
    async fn watch(&self) -> Result<EventStream<K>, WatchError> {
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| WatchError::Closed)?
            .take()
            .ok_or(WatchError::Closed)?;
        Ok(ReceiverStream::new(receiver).boxed())
    }
}

/// Counters a [WatchLoop] returns when it stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub events: u64,
    pub applied: u64,
    pub skipped: u64,
    pub ignored_deletes: u64,
    pub invalid_payloads: u64,
    pub errors: u64,
    pub reconnects: u64,
}

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Drives one resource kind: opens the watch, hands each event to the
/// listener in arrival order, and reopens the watch when it ends.
pub struct WatchLoop<K> {
    name: &'static str,
    watcher: Arc<dyn ResourceWatcher<K>>,
    listener: Arc<dyn ResourceListener<K>>,
    reconnect_delay: Duration,
}

impl<K: Send + Sync + 'static> WatchLoop<K> {
    pub fn new(
        name: &'static str,
        watcher: Arc<dyn ResourceWatcher<K>>,
        listener: Arc<dyn ResourceListener<K>>,
    ) -> Self {
        Self {
            name,
            watcher,
            listener,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<WatchStats> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Runs until `shutdown` flips to `true`, its sender is dropped, or the
    /// watcher reports [WatchError::Closed].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WatchStats {
        let mut stats = WatchStats::default();
        tracing::info!(watch = self.name, "watch loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let mut stream = match self.watcher.watch().await {
                Ok(stream) => stream,
                Err(WatchError::Closed) => {
                    tracing::info!(watch = self.name, "watch source closed");
                    break;
                }
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(watch = self.name, error = %e, "failed to open watch");
                    if self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!(watch = self.name, ?stats, "watch loop stopped");
                            return stats;
                        }
                    }
                    next = stream.next() => match next {
                        None => break,
                        Some(Ok(event)) => self.dispatch(event, &mut stats).await,
                        Some(Err(e @ WatchError::InvalidPayload { .. })) => {
                            stats.invalid_payloads += 1;
                            tracing::warn!(watch = self.name, error = %e, "dropping undecodable event");
                        }
                        Some(Err(e)) => {
                            stats.errors += 1;
                            tracing::warn!(watch = self.name, error = %e, "watch stream interrupted");
                            break;
                        }
                    },
                }
            }

            stats.reconnects += 1;
            tracing::debug!(watch = self.name, "watch ended, reopening");
            if self.pause(&mut shutdown).await {
                break;
            }
        }
        tracing::info!(watch = self.name, ?stats, "watch loop stopped");
        stats
    }

    /// Sleeps for the reconnect delay; returns `true` if shutdown fired meanwhile.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_delay) => *shutdown.borrow(),
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        }
    }

    async fn dispatch(&self, event: WatchEvent<K>, stats: &mut WatchStats) {
        stats.events += 1;
        let resource = match event {
            WatchEvent::Added(resource) | WatchEvent::Modified(resource) => resource,
            WatchEvent::Deleted(_) => {
                stats.ignored_deletes += 1;
                return;
            }
        };
        match self.listener.on_event(&resource).await {
            Ok(ReconcileOutcome::Applied) => stats.applied += 1,
            Ok(ReconcileOutcome::Skipped(reason)) => {
                stats.skipped += 1;
                tracing::debug!(watch = self.name, ?reason, "event skipped");
            }
            Err(e) => {
                stats.errors += 1;
                tracing::error!(watch = self.name, error = %e, "event handling failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::reconcile::SkipReason;

    #[derive(Clone, Debug, Deserialize, PartialEq)]
    struct Widget {
        name: String,
    }

    struct CountingListener {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl ResourceListener<Widget> for CountingListener {
        async fn on_event(&self, resource: &Widget) -> Result<ReconcileOutcome, ReconcileError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if resource.name == "stale" {
                return Ok(ReconcileOutcome::Skipped(SkipReason::Terminal));
            }
            Ok(ReconcileOutcome::Applied)
        }
    }

    fn widget(name: &str) -> Widget {
        Widget { name: name.into() }
    }

    #[test]
    fn decodes_watch_lines() {
        let added =
            WatchEvent::<Widget>::decode("Widget", br#"{"type":"ADDED","object":{"name":"a"}}"#)
                .unwrap();
        assert_eq!(added, Some(WatchEvent::Added(widget("a"))));

        let bookmark = WatchEvent::<Widget>::decode(
            "Widget",
            br#"{"type":"BOOKMARK","object":{"metadata":{}}}"#,
        )
        .unwrap();
        assert_eq!(bookmark, None);
        assert_eq!(WatchEvent::<Widget>::decode("Widget", b"  \n").unwrap(), None);

        let err = WatchEvent::<Widget>::decode("Widget", br#"{"type":"ADDED","object":{}}"#)
            .unwrap_err();
        assert!(matches!(err, WatchError::InvalidPayload { kind: "Widget", .. }));

        let gone = WatchEvent::<Widget>::decode(
            "Widget",
            br#"{"type":"ERROR","object":{"code":410,"message":"too old resource version"}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            gone,
            WatchError::Stream(EngineError::Api { status: 410, .. })
        ));
    }

    #[tokio::test]
    async fn loop_dispatches_in_order_and_stops_when_source_closes() {
        let (tx, watcher) = ChannelWatcher::<Widget>::new(8);
        let listener = Arc::new(CountingListener {
            seen: AtomicUsize::new(0),
        });
        let watch_loop = WatchLoop::new("widgets", Arc::new(watcher), listener.clone())
            .with_reconnect_delay(Duration::from_millis(1));

        tx.send(Ok(WatchEvent::Added(widget("a")))).await.unwrap();
        tx.send(Ok(WatchEvent::Modified(widget("stale"))))
            .await
            .unwrap();
        tx.send(Err(WatchError::InvalidPayload {
            kind: "Widget",
            reason: "bad".into(),
        }))
        .await
        .unwrap();
        tx.send(Ok(WatchEvent::Deleted(widget("a")))).await.unwrap();
        drop(tx);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = watch_loop.run(shutdown_rx).await;

        assert_eq!(listener.seen.load(Ordering::SeqCst), 2);
        assert_eq!(stats.events, 3);
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.ignored_deletes, 1);
        assert_eq!(stats.invalid_payloads, 1);
        assert_eq!(stats.reconnects, 1);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown_signal() {
        let (tx, watcher) = ChannelWatcher::<Widget>::new(1);
        let listener = Arc::new(CountingListener {
            seen: AtomicUsize::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = WatchLoop::new("widgets", Arc::new(watcher), listener).spawn(shutdown_rx);

        shutdown_tx.send(true).unwrap();
        let stats = handle.await.unwrap();
        assert_eq!(stats.events, 0);
        drop(tx);
    }
}
