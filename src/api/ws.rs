use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::Mutex;

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

type Sink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Fan-out of serialized update records to WebSocket subscribers. The
/// broadcaster owns the write halves; the accept side keeps the read half
/// and removes its subscriber when the peer goes away.
#[derive(Default)]
pub struct Broadcaster {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<u64, Sink>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, sink: SplitSink<WebSocket, Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut sinks = self.sinks.lock().await;
        sinks.insert(id, Arc::new(Mutex::new(sink)));
        id
    }

    pub async fn remove(&self, id: u64) {
        let mut sinks = self.sinks.lock().await;
        sinks.remove(&id);
    }

    /// Write the payload to every subscriber. The set is snapshotted under a
    /// short lock; each write is bounded by a per-subscriber deadline and
    /// failures are dropped silently.
    pub async fn broadcast(&self, payload: String) {
        let snapshot: Vec<Sink> = {
            let sinks = self.sinks.lock().await;
            sinks.values().cloned().collect()
        };
        for sink in snapshot {
            let mut sink = sink.lock().await;
            let _ = tokio::time::timeout(
                WRITE_TIMEOUT,
                sink.send(Message::Text(payload.clone())),
            )
            .await;
        }
    }
}
