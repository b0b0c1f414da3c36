//! One live event-stream connection: a reader task feeding the backlog.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::sse::SseDecoder;
use crate::event::Event;
use crate::store::EventBuffer;

/// Connectivity as seen by the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    /// Last transport failure; cleared on the next successful connect.
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("event stream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("event stream returned {0}")]
    Status(reqwest::StatusCode),
    #[error("event stream closed by server")]
    Closed,
}

/// Handle to a running event-stream reader.
///
/// The reader does not reconnect on its own; after a failure the owner calls
/// `connect` again. Dropping the handle aborts the reader.
pub struct EventTransport {
    endpoint: String,
    live: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl EventTransport {
    /// Open `endpoint` and start appending decoded events to `buffer`.
    pub fn connect(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        buffer: Arc<EventBuffer>,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        let endpoint = endpoint.into();
        let live = Arc::new(AtomicBool::new(true));
        log::info!("connecting to event stream {}", endpoint);
        let task = tokio::spawn(read_stream(
            client,
            endpoint.clone(),
            buffer,
            live.clone(),
            state,
        ));
        Self {
            endpoint,
            live,
            task: Some(task),
        }
    }

    /// Stop the reader and wait for it. Once this returns, nothing more from
    /// this connection reaches the backlog.
    pub async fn close(mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        log::debug!("event stream {} closed", self.endpoint);
    }
}

impl Drop for EventTransport {
    fn drop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn read_stream(
    client: reqwest::Client,
    endpoint: String,
    buffer: Arc<EventBuffer>,
    live: Arc<AtomicBool>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    if let Err(e) = pump(&client, &endpoint, &buffer, &live, &state).await {
        if live.load(Ordering::SeqCst) {
            log::warn!("event stream {} ended: {}", endpoint, e);
            state.send_replace(ConnectionState {
                connected: false,
                error: Some(e.to_string()),
            });
        }
    }
}

/// Returns `Ok` only when stopped by teardown.
async fn pump(
    client: &reqwest::Client,
    endpoint: &str,
    buffer: &EventBuffer,
    live: &AtomicBool,
    state: &watch::Sender<ConnectionState>,
) -> Result<(), TransportError> {
    let res = client
        .get(endpoint)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?;
    if !res.status().is_success() {
        return Err(TransportError::Status(res.status()));
    }
    if !live.load(Ordering::SeqCst) {
        return Ok(());
    }
    log::info!("event stream connected: {}", endpoint);
    state.send_replace(ConnectionState {
        connected: true,
        error: None,
    });

    let mut stream = res.bytes_stream();
    let mut decoder = SseDecoder::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        for frame in decoder.feed(&chunk) {
            let event = match Event::parse(&frame) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("discarding malformed event frame: {}", e);
                    continue;
                }
            };
            if !live.load(Ordering::SeqCst) {
                return Ok(());
            }
            log::trace!("event received: {}", event.kind());
            buffer.append(event).await;
        }
    }
    Err(TransportError::Closed)
}
