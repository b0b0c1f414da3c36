//! Lifecycle owner for one realtime subscription.
//!
//! `SyncSession` ties a transport, the backlog, and a dispatch loop to one
//! cache and status projection. Changing the endpoint or disabling the
//! subscription tears the old connection down completely before anything new
//! is opened: the reader is stopped, the dispatch loop is stopped and awaited
//! (so a pass in flight finishes first), the backlog is cleared, and a fresh
//! loop is started. No event from the previous server is applied after that.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::store::{EventBuffer, QueryCache, StatusProjection};
use crate::transport::{ConnectionState, EventTransport};

struct DispatchTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DispatchTask {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            log::warn!("dispatch loop ended abnormally: {}", e);
        }
    }
}

/// A running subscription: transport, backlog, and dispatch loop.
pub struct SyncSession {
    client: reqwest::Client,
    endpoint: String,
    enabled: bool,
    options: DispatchOptions,
    cache: Arc<QueryCache>,
    status: Arc<StatusProjection>,
    buffer: Arc<EventBuffer>,
    state: Arc<watch::Sender<ConnectionState>>,
    transport: Option<EventTransport>,
    dispatch: Option<DispatchTask>,
}

impl SyncSession {
    /// Start syncing from `endpoint` with a fresh cache and status projection.
    pub fn new(endpoint: impl Into<String>, config: &SyncConfig) -> Self {
        Self::with_stores(
            reqwest::Client::new(),
            endpoint,
            config,
            Arc::new(QueryCache::new()),
            Arc::new(StatusProjection::new()),
        )
    }

    /// Start syncing into existing stores. `client` must not carry a total
    /// request timeout, since the event stream stays open indefinitely.
    pub fn with_stores(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        config: &SyncConfig,
        cache: Arc<QueryCache>,
        status: Arc<StatusProjection>,
    ) -> Self {
        let buffer = Arc::new(EventBuffer::new(config.max_backlog));
        let (state, _) = watch::channel(ConnectionState::default());
        let mut session = Self {
            client,
            endpoint: endpoint.into(),
            enabled: true,
            options: DispatchOptions::from(config),
            cache,
            status,
            buffer,
            state: Arc::new(state),
            transport: None,
            dispatch: None,
        };
        session.start_dispatch();
        session.open();
        session
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn status(&self) -> &Arc<StatusProjection> {
        &self.status
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Watch connectivity.
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Current connectivity.
    pub fn connection_state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Run a dispatch pass now, e.g. after seeding a collection that deferred events wait on.
    pub fn wake(&self) {
        self.buffer.wake();
    }

    /// Reopen the stream at the same endpoint after a failure. Queued events are kept.
    pub async fn reconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.open();
    }

    /// Point at a different server. The old connection and its backlog are discarded first.
    pub async fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        if endpoint == self.endpoint {
            return;
        }
        self.teardown().await;
        self.start_dispatch();
        log::info!("event endpoint changed: {} -> {}", self.endpoint, endpoint);
        self.endpoint = endpoint;
        self.open();
    }

    /// Enable or disable the subscription. Disabling tears the connection down.
    pub async fn set_enabled(&mut self, enabled: bool) {
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;
        if enabled {
            self.open();
        } else {
            self.teardown().await;
            self.start_dispatch();
        }
    }

    /// Stop everything. Once this returns no further cache writes happen.
    pub async fn shutdown(mut self) {
        self.teardown().await;
        log::debug!("sync session for {} shut down", self.endpoint);
    }

    fn start_dispatch(&mut self) {
        let (shutdown, rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            self.cache.clone(),
            self.status.clone(),
            self.buffer.clone(),
            self.options,
        );
        let handle = tokio::spawn(dispatcher.run(rx));
        self.dispatch = Some(DispatchTask { shutdown, handle });
    }

    fn open(&mut self) {
        if !self.enabled || self.transport.is_some() {
            return;
        }
        self.transport = Some(EventTransport::connect(
            self.client.clone(),
            self.endpoint.clone(),
            self.buffer.clone(),
            self.state.clone(),
        ));
    }

    /// Close the transport, stop the dispatch loop, and drop the backlog.
    /// Callers that keep going start a fresh loop afterwards, so no pass spans the clear.
    async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.stop().await;
        }
        self.buffer.clear().await;
        self.state.send_replace(ConnectionState::default());
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(dispatch) = self.dispatch.take() {
            let _ = dispatch.shutdown.send(true);
            dispatch.handle.abort();
        }
    }
}
