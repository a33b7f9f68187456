/// Push channel client
/// Owns one WebSocket connection per actor session. Inbound frames are
/// decoded once and dispatched to local handlers in registration order;
/// the only upstream traffic is presence signals.
use feed_model::UserId;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{BroadcastEvent, ClientSignal, EventType, FeedConfig, FeedError, Result};

pub type EventHandler = Arc<dyn Fn(&BroadcastEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

impl From<&FeedConfig> for ChannelConfig {
    fn from(config: &FeedConfig) -> Self {
        Self {
            url: config.channel_url.clone(),
            reconnect_min: config.reconnect_min,
            reconnect_max: config.reconnect_max,
        }
    }
}

#[derive(Default)]
struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<EventType, Vec<(u64, EventHandler)>>>,
}

impl HandlerRegistry {
    fn add(&self, event_type: EventType, handler: EventHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(event_type)
            .or_default()
            .push((id, handler));
        id
    }

    fn remove(&self, event_type: EventType, id: u64) {
        if let Some(list) = self.handlers.lock().get_mut(&event_type) {
            list.retain(|(handler_id, _)| *handler_id != id);
        }
    }

    fn clear(&self) {
        self.handlers.lock().clear();
    }

    fn count(&self, event_type: EventType) -> usize {
        self.handlers
            .lock()
            .get(&event_type)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    fn dispatch(&self, event: &BroadcastEvent) {
        // Snapshot so handlers may (un)subscribe while running.
        let handlers: Vec<EventHandler> = match self.handlers.lock().get(&event.event_type()) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return,
        };
        for handler in handlers {
            handler(event);
        }
    }

    fn dispatch_frame(&self, text: &str) {
        match BroadcastEvent::decode(text) {
            Ok(event) => self.dispatch(&event),
            Err(e) => warn!("Dropping inbound frame: {}", e),
        }
    }
}

/// Handle returned by `subscribe`; call `unsubscribe` to remove the handler.
pub struct Subscription {
    event_type: EventType,
    id: u64,
    registry: Weak<HandlerRegistry>,
}

impl Subscription {
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.event_type, self.id);
        }
    }
}

struct Connection {
    actor: UserId,
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

pub struct ChannelClient {
    config: ChannelConfig,
    registry: Arc<HandlerRegistry>,
    connection: Mutex<Option<Connection>>,
    auth_token: Mutex<Option<String>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
}

impl ChannelClient {
    pub fn new(config: ChannelConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            config,
            registry: Arc::new(HandlerRegistry::default()),
            connection: Mutex::new(None),
            auth_token: Mutex::new(None),
            status: Arc::new(status),
        }
    }

    /// Bearer token sent with the next handshake.
    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.lock() = token;
    }

    /// Open the connection for `actor`. Calling it again for the same actor
    /// is a no-op; switching actors requires `disconnect` first.
    pub fn connect(&self, actor: &UserId) -> Result<()> {
        let mut connection = self.connection.lock();

        if let Some(existing) = connection.as_ref() {
            if !existing.task.is_finished() {
                if existing.actor == *actor {
                    debug!("Channel already connected for {}", actor);
                    return Ok(());
                }
                return Err(FeedError::ChannelError(format!(
                    "channel is connected as {}; disconnect first",
                    existing.actor
                )));
            }
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FeedError::ChannelError(format!("no async runtime: {}", e)))?;

        let url = handshake_url(&self.config.url, actor)?;
        let token = self.auth_token.lock().clone();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        info!("Connecting channel for {} to {}", actor, self.config.url);
        let task = runtime.spawn(run_transport(
            self.config.clone(),
            url,
            token,
            self.registry.clone(),
            outbound_rx,
            self.status.clone(),
        ));

        *connection = Some(Connection {
            actor: actor.clone(),
            outbound,
            task,
        });
        Ok(())
    }

    /// Close the connection and drop every handler so nothing leaks into the
    /// next actor session.
    pub fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.task.abort();
            info!("Channel disconnected for {}", connection.actor);
        }
        self.registry.clear();
        self.status.send_replace(ConnectionStatus::Disconnected);
    }

    pub fn subscribe(
        &self,
        event_type: EventType,
        handler: impl Fn(&BroadcastEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.registry.add(event_type, Arc::new(handler));
        Subscription {
            event_type,
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.registry.count(event_type)
    }

    /// Fire-and-forget upstream message. Fails when there is no live
    /// connection; the signal is dropped, never queued for later.
    pub fn emit(&self, signal: &ClientSignal) -> Result<()> {
        if self.status() != ConnectionStatus::Connected {
            return Err(FeedError::ChannelError("not connected".to_string()));
        }
        let text = signal.encode()?;
        let connection = self.connection.lock();
        let connection = connection
            .as_ref()
            .ok_or_else(|| FeedError::ChannelError("not connected".to_string()))?;
        connection
            .outbound
            .send(text)
            .map_err(|e| FeedError::ChannelError(e.to_string()))
    }

    /// Deliver an already decoded event to local handlers. The transport
    /// calls this once per inbound frame.
    pub fn dispatch(&self, event: &BroadcastEvent) {
        self.registry.dispatch(event);
    }

    /// Decode and deliver one raw frame; malformed frames are logged and
    /// dropped.
    pub fn dispatch_frame(&self, text: &str) {
        self.registry.dispatch_frame(text);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn connected_actor(&self) -> Option<UserId> {
        self.connection.lock().as_ref().map(|c| c.actor.clone())
    }
}

impl Drop for ChannelClient {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.task.abort();
        }
    }
}

fn handshake_url(base: &str, actor: &UserId) -> Result<String> {
    let mut url = reqwest::Url::parse(base)
        .map_err(|e| FeedError::ValidationError(format!("invalid channel url {}: {}", base, e)))?;
    url.query_pairs_mut().append_pair("userId", actor.as_str());
    Ok(url.to_string())
}

fn build_request(url: &str, token: Option<&str>) -> Result<Request> {
    let mut request = url
        .into_client_request()
        .map_err(|e| FeedError::ChannelError(e.to_string()))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| FeedError::ChannelError(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

/// Connection loop. Reconnects with exponential backoff; events missed
/// during a gap are not replayed.
async fn run_transport(
    config: ChannelConfig,
    url: String,
    token: Option<String>,
    registry: Arc<HandlerRegistry>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    status: Arc<watch::Sender<ConnectionStatus>>,
) {
    let mut backoff = config.reconnect_min;

    loop {
        status.send_replace(ConnectionStatus::Connecting);

        let request = match build_request(&url, token.as_deref()) {
            Ok(r) => r,
            Err(e) => {
                warn!("Cannot build channel handshake: {}", e);
                status.send_replace(ConnectionStatus::Disconnected);
                return;
            }
        };

        match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => {
                info!("Channel connected: {}", config.url);
                status.send_replace(ConnectionStatus::Connected);
                backoff = config.reconnect_min;

                let (mut ws_sender, mut ws_receiver) = ws_stream.split();

                loop {
                    tokio::select! {
                        frame = ws_receiver.next() => match frame {
                            Some(Ok(Message::Text(text))) => registry.dispatch_frame(&text),
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                    warn!("Failed to answer ping: {}", e);
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Channel closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!("Channel receive error: {}", e);
                                break;
                            }
                        },
                        outgoing = outbound.recv() => match outgoing {
                            Some(text) => {
                                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                                    warn!("Channel send error: {}", e);
                                    break;
                                }
                            }
                            None => {
                                status.send_replace(ConnectionStatus::Disconnected);
                                return;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                warn!("Channel connect to {} failed: {}", config.url, e);
            }
        }

        status.send_replace(ConnectionStatus::Connecting);
        debug!("Reconnecting channel in {:?}", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}
