/// Jetstream consumer for real-time identity events
///
/// Owns a single websocket connection and hands out messages one at a time.
/// Dropped connections are re-established with exponential backoff, resuming
/// from the cursor of the last message handed out.

use crate::error::{Result, SyncError};
use crate::models::{JetstreamEvent, StreamMessage};
use crate::storage::Cursor;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

/// Only identity and account events are sent when no real collection is wanted
const WANTED_COLLECTIONS: &str = "app.bsky.none";

/// Ordered source of stream messages with a resumable position
#[async_trait]
pub trait StreamSource: Send {
    /// Wait for the next message. `Ok(None)` once the source is closed for good.
    async fn next_message(&mut self) -> Result<Option<StreamMessage>>;

    /// Position of the last message handed out
    fn cursor(&self) -> Option<Cursor>;

    /// Close the connection; later calls to `next_message` return `None`
    async fn disconnect(&mut self);
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Jetstream websocket client
pub struct JetstreamClient {
    endpoint: String,
    cursor: Option<Cursor>,
    socket: Option<WsStream>,
    state: ConnectionState,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl JetstreamClient {
    /// Create a client for `endpoint`, resuming after `cursor` if given
    pub fn new(endpoint: &str, cursor: Option<Cursor>) -> Self {
        JetstreamClient {
            endpoint: endpoint.to_string(),
            cursor,
            socket: None,
            state: ConnectionState::Disconnected,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
        }
    }

    /// Override the reconnect backoff (start, cap)
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        log::debug!("Jetstream state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Connect with exponential backoff retry. Keeps trying until connected.
    async fn connect_with_backoff(&mut self) -> Result<()> {
        let mut backoff = self.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let url = subscribe_url(&self.endpoint, self.cursor)?;

            if self.state != ConnectionState::Reconnecting {
                self.set_state(ConnectionState::Connecting);
            }
            log::info!("Connecting to {}...", url);

            match connect_async(url.as_str()).await {
                Ok((socket, _)) => {
                    self.socket = Some(socket);
                    self.set_state(ConnectionState::Connected);
                    log::info!("Connected");
                    return Ok(());
                }
                Err(e) => {
                    log::error!("Jetstream connection attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                    self.set_state(ConnectionState::Reconnecting);
                    log::info!("Reconnecting...");
                }
            }
        }
    }

    fn drop_connection(&mut self) {
        self.socket = None;
        self.set_state(ConnectionState::Reconnecting);
        log::info!("Reconnecting...");
    }
}

#[async_trait]
impl StreamSource for JetstreamClient {
    async fn next_message(&mut self) -> Result<Option<StreamMessage>> {
        loop {
            if self.state == ConnectionState::Stopped {
                return Ok(None);
            }
            if self.socket.is_none() {
                self.connect_with_backoff().await?;
            }
            let socket = match self.socket.as_mut() {
                Some(socket) => socket,
                None => continue,
            };

            match socket.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<JetstreamEvent>(&text) {
                    Ok(event) => {
                        let message = StreamMessage::from(event);
                        self.cursor = Some(message.cursor);
                        return Ok(Some(message));
                    }
                    Err(e) => log::warn!("Skipping undecodable Jetstream frame: {}", e),
                },
                Some(Ok(Message::Close(frame))) => {
                    log::info!("Disconnected by server: {:?}", frame);
                    self.drop_connection();
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::error!("Jetstream error: {}", e);
                    self.drop_connection();
                }
                None => {
                    log::info!("Disconnected.");
                    self.drop_connection();
                }
            }
        }
    }

    fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    async fn disconnect(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).await {
                log::debug!("Error closing Jetstream connection: {}", e);
            }
            log::info!("Disconnected.");
        }
        self.set_state(ConnectionState::Stopped);
    }
}

/// Build the subscribe URL for `endpoint`
///
/// A bare host gets `wss://` and `/subscribe`; full ws/wss (or http/https)
/// URLs keep their path unless it is empty.
pub fn subscribe_url(endpoint: &str, cursor: Option<Cursor>) -> Result<Url> {
    let raw = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("wss://{}", endpoint)
    };

    let invalid = |reason: String| {
        SyncError::Config(format!("Invalid stream endpoint '{}': {}", endpoint, reason))
    };

    let mut url = Url::parse(&raw).map_err(|e| invalid(e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot use websocket scheme".to_string()))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/subscribe");
    }

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("wantedCollections", WANTED_COLLECTIONS);
        if let Some(cursor) = cursor {
            query.append_pair("cursor", &cursor.to_string());
        }
    }

    Ok(url)
}
