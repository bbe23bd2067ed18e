//! WebSocket front end of the authority.
//!
//! Architecture:
//! ```text
//!  Client A ──┐  GET /api/sync          ┌── Authority ── DocumentStore (RocksDB)
//!             ├─ Pull/Push/Ping ───────►│        │
//!  Client B ──┘  ◄─ Snapshot/PushAck    │        ▼
//!                                       │     PokeHub (one group per document)
//!  Client A ◄── GET /api/poke?id=..&client=..  ◄─┘
//!  Client B ◄──         Poke frames
//! ```
//!
//! Requests are routed during the WebSocket handshake. A poke request
//! without a valid `id` or `client` is refused with 400, any other path
//! with 404, before the socket is upgraded.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use mapsync_core::{ValidationError, WrappedFeatureCollectionId};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::authority::{Authority, AuthorityConfig, AuthorityError};
use crate::poke::PokeSubscription;
use crate::protocol::{MessageType, ProtocolError, SyncMessage};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// WebSocket ping interval on poke sockets, in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub authority: AuthorityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9400".to_string(),
            heartbeat_interval_secs: 30,
            storage_path: None,
            authority: AuthorityConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub poke_connections: u64,
    pub rejected_handshakes: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// Endpoint selected by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Sync,
    Poke {
        doc_id: WrappedFeatureCollectionId,
        client_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

impl From<ValidationError> for RouteError {
    fn from(e: ValidationError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

/// Map a request path and query to an endpoint.
pub fn parse_route(path: &str, query: Option<&str>) -> Result<Route, RouteError> {
    match path.trim_end_matches('/') {
        "/api/sync" => Ok(Route::Sync),
        "/api/poke" => {
            let query = query.unwrap_or("");
            let doc_id = WrappedFeatureCollectionId::from_query(query)?;
            let client = query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == "client")
                .map(|(_, value)| value)
                .ok_or_else(|| RouteError::BadRequest("missing client".into()))?;
            let client_id = Uuid::parse_str(client)
                .map_err(|e| RouteError::BadRequest(format!("invalid client: {e}")))?;
            Ok(Route::Poke { doc_id, client_id })
        }
        other => Err(RouteError::NotFound(other.to_string())),
    }
}

#[derive(Debug, Error)]
enum RequestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error("unexpected {0:?} request")]
    Unexpected(MessageType),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    authority: Arc<Authority>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening the document store if a storage path is
    /// configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        let authority = Arc::new(Authority::new(config.authority.clone(), store));
        Ok(Self::with_authority(config, authority))
    }

    /// Serve an existing authority.
    pub fn with_authority(config: ServerConfig, authority: Arc<Authority>) -> Self {
        Self {
            config,
            authority,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        let config = ServerConfig::default();
        let authority = Arc::new(Authority::new(config.authority.clone(), None));
        Self::with_authority(config, authority)
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Recover persisted documents from storage.
    pub async fn recover(&self) -> Result<usize, AuthorityError> {
        self.authority.recover().await
    }

    /// Recover, bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("New TCP connection from {addr}");

            let authority = self.authority.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, authority, stats, heartbeat).await
                {
                    error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        authority: Arc<Authority>,
        stats: Arc<RwLock<ServerStats>>,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let mut route = None;
        let callback = |request: &Request, response: Response| {
            match parse_route(request.uri().path(), request.uri().query()) {
                Ok(r) => {
                    route = Some(r);
                    Ok(response)
                }
                Err(e) => {
                    debug!("Refusing handshake from {addr}: {e}");
                    Err(e.into_response())
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                stats.write().await.rejected_handshakes += 1;
                debug!("Handshake with {addr} failed: {e}");
                return Ok(());
            }
        };
        let Some(route) = route else {
            return Ok(());
        };

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            if matches!(route, Route::Poke { .. }) {
                s.poke_connections += 1;
            }
        }

        let (ws_sender, ws_receiver) = ws_stream.split();
        let result = match route {
            Route::Sync => {
                info!("Sync connection from {addr}");
                Self::serve_sync(ws_sender, ws_receiver, &authority, &stats).await
            }
            Route::Poke { doc_id, client_id } => {
                info!("Client {client_id} subscribed to pokes for {doc_id}");
                let mut subscription = authority.subscribe(&doc_id, client_id).await;
                let result =
                    Self::serve_pokes(ws_sender, ws_receiver, &doc_id, &mut subscription, heartbeat)
                        .await;
                drop(subscription);
                authority.hub().remove_if_empty(&doc_id).await;
                result
            }
        };

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        debug!("Connection closed from {addr}");
        result
    }

    async fn serve_sync(
        mut ws_sender: WsSender,
        mut ws_receiver: WsReceiver,
        authority: &Authority,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Binary(data)) => {
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += data.len() as u64;
                    }
                    let response = Self::handle_request(authority, &data).await;
                    ws_sender
                        .send(Message::Binary(response.encode()?.into()))
                        .await?;
                }
                Ok(Message::Ping(data)) => ws_sender.send(Message::Pong(data)).await?,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error on sync connection: {e}");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Answer a single request frame. Failures become `Error` frames that
    /// echo the request id.
    async fn handle_request(authority: &Authority, data: &[u8]) -> SyncMessage {
        let msg = match SyncMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Failed to decode request: {e}");
                return SyncMessage::error(0, "", e.to_string());
            }
        };
        let (request_id, doc_id) = (msg.request_id, msg.doc_id.clone());
        match Self::dispatch(authority, msg).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request {request_id} for {doc_id:?} failed: {e}");
                SyncMessage::error(request_id, doc_id, e.to_string())
            }
        }
    }

    async fn dispatch(authority: &Authority, msg: SyncMessage) -> Result<SyncMessage, RequestError> {
        match msg.msg_type {
            MessageType::Pull => {
                let id = WrappedFeatureCollectionId::parse(msg.doc_id.as_str())?;
                let doc = authority.pull(&id).await?;
                Ok(SyncMessage::snapshot(msg.request_id, &doc)?)
            }
            MessageType::Push => {
                let id = WrappedFeatureCollectionId::parse(msg.doc_id.as_str())?;
                let request = msg.push_request()?;
                let ack = authority.push(&id, msg.client_id, request.mutations).await?;
                Ok(SyncMessage::push_ack(msg.request_id, id.as_str(), &ack)?)
            }
            MessageType::Ping => Ok(SyncMessage::pong(msg.request_id)),
            other => Err(RequestError::Unexpected(other)),
        }
    }

    async fn serve_pokes(
        mut ws_sender: WsSender,
        mut ws_receiver: WsReceiver,
        doc_id: &WrappedFeatureCollectionId,
        subscription: &mut PokeSubscription,
        heartbeat: Duration,
    ) -> Result<(), BoxError> {
        let poke = SyncMessage::poke(doc_id.as_str()).encode()?;
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await;

        loop {
            tokio::select! {
                received = subscription.recv() => match received {
                    Some(()) => {
                        ws_sender.send(Message::Binary(poke.clone().into())).await?;
                    }
                    None => break,
                },
                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(msg) if msg.msg_type == MessageType::Ping => {
                            let pong = SyncMessage::pong(msg.request_id).encode()?;
                            ws_sender.send(Message::Binary(pong.into())).await?;
                        }
                        Ok(msg) => debug!("Ignoring {:?} on poke socket", msg.msg_type),
                        Err(e) => warn!("Failed to decode frame on poke socket: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Poke socket error for {doc_id}: {e}");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }
}
