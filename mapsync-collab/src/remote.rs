//! Client-side view of the authority.
//!
//! [`Remote`] is what the sync client talks to. Two implementations:
//!
//! - [`LoopbackRemote`]: calls an in-process [`Authority`] directly. Used by
//!   tests and by single-process deployments. Can be switched offline to
//!   simulate a dropped network.
//! - [`WsRemote`]: talks to a [`SyncServer`](crate::server::SyncServer) over
//!   two WebSocket endpoints, `/api/sync` for request/response and
//!   `/api/poke` for notifications.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use mapsync_core::{FeatureCollectionDocument, Mutation, WrappedFeatureCollectionId};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::authority::Authority;
use crate::protocol::{MessageType, ProtocolError, PushAck, PushRequest, SyncMessage};

/// Stream of pokes for one document. Ends when the subscription is lost.
pub type PokeStream = Pin<Box<dyn Stream<Item = ()> + Send>>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NetworkError {
    #[error("authority unreachable: {0}")]
    Unreachable(String),
    #[error("connection closed")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("authority error: {0}")]
    Remote(String),
}

#[async_trait]
pub trait Remote: Send + Sync + 'static {
    /// Identity sent with every push so the authority can skip our own pokes.
    fn client_id(&self) -> Uuid;

    async fn pull(
        &self,
        id: &WrappedFeatureCollectionId,
    ) -> Result<FeatureCollectionDocument, NetworkError>;

    async fn push(
        &self,
        id: &WrappedFeatureCollectionId,
        mutations: Vec<Mutation>,
    ) -> Result<PushAck, NetworkError>;

    async fn subscribe_pokes(&self, id: &WrappedFeatureCollectionId)
        -> Result<PokeStream, NetworkError>;
}

/// In-process remote backed directly by an [`Authority`].
pub struct LoopbackRemote {
    authority: Arc<Authority>,
    client_id: Uuid,
    online: watch::Sender<bool>,
    pulls: AtomicU64,
    pushes: AtomicU64,
}

impl LoopbackRemote {
    pub fn new(authority: Arc<Authority>) -> Self {
        let (online, _) = watch::channel(true);
        Self {
            authority,
            client_id: Uuid::new_v4(),
            online,
            pulls: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
        }
    }

    /// Going offline fails every request with `Unreachable` and ends the
    /// open poke streams.
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Number of pulls that reached the authority.
    pub fn pull_count(&self) -> u64 {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn authority(&self) -> &Arc<Authority> {
        &self.authority
    }

    fn check_online(&self) -> Result<(), NetworkError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(NetworkError::Unreachable("loopback remote is offline".into()))
        }
    }
}

#[async_trait]
impl Remote for LoopbackRemote {
    fn client_id(&self) -> Uuid {
        self.client_id
    }

    async fn pull(
        &self,
        id: &WrappedFeatureCollectionId,
    ) -> Result<FeatureCollectionDocument, NetworkError> {
        self.check_online()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        self.authority
            .pull(id)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))
    }

    async fn push(
        &self,
        id: &WrappedFeatureCollectionId,
        mutations: Vec<Mutation>,
    ) -> Result<PushAck, NetworkError> {
        self.check_online()?;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.authority
            .push(id, self.client_id, mutations)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))
    }

    async fn subscribe_pokes(
        &self,
        id: &WrappedFeatureCollectionId,
    ) -> Result<PokeStream, NetworkError> {
        self.check_online()?;
        let subscription = self.authority.subscribe(id, self.client_id).await;
        let online = self.online.subscribe();

        let pokes = stream::unfold((subscription, online), |(mut sub, mut online)| async move {
            loop {
                if !*online.borrow_and_update() {
                    return None;
                }
                tokio::select! {
                    poke = sub.recv() => return poke.map(|()| ((), (sub, online))),
                    changed = online.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                }
            }
        });
        Ok(Box::pin(pokes))
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<SyncMessage>>>>;

/// One open `/api/sync` socket with its writer and reader tasks.
struct SyncConnection {
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SyncConnection {
    async fn open(url: &str) -> Result<Self, NetworkError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| NetworkError::Unreachable(e.to_string()))?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = outgoing_rx.recv().await {
                if ws_sender.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        let pending: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_responses(ws_receiver, pending.clone(), closed.clone()));

        Ok(Self {
            outgoing,
            pending,
            closed,
            reader,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for SyncConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route every response frame to the request waiting for its id.
async fn read_responses(
    mut ws_receiver: SplitStream<WsStream>,
    pending: PendingRequests,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                Ok(msg) => {
                    if let Some(tx) = pending.lock().await.remove(&msg.request_id) {
                        let _ = tx.send(msg);
                    } else {
                        debug!("dropping response to unknown request {}", msg.request_id);
                    }
                }
                Err(e) => warn!("undecodable frame from authority: {e}"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("sync socket error: {e}");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every outstanding request with `Closed`.
    pending.lock().await.clear();
}

/// Remote that reaches a [`SyncServer`](crate::server::SyncServer) over
/// WebSockets.
///
/// The sync socket is opened lazily and reopened after it fails, so a
/// caller that retries gets a fresh connection.
pub struct WsRemote {
    base_url: String,
    client_id: Uuid,
    request_timeout: Duration,
    connection: Mutex<Option<Arc<SyncConnection>>>,
    next_request: AtomicU64,
}

impl WsRemote {
    /// `base_url` is the server root, e.g. `ws://127.0.0.1:9400`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: Uuid::new_v4(),
            request_timeout: Duration::from_secs(10),
            connection: Mutex::new(None),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn connection(&self) -> Result<Arc<SyncConnection>, NetworkError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        let url = format!("{}/api/sync", self.base_url);
        let conn = Arc::new(SyncConnection::open(&url).await?);
        info!("connected to {url} as {}", self.client_id);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self, failed: &Arc<SyncConnection>) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, failed)) {
            *slot = None;
        }
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> Result<SyncMessage, ProtocolError>,
    ) -> Result<SyncMessage, NetworkError> {
        let conn = self.connection().await?;
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let bytes = build(request_id)?.encode()?;

        let (tx, rx) = oneshot::channel();
        conn.pending.lock().await.insert(request_id, tx);
        if conn.outgoing.send(bytes).await.is_err() {
            self.reset(&conn).await;
            return Err(NetworkError::Closed);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) if response.msg_type == MessageType::Error => {
                Err(NetworkError::Remote(response.error_message()?))
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.reset(&conn).await;
                Err(NetworkError::Closed)
            }
            Err(_) => {
                conn.pending.lock().await.remove(&request_id);
                Err(NetworkError::Timeout)
            }
        }
    }

    /// Round-trip a heartbeat on the sync socket.
    pub async fn ping(&self) -> Result<(), NetworkError> {
        let client_id = self.client_id;
        let response = self
            .request(|request_id| Ok(SyncMessage::ping(request_id, client_id)))
            .await?;
        match response.msg_type {
            MessageType::Pong => Ok(()),
            actual => Err(ProtocolError::UnexpectedMessage {
                expected: MessageType::Pong,
                actual,
            }
            .into()),
        }
    }
}

#[async_trait]
impl Remote for WsRemote {
    fn client_id(&self) -> Uuid {
        self.client_id
    }

    async fn pull(
        &self,
        id: &WrappedFeatureCollectionId,
    ) -> Result<FeatureCollectionDocument, NetworkError> {
        let client_id = self.client_id;
        let response = self
            .request(|request_id| Ok(SyncMessage::pull(request_id, id.as_str(), client_id)))
            .await?;
        Ok(response.document()?)
    }

    async fn push(
        &self,
        id: &WrappedFeatureCollectionId,
        mutations: Vec<Mutation>,
    ) -> Result<PushAck, NetworkError> {
        let client_id = self.client_id;
        let request = PushRequest { mutations };
        let response = self
            .request(|request_id| SyncMessage::push(request_id, id.as_str(), client_id, &request))
            .await?;
        Ok(response.ack()?)
    }

    async fn subscribe_pokes(
        &self,
        id: &WrappedFeatureCollectionId,
    ) -> Result<PokeStream, NetworkError> {
        let url = format!(
            "{}/api/poke?id={}&client={}",
            self.base_url, id, self.client_id
        );
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| NetworkError::Unreachable(e.to_string()))?;
        debug!("poke subscription open: {url}");

        let pokes = stream::unfold(ws_stream, |mut ws| async move {
            loop {
                match ws.next().await? {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(msg) if msg.msg_type == MessageType::Poke => return Some(((), ws)),
                        Ok(msg) => debug!("ignoring {:?} on poke socket", msg.msg_type),
                        Err(e) => warn!("undecodable poke frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        });
        Ok(Box::pin(pokes))
    }
}
