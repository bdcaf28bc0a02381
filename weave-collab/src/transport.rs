//! Frame transports for peer links.
//!
//! A [`FrameLink`] is a pair of byte-frame channels. The peer tasks only
//! ever see links; how the frames travel is up to the [`Connector`]:
//!
//! - [`WsConnector`] dials a WebSocket URL and bridges the socket to
//!   channels with a reader task and a writer task.
//! - [`MemoryNetwork`] hands links between tasks in the same process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Frames buffered per link direction.
pub const LINK_CAPACITY: usize = 256;

/// One bidirectional frame channel to a remote peer.
#[derive(Debug)]
pub struct FrameLink {
    pub tx: mpsc::Sender<Vec<u8>>,
    pub rx: mpsc::Receiver<Vec<u8>>,
}

impl FrameLink {
    /// Two connected ends: frames sent on one arrive on the other.
    pub fn pair(capacity: usize) -> (FrameLink, FrameLink) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            FrameLink { tx: a_tx, rx: a_rx },
            FrameLink { tx: b_tx, rx: b_rx },
        )
    }

    /// Bridge an established WebSocket to a link.
    ///
    /// Binary messages become frames; the link closes when the socket does.
    pub fn from_websocket<S>(ws_stream: WebSocketStream<S>) -> FrameLink
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (local, remote) = FrameLink::pair(LINK_CAPACITY);
        let FrameLink { tx: in_tx, rx: mut out_rx } = remote;

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: forward WebSocket binary frames to the link
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        if in_tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::debug!("WebSocket read error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        });

        local
    }
}

/// Transport failures. Never fatal to a session: the peer task retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nobody is listening at the address
    Unreachable(String),
    /// WebSocket handshake or I/O failure
    WebSocket(String),
    /// The link closed
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(addr) => write!(f, "Unreachable: {addr}"),
            Self::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            Self::Closed => write!(f, "Link closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Opens links to one remote endpoint. Called again for every reconnect.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'static, Result<FrameLink, TransportError>>;

    /// Endpoint description for logs.
    fn endpoint(&self) -> String;
}

/// Dials a WebSocket URL.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<FrameLink, TransportError>> {
        let url = self.url.clone();
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
                .await
                .map_err(|e| TransportError::WebSocket(e.to_string()))?;
            Ok(FrameLink::from_websocket(ws_stream))
        }
        .boxed()
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

type Listeners = Arc<Mutex<HashMap<String, mpsc::Sender<FrameLink>>>>;

/// In-process network of named listeners.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Listeners,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting links at `addr`, replacing any previous listener.
    pub fn listen(&self, addr: impl Into<String>) -> MemoryListener {
        let addr = addr.into();
        let (tx, rx) = mpsc::channel(16);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.clone(), tx);
        MemoryListener { addr, incoming: rx }
    }

    /// A connector dialing `addr` on this network.
    pub fn connector(&self, addr: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            addr: addr.into(),
            listeners: self.listeners.clone(),
        }
    }
}

/// Accept side of a [`MemoryNetwork`] address. Dropping it makes the
/// address unreachable.
pub struct MemoryListener {
    addr: String,
    incoming: mpsc::Receiver<FrameLink>,
}

impl MemoryListener {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub async fn accept(&mut self) -> Option<FrameLink> {
        self.incoming.recv().await
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    addr: String,
    listeners: Listeners,
}

impl Connector for MemoryConnector {
    fn connect(&self) -> BoxFuture<'static, Result<FrameLink, TransportError>> {
        let addr = self.addr.clone();
        let listener = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&addr)
            .cloned();
        async move {
            let listener = listener.ok_or_else(|| TransportError::Unreachable(addr.clone()))?;
            let (local, remote) = FrameLink::pair(LINK_CAPACITY);
            listener
                .send(remote)
                .await
                .map_err(|_| TransportError::Unreachable(addr))?;
            Ok(local)
        }
        .boxed()
    }

    fn endpoint(&self) -> String {
        format!("memory://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let (mut a, mut b) = FrameLink::pair(4);
        a.tx.send(vec![1]).await.unwrap();
        b.tx.send(vec![2]).await.unwrap();
        assert_eq!(b.rx.recv().await, Some(vec![1]));
        assert_eq!(a.rx.recv().await, Some(vec![2]));

        drop(a);
        assert_eq!(b.rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_memory_connect_and_accept() {
        let net = MemoryNetwork::new();
        let mut listener = net.listen("alice");
        assert_eq!(listener.addr(), "alice");

        let mut dialed = net.connector("alice").connect().await.unwrap();
        let mut accepted = listener.accept().await.unwrap();

        dialed.tx.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(accepted.rx.recv().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_memory_unreachable() {
        let net = MemoryNetwork::new();
        let connector = net.connector("nobody");
        assert_eq!(connector.endpoint(), "memory://nobody");
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Unreachable(_))
        ));

        let listener = net.listen("nobody");
        drop(listener);
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_ws_connector_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = WsConnector::new(format!("ws://127.0.0.1:{port}"));
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::WebSocket(_))
        ));
    }

    #[tokio::test]
    async fn test_websocket_bridge() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut link = FrameLink::from_websocket(ws);
            while let Some(frame) = link.rx.recv().await {
                if link.tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let mut link = WsConnector::new(format!("ws://127.0.0.1:{port}"))
            .connect()
            .await
            .unwrap();
        link.tx.send(vec![7, 8, 9]).await.unwrap();
        let echoed = tokio::time::timeout(std::time::Duration::from_secs(2), link.rx.recv())
            .await
            .unwrap();
        assert_eq!(echoed, Some(vec![7, 8, 9]));
    }
}
