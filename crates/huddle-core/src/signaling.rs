use std::collections::VecDeque;
use std::sync::Mutex;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::errors::RoomError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One end of a text signaling connection.
///
/// `recv` yields `None` once the other end is gone.
pub struct SignalingChannel {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl SignalingChannel {
    /// Two connected ends, used for in-process transports.
    pub fn pair() -> (SignalingChannel, SignalingChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            SignalingChannel {
                tx: Some(a_tx),
                rx: b_rx,
            },
            SignalingChannel {
                tx: Some(b_tx),
                rx: a_rx,
            },
        )
    }

    pub fn send(&self, text: String) -> Result<(), RoomError> {
        self.tx
            .as_ref()
            .ok_or_else(|| RoomError::Connection("signaling channel closed".into()))?
            .send(text)
            .map_err(|_| RoomError::Connection("signaling peer is gone".into()))
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

/// Opens signaling connections. Implemented over websockets and in memory.
pub trait SignalingConnector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<SignalingChannel, RoomError>>;
}

/// Websocket transport. Each connection runs a sender and a receiver task
/// bridging the socket to a [`SignalingChannel`].
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    async fn sender_task(
        mut write: SplitSink<WsStream, Message>,
        mut outbound: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = write.send(Message::Text(text.into())).await {
                tracing::warn!("signaling send failed: {e}");
                return;
            }
        }
        let _ = write.send(Message::Close(None)).await;
        tracing::debug!("signaling sender task ended");
    }

    async fn receiver_task(mut read: SplitStream<WsStream>, inbound: mpsc::UnboundedSender<String>) {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if inbound.send(text.as_str().to_owned()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(reason)) => {
                    tracing::info!("signaling closed by server: {reason:?}");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("signaling receive failed: {e}");
                    break;
                }
            }
        }
        tracing::debug!("signaling receiver task ended");
    }
}

impl SignalingConnector for WsConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<SignalingChannel, RoomError>> {
        Box::pin(async move {
            let parsed = url::Url::parse(url)
                .map_err(|e| RoomError::Connection(format!("invalid signaling url {url}: {e}")))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(RoomError::Connection(format!(
                    "signaling url must be ws:// or wss://, got {url}"
                )));
            }
            let (ws, _) = connect_async(url).await?;
            tracing::info!("signaling connected to {}", parsed.host_str().unwrap_or_default());
            let (write, read) = ws.split();

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            tokio::spawn(Self::sender_task(write, out_rx));
            tokio::spawn(Self::receiver_task(read, in_tx));

            Ok(SignalingChannel {
                tx: Some(out_tx),
                rx: in_rx,
            })
        })
    }
}

/// In-process transport. Each `connect` takes the next queued endpoint.
#[derive(Default)]
pub struct MemoryConnector {
    pending: Mutex<VecDeque<SignalingChannel>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an endpoint for the next `connect` and return the server end.
    pub fn accept(&self) -> SignalingChannel {
        let (client, server) = SignalingChannel::pair();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(client);
        server
    }
}

impl SignalingConnector for MemoryConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<SignalingChannel, RoomError>> {
        let next = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Box::pin(async move {
            next.ok_or_else(|| RoomError::Connection(format!("no endpoint listening at {url}")))
        })
    }
}
