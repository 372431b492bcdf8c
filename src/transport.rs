//! Duplex transport to the Live API
//!
//! A [`Connector`] opens the channel, performs the setup handshake and hands
//! back a [`Connection`]: an outbound [`TransportHandle`], the inbound stream
//! of [`TransportEvent`]s and a [`Closer`]. The websocket implementation splits
//! the socket into a writer task and a reader task.

use crate::config::SessionConfig;
use crate::error::{LiveError, Result};
use crate::protocol::{BidiGenerateContentSetup, ClientMessage, ServerEvent, ServerMessage};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// How the remote end closed the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseKind {
    /// Normal close or `goAway`
    Clean,
    Error(String),
}

/// Inbound item from an open transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Server(ServerEvent),
    Closed(CloseKind),
}

/// Outbound half of an open transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<ClientMessage>,
}

impl TransportHandle {
    pub fn new(tx: mpsc::Sender<ClientMessage>) -> Self {
        Self { tx }
    }

    /// Queue a message without waiting. Fails with [`LiveError::Timeout`] when
    /// the transport cannot keep up and [`LiveError::ChannelClosed`] when it is gone.
    pub fn try_send(&self, msg: ClientMessage) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LiveError::Timeout,
            mpsc::error::TrySendError::Closed(_) => LiveError::ChannelClosed,
        })
    }

    /// Queue a message, waiting for room.
    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| LiveError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Requests a graceful close of the transport. Closing twice is a no-op.
#[derive(Debug)]
pub struct Closer(Option<oneshot::Sender<()>>);

impl Closer {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.0.take() {
            if tx.send(()).is_err() {
                debug!("Transport already shut down");
            }
        }
    }
}

/// An open, set-up transport.
#[derive(Debug)]
pub struct Connection {
    pub handle: TransportHandle,
    pub events: mpsc::Receiver<TransportEvent>,
    pub closer: Closer,
}

/// Opens transports. The session manager calls this once per session generation.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, setup: BidiGenerateContentSetup) -> BoxFuture<'_, Result<Connection>>;
}

/// Websocket connector for the Gemini Live endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    endpoint: String,
    setup_timeout: Duration,
    outbound_capacity: usize,
}

impl WebSocketConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            endpoint: config.endpoint(),
            setup_timeout: config.setup_timeout,
            outbound_capacity: config.outbound_capacity,
        }
    }

    async fn open(&self, setup: BidiGenerateContentSetup) -> Result<Connection> {
        info!("Connecting to Live API");
        let (ws_stream, resp) = connect_async(self.endpoint.as_str()).await.map_err(classify_connect_error)?;
        debug!("WebSocket connection response: {:?}", resp.status());

        let (mut sink, mut stream) = ws_stream.split();

        info!("Sending setup message with model: {}", setup.model);
        let json = ClientMessage::Setup(setup).to_json()?;
        sink.send(Message::Text(json.into())).await?;

        let pending = tokio::time::timeout(self.setup_timeout, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                LiveError::Timeout
            })??;
        info!("Live session setup complete");

        let (out_tx, out_rx) = mpsc::channel(self.outbound_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(256);
        let (closer, shutdown_rx) = Closer::new();

        for event in pending {
            // Fresh channel with room for this handful of events.
            let _ = event_tx.try_send(TransportEvent::Server(event));
        }

        tokio::spawn(write_loop(sink, out_rx, shutdown_rx, event_tx.clone()));
        tokio::spawn(read_loop(stream, event_tx));

        Ok(Connection {
            handle: TransportHandle::new(out_tx),
            events: event_rx,
            closer,
        })
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, setup: BidiGenerateContentSetup) -> BoxFuture<'_, Result<Connection>> {
        Box::pin(self.open(setup))
    }
}

fn classify_connect_error(e: WsError) -> LiveError {
    if let WsError::Http(resp) = &e {
        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            return LiveError::Authentication(format!("server rejected credentials (HTTP {})", status));
        }
    }
    LiveError::WebSocket(e)
}

/// Read until `setupComplete`. Any other events seen first are returned so
/// they can be delivered after the handshake.
async fn wait_for_setup_complete(stream: &mut WsStream) -> Result<Vec<ServerEvent>> {
    let mut early = Vec::new();
    while let Some(message) = stream.next().await {
        match message? {
            Message::Close(frame) => {
                info!("WebSocket closed during setup: {:?}", frame);
                return Err(match frame {
                    Some(f) if f.code == CloseCode::Policy => LiveError::Authentication(f.reason.as_str().to_string()),
                    _ => LiveError::SetupNotComplete,
                });
            }
            message => {
                for event in decode_message(message) {
                    if event == ServerEvent::SetupComplete {
                        return Ok(early);
                    }
                    early.push(event);
                }
            }
        }
    }
    Err(LiveError::ConnectionClosed)
}

/// Decode a text or binary frame into server events. Frames that do not parse
/// are logged and skipped.
fn decode_message(message: Message) -> Vec<ServerEvent> {
    let text = match &message {
        Message::Text(text) => text.as_str(),
        Message::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                debug!("Received binary message ({} bytes)", bytes.len());
                return Vec::new();
            }
        },
        _ => return Vec::new(),
    };

    match ServerMessage::parse(text) {
        Ok(msg) => msg.into_events(),
        Err(e) => {
            error!("Failed to parse server message: {:?}", e);
            debug!("Raw message: {}", text);
            Vec::new()
        }
    }
}

fn close_kind(frame: Option<&CloseFrame>) -> CloseKind {
    match frame {
        None => CloseKind::Clean,
        Some(f) if matches!(f.code, CloseCode::Normal | CloseCode::Away) => CloseKind::Clean,
        Some(f) => CloseKind::Error(format!("closed with {}: {}", u16::from(f.code), f.reason.as_str())),
    }
}

async fn read_loop(mut stream: WsStream, events: mpsc::Sender<TransportEvent>) {
    debug!("Inbound message task started");
    let closed = loop {
        match stream.next().await {
            Some(Ok(Message::Close(frame))) => {
                info!("WebSocket closed: {:?}", frame);
                break close_kind(frame.as_ref());
            }
            Some(Ok(message)) => {
                for event in decode_message(message) {
                    let go_away = matches!(event, ServerEvent::GoAway { .. });
                    if events.send(TransportEvent::Server(event)).await.is_err() {
                        debug!("Event receiver dropped, stopping reader");
                        return;
                    }
                    if go_away {
                        info!("Server sent goAway, treating as clean close");
                        let _ = events.send(TransportEvent::Closed(CloseKind::Clean)).await;
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                error!("WebSocket error: {:?}", e);
                break CloseKind::Error(e.to_string());
            }
            None => break CloseKind::Error("stream ended without close frame".to_string()),
        }
    };
    let _ = events.send(TransportEvent::Closed(closed)).await;
    debug!("Inbound message task terminated");
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<ClientMessage>,
    mut shutdown: oneshot::Receiver<()>,
    events: mpsc::Sender<TransportEvent>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Closing websocket");
                if let Err(e) = sink.close().await {
                    warn!("Error while closing websocket: {}", e);
                }
                return;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    if let Err(e) = sink.close().await {
                        warn!("Error while closing websocket: {}", e);
                    }
                    return;
                };
                let kind = msg.kind();
                let json = match msg.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize {} message: {}", kind, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    error!("Failed to send {} message: {:?}", kind, e);
                    let _ = events.send(TransportEvent::Closed(CloseKind::Error(e.to_string()))).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_kind_classification() {
        assert_eq!(close_kind(None), CloseKind::Clean);
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert_eq!(close_kind(Some(&normal)), CloseKind::Clean);
        let abnormal = CloseFrame {
            code: CloseCode::Error,
            reason: "internal".into(),
        };
        assert!(matches!(close_kind(Some(&abnormal)), CloseKind::Error(reason) if reason.contains("internal")));
    }

    #[test]
    fn test_decode_message_skips_garbage() {
        assert!(decode_message(Message::Text("not json".into())).is_empty());
        assert_eq!(
            decode_message(Message::Text(r#"{"setupComplete":{}}"#.into())),
            vec![ServerEvent::SetupComplete]
        );
        assert_eq!(
            decode_message(Message::Binary(br#"{"serverContent":{"turnComplete":true}}"#.to_vec().into())),
            vec![ServerEvent::TurnComplete]
        );
    }

    #[tokio::test]
    async fn test_handle_reports_full_and_closed() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = TransportHandle::new(tx);
        handle.try_send(ClientMessage::audio(&[0, 0])).unwrap();
        assert!(matches!(handle.try_send(ClientMessage::audio(&[0, 0])), Err(LiveError::Timeout)));
        assert!(rx.recv().await.is_some());
        drop(rx);
        assert!(matches!(handle.try_send(ClientMessage::audio(&[0, 0])), Err(LiveError::ChannelClosed)));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_closer_is_idempotent() {
        let (mut closer, mut rx) = Closer::new();
        closer.close();
        closer.close();
        assert!(rx.try_recv().is_ok());
    }
}
