// STOMP-over-WebSocket transport for one meeting's chat.
//
// The transport owns the socket. It connects, performs the STOMP handshake,
// subscribes to every chat channel, publishes heartbeats and outgoing
// messages, and reconnects after a fixed delay when the connection drops.
// The chat session only sees `TransportEvent`s and sends `TransportCommand`s.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, InvalidHeaderValue, COOKIE};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use mealmate_core::config::RealtimeConfig;

use crate::event::{Channel, PING_DESTINATION};
use crate::frame::{Command, Frame};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("invalid cookie header: {0}")]
    InvalidCookie(#[from] InvalidHeaderValue),
}

/// Events emitted to the chat session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connection attempt is starting.
    Connecting,
    /// STOMP handshake finished and every channel is subscribed.
    Connected,
    /// An established connection was lost; a reconnect is scheduled.
    Disconnected { reason: String },
    /// A connection attempt failed or the broker sent an ERROR frame.
    Error { message: String },
    /// A MESSAGE frame on one of the subscribed channels.
    Inbound { channel: Channel, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Publish { destination: String, body: String },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub ws_url: String,
    pub meeting_id: u64,
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    /// `Cookie` header sent with the upgrade request.
    pub cookie: Option<String>,
}

impl TransportOptions {
    pub fn from_config(config: &RealtimeConfig, meeting_id: u64, cookie: Option<String>) -> Self {
        TransportOptions {
            ws_url: config.ws_url.clone(),
            meeting_id,
            reconnect_delay: config.reconnect_delay(),
            heartbeat_interval: config.heartbeat_interval(),
            cookie,
        }
    }

    /// Virtual host for the STOMP CONNECT frame.
    fn stomp_host(&self) -> String {
        self.ws_url
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.host().map(str::to_string))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

/// How a single connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    Shutdown,
    EventsClosed,
    Lost(String),
}

/// Run the transport until `Shutdown` is received, the command sender is
/// dropped, or the event receiver goes away.
pub async fn run(
    options: TransportOptions,
    mut commands: mpsc::Receiver<TransportCommand>,
    tx: mpsc::Sender<TransportEvent>,
) {
    info!(meeting_id = options.meeting_id, url = %options.ws_url, "Chat transport starting");

    loop {
        if tx.send(TransportEvent::Connecting).await.is_err() {
            return;
        }

        match connect(&options).await {
            Ok(ws) => {
                info!(url = %options.ws_url, "WebSocket connected");
                let (mut sink, mut stream) = ws.split();
                match drive(&mut sink, &mut stream, &options, &mut commands, &tx).await {
                    SessionEnd::Shutdown => {
                        info!(meeting_id = options.meeting_id, "Chat transport shut down");
                        return;
                    }
                    SessionEnd::EventsClosed => return,
                    SessionEnd::Lost(reason) => {
                        warn!(meeting_id = options.meeting_id, "Chat connection lost: {reason}");
                        if tx.send(TransportEvent::Disconnected { reason }).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(url = %options.ws_url, "WebSocket connect failed: {e}");
                let event = TransportEvent::Error {
                    message: e.to_string(),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        if !wait_for_retry(options.reconnect_delay, &mut commands).await {
            info!(meeting_id = options.meeting_id, "Chat transport shut down while reconnecting");
            return;
        }
        debug!(meeting_id = options.meeting_id, "Reconnecting");
    }
}

async fn connect(
    options: &TransportOptions,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TransportError> {
    let mut request = options.ws_url.as_str().into_client_request()?;
    if let Some(cookie) = &options.cookie {
        request
            .headers_mut()
            .insert(COOKIE, HeaderValue::from_str(cookie)?);
    }
    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// Sleep out the reconnect delay. Publishes are dropped while offline.
/// Returns false when the transport should stop instead of reconnecting.
async fn wait_for_retry(delay: Duration, commands: &mut mpsc::Receiver<TransportCommand>) -> bool {
    let deadline = tokio::time::sleep(delay);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return true,
            cmd = commands.recv() => match cmd {
                Some(TransportCommand::Publish { destination, .. }) => {
                    warn!(%destination, "Dropping publish while disconnected");
                }
                Some(TransportCommand::Shutdown) | None => return false,
            }
        }
    }
}

fn text(frame: Frame) -> Message {
    Message::text(frame.encode())
}

/// Drive one established socket: handshake, subscriptions, inbound frames,
/// outgoing publishes and heartbeats.
///
/// Generic over the split halves so it can be exercised with in-memory
/// channels.
pub(crate) async fn drive<Si, St>(
    sink: &mut Si,
    stream: &mut St,
    options: &TransportOptions,
    commands: &mut mpsc::Receiver<TransportCommand>,
    tx: &mpsc::Sender<TransportEvent>,
) -> SessionEnd
where
    Si: Sink<Message, Error = WsError> + Unpin,
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let meeting_id = options.meeting_id;
    if let Err(e) = sink.send(text(Frame::connect(&options.stomp_host()))).await {
        return SessionEnd::Lost(e.to_string());
    }

    let mut connected = false;
    let period = options.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = stream.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(raw))) => match Frame::decode(raw.as_str()) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!(meeting_id, "Discarding undecodable STOMP frame: {e}");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) => {
                        return SessionEnd::Lost("server closed the connection".to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("connection stream ended".to_string()),
                };

                match frame.command {
                    Command::Connected => {
                        if connected {
                            continue;
                        }
                        for channel in Channel::ALL {
                            let subscribe = Frame::subscribe(
                                channel.subscription_id(),
                                &channel.destination(meeting_id),
                            );
                            if let Err(e) = sink.send(text(subscribe)).await {
                                return SessionEnd::Lost(e.to_string());
                            }
                        }
                        connected = true;
                        heartbeat.reset();
                        info!(
                            meeting_id,
                            version = frame.get("version").unwrap_or("?"),
                            "STOMP session established"
                        );
                        if tx.send(TransportEvent::Connected).await.is_err() {
                            return SessionEnd::EventsClosed;
                        }
                    }
                    Command::Message => {
                        let channel = frame
                            .get("subscription")
                            .and_then(Channel::from_subscription_id)
                            .or_else(|| {
                                frame
                                    .get("destination")
                                    .and_then(|d| Channel::from_destination(meeting_id, d))
                            });
                        let Some(channel) = channel else {
                            debug!(
                                meeting_id,
                                destination = frame.get("destination").unwrap_or(""),
                                "MESSAGE for unknown subscription"
                            );
                            continue;
                        };
                        let event = TransportEvent::Inbound {
                            channel,
                            body: frame.body,
                        };
                        if tx.send(event).await.is_err() {
                            return SessionEnd::EventsClosed;
                        }
                    }
                    Command::Error => {
                        let message = frame
                            .get("message")
                            .map(str::to_string)
                            .unwrap_or_else(|| frame.body.clone());
                        warn!(meeting_id, "Broker ERROR frame: {message}");
                        if tx.send(TransportEvent::Error { message }).await.is_err() {
                            return SessionEnd::EventsClosed;
                        }
                    }
                    other => debug!(meeting_id, command = other.as_str(), "Ignoring frame"),
                }
            }
            cmd = commands.recv() => match cmd {
                Some(TransportCommand::Publish { destination, body }) => {
                    if !connected {
                        warn!(%destination, "Dropping publish before STOMP handshake");
                        continue;
                    }
                    if let Err(e) = sink.send(text(Frame::send_json(&destination, body))).await {
                        return SessionEnd::Lost(e.to_string());
                    }
                }
                Some(TransportCommand::Shutdown) | None => {
                    if connected {
                        for channel in Channel::ALL {
                            let unsubscribe = Frame::unsubscribe(channel.subscription_id());
                            let _ = sink.send(text(unsubscribe)).await;
                        }
                        let _ = sink.send(text(Frame::disconnect())).await;
                    }
                    let _ = sink.close().await;
                    return SessionEnd::Shutdown;
                }
            },
            _ = heartbeat.tick(), if connected => {
                if let Err(e) = sink.send(text(Frame::send_json(PING_DESTINATION, "{}"))).await {
                    return SessionEnd::Lost(e.to_string());
                }
            }
        }
    }
}
