//! Client connection to the broker.
//!
//! Maintains exactly one binary-mode WebSocket, surfaces everything that
//! happens as [`ClientEvent`]s, and reconnects with exponential backoff and
//! jitter when the link drops. After a successful re-authentication the
//! previously attached session is re-attached automatically.

use crate::protocol::{
    ControlAction, ErrorMessage, FileContent, FileList, FileRead, FileWrite, Frame, Resize,
    SessionControl, SessionInfo,
};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

/// Give up after this many consecutive failed reconnects.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// First-retry delay; doubles per attempt.
pub const BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Backoff ceiling.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// App-level ping cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url: {0}")]
    Url(#[source] tungstenite::Error),

    #[error("connection failed: {0}")]
    Connect(#[source] tungstenite::Error),

    #[error("websocket error: {0}")]
    Ws(#[source] tungstenite::Error),
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `ws://host:port` or `wss://host:port`.
    pub url: String,
    pub token: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl ClientOptions {
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            auto_reconnect: true,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            base_delay: BASE_RECONNECT_DELAY,
            max_delay: MAX_RECONNECT_DELAY,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Everything the connection surfaces upward.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Socket open, authentication pending.
    Connected,
    /// `AUTH_OK` received.
    Authenticated,
    /// Terminal bytes (scrollback replay arrives this way).
    Data(Vec<u8>),
    /// Live output demultiplexed by session.
    SessionOutput { session_id: String, data: Vec<u8> },
    /// A `SESSION_LIST` snapshot or broadcast.
    Sessions(Vec<SessionInfo>),
    /// An `ERROR` frame.
    ServerError(ErrorMessage),
    FileList(FileList),
    FileContent(FileContent),
    /// App-level pong with measured round-trip time.
    Pong { latency: Duration },
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectFailed,
    /// Transport-level failure (also triggers the reconnect policy).
    Error(String),
}

enum Command {
    Send(Frame),
    Disconnect,
}

/// Handle to the connection driver task.
pub struct ClientConnection {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ClientConnection {
    /// Spawn the connection driver. Events arrive on the returned receiver
    /// until the driver gives up or is told to disconnect.
    #[must_use]
    pub fn connect(opts: ClientOptions) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(driver(opts, cmd_rx, event_tx));
        (Self { cmd_tx }, event_rx)
    }

    fn send(&self, frame: Frame) {
        let _ = self.cmd_tx.send(Command::Send(frame));
    }

    /// Keystrokes for the attached session.
    pub fn send_input(&self, data: Vec<u8>) {
        self.send(Frame::TerminalData(data));
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.send(Frame::Resize(Resize { cols, rows }));
    }

    pub fn attach(&self, session_id: impl Into<String>) {
        self.send(Frame::SessionControl(SessionControl {
            session_id: Some(session_id.into()),
            ..SessionControl::action(ControlAction::Attach)
        }));
    }

    pub fn detach(&self) {
        self.send(Frame::SessionControl(SessionControl::action(
            ControlAction::Detach,
        )));
    }

    pub fn create_session(&self, name: Option<String>, cwd: Option<String>) {
        self.send(Frame::SessionControl(SessionControl {
            name,
            cwd,
            ..SessionControl::action(ControlAction::Create)
        }));
    }

    pub fn destroy_session(&self, session_id: impl Into<String>) {
        self.send(Frame::SessionControl(SessionControl {
            session_id: Some(session_id.into()),
            ..SessionControl::action(ControlAction::Destroy)
        }));
    }

    pub fn request_sessions(&self) {
        self.send(Frame::SessionControl(SessionControl::action(
            ControlAction::List,
        )));
    }

    pub fn list_files(&self, path: impl Into<String>) {
        self.send(Frame::FileList(FileList {
            path: path.into(),
            files: Vec::new(),
        }));
    }

    pub fn read_file(&self, path: impl Into<String>) {
        self.send(Frame::FileRead(FileRead { path: path.into() }));
    }

    pub fn write_file(&self, path: impl Into<String>, content: impl Into<String>) {
        self.send(Frame::FileWrite(FileWrite {
            path: path.into(),
            content: content.into(),
        }));
    }

    /// App-level ping; the round trip surfaces as [`ClientEvent::Pong`].
    pub fn ping(&self) {
        self.send(Frame::Ping);
    }

    /// Close the socket and disable reconnection.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }
}

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(base * 2^(attempt-1) + rand(0..1s), max)`.
fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
    (exp + jitter).min(max)
}

enum ConnEnd {
    /// Deliberate disconnect; never reconnect.
    Disconnect,
    /// Remote close or transport failure; reconnect policy applies.
    Closed,
}

async fn driver(
    opts: ClientOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut attempt: u32 = 0;
    // Survives reconnects so the session can be re-attached.
    let mut current_session: Option<String> = None;

    loop {
        match run_connection(
            &opts,
            &mut cmd_rx,
            &events,
            &mut current_session,
            &mut attempt,
        )
        .await
        {
            Ok(ConnEnd::Disconnect) => {
                let _ = events.send(ClientEvent::Disconnected);
                return;
            }
            Ok(ConnEnd::Closed) => {
                let _ = events.send(ClientEvent::Disconnected);
            }
            Err(e) => {
                debug!(error = %e, "connection attempt failed");
                let _ = events.send(ClientEvent::Error(e.to_string()));
            }
        }

        if !opts.auto_reconnect {
            return;
        }
        attempt += 1;
        if attempt > opts.max_reconnect_attempts {
            let _ = events.send(ClientEvent::ReconnectFailed);
            return;
        }
        let delay = backoff_delay(attempt, opts.base_delay, opts.max_delay);
        let _ = events.send(ClientEvent::Reconnecting { attempt, delay });
        tokio::time::sleep(delay).await;
    }
}

/// A single connection: open, authenticate, pump frames until it ends.
async fn run_connection(
    opts: &ClientOptions,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    events: &mpsc::UnboundedSender<ClientEvent>,
    current_session: &mut Option<String>,
    attempt: &mut u32,
) -> Result<ConnEnd, ClientError> {
    let mut request = opts
        .url
        .clone()
        .into_client_request()
        .map_err(ClientError::Url)?;
    let bearer = format!("Bearer {}", opts.token);
    if let Ok(value) = bearer.parse() {
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (socket, _response) = connect_async(request).await.map_err(ClientError::Connect)?;
    let _ = events.send(ClientEvent::Connected);
    // A successful open resets the retry budget.
    *attempt = 0;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut heartbeat = interval(opts.heartbeat_interval);
    heartbeat.tick().await; // the first tick fires immediately
    let mut ping_sent: Option<Instant> = None;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = match Frame::decode(&data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "dropping malformed frame");
                                continue;
                            }
                        };
                        handle_server_frame(frame, events, current_session, &mut ping_sent, &mut ws_tx)
                            .await
                            .map_err(ClientError::Ws)?;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        ws_tx
                            .send(Message::Pong(payload))
                            .await
                            .map_err(ClientError::Ws)?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(ConnEnd::Closed),
                    Some(Err(e)) => return Err(ClientError::Ws(e)),
                    _ => {}
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Send(frame)) => {
                        track_outgoing(&frame, current_session);
                        if matches!(frame, Frame::Ping) {
                            ping_sent = Some(Instant::now());
                        }
                        ws_tx
                            .send(Message::Binary(frame.encode()))
                            .await
                            .map_err(ClientError::Ws)?;
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ok(ConnEnd::Disconnect);
                    }
                }
            }
            _ = heartbeat.tick() => {
                ping_sent = Some(Instant::now());
                ws_tx
                    .send(Message::Binary(Frame::Ping.encode()))
                    .await
                    .map_err(ClientError::Ws)?;
            }
        }
    }
}

type ClientSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

async fn handle_server_frame(
    frame: Frame,
    events: &mpsc::UnboundedSender<ClientEvent>,
    current_session: &mut Option<String>,
    ping_sent: &mut Option<Instant>,
    ws_tx: &mut ClientSink,
) -> Result<(), tungstenite::Error> {
    match frame {
        Frame::AuthOk(_) => {
            let _ = events.send(ClientEvent::Authenticated);
            // Restore the working context after a reconnect.
            if let Some(id) = current_session.clone() {
                let reattach = Frame::SessionControl(SessionControl {
                    session_id: Some(id),
                    ..SessionControl::action(ControlAction::Attach)
                });
                ws_tx.send(Message::Binary(reattach.encode())).await?;
            }
        }
        Frame::TerminalData(data) => {
            let _ = events.send(ClientEvent::Data(data));
        }
        Frame::SessionOutput { session_id, data } => {
            // Output proves which session we are attached to.
            *current_session = Some(session_id.clone());
            let _ = events.send(ClientEvent::SessionOutput { session_id, data });
        }
        Frame::SessionList(sessions) => {
            let _ = events.send(ClientEvent::Sessions(sessions));
        }
        Frame::Error(error) => {
            let _ = events.send(ClientEvent::ServerError(error));
        }
        Frame::Pong => {
            if let Some(sent) = ping_sent.take() {
                let _ = events.send(ClientEvent::Pong {
                    latency: sent.elapsed(),
                });
            }
        }
        Frame::FileList(listing) => {
            let _ = events.send(ClientEvent::FileList(listing));
        }
        Frame::FileContent(content) => {
            let _ = events.send(ClientEvent::FileContent(content));
        }
        // Client-to-server kinds are not expected inbound.
        Frame::Ping
        | Frame::Resize(_)
        | Frame::SessionControl(_)
        | Frame::Auth(_)
        | Frame::FileRead(_)
        | Frame::FileWrite(_) => {}
    }
    Ok(())
}

/// Keep `current_session` in step with what we ask the server to do.
fn track_outgoing(frame: &Frame, current_session: &mut Option<String>) {
    if let Frame::SessionControl(control) = frame {
        match control.action {
            ControlAction::Attach => {
                if control.session_id.is_some() {
                    *current_session = control.session_id.clone();
                }
            }
            ControlAction::Detach => *current_session = None,
            ControlAction::Destroy => {
                if control.session_id == *current_session {
                    *current_session = None;
                }
            }
            ControlAction::Create | ControlAction::List => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        for attempt in 1..=10 {
            let delay = backoff_delay(attempt, base, max);
            let floor = base
                .saturating_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX))
                .min(max);
            assert!(delay >= floor.min(max), "attempt {attempt}: {delay:?}");
            assert!(delay <= max, "attempt {attempt}: {delay:?}");
        }
        // Early attempts stay within exponential + 1s jitter.
        let second = backoff_delay(2, base, max);
        assert!(second < Duration::from_secs(4));
    }

    #[test]
    fn test_track_outgoing_attach_detach() {
        let mut current = None;
        track_outgoing(
            &Frame::SessionControl(SessionControl {
                session_id: Some("ab12cd34".into()),
                ..SessionControl::action(ControlAction::Attach)
            }),
            &mut current,
        );
        assert_eq!(current.as_deref(), Some("ab12cd34"));

        track_outgoing(
            &Frame::SessionControl(SessionControl {
                session_id: Some("other000".into()),
                ..SessionControl::action(ControlAction::Destroy)
            }),
            &mut current,
        );
        assert_eq!(current.as_deref(), Some("ab12cd34"));

        track_outgoing(
            &Frame::SessionControl(SessionControl::action(ControlAction::Detach)),
            &mut current,
        );
        assert_eq!(current, None);
    }
}
