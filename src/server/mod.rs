//! The broker: HTTP + WebSocket server, connection state machine, and
//! session routing.
//!
//! One TCP port serves `/api/health`, static assets for the browser UI, and
//! WebSocket upgrades. Each accepted socket runs its own task through an
//! auth phase (header, query, or first-frame token) and then the main
//! message loop; PTY output is pumped by a single poll task that owns every
//! session's read side.

// PIDs are always positive and timestamps fit u64.
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]

mod files;
mod manager;
mod rate_limit;
mod scrollback;
mod session;

pub use files::{FileError, FileHandler, MAX_READ_BYTES};
pub use manager::{CreateOptions, ManagerConfig, ManagerError, SessionManager};
pub use rate_limit::{RateLimiter, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW};
pub use scrollback::{Scrollback, DEFAULT_SCROLLBACK_BYTES};
pub use session::{Session, SessionOptions, Subscriber, DEFAULT_COLS, DEFAULT_IDLE_TIMEOUT, DEFAULT_ROWS};

use crate::auth;
use crate::config::Config;
use crate::protocol::{
    AuthOk, ControlAction, ErrorCode, Frame, Resize, SessionControl,
};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

/// Errors that can occur while running the broker.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address {0}")]
    Addr(String),

    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Broker tunables. Production defaults; tests shrink the timeouts.
pub struct BrokerConfig {
    /// Persisted config: listen address, signing secret, TLS paths.
    pub config: Config,
    /// Child program + arguments spawned per session.
    pub command: Vec<String>,
    /// Base directory for per-session sandboxes.
    pub sessions_dir: PathBuf,
    /// Directory of browser UI assets, served at `/`.
    pub static_dir: Option<PathBuf>,
    pub auth_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reaper_interval: Duration,
    pub poll_interval: Duration,
    pub rate_max_requests: usize,
    pub rate_window: Duration,
    pub scrollback_max: usize,
    pub idle_timeout: Duration,
}

impl BrokerConfig {
    /// Production defaults on top of a persisted config.
    #[must_use]
    pub fn new(config: Config, sessions_dir: PathBuf) -> Self {
        let command = vec![config.command.clone().unwrap_or_else(|| "claude".to_string())];
        Self {
            config,
            command,
            sessions_dir,
            static_dir: None,
            auth_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(10),
            rate_max_requests: DEFAULT_MAX_REQUESTS,
            rate_window: DEFAULT_WINDOW,
            scrollback_max: DEFAULT_SCROLLBACK_BYTES,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

struct BrokerState {
    cfg: BrokerConfig,
    manager: Mutex<SessionManager>,
    limiter: Mutex<RateLimiter>,
    files: FileHandler,
    /// Encoded frames fanned out to every authenticated socket.
    broadcasts: broadcast::Sender<Vec<u8>>,
    shutdown: broadcast::Sender<()>,
    next_conn_id: AtomicU64,
    handle: Handle,
}

/// The broker server. Cheap to clone via the shared state.
#[derive(Clone)]
pub struct Broker {
    state: Arc<BrokerState>,
}

impl Broker {
    #[must_use]
    pub fn new(cfg: BrokerConfig) -> Self {
        let manager = SessionManager::new(ManagerConfig {
            command: cfg.command.clone(),
            sessions_dir: cfg.sessions_dir.clone(),
            scrollback_max: cfg.scrollback_max,
            idle_timeout: cfg.idle_timeout,
        });
        let limiter = RateLimiter::new(cfg.rate_max_requests, cfg.rate_window);
        let files = FileHandler::new(cfg.sessions_dir.clone());
        let (broadcasts, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);

        Self {
            state: Arc::new(BrokerState {
                cfg,
                manager: Mutex::new(manager),
                limiter: Mutex::new(limiter),
                files,
                broadcasts,
                shutdown,
                next_conn_id: AtomicU64::new(1),
                handle: Handle::new(),
            }),
        }
    }

    /// The bound address once the listener is up.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.handle.listening().await
    }

    /// Stop the broker: close every socket, kill every session, stop the
    /// listener.
    pub async fn shutdown(&self) {
        info!("shutting down");
        let _ = self.state.shutdown.send(());
        self.state.manager.lock().await.destroy_all();
        self.state
            .handle
            .graceful_shutdown(Some(Duration::from_secs(2)));
    }

    /// Run until shut down. Sessions die with the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr: SocketAddr = format!("{}:{}", self.state.cfg.config.host, self.state.cfg.config.port)
            .parse()
            .map_err(|_| {
                ServerError::Addr(format!(
                    "{}:{}",
                    self.state.cfg.config.host, self.state.cfg.config.port
                ))
            })?;

        // Background sweeps. Both stop with the shutdown broadcast and never
        // take the server down with them.
        let poll_state = Arc::clone(&self.state);
        let mut poll_shutdown = self.state.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = pty_poll_task(poll_state) => {}
                _ = poll_shutdown.recv() => {}
            }
        });
        let reaper_state = Arc::clone(&self.state);
        let mut reaper_shutdown = self.state.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                () = idle_reaper_task(reaper_state) => {}
                _ = reaper_shutdown.recv() => {}
            }
        });

        let app = router(Arc::clone(&self.state))
            .into_make_service_with_connect_info::<SocketAddr>();
        let handle = self.state.handle.clone();

        let result = match &self.state.cfg.config.tls {
            Some(tls) => {
                let rustls = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
                    .await
                    .map_err(ServerError::Tls)?;
                info!(%addr, "listening (tls)");
                axum_server::bind_rustls(addr, rustls)
                    .handle(handle)
                    .serve(app)
                    .await
            }
            None => {
                info!(%addr, "listening");
                axum_server::bind(addr).handle(handle).serve(app).await
            }
        };

        // Whatever stopped the listener, sessions do not outlive the server.
        self.state.manager.lock().await.destroy_all();
        info!("server stopped");
        result.map_err(ServerError::Io)
    }
}

fn router(state: Arc<BrokerState>) -> Router {
    let static_dir = state.cfg.static_dir.clone();
    let mut router = Router::new()
        .route("/api/health", get(health))
        .route("/", get(root));
    if let Some(dir) = static_dir {
        router = router.fallback_service(tower_http::services::ServeDir::new(dir));
    }
    router.with_state(state)
}

async fn health(State(state): State<Arc<BrokerState>>) -> impl IntoResponse {
    let sessions = state.manager.lock().await.len();
    Json(serde_json::json!({ "status": "ok", "sessions": sessions }))
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

/// `/` serves both WebSocket upgrades and the UI index.
async fn root(
    State(state): State<Arc<BrokerState>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    match ws {
        Some(upgrade) => {
            // Header and query credentials are checked before the upgrade;
            // the third path (first-frame AUTH) runs inside the socket task.
            let token = bearer_token(&headers).or(query.token);
            let pre_authed = token
                .as_deref()
                .and_then(|token| auth::verify_access_token(token, &state.cfg.config))
                .is_some();
            upgrade.on_upgrade(move |socket| handle_socket(state, socket, pre_authed, remote))
        }
        None => index(&state).await,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn index(state: &BrokerState) -> Response {
    if let Some(dir) = &state.cfg.static_dir {
        if let Ok(body) = tokio::fs::read_to_string(dir.join("index.html")).await {
            return Html(body).into_response();
        }
    }
    Html("<!doctype html><title>ccr</title><p>ccr broker is running.</p>".to_string())
        .into_response()
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

async fn send_frame(ws_tx: &mut WsSink, frame: &Frame) -> Result<(), axum::Error> {
    ws_tx.send(Message::Binary(frame.encode())).await
}

/// Per-socket task: auth phase, then the main message loop.
async fn handle_socket(
    state: Arc<BrokerState>,
    socket: WebSocket,
    pre_authed: bool,
    remote: SocketAddr,
) {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::SeqCst);
    let remote_key = remote.ip().to_string();
    info!(conn_id, %remote, pre_authed, "client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    if !pre_authed
        && !first_frame_auth(&state, conn_id, &mut ws_tx, &mut ws_rx).await
    {
        let _ = ws_tx.send(Message::Close(None)).await;
        info!(conn_id, "client rejected during auth");
        return;
    }

    // Authenticated: subscribe to broadcasts before the snapshot so no
    // list update can fall between them, then enter the message loop.
    let mut broadcast_rx = state.broadcasts.subscribe();
    if send_frame(&mut ws_tx, &Frame::AuthOk(AuthOk::default()))
        .await
        .is_err()
    {
        return;
    }
    let list = Frame::SessionList(state.manager.lock().await.list_sessions());
    if send_frame(&mut ws_tx, &list).await.is_err() {
        return;
    }

    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    let mut conn = Conn::new(Arc::clone(&state), conn_id, remote_key.clone(), output_tx);
    conn.run(&mut ws_tx, &mut ws_rx, &mut output_rx, &mut broadcast_rx)
        .await;

    // Teardown: the session itself survives, only the attachment goes.
    state.manager.lock().await.detach_conn(conn_id);
    state.limiter.lock().await.remove(&remote_key);
    info!(conn_id, "client disconnected");
}

/// Wait for a valid first-frame `AUTH` within the auth timeout. Returns
/// false when the socket must be closed.
async fn first_frame_auth(
    state: &BrokerState,
    conn_id: u64,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
) -> bool {
    let deadline = tokio::time::Instant::now() + state.cfg.auth_timeout;

    let error = loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, ws_rx.next()).await {
            Err(_) => {
                debug!(conn_id, "auth timeout");
                break Frame::error(ErrorCode::AuthTimeout, "no AUTH frame received in time");
            }
            Ok(None) | Ok(Some(Err(_))) => return false,
            Ok(Some(Ok(Message::Binary(data)))) => match Frame::decode(&data) {
                Ok(Frame::Auth(payload)) => {
                    if auth::verify_access_token(&payload.token, &state.cfg.config).is_some() {
                        return true;
                    }
                    break Frame::error(ErrorCode::AuthFailed, "invalid or expired token");
                }
                _ => break Frame::error(ErrorCode::AuthRequired, "first frame must be AUTH"),
            },
            // Transport-level liveness frames do not count against auth.
            Ok(Some(Ok(Message::Ping(payload)))) => {
                if ws_tx.send(Message::Pong(payload)).await.is_err() {
                    return false;
                }
            }
            Ok(Some(Ok(Message::Pong(_)))) => {}
            Ok(Some(Ok(_))) => {
                break Frame::error(ErrorCode::AuthRequired, "first frame must be AUTH");
            }
        }
    };

    let _ = send_frame(ws_tx, &error).await;
    false
}

/// Connection-local state for the main loop. Lives in the broker's task for
/// this socket; nothing is bolted onto the socket type.
struct Conn {
    state: Arc<BrokerState>,
    id: u64,
    remote_key: String,
    current_session: Option<String>,
    /// Sender registered with the manager on attach; the paired receiver is
    /// drained by this connection's select loop.
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    is_alive: bool,
}

impl Conn {
    fn new(
        state: Arc<BrokerState>,
        id: u64,
        remote_key: String,
        output_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            state,
            id,
            remote_key,
            current_session: None,
            output_tx,
            is_alive: true,
        }
    }

    async fn run(
        &mut self,
        ws_tx: &mut WsSink,
        ws_rx: &mut WsStream,
        output_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
        broadcast_rx: &mut broadcast::Receiver<Vec<u8>>,
    ) {
        let mut shutdown_rx = self.state.shutdown.subscribe();
        let mut heartbeat = interval(self.state.cfg.heartbeat_interval);
        heartbeat.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if self.handle_incoming(&data, ws_tx).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Text(_))) => {
                            let frame = Frame::error(ErrorCode::ParseError, "expected a binary frame");
                            if send_frame(ws_tx, &frame).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws_tx.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.is_alive = true;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(conn_id = self.id, error = %e, "websocket error");
                            break;
                        }
                    }
                }
                // Session output frames registered on attach. `recv` cannot
                // return None while we hold `output_tx` ourselves.
                Some(bytes) = output_rx.recv() => {
                    if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                result = broadcast_rx.recv() => {
                    match result {
                        Ok(bytes) => {
                            if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(conn_id = self.id, lagged = n, "broadcast subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if !self.is_alive {
                        info!(conn_id = self.id, "heartbeat timeout, terminating socket");
                        break;
                    }
                    self.is_alive = false;
                    if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    /// Rate-limit, decode, dispatch one inbound message.
    async fn handle_incoming(
        &mut self,
        data: &[u8],
        ws_tx: &mut WsSink,
    ) -> Result<(), axum::Error> {
        if !self.state.limiter.lock().await.check(&self.remote_key) {
            return send_frame(
                ws_tx,
                &Frame::error(ErrorCode::RateLimited, "message budget exhausted"),
            )
            .await;
        }

        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                return send_frame(ws_tx, &Frame::error(ErrorCode::ParseError, e.to_string()))
                    .await;
            }
        };

        match frame {
            Frame::TerminalData(input) => self.forward_input(&input, ws_tx).await,
            Frame::Resize(resize) => {
                self.resize(resize).await;
                Ok(())
            }
            Frame::Ping => send_frame(ws_tx, &Frame::Pong).await,
            Frame::SessionControl(control) => self.session_control(control, ws_tx).await,
            Frame::Auth(_) => send_frame(ws_tx, &Frame::AuthOk(AuthOk::default())).await,
            Frame::FileList(request) => self.file_list(&request.path, ws_tx).await,
            Frame::FileRead(request) => self.file_read(&request.path, ws_tx).await,
            Frame::FileWrite(request) => {
                self.file_write(&request.path, &request.content, ws_tx).await
            }
            // Server-to-client kinds and app-level pongs are ignored inbound.
            Frame::Pong
            | Frame::Error(_)
            | Frame::SessionList(_)
            | Frame::AuthOk(_)
            | Frame::SessionOutput { .. }
            | Frame::FileContent(_) => Ok(()),
        }
    }

    /// Input is routed through the subscription, not the conn-local id, so
    /// a socket whose attachment was taken over cannot keep writing.
    async fn forward_input(&mut self, input: &[u8], ws_tx: &mut WsSink) -> Result<(), axum::Error> {
        let mut manager = self.state.manager.lock().await;
        match manager.session_for_conn(self.id) {
            Some(session) => {
                session.write(input);
                Ok(())
            }
            None => {
                drop(manager);
                self.current_session = None;
                send_frame(ws_tx, &Frame::error(ErrorCode::NoSession, "no attached session"))
                    .await
            }
        }
    }

    async fn resize(&mut self, resize: Resize) {
        // Silent no-op without an attached session.
        if let Some(session) = self.state.manager.lock().await.session_for_conn(self.id) {
            session.resize(resize.cols, resize.rows);
        }
    }

    async fn session_control(
        &mut self,
        control: SessionControl,
        ws_tx: &mut WsSink,
    ) -> Result<(), axum::Error> {
        match control.action {
            ControlAction::Create => {
                let opts = CreateOptions {
                    name: control.name,
                    cwd: control.cwd.map(PathBuf::from),
                    cols: control.cols,
                    rows: control.rows,
                };
                let created = {
                    let mut manager = self.state.manager.lock().await;
                    manager.detach_conn(self.id);
                    let created = manager
                        .create_session(opts)
                        .map(|session| session.id.clone());
                    if let Ok(id) = &created {
                        manager.attach_client(id, self.id, self.output_tx.clone());
                    }
                    created
                };
                match created {
                    Ok(id) => {
                        self.current_session = Some(id);
                        broadcast_session_list(&self.state).await;
                        Ok(())
                    }
                    Err(e) => {
                        error!(conn_id = self.id, error = %e, "session create failed");
                        self.current_session = None;
                        send_frame(
                            ws_tx,
                            &Frame::error(
                                ErrorCode::SessionNotFound,
                                format!("failed to create session: {e}"),
                            ),
                        )
                        .await
                    }
                }
            }
            ControlAction::Attach => {
                let Some(id) = control.session_id else {
                    return send_frame(
                        ws_tx,
                        &Frame::error(ErrorCode::MissingSessionId, "attach requires sessionId"),
                    )
                    .await;
                };
                self.attach(&id, ws_tx).await
            }
            ControlAction::Detach => {
                self.state.manager.lock().await.detach_conn(self.id);
                self.current_session = None;
                Ok(())
            }
            ControlAction::Destroy => {
                let Some(id) = control.session_id else {
                    return send_frame(
                        ws_tx,
                        &Frame::error(ErrorCode::MissingSessionId, "destroy requires sessionId"),
                    )
                    .await;
                };
                let destroyed = self.state.manager.lock().await.destroy_session(&id);
                if !destroyed {
                    return send_frame(
                        ws_tx,
                        &Frame::error(
                            ErrorCode::SessionNotFound,
                            format!("session not found: {id}"),
                        ),
                    )
                    .await;
                }
                if self.current_session.as_deref() == Some(id.as_str()) {
                    self.current_session = None;
                }
                broadcast_session_list(&self.state).await;
                Ok(())
            }
            ControlAction::List => {
                let list = Frame::SessionList(self.state.manager.lock().await.list_sessions());
                send_frame(ws_tx, &list).await
            }
        }
    }

    /// Attach this connection to a session: swap any previous attachment,
    /// register the output subscription, and replay the scrollback as a
    /// single frame before any live output.
    async fn attach(&mut self, id: &str, ws_tx: &mut WsSink) -> Result<(), axum::Error> {
        let scrollback = {
            let mut manager = self.state.manager.lock().await;
            manager.detach_conn(self.id);
            self.current_session = None;

            let Some(session) = manager.get(id) else {
                drop(manager);
                return send_frame(
                    ws_tx,
                    &Frame::error(
                        ErrorCode::SessionNotFound,
                        format!("session not found: {id}"),
                    ),
                )
                .await;
            };
            let scrollback = session.scrollback_bytes();
            manager.attach_client(id, self.id, self.output_tx.clone());
            scrollback
        };

        self.current_session = Some(id.to_string());
        debug!(conn_id = self.id, session = id, replay = scrollback.len(), "attached");

        // The poll task only enqueues into `output_rx` after the attach
        // above, and this send happens before the loop next drains it, so
        // the replay precedes all live output.
        if !scrollback.is_empty() {
            send_frame(ws_tx, &Frame::TerminalData(scrollback)).await?;
        }
        Ok(())
    }

    async fn file_list(&mut self, path: &str, ws_tx: &mut WsSink) -> Result<(), axum::Error> {
        let Some(id) = self.current_session.clone() else {
            return send_frame(ws_tx, &Frame::error(ErrorCode::NoSession, "no attached session"))
                .await;
        };
        match self.state.files.list_files(&id, path).await {
            Ok(listing) => send_frame(ws_tx, &Frame::FileList(listing)).await,
            Err(e) => send_frame(ws_tx, &Frame::error(ErrorCode::FileError, e.to_string())).await,
        }
    }

    async fn file_read(&mut self, path: &str, ws_tx: &mut WsSink) -> Result<(), axum::Error> {
        let Some(id) = self.current_session.clone() else {
            return send_frame(ws_tx, &Frame::error(ErrorCode::NoSession, "no attached session"))
                .await;
        };
        match self.state.files.read_file(&id, path).await {
            Ok(content) => send_frame(ws_tx, &Frame::FileContent(content)).await,
            Err(e) => send_frame(ws_tx, &Frame::error(ErrorCode::FileError, e.to_string())).await,
        }
    }

    async fn file_write(
        &mut self,
        path: &str,
        content: &str,
        ws_tx: &mut WsSink,
    ) -> Result<(), axum::Error> {
        let Some(id) = self.current_session.clone() else {
            return send_frame(ws_tx, &Frame::error(ErrorCode::NoSession, "no attached session"))
                .await;
        };
        match self.state.files.write_file(&id, path, content).await {
            Ok(()) => Ok(()),
            Err(e) => send_frame(ws_tx, &Frame::error(ErrorCode::FileError, e.to_string())).await,
        }
    }
}

/// Push the current session list to every authenticated socket.
async fn broadcast_session_list(state: &BrokerState) {
    let list = Frame::SessionList(state.manager.lock().await.list_sessions());
    let _ = state.broadcasts.send(list.encode());
}

/// Single reader for every session's PTY master. Output goes to the
/// scrollback and, when attached, to the subscriber's queue; exits remove
/// the session.
async fn pty_poll_task(state: Arc<BrokerState>) {
    let mut poll = interval(state.cfg.poll_interval);
    let mut buf = [0u8; 4096];

    loop {
        poll.tick().await;

        let mut removed: VecDeque<String> = VecDeque::new();
        {
            let mut manager = state.manager.lock().await;
            for id in manager.ids() {
                let Some(session) = manager.get_mut(&id) else {
                    continue;
                };
                if !session.is_running() {
                    removed.push_back(id);
                    continue;
                }

                let fd = session.pty.master_fd();
                match nix::unistd::read(fd, &mut buf) {
                    Ok(n) if n > 0 => {
                        let data = &buf[..n];
                        session.record_output(data);
                        if let Some(sub) = &session.subscriber {
                            let frame = Frame::SessionOutput {
                                session_id: id.clone(),
                                data: data.to_vec(),
                            };
                            // Closed or non-open sockets drop writes; the
                            // session keeps running.
                            if sub.tx.send(frame.encode()).is_err() {
                                session.subscriber = None;
                            }
                        }
                        continue;
                    }
                    Ok(_) | Err(nix::Error::EAGAIN) | Err(nix::Error::EIO) => {}
                    Err(e) => {
                        warn!(%id, error = %e, "PTY read error");
                    }
                }

                if let Ok(Some(status)) = session.pty.try_wait() {
                    info!(%id, code = ?status.code, signal = ?status.signal, "session child exited");
                    session.mark_exited(status);
                    removed.push_back(id);
                }
            }

            for id in &removed {
                if let Some(mut session) = manager.remove(id) {
                    session.kill();
                }
            }
        }

        if !removed.is_empty() {
            broadcast_session_list(&state).await;
        }
    }
}

/// Periodic sweep of idle, unattached sessions.
async fn idle_reaper_task(state: Arc<BrokerState>) {
    let mut sweep = interval(state.cfg.reaper_interval);
    sweep.tick().await; // skip the immediate first tick

    loop {
        sweep.tick().await;
        let cleaned = state.manager.lock().await.cleanup_idle_sessions();
        if cleaned > 0 {
            info!(cleaned, "reaped idle sessions");
            broadcast_session_list(&state).await;
        }
    }
}
