//! Raw relay: bridge the local terminal to an attached session.
//!
//! Puts stdin into raw mode, pipes keystrokes to the session and session
//! output to stdout, and forwards window-size changes. A tmux-style prefix
//! key (Ctrl+B) opens a two-second command window for session control.

#![allow(unsafe_code)] // terminal manipulation requires ioctls

use crate::client::{ClientConnection, ClientEvent};
use crate::protocol::{ErrorCode, SessionInfo};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Prefix key: Ctrl+B.
pub const PREFIX_KEY: u8 = 0x02;
/// How long the prefix window stays open.
pub const PREFIX_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("stdin is not a terminal")]
    NotATty,

    #[error("failed to get terminal attributes: {0}")]
    GetTermios(#[source] nix::Error),

    #[error("failed to set terminal attributes: {0}")]
    SetTermios(#[source] nix::Error),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Why the relay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// User detached; the session keeps running.
    Detached,
    /// The attached session is gone (child exited or destroyed).
    SessionEnded,
    /// Reconnect attempts were exhausted.
    ConnectionLost,
}

/// Relay settings.
pub struct RelayConfig {
    pub prefix_key: u8,
    pub prefix_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            prefix_key: PREFIX_KEY,
            prefix_timeout: PREFIX_TIMEOUT,
        }
    }
}

/// Saved terminal state for restoration.
struct RawModeGuard {
    original_termios: nix::sys::termios::Termios,
    stdin_fd: OwnedFd,
}

impl RawModeGuard {
    /// Save current terminal state and switch to raw mode.
    fn enter() -> Result<Self, RelayError> {
        use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg};

        let stdin = std::io::stdin();
        let stdin_borrowed = stdin.as_fd();

        if !nix::unistd::isatty(stdin_borrowed.as_raw_fd()).unwrap_or(false) {
            return Err(RelayError::NotATty);
        }

        let original_termios =
            termios::tcgetattr(stdin_borrowed).map_err(RelayError::GetTermios)?;

        let mut raw = original_termios.clone();

        // Input flags: disable special handling
        raw.input_flags.remove(InputFlags::IGNBRK);
        raw.input_flags.remove(InputFlags::BRKINT);
        raw.input_flags.remove(InputFlags::PARMRK);
        raw.input_flags.remove(InputFlags::ISTRIP);
        raw.input_flags.remove(InputFlags::INLCR);
        raw.input_flags.remove(InputFlags::IGNCR);
        raw.input_flags.remove(InputFlags::ICRNL);
        raw.input_flags.remove(InputFlags::IXON);

        // Output flags: disable post-processing
        raw.output_flags.remove(OutputFlags::OPOST);

        // Local flags: disable echo, canonical mode, signals
        raw.local_flags.remove(LocalFlags::ECHO);
        raw.local_flags.remove(LocalFlags::ECHONL);
        raw.local_flags.remove(LocalFlags::ICANON);
        raw.local_flags.remove(LocalFlags::ISIG);
        raw.local_flags.remove(LocalFlags::IEXTEN);

        // Control chars: read returns after 1 byte, no timeout
        raw.control_chars[nix::sys::termios::SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[nix::sys::termios::SpecialCharacterIndices::VTIME as usize] = 0;

        termios::tcsetattr(stdin_borrowed, SetArg::TCSAFLUSH, &raw)
            .map_err(RelayError::SetTermios)?;

        let stdin_fd = stdin_borrowed
            .try_clone_to_owned()
            .map_err(RelayError::Io)?;

        Ok(Self {
            original_termios,
            stdin_fd,
        })
    }

    fn restore(&self) -> Result<(), RelayError> {
        use nix::sys::termios::{self, SetArg};
        termios::tcsetattr(&self.stdin_fd, SetArg::TCSAFLUSH, &self.original_termios)
            .map_err(RelayError::SetTermios)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            eprintln!("warning: failed to restore terminal: {e}");
        }
    }
}

/// Current terminal size from stdout, if available.
fn terminal_size() -> Option<(u16, u16)> {
    use std::os::unix::io::AsRawFd;

    let fd = std::io::stdout().as_raw_fd();
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if result == 0 && ws.ws_row > 0 && ws.ws_col > 0 {
        Some((ws.ws_col, ws.ws_row))
    } else {
        None
    }
}

/// What a byte does while the prefix window is open.
enum PrefixCommand {
    CreateSession,
    NextSession,
    PrevSession,
    ListSessions,
    Detach,
    Help,
    SwitchTo(usize),
    /// Double prefix forwards one literal prefix byte.
    Literal(u8),
    Ignore,
}

fn prefix_command(byte: u8, prefix_key: u8) -> PrefixCommand {
    match byte {
        b'c' => PrefixCommand::CreateSession,
        b'n' => PrefixCommand::NextSession,
        b'p' => PrefixCommand::PrevSession,
        b'l' => PrefixCommand::ListSessions,
        b'd' => PrefixCommand::Detach,
        b'?' => PrefixCommand::Help,
        b'0'..=b'9' => PrefixCommand::SwitchTo((byte - b'0') as usize),
        other if other == prefix_key => PrefixCommand::Literal(prefix_key),
        _ => PrefixCommand::Ignore,
    }
}

const HELP_TEXT: &str = "\r\n\
    [ccr] prefix commands:\r\n\
    \x20 c  create session     n/p  next/prev session\r\n\
    \x20 l  list sessions      0-9  switch by index\r\n\
    \x20 d  detach             ?    this help\r\n";

/// Run the relay against an already-connected client that is attached (or
/// attaching) to `session_id`. Returns when the user detaches, the session
/// ends, or the connection is lost for good.
pub async fn run_relay(
    client: &ClientConnection,
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
    session_id: String,
    config: RelayConfig,
) -> Result<RelayOutcome, RelayError> {
    let _guard = RawModeGuard::enter()?;

    if let Some((cols, rows)) = terminal_size() {
        client.resize(cols, rows);
    }

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut sigwinch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
            .map_err(RelayError::Io)?;

    let mut current = session_id;
    let mut sessions: Vec<SessionInfo> = Vec::new();
    let mut prefix_deadline: Option<Instant> = None;
    let mut input_buf = [0u8; 1024];

    loop {
        tokio::select! {
            // Local keystrokes, with the prefix layer applied positionally.
            result = stdin.read(&mut input_buf) => {
                let n = result.map_err(RelayError::Io)?;
                if n == 0 {
                    // EOF on stdin behaves like detach.
                    client.detach();
                    return Ok(RelayOutcome::Detached);
                }

                let mut pending: Vec<u8> = Vec::with_capacity(n);
                for &byte in &input_buf[..n] {
                    if prefix_deadline.take().is_some() {
                        match prefix_command(byte, config.prefix_key) {
                            PrefixCommand::CreateSession => client.create_session(None, None),
                            PrefixCommand::NextSession => {
                                switch_relative(client, &sessions, &current, 1);
                            }
                            PrefixCommand::PrevSession => {
                                switch_relative(client, &sessions, &current, -1);
                            }
                            PrefixCommand::ListSessions => {
                                print_session_list(&mut stdout, &sessions, &current)
                                    .await
                                    .map_err(RelayError::Io)?;
                                client.request_sessions();
                            }
                            PrefixCommand::Detach => {
                                flush_input(client, &mut pending);
                                client.detach();
                                return Ok(RelayOutcome::Detached);
                            }
                            PrefixCommand::Help => {
                                stdout
                                    .write_all(HELP_TEXT.as_bytes())
                                    .await
                                    .map_err(RelayError::Io)?;
                                stdout.flush().await.map_err(RelayError::Io)?;
                            }
                            PrefixCommand::SwitchTo(index) => {
                                if let Some(info) = sessions.get(index) {
                                    client.attach(info.id.clone());
                                }
                            }
                            PrefixCommand::Literal(byte) => pending.push(byte),
                            PrefixCommand::Ignore => {}
                        }
                    } else if byte == config.prefix_key {
                        // Bytes before the prefix flush as data first.
                        flush_input(client, &mut pending);
                        prefix_deadline = Some(Instant::now() + config.prefix_timeout);
                    } else {
                        pending.push(byte);
                    }
                }
                flush_input(client, &mut pending);
            }

            // The open prefix window expires; input resumes as data.
            () = async {
                match prefix_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => {
                debug!("prefix window timed out");
                prefix_deadline = None;
            }

            // Server-side events.
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(RelayOutcome::ConnectionLost);
                };
                match event {
                    ClientEvent::Data(data) => {
                        stdout.write_all(&data).await.map_err(RelayError::Io)?;
                        stdout.flush().await.map_err(RelayError::Io)?;
                    }
                    ClientEvent::SessionOutput { session_id, data } => {
                        current = session_id;
                        stdout.write_all(&data).await.map_err(RelayError::Io)?;
                        stdout.flush().await.map_err(RelayError::Io)?;
                    }
                    ClientEvent::Sessions(list) => {
                        let gone = !list.iter().any(|info| info.id == current);
                        sessions = list;
                        if gone {
                            return Ok(RelayOutcome::SessionEnded);
                        }
                    }
                    ClientEvent::ServerError(error) => {
                        if matches!(error.code, ErrorCode::SessionNotFound | ErrorCode::NoSession) {
                            return Ok(RelayOutcome::SessionEnded);
                        }
                        stdout
                            .write_all(format!("\r\n[ccr] {}: {}\r\n", error_label(error.code), error.message).as_bytes())
                            .await
                            .map_err(RelayError::Io)?;
                    }
                    ClientEvent::Reconnecting { attempt, delay } => {
                        stdout
                            .write_all(
                                format!(
                                    "\r\n[ccr] reconnecting (attempt {attempt}, in {:.1}s)...\r\n",
                                    delay.as_secs_f32()
                                )
                                .as_bytes(),
                            )
                            .await
                            .map_err(RelayError::Io)?;
                    }
                    ClientEvent::ReconnectFailed => {
                        return Ok(RelayOutcome::ConnectionLost);
                    }
                    ClientEvent::Disconnected => {
                        return Ok(RelayOutcome::ConnectionLost);
                    }
                    ClientEvent::Authenticated
                    | ClientEvent::Connected
                    | ClientEvent::Pong { .. }
                    | ClientEvent::FileList(_)
                    | ClientEvent::FileContent(_)
                    | ClientEvent::Error(_) => {}
                }
            }

            // Forward window-size changes.
            _ = sigwinch.recv() => {
                if let Some((cols, rows)) = terminal_size() {
                    client.resize(cols, rows);
                }
            }
        }
    }
}

fn flush_input(client: &ClientConnection, pending: &mut Vec<u8>) {
    if !pending.is_empty() {
        client.send_input(std::mem::take(pending));
    }
}

/// Attach to the neighbor of the current session in list order.
fn switch_relative(
    client: &ClientConnection,
    sessions: &[SessionInfo],
    current: &str,
    step: isize,
) {
    if sessions.is_empty() {
        return;
    }
    let here = sessions
        .iter()
        .position(|info| info.id == current)
        .unwrap_or(0) as isize;
    let len = sessions.len() as isize;
    let next = (here + step).rem_euclid(len) as usize;
    if sessions[next].id != current {
        client.attach(sessions[next].id.clone());
    }
}

async fn print_session_list(
    stdout: &mut tokio::io::Stdout,
    sessions: &[SessionInfo],
    current: &str,
) -> Result<(), std::io::Error> {
    let mut out = String::from("\r\n[ccr] sessions:\r\n");
    if sessions.is_empty() {
        out.push_str("  (none known yet)\r\n");
    }
    for (index, info) in sessions.iter().enumerate() {
        let marker = if info.id == current { "*" } else { " " };
        out.push_str(&format!(
            " {marker}{index}: {} [{}]{}\r\n",
            info.name,
            info.id,
            if info.connected { " (attached)" } else { "" }
        ));
    }
    stdout.write_all(out.as_bytes()).await?;
    stdout.flush().await
}

fn error_label(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::AuthTimeout => "auth timeout",
        ErrorCode::AuthFailed => "auth failed",
        ErrorCode::AuthRequired => "auth required",
        ErrorCode::NoSession => "no session",
        ErrorCode::MissingSessionId => "missing session id",
        ErrorCode::SessionNotFound => "session not found",
        ErrorCode::FileError => "file error",
        ErrorCode::RateLimited => "rate limited",
        ErrorCode::ParseError => "protocol error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_commands() {
        assert!(matches!(
            prefix_command(b'c', PREFIX_KEY),
            PrefixCommand::CreateSession
        ));
        assert!(matches!(prefix_command(b'd', PREFIX_KEY), PrefixCommand::Detach));
        assert!(matches!(
            prefix_command(b'7', PREFIX_KEY),
            PrefixCommand::SwitchTo(7)
        ));
        assert!(matches!(
            prefix_command(PREFIX_KEY, PREFIX_KEY),
            PrefixCommand::Literal(PREFIX_KEY)
        ));
        assert!(matches!(prefix_command(b'x', PREFIX_KEY), PrefixCommand::Ignore));
    }
}
