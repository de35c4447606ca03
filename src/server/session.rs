//! A session: one supervised child process in a PTY, its scrollback, and
//! its activity clock.

use super::scrollback::Scrollback;
use crate::protocol::SessionInfo;
use crate::pty::{self, ExitStatus, PtyProcess, PtyError};
use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use std::os::fd::BorrowedFd;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

/// Default terminal width.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal height.
pub const DEFAULT_ROWS: u16 = 24;
/// Sessions with no activity for this long are eligible for reaping.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The attached client's output subscription: encoded frames pushed into the
/// connection's outbound queue.
pub struct Subscriber {
    pub conn_id: u64,
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Everything needed to construct a session.
pub struct SessionOptions {
    pub id: String,
    pub name: Option<String>,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub scrollback_max: usize,
    pub idle_timeout: Duration,
}

/// A live child process attached to a PTY, plus metadata and scrollback.
pub struct Session {
    pub id: String,
    pub name: String,
    pub cwd: PathBuf,
    pub pty: PtyProcess,
    pub cols: u16,
    pub rows: u16,
    /// Set once the child has been reaped.
    pub exit_status: Option<ExitStatus>,
    /// Bounded log of child output, replayed on attach.
    pub scrollback: Scrollback,
    /// The single attached client, if any.
    pub subscriber: Option<Subscriber>,
    created_at_ms: u64,
    last_activity: Instant,
    idle_timeout: Duration,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Session {
    /// Spawn the child and build the session record.
    pub fn spawn(opts: SessionOptions) -> Result<Self, PtyError> {
        let pty = pty::spawn(&opts.command, opts.cols, opts.rows, &opts.cwd)?;
        let name = opts
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("session-{}", opts.id));
        debug!(id = %opts.id, pid = %pty.pid, cwd = %opts.cwd.display(), "spawned session child");
        Ok(Self {
            id: opts.id,
            name,
            cwd: opts.cwd,
            pty,
            cols: opts.cols,
            rows: opts.rows,
            exit_status: None,
            scrollback: Scrollback::new(opts.scrollback_max),
            subscriber: None,
            created_at_ms: now_millis(),
            last_activity: Instant::now(),
            idle_timeout: opts.idle_timeout,
        })
    }

    /// Whether the child is still running.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.exit_status.is_none()
    }

    /// Child pid while running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.is_running().then(|| self.pty.pid.as_raw() as u32)
    }

    /// Forward input bytes to the child. No-op once exited.
    pub fn write(&mut self, data: &[u8]) {
        if !self.is_running() || data.is_empty() {
            return;
        }
        self.touch();

        let fd = self.pty.master_fd();
        // SAFETY: the fd is valid for the lifetime of the session
        #[allow(unsafe_code)]
        let borrowed_fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut written = 0;
        while written < data.len() {
            match nix::unistd::write(borrowed_fd, &data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(nix::Error::EAGAIN) => break,
                Err(e) => {
                    debug!(id = %self.id, error = %e, "PTY write failed");
                    break;
                }
            }
        }
    }

    /// Forward a window-size change. No-op once exited.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if !self.is_running() {
            return;
        }
        if self.pty.resize(cols, rows).is_ok() {
            self.cols = cols;
            self.rows = rows;
        }
    }

    /// Record output read from the child: scrollback + activity clock.
    pub fn record_output(&mut self, data: &[u8]) {
        self.scrollback.push(data);
        self.touch();
    }

    /// Concatenated scrollback bytes.
    #[must_use]
    pub fn scrollback_bytes(&self) -> Vec<u8> {
        self.scrollback.get_all()
    }

    /// Bump the activity clock.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Whether the session has been inactive past its idle timeout.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.last_activity.elapsed() > self.idle_timeout
    }

    /// Record the reaped exit status.
    pub fn mark_exited(&mut self, status: ExitStatus) {
        self.exit_status = Some(status);
    }

    /// Terminate the child if running, clear the scrollback, and drop the
    /// subscription. The zombie is reaped off-thread.
    pub fn kill(&mut self) {
        self.subscriber = None;
        self.scrollback.clear();

        if self.is_running() {
            if let Err(e) = self.pty.signal(Signal::SIGKILL) {
                debug!(id = %self.id, error = %e, "failed to signal child");
            }
            let pid = self.pty.pid;
            std::thread::spawn(move || {
                waitpid(pid, None).ok();
            });
            self.exit_status = Some(ExitStatus {
                code: None,
                signal: Some(libc::SIGKILL),
            });
        }
    }

    /// Snapshot for `SESSION_LIST`.
    #[must_use]
    pub fn to_info(&self) -> SessionInfo {
        let elapsed_ms = self.last_activity.elapsed().as_millis() as u64;
        SessionInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            cwd: self.cwd.to_string_lossy().into_owned(),
            created_at: self.created_at_ms,
            last_activity: now_millis().saturating_sub(elapsed_ms),
            connected: self.subscriber.is_some(),
            pid: self.pid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_session(idle_timeout: Duration) -> Session {
        Session::spawn(SessionOptions {
            id: "ab12cd34".into(),
            name: None,
            command: vec!["sh".into()],
            cwd: PathBuf::from("/tmp"),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            scrollback_max: 64 * 1024,
            idle_timeout,
        })
        .expect("spawn")
    }

    #[test]
    fn test_default_name_derived_from_id() {
        let mut session = shell_session(DEFAULT_IDLE_TIMEOUT);
        assert_eq!(session.name, "session-ab12cd34");
        assert!(session.is_running());
        assert!(session.pid().is_some());
        session.kill();
    }

    #[test]
    fn test_record_output_feeds_scrollback() {
        let mut session = shell_session(DEFAULT_IDLE_TIMEOUT);
        session.record_output(b"hello\n");
        session.record_output(b"world\n");
        assert_eq!(session.scrollback_bytes(), b"hello\nworld\n");
        session.kill();
        assert_eq!(session.scrollback_bytes(), b"");
    }

    #[test]
    fn test_idle_clock() {
        let mut session = shell_session(Duration::from_millis(20));
        assert!(!session.is_idle());
        std::thread::sleep(Duration::from_millis(40));
        assert!(session.is_idle());
        session.touch();
        assert!(!session.is_idle());
        session.kill();
    }

    #[test]
    fn test_kill_is_terminal() {
        let mut session = shell_session(DEFAULT_IDLE_TIMEOUT);
        session.kill();
        assert!(!session.is_running());
        assert!(session.pid().is_none());
        let info = session.to_info();
        assert_eq!(info.pid, None);
        assert!(!info.connected);
        // Idempotent.
        session.kill();
    }

    #[test]
    fn test_info_snapshot_shape() {
        let mut session = shell_session(DEFAULT_IDLE_TIMEOUT);
        let info = session.to_info();
        assert_eq!(info.id, "ab12cd34");
        assert_eq!(info.cwd, "/tmp");
        assert!(info.created_at > 0);
        assert!(info.last_activity >= info.created_at);
        session.kill();
    }
}
