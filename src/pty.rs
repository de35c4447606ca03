//! PTY creation and child supervision.
//!
//! Spawns the session child inside a pseudo-terminal and exposes the master
//! side for reads, writes, resize, and signalling.
//!
//! # Safety
//!
//! This module uses unsafe code for PTY operations (fork, ioctl, dup2).
//! These are fundamental operations that cannot be done safely.

#![allow(unsafe_code)]

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execvp, fork, setsid, ForkResult, Pid};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during PTY operations.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to create session: {0}")]
    Setsid(#[source] nix::Error),

    #[error("failed to set controlling terminal: {0}")]
    SetControllingTerminal(#[source] nix::Error),

    #[error("failed to exec: {0}")]
    Exec(#[source] nix::Error),

    #[error("program not found: {0}")]
    ProgramNotFound(String),

    #[error("invalid command string: {0}")]
    InvalidCommand(#[source] std::ffi::NulError),

    #[error("failed to send signal: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to wait: {0}")]
    Wait(#[source] nix::Error),
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code when the child returned normally.
    pub code: Option<i32>,
    /// Terminating signal number when it was killed.
    pub signal: Option<i32>,
}

/// A child process running inside a PTY.
pub struct PtyProcess {
    /// The master side of the PTY.
    pub master: OwnedFd,
    /// The child process ID.
    pub pid: Pid,
}

impl PtyProcess {
    /// Raw file descriptor of the master side.
    #[must_use]
    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Send a signal to the child.
    pub fn signal(&self, sig: Signal) -> Result<(), PtyError> {
        signal::kill(self.pid, sig).map_err(PtyError::Signal)
    }

    /// Check whether the child has exited without blocking.
    pub fn try_wait(&self) -> Result<Option<ExitStatus>, PtyError> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).map_err(PtyError::Wait)? {
            WaitStatus::Exited(_, code) => Ok(Some(ExitStatus {
                code: Some(code),
                signal: None,
            })),
            WaitStatus::Signaled(_, sig, _) => Ok(Some(ExitStatus {
                code: None,
                signal: Some(sig as i32),
            })),
            // StillAlive, Stopped, Continued: not exited yet
            _ => Ok(None),
        }
    }

    /// Push a new window size to the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // TIOCSWINSZ ioctl
        unsafe {
            let ret = libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &winsize);
            if ret < 0 {
                return Err(PtyError::SetControllingTerminal(nix::Error::last()));
            }
        }
        Ok(())
    }
}

/// Resolve a program name to an executable path: platform candidate
/// directories first, then the `PATH` environment.
pub fn resolve_program(name: &str) -> Result<PathBuf, PtyError> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(PtyError::ProgramNotFound(name.to_string()));
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".local/bin").join(name));
        candidates.push(home.join(format!(".{name}/local/{name}")));
    }
    candidates.push(PathBuf::from("/usr/local/bin").join(name));
    #[cfg(target_os = "macos")]
    candidates.push(PathBuf::from("/opt/homebrew/bin").join(name));

    for candidate in candidates {
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(PtyError::ProgramNotFound(name.to_string()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Spawn `cmd` in a new PTY with the given terminal size and working
/// directory. The child gets `TERM=xterm-256color` and
/// `COLORTERM=truecolor` on top of the inherited environment.
///
/// Returns a [`PtyProcess`] holding the master FD and child PID; the master
/// is left in non-blocking mode for the server's poll loop.
pub fn spawn(cmd: &[String], cols: u16, rows: u16, cwd: &Path) -> Result<PtyProcess, PtyError> {
    let program = cmd
        .first()
        .ok_or_else(|| PtyError::ProgramNotFound(String::new()))
        .and_then(|name| resolve_program(name))?;

    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let OpenptyResult { master, slave } = openpty(&winsize, None).map_err(PtyError::OpenPty)?;

    match unsafe { fork() }.map_err(PtyError::Fork)? {
        ForkResult::Parent { child } => {
            // Parent: close slave, keep master
            drop(slave);

            // Non-blocking master for the poll loop
            let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL).map_err(PtyError::OpenPty)?;
            let mut flags = OFlag::from_bits_retain(flags);
            flags.insert(OFlag::O_NONBLOCK);
            fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(PtyError::OpenPty)?;

            Ok(PtyProcess { master, pid: child })
        }
        ForkResult::Child => {
            // Child: set up the terminal and exec

            drop(master);

            setsid().map_err(PtyError::Setsid)?;

            // Make the slave the controlling terminal
            unsafe {
                let ret = libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY, 0);
                if ret < 0 {
                    std::process::exit(1);
                }
            }

            // Redirect stdio to the slave
            let slave_fd = slave.as_raw_fd();
            unsafe {
                if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0 {
                    std::process::exit(1);
                }
                if libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0 {
                    std::process::exit(1);
                }
                if libc::dup2(slave_fd, libc::STDERR_FILENO) < 0 {
                    std::process::exit(1);
                }
            }
            if slave_fd > 2 {
                drop(slave);
            }

            if chdir(cwd).is_err() {
                std::process::exit(1);
            }

            // SAFETY: forked child before exec, no other threads here.
            unsafe {
                std::env::set_var("TERM", "xterm-256color");
                std::env::set_var("COLORTERM", "truecolor");
            }

            let prog = CString::new(program.as_os_str().as_encoded_bytes())
                .map_err(PtyError::InvalidCommand)?;
            let args: Vec<CString> = cmd
                .iter()
                .map(|s| CString::new(s.as_str()))
                .collect::<Result<_, _>>()
                .map_err(PtyError::InvalidCommand)?;

            execvp(&prog, &args).map_err(PtyError::Exec)?;

            // execvp only returns on error
            unreachable!()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wait_blocking(pty: &PtyProcess) -> ExitStatus {
        loop {
            if let Some(status) = pty.try_wait().unwrap() {
                return status;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_spawn_echo() {
        let pty = spawn(
            &["sh".into(), "-c".into(), "echo hello".into()],
            80,
            24,
            Path::new("/tmp"),
        )
        .unwrap();
        let status = wait_blocking(&pty);
        assert_eq!(status.code, Some(0));
        assert_eq!(status.signal, None);
    }

    #[test]
    fn test_spawn_exit_code() {
        let pty = spawn(
            &["sh".into(), "-c".into(), "exit 42".into()],
            80,
            24,
            Path::new("/tmp"),
        )
        .unwrap();
        assert_eq!(wait_blocking(&pty).code, Some(42));
    }

    #[test]
    fn test_spawn_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        let pty = spawn(
            &["sh".into(), "-c".into(), "pwd > out.txt".into()],
            80,
            24,
            &canonical,
        )
        .unwrap();
        wait_blocking(&pty);
        let out = std::fs::read_to_string(canonical.join("out.txt")).unwrap();
        assert_eq!(out.trim(), canonical.to_string_lossy());
    }

    #[test]
    fn test_spawn_unknown_program() {
        let result = spawn(
            &["definitely-not-a-real-binary-42".into()],
            80,
            24,
            Path::new("/tmp"),
        );
        assert!(matches!(result, Err(PtyError::ProgramNotFound(_))));
    }

    #[test]
    fn test_signal_terminates() {
        let pty = spawn(&["sleep".into(), "30".into()], 80, 24, Path::new("/tmp")).unwrap();
        assert!(pty.try_wait().unwrap().is_none());
        pty.signal(Signal::SIGKILL).unwrap();
        let status = wait_blocking(&pty);
        assert_eq!(status.signal, Some(libc::SIGKILL));
    }

    #[test]
    fn test_resolve_program_from_path() {
        let resolved = resolve_program("sh").unwrap();
        assert!(resolved.is_absolute());
        assert!(is_executable(&resolved));
    }
}
