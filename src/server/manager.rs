//! Session registry.
//!
//! Owns every live session and enforces the single-attacher invariant: a
//! session carries at most one output subscription, belonging to the
//! attached connection or to no one.

use super::session::{Session, SessionOptions, Subscriber};
use crate::protocol::SessionInfo;
use crate::pty::PtyError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("failed to create session directory: {0}")]
    Sandbox(#[source] std::io::Error),

    #[error("failed to spawn session child: {0}")]
    Spawn(#[source] PtyError),
}

/// Tunables shared by every session the manager creates.
pub struct ManagerConfig {
    /// Child program + arguments spawned per session.
    pub command: Vec<String>,
    /// Base directory holding per-session sandboxes.
    pub sessions_dir: PathBuf,
    pub scrollback_max: usize,
    pub idle_timeout: Duration,
}

/// Options for one `create` request.
#[derive(Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub cwd: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Registry of all live sessions.
pub struct SessionManager {
    config: ManagerConfig,
    sessions: HashMap<String, Session>,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
        }
    }

    /// Generate a fresh 8-character lowercase-hex id not currently in use.
    fn generate_id(&self) -> String {
        loop {
            let id = hex::encode(rand::random::<[u8; 4]>());
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Sandbox directory of a session id.
    #[must_use]
    pub fn sandbox_dir(&self, id: &str) -> PathBuf {
        self.config.sessions_dir.join(id)
    }

    /// Create a session: fresh id, sandbox directory, spawned child. The new
    /// session starts detached.
    pub fn create_session(&mut self, opts: CreateOptions) -> Result<&Session, ManagerError> {
        let id = self.generate_id();

        let sandbox = self.sandbox_dir(&id);
        std::fs::create_dir_all(&sandbox).map_err(ManagerError::Sandbox)?;
        let cwd = opts.cwd.unwrap_or_else(|| sandbox.clone());

        let session = Session::spawn(SessionOptions {
            id: id.clone(),
            name: opts.name,
            command: self.config.command.clone(),
            cwd,
            cols: opts.cols.unwrap_or(super::session::DEFAULT_COLS),
            rows: opts.rows.unwrap_or(super::session::DEFAULT_ROWS),
            scrollback_max: self.config.scrollback_max,
            idle_timeout: self.config.idle_timeout,
        })
        .map_err(ManagerError::Spawn)?;

        info!(%id, name = %session.name, "created session");
        self.sessions.insert(id.clone(), session);
        Ok(&self.sessions[&id])
    }

    /// Bind a connection's output queue to a session, replacing any previous
    /// subscription. Returns false iff the id is unknown.
    pub fn attach_client(
        &mut self,
        id: &str,
        conn_id: u64,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        if let Some(old) = session.subscriber.take() {
            warn!(%id, old_conn = old.conn_id, new_conn = conn_id, "replacing attached client");
        }
        session.subscriber = Some(Subscriber { conn_id, tx });
        true
    }

    /// Remove a session's subscription. Idempotent.
    pub fn detach_client(&mut self, id: &str) {
        if let Some(session) = self.sessions.get_mut(id) {
            session.subscriber = None;
        }
    }

    /// Remove whatever subscription a connection holds. Returns the session
    /// id it was attached to, if any.
    pub fn detach_conn(&mut self, conn_id: u64) -> Option<String> {
        for session in self.sessions.values_mut() {
            if session
                .subscriber
                .as_ref()
                .is_some_and(|sub| sub.conn_id == conn_id)
            {
                session.subscriber = None;
                return Some(session.id.clone());
            }
        }
        None
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Session currently attached to a connection.
    pub fn session_for_conn(&mut self, conn_id: u64) -> Option<&mut Session> {
        self.sessions.values_mut().find(|session| {
            session
                .subscriber
                .as_ref()
                .is_some_and(|sub| sub.conn_id == conn_id)
        })
    }

    /// Snapshot of every session with its instantaneous attachment flag.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut list: Vec<SessionInfo> = self.sessions.values().map(Session::to_info).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        list
    }

    /// Iterate session ids (for the poll loop).
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Kill and remove a session. Returns false iff the id is unknown.
    pub fn destroy_session(&mut self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some(mut session) => {
                session.kill();
                info!(%id, "destroyed session");
                true
            }
            None => false,
        }
    }

    /// Remove a session that already exited (child reaped by the poll loop).
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    /// Kill and remove every detached session that has been idle past its
    /// timeout. Returns the number cleaned up.
    pub fn cleanup_idle_sessions(&mut self) -> usize {
        let idle_ids: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.subscriber.is_none() && session.is_idle())
            .map(|session| session.id.clone())
            .collect();

        for id in &idle_ids {
            if let Some(mut session) = self.sessions.remove(id) {
                session.kill();
                info!(%id, "reaped idle session");
            }
        }
        idle_ids.len()
    }

    /// Kill every session (server shutdown).
    pub fn destroy_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.kill();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(idle_timeout: Duration) -> (tempfile::TempDir, SessionManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(ManagerConfig {
            command: vec!["sh".into()],
            sessions_dir: dir.path().join("sessions"),
            scrollback_max: 64 * 1024,
            idle_timeout,
        });
        (dir, manager)
    }

    #[test]
    fn test_create_assigns_hex_id_and_sandbox() {
        let (_dir, mut manager) = test_manager(Duration::from_secs(60));
        let id = manager
            .create_session(CreateOptions::default())
            .unwrap()
            .id
            .clone();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert!(manager.sandbox_dir(&id).is_dir());
        // Default cwd is the sandbox.
        assert_eq!(manager.get(&id).unwrap().cwd, manager.sandbox_dir(&id));
        manager.destroy_all();
    }

    #[test]
    fn test_single_attacher_swap() {
        let (_dir, mut manager) = test_manager(Duration::from_secs(60));
        let id = manager
            .create_session(CreateOptions::default())
            .unwrap()
            .id
            .clone();

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(manager.attach_client(&id, 1, tx1));
        assert!(manager.attach_client(&id, 2, tx2));

        let session = manager.get(&id).unwrap();
        assert_eq!(session.subscriber.as_ref().unwrap().conn_id, 2);
        assert!(manager.list_sessions()[0].connected);

        assert!(!manager.attach_client("zzzzzzzz", 3, mpsc::unbounded_channel().0));
        manager.destroy_all();
    }

    #[test]
    fn test_detach_is_idempotent() {
        let (_dir, mut manager) = test_manager(Duration::from_secs(60));
        let id = manager
            .create_session(CreateOptions::default())
            .unwrap()
            .id
            .clone();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.attach_client(&id, 7, tx);

        assert_eq!(manager.detach_conn(7).as_deref(), Some(id.as_str()));
        assert_eq!(manager.detach_conn(7), None);
        manager.detach_client(&id);
        assert!(!manager.list_sessions()[0].connected);
        manager.destroy_all();
    }

    #[test]
    fn test_destroy_session() {
        let (_dir, mut manager) = test_manager(Duration::from_secs(60));
        let id = manager
            .create_session(CreateOptions::default())
            .unwrap()
            .id
            .clone();
        assert!(manager.destroy_session(&id));
        assert!(!manager.destroy_session(&id));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_cleanup_skips_attached_sessions() {
        let (_dir, mut manager) = test_manager(Duration::from_millis(10));
        let attached = manager
            .create_session(CreateOptions::default())
            .unwrap()
            .id
            .clone();
        let idle = manager
            .create_session(CreateOptions::default())
            .unwrap()
            .id
            .clone();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.attach_client(&attached, 1, tx);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(manager.cleanup_idle_sessions(), 1);
        assert!(manager.get(&attached).is_some());
        assert!(manager.get(&idle).is_none());
        manager.destroy_all();
    }

    #[test]
    fn test_list_snapshot_is_sorted_and_complete() {
        let (_dir, mut manager) = test_manager(Duration::from_secs(60));
        for _ in 0..3 {
            manager.create_session(CreateOptions::default()).unwrap();
        }
        let list = manager.list_sessions();
        assert_eq!(list.len(), 3);
        assert!(list.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        manager.destroy_all();
        assert!(manager.is_empty());
    }
}
