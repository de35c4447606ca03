//! ccr — remote-access broker for interactive CLI assistants.
//!
//! A long-running server owns a pool of PTY child processes (sessions) and
//! multiplexes them to remote clients over an authenticated, binary,
//! message-framed WebSocket channel. Detached sessions keep running and
//! buffer output; reattaching replays the missed scrollback.

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod protocol;
pub mod pty;
pub mod relay;
pub mod server;

pub use cli::{Cli, Command};
pub use client::{ClientConnection, ClientError, ClientEvent, ClientOptions};
pub use config::{Config, ConfigError};
pub use protocol::{Frame, MessageKind, ProtocolError};
pub use relay::{run_relay, RelayConfig, RelayOutcome};
pub use server::{Broker, BrokerConfig, ServerError};
