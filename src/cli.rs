//! Command-line interface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Remote-access broker for interactive CLI assistants.
#[derive(Debug, Parser)]
#[command(name = "ccr", version, about)]
pub struct Cli {
    /// State directory (config, token, session sandboxes).
    #[arg(long, env = "CCR_HOME", global = true)]
    pub home: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Connection flags shared by the client subcommands.
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Server URL (default: ws://127.0.0.1:<config port>).
    #[arg(long)]
    pub url: Option<String>,

    /// Bearer token (default: the persisted token, minted if missing).
    #[arg(long, env = "CCR_TOKEN")]
    pub token: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker server.
    Serve {
        /// Listen port (overrides the config).
        #[arg(long)]
        port: Option<u16>,

        /// Bind host (overrides the config).
        #[arg(long)]
        host: Option<String>,

        /// Directory of browser UI assets served at `/`.
        #[arg(long)]
        static_dir: Option<PathBuf>,

        /// Child program spawned per session (overrides the config).
        #[arg(long)]
        command: Option<String>,
    },

    /// Print a fresh access token (also persisted to the token file).
    Token,

    /// Attach the local terminal to a session; creates one when no id is
    /// given. Ctrl+B opens the command layer (`Ctrl+B ?` for help).
    Attach {
        /// Session id to attach to.
        session: Option<String>,

        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// List sessions.
    List {
        /// JSON output for piping to jq.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Create a detached session and print its id.
    Create {
        /// Human-readable session name.
        #[arg(long)]
        name: Option<String>,

        /// Working directory for the child (default: the session sandbox).
        #[arg(long)]
        cwd: Option<String>,

        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Destroy a session.
    Destroy {
        /// Session id.
        id: String,

        #[command(flatten)]
        connect: ConnectArgs,
    },

    /// Query the server health endpoint.
    Status {
        /// Base URL (default: http://127.0.0.1:<config port>).
        #[arg(long)]
        url: Option<String>,
    },
}
