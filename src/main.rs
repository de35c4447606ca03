//! ccr — remote-access broker for interactive CLI assistants.

use ccr::client::{ClientConnection, ClientEvent, ClientOptions};
use ccr::protocol::SessionInfo;
use ccr::relay::{run_relay, RelayConfig, RelayOutcome};
use ccr::server::{Broker, BrokerConfig};
use ccr::{auth, config, Cli, Command, Config};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// How long one-shot commands wait for the server to answer.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("ccr=debug")
    } else {
        EnvFilter::new("ccr=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let home = match cli.home.map_or_else(config::default_home, Ok) {
        Ok(home) => home,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Serve {
            port,
            host,
            static_dir,
            command,
        } => run_serve(&home, port, host, static_dir, command).await,
        Command::Token => run_token(&home),
        Command::Attach { session, connect } => run_attach(&home, session, connect).await,
        Command::List { json, connect } => run_list(&home, json, connect).await,
        Command::Create { name, cwd, connect } => run_create(&home, name, cwd, connect).await,
        Command::Destroy { id, connect } => run_destroy(&home, id, connect).await,
        Command::Status { url } => run_status(&home, url).await,
    };

    if let Err(e) = result {
        error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run_serve(
    home: &Path,
    port: Option<u16>,
    host: Option<String>,
    static_dir: Option<PathBuf>,
    command: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load_or_create(home)?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(command) = command {
        config.command = Some(command);
    }

    // Certificates dropped into <home>/certs enable TLS without config
    // edits; generation is left to external tooling.
    if config.tls.is_none() {
        let cert = home.join("certs/server.crt");
        let key = home.join("certs/server.key");
        if cert.is_file() && key.is_file() {
            config.tls = Some(ccr::config::TlsConfig { cert, key });
        }
    }

    // Keep a current token on disk so local clients can pick it up.
    let token = auth::create_access_token(&config)?;
    config::save_token(home, &token)?;
    config::write_pid(home)?;

    let mut broker_cfg = BrokerConfig::new(config, config::sessions_dir(home));
    broker_cfg.static_dir = static_dir;
    let broker = Broker::new(broker_cfg);

    println!("access token: {token}");

    let signal_broker = broker.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_broker.shutdown().await;
    });

    let result = broker.run().await;
    config::remove_pid(home);
    result?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn run_token(home: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_or_create(home)?;
    let token = auth::create_access_token(&config)?;
    config::save_token(home, &token)?;
    println!("{token}");
    Ok(())
}

/// Map a bind host to something a local client can dial.
fn client_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    }
}

fn client_options(
    home: &Path,
    connect: ccr::cli::ConnectArgs,
    auto_reconnect: bool,
) -> Result<ClientOptions, Box<dyn std::error::Error>> {
    let config = Config::load_or_create(home)?;
    let url = connect.url.unwrap_or_else(|| {
        format!("ws://{}:{}", client_host(&config.host), config.port)
    });
    let token = match connect.token {
        Some(token) => token,
        None => match config::load_token(home) {
            Some(token) => token,
            None => {
                let token = auth::create_access_token(&config)?;
                config::save_token(home, &token)?;
                token
            }
        },
    };
    let mut opts = ClientOptions::new(url, token);
    opts.auto_reconnect = auto_reconnect;
    Ok(opts)
}

/// Drain events until authenticated (the server answers `AUTH_OK` plus an
/// initial session list).
async fn wait_for_auth(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        match timeout(REQUEST_TIMEOUT, events.recv()).await {
            Err(_) => return Err("timed out waiting for the server".into()),
            Ok(None) => return Err("connection closed before authentication".into()),
            Ok(Some(ClientEvent::Authenticated)) => return Ok(()),
            Ok(Some(ClientEvent::ServerError(e))) => {
                return Err(format!("server rejected connection: {}", e.message).into());
            }
            Ok(Some(ClientEvent::ReconnectFailed | ClientEvent::Disconnected)) => {
                return Err("could not connect to the server".into());
            }
            Ok(Some(ClientEvent::Error(e))) => return Err(e.into()),
            Ok(Some(_)) => {}
        }
    }
}

async fn wait_for_sessions(
    events: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> Result<Vec<SessionInfo>, Box<dyn std::error::Error>> {
    loop {
        match timeout(REQUEST_TIMEOUT, events.recv()).await {
            Err(_) => return Err("timed out waiting for the session list".into()),
            Ok(None) => return Err("connection closed".into()),
            Ok(Some(ClientEvent::Sessions(list))) => return Ok(list),
            Ok(Some(ClientEvent::ServerError(e))) => return Err(e.message.into()),
            Ok(Some(_)) => {}
        }
    }
}

async fn run_attach(
    home: &Path,
    session: Option<String>,
    connect: ccr::cli::ConnectArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let opts = client_options(home, connect, true)?;
    let (client, mut events) = ClientConnection::connect(opts);
    wait_for_auth(&mut events).await?;

    let session_id = match session {
        Some(id) => {
            client.attach(id.clone());
            id
        }
        None => {
            // Fresh session; the server attaches the requester on create.
            client.create_session(None, None);
            // The initial (pre-create) snapshot may arrive first; keep
            // reading lists until ours shows up attached.
            let mut created = None;
            for _ in 0..3 {
                let list = wait_for_sessions(&mut events).await?;
                created = list
                    .iter()
                    .filter(|info| info.connected)
                    .max_by_key(|info| info.created_at)
                    .map(|info| info.id.clone());
                if created.is_some() {
                    break;
                }
            }
            created.ok_or("server did not report the created session")?
        }
    };

    eprintln!("[ccr] attached to {session_id}; Ctrl+B d detaches, Ctrl+B ? lists commands");
    let outcome = run_relay(&client, &mut events, session_id.clone(), RelayConfig::default()).await;
    client.disconnect();

    match outcome? {
        RelayOutcome::Detached => {
            eprintln!("\r\n[ccr] detached from {session_id}; the session keeps running");
            Ok(())
        }
        RelayOutcome::SessionEnded => {
            eprintln!("\r\n[ccr] session {session_id} ended");
            Ok(())
        }
        RelayOutcome::ConnectionLost => {
            eprintln!("\r\n[ccr] connection lost");
            std::process::exit(1);
        }
    }
}

async fn run_list(
    home: &Path,
    json: bool,
    connect: ccr::cli::ConnectArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let opts = client_options(home, connect, false)?;
    let (client, mut events) = ClientConnection::connect(opts);
    wait_for_auth(&mut events).await?;
    // The initial snapshot follows AUTH_OK.
    let list = wait_for_sessions(&mut events).await?;
    client.disconnect();

    if json {
        println!("{}", serde_json::to_string(&list)?);
    } else if list.is_empty() {
        println!("(no sessions)");
    } else {
        println!("{:<10} {:<20} {:<9} {:<8} cwd", "ID", "NAME", "ATTACHED", "PID");
        for info in &list {
            println!(
                "{:<10} {:<20} {:<9} {:<8} {}",
                info.id,
                info.name,
                if info.connected { "yes" } else { "no" },
                info.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string()),
                info.cwd,
            );
        }
    }
    Ok(())
}

async fn run_create(
    home: &Path,
    name: Option<String>,
    cwd: Option<String>,
    connect: ccr::cli::ConnectArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let opts = client_options(home, connect, false)?;
    let (client, mut events) = ClientConnection::connect(opts);
    wait_for_auth(&mut events).await?;
    // Skip the initial snapshot, then create and wait for the broadcast.
    let before = wait_for_sessions(&mut events).await?;
    client.create_session(name, cwd);
    let after = wait_for_sessions(&mut events).await?;

    let created = after
        .iter()
        .find(|info| !before.iter().any(|old| old.id == info.id))
        .ok_or("server did not report the created session")?;
    println!("{}", created.id);

    // Leave it detached for a later `ccr attach`.
    client.detach();
    client.disconnect();
    Ok(())
}

async fn run_destroy(
    home: &Path,
    id: String,
    connect: ccr::cli::ConnectArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let opts = client_options(home, connect, false)?;
    let (client, mut events) = ClientConnection::connect(opts);
    wait_for_auth(&mut events).await?;
    let _ = wait_for_sessions(&mut events).await?;
    client.destroy_session(id.clone());

    loop {
        match timeout(REQUEST_TIMEOUT, events.recv()).await {
            Err(_) => return Err("timed out waiting for the server".into()),
            Ok(None) => return Err("connection closed".into()),
            Ok(Some(ClientEvent::Sessions(list))) => {
                if !list.iter().any(|info| info.id == id) {
                    println!("destroyed {id}");
                    client.disconnect();
                    return Ok(());
                }
            }
            Ok(Some(ClientEvent::ServerError(e))) => {
                client.disconnect();
                return Err(e.message.into());
            }
            Ok(Some(_)) => {}
        }
    }
}

async fn run_status(home: &Path, url: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_or_create(home)?;
    let base = url.unwrap_or_else(|| {
        format!("http://{}:{}", client_host(&config.host), config.port)
    });

    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()?;
    let response = client.get(format!("{base}/api/health")).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(format!("health check failed ({status}): {body}").into());
    }
    println!("{body}");
    Ok(())
}
