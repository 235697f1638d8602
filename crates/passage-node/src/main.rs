//! Standalone tunnel data-plane node.
//!
//! Runs one listen→target tunnel as its own process. The manager can
//! launch this binary for sandboxed deployments; the flags mirror the
//! in-process engine configuration.
//!
//! Exit codes: 0 clean stop, 2 configuration error, 3 bind failure,
//! 4 runtime fatal.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use passage_engine::{
    EngineError, ExitStatus, HostPort, MuxParams, SecretToken, TlsParams, Transport,
    TunnelInstance, TunnelSpec,
};
use passage_proto::{OwnerId, TunnelId};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 2;
const EXIT_BIND: u8 = 3;
const EXIT_RUNTIME: u8 = 4;

const STOP_GRACE: Duration = Duration::from_secs(10);

/// Run a single tunnel: accept on a public endpoint, relay to a target.
#[derive(Parser, Debug)]
#[command(name = "passage-node")]
#[command(about = "Run a passage tunnel data-plane node", long_about = None)]
#[command(version)]
struct Cli {
    /// Node role. Client mode (reverse tunnels) is not supported.
    #[arg(long, value_enum, default_value_t = Mode::Server)]
    mode: Mode,

    /// Wire protocol on the listen side.
    #[arg(long, value_enum, default_value_t = Protocol::Tcp)]
    protocol: Protocol,

    /// Listen address (HOST:PORT).
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Target address (HOST:PORT).
    #[arg(long, default_value = "127.0.0.1:22")]
    target: String,

    /// Shared authentication token (at least 16 printable bytes).
    #[arg(long, env = "PASSAGE_TOKEN")]
    token: String,

    /// TLS certificate file (PEM), required for wss.
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key file (PEM), required for wss.
    #[arg(long)]
    key: Option<String>,

    /// Multiplex logical streams over each connection.
    #[arg(long, value_enum, default_value_t = Toggle::On)]
    mux: Toggle,

    /// Maximum concurrent multiplexed streams per connection.
    #[arg(long, default_value_t = 8)]
    mux_streams: u32,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Protocol {
    Tcp,
    Udp,
    Ws,
    Wss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Toggle {
    On,
    Off,
}

fn parse_host_port(raw: &str, what: &str) -> anyhow::Result<HostPort> {
    let (host, port) = raw
        .rsplit_once(':')
        .with_context(|| format!("{what} must be HOST:PORT, got '{raw}'"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("{what} port '{port}' is not a valid port"))?;
    Ok(HostPort::new(host, port))
}

fn build_spec(cli: &Cli) -> anyhow::Result<TunnelSpec> {
    let mux_enabled = cli.mux == Toggle::On;
    let transport = match (cli.protocol, mux_enabled) {
        (Protocol::Tcp, false) => Transport::Tcp,
        (Protocol::Tcp, true) => Transport::TcpMux,
        (Protocol::Udp, enabled) => {
            if enabled {
                warn!("multiplexing does not apply to udp, ignoring --mux");
            }
            Transport::Udp
        }
        (Protocol::Ws, false) => Transport::Ws,
        (Protocol::Ws, true) => Transport::WsMux,
        (Protocol::Wss, false) => Transport::Wss,
        (Protocol::Wss, true) => Transport::WssMux,
    };

    let tls = match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => Some(TlsParams::new(cert.clone(), key.clone())),
        (None, None) => None,
        _ => anyhow::bail!("--cert and --key must be given together"),
    };
    if transport.is_tls() && tls.is_none() {
        anyhow::bail!("wss requires --cert and --key");
    }

    let spec = TunnelSpec {
        transport,
        listen: parse_host_port(&cli.listen, "listen")?,
        target: parse_host_port(&cli.target, "target")?,
        token: SecretToken::new(cli.token.clone()),
        mux: MuxParams {
            streams: cli.mux_streams,
            ..Default::default()
        },
        tls,
    };
    spec.validate().map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(spec)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    // Ignore the error when a provider is already installed.
    let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());

    if cli.mode == Mode::Client {
        error!("client mode is not supported");
        return ExitCode::from(EXIT_CONFIG);
    }

    let spec = match build_spec(&cli) {
        Ok(spec) => spec,
        Err(e) => {
            error!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    info!(
        transport = %spec.transport,
        listen = %spec.listen,
        target = %spec.target,
        "starting tunnel node"
    );

    let instance = match TunnelInstance::spawn(TunnelId::generate(), OwnerId::generate(), spec)
        .await
    {
        Ok(instance) => instance,
        Err(e @ EngineError::Bind(_)) => {
            error!("{e}");
            return ExitCode::from(EXIT_BIND);
        }
        Err(e @ EngineError::InvalidSpec(_)) => {
            error!("{e}");
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            error!("failed to start: {e}");
            return ExitCode::from(EXIT_RUNTIME);
        }
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
            if !instance.stop_and_wait(STOP_GRACE).await {
                warn!("relays force-closed after stop grace");
            }
            info!("tunnel stopped");
            ExitCode::SUCCESS
        }
        status = instance.wait_exit() => match status {
            ExitStatus::Clean => ExitCode::SUCCESS,
            ExitStatus::Failed(reason) => {
                error!("tunnel failed: {reason}");
                ExitCode::from(EXIT_RUNTIME)
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
