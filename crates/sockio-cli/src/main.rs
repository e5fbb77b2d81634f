//! `sockio` command-line tool.
//!
//! Sends one request to a line-protocol device and prints the reply lines.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use sockio::{TcpClient, TcpClientConfig};
use tracing_subscriber::EnvFilter;

const DEFAULT_HOST: &str = "127.0.0.1";

/// Send a request to a TCP line-protocol device and print the reply.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Device host name or address [default: 127.0.0.1, or the config file's host].
    #[arg(long)]
    host: Option<String>,

    /// Device TCP port.
    #[arg(long)]
    port: u16,

    /// Request to send. `\n`, `\r` and `\t` escapes are decoded.
    #[arg(long, default_value = "*idn?\\n")]
    request: String,

    /// Timeout in seconds for connecting and for the exchange.
    #[arg(long)]
    timeout: Option<f64>,

    /// Base configuration file (TOML); command-line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("cannot start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let request = unescape(&cli.request);
    let count = request.iter().filter(|&&b| b == b'\n').count().max(1);

    let result = runtime.block_on(async {
        let client = TcpClient::new(config);
        let replies = client.write_readlines(&request, count, None).await;
        client.close().await;
        replies
    });

    match result {
        Ok(replies) => {
            for reply in replies {
                println!("{}", repr_bytes(&reply));
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("request failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_config(cli: &Cli) -> Result<TcpClientConfig, String> {
    let mut config = match &cli.config {
        Some(path) => TcpClientConfig::load(path).map_err(|e| e.to_string())?,
        None => TcpClientConfig::new(DEFAULT_HOST, cli.port),
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    config.port = cli.port;

    if let Some(secs) = cli.timeout {
        let timeout = Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("invalid timeout {secs}: {e}"))?;
        config = config.connection_timeout(timeout).timeout(timeout);
    }
    Ok(config)
}

/// Decode `\n`, `\r`, `\t` and `\\` escapes. Unknown escapes are kept as-is.
fn unescape(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'\\') => out.push(b'\\'),
            Some(other) => out.extend_from_slice(&[b'\\', other]),
            None => out.push(b'\\'),
        }
    }
    out
}

/// Render bytes as a `b'...'` literal.
fn repr_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &b in data {
        match b {
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('\'');
    out
}
