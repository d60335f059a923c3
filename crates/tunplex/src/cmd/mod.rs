use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand};
use tunplex_peer::{ClientConnector, Destination, RecordType, TcpDialer, TunnelConfig};

use crate::exit::{peer_error, CliError, CliResult, INTERNAL};
use crate::output::OutputFormat;

pub mod probe;
pub mod resolve;
pub mod serve;
pub mod speedtest;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept tunnel connections and serve their requests.
    Serve(ServeArgs),
    /// Open a connection through a tunnel server and report the reply.
    Probe(ProbeArgs),
    /// Resolve a name on the far side of a tunnel.
    Resolve(ResolveArgs),
    /// Measure round trips and throughput to a tunnel server.
    Speedtest(SpeedtestArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => block_on(serve::run(args, format)),
        Command::Probe(args) => block_on(probe::run(args, format)),
        Command::Resolve(args) => block_on(resolve::run(args, format)),
        Command::Speedtest(args) => block_on(speedtest::run(args, format)),
        Command::Version(args) => version::run(args, format),
    }
}

fn block_on<F: Future<Output = CliResult<i32>>>(fut: F) -> CliResult<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("runtime setup failed: {err}")))?;
    runtime.block_on(fut)
}

/// Tunnel settings shared by every networked command.
#[derive(Args, Debug, Default)]
pub struct TunnelArgs {
    /// JSON config file. Flags below override its values.
    #[arg(long, short = 'c', value_name = "FILE", env = "TUNPLEX_CONFIG")]
    pub config: Option<PathBuf>,
    /// Passphrase for the cipher chains.
    #[arg(long, env = "TUNPLEX_KEY", hide_env_values = true)]
    pub key: Option<String>,
    /// Connection cipher stages (comma-separated). Pass `none` for plain text.
    #[arg(long, value_delimiter = ',')]
    pub cipher: Option<Vec<String>>,
    /// Channel cipher stages (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub channel_cipher: Option<Vec<String>>,
    /// Request timeout (e.g. 5s, 500ms).
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

impl TunnelArgs {
    /// Load the config file (if any) and apply flag overrides.
    pub fn load(&self) -> CliResult<TunnelConfig> {
        let mut config = match &self.config {
            Some(path) => TunnelConfig::load(path).map_err(|err| peer_error("config", err))?,
            None => TunnelConfig::default(),
        };
        if let Some(key) = &self.key {
            config.key = key.clone();
        }
        if let Some(cipher) = &self.cipher {
            config.cipher = stages(cipher);
        }
        if let Some(cipher) = &self.channel_cipher {
            config.channel_cipher = stages(cipher);
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_ms = timeout.as_millis() as u64;
        }
        config
            .validate()
            .map_err(|err| peer_error("invalid configuration", err))?;
        Ok(config)
    }
}

fn stages(names: &[String]) -> Vec<String> {
    names
        .iter()
        .filter(|name| !name.eq_ignore_ascii_case("none"))
        .cloned()
        .collect()
}

/// Leg counts for IMUX. All zero means one plain connection.
#[derive(Args, Debug, Default)]
pub struct ImuxArgs {
    /// Duplex IMUX legs.
    #[arg(long)]
    pub imux_ws: Option<u16>,
    /// Send-only IMUX legs.
    #[arg(long)]
    pub imux_wsso: Option<u16>,
    /// Receive-only IMUX legs.
    #[arg(long)]
    pub imux_http: Option<u16>,
}

impl ImuxArgs {
    /// Override the leg counts in `config` and re-check it.
    pub fn apply(&self, config: &mut TunnelConfig) -> CliResult<()> {
        if let Some(ws) = self.imux_ws {
            config.imux_ws = ws;
        }
        if let Some(wsso) = self.imux_wsso {
            config.imux_wsso = wsso;
        }
        if let Some(http) = self.imux_http {
            config.imux_http = http;
        }
        config
            .validate()
            .map_err(|err| peer_error("invalid imux plan", err))
    }
}

/// Build a client connector for `server` from a validated config.
pub fn client_connector(config: &TunnelConfig, server: &str) -> CliResult<ClientConnector> {
    let frame = config
        .frame_config()
        .map_err(|err| peer_error("invalid configuration", err))?;
    let session = config
        .session_config()
        .map_err(|err| peer_error("invalid configuration", err))?;
    let dialer = TcpDialer::new(server, frame).with_timeout(config.dial_timeout());
    Ok(ClientConnector::new(Arc::new(dialer), session).with_imux(config.imux_plan()))
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on, e.g. 0.0.0.0:8443.
    pub listen: String,
    #[command(flatten)]
    pub tunnel: TunnelArgs,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Tunnel server address.
    pub server: String,
    /// Destination to connect to through the tunnel (host:port).
    #[arg(value_parser = parse_destination)]
    pub destination: Destination,
    /// Return before the reply arrives and read it from the confirmation.
    #[arg(long)]
    pub fast_open: bool,
    /// Send this payload after connecting and print the first response.
    #[arg(long)]
    pub send: Option<String>,
    #[command(flatten)]
    pub tunnel: TunnelArgs,
    #[command(flatten)]
    pub imux: ImuxArgs,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Tunnel server address.
    pub server: String,
    /// Name to resolve.
    pub name: String,
    /// Record type: A, AAAA or ANY.
    #[arg(long = "type", short = 't', default_value = "A")]
    pub record: RecordType,
    #[command(flatten)]
    pub tunnel: TunnelArgs,
}

#[derive(Args, Debug)]
pub struct SpeedtestArgs {
    /// Tunnel server address.
    pub server: String,
    /// Round trips to time.
    #[arg(long, default_value = "4")]
    pub pings: u32,
    /// Bytes to download.
    #[arg(long, default_value = "4194304")]
    pub download: u64,
    /// Bytes to upload.
    #[arg(long, default_value = "4194304")]
    pub upload: u64,
    #[command(flatten)]
    pub tunnel: TunnelArgs,
    #[command(flatten)]
    pub imux: ImuxArgs,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_destination(input: &str) -> Result<Destination, String> {
    input.parse().map_err(|err| format!("{err}"))
}

/// Parse `5s`, `150ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("duration must not be empty".to_string());
    }
    let (number, millis) = match input.strip_suffix("ms") {
        Some(num) => (num, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {input}"))?;
    if value == 0 {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Resolve when Ctrl-C arrives. A failed handler install never resolves.
pub async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::USAGE;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn flags_override_config_and_none_means_plain() {
        let args = TunnelArgs {
            cipher: Some(vec!["none".to_string()]),
            timeout: Some(Duration::from_millis(750)),
            ..TunnelArgs::default()
        };
        let config = args.load().unwrap();
        assert!(config.cipher.is_empty());
        assert_eq!(config.request_timeout_ms, 750);
    }

    #[test]
    fn cipher_without_key_is_a_usage_error() {
        let err = TunnelArgs::default().load().unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn imux_flags_apply_to_config() {
        let mut config = TunnelConfig {
            key: "k".to_string(),
            ..TunnelConfig::default()
        };
        ImuxArgs {
            imux_ws: Some(2),
            imux_http: Some(1),
            ..ImuxArgs::default()
        }
        .apply(&mut config)
        .unwrap();
        assert_eq!(config.imux_plan().total(), 3);

        let send_only = ImuxArgs {
            imux_ws: Some(0),
            imux_wsso: Some(2),
            imux_http: Some(0),
        };
        assert_eq!(send_only.apply(&mut config).unwrap_err().code, USAGE);
    }
}
