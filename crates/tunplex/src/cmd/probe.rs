use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tunplex_peer::{ConnectMode, ConnectionPool, PeerError, PoolStats};
use tunplex_transport::BoxMsgStream;

use crate::cmd::{client_connector, ProbeArgs};
use crate::exit::{peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{emit, payload_preview, OutputFormat, Report};

#[derive(Serialize)]
struct ProbeOutput {
    server: String,
    destination: String,
    mode: &'static str,
    ok: bool,
    status: u8,
    message: String,
    endpoint: Option<String>,
    connect_ms: f64,
    response: Option<String>,
    pool: PoolStats,
}

impl Report for ProbeOutput {
    fn title(&self) -> &'static str {
        "Probe"
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        let mut rows = vec![
            ("Server", self.server.clone()),
            ("Destination", self.destination.clone()),
            ("Mode", self.mode.to_string()),
            ("Status", format!("{} ({})", self.status, if self.ok { "ok" } else { "failed" })),
        ];
        if !self.message.is_empty() {
            rows.push(("Message", self.message.clone()));
        }
        if let Some(endpoint) = &self.endpoint {
            rows.push(("Endpoint", endpoint.clone()));
        }
        rows.push(("Connect time", format!("{:.2}ms", self.connect_ms)));
        if let Some(response) = &self.response {
            rows.push(("Response", response.clone()));
        }
        rows.push((
            "Pool",
            format!(
                "{} entries, {} connected",
                self.pool.entries, self.pool.connected
            ),
        ));
        rows
    }
}

pub async fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = args.tunnel.load()?;
    args.imux.apply(&mut config)?;
    let connector = client_connector(&config, &args.server)?;

    let mut pool_config = config.pool_config();
    pool_config.acquire_timeout = config.request_timeout() + config.dial_timeout();
    let pool = ConnectionPool::new(Arc::new(connector), pool_config)
        .map_err(|err| peer_error("invalid configuration", err))?;

    let mode = if args.fast_open {
        ConnectMode::FastOpen
    } else {
        ConnectMode::Safe
    };
    let mut out = ProbeOutput {
        server: args.server.clone(),
        destination: args.destination.to_string(),
        mode: match mode {
            ConnectMode::Safe => "safe",
            ConnectMode::FastOpen => "fast-open",
        },
        ok: false,
        status: 0,
        message: String::new(),
        endpoint: None,
        connect_ms: 0.0,
        response: None,
        pool: PoolStats::default(),
    };

    let started = Instant::now();
    let outcome = async {
        let conn = pool.connect(&args.destination, mode).await?;
        let reply = conn.confirmation.wait().await?;
        Ok::<_, PeerError>((conn, reply))
    }
    .await;
    out.connect_ms = (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;

    let result = match outcome {
        Ok((conn, reply)) => {
            out.ok = true;
            out.status = reply.status;
            out.message = reply.message;
            out.endpoint = Some(reply.endpoint.to_string());
            let sent = match &args.send {
                Some(payload) => exchange(&conn.stream, payload, config.request_timeout())
                    .await
                    .map(|response| out.response = Some(response)),
                None => Ok(()),
            };
            let _ = conn.stream.close().await;
            sent.map(|()| SUCCESS)
        }
        Err(PeerError::Rejected { status, message }) => {
            out.status = status;
            out.message = message;
            Ok(FAILURE)
        }
        Err(err) => Err(peer_error("probe failed", err)),
    };

    out.pool = pool.stats();
    pool.close().await;
    if result.is_ok() {
        emit(&out, format);
    }
    result
}

async fn exchange(
    stream: &BoxMsgStream,
    payload: &str,
    timeout: Duration,
) -> CliResult<String> {
    stream
        .send(payload.as_bytes().to_vec().into())
        .await
        .map_err(|err| CliError::new(FAILURE, format!("send failed: {err}")))?;
    match tokio::time::timeout(timeout, stream.recv()).await {
        Err(_) => Err(CliError::new(
            TIMEOUT,
            format!("no response within {timeout:?}"),
        )),
        Ok(Err(err)) => Err(CliError::new(FAILURE, format!("receive failed: {err}"))),
        Ok(Ok(None)) => Ok(String::new()),
        Ok(Ok(Some(msg))) => Ok(payload_preview(&msg)),
    }
}
