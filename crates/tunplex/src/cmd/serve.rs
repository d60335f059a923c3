use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunplex_peer::{Dispatcher, TcpConnector, TunnelConfig, TunnelListener};

use crate::cmd::{interrupted, ServeArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{emit, OutputFormat, Report};

#[derive(Serialize)]
struct ServeOutput {
    listen: String,
    cipher: Vec<String>,
    channel_cipher: Vec<String>,
    imux_deadline_ms: u64,
    request_timeout_ms: u64,
}

impl Report for ServeOutput {
    fn title(&self) -> &'static str {
        "Listening"
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Address", self.listen.clone()),
            ("Cipher", chain(&self.cipher)),
            ("Channel cipher", chain(&self.channel_cipher)),
            ("IMUX deadline", format!("{}ms", self.imux_deadline_ms)),
            ("Request timeout", format!("{}ms", self.request_timeout_ms)),
        ]
    }
}

fn chain(stages: &[String]) -> String {
    if stages.is_empty() {
        "none".to_string()
    } else {
        stages.join(",")
    }
}

pub fn dispatcher(config: &TunnelConfig) -> CliResult<Dispatcher> {
    let session = config
        .session_config()
        .map_err(|err| peer_error("invalid configuration", err))?;
    Ok(Dispatcher::new(session)
        .with_connector(Arc::new(TcpConnector::new(config.dial_timeout())))
        .with_imux_deadline(config.imux_deadline()))
}

pub async fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.tunnel.load()?;
    let frame = config
        .frame_config()
        .map_err(|err| peer_error("invalid configuration", err))?;
    let dispatcher = Arc::new(dispatcher(&config)?);
    let listener = TunnelListener::bind(&args.listen, frame, dispatcher)
        .await
        .map_err(|err| peer_error("bind failed", err))?;

    emit(
        &ServeOutput {
            listen: listener.local_addr().to_string(),
            cipher: config.cipher.clone(),
            channel_cipher: config.channel_cipher.clone(),
            imux_deadline_ms: config.imux_deadline_ms,
            request_timeout_ms: config.request_timeout_ms,
        },
        format,
    );

    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        interrupted().await;
        info!("interrupt received, shutting down");
        stop.cancel();
    });

    listener
        .run(cancel)
        .await
        .map_err(|err| peer_error("listener failed", err))?;
    Ok(SUCCESS)
}
