use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cmd::{client_connector, ResolveArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{emit, OutputFormat, Report};

#[derive(Serialize)]
struct ResolveOutput {
    name: String,
    record_type: &'static str,
    addresses: Vec<String>,
}

impl Report for ResolveOutput {
    fn title(&self) -> &'static str {
        "Resolved"
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Name", self.name.clone()),
            ("Type", self.record_type.to_string()),
            ("Addresses", self.addresses.join(", ")),
        ]
    }
}

pub async fn run(args: ResolveArgs, format: OutputFormat) -> CliResult<i32> {
    let config = args.tunnel.load()?;
    let connector = client_connector(&config, &args.server)?;
    let session = connector
        .connect(&CancellationToken::new())
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    let resolved = session.resolve(&args.name, args.record).await;
    session.close().await;
    let addresses = resolved.map_err(|err| peer_error("resolve failed", err))?;

    emit(
        &ResolveOutput {
            name: args.name,
            record_type: args.record.as_str(),
            addresses: addresses.iter().map(ToString::to_string).collect(),
        },
        format,
    );
    Ok(SUCCESS)
}
