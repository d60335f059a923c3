use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tunplex_peer::{SpeedReport, SpeedTestPlan};

use crate::cmd::{client_connector, SpeedtestArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{emit, format_rate, OutputFormat, Report};

#[derive(Serialize)]
struct SpeedtestOutput {
    server: String,
    legs: usize,
    average_rtt_ms: Option<f64>,
    #[serde(flatten)]
    report: SpeedReport,
}

impl Report for SpeedtestOutput {
    fn title(&self) -> &'static str {
        "Speed test"
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        let rtt = match self.average_rtt_ms {
            Some(ms) => format!("{ms:.2}ms over {} pings", self.report.rtt_ms.len()),
            None => "not measured".to_string(),
        };
        vec![
            ("Server", self.server.clone()),
            (
                "Connections",
                if self.legs == 0 {
                    "1".to_string()
                } else {
                    format!("{} imux legs", self.legs)
                },
            ),
            ("Round trip", rtt),
            (
                "Download",
                format!(
                    "{} ({} bytes)",
                    format_rate(self.report.download_bps),
                    self.report.download_bytes
                ),
            ),
            (
                "Upload",
                format!(
                    "{} ({} bytes)",
                    format_rate(self.report.upload_bps),
                    self.report.upload_bytes
                ),
            ),
        ]
    }
}

pub async fn run(args: SpeedtestArgs, format: OutputFormat) -> CliResult<i32> {
    let mut config = args.tunnel.load()?;
    args.imux.apply(&mut config)?;
    let connector = client_connector(&config, &args.server)?;
    let session = connector
        .connect(&CancellationToken::new())
        .await
        .map_err(|err| peer_error("connect failed", err))?;

    let plan = SpeedTestPlan {
        pings: args.pings,
        download: args.download,
        upload: args.upload,
    };
    let measured = session.speedtest(plan).await;
    session.close().await;
    let report = measured.map_err(|err| peer_error("speed test failed", err))?;

    emit(
        &SpeedtestOutput {
            server: args.server,
            legs: config.imux_plan().total(),
            average_rtt_ms: report.average_rtt_ms(),
            report,
        },
        format,
    );
    Ok(SUCCESS)
}
