//! Line-oriented latency and throughput test carried on one channel.
//!
//! After an OK reply the client drives the exchange with text commands:
//! `ping <token>`, `down <n>`, `up <n>` and `quit`.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;
use tunplex_transport::BoxMsgStream;

use crate::error::{PeerError, Result};
use crate::session::Session;
use crate::wire::{Command, Destination, Reply, Request};

/// Largest transfer a server will agree to in either direction.
pub const MAX_TRANSFER: u64 = 1 << 30;

const CHUNK_SIZE: usize = 16 * 1024;

pub(crate) async fn serve(stream: &BoxMsgStream) -> Result<()> {
    stream
        .send(Reply::ok(Destination::unspecified()).encode()?)
        .await?;

    while let Some(msg) = stream.recv().await? {
        let line = String::from_utf8_lossy(&msg);
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("ping"), token) => {
                send_line(stream, &format!("pong {}", token.unwrap_or_default())).await?;
            }
            (Some("down"), Some(n)) => match n.parse::<u64>() {
                Ok(n) => {
                    let n = n.min(MAX_TRANSFER);
                    let chunk = Bytes::from(vec![0u8; CHUNK_SIZE]);
                    let mut left = n;
                    while left > 0 {
                        let take = left.min(CHUNK_SIZE as u64) as usize;
                        stream.send(chunk.slice(..take)).await?;
                        left -= take as u64;
                    }
                    send_line(stream, "done").await?;
                }
                Err(_) => send_line(stream, "err bad size").await?,
            },
            (Some("up"), Some(n)) => match n.parse::<u64>() {
                Ok(n) => {
                    let want = n.min(MAX_TRANSFER);
                    let mut got = 0u64;
                    while got < want {
                        match stream.recv().await? {
                            Some(chunk) => got += chunk.len() as u64,
                            None => {
                                return Err(PeerError::SessionClosed(format!(
                                    "upload ended after {got} of {want} bytes"
                                )))
                            }
                        }
                    }
                    send_line(stream, &format!("got {got}")).await?;
                }
                Err(_) => send_line(stream, "err bad size").await?,
            },
            (Some("quit"), _) => break,
            _ => send_line(stream, "err unknown command").await?,
        }
    }
    stream.shutdown_send().await?;
    Ok(())
}

async fn send_line(stream: &BoxMsgStream, line: &str) -> Result<()> {
    stream.send(Bytes::copy_from_slice(line.as_bytes())).await?;
    Ok(())
}

async fn expect_line(stream: &BoxMsgStream) -> Result<String> {
    let msg = stream
        .recv()
        .await?
        .ok_or_else(|| PeerError::SessionClosed("speed test ended early".to_string()))?;
    Ok(String::from_utf8_lossy(&msg).into_owned())
}

/// What a client run measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedTestPlan {
    pub pings: u32,
    pub download: u64,
    pub upload: u64,
}

impl Default for SpeedTestPlan {
    fn default() -> Self {
        Self {
            pings: 4,
            download: 4 * 1024 * 1024,
            upload: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SpeedReport {
    pub rtt_ms: Vec<f64>,
    pub download_bytes: u64,
    pub download_bps: f64,
    pub upload_bytes: u64,
    pub upload_bps: f64,
}

impl SpeedReport {
    pub fn average_rtt_ms(&self) -> Option<f64> {
        if self.rtt_ms.is_empty() {
            return None;
        }
        Some(self.rtt_ms.iter().sum::<f64>() / self.rtt_ms.len() as f64)
    }
}

fn rate(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / secs
}

/// Drive a speed test over a stream that has already been accepted.
pub async fn run(stream: &BoxMsgStream, plan: SpeedTestPlan) -> Result<SpeedReport> {
    let mut report = SpeedReport::default();

    for i in 0..plan.pings {
        let started = Instant::now();
        send_line(stream, &format!("ping {i}")).await?;
        let answer = expect_line(stream).await?;
        if answer != format!("pong {i}") {
            return Err(PeerError::SessionClosed(format!(
                "unexpected ping answer: {answer}"
            )));
        }
        report
            .rtt_ms
            .push(started.elapsed().as_secs_f64() * 1000.0);
    }

    if plan.download > 0 {
        let want = plan.download.min(MAX_TRANSFER);
        let started = Instant::now();
        send_line(stream, &format!("down {want}")).await?;
        let mut got = 0u64;
        while got < want {
            let chunk = stream
                .recv()
                .await?
                .ok_or_else(|| PeerError::SessionClosed("download ended early".to_string()))?;
            got += chunk.len() as u64;
        }
        let done = expect_line(stream).await?;
        if done != "done" {
            return Err(PeerError::SessionClosed(format!(
                "unexpected download trailer: {done}"
            )));
        }
        report.download_bytes = got;
        report.download_bps = rate(got, started.elapsed());
    }

    if plan.upload > 0 {
        let want = plan.upload.min(MAX_TRANSFER);
        let started = Instant::now();
        send_line(stream, &format!("up {want}")).await?;
        let chunk = Bytes::from(vec![0u8; CHUNK_SIZE]);
        let mut left = want;
        while left > 0 {
            let take = left.min(CHUNK_SIZE as u64) as usize;
            stream.send(chunk.slice(..take)).await?;
            left -= take as u64;
        }
        let answer = expect_line(stream).await?;
        if answer != format!("got {want}") {
            return Err(PeerError::SessionClosed(format!(
                "unexpected upload answer: {answer}"
            )));
        }
        report.upload_bytes = want;
        report.upload_bps = rate(want, started.elapsed());
    }

    send_line(stream, "quit").await?;
    debug!(?report, "speed test finished");
    Ok(report)
}

impl Session {
    /// Run a speed test against the remote peer.
    pub async fn speedtest(&self, plan: SpeedTestPlan) -> Result<SpeedReport> {
        let request = Request::new(Destination::unspecified(), Command::SpeedTest);
        let (stream, reply) = self.exchange(&request).await?;
        if !reply.is_ok() {
            let _ = stream.close().await;
            return Err(PeerError::Rejected {
                status: reply.status,
                message: reply.message,
            });
        }
        let result = run(&stream, plan).await;
        let _ = stream.close().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tunplex_transport::{pipe, MsgStream};

    use super::*;

    fn start_server() -> BoxMsgStream {
        let (a, b) = pipe();
        let server: BoxMsgStream = Arc::new(a);
        tokio::spawn(async move { serve(&server).await });
        Arc::new(b)
    }

    #[tokio::test]
    async fn full_run_reports_every_phase() {
        let client = start_server();
        let reply = Reply::decode(&client.recv().await.unwrap().unwrap()).unwrap();
        assert!(reply.is_ok());

        let plan = SpeedTestPlan {
            pings: 2,
            download: 40_000,
            upload: 20_000,
        };
        let report = run(&client, plan).await.unwrap();
        assert_eq!(report.rtt_ms.len(), 2);
        assert!(report.average_rtt_ms().is_some());
        assert_eq!(report.download_bytes, 40_000);
        assert_eq!(report.upload_bytes, 20_000);
        assert!(client.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_commands_get_an_error_line() {
        let client = start_server();
        client.recv().await.unwrap();
        send_line(&client, "sideways 3").await.unwrap();
        assert_eq!(expect_line(&client).await.unwrap(), "err unknown command");
        send_line(&client, "ping").await.unwrap();
        assert_eq!(expect_line(&client).await.unwrap(), "pong ");
    }
}
