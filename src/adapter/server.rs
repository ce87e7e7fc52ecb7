//! Line-oriented replay server.

use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, info};

use super::service::ReplayService;
use crate::error::{Result, ThrottleError};
use crate::ratelimit::AdmissionController;

/// Counters for one replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub admitted: u64,
    pub denied: u64,
    pub malformed: u64,
}

impl ReplayStats {
    pub fn total(&self) -> u64 {
        self.admitted + self.denied + self.malformed
    }
}

/// Reads request lines from an input stream and writes outcome lines.
pub struct ReplayServer {
    service: ReplayService,
}

impl ReplayServer {
    /// Create a new replay server over a shared admission controller.
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self {
            service: ReplayService::new(controller),
        }
    }

    /// Process the input until it is exhausted.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> Result<ReplayStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.serve_with_shutdown(reader, writer, std::future::pending())
            .await
    }

    /// Process the input until it is exhausted or `signal` resolves.
    ///
    /// A line whose decision was already made is always written out before
    /// the shutdown signal is observed.
    pub async fn serve_with_shutdown<R, W, F>(
        self,
        reader: R,
        mut writer: W,
        signal: F,
    ) -> Result<ReplayStats>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: std::future::Future<Output = ()>,
    {
        info!("Starting replay of inbound requests");

        let mut lines = reader.lines();
        let mut stats = ReplayStats::default();
        tokio::pin!(signal);

        loop {
            let line = tokio::select! {
                line = lines.next_line() => line.map_err(|e| {
                    error!(error = %e, "Failed to read request line");
                    ThrottleError::Io(e)
                })?,
                _ = &mut signal => {
                    info!("Shutdown requested, stopping replay");
                    break;
                }
            };

            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let outcome = self.service.handle_line(&line);
            if outcome.admitted {
                stats.admitted += 1;
            } else if outcome.is_throttled() {
                stats.denied += 1;
            } else {
                stats.malformed += 1;
            }

            let mut encoded = serde_json::to_vec(&outcome)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
        }

        writer.flush().await?;

        info!(
            admitted = stats.admitted,
            denied = stats.denied,
            malformed = stats.malformed,
            "Replay finished"
        );
        Ok(stats)
    }
}
