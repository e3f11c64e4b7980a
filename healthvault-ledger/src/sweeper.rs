//! Optional driver that sweeps the sync-failure queue on an interval.
//!
//! Nothing in the core starts one. Deployments that want automatic replay
//! spawn [`RetrySweeper::run`]; others call [`AccessLedgerSync::sweep`]
//! from an operator tool.

use crate::access::{AccessLedgerSync, SweepReport};
use crate::error::{LedgerError, LedgerResult};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

enum SweepCommand {
    Stop,
    SweepNow(oneshot::Sender<LedgerResult<SweepReport>>),
}

/// Interval loop over [`AccessLedgerSync::sweep`].
pub struct RetrySweeper {
    sync: AccessLedgerSync,
    interval: Duration,
    command_rx: mpsc::Receiver<SweepCommand>,
}

/// Handle for controlling a running sweeper.
#[derive(Clone)]
pub struct RetrySweeperHandle {
    command_tx: mpsc::Sender<SweepCommand>,
}

impl RetrySweeperHandle {
    pub async fn stop(&self) -> LedgerResult<()> {
        self.command_tx
            .send(SweepCommand::Stop)
            .await
            .map_err(|_| LedgerError::Task("retry sweeper not running".to_string()))
    }

    /// Runs a sweep immediately and returns its report.
    pub async fn sweep_now(&self) -> LedgerResult<SweepReport> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(SweepCommand::SweepNow(tx))
            .await
            .map_err(|_| LedgerError::Task("retry sweeper not running".to_string()))?;
        rx.await
            .map_err(|_| LedgerError::Task("retry sweeper stopped".to_string()))?
    }
}

/// Creates a sweeper using the configured interval, and its handle.
pub fn create_retry_sweeper(sync: AccessLedgerSync) -> (RetrySweeperHandle, RetrySweeper) {
    let interval = sync.config().sweep_interval();
    let (command_tx, command_rx) = mpsc::channel(16);
    (
        RetrySweeperHandle { command_tx },
        RetrySweeper {
            sync,
            interval,
            command_rx,
        },
    )
}

impl RetrySweeper {
    /// Runs until stopped or every handle is dropped.
    pub async fn run(&mut self) {
        info!(interval = ?self.interval, "retry sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        // Skip the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync.sweep().await {
                        error!("scheduled sweep failed: {e}");
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SweepCommand::SweepNow(reply)) => {
                            let _ = reply.send(self.sync.sweep().await);
                        }
                        Some(SweepCommand::Stop) => {
                            info!("retry sweeper stopping");
                            break;
                        }
                        None => {
                            info!("command channel closed, stopping retry sweeper");
                            break;
                        }
                    }
                }
            }
        }

        info!("retry sweeper stopped");
    }
}
