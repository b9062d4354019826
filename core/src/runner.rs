//! Per-command session runner
//!
//! Each command walks `OPENING -> RUNNING -> {DONE, TIMED_OUT, FAILED}`:
//! a channel is opened on the channel-open pool, the command is driven on the
//! command-run pool, and both waits share one absolute deadline. Once a
//! channel exists it is closed exactly once, whatever the outcome, including
//! when the caller stops waiting.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, instrument, warn};

use crate::line::{stream_lines, BufferingProcessor, LineProcessor};
use crate::transport::{Channel, Connection};
use crate::worker::WorkerPool;
use crate::{Error, ExecutorConfig, SshResult, TransportError};

pub(crate) const OPEN_POOL: &str = "channel-open";
pub(crate) const RUN_POOL: &str = "command-run";

/// Runs single commands over a connection with deadline enforcement
///
/// Owns the two worker pools; build one per process and share it.
#[derive(Debug)]
pub struct SessionRunner {
    open_pool: WorkerPool,
    run_pool: WorkerPool,
}

impl SessionRunner {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            open_pool: WorkerPool::new(OPEN_POOL, config.open_workers, config.open_queue),
            run_pool: WorkerPool::new(RUN_POOL, config.run_workers, config.run_queue),
        }
    }

    pub fn open_pool(&self) -> &WorkerPool {
        &self.open_pool
    }

    pub fn run_pool(&self) -> &WorkerPool {
        &self.run_pool
    }

    /// Run `command` on `connection`
    ///
    /// With no `processor`, stdout is buffered and returned as the success
    /// output. Never returns `Err`: every failure is carried by the result.
    /// Returns by the deadline; a channel still closing then is closed in the
    /// background.
    #[instrument(skip(self, connection, processor), fields(host = %connection.host()))]
    pub async fn run(
        &self,
        connection: Arc<dyn Connection>,
        command: &str,
        processor: Option<Box<dyn LineProcessor>>,
        timeout: Duration,
    ) -> SshResult {
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = Instant::now() + timeout;
        let host = connection.host().to_string();

        let result = match self.open(connection, deadline, timeout_ms).await {
            Ok(channel) => {
                self.drive(channel, command, processor, deadline, timeout_ms)
                    .await
            }
            Err(e) => SshResult::failure(e),
        };

        if let SshResult::Failure(e) = &result {
            error!(host = %host, command = %command, timeout_ms, error = %e, "Command failed");
        }
        result
    }

    async fn open(
        &self,
        connection: Arc<dyn Connection>,
        deadline: Instant,
        timeout_ms: u64,
    ) -> Result<ChannelGuard, Error> {
        let mut pending = self.open_pool.submit(async move {
            connection.open_channel().await.map(ChannelGuard::new)
        })?;

        // Dropping `pending` cancels an open still in progress; a channel that
        // opened anyway is closed by its guard.
        match timeout_at(deadline, &mut pending).await {
            Ok(Ok(Ok(channel))) => Ok(channel),
            Ok(Ok(Err(e))) => Err(Error::SessionOpenFailure(e)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::SessionOpenTimeout { timeout_ms }),
        }
    }

    async fn drive(
        &self,
        channel: ChannelGuard,
        command: &str,
        processor: Option<Box<dyn LineProcessor>>,
        deadline: Instant,
        timeout_ms: u64,
    ) -> SshResult {
        let command = command.to_string();
        let mut running = match self.run_pool.submit(async move {
            let mut channel = channel;
            let result = run_on_channel(&mut channel, &command, processor).await;
            channel.close().await;
            result
        }) {
            Ok(handle) => handle,
            Err(e) => return SshResult::failure(e),
        };

        match timeout_at(deadline, &mut running).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => SshResult::failure(Error::CommandFailure(e)),
            Ok(Err(e)) => SshResult::failure(e),
            Err(_) => {
                // The remote process may keep running; only the local job stops.
                running.cancel();
                SshResult::failure(Error::CommandTimeout { timeout_ms })
            }
        }
    }

    /// Shut both pools down, see [`WorkerPool::shutdown`]
    pub async fn shutdown(&self, grace: Duration) {
        tokio::join!(self.open_pool.shutdown(grace), self.run_pool.shutdown(grace));
    }
}

/// Owns an open channel and closes it exactly once
///
/// [`close`](Self::close) closes inline. A guard dropped before that, because
/// its job was cancelled or its result was never collected, hands the close
/// to a background task.
struct ChannelGuard {
    channel: Option<Box<dyn Channel>>,
}

impl ChannelGuard {
    fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            channel: Some(channel),
        }
    }

    fn get(&mut self) -> Result<&mut dyn Channel, TransportError> {
        match self.channel.as_mut() {
            Some(channel) => Ok(&mut **channel),
            None => Err(TransportError::Protocol("channel already closed".to_string())),
        }
    }

    async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!(error = %e, "Failed to close session");
            }
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let Some(mut channel) = self.channel.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Closing abandoned session in background");
                runtime.spawn(async move {
                    if let Err(e) = channel.close().await {
                        warn!(error = %e, "Failed to close abandoned session");
                    }
                });
            }
            Err(_) => warn!("No runtime to close abandoned session"),
        }
    }
}

async fn run_on_channel(
    guard: &mut ChannelGuard,
    command: &str,
    processor: Option<Box<dyn LineProcessor>>,
) -> Result<SshResult, TransportError> {
    let channel = guard.get()?;
    channel.exec(command).await?;

    let lines = match processor {
        Some(mut processor) => {
            stream_lines(channel.stdout(), processor.as_mut()).await;
            processor.lines_processed()
        }
        None => {
            let mut buffer = BufferingProcessor::new();
            stream_lines(channel.stdout(), &mut buffer).await;
            if !buffer.is_empty() {
                return Ok(SshResult::with_output(buffer.into_output()));
            }
            buffer.lines_processed()
        }
    };

    if lines == 0 {
        if let Some(stderr) = drain_stderr(channel).await {
            return Ok(SshResult::failure(Error::CommandExecution(stderr)));
        }
    }
    Ok(SshResult::ok())
}

async fn drain_stderr(channel: &mut dyn Channel) -> Option<String> {
    let mut raw = Vec::new();
    if let Err(e) = channel.stderr().read_to_end(&mut raw).await {
        warn!(error = %e, "Failed to read stderr");
    }

    let mut buffer = BufferingProcessor::new();
    stream_lines(&raw[..], &mut buffer).await;
    if buffer.is_empty() {
        None
    } else {
        Some(buffer.into_output())
    }
}
