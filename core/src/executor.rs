//! Execution facade
//!
//! [`SshExecutor::execute`] borrows a pooled connection for one host, hands the
//! caller an [`SshSession`] to run commands and copy files with, and returns
//! the connection to the pool on every exit path:
//!
//! ```no_run
//! # async fn example(executor: fleetssh_core::SshExecutor) -> fleetssh_core::Result<()> {
//! let uptime = executor
//!     .execute("10.0.0.12", |session| async move {
//!         let result = session.run_command("uptime").await;
//!         anyhow::Ok(result.output().map(str::to_string))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{DEFAULT_FILE_MODE, VALIDATE_COMMAND};
use crate::line::LineProcessor;
use crate::runner::SessionRunner;
use crate::transfer;
use crate::transport::{Connection, ConnectionPool};
use crate::{Error, ExecutorConfig, Result, SshResult};

/// Process-wide entry point for remote execution
///
/// Owns the channel-open and command-run worker pools. Build one at startup,
/// share it (it is cheap to clone), and call [`shutdown`](Self::shutdown)
/// before exit.
#[derive(Clone)]
pub struct SshExecutor {
    pool: Arc<dyn ConnectionPool>,
    runner: Arc<SessionRunner>,
    config: Arc<ExecutorConfig>,
}

impl SshExecutor {
    /// Create an executor and its worker pools
    pub fn new(pool: Arc<dyn ConnectionPool>, config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        info!(
            open_workers = config.open_workers,
            open_queue = config.open_queue,
            run_workers = config.run_workers,
            run_queue = config.run_queue,
            "Creating SSH executor"
        );

        Ok(Self {
            pool,
            runner: Arc::new(SessionRunner::new(&config)),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn runner(&self) -> &SessionRunner {
        &self.runner
    }

    /// Run `operation` with a session bound to a connection for `host`
    ///
    /// The connection is released exactly once, also when `operation` fails
    /// or panics. Errors from `operation` are returned after release; errors
    /// that are not already an [`Error`] are wrapped in [`Error::Execution`].
    #[instrument(skip(self, operation))]
    pub async fn execute<F, Fut, T>(&self, host: &str, operation: F) -> Result<T>
    where
        F: FnOnce(SshSession) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let connection = self
            .pool
            .borrow(host, self.config.borrow_timeout())
            .await
            .map_err(|source| {
                error!(host, error = %source, "Failed to borrow connection");
                Error::PoolAcquire {
                    host: host.to_string(),
                    source,
                }
            })?;

        let released = Arc::new(AtomicBool::new(false));
        let lease = Lease {
            pool: self.pool.clone(),
            host: host.to_string(),
            connection: Some(connection.clone()),
            released: released.clone(),
        };

        let session = SshSession {
            host: host.to_string(),
            connection,
            released,
            runner: self.runner.clone(),
            default_timeout: self.config.server_op_timeout(),
        };

        let outcome = operation(session).await;
        drop(lease);

        outcome.map_err(|e| match e.downcast::<Error>() {
            Ok(err) => err,
            Err(source) => {
                error!(host, error = %source, "SSH operation failed");
                Error::Execution {
                    host: host.to_string(),
                    source,
                }
            }
        })
    }

    /// Probe `host` with `date`; true only when the command succeeds
    pub async fn validate(&self, host: &str) -> bool {
        match self
            .execute(host, |session| async move {
                anyhow::Ok(session.run_command(VALIDATE_COMMAND).await)
            })
            .await
        {
            Ok(result) => result.is_success(),
            Err(e) => {
                warn!(host, error = %e, "Validation failed");
                false
            }
        }
    }

    /// Stop both worker pools
    ///
    /// New commands fail with [`Error::PoolShutdown`]; in-flight ones get the
    /// configured grace period and are then aborted.
    pub async fn shutdown(&self) {
        info!("Shutting down SSH executor");
        self.runner.shutdown(self.config.shutdown_grace()).await;
    }
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("runner", &self.runner)
            .field("config", &self.config)
            .finish()
    }
}

/// Returns the connection to the pool when dropped
struct Lease {
    pool: Arc<dyn ConnectionPool>,
    host: String,
    connection: Option<Arc<dyn Connection>>,
    released: Arc<AtomicBool>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
        if let Some(connection) = self.connection.take() {
            debug!(host = %self.host, "Releasing connection");
            self.pool.release(&self.host, connection);
        }
    }
}

/// Handle to one borrowed connection, valid for the duration of an
/// [`SshExecutor::execute`] call
///
/// Every command gets its own channel. Command and transfer failures are
/// returned as [`SshResult::Failure`], never as `Err`. A session (or a clone
/// of it) used after its `execute` call returned fails with
/// [`Error::SessionReleased`].
#[derive(Clone)]
pub struct SshSession {
    host: String,
    connection: Arc<dyn Connection>,
    released: Arc<AtomicBool>,
    runner: Arc<SessionRunner>,
    default_timeout: Duration,
}

impl SshSession {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// True once the connection went back to the pool
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn connection(&self) -> Result<&dyn Connection> {
        if self.is_released() {
            warn!(host = %self.host, "Session used after its connection was released");
            return Err(Error::SessionReleased {
                host: self.host.clone(),
            });
        }
        Ok(self.connection.as_ref())
    }

    /// Run `command` with the configured deadline, buffering stdout
    pub async fn run_command(&self, command: &str) -> SshResult {
        self.run(command, None, self.default_timeout).await
    }

    /// Run `command` with a deadline of `timeout_ms`, buffering stdout
    pub async fn run_command_timeout(&self, command: &str, timeout_ms: u64) -> SshResult {
        self.run(command, None, Duration::from_millis(timeout_ms))
            .await
    }

    /// Run `command`, feeding each stdout line to `processor`
    ///
    /// Succeeds without output unless the command printed nothing on stdout
    /// and something on stderr.
    pub async fn run_command_with<P>(&self, command: &str, processor: P) -> SshResult
    where
        P: LineProcessor + 'static,
    {
        self.run(command, Some(Box::new(processor)), self.default_timeout)
            .await
    }

    pub async fn run_command_with_timeout<P>(
        &self,
        command: &str,
        processor: P,
        timeout_ms: u64,
    ) -> SshResult
    where
        P: LineProcessor + 'static,
    {
        self.run(
            command,
            Some(Box::new(processor)),
            Duration::from_millis(timeout_ms),
        )
        .await
    }

    async fn run(
        &self,
        command: &str,
        processor: Option<Box<dyn LineProcessor>>,
        timeout: Duration,
    ) -> SshResult {
        if let Err(e) = self.connection() {
            return SshResult::failure(e);
        }
        self.runner
            .run(self.connection.clone(), command, processor, timeout)
            .await
    }

    /// Copy local files to `remote_dir`, see [`transfer::copy_files`]
    pub async fn copy_files(
        &self,
        local_paths: &[PathBuf],
        remote_names: Option<&[String]>,
        remote_dir: &str,
        mode: &str,
    ) -> SshResult {
        let connection = match self.connection() {
            Ok(connection) => connection,
            Err(e) => return SshResult::failure(e),
        };
        transfer::copy_files(
            connection,
            local_paths,
            remote_names,
            remote_dir,
            mode,
        )
        .await
    }

    /// Copy one file into `remote_dir` with mode `0744`
    pub async fn copy_to_directory(
        &self,
        local_path: impl Into<PathBuf>,
        remote_dir: &str,
    ) -> SshResult {
        self.copy_to_directory_with_mode(local_path, remote_dir, DEFAULT_FILE_MODE)
            .await
    }

    pub async fn copy_to_directory_with_mode(
        &self,
        local_path: impl Into<PathBuf>,
        remote_dir: &str,
        mode: &str,
    ) -> SshResult {
        self.copy_files(&[local_path.into()], None, remote_dir, mode)
            .await
    }

    /// Copy several files into `remote_dir` with mode `0744`
    pub async fn copy_files_to_directory(
        &self,
        local_paths: &[PathBuf],
        remote_dir: &str,
    ) -> SshResult {
        self.copy_files(local_paths, None, remote_dir, DEFAULT_FILE_MODE)
            .await
    }

    /// Copy one file to `remote_dir/remote_name` with mode `0744`
    pub async fn copy_to_file(
        &self,
        local_path: impl Into<PathBuf>,
        remote_name: &str,
        remote_dir: &str,
    ) -> SshResult {
        self.copy_to_file_with_mode(local_path, remote_name, remote_dir, DEFAULT_FILE_MODE)
            .await
    }

    pub async fn copy_to_file_with_mode(
        &self,
        local_path: impl Into<PathBuf>,
        remote_name: &str,
        remote_dir: &str,
        mode: &str,
    ) -> SshResult {
        let names = [remote_name.to_string()];
        self.copy_files(&[local_path.into()], Some(&names), remote_dir, mode)
            .await
    }

    /// Write `data` to `remote_dir/remote_name` with mode `0600`
    pub async fn copy_bytes(
        &self,
        data: &[u8],
        remote_name: &str,
        remote_dir: &str,
    ) -> SshResult {
        match self.connection() {
            Ok(connection) => {
                transfer::copy_bytes(connection, data, remote_name, remote_dir).await
            }
            Err(e) => SshResult::failure(e),
        }
    }
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.host)
            .field("default_timeout", &self.default_timeout)
            .field("released", &self.is_released())
            .finish()
    }
}
