//! Core library for fleetssh
//!
//! Remote command execution and file transfer against a fleet of hosts over
//! pooled SSH connections. Every command runs under a deadline, on bounded
//! worker pools, so one unresponsive host cannot stall the caller or exhaust
//! shared capacity.

pub mod config;
pub mod error;
pub mod executor;
pub mod line;
pub mod pool;
pub mod result;
pub mod runner;
#[cfg(feature = "russh")]
pub mod ssh;
pub mod transfer;
pub mod transport;
pub mod worker;

// Re-exports
pub use config::{ExecutorConfig, PoolConfig};
pub use error::{Error, ProcessingError, Result, TransportError};
pub use executor::{SshExecutor, SshSession};
pub use line::{from_fn, BufferingProcessor, FnProcessor, LineProcessor};
pub use pool::{Connector, KeyedPool};
pub use result::SshResult;
pub use runner::SessionRunner;
#[cfg(feature = "russh")]
pub use ssh::{SshConnector, SshSettings};
pub use transport::{Channel, Connection, ConnectionPool, OutputStream, TransferClient, Upload};
pub use worker::{TaskHandle, WorkerPool};
