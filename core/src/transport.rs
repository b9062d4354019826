//! Transport capabilities consumed by the executor
//!
//! The executor never speaks SSH itself. It drives these traits, which the
//! [`ssh`](crate::ssh) module implements on top of russh and tests implement
//! in memory.

use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

use crate::TransportError;

/// Boxed byte stream borrowed from a channel
pub type OutputStream<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;

/// An authenticated connection to one host
#[async_trait]
pub trait Connection: Send + Sync {
    /// Host key this connection was created for
    fn host(&self) -> &str;

    /// Open a fresh channel for exactly one command
    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError>;

    /// Create a client for copying files to the host
    async fn transfer_client(&self) -> Result<Box<dyn TransferClient>, TransportError>;

    /// Whether the underlying transport is gone and the connection unusable
    fn is_closed(&self) -> bool {
        false
    }
}

/// Ephemeral command-execution handle
#[async_trait]
pub trait Channel: Send + Sync {
    /// Start `command` on the remote side
    async fn exec(&mut self, command: &str) -> Result<(), TransportError>;

    /// Remote stdout; ends when the command closes it
    fn stdout(&mut self) -> OutputStream<'_>;

    /// Remote stderr
    fn stderr(&mut self) -> OutputStream<'_>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// One file to create on the remote side
#[derive(Debug, Clone)]
pub struct Upload {
    pub remote_name: String,
    pub data: Vec<u8>,
}

/// File transfer capability of a connection
#[async_trait]
pub trait TransferClient: Send {
    /// Create every upload inside `remote_dir` with permission bits `mode`
    /// (four octal digits, e.g. `0744`)
    async fn put(
        &mut self,
        uploads: Vec<Upload>,
        remote_dir: &str,
        mode: &str,
    ) -> Result<(), TransportError>;
}

/// Keyed pool lending connections to callers
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Borrow a connection for `host`, waiting at most `timeout`
    async fn borrow(
        &self,
        host: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>, TransportError>;

    /// Hand a borrowed connection back
    fn release(&self, host: &str, connection: Arc<dyn Connection>);
}
