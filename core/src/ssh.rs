//! SSH transport built on russh
//!
//! [`SshConnector`] authenticates connections for [`KeyedPool`](crate::KeyedPool).
//! Channels stream stdout and stderr as separate byte streams, and file
//! transfer speaks the SCP sink protocol over an exec channel.

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::ChannelMsg;
use russh_keys::key::PublicKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::pool::Connector;
use crate::transport::{Channel, Connection, OutputStream, TransferClient, Upload};
use crate::TransportError;

const STREAM_BUFFER: usize = 64 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// SSH connection settings shared by every host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub username: String,
    pub port: u16,
    /// Private key file; when unset, `password` or the default keys in
    /// `~/.ssh` are tried
    pub private_key_path: Option<String>,
    pub passphrase: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_ms: u64,
    /// Upper bound for one SCP upload
    pub transfer_timeout_ms: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            port: 22,
            private_key_path: None,
            passphrase: None,
            password: None,
            connect_timeout_ms: 30_000,
            transfer_timeout_ms: 60_000,
        }
    }
}

/// Check what SSH keys are available
pub fn list_available_keys() -> Vec<String> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| format!("{}/.ssh/{}", home, name))
        .filter(|path| std::path::Path::new(path).exists())
        .collect()
}

/// Split `host` or `host:port`, falling back to `default_port`
fn split_host(host: &str, default_port: u16) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((addr, port)) if !addr.contains(':') => match port.parse() {
            Ok(port) => (addr.to_string(), port),
            Err(_) => (host.to_string(), default_port),
        },
        _ => (host.to_string(), default_port),
    }
}

struct ClientHandler {
    host: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: verify against known_hosts instead of accepting every key
        debug!(host = %self.host, "Accepting host key");
        Ok(true)
    }
}

/// Opens authenticated russh connections
pub struct SshConnector {
    settings: SshSettings,
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    async fn handshake(&self, host: &str) -> Result<client::Handle<ClientHandler>, TransportError> {
        let (addr, port) = split_host(host, self.settings.port);
        let config = Arc::new(client::Config::default());
        let handler = ClientHandler {
            host: host.to_string(),
        };

        let mut handle = timeout(
            Duration::from_millis(self.settings.connect_timeout_ms),
            client::connect(config, (addr.clone(), port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.settings.connect_timeout_ms))?
        .map_err(|e| TransportError::Connection(format!("{}:{}: {}", addr, port, e)))?;

        self.authenticate(&mut handle).await?;
        Ok(handle)
    }

    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
    ) -> Result<(), TransportError> {
        let username = self.settings.username.clone();

        if let Some(key_path) = &self.settings.private_key_path {
            if self.try_key(handle, key_path).await? {
                return Ok(());
            }
            return Err(TransportError::Authentication(format!(
                "key {} rejected for {}",
                key_path, username
            )));
        }

        if let Some(password) = &self.settings.password {
            let accepted = handle
                .authenticate_password(username.clone(), password)
                .await
                .map_err(|e| TransportError::Authentication(e.to_string()))?;
            if accepted {
                return Ok(());
            }
            return Err(TransportError::Authentication(format!(
                "password rejected for {}",
                username
            )));
        }

        let keys = list_available_keys();
        for key_path in &keys {
            match self.try_key(handle, key_path).await {
                Ok(true) => {
                    info!(key = %key_path, "Authenticated with default key");
                    return Ok(());
                }
                Ok(false) => debug!(key = %key_path, "Key rejected"),
                Err(e) => debug!(key = %key_path, error = %e, "Key unusable"),
            }
        }

        Err(TransportError::Authentication(if keys.is_empty() {
            "no private key or password configured and no default keys found".to_string()
        } else {
            format!("all default keys rejected: {}", keys.join(", "))
        }))
    }

    async fn try_key(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        key_path: &str,
    ) -> Result<bool, TransportError> {
        let key = russh_keys::load_secret_key(key_path, self.settings.passphrase.as_deref())
            .map_err(|e| TransportError::Authentication(format!("load {}: {}", key_path, e)))?;

        handle
            .authenticate_publickey(self.settings.username.clone(), Arc::new(key))
            .await
            .map_err(|e| TransportError::Authentication(e.to_string()))
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>, TransportError> {
        debug!(host, username = %self.settings.username, "Connecting");
        let handle = self.handshake(host).await?;
        info!(host, "SSH connection established");

        Ok(Arc::new(SshConnection {
            host: host.to_string(),
            handle: Arc::new(Mutex::new(handle)),
            transfer_timeout: Duration::from_millis(self.settings.transfer_timeout_ms),
        }))
    }
}

/// One authenticated russh session
pub struct SshConnection {
    host: String,
    handle: Arc<Mutex<client::Handle<ClientHandler>>>,
    transfer_timeout: Duration,
}

impl SshConnection {
    async fn open_session(&self) -> Result<russh::Channel<Msg>, TransportError> {
        self.handle
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Protocol(format!("open channel: {}", e)))
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn host(&self) -> &str {
        &self.host
    }

    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        let channel = self.open_session().await?;
        Ok(Box::new(SshChannel::new(channel)))
    }

    async fn transfer_client(&self) -> Result<Box<dyn TransferClient>, TransportError> {
        Ok(Box::new(ScpClient {
            connection: SshConnection {
                host: self.host.clone(),
                handle: self.handle.clone(),
                transfer_timeout: self.transfer_timeout,
            },
        }))
    }

    fn is_closed(&self) -> bool {
        self.handle
            .try_lock()
            .map(|handle| handle.is_closed())
            .unwrap_or(false)
    }
}

/// Exec channel whose output is pumped into two in-memory pipes
struct SshChannel {
    pending: Option<(russh::Channel<Msg>, DuplexStream, DuplexStream)>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    close_tx: Option<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl SshChannel {
    fn new(channel: russh::Channel<Msg>) -> Self {
        let (stdout, stdout_sink) = tokio::io::duplex(STREAM_BUFFER);
        let (stderr, stderr_sink) = tokio::io::duplex(STREAM_BUFFER);
        Self {
            pending: Some((channel, stdout_sink, stderr_sink)),
            stdout: Some(stdout),
            stderr: Some(stderr),
            close_tx: None,
            pump: None,
        }
    }
}

fn reader(stream: &mut Option<DuplexStream>) -> OutputStream<'_> {
    match stream {
        Some(stream) => Box::pin(stream),
        None => Box::pin(tokio::io::empty()),
    }
}

#[async_trait]
impl Channel for SshChannel {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        let (channel, stdout_sink, stderr_sink) = self
            .pending
            .take()
            .ok_or_else(|| TransportError::Protocol("channel already used".to_string()))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::Protocol(format!("exec: {}", e)))?;

        let (close_tx, close_rx) = oneshot::channel();
        self.close_tx = Some(close_tx);
        self.pump = Some(tokio::spawn(pump(channel, stdout_sink, stderr_sink, close_rx)));
        Ok(())
    }

    fn stdout(&mut self) -> OutputStream<'_> {
        reader(&mut self.stdout)
    }

    fn stderr(&mut self) -> OutputStream<'_> {
        reader(&mut self.stderr)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        // Dropping the readers unblocks a pump stuck on a full pipe.
        self.stdout = None;
        self.stderr = None;

        if let Some((channel, _, _)) = self.pending.take() {
            return channel
                .close()
                .await
                .map_err(|e| TransportError::Protocol(format!("close: {}", e)));
        }

        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        if let Some(mut pump) = self.pump.take() {
            if timeout(CLOSE_TIMEOUT, &mut pump).await.is_err() {
                pump.abort();
                return Err(TransportError::Timeout(CLOSE_TIMEOUT.as_millis() as u64));
            }
        }
        Ok(())
    }
}

/// Route channel messages into the stdout and stderr pipes until the remote
/// side finishes, then wait for the close request
async fn pump(
    mut channel: russh::Channel<Msg>,
    mut stdout: DuplexStream,
    stderr: DuplexStream,
    mut close_rx: oneshot::Receiver<()>,
) {
    let (stderr_tx, stderr_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let forwarder = tokio::spawn(forward(stderr_rx, stderr));
    let mut close_requested = false;

    loop {
        tokio::select! {
            _ = &mut close_rx => {
                close_requested = true;
                break;
            }
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if let Err(e) = stdout.write_all(&data).await {
                        debug!(error = %e, "stdout reader gone");
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                    let _ = stderr_tx.send(data.to_vec());
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "Remote command exited");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    }

    drop(stdout);
    drop(stderr_tx);
    let _ = forwarder.await;

    if !close_requested {
        let _ = close_rx.await;
    }
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Channel already closed");
    }
}

async fn forward(mut chunks: mpsc::UnboundedReceiver<Vec<u8>>, mut sink: DuplexStream) {
    while let Some(chunk) = chunks.recv().await {
        if sink.write_all(&chunk).await.is_err() {
            break;
        }
    }
}

/// SCP sink client (`scp -t`) over an exec channel
struct ScpClient {
    connection: SshConnection,
}

#[async_trait]
impl TransferClient for ScpClient {
    async fn put(
        &mut self,
        uploads: Vec<Upload>,
        remote_dir: &str,
        mode: &str,
    ) -> Result<(), TransportError> {
        crate::transfer::validate_mode(mode)?;
        for upload in &uploads {
            if upload.remote_name.is_empty() || upload.remote_name.contains(['\n', '/']) {
                return Err(TransportError::InvalidArgument(format!(
                    "invalid remote file name '{}'",
                    upload.remote_name
                )));
            }
        }

        let limit = self.connection.transfer_timeout;
        timeout(limit, self.send(uploads, remote_dir, mode))
            .await
            .map_err(|_| TransportError::Timeout(limit.as_millis() as u64))?
    }
}

impl ScpClient {
    async fn send(
        &self,
        uploads: Vec<Upload>,
        remote_dir: &str,
        mode: &str,
    ) -> Result<(), TransportError> {
        let target = if remote_dir.is_empty() { "." } else { remote_dir };
        let mut channel = self.connection.open_session().await?;
        channel
            .exec(true, format!("scp -t -d \"{}\"", target))
            .await
            .map_err(|e| TransportError::Protocol(format!("exec scp: {}", e)))?;

        let result = async {
            let mut acks = AckReader::default();
            acks.expect_ok(&mut channel).await?;

            for upload in &uploads {
                let header = format!("C{} {} {}\n", mode, upload.data.len(), upload.remote_name);
                send_data(&channel, header.as_bytes()).await?;
                acks.expect_ok(&mut channel).await?;

                send_data(&channel, &upload.data).await?;
                send_data(&channel, &[0u8]).await?;
                acks.expect_ok(&mut channel).await?;
                debug!(
                    host = %self.connection.host,
                    file = %upload.remote_name,
                    bytes = upload.data.len(),
                    "Uploaded file"
                );
            }
            Ok(())
        }
        .await;

        if let Err(e) = channel.eof().await {
            debug!(error = %e, "Failed to send eof to scp");
        }
        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close scp channel");
        }
        result
    }
}

async fn send_data(channel: &russh::Channel<Msg>, data: &[u8]) -> Result<(), TransportError> {
    channel
        .data(data)
        .await
        .map_err(|e| TransportError::Protocol(format!("send: {}", e)))
}

/// Reads SCP acknowledgements: `0` is OK, `1`/`2` carry a message line
#[derive(Default)]
struct AckReader {
    buffer: Vec<u8>,
    stderr: Vec<u8>,
}

impl AckReader {
    async fn expect_ok(&mut self, channel: &mut russh::Channel<Msg>) -> Result<(), TransportError> {
        match self.next_byte(channel).await? {
            0 => Ok(()),
            1 | 2 => {
                let mut message = Vec::new();
                loop {
                    match self.next_byte(channel).await? {
                        b'\n' => break,
                        byte => message.push(byte),
                    }
                }
                Err(TransportError::Rejected(
                    String::from_utf8_lossy(&message).into_owned(),
                ))
            }
            other => Err(TransportError::Protocol(format!(
                "unexpected scp response byte {}",
                other
            ))),
        }
    }

    async fn next_byte(&mut self, channel: &mut russh::Channel<Msg>) -> Result<u8, TransportError> {
        while self.buffer.is_empty() {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => self.buffer.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => self.stderr.extend_from_slice(&data),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    let detail = String::from_utf8_lossy(&self.stderr).trim().to_string();
                    return Err(TransportError::Rejected(if detail.is_empty() {
                        "remote scp ended unexpectedly".to_string()
                    } else {
                        detail
                    }));
                }
                Some(_) => {}
            }
        }
        Ok(self.buffer.remove(0))
    }
}
