//! In-memory transport for exercising the executor without a real host

#![allow(dead_code)]

use async_trait::async_trait;
use fleetssh_core::{
    Channel, Connection, ConnectionPool, ExecutorConfig, OutputStream, SshExecutor,
    TransferClient, TransportError, Upload,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the fake host answers one command
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub stdout: String,
    pub stderr: String,
    pub delay: Duration,
}

impl Script {
    pub fn stdout(text: &str) -> Self {
        Self {
            stdout: text.to_string(),
            ..Default::default()
        }
    }

    pub fn stderr(text: &str) -> Self {
        Self {
            stderr: text.to_string(),
            ..Default::default()
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Everything the fake transport observed
#[derive(Default)]
pub struct Counters {
    pub borrowed: AtomicUsize,
    pub released: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<(String, String, Upload)>>,
}

impl Counters {
    pub fn borrowed(&self) -> usize {
        self.borrowed.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Behaviour of the fake host
#[derive(Default)]
pub struct FakeHost {
    pub scripts: HashMap<String, Script>,
    pub open_delay: Duration,
    pub open_error: bool,
    pub transfer_error: bool,
    pub close_delay: Duration,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(mut self, command: &str, script: Script) -> Self {
        self.scripts.insert(command.to_string(), script);
        self
    }
}

pub struct FakeConnection {
    host: String,
    behaviour: Arc<FakeHost>,
    counters: Arc<Counters>,
}

#[async_trait]
impl Connection for FakeConnection {
    fn host(&self) -> &str {
        &self.host
    }

    async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
        tokio::time::sleep(self.behaviour.open_delay).await;
        if self.behaviour.open_error {
            return Err(TransportError::Protocol("channel open refused".to_string()));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeChannel {
            behaviour: self.behaviour.clone(),
            counters: self.counters.clone(),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }))
    }

    async fn transfer_client(&self) -> Result<Box<dyn TransferClient>, TransportError> {
        Ok(Box::new(FakeTransfer {
            fail: self.behaviour.transfer_error,
            counters: self.counters.clone(),
        }))
    }
}

struct FakeChannel {
    behaviour: Arc<FakeHost>,
    counters: Arc<Counters>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[async_trait]
impl Channel for FakeChannel {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.counters.commands.lock().push(command.to_string());
        let script = self
            .behaviour
            .scripts
            .get(command)
            .cloned()
            .unwrap_or_else(|| Script::stderr(&format!("sh: {}: command not found", command)));

        tokio::time::sleep(script.delay).await;
        self.stdout = script.stdout.into_bytes();
        self.stderr = script.stderr.into_bytes();
        Ok(())
    }

    fn stdout(&mut self) -> OutputStream<'_> {
        Box::pin(&self.stdout[..])
    }

    fn stderr(&mut self) -> OutputStream<'_> {
        Box::pin(&self.stderr[..])
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.behaviour.close_delay).await;
        Ok(())
    }
}

struct FakeTransfer {
    fail: bool,
    counters: Arc<Counters>,
}

#[async_trait]
impl TransferClient for FakeTransfer {
    async fn put(
        &mut self,
        uploads: Vec<Upload>,
        remote_dir: &str,
        mode: &str,
    ) -> Result<(), TransportError> {
        if self.fail {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset during transfer",
            )));
        }
        let mut recorded = self.counters.uploads.lock();
        for upload in uploads {
            recorded.push((remote_dir.to_string(), mode.to_string(), upload));
        }
        Ok(())
    }
}

/// Pool lending one fake connection per host and counting borrow/release
pub struct FakePool {
    behaviour: Arc<FakeHost>,
    pub counters: Arc<Counters>,
    pub exhausted: AtomicBool,
}

#[async_trait]
impl ConnectionPool for FakePool {
    async fn borrow(
        &self,
        host: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        if self.exhausted.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout(timeout.as_millis() as u64));
        }
        self.counters.borrowed.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            host: host.to_string(),
            behaviour: self.behaviour.clone(),
            counters: self.counters.clone(),
        }))
    }

    fn release(&self, _host: &str, _connection: Arc<dyn Connection>) {
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Executor wired to a fake host
pub fn executor(host: FakeHost) -> (SshExecutor, Arc<FakePool>) {
    executor_with(host, ExecutorConfig::default())
}

pub fn executor_with(host: FakeHost, config: ExecutorConfig) -> (SshExecutor, Arc<FakePool>) {
    let pool = Arc::new(FakePool {
        behaviour: Arc::new(host),
        counters: Arc::new(Counters::default()),
        exhausted: AtomicBool::new(false),
    });
    let executor = SshExecutor::new(pool.clone(), config).unwrap();
    (executor, pool)
}
