//! Keyed connection pool
//!
//! Lends at most `max_per_host` connections per host at once and keeps up to
//! `max_idle_per_host` returned connections for reuse. New connections come
//! from a [`Connector`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::transport::{Connection, ConnectionPool};
use crate::{PoolConfig, TransportError};

/// Creates authenticated connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

struct HostSlot {
    lendable: Semaphore,
    idle: Mutex<Vec<Arc<dyn Connection>>>,
}

/// [`ConnectionPool`] keyed by host address
pub struct KeyedPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    hosts: Mutex<HashMap<String, Arc<HostSlot>>>,
}

impl KeyedPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, host: &str) -> Arc<HostSlot> {
        self.hosts
            .lock()
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostSlot {
                    lendable: Semaphore::new(self.config.max_per_host.max(1)),
                    idle: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Idle connections kept for `host`
    pub fn idle_count(&self, host: &str) -> usize {
        self.hosts
            .lock()
            .get(host)
            .map(|slot| slot.idle.lock().len())
            .unwrap_or(0)
    }

    /// Connections currently lent out for `host`
    pub fn borrowed_count(&self, host: &str) -> usize {
        self.hosts
            .lock()
            .get(host)
            .map(|slot| self.config.max_per_host.max(1) - slot.lendable.available_permits())
            .unwrap_or(0)
    }

    /// Drop every idle connection
    pub fn clear(&self) {
        let hosts = self.hosts.lock();
        for (host, slot) in hosts.iter() {
            let dropped = std::mem::take(&mut *slot.idle.lock()).len();
            if dropped > 0 {
                info!(host = %host, dropped, "Dropped idle connections");
            }
        }
    }
}

#[async_trait]
impl ConnectionPool for KeyedPool {
    async fn borrow(
        &self,
        host: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let deadline = Instant::now() + timeout;
        let slot = self.slot(host);

        // The permit goes back on every early exit, including cancellation,
        // and is only forgotten once a connection is handed out.
        let permit = match timeout_at(deadline, slot.lendable.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(TransportError::Connection("pool closed".to_string()));
            }
            Err(_) => {
                warn!(host, max_per_host = self.config.max_per_host, "Pool exhausted");
                return Err(TransportError::Timeout(timeout.as_millis() as u64));
            }
        };

        loop {
            let idle = slot.idle.lock().pop();
            match idle {
                Some(connection) if connection.is_closed() => {
                    debug!(host, "Discarding closed idle connection");
                }
                Some(connection) => {
                    permit.forget();
                    return Ok(connection);
                }
                None => break,
            }
        }

        let connection = match timeout_at(deadline, self.connector.connect(host)).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(timeout.as_millis() as u64)),
        };
        permit.forget();
        Ok(connection)
    }

    fn release(&self, host: &str, connection: Arc<dyn Connection>) {
        let Some(slot) = self.hosts.lock().get(host).cloned() else {
            warn!(host, "Released connection for unknown host");
            return;
        };

        if connection.is_closed() {
            debug!(host, "Dropping closed connection");
        } else {
            let mut idle = slot.idle.lock();
            if idle.len() < self.config.max_idle_per_host {
                idle.push(connection);
            }
        }
        slot.lendable.add_permits(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Channel, TransferClient};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct StubConnection {
        host: String,
        closed: AtomicBool,
    }

    #[async_trait]
    impl Connection for StubConnection {
        fn host(&self) -> &str {
            &self.host
        }

        async fn open_channel(&self) -> Result<Box<dyn Channel>, TransportError> {
            Err(TransportError::Protocol("stub".to_string()))
        }

        async fn transfer_client(&self) -> Result<Box<dyn TransferClient>, TransportError> {
            Err(TransportError::Protocol("stub".to_string()))
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingConnector {
        connects: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>, TransportError> {
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Connection("refused".to_string()));
            }
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubConnection {
                host: host.to_string(),
                closed: AtomicBool::new(false),
            }))
        }
    }

    fn pool(max_per_host: usize) -> (Arc<CountingConnector>, KeyedPool) {
        let connector = Arc::new(CountingConnector::default());
        let pool = KeyedPool::new(
            connector.clone(),
            PoolConfig {
                max_per_host,
                max_idle_per_host: 2,
            },
        );
        (connector, pool)
    }

    #[tokio::test]
    async fn test_reuses_released_connection() {
        let (connector, pool) = pool(2);
        let first = pool.borrow("broker-a", Duration::from_secs(1)).await.unwrap();
        pool.release("broker-a", first);
        assert_eq!(pool.idle_count("broker-a"), 1);

        let _again = pool.borrow("broker-a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.borrowed_count("broker-a"), 1);
    }

    #[tokio::test]
    async fn test_borrow_times_out_when_exhausted() {
        let (_connector, pool) = pool(1);
        let _held = pool.borrow("broker-a", Duration::from_secs(1)).await.unwrap();

        let started = std::time::Instant::now();
        let err = pool
            .borrow("broker-a", Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Timeout(50)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_hosts_are_independent() {
        let (_connector, pool) = pool(1);
        let _a = pool.borrow("broker-a", Duration::from_secs(1)).await.unwrap();
        assert!(pool.borrow("broker-b", Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_kept() {
        let (connector, pool) = pool(1);
        let connection = pool.borrow("broker-a", Duration::from_secs(1)).await.unwrap();
        pool.release(
            "broker-a",
            Arc::new(StubConnection {
                host: connection.host().to_string(),
                closed: AtomicBool::new(true),
            }),
        );

        assert_eq!(pool.idle_count("broker-a"), 0);
        let _fresh = pool.borrow("broker-a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_returns_capacity() {
        let (connector, pool) = pool(1);
        connector.fail.store(true, Ordering::SeqCst);
        assert!(pool.borrow("broker-a", Duration::from_secs(1)).await.is_err());

        connector.fail.store(false, Ordering::SeqCst);
        assert!(pool.borrow("broker-a", Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_borrow_returns_capacity() {
        let connector = Arc::new(CountingConnector {
            delay: Duration::from_millis(500),
            ..Default::default()
        });
        let pool = KeyedPool::new(
            connector.clone(),
            PoolConfig {
                max_per_host: 1,
                max_idle_per_host: 1,
            },
        );

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            pool.borrow("broker-a", Duration::from_secs(5)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(pool.borrowed_count("broker-a"), 0);

        assert!(pool.borrow("broker-a", Duration::from_secs(2)).await.is_ok());
        assert_eq!(pool.borrowed_count("broker-a"), 1);
    }
}
