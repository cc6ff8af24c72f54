//! Shared fixtures: an in-memory driver and log capture
#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use connpool::{ConnectionFactory, ConnectionPool, PoolConfiguration};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug)]
pub struct MockConnection {
    pub id: u64,
    pub alive: bool,
    pub log: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum MockError {
    #[error("connection refused")]
    Refused,
    #[error("connection {0} is dead")]
    Dead(u64),
}

#[derive(Default)]
pub struct MockState {
    pub opened: AtomicU64,
    pub closed: AtomicU64,
    pub refuse: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MockFactory {
    pub state: Arc<MockState>,
    pub connect_delay: Duration,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_delay(delay: Duration) -> Self {
        Self {
            connect_delay: delay,
            ..Self::default()
        }
    }

    pub fn opened(&self) -> u64 {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;
    type Error = MockError;

    async fn connect(&self) -> Result<MockConnection, MockError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(MockError::Refused);
        }
        let id = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockConnection {
            id,
            alive: true,
            log: Vec::new(),
        })
    }

    async fn is_valid(&self, conn: &mut MockConnection) -> Result<(), MockError> {
        if conn.alive {
            Ok(())
        } else {
            Err(MockError::Dead(conn.id))
        }
    }

    fn has_broken(&self, conn: &MockConnection) -> bool {
        !conn.alive
    }

    async fn close(&self, _conn: MockConnection) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Configuration for tests: explicit open, short timeout
pub fn config(min_size: usize, max_size: usize) -> PoolConfiguration {
    PoolConfiguration::new()
        .with_min_size(min_size)
        .with_max_size(max_size)
        .with_timeout(Duration::from_secs(5))
        .with_open(false)
}

pub async fn open_pool(factory: MockFactory, config: PoolConfiguration) -> ConnectionPool<MockFactory> {
    let pool = ConnectionPool::new(factory, config).unwrap();
    pool.open_and_wait(Duration::from_secs(5)).await.unwrap();
    pool
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Log output captured from the current thread
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Route this thread's log records into a buffer. Pair with a current
/// thread runtime so worker tasks log on the same thread.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}
