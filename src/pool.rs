//! The connection pool

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::PoolConfiguration;
use crate::connection::PooledConnection;
use crate::errors::{ClosedReason, PoolError, PoolResult};
use crate::factory::{ConnectionFactory, ConnectionHook};
use crate::inner::{Hooks, PoolInner, PoolState, Readiness};
use crate::metrics::PoolStats;

const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A pool of database connections
///
/// Connections are opened by background workers up to `min_size` and on
/// demand up to `max_size`. Borrowers blocked on a full pool are served in
/// arrival order.
///
/// # Examples
///
/// ```no_run
/// # use connpool::{ConnectionFactory, ConnectionPool, PoolConfiguration};
/// # struct Driver;
/// # #[async_trait::async_trait]
/// # impl ConnectionFactory for Driver {
/// #     type Connection = String;
/// #     type Error = std::io::Error;
/// #     async fn connect(&self) -> Result<String, std::io::Error> { Ok(String::new()) }
/// #     async fn is_valid(&self, _: &mut String) -> Result<(), std::io::Error> { Ok(()) }
/// # }
/// # async fn run() -> connpool::PoolResult<()> {
/// let pool = ConnectionPool::builder(Driver)
///     .config(PoolConfiguration::new().with_min_size(2).with_max_size(8))
///     .build()?;
/// pool.open_and_wait(std::time::Duration::from_secs(10)).await?;
///
/// {
///     let conn = pool.acquire(None).await?;
///     println!("using connection {}", conn.id());
///     // returned to the pool when dropped
/// }
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn builder(factory: F) -> PoolBuilder<F> {
        PoolBuilder::new(factory)
    }

    /// Build a pool with the given configuration and no hooks
    pub fn new(factory: F, config: PoolConfiguration) -> PoolResult<Self> {
        Self::builder(factory).config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    pub fn state(&self) -> PoolState {
        self.inner.lifecycle()
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), PoolState::Closing | PoolState::Closed)
    }

    /// Start the workers and the maintenance tasks, and begin filling the
    /// pool. Opening an open pool does nothing; a closed pool cannot be
    /// reopened. A caller racing another `open()` returns once the pool is
    /// open.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self) -> PoolResult<()> {
        self.inner.open()
    }

    /// Open the pool and wait for `min_size` connections
    pub async fn open_and_wait(&self, timeout: Duration) -> PoolResult<()> {
        self.open()?;
        self.wait(Some(timeout)).await
    }

    /// Wait until the pool holds `min_size` connections.
    ///
    /// This holds after the first fill too: a pool that lost connections
    /// waits for their replacements.
    ///
    /// If they are not ready within the timeout (default 30 seconds) the
    /// pool is closed and a timeout error returned.
    pub async fn wait(&self, timeout: Option<Duration>) -> PoolResult<()> {
        self.ensure_open()?;
        if self.state() == PoolState::New {
            return Err(PoolError::PoolClosed {
                name: self.name().to_string(),
                reason: ClosedReason::NotOpenYet,
            });
        }
        let timeout = timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT);
        let mut readiness = self.inner.readiness();
        let started = std::time::Instant::now();

        let waited = tokio::time::timeout(timeout, async {
            readiness
                .wait_for(|readiness| *readiness != Readiness::Filling)
                .await
                .map(|readiness| *readiness)
        })
        .await;

        match waited {
            Ok(Ok(Readiness::Filled)) => Ok(()),
            Ok(_) => Err(PoolError::PoolClosed {
                name: self.name().to_string(),
                reason: ClosedReason::AlreadyClosed,
            }),
            Err(_) => {
                tracing::warn!(
                    pool = %self.name(),
                    "pool not filled within {:?}, closing",
                    timeout
                );
                self.close().await;
                Err(PoolError::Timeout {
                    name: self.name().to_string(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Close the pool, waiting up to 5 seconds for the background to stop
    pub async fn close(&self) {
        self.close_with_timeout(DEFAULT_CLOSE_TIMEOUT).await;
    }

    /// Close the pool: fail the waiting requests, close the idle
    /// connections and stop the workers and the scheduler.
    ///
    /// Borrowed connections are closed when returned. Closing a closed pool
    /// does nothing.
    pub async fn close_with_timeout(&self, timeout: Duration) {
        if let Some(shutdown) = self.inner.begin_close() {
            self.inner.finish_close(shutdown, timeout).await;
        }
    }

    /// Borrow a connection, waiting up to `timeout` (the configured
    /// timeout when `None`) if none is available.
    pub async fn acquire(&self, timeout: Option<Duration>) -> PoolResult<PooledConnection<F>> {
        self.ensure_open()?;
        let timeout = timeout.unwrap_or(self.inner.config.timeout);
        self.inner.acquire(timeout).await
    }

    /// Borrow an idle connection if there is one, without waiting
    pub async fn try_acquire(&self) -> PoolResult<Option<PooledConnection<F>>> {
        self.ensure_open()?;
        self.inner.try_acquire().await
    }

    /// Return a connection to the pool.
    ///
    /// Dropping the connection has the same effect; this form reports a
    /// connection handed to the wrong pool. Such a connection still goes
    /// back to the pool it came from.
    pub fn release(&self, conn: PooledConnection<F>) -> PoolResult<()> {
        if conn.pool_id() != self.inner.id {
            tracing::warn!(
                pool = %self.name(),
                owner = %conn.pool_name(),
                conn = conn.id(),
                "connection released to the wrong pool"
            );
            return Err(PoolError::ForeignConnection {
                name: self.name().to_string(),
            });
        }
        drop(conn);
        Ok(())
    }

    /// Probe every idle connection, closing and replacing the broken ones
    pub async fn check(&self) -> PoolResult<()> {
        self.inner.check().await
    }

    /// Change the pool bounds; a `None` maximum follows `min_size`.
    pub fn resize(&self, min_size: usize, max_size: Option<usize>) -> PoolResult<()> {
        self.inner.resize(min_size, max_size)
    }

    /// Current statistics
    pub fn get_stats(&self) -> PoolStats {
        self.inner.get_stats()
    }

    /// Current statistics, resetting the counters
    pub fn pop_stats(&self) -> PoolStats {
        self.inner.pop_stats()
    }

    /// Probe a connection the way `check()` does, outside any pool
    pub async fn check_connection(factory: &F, conn: &mut F::Connection) -> PoolResult<()> {
        factory
            .is_valid(conn)
            .await
            .map_err(|err| PoolError::Connection(err.to_string()))
    }

    /// Open a pool used before `open()`, unless it was configured to
    /// require an explicit open.
    fn ensure_open(&self) -> PoolResult<()> {
        if self.state() != PoolState::New || self.inner.config.open.is_some() {
            return Ok(());
        }
        tracing::warn!(
            pool = %self.name(),
            "opening the pool implicitly on first use is deprecated; call open() explicitly"
        );
        self.open()
    }
}

impl<F: ConnectionFactory> Drop for ConnectionPool<F> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl<F: ConnectionFactory> fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`ConnectionPool`]
pub struct PoolBuilder<F: ConnectionFactory> {
    factory: F,
    config: PoolConfiguration,
    hooks: Hooks<F::Connection>,
}

impl<F: ConnectionFactory> PoolBuilder<F> {
    fn new(factory: F) -> Self {
        Self {
            factory,
            config: PoolConfiguration::default(),
            hooks: Hooks::default(),
        }
    }

    pub fn config(mut self, config: PoolConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Run on every new connection before it enters the pool. A failure
    /// discards the connection and retries with backoff.
    pub fn configure(mut self, hook: impl ConnectionHook<F::Connection>) -> Self {
        self.hooks.configure = Some(Arc::new(hook));
        self
    }

    /// Run before handing out a connection. A failure discards the
    /// connection and the acquire tries another one.
    pub fn check(mut self, hook: impl ConnectionHook<F::Connection>) -> Self {
        self.hooks.check = Some(Arc::new(hook));
        self
    }

    /// Run on a returned connection before it is reused
    pub fn reset(mut self, hook: impl ConnectionHook<F::Connection>) -> Self {
        self.hooks.reset = Some(Arc::new(hook));
        self
    }

    /// Validate the configuration and create the pool, opening it if the
    /// configuration asks to
    pub fn build(self) -> PoolResult<ConnectionPool<F>> {
        self.config.validate()?;
        let open = self.config.open == Some(true);
        let pool = ConnectionPool {
            inner: Arc::new(PoolInner::new(self.config, self.factory, self.hooks)),
        };
        if open {
            pool.open()?;
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        opened: AtomicU32,
        closed: Arc<AtomicU32>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("refused")]
    struct Refused;

    #[async_trait]
    impl ConnectionFactory for Counting {
        type Connection = u32;
        type Error = Refused;

        async fn connect(&self) -> Result<u32, Refused> {
            Ok(self.opened.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn is_valid(&self, conn: &mut u32) -> Result<(), Refused> {
            if *conn % 2 == 0 { Err(Refused) } else { Ok(()) }
        }

        async fn close(&self, _conn: u32) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(min: usize, max: usize) -> PoolConfiguration {
        PoolConfiguration::new()
            .with_min_size(min)
            .with_max_size(max)
            .with_open(false)
            .with_timeout(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_open_fills_to_min_size() {
        let pool = ConnectionPool::new(Counting::default(), config(3, 5)).unwrap();
        assert_eq!(pool.state(), PoolState::New);

        pool.open_and_wait(Duration::from_secs(2)).await.unwrap();
        let stats = pool.get_stats();
        assert_eq!(stats.pool_size, 3);
        assert_eq!(stats.pool_available, 3);
        assert_eq!(stats.connections_num, 3);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_idle_reuse_is_lifo() {
        let pool = ConnectionPool::new(Counting::default(), config(2, 2)).unwrap();
        pool.open_and_wait(Duration::from_secs(2)).await.unwrap();

        let first = pool.acquire(None).await.unwrap();
        let id = first.id();
        drop(first);
        let again = pool.acquire(None).await.unwrap();
        assert_eq!(again.id(), id);
        drop(again);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_counts_balance_after_acquire_and_release() {
        let pool = ConnectionPool::new(Counting::default(), config(2, 4)).unwrap();
        pool.open_and_wait(Duration::from_secs(2)).await.unwrap();

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        let c = pool.acquire(None).await.unwrap();
        let (idle, borrowed, size) = pool.inner.counts();
        assert_eq!(idle + borrowed, size);
        assert_eq!(borrowed, 3);

        drop(a);
        pool.release(b).unwrap();
        let (idle, borrowed, size) = pool.inner.counts();
        assert_eq!(idle + borrowed, size);
        assert_eq!(borrowed, 1);
        drop(c);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_detach_replaces_connection() {
        let pool = ConnectionPool::new(Counting::default(), config(1, 1)).unwrap();
        pool.open_and_wait(Duration::from_secs(2)).await.unwrap();

        let conn = pool.acquire(None).await.unwrap();
        let raw = conn.detach();
        assert_eq!(raw, 1);

        // a replacement is created for the detached slot
        let conn = pool.acquire(None).await.unwrap();
        assert_eq!(*conn, 2);
        drop(conn);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_check_discards_failing_connections() {
        let pool = ConnectionPool::new(Counting::default(), config(4, 4)).unwrap();
        pool.open_and_wait(Duration::from_secs(2)).await.unwrap();

        // connections 2 and 4 fail the probe
        pool.check().await.unwrap();
        let stats = pool.get_stats();
        assert_eq!(stats.connections_lost, 2);

        pool.wait(Some(Duration::from_secs(2))).await.unwrap();
        let stats = pool.get_stats();
        assert_eq!(stats.pool_size, 4);
        assert_eq!(stats.pool_available, 4);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_resize_closes_excess_idle() {
        let pool = ConnectionPool::new(Counting::default(), config(4, 4)).unwrap();
        pool.open_and_wait(Duration::from_secs(2)).await.unwrap();

        pool.resize(1, Some(2)).unwrap();
        let stats = pool.get_stats();
        assert_eq!(stats.pool_size, 2);
        assert_eq!(stats.pool_min, 1);
        assert_eq!(stats.pool_max, 2);

        assert!(pool.resize(3, Some(2)).is_err());
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_background() {
        let factory = Counting::default();
        let closed = Arc::clone(&factory.closed);
        let pool = ConnectionPool::new(factory, config(2, 2)).unwrap();
        pool.open_and_wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(pool.inner.live_workers(), 3);
        assert!(pool.inner.scheduler().is_some());

        pool.close().await;
        assert_eq!(pool.state(), PoolState::Closed);
        assert_eq!(pool.inner.live_workers(), 0);
        assert!(pool.inner.scheduler().is_none());
        assert_eq!(closed.load(Ordering::SeqCst), 2);

        // idempotent
        pool.close().await;
        assert_eq!(pool.state(), PoolState::Closed);
    }

    #[tokio::test]
    async fn test_close_cancels_maintenance() {
        let pool = ConnectionPool::new(Counting::default(), config(1, 1)).unwrap();
        pool.open_and_wait(Duration::from_secs(2)).await.unwrap();
        let scheduler = pool.inner.scheduler().unwrap();
        // shrink and lifetime sweep
        assert_eq!(scheduler.len(), 2);

        pool.close().await;
        assert_eq!(scheduler.len(), 0);
    }

    async fn workers_stopped(pool: &ConnectionPool<Counting>) -> bool {
        for _ in 0..100 {
            if pool.inner.live_workers() == 0 && pool.inner.scheduler().is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_while_opening_stays_closed() {
        for _ in 0..200 {
            let pool = Arc::new(ConnectionPool::new(Counting::default(), config(1, 1)).unwrap());
            let opener = {
                let pool = Arc::clone(&pool);
                tokio::task::spawn_blocking(move || pool.open())
            };
            let closer = {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    while pool.state() == PoolState::New {
                        tokio::task::yield_now().await;
                    }
                    pool.close().await;
                })
            };

            let opened = opener.await.unwrap();
            closer.await.unwrap();
            if let Err(err) = opened {
                assert!(matches!(
                    err,
                    PoolError::PoolClosed {
                        reason: ClosedReason::AlreadyClosed,
                        ..
                    }
                ));
            }
            assert_eq!(pool.state(), PoolState::Closed);
            assert!(workers_stopped(&pool).await);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_open_returns_open_pool() {
        for _ in 0..100 {
            let pool = Arc::new(ConnectionPool::new(Counting::default(), config(1, 1)).unwrap());
            let openers: Vec<_> = (0..2)
                .map(|_| {
                    let pool = Arc::clone(&pool);
                    tokio::task::spawn_blocking(move || pool.open().map(|()| pool.state()))
                })
                .collect();
            for opener in openers {
                assert_eq!(opener.await.unwrap().unwrap(), PoolState::Open);
            }
            pool.close().await;
        }
    }

    #[tokio::test]
    async fn test_connection_returned_after_close_is_closed() {
        let factory = Counting::default();
        let closed = Arc::clone(&factory.closed);
        let pool = ConnectionPool::new(factory, config(1, 1)).unwrap();
        pool.open_and_wait(Duration::from_secs(2)).await.unwrap();

        let conn = pool.acquire(None).await.unwrap();
        pool.close().await;
        drop(conn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.get_stats().pool_size, 0);
    }

    #[tokio::test]
    async fn test_check_connection_without_pool() {
        let factory = Counting::default();
        assert!(ConnectionPool::check_connection(&factory, &mut 1).await.is_ok());
        let err = ConnectionPool::check_connection(&factory, &mut 2).await.unwrap_err();
        assert!(matches!(err, PoolError::Connection(_)));
    }

    #[test]
    fn test_open_outside_runtime_fails() {
        let pool = ConnectionPool::new(Counting::default(), config(1, 1)).unwrap();
        let err = pool.open().unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
        assert_eq!(pool.state(), PoolState::New);
    }

    #[test]
    fn test_invalid_configuration_rejected_at_build() {
        let result = ConnectionPool::new(Counting::default(), config(3, 1));
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }
}
