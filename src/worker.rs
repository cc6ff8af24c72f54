//! Background workers running the slow connection operations

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex as AsyncMutex;

use crate::connection::{deadline_after, Conn};
use crate::errors::{PoolError, PoolResult};
use crate::factory::ConnectionFactory;
use crate::inner::PoolInner;
use crate::metrics::{Counter, Timer};
use crate::scheduler::jitter_duration;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const DELAY_JITTER: f64 = 0.1;
const DELAY_BACKOFF: u32 = 2;

/// Work queued for the workers
pub(crate) enum Task<C> {
    /// Open a connection for a reserved slot
    Create(Option<ConnectionAttempt>),
    /// Run the reset hook on a returned connection, then put it back
    Return(Conn<C>),
    Close(Conn<C>),
    Stop,
}

/// Backoff state of a slot whose connection keeps failing
#[derive(Debug, Clone)]
pub(crate) struct ConnectionAttempt {
    give_up_at: Instant,
    delay: Duration,
}

impl ConnectionAttempt {
    pub fn new(reconnect_timeout: Duration) -> Self {
        Self {
            give_up_at: deadline_after(Instant::now(), reconnect_timeout),
            delay: Duration::ZERO,
        }
    }

    pub fn time_to_give_up(&self, now: Instant) -> bool {
        now >= self.give_up_at
    }

    /// Delay before the next attempt: jittered at first, then doubling,
    /// never past the give up time.
    pub fn update_delay(&mut self, now: Instant) -> Duration {
        self.delay = if self.delay.is_zero() {
            jitter_duration(INITIAL_DELAY, -DELAY_JITTER, DELAY_JITTER)
        } else {
            self.delay.saturating_mul(DELAY_BACKOFF)
        };
        self.delay = self.delay.min(self.give_up_at.saturating_duration_since(now));
        self.delay
    }
}

pub(crate) async fn run<F: ConnectionFactory>(
    pool: Weak<PoolInner<F>>,
    tasks: Arc<AsyncMutex<UnboundedReceiver<Task<F::Connection>>>>,
) {
    loop {
        let task = tasks.lock().await.recv().await;
        let task = match task {
            None | Some(Task::Stop) => break,
            Some(task) => task,
        };
        let Some(pool) = pool.upgrade() else {
            break;
        };

        match task {
            Task::Create(attempt) => create_connection(&pool, attempt).await,
            Task::Return(conn) => recycle(&pool, conn).await,
            Task::Close(conn) => {
                tracing::debug!(pool = %pool.name, conn = conn.id, "closing connection");
                pool.factory.close(conn.raw).await;
            }
            Task::Stop => break,
        }
    }
    tracing::trace!("worker stopped");
}

async fn create_connection<F: ConnectionFactory>(
    pool: &Arc<PoolInner<F>>,
    attempt: Option<ConnectionAttempt>,
) {
    if !pool.is_open() {
        pool.release_creation();
        return;
    }

    pool.stats.increment(Counter::ConnectionsNum);
    let started = Instant::now();
    let result = connect(pool).await;
    pool.stats.record(Timer::Connections, started.elapsed());

    match result {
        Ok(raw) => {
            let conn = Conn::new(raw, pool.next_conn_id(), pool.config.max_lifetime);
            tracing::debug!(
                pool = %pool.name,
                conn = conn.id,
                elapsed = ?started.elapsed(),
                "connection created"
            );
            if let Some(conn) = pool.deliver_new(conn) {
                pool.factory.close(conn.raw).await;
            }
        }
        Err(err) => {
            pool.stats.increment(Counter::ConnectionsErrors);
            tracing::warn!(pool = %pool.name, error = %err, "error connecting");

            let now = Instant::now();
            let mut attempt =
                attempt.unwrap_or_else(|| ConnectionAttempt::new(pool.config.reconnect_timeout));
            if attempt.time_to_give_up(now) {
                tracing::error!(
                    pool = %pool.name,
                    "reconnection attempt timed out after {:?}",
                    pool.config.reconnect_timeout
                );
                pool.release_creation();
                return;
            }
            let delay = attempt.update_delay(now);
            tracing::debug!(pool = %pool.name, ?delay, "retrying connection");
            pool.retry_create(attempt, delay);
        }
    }
}

async fn connect<F: ConnectionFactory>(pool: &PoolInner<F>) -> PoolResult<F::Connection> {
    let mut raw = pool
        .factory
        .connect()
        .await
        .map_err(|err| PoolError::Connection(err.to_string()))?;

    if let Some(configure) = &pool.hooks.configure {
        if let Err(err) = configure.call(&mut raw).await {
            pool.factory.close(raw).await;
            return Err(PoolError::Connection(format!("configure hook failed: {err}")));
        }
    }
    Ok(raw)
}

async fn recycle<F: ConnectionFactory>(pool: &Arc<PoolInner<F>>, mut conn: Conn<F::Connection>) {
    if let Some(reset) = &pool.hooks.reset {
        if let Err(err) = reset.call(&mut conn.raw).await {
            tracing::warn!(
                pool = %pool.name,
                conn = conn.id,
                error = %err,
                "reset hook failed, discarding connection"
            );
            pool.release_slot();
            pool.factory.close(conn.raw).await;
            return;
        }
    }
    pool.reinstate(conn);
}
