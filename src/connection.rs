//! Connections as the pool tracks them, and the handle borrowers hold

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::factory::ConnectionFactory;
use crate::inner::PoolInner;
use crate::scheduler::jitter_duration;

/// Used when a deadline would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// A live driver connection plus the metadata the pool needs.
#[derive(Debug)]
pub(crate) struct Conn<C> {
    pub raw: C,
    pub id: u64,
    pub created_at: Instant,
    pub returned_at: Instant,
    pub expires_at: Instant,
}

impl<C> Conn<C> {
    /// Wrap a fresh connection; its expiry is `max_lifetime` shortened by
    /// up to 5% so connections opened together do not expire together.
    pub fn new(raw: C, id: u64, max_lifetime: Duration) -> Self {
        let now = Instant::now();
        Self {
            raw,
            id,
            created_at: now,
            returned_at: now,
            expires_at: deadline_after(now, jitter_duration(max_lifetime, -0.05, 0.0)),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.returned_at)
    }

    pub fn touch(&mut self) {
        self.returned_at = Instant::now();
    }
}

/// How a connection came back to the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Assigned to a request that was cancelled before using it
    Unused,
    /// Returned by its borrower
    Returned,
    /// Returned by its borrower, flagged as broken
    Broken,
    /// Rejected by the check hook before being handed out
    FailedCheck,
}

/// A connection borrowed from a pool
///
/// Dereferences to the driver connection. When dropped, on every exit path,
/// the connection goes back to the pool it came from; broken or expired
/// connections are closed and replaced instead of reused.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<Conn<F::Connection>>,
    pool: Arc<PoolInner<F>>,
    borrowed_at: Instant,
    broken: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(pool: Arc<PoolInner<F>>, conn: Conn<F::Connection>) -> Self {
        Self {
            conn: Some(conn),
            pool,
            borrowed_at: Instant::now(),
            broken: false,
        }
    }

    fn meta(&self) -> &Conn<F::Connection> {
        self.conn.as_ref().expect("connection already returned")
    }

    /// Identifier of the connection, unique within its pool
    pub fn id(&self) -> u64 {
        self.meta().id
    }

    pub fn created_at(&self) -> Instant {
        self.meta().created_at
    }

    /// When the pool will stop reusing this connection
    pub fn expires_at(&self) -> Instant {
        self.meta().expires_at
    }

    /// Name of the pool this connection belongs to
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool.id
    }

    /// Flag the connection as unusable; it is closed on return.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Take the driver connection out of the pool for good.
    ///
    /// The pool forgets it and opens a replacement if it falls below its
    /// minimum size.
    pub fn detach(mut self) -> F::Connection {
        let conn = self.conn.take().expect("connection already returned");
        self.pool.record_usage(self.borrowed_at.elapsed());
        self.pool.forget(conn.id);
        conn.raw
    }

    pub(crate) fn discard_failed_check(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.checkin(conn, Outcome::FailedCheck);
        }
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.meta().raw
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn.as_mut().expect("connection already returned").raw
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.record_usage(self.borrowed_at.elapsed());
            let outcome = if self.broken {
                Outcome::Broken
            } else {
                Outcome::Returned
            };
            self.pool.checkin(conn, outcome);
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("id", &self.conn.as_ref().map(|conn| conn.id))
            .field("broken", &self.broken)
            .finish()
    }
}
