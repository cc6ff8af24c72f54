//! The boundary between the pool and the driver that opens connections

use async_trait::async_trait;

/// Error type returned by connection hooks.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Opens, probes and closes driver connections on behalf of the pool.
///
/// The pool never looks inside a connection beyond these calls.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;

    /// Probe the connection, typically with a trivial round trip.
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;

    /// Cheap, synchronous test for a connection known to be unusable
    /// (socket closed, protocol desync). Checked on every return.
    fn has_broken(&self, _conn: &Self::Connection) -> bool {
        false
    }

    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// A callback run against a connection at a fixed point of its lifecycle:
/// after connecting (`configure`), before handing out (`check`) or after
/// being returned (`reset`).
///
/// Plain closures work for synchronous hooks:
///
/// ```
/// use connpool::{ConnectionHook, HookError};
///
/// fn assert_hook<C: Send + 'static>(_: impl ConnectionHook<C>) {}
///
/// assert_hook(|conn: &mut Vec<String>| -> Result<(), HookError> {
///     conn.push("SET search_path TO app".into());
///     Ok(())
/// });
/// ```
#[async_trait]
pub trait ConnectionHook<C: Send + 'static>: Send + Sync + 'static {
    async fn call(&self, conn: &mut C) -> Result<(), HookError>;
}

#[async_trait]
impl<C, F> ConnectionHook<C> for F
where
    C: Send + 'static,
    F: Fn(&mut C) -> Result<(), HookError> + Send + Sync + 'static,
{
    async fn call(&self, conn: &mut C) -> Result<(), HookError> {
        self(conn)
    }
}
