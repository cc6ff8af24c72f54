//! # connpool
//!
//! Async database connection pool for tokio, driver agnostic.
//!
//! ## Features
//!
//! - Connections opened by background workers, up to `min_size` eagerly
//!   and `max_size` on demand
//! - FIFO waiting queue with per-request timeouts and admission control
//! - Automatic return of connections via RAII (Drop trait)
//! - Configure, check and reset hooks
//! - Jittered connection lifetime, idle shrinking and reconnection backoff
//! - Statistics with Prometheus export
//! - Non-retaining ("null") pool variant
//!
//! ## Quick Start
//!
//! ```rust
//! use connpool::{ConnectionFactory, ConnectionPool, PoolConfiguration};
//! use std::time::Duration;
//!
//! struct Driver;
//!
//! #[async_trait::async_trait]
//! impl ConnectionFactory for Driver {
//!     type Connection = Vec<String>;
//!     type Error = std::io::Error;
//!
//!     async fn connect(&self) -> Result<Self::Connection, Self::Error> {
//!         Ok(Vec::new())
//!     }
//!
//!     async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), Self::Error> {
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> connpool::PoolResult<()> {
//! let pool = ConnectionPool::new(Driver, PoolConfiguration::new().with_min_size(2))?;
//! pool.open_and_wait(Duration::from_secs(5)).await?;
//! {
//!     let mut conn = pool.acquire(None).await?;
//!     conn.push("SELECT 1".to_string());
//!     // Connection automatically returned when `conn` goes out of scope
//! }
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod errors;
mod eviction;
mod factory;
mod inner;
mod metrics;
mod pool;
mod queue;
mod scheduler;
mod worker;

pub use config::PoolConfiguration;
pub use connection::PooledConnection;
pub use errors::{ClosedReason, PoolError, PoolResult};
pub use factory::{ConnectionFactory, ConnectionHook, HookError};
pub use inner::PoolState;
#[cfg(feature = "metrics")]
pub use metrics::MetricsExporter;
pub use metrics::PoolStats;
pub use pool::{ConnectionPool, PoolBuilder};
pub use scheduler::{jitter, jitter_duration};
