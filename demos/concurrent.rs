//! Many tasks sharing a small pool

use async_trait::async_trait;
use connpool::{ConnectionFactory, ConnectionPool, PoolConfiguration, PoolError};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct SlowDriver;

#[async_trait]
impl ConnectionFactory for SlowDriver {
    type Connection = Instant;
    type Error = std::io::Error;

    async fn connect(&self) -> Result<Instant, std::io::Error> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Instant::now())
    }

    async fn is_valid(&self, _conn: &mut Instant) -> Result<(), std::io::Error> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> connpool::PoolResult<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== connpool - Concurrent Access ===\n");

    let config = PoolConfiguration::new()
        .with_name("concurrent")
        .with_min_size(2)
        .with_max_size(4)
        .with_max_waiting(8)
        .with_timeout(Duration::from_secs(2));
    let pool = Arc::new(ConnectionPool::new(SlowDriver, config)?);
    pool.open_and_wait(Duration::from_secs(5)).await?;

    let started = Instant::now();
    let mut handles = vec![];
    for i in 0..16 {
        let pool = Arc::clone(&pool);
        handles.push(tokio::spawn(async move {
            match pool.acquire(None).await {
                Ok(conn) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    println!("   Task {:2} used connection {} at {:?}", i, conn.id(), started.elapsed());
                }
                Err(PoolError::TooManyRequests { max_waiting, .. }) => {
                    println!("   Task {:2} rejected: {} already waiting", i, max_waiting);
                }
                Err(e) => println!("   Task {:2} failed: {}", i, e),
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    let stats = pool.pop_stats();
    println!("\n   Requests: {}", stats.requests_num);
    println!("   Queued: {}", stats.requests_queued);
    println!("   Errors: {}", stats.requests_errors);
    println!("   Waited: {} ms in total", stats.requests_wait_ms);

    #[cfg(feature = "metrics")]
    println!(
        "\n{}",
        connpool::MetricsExporter::export_prometheus(&stats, pool.name(), None)
    );

    pool.close().await;
    Ok(())
}
