//! Basic usage examples for ConnectionPool

use async_trait::async_trait;
use connpool::{ConnectionFactory, ConnectionPool, HookError, PoolConfiguration};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// A stand-in driver: each connection records the statements sent to it
#[derive(Default)]
struct FakeDriver {
    opened: AtomicU32,
}

struct FakeConnection {
    id: u32,
    statements: Vec<String>,
}

impl FakeConnection {
    fn execute(&mut self, sql: &str) {
        self.statements.push(sql.to_string());
    }
}

#[async_trait]
impl ConnectionFactory for FakeDriver {
    type Connection = FakeConnection;
    type Error = std::io::Error;

    async fn connect(&self) -> Result<FakeConnection, std::io::Error> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(FakeConnection {
            id,
            statements: Vec::new(),
        })
    }

    async fn is_valid(&self, conn: &mut FakeConnection) -> Result<(), std::io::Error> {
        conn.execute("SELECT 1");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> connpool::PoolResult<()> {
    println!("=== connpool - Basic Examples ===\n");

    // Example 1: Simple pool
    simple_pool().await?;

    // Example 2: Hooks
    hooks().await?;

    // Example 3: Try methods and timeouts
    try_methods().await?;

    Ok(())
}

async fn simple_pool() -> connpool::PoolResult<()> {
    println!("1. Simple Pool:");
    let config = PoolConfiguration::new().with_name("simple").with_min_size(2);
    let pool = ConnectionPool::new(FakeDriver::default(), config)?;
    pool.open_and_wait(Duration::from_secs(5)).await?;

    {
        let mut conn = pool.acquire(None).await?;
        conn.execute("SELECT now()");
        println!("   Got connection {}", conn.id);
        // Connection automatically returned when dropped
    }

    let stats = pool.get_stats();
    println!("   Pool size: {}, available: {}\n", stats.pool_size, stats.pool_available);
    pool.close().await;
    Ok(())
}

async fn hooks() -> connpool::PoolResult<()> {
    println!("2. Hooks:");
    let pool = ConnectionPool::builder(FakeDriver::default())
        .config(PoolConfiguration::new().with_min_size(1).with_max_size(4))
        .configure(|conn: &mut FakeConnection| -> Result<(), HookError> {
            conn.execute("SET application_name = 'demo'");
            Ok(())
        })
        .reset(|conn: &mut FakeConnection| -> Result<(), HookError> {
            conn.execute("DISCARD ALL");
            Ok(())
        })
        .build()?;
    pool.open_and_wait(Duration::from_secs(5)).await?;

    {
        let mut conn = pool.acquire(None).await?;
        conn.execute("INSERT INTO events DEFAULT VALUES");
    }
    let conn = pool.acquire(None).await?;
    println!("   Statements seen by connection {}: {:?}\n", conn.id, conn.statements);
    drop(conn);

    pool.close().await;
    Ok(())
}

async fn try_methods() -> connpool::PoolResult<()> {
    println!("3. Try Methods:");
    let config = PoolConfiguration::new().with_min_size(1).with_max_size(1);
    let pool = ConnectionPool::new(FakeDriver::default(), config)?;
    pool.open_and_wait(Duration::from_secs(5)).await?;

    let held = pool.try_acquire().await?;
    println!("   First try_acquire: {}", held.is_some());
    println!("   Second try_acquire: {}", pool.try_acquire().await?.is_some());

    match pool.acquire(Some(Duration::from_millis(100))).await {
        Ok(_) => println!("   Got connection"),
        Err(e) => println!("   Error: {}", e),
    }

    drop(held);
    pool.close().await;
    println!();
    Ok(())
}
