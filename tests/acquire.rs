mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{config, eventually, open_pool, MockFactory};
use connpool::PoolError;

#[tokio::test]
async fn test_saturated_pool_serves_in_pairs() {
    let pool = Arc::new(open_pool(MockFactory::new(), config(2, 2)).await);
    let started = Instant::now();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let conn = pool.acquire(None).await.unwrap();
                tokio::time::sleep(Duration::from_millis(200)).await;
                drop(conn);
                started.elapsed()
            })
        })
        .collect();

    let mut finished = Vec::new();
    for handle in handles {
        finished.push(handle.await.unwrap().as_secs_f64());
    }
    finished.sort_by(f64::total_cmp);

    for (i, elapsed) in finished.iter().enumerate() {
        let expected = 0.2 * (i / 2 + 1) as f64;
        assert!(
            (elapsed - expected).abs() < 0.1,
            "request {i} finished after {elapsed:.3}s, expected ~{expected}s"
        );
    }
    assert_eq!(pool.get_stats().pool_size, 2);
    pool.close().await;
}

#[tokio::test]
async fn test_admission_control_rejects_immediately() {
    let pool = Arc::new(open_pool(MockFactory::new(), config(1, 1).with_max_waiting(3)).await);
    let held = pool.acquire(None).await.unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let requested = Instant::now();
                match pool.acquire(None).await {
                    Ok(conn) => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        drop(conn);
                        Ok(())
                    }
                    Err(err) => Err((err, requested.elapsed())),
                }
            })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(held);

    let mut rejected = Vec::new();
    let mut served = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => served += 1,
            Err(failure) => rejected.push(failure),
        }
    }

    assert_eq!(served, 3);
    assert_eq!(rejected.len(), 1);
    let (err, after) = &rejected[0];
    assert!(matches!(err, PoolError::TooManyRequests { max_waiting: 3, .. }));
    assert!(err.to_string().contains(pool.name()));
    assert!(*after < Duration::from_millis(50), "rejected after {after:?}");

    let stats = pool.get_stats();
    assert_eq!(stats.requests_errors, 1);
    assert_eq!(stats.requests_queued, 3);
    pool.close().await;
}

#[tokio::test]
async fn test_waiters_served_first_come_first_served() {
    let pool = Arc::new(open_pool(MockFactory::new(), config(1, 1)).await);
    let held = pool.acquire(None).await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for label in ["first", "second", "third"] {
        let pool = Arc::clone(&pool);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let conn = pool.acquire(None).await.unwrap();
            order.lock().unwrap().push(label);
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(conn);
        }));
        // let each request reach the queue before the next one
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    drop(held);
    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    pool.close().await;
}

#[tokio::test]
async fn test_timeout_reports_wait() {
    let pool = open_pool(MockFactory::new(), config(1, 1)).await;
    let held = pool.acquire(None).await.unwrap();

    let started = Instant::now();
    let err = pool.acquire(Some(Duration::from_millis(200))).await.unwrap_err();
    let elapsed = started.elapsed();

    match &err {
        PoolError::Timeout { waited, .. } => assert!(*waited >= Duration::from_millis(200)),
        other => panic!("expected a timeout, got {other:?}"),
    }
    assert!(err.is_retryable());
    assert!(elapsed < Duration::from_secs(1));

    let stats = pool.get_stats();
    assert_eq!(stats.requests_errors, 1);
    assert_eq!(stats.requests_waiting, 0);
    assert!(stats.requests_wait_ms >= 190);

    drop(held);
    pool.close().await;
}

#[tokio::test]
async fn test_pool_timeout_applies_without_argument() {
    let pool = open_pool(
        MockFactory::new(),
        config(1, 1).with_timeout(Duration::from_millis(100)),
    )
    .await;
    let held = pool.acquire(None).await.unwrap();

    let started = Instant::now();
    let err = pool.acquire(None).await.unwrap_err();
    assert!(matches!(err, PoolError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_millis(500));

    // an explicit timeout wins over the configured one
    let holder = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(held);
    });
    let conn = pool.acquire(Some(Duration::from_secs(2))).await.unwrap();
    holder.await.unwrap();
    drop(conn);
    pool.close().await;
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_no_trace() {
    let pool = Arc::new(open_pool(MockFactory::new(), config(1, 1)).await);
    let held = pool.acquire(None).await.unwrap();

    let waiting = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire(None).await.map(drop) }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.get_stats().requests_waiting, 1);

    waiting.abort();
    assert!(waiting.await.unwrap_err().is_cancelled());
    assert_eq!(pool.get_stats().requests_waiting, 0);

    drop(held);
    let stats = pool.get_stats();
    assert_eq!(stats.pool_available, 1);
    assert_eq!(stats.pool_size, 1);
    assert!(pool.try_acquire().await.unwrap().is_some());
    pool.close().await;
}

#[tokio::test]
async fn test_connection_assigned_to_cancelled_waiter_goes_back() {
    let pool = open_pool(MockFactory::new(), config(1, 1)).await;
    let held = pool.acquire(None).await.unwrap();

    let mut pending = Box::pin(pool.acquire(None));
    assert!(
        tokio::time::timeout(Duration::from_millis(20), &mut pending)
            .await
            .is_err()
    );

    // handed straight to the queued request, which never picks it up
    drop(held);
    assert_eq!(pool.get_stats().pool_available, 0);
    drop(pending);

    let stats = pool.get_stats();
    assert_eq!(stats.pool_available, 1);
    assert_eq!(stats.pool_size, 1);
    assert_eq!(stats.requests_waiting, 0);
    pool.close().await;
}

#[tokio::test]
async fn test_try_acquire_never_waits() {
    let pool = open_pool(MockFactory::new(), config(1, 2)).await;

    let first = pool.try_acquire().await.unwrap().expect("an idle connection");
    assert!(pool.try_acquire().await.unwrap().is_none());
    drop(first);
    assert!(pool.try_acquire().await.unwrap().is_some());
    pool.close().await;
}

#[tokio::test]
async fn test_grows_on_demand_up_to_max_size() {
    let factory = MockFactory::with_connect_delay(Duration::from_millis(10));
    let pool = open_pool(factory.clone(), config(1, 3)).await;

    let a = pool.acquire(None).await.unwrap();
    let b = pool.acquire(None).await.unwrap();
    let c = pool.acquire(None).await.unwrap();
    assert_eq!(factory.opened(), 3);
    assert!(pool.acquire(Some(Duration::from_millis(50))).await.is_err());

    drop((a, b, c));
    let stats = pool.get_stats();
    assert_eq!(stats.pool_size, 3);
    assert_eq!(stats.pool_available, 3);
    pool.close().await;
}

#[tokio::test]
async fn test_sizes_balance_under_load() {
    let pool = Arc::new(open_pool(MockFactory::new(), config(2, 4)).await);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let conn = pool.acquire(None).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5 * (i % 4))).await;
                pool.release(conn).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    // creations issued for requests served by a return may still land
    assert!(
        eventually(Duration::from_secs(1), || {
            let stats = pool.get_stats();
            stats.pool_available == stats.pool_size
        })
        .await
    );
    let stats = pool.get_stats();
    assert!(stats.pool_size <= 4);
    assert_eq!(stats.requests_num, 20);
    assert_eq!(stats.requests_errors, 0);
    pool.close().await;
}
