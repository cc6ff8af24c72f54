//! Which idle connections periodic maintenance closes

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::connection::Conn;

/// Lower bound for the lifetime sweep period
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// How often idle connections are checked against their expiry.
pub(crate) fn sweep_interval(max_lifetime: Duration) -> Duration {
    (max_lifetime / 4).max(MIN_SWEEP_INTERVAL)
}

/// Remove idle connections unused for at least `max_idle`, least recently
/// returned first, without taking the pool below `min_size`.
///
/// `idle` is kept with the least recently returned connection at the front.
pub(crate) fn take_idle_expired<C>(
    idle: &mut VecDeque<Conn<C>>,
    pool_size: usize,
    min_size: usize,
    max_idle: Duration,
    now: Instant,
) -> Vec<Conn<C>> {
    let mut removable = pool_size.saturating_sub(min_size);
    let mut evicted = Vec::new();
    while removable > 0 {
        match idle.front() {
            Some(conn) if conn.idle_for(now) >= max_idle => {}
            _ => break,
        }
        if let Some(conn) = idle.pop_front() {
            evicted.push(conn);
            removable -= 1;
        }
    }
    evicted
}

/// Remove every idle connection past its expiry.
pub(crate) fn take_lifetime_expired<C>(idle: &mut VecDeque<Conn<C>>, now: Instant) -> Vec<Conn<C>> {
    let mut expired = Vec::new();
    let mut kept = VecDeque::with_capacity(idle.len());
    for conn in idle.drain(..) {
        if conn.is_expired(now) {
            expired.push(conn);
        } else {
            kept.push_back(conn);
        }
    }
    *idle = kept;
    expired
}

/// Remove idle connections beyond `max_size`, least recently returned first.
pub(crate) fn take_oversize<C>(
    idle: &mut VecDeque<Conn<C>>,
    pool_size: usize,
    max_size: usize,
) -> Vec<Conn<C>> {
    let excess = pool_size.saturating_sub(max_size).min(idle.len());
    idle.drain(..excess).collect()
}
