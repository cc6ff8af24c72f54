//! FIFO queue of acquire requests blocked on an empty pool

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::connection::Conn;
use crate::errors::{PoolError, PoolResult};

enum Slot<C> {
    Pending,
    Ready(PoolResult<Conn<C>>),
    Done,
}

/// What a request held at the moment its owner gave up on it
pub(crate) enum Claim<C> {
    /// Still queued; the caller must unlink it
    Pending,
    /// A connection was assigned but never picked up
    Assigned(Conn<C>),
    /// Already consumed or failed
    Settled,
}

/// One blocked acquire. The slot can be claimed exactly once, either by
/// the pool handing over a connection (or an error) or by the waiter
/// giving up; whoever comes first wins.
pub(crate) struct Waiter<C> {
    slot: Mutex<Slot<C>>,
    notify: Notify,
}

impl<C> Waiter<C> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            notify: Notify::new(),
        }
    }

    /// Hand a connection over, or get it back if the waiter is gone.
    pub fn fulfil(&self, conn: Conn<C>) -> Result<(), Conn<C>> {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return Err(conn);
        }
        *slot = Slot::Ready(Ok(conn));
        drop(slot);
        self.notify.notify_one();
        Ok(())
    }

    pub fn fail(&self, error: PoolError) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Ready(Err(error));
        drop(slot);
        self.notify.notify_one();
        true
    }

    pub fn try_take(&self) -> Option<PoolResult<Conn<C>>> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Done) {
            Slot::Ready(result) => Some(result),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Wait until the slot is filled. Cancel safe: dropping the future
    /// leaves the slot untouched.
    pub async fn wait(&self) -> PoolResult<Conn<C>> {
        loop {
            if let Some(result) = self.try_take() {
                return result;
            }
            self.notify.notified().await;
        }
    }

    /// Give up on the request, reporting what it held.
    pub fn abandon(&self) -> Claim<C> {
        match std::mem::replace(&mut *self.slot.lock(), Slot::Done) {
            Slot::Pending => Claim::Pending,
            Slot::Ready(Ok(conn)) => Claim::Assigned(conn),
            Slot::Ready(Err(_)) | Slot::Done => Claim::Settled,
        }
    }
}

/// Waiting requests in arrival order.
pub(crate) struct WaitingQueue<C> {
    waiters: VecDeque<Arc<Waiter<C>>>,
}

impl<C> WaitingQueue<C> {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn push(&mut self, waiter: Arc<Waiter<C>>) {
        self.waiters.push_back(waiter);
    }

    pub fn remove(&mut self, waiter: &Arc<Waiter<C>>) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|queued| !Arc::ptr_eq(queued, waiter));
        self.waiters.len() != before
    }

    /// Give the connection to the longest waiting live request. Returns
    /// the connection back if nobody could take it.
    pub fn serve(&mut self, mut conn: Conn<C>) -> Option<Conn<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.fulfil(conn) {
                Ok(()) => return None,
                Err(back) => conn = back,
            }
        }
        Some(conn)
    }

    /// Unlink every request; the caller fails them outside the pool lock.
    pub fn drain(&mut self) -> Vec<Arc<Waiter<C>>> {
        self.waiters.drain(..).collect()
    }
}
