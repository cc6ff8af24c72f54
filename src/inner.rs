//! Shared pool state and the transitions that move connections around it
//!
//! Every mutation of the idle set, the waiting queue and the size counters
//! happens under `PoolInner::state`. Transitions never touch the worker
//! queue or the scheduler while holding that lock: they collect the tasks to
//! run and `dispatch` them once the lock is released.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::config::PoolConfiguration;
use crate::connection::{deadline_after, Conn, Outcome, PooledConnection};
use crate::errors::{ClosedReason, PoolError, PoolResult};
use crate::eviction;
use crate::factory::{ConnectionFactory, ConnectionHook};
use crate::metrics::{Counter, Gauges, PoolStats, StatsCollector, Timer};
use crate::queue::{Claim, Waiter, WaitingQueue};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::worker::{self, ConnectionAttempt, Task};

static POOL_IDS: AtomicU64 = AtomicU64::new(1);

pub(crate) type ConnOf<F> = Conn<<F as ConnectionFactory>::Connection>;
type TaskQueue<C> = Arc<AsyncMutex<mpsc::UnboundedReceiver<Task<C>>>>;

/// Lifecycle of a pool. A pool is opened at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    New,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Whether the pool holds `min_size` connections, observed by `wait()`.
/// Goes back to `Filling` whenever the pool drops below its minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Filling,
    Filled,
    Closed,
}

pub(crate) struct Hooks<C: Send + 'static> {
    pub configure: Option<Arc<dyn ConnectionHook<C>>>,
    pub check: Option<Arc<dyn ConnectionHook<C>>>,
    pub reset: Option<Arc<dyn ConnectionHook<C>>>,
}

impl<C: Send + 'static> Default for Hooks<C> {
    fn default() -> Self {
        Self {
            configure: None,
            check: None,
            reset: None,
        }
    }
}

pub(crate) struct State<C> {
    pub lifecycle: PoolState,
    /// Least recently returned at the front
    pub idle: VecDeque<Conn<C>>,
    pub waiting: WaitingQueue<C>,
    pub min_size: usize,
    pub max_size: usize,
    /// Connections owned by the pool: idle, borrowed, being created or
    /// being recycled
    pub size: usize,
    pub borrowed: usize,
    /// Create tasks issued and not settled yet, retries included
    pub creating: usize,
}

impl<C> State<C> {
    fn reserve(&mut self, tasks: &mut Vec<Task<C>>) {
        self.size += 1;
        self.creating += 1;
        tasks.push(Task::Create(None));
    }

    /// Issue the creations needed to reach `min_size` and to serve the
    /// requests waiting in the queue.
    fn grow(&mut self, tasks: &mut Vec<Task<C>>) {
        if self.lifecycle != PoolState::Open {
            return;
        }
        while self.size < self.min_size {
            self.reserve(tasks);
        }
        while self.size < self.max_size && self.creating < self.waiting.len() {
            self.reserve(tasks);
        }
    }

    /// Connections established, whatever their use right now
    fn established(&self) -> usize {
        self.size.saturating_sub(self.creating)
    }

    fn readiness(&self) -> Readiness {
        match self.lifecycle {
            PoolState::Open if self.established() >= self.min_size => Readiness::Filled,
            PoolState::New | PoolState::Opening | PoolState::Open => Readiness::Filling,
            PoolState::Closing | PoolState::Closed => Readiness::Closed,
        }
    }
}

struct Background<C> {
    tasks: Option<mpsc::UnboundedSender<Task<C>>>,
    /// Workers hold the only strong references to the receiver
    receiver: Weak<AsyncMutex<mpsc::UnboundedReceiver<Task<C>>>>,
    workers: Vec<JoinHandle<()>>,
    scheduler: Option<Arc<Scheduler>>,
    shrink: Option<TaskHandle>,
    sweep: Option<TaskHandle>,
}

/// What is left to finish once a pool stopped accepting work
pub(crate) struct Shutdown<C> {
    pub idle: Vec<Conn<C>>,
    workers: Vec<JoinHandle<()>>,
    scheduler: Option<std::thread::JoinHandle<()>>,
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    pub id: u64,
    pub name: String,
    pub config: PoolConfiguration,
    pub factory: F,
    pub hooks: Hooks<F::Connection>,
    pub stats: StatsCollector,
    state: Mutex<State<F::Connection>>,
    readiness: watch::Sender<Readiness>,
    background: Mutex<Background<F::Connection>>,
    /// Serializes `open()` so no caller returns while another is starting
    open_lock: Mutex<()>,
    next_conn_id: AtomicU64,
}

impl<F: ConnectionFactory> PoolInner<F> {
    pub fn new(config: PoolConfiguration, factory: F, hooks: Hooks<F::Connection>) -> Self {
        let id = POOL_IDS.fetch_add(1, Ordering::Relaxed);
        let name = config.name.clone().unwrap_or_else(|| format!("pool-{id}"));
        let (readiness, _) = watch::channel(Readiness::Filling);
        let state = State {
            lifecycle: PoolState::New,
            idle: VecDeque::new(),
            waiting: WaitingQueue::new(),
            min_size: config.min_size,
            max_size: config.max_size(),
            size: 0,
            borrowed: 0,
            creating: 0,
        };

        Self {
            id,
            name,
            config,
            factory,
            hooks,
            stats: StatsCollector::new(),
            state: Mutex::new(state),
            readiness,
            background: Mutex::new(Background {
                tasks: None,
                receiver: Weak::new(),
                workers: Vec::new(),
                scheduler: None,
                shrink: None,
                sweep: None,
            }),
            open_lock: Mutex::new(()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn lifecycle(&self) -> PoolState {
        self.state.lock().lifecycle
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle() == PoolState::Open
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn readiness(&self) -> watch::Receiver<Readiness> {
        self.readiness.subscribe()
    }

    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.background.lock().scheduler.clone()
    }

    /// Number of worker tasks that have not exited yet
    pub fn live_workers(&self) -> usize {
        self.background.lock().receiver.strong_count()
    }

    fn closed_error(&self, lifecycle: PoolState) -> PoolError {
        let reason = match lifecycle {
            PoolState::New | PoolState::Opening => ClosedReason::NotOpenYet,
            _ => ClosedReason::AlreadyClosed,
        };
        PoolError::PoolClosed {
            name: self.name.clone(),
            reason,
        }
    }

    fn timeout_error(&self, started: Instant) -> PoolError {
        PoolError::Timeout {
            name: self.name.clone(),
            waited: started.elapsed(),
        }
    }

    fn gauges(&self) -> Gauges {
        let state = self.state.lock();
        Gauges {
            min: state.min_size,
            max: state.max_size,
            size: state.size,
            available: state.idle.len(),
            waiting: state.waiting.len(),
        }
    }

    pub fn get_stats(&self) -> PoolStats {
        self.stats.snapshot(self.gauges())
    }

    pub fn pop_stats(&self) -> PoolStats {
        self.stats.take(self.gauges())
    }

    pub fn record_usage(&self, elapsed: Duration) {
        self.stats.record(Timer::Usage, elapsed);
    }

    /// Publish the fill state. Called under the state lock after every
    /// change of the lifecycle, the bounds or the connection counts.
    fn refresh_readiness(&self, state: &State<F::Connection>) {
        let next = state.readiness();
        self.readiness.send_if_modified(|readiness| {
            if *readiness == next {
                false
            } else {
                *readiness = next;
                true
            }
        });
    }

    // -- lifecycle --

    pub fn open(self: &Arc<Self>) -> PoolResult<()> {
        let _opening = self.open_lock.lock();
        {
            let mut state = self.state.lock();
            match state.lifecycle {
                PoolState::Open => return Ok(()),
                PoolState::Closing | PoolState::Closed => {
                    return Err(PoolError::Reuse {
                        name: self.name.clone(),
                    });
                }
                PoolState::New | PoolState::Opening => state.lifecycle = PoolState::Opening,
            }
        }

        if let Err(err) = self.start_background() {
            let mut state = self.state.lock();
            if state.lifecycle == PoolState::Opening {
                state.lifecycle = PoolState::New;
            }
            return Err(err);
        }

        let mut tasks = Vec::new();
        {
            let mut state = self.state.lock();
            if state.lifecycle != PoolState::Opening {
                // closed while starting
                let err = self.closed_error(state.lifecycle);
                drop(state);
                let _ = self.stop_background();
                tracing::debug!(pool = %self.name, "pool closed while opening");
                return Err(err);
            }
            state.lifecycle = PoolState::Open;
            state.grow(&mut tasks);
            self.refresh_readiness(&state);
        }
        tracing::debug!(
            pool = %self.name,
            min_size = self.config.min_size,
            workers = self.config.num_workers,
            "pool opened"
        );
        self.dispatch(tasks);
        Ok(())
    }

    fn start_background(self: &Arc<Self>) -> PoolResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            PoolError::Configuration("opening a pool requires a tokio runtime".into())
        })?;
        let scheduler = Scheduler::start(&self.name).map_err(|err| {
            PoolError::Configuration(format!("cannot start the scheduler thread: {err}"))
        })?;
        let scheduler = Arc::new(scheduler);

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver: TaskQueue<F::Connection> = Arc::new(AsyncMutex::new(receiver));
        let workers: Vec<_> = (0..self.config.num_workers)
            .map(|_| runtime.spawn(worker::run(Arc::downgrade(self), Arc::clone(&receiver))))
            .collect();

        {
            let mut background = self.background.lock();
            background.tasks = Some(sender);
            background.receiver = Arc::downgrade(&receiver);
            background.workers = workers;
            background.scheduler = Some(Arc::clone(&scheduler));
        }

        self.schedule_shrink(&scheduler);
        self.schedule_sweep(&scheduler);
        Ok(())
    }

    /// Stop accepting work: fail the waiting requests, take the idle
    /// connections and stop the background. Returns `None` if the pool was
    /// never opened or is already closing.
    pub fn begin_close(&self) -> Option<Shutdown<F::Connection>> {
        let (idle, waiters) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.lifecycle {
                PoolState::Opening | PoolState::Open => {}
                _ => return None,
            }
            state.lifecycle = PoolState::Closing;
            let idle: Vec<_> = state.idle.drain(..).collect();
            state.size -= idle.len();
            self.refresh_readiness(state);
            (idle, state.waiting.drain())
        };

        for waiter in waiters {
            waiter.fail(PoolError::PoolClosed {
                name: self.name.clone(),
                reason: ClosedReason::ClosedWhileWaiting,
            });
        }

        let (workers, scheduler) = self.stop_background();
        Some(Shutdown {
            idle,
            workers,
            scheduler,
        })
    }

    /// Cancel the maintenance, stop the scheduler and tell every worker to
    /// exit. Returns what is left to join.
    fn stop_background(&self) -> (Vec<JoinHandle<()>>, Option<std::thread::JoinHandle<()>>) {
        let mut background = self.background.lock();
        let maintenance = [background.shrink.take(), background.sweep.take()];
        let scheduler = match background.scheduler.take() {
            Some(scheduler) => {
                for handle in maintenance.into_iter().flatten() {
                    scheduler.cancel(handle);
                }
                tracing::debug!(pool = %self.name, pending = scheduler.len(), "stopping scheduler");
                scheduler.stop()
            }
            None => None,
        };
        let workers = std::mem::take(&mut background.workers);
        if let Some(tasks) = background.tasks.take() {
            for _ in 0..workers.len() {
                let _ = tasks.send(Task::Stop);
            }
        }
        (workers, scheduler)
    }

    /// Close the idle connections and wait for the background to stop.
    pub async fn finish_close(&self, shutdown: Shutdown<F::Connection>, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        let count = shutdown.idle.len();
        for conn in shutdown.idle {
            self.factory.close(conn.raw).await;
        }
        if count > 0 {
            tracing::info!(pool = %self.name, count, "closed idle connections");
        }

        for mut worker in shutdown.workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                worker.abort();
            }
        }
        let live = self.live_workers();
        if live > 0 {
            tracing::warn!(
                pool = %self.name,
                workers = live,
                "couldn't stop workers in {:?}, aborted",
                timeout
            );
        }

        if let Some(thread) = shutdown.scheduler {
            let joined =
                tokio::time::timeout_at(deadline, tokio::task::spawn_blocking(move || thread.join()))
                    .await;
            if joined.is_err() {
                tracing::warn!(pool = %self.name, "couldn't stop the scheduler in {:?}", timeout);
            }
        }

        self.state.lock().lifecycle = PoolState::Closed;
        tracing::debug!(pool = %self.name, "pool closed");
    }

    /// Close without waiting for the background, from a synchronous context.
    pub fn shutdown(self: &Arc<Self>) {
        let Some(shutdown) = self.begin_close() else {
            return;
        };
        for conn in shutdown.idle {
            self.close_detached(conn);
        }
        self.state.lock().lifecycle = PoolState::Closed;
        tracing::debug!(pool = %self.name, "pool closed without waiting for workers");
    }

    // -- task dispatch --

    pub fn dispatch(self: &Arc<Self>, tasks: Vec<Task<F::Connection>>) {
        if tasks.is_empty() {
            return;
        }
        let sender = self.background.lock().tasks.clone();
        for task in tasks {
            let task = match &sender {
                Some(sender) => match sender.send(task) {
                    Ok(()) => continue,
                    Err(mpsc::error::SendError(task)) => task,
                },
                None => task,
            };
            self.reject(task);
        }
    }

    /// Settle a task no worker will run.
    fn reject(self: &Arc<Self>, task: Task<F::Connection>) {
        match task {
            Task::Create(_) => self.release_creation(),
            Task::Return(conn) => {
                {
                    let mut state = self.state.lock();
                    state.size -= 1;
                    self.refresh_readiness(&state);
                }
                self.close_detached(conn);
            }
            Task::Close(conn) => self.close_detached(conn),
            Task::Stop => {}
        }
    }

    fn close_detached(self: &Arc<Self>, conn: ConnOf<F>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = Arc::clone(self);
                runtime.spawn(async move { pool.factory.close(conn.raw).await });
            }
            Err(_) => drop(conn),
        }
    }

    // -- acquire --

    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> PoolResult<PooledConnection<F>> {
        self.stats.increment(Counter::RequestsNum);
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);

        loop {
            let conn = self.get_conn(started, deadline).await?;
            let mut conn = PooledConnection::new(Arc::clone(self), conn);
            if self.passes_check(&mut conn).await {
                return Ok(conn);
            }
            conn.discard_failed_check();
            if Instant::now() >= deadline {
                self.stats.increment(Counter::RequestsErrors);
                return Err(self.timeout_error(started));
            }
        }
    }

    /// Hand out an idle connection if there is one, never waiting.
    pub async fn try_acquire(self: &Arc<Self>) -> PoolResult<Option<PooledConnection<F>>> {
        self.stats.increment(Counter::RequestsNum);
        loop {
            let conn = {
                let mut state = self.state.lock();
                if state.lifecycle != PoolState::Open {
                    return Err(self.closed_error(state.lifecycle));
                }
                match state.idle.pop_back() {
                    Some(conn) => {
                        state.borrowed += 1;
                        conn
                    }
                    None => return Ok(None),
                }
            };
            let mut conn = PooledConnection::new(Arc::clone(self), conn);
            if self.passes_check(&mut conn).await {
                return Ok(Some(conn));
            }
            conn.discard_failed_check();
        }
    }

    async fn passes_check(&self, conn: &mut PooledConnection<F>) -> bool {
        let Some(check) = &self.hooks.check else {
            return true;
        };
        match check.call(&mut **conn).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    pool = %self.name,
                    conn = conn.id(),
                    error = %err,
                    "connection failed check"
                );
                false
            }
        }
    }

    async fn get_conn(self: &Arc<Self>, started: Instant, deadline: Instant) -> PoolResult<ConnOf<F>> {
        let mut tasks = Vec::new();
        let waiter = {
            let mut state = self.state.lock();
            if state.lifecycle != PoolState::Open {
                return Err(self.closed_error(state.lifecycle));
            }
            if let Some(conn) = state.idle.pop_back() {
                state.borrowed += 1;
                return Ok(conn);
            }
            let max_waiting = self.config.max_waiting;
            if max_waiting > 0 && state.waiting.len() >= max_waiting {
                drop(state);
                self.stats.increment(Counter::RequestsErrors);
                return Err(PoolError::TooManyRequests {
                    name: self.name.clone(),
                    max_waiting,
                });
            }
            let waiter = Arc::new(Waiter::new());
            state.waiting.push(Arc::clone(&waiter));
            state.grow(&mut tasks);
            waiter
        };
        self.stats.increment(Counter::RequestsQueued);
        self.dispatch(tasks);

        let queued_at = Instant::now();
        let guard = WaitGuard {
            pool: self,
            waiter,
        };
        let result = tokio::time::timeout_at(deadline.into(), guard.waiter.wait()).await;
        self.stats.record(Timer::RequestsWait, queued_at.elapsed());

        match result {
            Ok(result) => result,
            // the connection may have arrived with the deadline
            Err(_) => match guard.waiter.try_take() {
                Some(result) => result,
                None => {
                    self.stats.increment(Counter::RequestsErrors);
                    Err(self.timeout_error(started))
                }
            },
        }
    }

    /// A queued request was dropped, timed out or already served.
    fn abandon(self: &Arc<Self>, waiter: &Arc<Waiter<F::Connection>>) {
        let mut tasks = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match waiter.abandon() {
                Claim::Pending => {
                    state.waiting.remove(waiter);
                }
                Claim::Assigned(conn) => {
                    state.borrowed -= 1;
                    self.return_locked(state, conn, Outcome::Unused, &mut tasks);
                }
                Claim::Settled => {}
            }
        }
        self.dispatch(tasks);
    }

    // -- return --

    pub fn checkin(self: &Arc<Self>, conn: ConnOf<F>, outcome: Outcome) {
        let mut tasks = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.borrowed = state.borrowed.saturating_sub(1);
            self.return_locked(state, conn, outcome, &mut tasks);
        }
        self.dispatch(tasks);
    }

    fn return_locked(
        &self,
        state: &mut State<F::Connection>,
        conn: ConnOf<F>,
        outcome: Outcome,
        tasks: &mut Vec<Task<F::Connection>>,
    ) {
        let reason = if state.lifecycle != PoolState::Open {
            Some("pool not open")
        } else if outcome == Outcome::Broken || self.factory.has_broken(&conn.raw) {
            self.stats.increment(Counter::ReturnsBad);
            Some("broken")
        } else if outcome == Outcome::FailedCheck {
            Some("failed check")
        } else if conn.is_expired(Instant::now()) {
            Some("expired")
        } else if outcome != Outcome::Unused && !self.config.retain_connections {
            Some("not retained")
        } else if state.size > state.max_size {
            Some("above max_size")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                if reason == "not retained" {
                    tracing::debug!(pool = %self.name, conn = conn.id, "closing returned connection");
                } else {
                    tracing::info!(pool = %self.name, conn = conn.id, reason, "discarding connection");
                }
                state.size -= 1;
                tasks.push(Task::Close(conn));
                state.grow(tasks);
            }
            None if outcome == Outcome::Returned && self.hooks.reset.is_some() => {
                tasks.push(Task::Return(conn));
            }
            None => self.deliver_locked(state, conn, tasks),
        }
        self.refresh_readiness(state);
    }

    /// Give a ready connection to the oldest waiter, else make it idle.
    fn deliver_locked(
        &self,
        state: &mut State<F::Connection>,
        mut conn: ConnOf<F>,
        tasks: &mut Vec<Task<F::Connection>>,
    ) {
        conn.touch();
        match state.waiting.serve(conn) {
            None => state.borrowed += 1,
            Some(conn) if self.config.retain_connections => state.idle.push_back(conn),
            Some(conn) => {
                state.size -= 1;
                tasks.push(Task::Close(conn));
            }
        }
    }

    /// A borrowed connection left the pool for good.
    pub fn forget(self: &Arc<Self>, id: u64) {
        let mut tasks = Vec::new();
        {
            let mut state = self.state.lock();
            state.borrowed = state.borrowed.saturating_sub(1);
            state.size -= 1;
            state.grow(&mut tasks);
            self.refresh_readiness(&state);
        }
        tracing::info!(pool = %self.name, conn = id, "connection detached from the pool");
        self.dispatch(tasks);
    }

    /// Close a borrowed connection and replace it if needed.
    fn discard(self: &Arc<Self>, conn: ConnOf<F>) {
        let mut tasks = vec![Task::Close(conn)];
        {
            let mut state = self.state.lock();
            state.borrowed = state.borrowed.saturating_sub(1);
            state.size -= 1;
            state.grow(&mut tasks);
            self.refresh_readiness(&state);
        }
        self.dispatch(tasks);
    }

    // -- worker side --

    /// A creation slot gave up or was never started.
    pub fn release_creation(&self) {
        let mut state = self.state.lock();
        state.size -= 1;
        state.creating -= 1;
    }

    /// A connection being recycled was lost.
    pub fn release_slot(self: &Arc<Self>) {
        let mut tasks = Vec::new();
        {
            let mut state = self.state.lock();
            state.size -= 1;
            state.grow(&mut tasks);
            self.refresh_readiness(&state);
        }
        self.dispatch(tasks);
    }

    /// Settle a creation with a new connection. Returns it back if the pool
    /// closed meanwhile; the caller closes it.
    pub fn deliver_new(self: &Arc<Self>, conn: ConnOf<F>) -> Option<ConnOf<F>> {
        let mut tasks = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.creating -= 1;
            if state.lifecycle != PoolState::Open {
                state.size -= 1;
                return Some(conn);
            }
            self.deliver_locked(state, conn, &mut tasks);
            self.refresh_readiness(state);
        }
        self.dispatch(tasks);
        None
    }

    /// Put back a connection a worker finished recycling.
    pub fn reinstate(self: &Arc<Self>, conn: ConnOf<F>) {
        let mut tasks = Vec::new();
        {
            let mut guard = self.state.lock();
            self.return_locked(&mut guard, conn, Outcome::Unused, &mut tasks);
        }
        self.dispatch(tasks);
    }

    pub fn retry_create(self: &Arc<Self>, attempt: ConnectionAttempt, delay: Duration) {
        let Some(scheduler) = self.scheduler() else {
            self.release_creation();
            return;
        };
        let pool = Arc::downgrade(self);
        scheduler.enter(delay, move || {
            if let Some(pool) = pool.upgrade() {
                pool.dispatch(vec![Task::Create(Some(attempt))]);
            }
        });
    }

    // -- maintenance --

    fn schedule_shrink(self: &Arc<Self>, scheduler: &Scheduler) {
        let pool = Arc::downgrade(self);
        let handle = scheduler.enter(self.config.max_idle, move || {
            if let Some(pool) = pool.upgrade() {
                pool.shrink();
                if let Some(scheduler) = pool.scheduler() {
                    pool.schedule_shrink(&scheduler);
                }
            }
        });
        self.background.lock().shrink = Some(handle);
    }

    fn schedule_sweep(self: &Arc<Self>, scheduler: &Scheduler) {
        let pool = Arc::downgrade(self);
        let handle = scheduler.enter(eviction::sweep_interval(self.config.max_lifetime), move || {
            if let Some(pool) = pool.upgrade() {
                pool.sweep();
                if let Some(scheduler) = pool.scheduler() {
                    pool.schedule_sweep(&scheduler);
                }
            }
        });
        self.background.lock().sweep = Some(handle);
    }

    /// Close connections idle for longer than `max_idle`, down to `min_size`.
    pub fn shrink(self: &Arc<Self>) {
        let evicted = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.lifecycle != PoolState::Open {
                return;
            }
            let evicted = eviction::take_idle_expired(
                &mut state.idle,
                state.size,
                state.min_size,
                self.config.max_idle,
                Instant::now(),
            );
            state.size -= evicted.len();
            self.refresh_readiness(state);
            evicted
        };
        if !evicted.is_empty() {
            tracing::info!(pool = %self.name, count = evicted.len(), "shrinking idle connections");
        }
        self.dispatch(evicted.into_iter().map(Task::Close).collect());
    }

    /// Replace idle connections past their lifetime.
    pub fn sweep(self: &Arc<Self>) {
        let mut tasks = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.lifecycle != PoolState::Open {
                return;
            }
            let expired = eviction::take_lifetime_expired(&mut state.idle, Instant::now());
            if !expired.is_empty() {
                tracing::info!(pool = %self.name, count = expired.len(), "recycling expired connections");
            }
            state.size -= expired.len();
            tasks.extend(expired.into_iter().map(Task::Close));
            state.grow(&mut tasks);
            self.refresh_readiness(state);
        }
        self.dispatch(tasks);
    }

    /// Probe every idle connection, replacing the ones that fail.
    pub async fn check(self: &Arc<Self>) -> PoolResult<()> {
        let pending = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.lifecycle != PoolState::Open {
                return Err(self.closed_error(state.lifecycle));
            }
            let pending: VecDeque<_> = state.idle.drain(..).collect();
            state.borrowed += pending.len();
            pending
        };
        let mut batch = CheckBatch {
            pool: self,
            pending,
        };

        loop {
            let Some(conn) = batch.pending.front_mut() else {
                break;
            };
            let result = self.factory.is_valid(&mut conn.raw).await;
            let Some(conn) = batch.pending.pop_front() else {
                break;
            };
            match result {
                Ok(()) => self.checkin(conn, Outcome::Unused),
                Err(err) => {
                    self.stats.increment(Counter::ConnectionsLost);
                    tracing::warn!(
                        pool = %self.name,
                        conn = conn.id,
                        error = %err,
                        "discarding broken connection"
                    );
                    self.discard(conn);
                }
            }
        }
        Ok(())
    }

    pub fn resize(self: &Arc<Self>, min_size: usize, max_size: Option<usize>) -> PoolResult<()> {
        let max_size = match max_size {
            Some(max) => max,
            None if !self.config.retain_connections => usize::MAX,
            None => min_size,
        };
        if max_size == 0 || min_size > max_size {
            return Err(PoolError::Configuration(format!(
                "cannot resize to min_size {min_size}, max_size {max_size}"
            )));
        }
        if !self.config.retain_connections && min_size > 0 {
            return Err(PoolError::Configuration(
                "a non-retaining pool requires min_size 0".into(),
            ));
        }

        let mut tasks = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.min_size = min_size;
            state.max_size = max_size;
            let excess = eviction::take_oversize(&mut state.idle, state.size, max_size);
            state.size -= excess.len();
            tasks.extend(excess.into_iter().map(Task::Close));
            state.grow(&mut tasks);
            self.refresh_readiness(state);
        }
        tracing::info!(pool = %self.name, min_size, max_size, "pool resized");
        self.dispatch(tasks);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.idle.len(), state.borrowed, state.size)
    }
}

/// Unlinks a queued request however the acquire ends.
struct WaitGuard<'a, F: ConnectionFactory> {
    pool: &'a Arc<PoolInner<F>>,
    waiter: Arc<Waiter<F::Connection>>,
}

impl<F: ConnectionFactory> Drop for WaitGuard<'_, F> {
    fn drop(&mut self) {
        self.pool.abandon(&self.waiter);
    }
}

/// Idle connections taken out for probing; the ones not probed yet go back
/// if the check is dropped halfway.
struct CheckBatch<'a, F: ConnectionFactory> {
    pool: &'a Arc<PoolInner<F>>,
    pending: VecDeque<ConnOf<F>>,
}

impl<F: ConnectionFactory> Drop for CheckBatch<'_, F> {
    fn drop(&mut self) {
        for conn in self.pending.drain(..) {
            self.pool.checkin(conn, Outcome::Unused);
        }
    }
}
