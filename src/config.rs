//! Pool configuration options

use std::time::Duration;

use crate::errors::{PoolError, PoolResult};

/// Configuration for connection pool behavior
///
/// # Examples
///
/// ```
/// use connpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_name("reports")
///     .with_min_size(2)
///     .with_max_size(10)
///     .with_max_waiting(50)
///     .with_timeout(Duration::from_secs(5));
///
/// assert_eq!(config.min_size, 2);
/// assert_eq!(config.max_size(), 10);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    /// Pool name used in logs and error messages; generated when absent
    pub name: Option<String>,

    /// Number of connections the pool tries to keep open
    pub min_size: usize,

    /// Hard bound on open connections; `None` means "same as `min_size`",
    /// or unbounded for a non-retaining pool
    pub max_size: Option<usize>,

    /// Default time an acquire may wait for a connection
    pub timeout: Duration,

    /// Maximum number of queued acquire requests, 0 for no limit
    pub max_waiting: usize,

    /// Connections older than this are recycled (jittered per connection)
    pub max_lifetime: Duration,

    /// Idle connections unused for this long are closed down to `min_size`
    pub max_idle: Duration,

    /// How long a failing connection slot keeps retrying before giving up
    pub reconnect_timeout: Duration,

    /// Number of background workers running connect/reset/close tasks
    pub num_workers: usize,

    /// `Some(true)` opens on build, `Some(false)` requires an explicit
    /// `open()`, `None` opens lazily on first acquire with a warning
    pub open: Option<bool>,

    /// When false, returned connections are closed instead of reused
    pub retain_connections: bool,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            name: None,
            min_size: 4,
            max_size: None,
            timeout: Duration::from_secs(30),
            max_waiting: 0,
            max_lifetime: Duration::from_secs(60 * 60),
            max_idle: Duration::from_secs(10 * 60),
            reconnect_timeout: Duration::from_secs(5 * 60),
            num_workers: 3,
            open: None,
            retain_connections: true,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a pool that never reuses a connection across
    /// borrowers: `min_size` is pinned to 0 and returned connections are
    /// closed. Admission control and queueing behave as usual.
    ///
    /// # Examples
    ///
    /// ```
    /// use connpool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::null().with_max_size(8);
    /// assert_eq!(config.min_size, 0);
    /// assert!(!config.retain_connections);
    /// ```
    pub fn null() -> Self {
        Self {
            min_size: 0,
            retain_connections: false,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = Some(size);
        self
    }

    /// Set the default acquire timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bound the waiting queue; further requests fail with `TooManyRequests`
    pub fn with_max_waiting(mut self, count: usize) -> Self {
        self.max_waiting = count;
        self
    }

    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn with_max_idle(mut self, idle: Duration) -> Self {
        self.max_idle = idle;
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    pub fn with_num_workers(mut self, count: usize) -> Self {
        self.num_workers = count;
        self
    }

    /// Open the pool eagerly when it is built (`true`) or require an
    /// explicit `open()` (`false`)
    pub fn with_open(mut self, open: bool) -> Self {
        self.open = Some(open);
        self
    }

    /// Effective upper bound on open connections
    pub fn max_size(&self) -> usize {
        match self.max_size {
            Some(max) => max,
            None if !self.retain_connections => usize::MAX,
            None => self.min_size,
        }
    }

    /// Check the configuration for inconsistent bounds
    pub fn validate(&self) -> PoolResult<()> {
        let max_size = self.max_size();
        if max_size == 0 {
            return Err(PoolError::Configuration(
                "max_size must be greater than 0".into(),
            ));
        }
        if self.min_size > max_size {
            return Err(PoolError::Configuration(format!(
                "min_size ({}) cannot be greater than max_size ({})",
                self.min_size, max_size
            )));
        }
        if !self.retain_connections && self.min_size > 0 {
            return Err(PoolError::Configuration(
                "a non-retaining pool requires min_size 0".into(),
            ));
        }
        if self.num_workers == 0 {
            return Err(PoolError::Configuration(
                "num_workers must be at least 1".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(PoolError::Configuration(
                "timeout must be greater than 0".into(),
            ));
        }
        if self.max_idle.is_zero() || self.max_lifetime.is_zero() {
            return Err(PoolError::Configuration(
                "max_idle and max_lifetime must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
