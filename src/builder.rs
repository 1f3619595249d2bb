//! Fluent builder for Loop construction.
//!
//! Provides a builder pattern interface for creating and configuring Loop instances.

use crate::error::Result;
use crate::reactor::Timestamp;
use crate::reactor::core::Loop;
use crate::reactor::poller::{self, Backend, Backends, recommended_backends};
use crate::time::{Clock, SystemClock};
use crate::trace::debug;

/// Environment variable holding a numeric flag word that replaces the
/// builder's backend selection (see [`LoopBuilder::no_env`]).
pub const ENV_FLAGS: &str = "EVLOOP_FLAGS";

/// Flag bit in [`ENV_FLAGS`] that enables fork checking.
pub const FLAG_FORKCHECK: u32 = 0x0100_0000;

/// Builder for constructing Loop instances with fluent API.
///
/// # Example
/// ```ignore
/// let lp = LoopBuilder::new()
///     .backends(Backends::POLL | Backends::SELECT)
///     .forkcheck(true)
///     .build()?;
/// ```
pub struct LoopBuilder {
    backends: Backends,
    forkcheck: bool,
    use_env: bool,
    backend: Option<Box<dyn Backend>>,
    clock: Option<Box<dyn Clock>>,
    io_collect_interval: Timestamp,
    timeout_collect_interval: Timestamp,
}

impl Default for LoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether the process runs with elevated privileges, in which case the
/// environment must not influence the loop.
fn is_secure() -> bool {
    unsafe { libc::getuid() != libc::geteuid() || libc::getgid() != libc::getegid() }
}

impl LoopBuilder {
    /// Creates a builder that picks the best recommended backend.
    ///
    /// # Example
    /// ```ignore
    /// let builder = LoopBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self {
            backends: Backends::empty(),
            forkcheck: false,
            use_env: true,
            backend: None,
            clock: None,
            io_collect_interval: 0.0,
            timeout_collect_interval: 0.0,
        }
    }

    /// Restricts the backends to try. An empty set means the recommended ones.
    pub fn backends(mut self, backends: Backends) -> Self {
        self.backends = backends;
        self
    }

    /// Checks for a fork on every iteration instead of relying on
    /// [`Loop::loop_fork`] being called.
    pub fn forkcheck(mut self, enabled: bool) -> Self {
        self.forkcheck = enabled;
        self
    }

    /// Ignores the [`ENV_FLAGS`] environment variable.
    pub fn no_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Uses the given backend instead of creating one.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Reads time from `clock` instead of the system clocks.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Box::new(clock));
        self
    }

    /// See [`Loop::set_io_collect_interval`].
    pub fn io_collect_interval(mut self, interval: Timestamp) -> Self {
        self.io_collect_interval = interval;
        self
    }

    /// See [`Loop::set_timeout_collect_interval`].
    pub fn timeout_collect_interval(mut self, interval: Timestamp) -> Self {
        self.timeout_collect_interval = interval;
        self
    }

    /// Builds and returns a configured Loop instance.
    ///
    /// # Errors
    /// [`Error::NoBackend`](crate::Error::NoBackend) when none of the requested
    /// backends is available, or [`Error::Io`](crate::Error::Io) with the OS
    /// error when the ones that were tried failed to initialise.
    pub fn build(self) -> Result<Loop> {
        let mut requested = self.backends;
        let mut forkcheck = self.forkcheck;

        if self.use_env
            && !is_secure()
            && let Some(flags) = std::env::var(ENV_FLAGS)
                .ok()
                .and_then(|v| v.trim().parse::<u32>().ok())
        {
            debug!(flags, "loop flags taken from environment");
            requested = Backends::from_bits(flags);
            forkcheck = flags & FLAG_FORKCHECK != 0;
        }

        if requested.is_empty() {
            requested = recommended_backends();
        }

        let backend = match self.backend {
            Some(backend) => backend,
            None => poller::init(requested)?,
        };

        debug!(backend = ?backend.kind(), "loop backend selected");

        let clock = self.clock.unwrap_or_else(|| Box::new(SystemClock));
        let mut lp = Loop::with_parts(backend, clock, forkcheck);
        lp.set_io_collect_interval(self.io_collect_interval);
        lp.set_timeout_collect_interval(self.timeout_collect_interval);

        Ok(lp)
    }
}
