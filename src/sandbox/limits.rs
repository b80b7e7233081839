//! Resource limiting for the guest runtime.
//!
//! Memory is capped by the engine allocator itself; time is bounded by an
//! [`ExecutionClock`] whose predicate the engine polls between bytecode
//! steps, so a loop without any function call is still interruptible.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sentinel stored in `armed_at` while no evaluation is running.
const IDLE: u64 = u64::MAX;

#[derive(Debug)]
struct ClockState {
    origin: Instant,
    /// Nanoseconds since `origin` at which the current evaluation started.
    armed_at: AtomicU64,
    timeout: Duration,
    fired: AtomicBool,
}

/// Deadline tracker shared between the sandbox and the engine's interrupt hook.
#[derive(Debug, Clone)]
pub struct ExecutionClock {
    state: Arc<ClockState>,
}

impl ExecutionClock {
    /// Create an idle clock that interrupts evaluations running longer than `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(ClockState {
                origin: Instant::now(),
                armed_at: AtomicU64::new(IDLE),
                timeout,
                fired: AtomicBool::new(false),
            }),
        }
    }

    /// Start timing an evaluation.
    pub fn arm(&self) {
        self.state.fired.store(false, Ordering::SeqCst);
        self.state
            .armed_at
            .store(self.now_nanos(), Ordering::SeqCst);
    }

    /// Stop timing. The interrupt predicate returns `false` until re-armed.
    pub fn disarm(&self) {
        self.state.armed_at.store(IDLE, Ordering::SeqCst);
    }

    /// The interrupt predicate polled by the engine.
    ///
    /// Returns `true` once the armed evaluation has run past the timeout and
    /// remembers that it fired.
    pub fn should_interrupt(&self) -> bool {
        let armed_at = self.state.armed_at.load(Ordering::SeqCst);
        if armed_at == IDLE {
            return false;
        }
        let elapsed = Duration::from_nanos(self.now_nanos().saturating_sub(armed_at));
        if elapsed > self.state.timeout {
            self.state.fired.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    /// Whether the predicate fired during the current (or last) evaluation.
    pub fn timed_out(&self) -> bool {
        self.state.fired.load(Ordering::SeqCst)
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Duration {
        self.state.timeout
    }

    /// Whether an evaluation is currently being timed.
    pub fn is_armed(&self) -> bool {
        self.state.armed_at.load(Ordering::SeqCst) != IDLE
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.state.origin.elapsed().as_nanos()).unwrap_or(IDLE - 1)
    }
}

/// Disarms the clock when dropped, whichever way the evaluation ends.
pub struct ArmedClock<'a> {
    clock: &'a ExecutionClock,
}

impl<'a> ArmedClock<'a> {
    /// Arm `clock` for the lifetime of the returned guard.
    pub fn start(clock: &'a ExecutionClock) -> Self {
        clock.arm();
        Self { clock }
    }
}

impl Drop for ArmedClock<'_> {
    fn drop(&mut self) {
        self.clock.disarm();
    }
}
