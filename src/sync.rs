//! Timeline semaphores and multi-semaphore waiting.
//!
//! A timeline semaphore is a monotonically increasing 64-bit counter; waiters
//! block until it reaches or exceeds a target value. Semaphores order work
//! within and across queues without the submitting threads coordinating with
//! each other.
//!
//! # Design
//!
//! - `AtomicU64` for the counter, `parking_lot` mutex/condvar machinery for
//!   blocked waiters.
//! - Signaling broadcasts to every registered waiter; waiters re-check their
//!   own predicate after every wake, so spurious wakes are harmless.
//! - Failure is a one-way transition to the sentinel value `u64::MAX` with a
//!   retained status; every subsequent query, signal, and wait surfaces that
//!   status. No recovery path exists: downstream consumers create a new
//!   semaphore to continue.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use snafu::ensure;

use crate::error::{DeadlineExceededSnafu, Error, InvalidArgumentSnafu, Result};

/// Sentinel value marking a semaphore as permanently failed.
pub const FAILURE_VALUE: u64 = u64::MAX;

/// Absolute time limit for a blocking operation.
///
/// `Now` gives poll semantics: the operation evaluates its predicate once and
/// returns without blocking.
#[derive(Clone, Copy, Debug)]
pub enum Deadline {
    /// Do not block at all.
    Now,
    /// Block until the given instant.
    At(Instant),
    /// Block until resolved.
    Forever,
}

impl Deadline {
    /// Deadline `timeout` from now; a zero timeout is a poll.
    pub fn after(timeout: Duration) -> Self {
        if timeout.is_zero() { Deadline::Now } else { Deadline::At(Instant::now() + timeout) }
    }
}

/// Aggregation mode for [`wait_semaphores`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Resolve once every member reaches its target value.
    All,
    /// Resolve as soon as one member reaches its target value.
    Any,
}

/// One blocked waiter, registered with every semaphore it waits on.
///
/// `notify` may arrive between a waiter's predicate check and its park; the
/// notified flag is latched under the lock so that wake-up is never lost.
pub struct WaitToken {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl WaitToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { notified: Mutex::new(false), cond: Condvar::new() })
    }

    /// Wake the owning waiter so it re-evaluates its predicates.
    pub fn notify(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.cond.notify_all();
    }

    /// Park until notified or the deadline passes. Returns `false` on
    /// deadline expiry.
    fn wait(&self, deadline: Deadline) -> bool {
        let mut notified = self.notified.lock();
        while !*notified {
            match deadline {
                Deadline::Now => return false,
                Deadline::Forever => self.cond.wait(&mut notified),
                Deadline::At(instant) => {
                    if self.cond.wait_until(&mut notified, instant).timed_out() {
                        break;
                    }
                }
            }
        }
        let was_notified = *notified;
        *notified = false;
        was_notified
    }
}

/// Contract every semaphore backend satisfies.
///
/// Queue and device logic is agnostic to the backend: a GPU-native timeline
/// or an emulated binary-semaphore pool plugs in here as long as it keeps the
/// monotonicity and one-way-failure semantics.
pub trait Semaphore: Send + Sync + fmt::Debug {
    /// Current value. Non-blocking, acquire-ordered; returns the retained
    /// failure status once the semaphore has failed.
    fn query(&self) -> Result<u64>;

    /// Advance to `value`, which must be strictly greater than the current
    /// value, then wake all waiters.
    fn signal(&self, value: u64) -> Result<()>;

    /// Permanently fail the semaphore, retaining `status` for all current and
    /// future waiters. Only the first failure's status is kept.
    fn fail(&self, status: Error);

    /// Block until the value reaches `value`, the semaphore fails, or the
    /// deadline passes.
    fn wait(&self, value: u64, deadline: Deadline) -> Result<()>;

    /// Register a multi-wait token to be notified on every update.
    fn register_waiter(&self, token: &Arc<WaitToken>);

    /// Remove a previously registered token. Waiters deregister on every
    /// return path so registrations never leak.
    fn deregister_waiter(&self, token: &Arc<WaitToken>);
}

/// A `(semaphore, target value)` pair in a batch's wait-list.
#[derive(Clone, Debug)]
pub struct SemaphoreWait {
    pub semaphore: Arc<dyn Semaphore>,
    pub value: u64,
}

/// A `(semaphore, new value)` pair in a batch's signal-list.
#[derive(Clone, Debug)]
pub struct SemaphoreSignal {
    pub semaphore: Arc<dyn Semaphore>,
    pub value: u64,
}

struct SemaphoreState {
    failure: Option<Arc<Error>>,
    waiters: Vec<Arc<WaitToken>>,
}

/// In-process timeline semaphore backend.
pub struct TimelineSemaphore {
    value: AtomicU64,
    state: Mutex<SemaphoreState>,
}

impl TimelineSemaphore {
    pub fn new(initial_value: u64) -> Result<Arc<Self>> {
        ensure!(
            initial_value != FAILURE_VALUE,
            InvalidArgumentSnafu { reason: format!("initial value {initial_value} is the failure sentinel") }
        );
        Ok(Arc::new(Self {
            value: AtomicU64::new(initial_value),
            state: Mutex::new(SemaphoreState { failure: None, waiters: Vec::new() }),
        }))
    }

    fn retained_failure(&self) -> Arc<Error> {
        // The sentinel is only ever stored after the slot is written, under
        // the state lock.
        self.state.lock().failure.clone().expect("failure sentinel observed without retained status")
    }

    fn notify_waiters(&self) {
        let waiters = self.state.lock().waiters.clone();
        for waiter in waiters {
            waiter.notify();
        }
    }
}

impl Semaphore for TimelineSemaphore {
    fn query(&self) -> Result<u64> {
        let value = self.value.load(Ordering::Acquire);
        if value == FAILURE_VALUE {
            return Err(Error::Failed { status: self.retained_failure() });
        }
        Ok(value)
    }

    fn signal(&self, value: u64) -> Result<()> {
        ensure!(
            value != FAILURE_VALUE,
            InvalidArgumentSnafu { reason: "cannot signal the failure sentinel directly" }
        );
        let mut current = self.value.load(Ordering::Acquire);
        loop {
            if current == FAILURE_VALUE {
                return Err(Error::Failed { status: self.retained_failure() });
            }
            ensure!(
                value > current,
                InvalidArgumentSnafu {
                    reason: format!("signal value {value} is not monotonically increasing (current {current})"),
                }
            );
            match self.value.compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.notify_waiters();
        Ok(())
    }

    fn fail(&self, status: Error) {
        {
            let mut state = self.state.lock();
            if state.failure.is_some() {
                // Already failed; the first status is the retained one.
                return;
            }
            state.failure = Some(status.retained());
            self.value.store(FAILURE_VALUE, Ordering::Release);
        }
        self.notify_waiters();
    }

    fn wait(&self, value: u64, deadline: Deadline) -> Result<()> {
        wait_semaphores(WaitMode::All, &[(self as &dyn Semaphore, value)], deadline)
    }

    fn register_waiter(&self, token: &Arc<WaitToken>) {
        self.state.lock().waiters.push(Arc::clone(token));
    }

    fn deregister_waiter(&self, token: &Arc<WaitToken>) {
        self.state.lock().waiters.retain(|waiter| !Arc::ptr_eq(waiter, token));
    }
}

impl fmt::Debug for TimelineSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value.load(Ordering::Acquire);
        let mut s = f.debug_struct("TimelineSemaphore");
        if value == FAILURE_VALUE {
            s.field("failed", &self.state.lock().failure);
        } else {
            s.field("value", &value);
        }
        s.finish()
    }
}

enum Poll {
    Satisfied,
    Pending,
    Failed(Arc<Error>),
}

fn evaluate(mode: WaitMode, waits: &[(&dyn Semaphore, u64)]) -> Poll {
    match mode {
        WaitMode::All => {
            for &(semaphore, target) in waits {
                match semaphore.query() {
                    // No later signal can recover a failed member, so a
                    // failure resolves an ALL-wait eagerly.
                    Err(error) => return Poll::Failed(error.retained()),
                    Ok(value) if value < target => return Poll::Pending,
                    Ok(_) => {}
                }
            }
            Poll::Satisfied
        }
        WaitMode::Any => {
            let mut first_failure = None;
            let mut failed = 0usize;
            for &(semaphore, target) in waits {
                match semaphore.query() {
                    Err(error) => {
                        failed += 1;
                        first_failure.get_or_insert(error.retained());
                    }
                    Ok(value) if value >= target => return Poll::Satisfied,
                    Ok(_) => {}
                }
            }
            if failed == waits.len()
                && let Some(status) = first_failure
            {
                return Poll::Failed(status);
            }
            Poll::Pending
        }
    }
}

/// Block until the wait-list resolves under `mode`, the deadline passes, or
/// failure makes resolution impossible.
///
/// The calling thread registers one token with every semaphore in the list,
/// re-evaluates all predicates after each wake, and deregisters from all of
/// them before returning, whatever the outcome.
pub fn wait_semaphores(mode: WaitMode, waits: &[(&dyn Semaphore, u64)], deadline: Deadline) -> Result<()> {
    if waits.is_empty() {
        return Ok(());
    }

    // Fast path: resolved without registering anything.
    match evaluate(mode, waits) {
        Poll::Satisfied => return Ok(()),
        Poll::Failed(status) => return Err(Error::Failed { status }),
        Poll::Pending => {}
    }

    let token = WaitToken::new();
    for &(semaphore, _) in waits {
        semaphore.register_waiter(&token);
    }

    let result = loop {
        match evaluate(mode, waits) {
            Poll::Satisfied => break Ok(()),
            Poll::Failed(status) => break Err(Error::Failed { status }),
            Poll::Pending => {}
        }
        if !token.wait(deadline) {
            // Deadline passed; a signal may have raced the expiry, so decide
            // from one final evaluation.
            break match evaluate(mode, waits) {
                Poll::Satisfied => Ok(()),
                Poll::Failed(status) => Err(Error::Failed { status }),
                Poll::Pending => DeadlineExceededSnafu {
                    reason: format!("waiting for {} of {} semaphore(s)", mode_label(mode), waits.len()),
                }
                .fail(),
            };
        }
    };

    for &(semaphore, _) in waits {
        semaphore.deregister_waiter(&token);
    }
    result
}

fn mode_label(mode: WaitMode) -> &'static str {
    match mode {
        WaitMode::All => "all",
        WaitMode::Any => "any",
    }
}
