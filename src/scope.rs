//! Task scopes: named groupings of in-flight work.
//!
//! Every queue owns one scope. Tasks enter it at submission and leave it at
//! retirement; `wait_idle` blocks until the count drains. A scope also latches
//! the first execution failure observed inside it so device teardown can report
//! what went wrong even after the semaphores involved are gone.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{DeadlineExceededSnafu, Error, Result};
use crate::sync::Deadline;

struct ScopeState {
    pending: usize,
    failure: Option<Arc<Error>>,
}

/// Named group of in-flight tasks with idle-waiting and failure capture.
pub struct Scope {
    name: String,
    state: Mutex<ScopeState>,
    idle: Condvar,
}

impl Scope {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(ScopeState { pending: 0, failure: None }),
            idle: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks submitted but not yet retired.
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// First failure captured in this scope, if any.
    pub fn status(&self) -> Result<()> {
        match &self.state.lock().failure {
            Some(status) => Err(Error::Failed { status: Arc::clone(status) }),
            None => Ok(()),
        }
    }

    /// Account a task entering the scope.
    pub fn begin(&self) {
        self.state.lock().pending += 1;
    }

    /// Account a task leaving the scope, waking idle-waiters on the last one.
    pub fn end(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending > 0, "scope task count underflow");
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.idle.notify_all();
        }
    }

    /// Latch `status` as the scope's failure. Only the first one is kept.
    pub fn fail(&self, status: Error) {
        let mut state = self.state.lock();
        if state.failure.is_none() {
            warn!(scope = %self.name, %status, "scope captured task failure");
            state.failure = Some(status.retained());
        }
    }

    /// Block until every task in the scope has retired, then surface the
    /// captured failure if one was latched.
    pub fn wait_idle(&self, deadline: Deadline) -> Result<()> {
        let mut state = self.state.lock();
        while state.pending > 0 {
            match deadline {
                Deadline::Now => {
                    return DeadlineExceededSnafu {
                        reason: format!("scope {:?} has {} pending task(s)", self.name, state.pending),
                    }
                    .fail();
                }
                Deadline::Forever => self.idle.wait(&mut state),
                Deadline::At(instant) => {
                    if self.idle.wait_until(&mut state, instant).timed_out() && state.pending > 0 {
                        return DeadlineExceededSnafu {
                            reason: format!("scope {:?} has {} pending task(s)", self.name, state.pending),
                        }
                        .fail();
                    }
                }
            }
        }
        match &state.failure {
            Some(status) => Err(Error::Failed { status: Arc::clone(status) }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("pending", &state.pending)
            .field("failed", &state.failure.is_some())
            .finish()
    }
}
