//! Command buffer recording and execution.
//!
//! A command buffer records an ordered list of commands against a queue scope
//! and replays them when executed. Inlined payloads (buffer-update bytes) are
//! copied into a bump arena fed by the device's large block pool at record
//! time, so recorded data stays valid for the command buffer's whole lifetime
//! without per-command heap traffic.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use snafu::ensure;
use tracing::trace;

use crate::arena::{Arena, ArenaBox, BlockPool};
use crate::buffer::HostBuffer;
use crate::error::{InvalidArgumentSnafu, Result};
use crate::scope::Scope;

/// Whether a command buffer may be executed more than once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Valid for exactly one execution.
    OneShot,
    /// Replayable any number of times.
    Reusable,
}

/// Bitset of command kinds a command buffer is declared to contain.
///
/// Declared at creation and enforced at record time; queues are all
/// general-purpose, so categories gate recording rather than routing.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CommandCategories(u32);

impl CommandCategories {
    /// Callable work (dispatch stand-ins).
    pub const DISPATCH: Self = Self(1 << 0);
    /// Buffer updates and copies.
    pub const TRANSFER: Self = Self(1 << 1);
    /// All categories.
    pub const ANY: Self = Self(Self::DISPATCH.0 | Self::TRANSFER.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CommandCategories {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for CommandCategories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        if self.contains(Self::DISPATCH) {
            set.entry(&"dispatch");
        }
        if self.contains(Self::TRANSFER) {
            set.entry(&"transfer");
        }
        set.finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Recording,
    Sealed,
    Spent,
}

enum Command {
    Call(Box<dyn Fn() -> Result<()> + Send + Sync>),
    UpdateBuffer { target: Arc<HostBuffer>, offset: usize, payload: ArenaBox<[u8]> },
}

struct Inner {
    phase: Phase,
    commands: Vec<Command>,
    // Declared after `commands` so payload handles are unreachable by the
    // time the arena releases its blocks.
    arena: Arena,
}

/// Recorded command sequence bound to a queue scope.
pub struct CommandBuffer {
    mode: ExecutionMode,
    categories: CommandCategories,
    scope: Arc<Scope>,
    inner: Mutex<Inner>,
}

impl CommandBuffer {
    pub(crate) fn new(
        scope: Arc<Scope>,
        large_pool: &Arc<BlockPool>,
        mode: ExecutionMode,
        categories: CommandCategories,
    ) -> Self {
        Self {
            mode,
            categories,
            scope,
            inner: Mutex::new(Inner {
                phase: Phase::Recording,
                commands: Vec::new(),
                arena: Arena::new(Arc::clone(large_pool)),
            }),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn categories(&self) -> CommandCategories {
        self.categories
    }

    fn check_category(&self, required: CommandCategories, kind: &str) -> Result<()> {
        ensure!(
            self.categories.contains(required),
            InvalidArgumentSnafu {
                reason: format!(
                    "command buffer declared {:?} and cannot record {kind} commands",
                    self.categories
                ),
            }
        );
        Ok(())
    }

    pub fn command_count(&self) -> usize {
        self.inner.lock().commands.len()
    }

    fn recording<'a>(inner: &'a mut Inner) -> Result<&'a mut Inner> {
        ensure!(
            inner.phase == Phase::Recording,
            InvalidArgumentSnafu { reason: "command buffer is not recording" }
        );
        Ok(inner)
    }

    /// Record an arbitrary callable command. Requires the dispatch category.
    pub fn call(&self, f: impl Fn() -> Result<()> + Send + Sync + 'static) -> Result<()> {
        self.check_category(CommandCategories::DISPATCH, "dispatch")?;
        let mut inner = self.inner.lock();
        let inner = Self::recording(&mut inner)?;
        inner.commands.push(Command::Call(Box::new(f)));
        Ok(())
    }

    /// Record a copy of `bytes` into `target` at `offset`. The payload is
    /// captured into the arena now; the caller's slice need not outlive the
    /// call. Requires the transfer category.
    pub fn update_buffer(&self, target: Arc<HostBuffer>, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_category(CommandCategories::TRANSFER, "transfer")?;
        let end = offset.checked_add(bytes.len());
        ensure!(
            end.is_some_and(|end| end <= target.len()),
            InvalidArgumentSnafu {
                reason: format!(
                    "update of {} byte(s) at offset {offset} exceeds buffer length {}",
                    bytes.len(),
                    target.len()
                ),
            }
        );
        let mut inner = self.inner.lock();
        let inner = Self::recording(&mut inner)?;
        let payload = inner.arena.alloc_slice(bytes)?;
        inner.commands.push(Command::UpdateBuffer { target, offset, payload });
        Ok(())
    }

    /// Seal the command buffer; no further recording is accepted.
    pub fn finish(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::recording(&mut inner)?.phase = Phase::Sealed;
        Ok(())
    }

    /// Replay the recorded commands in order, stopping at the first failure.
    ///
    /// One-shot buffers transition to spent even when a command fails; a
    /// partial replay is not resumable.
    pub fn execute(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure!(
            inner.phase == Phase::Sealed,
            InvalidArgumentSnafu {
                reason: match inner.phase {
                    Phase::Recording => "command buffer was not finished before execution",
                    _ => "one-shot command buffer was already executed",
                },
            }
        );
        if self.mode == ExecutionMode::OneShot {
            inner.phase = Phase::Spent;
        }
        trace!(scope = %self.scope.name(), commands = inner.commands.len(), "executing command buffer");
        for command in &inner.commands {
            match command {
                Command::Call(f) => f()?,
                Command::UpdateBuffer { target, offset, payload } => {
                    // SAFETY: the payload was allocated from `inner.arena`,
                    // which outlives this borrow; the lock is held, so the
                    // arena cannot be dropped concurrently.
                    target.write(*offset, payload)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CommandBuffer")
            .field("mode", &self.mode)
            .field("categories", &self.categories)
            .field("scope", &self.scope.name())
            .field("phase", &inner.phase)
            .field("commands", &inner.commands.len())
            .finish()
    }
}
