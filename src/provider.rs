//! The OS readiness provider interface.
//!
//! The dispatch core is portable; everything that talks to the operating
//! system sits behind [`EventProvider`]. The crate ships an epoll-backed
//! provider on Linux (see [`crate::unix`]); embedders can supply their
//! own for other backends or for testing.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::event_loop::LoopControl;
use crate::fd::FdEvents;
use crate::time::Time;

/// Identifies an fd registration to the provider.
///
/// Tokens are allocated by the loop and never reused, so a readiness
/// event buffered for a watcher that was reset in the meantime can be
/// recognised as stale. Values 0 and 1 are reserved for provider-internal
/// registrations; the loop allocates from 2 upwards.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FdToken(pub(crate) u64);

impl FdToken {
    /// The token as the raw value carried in OS event data.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstruct a token from OS event data.
    pub fn from_u64(value: u64) -> FdToken {
        FdToken(value)
    }
}

/// The deadline for the next [`wait`], as computed by the loop after
/// finalizing timer states.
///
/// [`wait`]: EventProvider::wait
#[derive(Copy, Clone, Debug)]
pub struct WaitTimeout {
    /// Absolute deadline of the nearest pending timer, [`Time::MAX`] when
    /// no timer is pending.
    pub time: Time,
    /// Whether `time` differs from the previously communicated deadline.
    /// A provider that programs an OS timer can skip reprogramming when
    /// this is false.
    pub changed: bool,
}

/// Wakes a blocked [`wait`] from any thread.
///
/// [`wait`]: EventProvider::wait
pub trait Wakeup: Send + Sync {
    /// Cause an ongoing or the next `wait` to return promptly.
    ///
    /// Idempotent: multiple wakes before the next `wait` are as good as
    /// one.
    fn wake(&self) -> io::Result<()>;
}

/// An OS readiness backend for an [`EventLoop`].
///
/// Methods take `&self`: a provider uses interior mutability and must not
/// keep any internal borrow across the handler invocations it performs
/// through [`LoopControl`], since handlers may re-enter the provider via
/// watcher operations.
///
/// [`EventLoop`]: crate::EventLoop
pub trait EventProvider {
    /// The wakeup handle producers use to interrupt [`wait`].
    ///
    /// [`wait`]: EventProvider::wait
    fn wakeup(&self) -> Arc<dyn Wakeup>;

    /// Start watching `fd` for `events`, reporting readiness under
    /// `token`. The fd is not registered yet.
    fn init_fd(&self, fd: RawFd, events: FdEvents, token: FdToken) -> io::Result<()>;

    /// Change the interest mask of a registered fd.
    fn update_events(&self, fd: RawFd, events: FdEvents, token: FdToken) -> io::Result<()>;

    /// Stop watching a registered fd.
    fn reset_fd(&self, fd: RawFd) -> io::Result<()>;

    /// Dispatch the readiness observed by the last [`wait`]: invoke fd
    /// handlers via [`LoopControl::fd_event`] and drain queued async
    /// signals via [`LoopControl::dispatch_async_signals`].
    ///
    /// Returns `Ok(false)` iff the loop was stopped during dispatch.
    ///
    /// [`wait`]: EventProvider::wait
    fn dispatch_events(&self, control: &LoopControl) -> io::Result<bool>;

    /// Block until the deadline passes, a watched fd becomes ready, or
    /// [`Wakeup::wake`] is called. Spurious returns are allowed.
    fn wait(&self, timeout: WaitTimeout) -> io::Result<()>;
}
