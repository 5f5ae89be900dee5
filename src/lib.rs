//! A single-threaded, callback-based event loop.
//!
//! [`EventLoop`] multiplexes three event sources onto the thread that
//! calls [`run`]:
//!
//!  * [`Timer`]: invokes a handler at or after a chosen instant on a
//!    monotonic clock.
//!  * [`FdWatcher`]: invokes a handler when the OS reports readiness on a
//!    watched file descriptor.
//!  * [`AsyncSignal`]: invokes a handler on the loop thread after any
//!    thread raised the signal.
//!
//! Handlers run serialized, in the order: due timers (deadline order),
//! then fd events, then async signals. A handler may freely set, unset or
//! drop any handle of its loop, including the one it runs for, and may
//! [`stop`] the loop; the loop's internal bookkeeping is built to stay
//! consistent under this kind of reentrancy.
//!
//! [`run`]: EventLoop::run
//! [`stop`]: EventLoop::stop
//!
//! # Threading
//!
//! Everything except [`AsyncSignal::signal`] (via [`SignalNotifier`]) and
//! the provider's [`Wakeup`] is confined to the loop thread; the handle
//! types do not implement [`Send`], so the compiler enforces this.
//!
//! # Ownership
//!
//! The loop does not own timers, watchers or signals. User code holds
//! them, must keep them alive while they are armed and must drop them
//! before the loop.
//!
//! # Usage
//!
//! The example below runs a loop until a timer fires.
//!
//! ```
//! # fn main() -> std::io::Result<()> {
//! use std::time::Duration;
//!
//! use rhea::{EventLoop, Timer};
//!
//! let event_loop = EventLoop::new()?;
//! let handle = event_loop.handle();
//!
//! // Handlers capture clones of the loop handle to reach the loop.
//! let stopper = handle.clone();
//! let timer = Timer::new(&handle, move || stopper.stop());
//! timer.set_after(Duration::from_millis(10));
//!
//! event_loop.run()
//! # }
//! ```
//!
//! Periodic work is a timer whose handler re-arms it; the timer is
//! reached through a shared slot:
//!
//! ```
//! # fn main() -> std::io::Result<()> {
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! use rhea::{EventLoop, Timer};
//!
//! const INTERVAL: Duration = Duration::from_millis(5);
//!
//! let event_loop = EventLoop::new()?;
//! let handle = event_loop.handle();
//!
//! let slot: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
//! let ticker = {
//!     let slot = slot.clone();
//!     let handle = handle.clone();
//!     let mut ticks = 0;
//!     Timer::new(&handle.clone(), move || {
//!         ticks += 1;
//!         if ticks < 3 {
//!             slot.borrow().as_ref().unwrap().set_after(INTERVAL);
//!         } else {
//!             handle.stop();
//!         }
//!     })
//! };
//! ticker.set_after(INTERVAL);
//! *slot.borrow_mut() = Some(ticker);
//!
//! event_loop.run()?;
//! # drop(slot.borrow_mut().take());
//! #     Ok(())
//! # }
//! ```

#![warn(
    anonymous_parameters,
    bare_trait_objects,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_results,
    variant_size_differences
)]

mod event_loop;
mod fd;
mod heap;
mod provider;
mod signal;
mod sys;
mod time;
mod timer;

pub use crate::event_loop::{EventLoop, LoopControl, LoopHandle};
pub use crate::fd::{FdEvents, FdWatcher};
pub use crate::provider::{EventProvider, FdToken, WaitTimeout, Wakeup};
pub use crate::signal::{AsyncSignal, SignalNotifier};
pub use crate::time::{Clock, MonotonicClock, Time};
pub use crate::timer::Timer;

#[cfg(target_os = "linux")]
pub mod unix {
    //! Unix only extensions.

    pub use crate::sys::{EpollProvider, EventFd};
}
