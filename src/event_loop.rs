//! The event loop dispatch core.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::fd::{FdEvents, FdRecord};
use crate::heap::TimerHeap;
use crate::provider::{EventProvider, FdToken, WaitTimeout};
use crate::signal::{SignalLists, SignalShared};
use crate::time::{Clock, MonotonicClock, Time};
use crate::timer::TimerState;

/// A stored handler: called on the loop thread, never reentrantly.
pub(crate) type Callback = Rc<RefCell<dyn FnMut()>>;

/// First fd token handed to watchers, see [`FdToken`].
const FIRST_FD_TOKEN: u64 = 2;

/// The loop state shared between the [`EventLoop`], its [`LoopHandle`]s
/// and the user-owned timer/watcher/signal handles.
pub(crate) struct LoopCore {
    clock: Box<dyn Clock>,
    pub(crate) provider: Box<dyn EventProvider>,
    stop: Cell<bool>,
    pub(crate) event_time: Cell<Time>,
    last_wait_time: Cell<Time>,
    pub(crate) timers: RefCell<TimerHeap>,
    pub(crate) watchers: RefCell<HashMap<FdToken, FdRecord>>,
    next_token: Cell<u64>,
    pub(crate) signal_handlers: RefCell<HashMap<usize, Callback>>,
    pub(crate) shared: Arc<SignalShared>,
}

impl LoopCore {
    pub(crate) fn next_fd_token(&self) -> FdToken {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        FdToken(token)
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stop.get()
    }

    /// Transition every timer that is due at `now` from Pending to
    /// Dispatch. Dispatch is the smallest order class, so the due timers
    /// rise to the heap root together; the bulk state change cannot break
    /// the heap order because a due timer's parent is necessarily due as
    /// well.
    fn prepare_timers_for_dispatch(&self, now: Time) {
        let mut timers = self.timers.borrow_mut();
        timers.find_all_le(now, &mut |record| {
            debug_assert_eq!(record.state, TimerState::Pending);
            record.state = TimerState::Dispatch;
        });
        #[cfg(debug_assertions)]
        timers.assert_valid();
    }

    /// Invoke the handler of every timer in Dispatch state, in heap
    /// order. Returns false iff the loop was stopped by a handler.
    fn dispatch_timers(&self) -> bool {
        loop {
            let handler = {
                let mut timers = self.timers.borrow_mut();
                let key = match timers.first() {
                    Some(key) => key,
                    None => return true,
                };
                let record = timers.record_mut(key);
                debug_assert!(record.state.in_heap());
                if record.state != TimerState::Dispatch {
                    // TempUnset, TempSet and Pending all sort after
                    // Dispatch: no more due timers this iteration.
                    return true;
                }
                // The handler observes its own timer as not set; the
                // fixup sinks the timer out of the Dispatch class and
                // uncovers the next due timer at the root.
                record.state = TimerState::TempUnset;
                timers.fixup(key);
                timers.record(key).handler.clone()
            };
            (&mut *handler.borrow_mut())();
            if self.stop.get() {
                return false;
            }
        }
    }

    /// Resolve the transient timer states left behind by dispatch and
    /// return the deadline to wait for.
    fn prepare_timers_for_wait(&self) -> WaitTimeout {
        let mut first_time = Time::MAX;
        {
            let mut timers = self.timers.borrow_mut();
            while let Some(key) = timers.first() {
                let state = timers.record(key).state;
                match state {
                    TimerState::TempUnset => {
                        timers.remove(key);
                        timers.record_mut(key).state = TimerState::Idle;
                    }
                    TimerState::TempSet => {
                        timers.record_mut(key).state = TimerState::Pending;
                        timers.fixup(key);
                    }
                    TimerState::Pending => {
                        first_time = timers.record(key).time;
                        break;
                    }
                    _ => unreachable!("timer state {:?} at finalize", state),
                }
            }
        }
        let changed = first_time != self.last_wait_time.get();
        self.last_wait_time.set(first_time);
        WaitTimeout {
            time: first_time,
            changed,
        }
    }

    /// Drain the queued async signals, invoking each handler exactly once.
    /// Returns false iff the loop was stopped by a handler.
    ///
    /// The pending list is spliced into the dispatch list as one batch
    /// first: a handler raising its own signal queues it on the fresh
    /// pending list and fires in a later iteration, so a self-raising
    /// signal cannot starve timer or fd dispatch.
    pub(crate) fn dispatch_async_signals(&self) -> bool {
        let mut lists = self
            .shared
            .lists
            .lock()
            .expect("signal lists mutex poisoned");
        debug_assert!(lists.is_dispatch_lonely());

        if lists.is_pending_lonely() {
            return true;
        }
        lists.splice_pending_into_dispatch();

        while let Some(key) = lists.first_dispatch() {
            lists.remove(key);
            drop(lists);

            let handler = self.signal_handlers.borrow().get(&key).cloned();
            debug_assert!(handler.is_some());
            if let Some(handler) = handler {
                trace!("dispatching async signal");
                (&mut *handler.borrow_mut())();
            }

            if self.stop.get() {
                return false;
            }
            lists = self
                .shared
                .lists
                .lock()
                .expect("signal lists mutex poisoned");
        }
        true
    }
}

/// A single-threaded event loop multiplexing three event sources: timers
/// on a monotonic clock, fd readiness and cross-thread [async signals].
///
/// All handlers run on the thread calling [`run`], serialized, in the
/// order: due timers (deadline order), then fd events, then async signals
/// (FIFO within a batch). Handlers may freely operate on any handle of
/// this loop, including the one currently dispatching, and may [`stop`]
/// the loop.
///
/// The loop does not own timers, watchers or signals; user code does, and
/// must drop them before the loop.
///
/// [async signals]: crate::AsyncSignal
/// [`run`]: EventLoop::run
/// [`stop`]: EventLoop::stop
pub struct EventLoop {
    core: Rc<LoopCore>,
}

impl EventLoop {
    /// Create an event loop backed by the operating system's readiness
    /// queue, see [`crate::unix::EpollProvider`].
    #[cfg(target_os = "linux")]
    pub fn new() -> io::Result<EventLoop> {
        let provider = crate::sys::EpollProvider::new()?;
        Ok(EventLoop::with_provider(Box::new(provider)))
    }

    /// Create an event loop backed by a custom [`EventProvider`].
    pub fn with_provider(provider: Box<dyn EventProvider>) -> EventLoop {
        EventLoop::with_parts(Box::new(MonotonicClock), provider)
    }

    /// Create an event loop from a clock and a provider.
    pub fn with_parts(clock: Box<dyn Clock>, provider: Box<dyn EventProvider>) -> EventLoop {
        let wakeup = provider.wakeup();
        let event_time = clock.now();
        EventLoop {
            core: Rc::new(LoopCore {
                clock,
                provider,
                stop: Cell::new(false),
                event_time: Cell::new(event_time),
                last_wait_time: Cell::new(Time::MAX),
                timers: RefCell::new(TimerHeap::new()),
                watchers: RefCell::new(HashMap::new()),
                next_token: Cell::new(FIRST_FD_TOKEN),
                signal_handlers: RefCell::new(HashMap::new()),
                shared: Arc::new(SignalShared {
                    lists: Mutex::new(SignalLists::new()),
                    wakeup,
                }),
            }),
        }
    }

    /// A cloneable handle to this loop, for use inside handlers.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            core: self.core.clone(),
        }
    }

    /// Run the loop until [`stop`] is observed.
    ///
    /// Returns `Ok(())` once stopped, or the first provider error. If the
    /// loop is already stopped this returns immediately.
    ///
    /// [`stop`]: EventLoop::stop
    pub fn run(&self) -> io::Result<()> {
        let core = &*self.core;
        if core.stop.get() {
            return Ok(());
        }

        loop {
            let now = core.clock.now();
            core.event_time.set(now);
            trace!("event loop iteration: event_time={:?}", now);

            core.prepare_timers_for_dispatch(now);
            if !core.dispatch_timers() {
                return Ok(());
            }

            if !core.provider.dispatch_events(&LoopControl { core })? {
                return Ok(());
            }

            let timeout = core.prepare_timers_for_wait();
            trace!(
                "waiting for events: time={:?}, changed={}",
                timeout.time,
                timeout.changed
            );
            core.provider.wait(timeout)?;
        }
    }

    /// Stop the loop.
    ///
    /// Sticky: [`run`] returns no later than after the currently running
    /// handler, and any later `run` call returns immediately.
    ///
    /// [`run`]: EventLoop::run
    pub fn stop(&self) {
        self.core.stop.set(true);
    }

    /// Read the loop's clock.
    pub fn now(&self) -> Time {
        self.core.clock.now()
    }

    /// The clock value sampled at the start of the current iteration.
    ///
    /// Frozen for the whole iteration: every handler of one iteration
    /// observes the same event time, and [`Timer::set_after`] computes
    /// deadlines relative to it.
    ///
    /// [`Timer::set_after`]: crate::Timer::set_after
    pub fn event_time(&self) -> Time {
        self.core.event_time.get()
    }

    #[cfg(test)]
    pub(crate) fn core(&self) -> &Rc<LoopCore> {
        &self.core
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.core.timers.borrow().live(),
            0,
            "event loop dropped with live timers"
        );
        debug_assert!(
            self.core.watchers.borrow().is_empty(),
            "event loop dropped with initialised fd watchers"
        );
        debug_assert!(
            self.core.signal_handlers.borrow().is_empty(),
            "event loop dropped with live async signals"
        );
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("event_time", &self.event_time())
            .finish()
    }
}

/// A cloneable reference to an [`EventLoop`].
///
/// Timer, watcher and signal constructors take a `LoopHandle`, and
/// handlers capture clones of it to reach the loop, since a handler
/// cannot borrow the `EventLoop` it runs on.
#[derive(Clone)]
pub struct LoopHandle {
    core: Rc<LoopCore>,
}

impl LoopHandle {
    /// Stop the loop, see [`EventLoop::stop`].
    pub fn stop(&self) {
        self.core.stop.set(true);
    }

    /// Read the loop's clock, see [`EventLoop::now`].
    pub fn now(&self) -> Time {
        self.core.clock.now()
    }

    /// The frozen per-iteration clock value, see
    /// [`EventLoop::event_time`].
    pub fn event_time(&self) -> Time {
        self.core.event_time.get()
    }

    pub(crate) fn core(&self) -> &Rc<LoopCore> {
        &self.core
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoopHandle").finish()
    }
}

/// The loop-side context an [`EventProvider`] dispatches through.
///
/// Only valid for the duration of one
/// [`dispatch_events`](EventProvider::dispatch_events) call.
pub struct LoopControl<'a> {
    core: &'a LoopCore,
}

impl LoopControl<'_> {
    /// Invoke the handler of the watcher registered under `token` with
    /// the observed readiness.
    ///
    /// Events for tokens with no live registration are dropped: the
    /// watcher was reset after the readiness was observed.
    pub fn fd_event(&self, token: FdToken, events: FdEvents) {
        let handler = match self.core.watchers.borrow().get(&token) {
            Some(record) => record.handler.clone(),
            None => {
                trace!("dropping event for stale fd token: {:?}", token);
                return;
            }
        };
        trace!("dispatching fd event: token={:?}, events={:?}", token, events);
        (&mut *handler.borrow_mut())(events);
    }

    /// Drain queued async signals, see the async-signal list protocol.
    /// Returns false iff the loop was stopped by a signal handler.
    pub fn dispatch_async_signals(&self) -> bool {
        self.core.dispatch_async_signals()
    }

    /// Whether the loop has been stopped. Providers check this after
    /// every handler invocation.
    pub fn stopped(&self) -> bool {
        self.core.stopped()
    }
}

impl fmt::Debug for LoopControl<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoopControl").finish()
    }
}
