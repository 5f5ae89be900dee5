//! Timers.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use log::trace;

use crate::event_loop::{LoopCore, LoopHandle};
use crate::time::Time;

/// The lifecycle state of a timer.
///
/// The low two bits are the heap order class: Dispatch (1) sorts before
/// TempUnset/TempSet (2), which sort before Pending (3). TempSet shares
/// an order class with TempUnset but is a distinct state, the extra bit
/// records that the handler re-armed the timer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum TimerState {
    /// Not armed, not in the heap.
    Idle = 0,
    /// Due this iteration, scheduled to fire.
    Dispatch = 1,
    /// Handler is running (or ran) and has not re-armed the timer.
    TempUnset = 0b010,
    /// Handler re-armed the timer, promoted to Pending at finalize.
    TempSet = 0b110,
    /// Armed with a deadline that has not passed.
    Pending = 3,
}

impl TimerState {
    const ORDER_MASK: u8 = 0b011;

    /// The heap order class of this state.
    pub(crate) fn order(self) -> u8 {
        self as u8 & TimerState::ORDER_MASK
    }

    pub(crate) fn in_heap(self) -> bool {
        self != TimerState::Idle
    }
}

/// A timer that invokes a handler on the loop thread at or after a chosen
/// instant on the loop's monotonic clock.
///
/// The timer is owned by user code and must be dropped before its loop.
/// All operations, including dropping, may be performed from within any
/// handler running on the same loop, even the timer's own handler: a
/// handler re-arming itself with [`set_after`] is the idiomatic way to
/// build a periodic timer.
///
/// The handler takes no arguments; it reaches its own timer through
/// surrounding user state, typically an `Rc<RefCell<Option<Timer>>>` slot
/// filled in after construction.
///
/// Firing is "not before": the handler runs in the first iteration whose
/// event time is at or past the deadline.
///
/// [`set_after`]: Timer::set_after
pub struct Timer {
    core: Rc<LoopCore>,
    key: usize,
}

impl Timer {
    /// Create a new, unarmed timer on `handle`'s loop.
    pub fn new<F>(handle: &LoopHandle, handler: F) -> Timer
    where
        F: FnMut() + 'static,
    {
        let core = handle.core().clone();
        let key = core
            .timers
            .borrow_mut()
            .alloc(Rc::new(RefCell::new(handler)));
        Timer { core, key }
    }

    /// Arm the timer to fire at `time`.
    ///
    /// Overwrites any previous deadline. Called from within a handler on
    /// this loop, the timer fires no earlier than the next iteration, even
    /// for a deadline in the past.
    pub fn set_at(&self, time: Time) {
        trace!("arming timer: time={:?}", time);
        let mut timers = self.core.timers.borrow_mut();
        let record = timers.record_mut(self.key);
        record.time = time;
        match record.state {
            // Inside the timer's own dispatch: record the re-arm and let
            // finalize promote it. The order class does not change between
            // TempUnset and TempSet, so no fixup is needed here.
            TimerState::TempUnset | TimerState::TempSet => {
                record.state = TimerState::TempSet;
            }
            TimerState::Idle => {
                record.state = TimerState::Pending;
                timers.insert(self.key);
            }
            TimerState::Dispatch | TimerState::Pending => {
                record.state = TimerState::Pending;
                timers.fixup(self.key);
            }
        }
    }

    /// Arm the timer to fire `duration` after the loop's current
    /// [event time].
    ///
    /// Relative deadlines armed during one iteration share the iteration's
    /// event time as their common reference, not a fresh clock read.
    ///
    /// [event time]: crate::EventLoop::event_time
    pub fn set_after(&self, duration: Duration) {
        self.set_at(self.core.event_time.get() + duration);
    }

    /// Disarm the timer. A no-op if the timer is not armed.
    pub fn unset(&self) {
        trace!("disarming timer");
        let mut timers = self.core.timers.borrow_mut();
        let record = timers.record_mut(self.key);
        match record.state {
            TimerState::TempUnset | TimerState::TempSet => {
                record.state = TimerState::TempUnset;
            }
            TimerState::Idle => {}
            TimerState::Dispatch | TimerState::Pending => {
                timers.remove(self.key);
                timers.record_mut(self.key).state = TimerState::Idle;
            }
        }
    }

    /// Whether the timer is armed.
    ///
    /// Inside the timer's own handler this is `false` until the handler
    /// re-arms the timer.
    pub fn is_set(&self) -> bool {
        let timers = self.core.timers.borrow();
        match timers.record(self.key).state {
            TimerState::Idle | TimerState::TempUnset => false,
            TimerState::Dispatch | TimerState::TempSet | TimerState::Pending => true,
        }
    }

    /// The last deadline passed to [`set_at`] or computed by
    /// [`set_after`]. Only meaningful while the timer [is set].
    ///
    /// [`set_at`]: Timer::set_at
    /// [`set_after`]: Timer::set_after
    /// [is set]: Timer::is_set
    pub fn deadline(&self) -> Time {
        self.core.timers.borrow().record(self.key).time
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let record = {
            let mut timers = self.core.timers.borrow_mut();
            if timers.record(self.key).state.in_heap() {
                timers.remove(self.key);
            }
            timers.release(self.key)
        };
        // Dropping the handler can run arbitrary user drop code, do it
        // with no loop structure borrowed.
        drop(record);
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("is_set", &self.is_set())
            .field("deadline", &self.deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Timer;
    use crate::event_loop::testing::mock_loop;
    use crate::time::Time;

    #[test]
    fn starts_idle() {
        let (event_loop, _) = mock_loop();
        let timer = Timer::new(&event_loop.handle(), || {});
        assert!(!timer.is_set());
        assert_eq!(event_loop.core().timers.borrow().armed(), 0);
    }

    #[test]
    fn set_at_arms() {
        let (event_loop, _) = mock_loop();
        let timer = Timer::new(&event_loop.handle(), || {});

        timer.set_at(Time::from_nanos(10));
        assert!(timer.is_set());
        assert_eq!(timer.deadline(), Time::from_nanos(10));
        assert_eq!(event_loop.core().timers.borrow().armed(), 1);
    }

    #[test]
    fn set_at_twice_keeps_last_deadline() {
        let (event_loop, _) = mock_loop();
        let timer = Timer::new(&event_loop.handle(), || {});

        timer.set_at(Time::from_nanos(100));
        timer.set_at(Time::from_nanos(10));
        assert_eq!(timer.deadline(), Time::from_nanos(10));
        // Still a single heap entry.
        assert_eq!(event_loop.core().timers.borrow().armed(), 1);
    }

    #[test]
    fn unset_disarms() {
        let (event_loop, _) = mock_loop();
        let timer = Timer::new(&event_loop.handle(), || {});

        timer.set_at(Time::from_nanos(10));
        timer.unset();
        assert!(!timer.is_set());
        assert_eq!(event_loop.core().timers.borrow().armed(), 0);

        // And again, now a no-op.
        timer.unset();
        assert!(!timer.is_set());
    }

    #[test]
    fn set_after_uses_event_time() {
        let (event_loop, time) = mock_loop();
        time.set(Time::from_nanos(1_000));
        let timer = Timer::new(&event_loop.handle(), || {});

        // The event time is frozen at loop creation until an iteration
        // runs, a later clock change must not shift the deadline.
        let event_time = event_loop.event_time();
        timer.set_after(Duration::from_nanos(50));
        assert_eq!(timer.deadline(), event_time + Duration::from_nanos(50));
    }

    #[test]
    fn drop_removes_armed_timer() {
        let (event_loop, _) = mock_loop();
        let timer = Timer::new(&event_loop.handle(), || {});
        timer.set_at(Time::from_nanos(10));
        drop(timer);
        assert_eq!(event_loop.core().timers.borrow().live(), 0);
        assert_eq!(event_loop.core().timers.borrow().armed(), 0);
    }
}
