use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;
use std::sync::Arc;

use log::error;

use crate::event_loop::LoopControl;
use crate::fd::FdEvents;
use crate::provider::{EventProvider, FdToken, WaitTimeout, Wakeup};
use crate::time::Time;

use super::awakener::EventFd;

/// Maximum number of events consumed from the OS per wait.
const EVENTS_CAP: usize = 128;

/// Provider-internal registrations, see [`FdToken`].
const WAKEUP_TOKEN: u64 = 0;
const TIMER_TOKEN: u64 = 1;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// The Linux [`EventProvider`]: an epoll instance watching the
/// registered fds, a `timerfd` programmed with the loop's next deadline
/// and an `eventfd` as the cross-thread wakeup.
///
/// The timer deadline is programmed absolute against `CLOCK_MONOTONIC`,
/// which must also be the loop's clock (it is, with
/// [`MonotonicClock`]). The `changed` hint in [`WaitTimeout`] skips
/// reprogramming when the deadline has not moved.
///
/// [`MonotonicClock`]: crate::MonotonicClock
pub struct EpollProvider {
    epfd: RawFd,
    timer: File,
    awakener: Arc<EventFd>,
    /// Readiness observed by the last `wait`, dispatched afterwards.
    ready: RefCell<Vec<libc::epoll_event>>,
}

impl EpollProvider {
    /// Create the provider, making the `epoll_create1`, `timerfd_create`
    /// and `eventfd` syscalls.
    pub fn new() -> io::Result<EpollProvider> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error());
        }

        match EpollProvider::setup(epfd) {
            Ok(provider) => Ok(provider),
            Err(err) => {
                let _ = unsafe { libc::close(epfd) };
                Err(err)
            }
        }
    }

    fn setup(epfd: RawFd) -> io::Result<EpollProvider> {
        let timer_fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if timer_fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let timer = unsafe { File::from_raw_fd(timer_fd) };
        let awakener = Arc::new(EventFd::new()?);

        let provider = EpollProvider {
            epfd,
            timer,
            awakener,
            ready: RefCell::new(Vec::with_capacity(EVENTS_CAP)),
        };
        provider.ctl(
            libc::EPOLL_CTL_ADD,
            provider.timer.as_raw_fd(),
            libc::EPOLLIN as u32,
            TIMER_TOKEN,
        )?;
        provider.ctl(
            libc::EPOLL_CTL_ADD,
            provider.awakener.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKEUP_TOKEN,
        )?;
        Ok(provider)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut epoll_event = libc::epoll_event {
            events,
            u64: token,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epoll_event) } == -1 {
            // Possible errors:
            // EBADF, EEXIST, ENOENT, EPERM: user error.
            // EINVAL, ELOOP: shouldn't happen.
            // ENOMEM, ENOSPC: can't handle.
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Program the timerfd with the absolute deadline; `Time::MAX`
    /// disarms it.
    fn program_timer(&self, time: Time) -> io::Result<()> {
        let it_value = if time == Time::MAX {
            // Zero disarms the timer.
            libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            }
        } else {
            // A deadline at the clock's epoch would read as "disarm";
            // one nanosecond in is close enough.
            let nanos = time.as_nanos().max(1);
            libc::timespec {
                tv_sec: (nanos / NANOS_PER_SEC) as libc::time_t,
                tv_nsec: (nanos % NANOS_PER_SEC) as libc::c_long,
            }
        };
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value,
        };
        let ret = unsafe {
            libc::timerfd_settime(
                self.timer.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &spec,
                ptr::null_mut(),
            )
        };
        if ret == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn drain_timer(&self) -> io::Result<()> {
        let mut buf = [0; 8];
        match (&self.timer).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl EventProvider for EpollProvider {
    fn wakeup(&self) -> Arc<dyn Wakeup> {
        self.awakener.clone()
    }

    fn init_fd(&self, fd: RawFd, events: FdEvents, token: FdToken) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_ADD,
            fd,
            to_epoll_events(events),
            token.as_u64(),
        )
    }

    fn update_events(&self, fd: RawFd, events: FdEvents, token: FdToken) -> io::Result<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            to_epoll_events(events),
            token.as_u64(),
        )
    }

    fn reset_fd(&self, fd: RawFd) -> io::Result<()> {
        if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn dispatch_events(&self, control: &LoopControl) -> io::Result<bool> {
        let events = mem::replace(&mut *self.ready.borrow_mut(), Vec::new());
        let mut stopped = false;
        for ep_event in &events {
            match ep_event.u64 {
                WAKEUP_TOKEN => {
                    self.awakener.drain()?;
                    if !control.dispatch_async_signals() {
                        stopped = true;
                        break;
                    }
                }
                // The wait returned because a deadline passed; the loop
                // picks the due timers up from the heap by itself.
                TIMER_TOKEN => self.drain_timer()?,
                token => {
                    control.fd_event(FdToken::from_u64(token), to_fd_events(ep_event.events));
                    if control.stopped() {
                        stopped = true;
                        break;
                    }
                }
            }
        }

        // Hand the allocation back for the next wait.
        let mut ready = events;
        ready.clear();
        *self.ready.borrow_mut() = ready;
        Ok(!stopped)
    }

    fn wait(&self, timeout: WaitTimeout) -> io::Result<()> {
        if timeout.changed {
            self.program_timer(timeout.time)?;
        }

        let mut ep_events = [libc::epoll_event { events: 0, u64: 0 }; EVENTS_CAP];
        let n_events = loop {
            let n_events = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    ep_events.as_mut_ptr(),
                    EVENTS_CAP as libc::c_int,
                    -1,
                )
            };
            if n_events != -1 {
                break n_events;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };

        let mut ready = self.ready.borrow_mut();
        debug_assert!(ready.is_empty());
        ready.extend_from_slice(&ep_events[..n_events as usize]);
        Ok(())
    }
}

impl Drop for EpollProvider {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epfd) } == -1 {
            // Possible errors:
            // - EBADF, EIO: can't recover.
            // - EINTR: could try again but we can't be sure if the file
            //          descriptor was closed or not, so to be safe we
            //          don't close it again.
            let err = io::Error::last_os_error();
            error!("error closing epoll: {}", err);
        }
    }
}

impl fmt::Debug for EpollProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EpollProvider")
            .field("epfd", &self.epfd)
            .field("timer", &self.timer)
            .field("awakener", &self.awakener)
            .finish()
    }
}

/// Convert an interest mask into epoll events.
///
/// Error and hangup conditions are always reported by epoll, they need no
/// bits; `EPOLLRDHUP` and `EPOLLPRI` are requested unconditionally to
/// match. Registrations are level-triggered.
fn to_epoll_events(events: FdEvents) -> u32 {
    let mut epoll = libc::EPOLLPRI | libc::EPOLLRDHUP;
    if events.is_read() {
        epoll |= libc::EPOLLIN;
    }
    if events.is_write() {
        epoll |= libc::EPOLLOUT;
    }
    epoll as u32
}

/// Convert epoll events into observed [`FdEvents`].
fn to_fd_events(epoll: u32) -> FdEvents {
    let mut events = FdEvents::empty();
    if contains_flag(epoll, libc::EPOLLIN | libc::EPOLLPRI) {
        events |= FdEvents::READ;
    }
    if contains_flag(epoll, libc::EPOLLOUT) {
        events |= FdEvents::WRITE;
    }
    if contains_flag(epoll, libc::EPOLLERR) {
        events |= FdEvents::ERROR;
    }
    if contains_flag(epoll, libc::EPOLLRDHUP | libc::EPOLLHUP) {
        events |= FdEvents::HUP;
    }
    events
}

/// Whether `flags` contains any bit of `flag`.
fn contains_flag(flags: u32, flag: libc::c_int) -> bool {
    (flags & flag as u32) != 0
}

#[cfg(test)]
mod tests {
    use super::{to_epoll_events, to_fd_events, EpollProvider};
    use crate::fd::FdEvents;
    use crate::time::Time;

    #[test]
    fn interest_translation() {
        let epoll = to_epoll_events(FdEvents::READ | FdEvents::WRITE);
        assert_ne!(epoll & libc::EPOLLIN as u32, 0);
        assert_ne!(epoll & libc::EPOLLOUT as u32, 0);
        let epoll = to_epoll_events(FdEvents::empty());
        assert_eq!(epoll & libc::EPOLLIN as u32, 0);
        assert_eq!(epoll & libc::EPOLLOUT as u32, 0);
    }

    #[test]
    fn readiness_translation() {
        assert_eq!(to_fd_events(libc::EPOLLIN as u32), FdEvents::READ);
        assert_eq!(to_fd_events(libc::EPOLLPRI as u32), FdEvents::READ);
        assert_eq!(to_fd_events(libc::EPOLLOUT as u32), FdEvents::WRITE);
        assert_eq!(to_fd_events(libc::EPOLLERR as u32), FdEvents::ERROR);
        assert_eq!(to_fd_events(libc::EPOLLHUP as u32), FdEvents::HUP);
        assert_eq!(to_fd_events(libc::EPOLLRDHUP as u32), FdEvents::HUP);
    }

    #[test]
    fn create_and_program() {
        let provider = EpollProvider::new().unwrap();
        provider.program_timer(Time::MAX).unwrap();
        provider.program_timer(Time::from_nanos(1)).unwrap();
    }
}
