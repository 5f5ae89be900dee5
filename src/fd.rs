//! File descriptor readiness watchers.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use bitflags::bitflags;
use log::{error, trace};

use crate::event_loop::{LoopCore, LoopHandle};
use crate::provider::FdToken;

bitflags! {
    /// A set of fd readiness event kinds.
    ///
    /// Used both as the interest mask of an [`FdWatcher`] and as the
    /// readiness reported to its handler. [`ERROR`] and [`HUP`] conditions
    /// are always reported, whether or not they are in the interest mask.
    ///
    /// No bits outside the defined set are ever set.
    ///
    /// [`ERROR`]: FdEvents::ERROR
    /// [`HUP`]: FdEvents::HUP
    ///
    /// # Examples
    ///
    /// ```
    /// use rhea::FdEvents;
    ///
    /// let events = FdEvents::READ | FdEvents::WRITE;
    ///
    /// assert!(events.is_read());
    /// assert!(events.is_write());
    /// assert!(!events.is_error());
    /// ```
    pub struct FdEvents: u8 {
        /// Readable readiness.
        const READ  = 0b0000_0001;
        /// Writable readiness.
        const WRITE = 0b0000_0010;
        /// Error condition on the descriptor.
        const ERROR = 0b0000_0100;
        /// The peer hung up.
        const HUP   = 0b0000_1000;
    }
}

impl FdEvents {
    /// Returns true if the value includes readable readiness.
    #[inline]
    pub fn is_read(&self) -> bool {
        self.contains(FdEvents::READ)
    }

    /// Returns true if the value includes writable readiness.
    #[inline]
    pub fn is_write(&self) -> bool {
        self.contains(FdEvents::WRITE)
    }

    /// Returns true if the value includes an error condition.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(FdEvents::ERROR)
    }

    /// Returns true if the value includes a hangup.
    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(FdEvents::HUP)
    }
}

/// The loop-side registration of an [`FdWatcher`].
pub(crate) struct FdRecord {
    pub(crate) fd: RawFd,
    pub(crate) events: FdEvents,
    pub(crate) handler: Rc<RefCell<dyn FnMut(FdEvents)>>,
}

/// A watcher binding a file descriptor and an interest mask to a handler.
///
/// While initialised, the handler is invoked on the loop thread with the
/// readiness the OS reported. Registration is 1:1: a descriptor must not
/// be registered with the same loop twice.
///
/// The watcher does not own the descriptor; the descriptor must stay open
/// while the watcher is initialised. The watcher must be dropped before
/// its loop, and its handler is never invoked again after [`reset`]
/// returns.
///
/// [`reset`]: FdWatcher::reset
pub struct FdWatcher {
    core: Rc<LoopCore>,
    handler: Rc<RefCell<dyn FnMut(FdEvents)>>,
    token: Cell<Option<FdToken>>,
    fd: Cell<RawFd>,
    events: Cell<FdEvents>,
}

impl FdWatcher {
    /// Create a new, uninitialised watcher on `handle`'s loop.
    pub fn new<F>(handle: &LoopHandle, handler: F) -> FdWatcher
    where
        F: FnMut(FdEvents) + 'static,
    {
        FdWatcher {
            core: handle.core().clone(),
            handler: Rc::new(RefCell::new(handler)),
            token: Cell::new(None),
            fd: Cell::new(-1),
            events: Cell::new(FdEvents::empty()),
        }
    }

    /// Start watching `fd` for `events`.
    ///
    /// # Panics
    ///
    /// If the watcher is already initialised, or `fd` is negative.
    pub fn init(&self, fd: RawFd, events: FdEvents) -> io::Result<()> {
        assert!(self.token.get().is_none(), "fd watcher already initialised");
        assert!(fd >= 0, "invalid file descriptor");
        trace!("initialising fd watcher: fd={}, events={:?}", fd, events);

        let token = self.core.next_fd_token();
        self.core.provider.init_fd(fd, events, token)?;

        let record = FdRecord {
            fd,
            events,
            handler: self.handler.clone(),
        };
        drop(self.core.watchers.borrow_mut().insert(token, record));
        self.token.set(Some(token));
        self.fd.set(fd);
        self.events.set(events);
        Ok(())
    }

    /// Change the interest mask of an initialised watcher.
    ///
    /// A no-op if the mask is unchanged.
    ///
    /// # Panics
    ///
    /// If the watcher is not initialised.
    pub fn update(&self, events: FdEvents) -> io::Result<()> {
        let token = self.token.get().expect("fd watcher not initialised");
        if events == self.events.get() {
            return Ok(());
        }
        trace!("updating fd watcher: fd={}, events={:?}", self.fd.get(), events);

        self.core.provider.update_events(self.fd.get(), events, token)?;
        self.events.set(events);
        if let Some(record) = self.core.watchers.borrow_mut().get_mut(&token) {
            record.events = events;
        }
        Ok(())
    }

    /// Stop watching. A no-op if the watcher is not initialised.
    ///
    /// The handler is not invoked again after this returns, even for
    /// readiness the OS has already reported. On error the watcher stays
    /// initialised.
    pub fn reset(&self) -> io::Result<()> {
        let token = match self.token.get() {
            Some(token) => token,
            None => return Ok(()),
        };
        let fd = self.fd.get();
        trace!("resetting fd watcher: fd={}", fd);

        self.core.provider.reset_fd(fd)?;

        let record = self.core.watchers.borrow_mut().remove(&token);
        debug_assert!(record.is_some());
        self.token.set(None);
        self.fd.set(-1);
        self.events.set(FdEvents::empty());
        Ok(())
    }

    /// Whether the watcher is initialised.
    pub fn has_fd(&self) -> bool {
        self.token.get().is_some()
    }

    /// The watched file descriptor, if initialised.
    pub fn fd(&self) -> Option<RawFd> {
        if self.has_fd() {
            Some(self.fd.get())
        } else {
            None
        }
    }

    /// The current interest mask. Empty if the watcher is not initialised.
    pub fn events(&self) -> FdEvents {
        self.events.get()
    }
}

impl Drop for FdWatcher {
    fn drop(&mut self) {
        if let Err(err) = self.reset() {
            error!("error resetting fd watcher: {}", err);
        }
    }
}

impl fmt::Debug for FdWatcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FdWatcher")
            .field("fd", &self.fd())
            .field("events", &self.events())
            .finish()
    }
}
