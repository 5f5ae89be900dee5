//! Cross-thread async signals.
//!
//! A signal is raised with [`signal`] from any thread and its handler is
//! invoked exactly once per raise episode, on the loop thread, between fd
//! and timer work. The loop keeps two circular intrusive lists of signal
//! nodes, `pending` (filled by producers) and `dispatch` (drained by the
//! loop thread), guarded by one mutex that is only ever held for O(1)
//! list operations.
//!
//! [`signal`]: AsyncSignal::signal

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use log::{error, trace};
use slab::Slab;

use crate::event_loop::{Callback, LoopCore, LoopHandle};
use crate::provider::Wakeup;

/// Reserved slab keys for the list heads.
const PENDING_HEAD: usize = 0;
const DISPATCH_HEAD: usize = 1;

#[derive(Copy, Clone, Debug)]
struct Links {
    prev: usize,
    next: usize,
}

/// A node in the signal lists. A node that links to itself is "removed":
/// on neither list. The generation outlives list membership, it pairs
/// with the slab key to keep stale [`SignalNotifier`]s from touching a
/// recycled slot.
pub(crate) struct SignalNode {
    links: Links,
    generation: u64,
}

/// Both signal lists plus the nodes they link through, one instance per
/// loop, behind the signal mutex.
pub(crate) struct SignalLists {
    nodes: Slab<SignalNode>,
    next_generation: u64,
}

impl SignalLists {
    pub(crate) fn new() -> SignalLists {
        let mut nodes = Slab::new();
        let pending = nodes.insert(SignalNode {
            links: Links {
                prev: PENDING_HEAD,
                next: PENDING_HEAD,
            },
            generation: 0,
        });
        let dispatch = nodes.insert(SignalNode {
            links: Links {
                prev: DISPATCH_HEAD,
                next: DISPATCH_HEAD,
            },
            generation: 0,
        });
        debug_assert_eq!(pending, PENDING_HEAD);
        debug_assert_eq!(dispatch, DISPATCH_HEAD);
        SignalLists {
            nodes,
            next_generation: 1,
        }
    }

    /// Allocate a node in the removed state.
    pub(crate) fn alloc(&mut self) -> (usize, u64) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let key = self.nodes.insert(SignalNode {
            // Patched to a self-loop right below, once the key is known.
            links: Links { prev: 0, next: 0 },
            generation,
        });
        self.nodes[key].links = Links {
            prev: key,
            next: key,
        };
        (key, generation)
    }

    /// Free a node. The node must be in the removed state.
    pub(crate) fn free(&mut self, key: usize) {
        debug_assert!(self.is_removed(key));
        drop(self.nodes.remove(key));
    }

    /// Whether `(key, generation)` still names a live node.
    fn is_current(&self, key: usize, generation: u64) -> bool {
        match self.nodes.get(key) {
            Some(node) => node.generation == generation,
            None => false,
        }
    }

    pub(crate) fn is_removed(&self, key: usize) -> bool {
        self.nodes[key].links.next == key
    }

    pub(crate) fn is_pending_lonely(&self) -> bool {
        self.nodes[PENDING_HEAD].links.next == PENDING_HEAD
    }

    pub(crate) fn is_dispatch_lonely(&self) -> bool {
        self.nodes[DISPATCH_HEAD].links.next == DISPATCH_HEAD
    }

    /// Link `key` at the tail of the pending list.
    pub(crate) fn link_pending(&mut self, key: usize) {
        debug_assert!(self.is_removed(key));
        let tail = self.nodes[PENDING_HEAD].links.prev;
        self.nodes[key].links = Links {
            prev: tail,
            next: PENDING_HEAD,
        };
        self.nodes[tail].links.next = key;
        self.nodes[PENDING_HEAD].links.prev = key;
    }

    /// Unlink `key` from whichever list holds it and mark it removed.
    pub(crate) fn remove(&mut self, key: usize) {
        debug_assert!(!self.is_removed(key));
        let Links { prev, next } = self.nodes[key].links;
        self.nodes[prev].links.next = next;
        self.nodes[next].links.prev = prev;
        self.nodes[key].links = Links {
            prev: key,
            next: key,
        };
    }

    /// Move the whole pending list onto the dispatch head, leaving the
    /// pending list empty. The pending list must not be empty.
    pub(crate) fn splice_pending_into_dispatch(&mut self) {
        debug_assert!(!self.is_pending_lonely());
        debug_assert!(self.is_dispatch_lonely());
        let Links { prev: tail, next: head } = self.nodes[PENDING_HEAD].links;
        self.nodes[DISPATCH_HEAD].links = Links {
            prev: tail,
            next: head,
        };
        self.nodes[head].links.prev = DISPATCH_HEAD;
        self.nodes[tail].links.next = DISPATCH_HEAD;
        self.nodes[PENDING_HEAD].links = Links {
            prev: PENDING_HEAD,
            next: PENDING_HEAD,
        };
    }

    /// The first node of the dispatch list, if any.
    pub(crate) fn first_dispatch(&self) -> Option<usize> {
        let next = self.nodes[DISPATCH_HEAD].links.next;
        if next == DISPATCH_HEAD {
            None
        } else {
            Some(next)
        }
    }
}

/// State shared between the loop and [`SignalNotifier`]s on other
/// threads.
pub(crate) struct SignalShared {
    pub(crate) lists: Mutex<SignalLists>,
    pub(crate) wakeup: Arc<dyn Wakeup>,
}

/// Raise the signal node `(key, generation)`: queue it on the pending
/// list and, if it is the first node queued, wake the loop exactly once.
fn raise(shared: &SignalShared, key: usize, generation: u64) {
    let mut inserted_first = false;
    {
        let mut lists = shared.lists.lock().expect("signal lists mutex poisoned");
        if !lists.is_current(key, generation) {
            // A notifier outliving its signal.
            return;
        }
        if lists.is_removed(key) {
            inserted_first = lists.is_pending_lonely();
            lists.link_pending(key);
        }
    }
    if inserted_first {
        trace!("waking event loop for async signal");
        if let Err(err) = shared.wakeup.wake() {
            error!("error waking event loop: {}", err);
        }
    }
}

/// A signal that any thread may raise and whose handler runs on the loop
/// thread.
///
/// Raising is level-like per episode: however many times a signal is
/// raised before the loop dispatches it, the handler runs once. A raise
/// from within the handler itself queues a fresh episode that is
/// dispatched in a later loop iteration, so a self-raising signal cannot
/// starve timers or fd events.
///
/// The signal object itself must stay on the loop thread; to raise it
/// from other threads, hand out [`notifier`] clones.
///
/// [`notifier`]: AsyncSignal::notifier
pub struct AsyncSignal {
    core: Rc<LoopCore>,
    key: usize,
    generation: u64,
}

impl AsyncSignal {
    /// Create a new signal on `handle`'s loop.
    pub fn new<F>(handle: &LoopHandle, handler: F) -> AsyncSignal
    where
        F: FnMut() + 'static,
    {
        let core = handle.core().clone();
        let (key, generation) = core
            .shared
            .lists
            .lock()
            .expect("signal lists mutex poisoned")
            .alloc();
        let handler: Callback = Rc::new(RefCell::new(handler));
        drop(core.signal_handlers.borrow_mut().insert(key, handler));
        AsyncSignal {
            core,
            key,
            generation,
        }
    }

    /// Raise the signal.
    ///
    /// Queues the handler to run on the loop thread. Raising an
    /// already-queued signal is a no-op.
    pub fn signal(&self) {
        raise(&self.core.shared, self.key, self.generation);
    }

    /// A thread-safe handle for raising this signal from other threads.
    pub fn notifier(&self) -> SignalNotifier {
        SignalNotifier {
            shared: self.core.shared.clone(),
            key: self.key,
            generation: self.generation,
        }
    }

    /// Cancel a queued raise, if any.
    ///
    /// After this returns the handler does not run until the signal is
    /// raised again. Safe from any handler on this loop, including the
    /// signal's own.
    pub fn reset(&self) {
        let mut lists = self
            .core
            .shared
            .lists
            .lock()
            .expect("signal lists mutex poisoned");
        if !lists.is_removed(self.key) {
            lists.remove(self.key);
        }
    }
}

impl Drop for AsyncSignal {
    fn drop(&mut self) {
        {
            let mut lists = self
                .core
                .shared
                .lists
                .lock()
                .expect("signal lists mutex poisoned");
            if !lists.is_removed(self.key) {
                lists.remove(self.key);
            }
            lists.free(self.key);
        }
        let handler = self.core.signal_handlers.borrow_mut().remove(&self.key);
        // User drop code must not run while the handler map is borrowed.
        drop(handler);
    }
}

impl fmt::Debug for AsyncSignal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AsyncSignal").finish()
    }
}

/// A cloneable, thread-safe handle for raising an [`AsyncSignal`].
///
/// A notifier that outlives its signal is harmless: raising through it
/// does nothing.
#[derive(Clone)]
pub struct SignalNotifier {
    shared: Arc<SignalShared>,
    key: usize,
    generation: u64,
}

impl SignalNotifier {
    /// Raise the signal, see [`AsyncSignal::signal`].
    pub fn signal(&self) {
        raise(&self.shared, self.key, self.generation);
    }
}

impl fmt::Debug for SignalNotifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignalNotifier").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{AsyncSignal, SignalLists};
    use crate::event_loop::testing::mock_loop;

    #[test]
    fn lists_start_lonely() {
        let lists = SignalLists::new();
        assert!(lists.is_pending_lonely());
        assert!(lists.is_dispatch_lonely());
        assert_eq!(lists.first_dispatch(), None);
    }

    #[test]
    fn link_and_remove() {
        let mut lists = SignalLists::new();
        let (a, _) = lists.alloc();
        let (b, _) = lists.alloc();
        assert!(lists.is_removed(a));

        lists.link_pending(a);
        assert!(!lists.is_removed(a));
        assert!(!lists.is_pending_lonely());

        lists.link_pending(b);
        lists.remove(a);
        assert!(lists.is_removed(a));
        assert!(!lists.is_pending_lonely());

        lists.remove(b);
        assert!(lists.is_pending_lonely());
        lists.free(a);
        lists.free(b);
    }

    #[test]
    fn splice_moves_batch_in_order() {
        let mut lists = SignalLists::new();
        let (a, _) = lists.alloc();
        let (b, _) = lists.alloc();
        let (c, _) = lists.alloc();
        lists.link_pending(a);
        lists.link_pending(b);
        lists.link_pending(c);

        lists.splice_pending_into_dispatch();
        assert!(lists.is_pending_lonely());
        assert!(!lists.is_dispatch_lonely());

        // FIFO within the batch.
        let mut order = Vec::new();
        while let Some(key) = lists.first_dispatch() {
            lists.remove(key);
            order.push(key);
        }
        assert_eq!(order, vec![a, b, c]);
        assert!(lists.is_dispatch_lonely());

        // Nodes queued after the splice land on the fresh pending list.
        lists.link_pending(b);
        assert!(!lists.is_pending_lonely());
        assert!(lists.is_dispatch_lonely());
        lists.remove(b);
        for key in &[a, b, c] {
            lists.free(*key);
        }
    }

    #[test]
    fn signal_is_idempotent_while_queued() {
        let (event_loop, _) = mock_loop();
        let signal = AsyncSignal::new(&event_loop.handle(), || {});

        signal.signal();
        signal.signal();
        signal.signal();

        let core = event_loop.core();
        let lists = core.shared.lists.lock().unwrap();
        // Exactly one node queued.
        let first = lists.nodes[super::PENDING_HEAD].links.next;
        assert_ne!(first, super::PENDING_HEAD);
        assert_eq!(lists.nodes[first].links.next, super::PENDING_HEAD);
    }

    #[test]
    fn reset_cancels_queued_raise() {
        let (event_loop, _) = mock_loop();
        let signal = AsyncSignal::new(&event_loop.handle(), || {});

        signal.signal();
        signal.reset();

        let core = event_loop.core();
        assert!(core.shared.lists.lock().unwrap().is_pending_lonely());
    }

    #[test]
    fn stale_notifier_is_noop() {
        let (event_loop, _) = mock_loop();
        let handle = event_loop.handle();

        let first = AsyncSignal::new(&handle, || {});
        let notifier = first.notifier();
        drop(first);

        // Reuses the freed slot, with a newer generation.
        let second = AsyncSignal::new(&handle, || {});
        notifier.signal();

        let core = event_loop.core();
        assert!(core.shared.lists.lock().unwrap().is_pending_lonely());
        drop(second);
    }
}
