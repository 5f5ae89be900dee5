use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use rhea::{EventLoop, FdEvents, FdWatcher, Timer};

mod util;

use self::util::{init, new_pipe};

#[test]
fn writable_readiness() {
    init();
    let event_loop = EventLoop::new().expect("unable to create event loop");
    let handle = event_loop.handle();
    let (receiver, sender) = new_pipe().expect("unable to create pipe");

    let observed = Rc::new(Cell::new(FdEvents::empty()));
    let watcher = {
        let observed = observed.clone();
        let handle = handle.clone();
        FdWatcher::new(&handle.clone(), move |events| {
            observed.set(events);
            handle.stop();
        })
    };
    watcher
        .init(sender.as_raw_fd(), FdEvents::WRITE)
        .expect("unable to init watcher");
    assert_eq!(watcher.fd(), Some(sender.as_raw_fd()));

    event_loop.run().expect("unable to run event loop");

    // An empty pipe's sending end is immediately writable.
    assert!(observed.get().is_write());
    drop(receiver);
}

#[test]
fn readable_after_write() {
    init();
    let event_loop = EventLoop::new().expect("unable to create event loop");
    let handle = event_loop.handle();
    let (receiver, sender) = new_pipe().expect("unable to create pipe");
    let receiver_fd = receiver.as_raw_fd();

    let received = Rc::new(RefCell::new(Vec::new()));
    let watcher = {
        let received = received.clone();
        let handle = handle.clone();
        FdWatcher::new(&handle.clone(), move |events| {
            assert!(events.is_read());
            let mut buf = [0; 16];
            let n = (&receiver).read(&mut buf).expect("unable to read");
            received.borrow_mut().extend_from_slice(&buf[..n]);
            handle.stop();
        })
    };
    watcher
        .init(receiver_fd, FdEvents::READ)
        .expect("unable to init watcher");

    // Write into the pipe from a timer a little later; the loop must be
    // asleep in the provider by then.
    let writer = {
        let handle = handle.clone();
        Timer::new(&handle, move || {
            (&sender).write_all(b"hello").expect("unable to write");
        })
    };
    writer.set_after(Duration::from_millis(10));

    event_loop.run().expect("unable to run event loop");
    assert_eq!(*received.borrow(), b"hello");
}

#[test]
fn update_changes_interest() {
    init();
    let event_loop = EventLoop::new().expect("unable to create event loop");
    let handle = event_loop.handle();
    let (receiver, sender) = new_pipe().expect("unable to create pipe");

    // Data is ready before the loop even starts, but the watcher is not
    // interested yet.
    (&sender).write_all(b"x").expect("unable to write");

    let updated = Rc::new(Cell::new(false));
    let fired = Rc::new(Cell::new(0));
    let watcher = {
        let updated = updated.clone();
        let fired = fired.clone();
        let handle = handle.clone();
        Rc::new(FdWatcher::new(&handle.clone(), move |events| {
            assert!(updated.get(), "fired before interest was updated");
            assert!(events.is_read());
            fired.set(fired.get() + 1);
            handle.stop();
        }))
    };
    watcher
        .init(receiver.as_raw_fd(), FdEvents::empty())
        .expect("unable to init watcher");

    let switcher = {
        let updated = updated.clone();
        let watcher = watcher.clone();
        Timer::new(&handle, move || {
            updated.set(true);
            watcher
                .update(FdEvents::READ)
                .expect("unable to update watcher");
        })
    };
    switcher.set_after(Duration::from_millis(10));

    event_loop.run().expect("unable to run event loop");
    assert_eq!(fired.get(), 1);
}

#[test]
fn reset_stops_delivery() {
    init();
    let event_loop = EventLoop::new().expect("unable to create event loop");
    let handle = event_loop.handle();
    let (receiver, sender) = new_pipe().expect("unable to create pipe");

    // Leave data in the pipe for the whole test: a level-triggered
    // registration would keep reporting it.
    (&sender).write_all(b"x").expect("unable to write");

    let fired = Rc::new(Cell::new(0));
    let slot: Rc<RefCell<Option<FdWatcher>>> = Rc::new(RefCell::new(None));
    let watcher = {
        let fired = fired.clone();
        let slot = slot.clone();
        FdWatcher::new(&handle, move |_| {
            fired.set(fired.get() + 1);
            slot.borrow()
                .as_ref()
                .unwrap()
                .reset()
                .expect("unable to reset watcher");
        })
    };
    watcher
        .init(receiver.as_raw_fd(), FdEvents::READ)
        .expect("unable to init watcher");
    *slot.borrow_mut() = Some(watcher);

    let stopper = {
        let handle = handle.clone();
        Timer::new(&handle.clone(), move || handle.stop())
    };
    stopper.set_after(Duration::from_millis(30));

    event_loop.run().expect("unable to run event loop");

    assert_eq!(fired.get(), 1);
    assert!(!slot.borrow().as_ref().unwrap().has_fd());
    drop(slot.borrow_mut().take());
}

#[test]
fn hangup_is_reported() {
    init();
    let event_loop = EventLoop::new().expect("unable to create event loop");
    let handle = event_loop.handle();
    let (receiver, sender) = new_pipe().expect("unable to create pipe");

    // Closing the sending end hangs up the receiving end.
    drop(sender);

    let observed = Rc::new(Cell::new(FdEvents::empty()));
    let watcher = {
        let observed = observed.clone();
        let handle = handle.clone();
        FdWatcher::new(&handle.clone(), move |events| {
            observed.set(events);
            handle.stop();
        })
    };
    watcher
        .init(receiver.as_raw_fd(), FdEvents::READ)
        .expect("unable to init watcher");

    event_loop.run().expect("unable to run event loop");
    assert!(observed.get().is_hup());
}
