//! A small walkthrough: a periodic timer, an fd watcher on a pipe and a
//! signal raised from another thread.
//!
//! Run with `cargo run --example tick`.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use rhea::{AsyncSignal, EventLoop, FdEvents, FdWatcher, Timer};

const INTERVAL: Duration = Duration::from_millis(100);

/// Create a new nonblocking unix pipe, returning the (receiving,
/// sending) ends.
fn new_pipe() -> io::Result<(File, File)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        Ok((receiver, sender))
    }
}

fn main() -> io::Result<()> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    let handle = event_loop.handle();

    let (receiver, sender) = new_pipe()?;
    let receiver_fd = receiver.as_raw_fd();

    // A signal raised from another thread; its handler runs on the loop
    // thread between iterations. The same thread first feeds the pipe.
    let signal = AsyncSignal::new(&handle, || println!("pinged from the other thread"));
    let notifier = signal.notifier();
    let pinger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(120));
        (&sender)
            .write_all(b"hello through the pipe")
            .expect("unable to write");
        thread::sleep(Duration::from_millis(30));
        notifier.signal();
    });

    // Readiness on the receiving end, reported by the OS. Once the
    // sending end is gone the watcher stops itself.
    let watcher_slot: Rc<RefCell<Option<FdWatcher>>> = Rc::new(RefCell::new(None));
    let watcher = {
        let watcher_slot = watcher_slot.clone();
        FdWatcher::new(&handle, move |events| {
            if events.is_read() {
                let mut buf = [0; 64];
                let n = (&receiver).read(&mut buf).expect("unable to read");
                if n > 0 {
                    println!("pipe: {}", String::from_utf8_lossy(&buf[..n]));
                }
            }
            if events.is_hup() {
                watcher_slot
                    .borrow()
                    .as_ref()
                    .unwrap()
                    .reset()
                    .expect("unable to reset watcher");
            }
        })
    };
    watcher.init(receiver_fd, FdEvents::READ)?;
    *watcher_slot.borrow_mut() = Some(watcher);

    // Tick three times, then stop the loop. The timer reaches itself
    // through the shared slot to re-arm.
    let ticker_slot: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));
    let ticker = {
        let ticker_slot = ticker_slot.clone();
        let handle = handle.clone();
        let mut ticks = 0;
        Timer::new(&handle.clone(), move || {
            ticks += 1;
            println!("tick {}", ticks);
            if ticks < 3 {
                ticker_slot.borrow().as_ref().unwrap().set_after(INTERVAL);
            } else {
                handle.stop();
            }
        })
    };
    ticker.set_after(INTERVAL);
    *ticker_slot.borrow_mut() = Some(ticker);

    event_loop.run()?;

    pinger.join().expect("pinger thread panicked");
    // Empty the slots so the handles are gone before the loop.
    drop(watcher_slot.borrow_mut().take());
    drop(ticker_slot.borrow_mut().take());
    Ok(())
}
