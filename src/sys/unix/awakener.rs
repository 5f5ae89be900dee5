use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use crate::provider::Wakeup;

/// A [`Wakeup`] backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8
/// bytes (64 bits) and are converted (native endian) into a 64 bit
/// unsigned integer and added to the count. Reads must also be 8 bytes
/// and reset the count to 0, returning the count.
///
/// The provider registers the descriptor with its selector and drains it
/// when the readiness comes up; waking from any number of threads boils
/// down to one nonblocking write each.
pub struct EventFd {
    fd: File,
}

impl EventFd {
    /// Create a new eventfd, making the `eventfd(2)` syscall.
    pub fn new() -> io::Result<EventFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(EventFd {
                fd: unsafe { File::from_raw_fd(fd) },
            })
        }
    }

    /// Reset the counter, consuming any pending wakes.
    pub fn drain(&self) -> io::Result<()> {
        let mut buf = [0; 8];
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            // Not woken since the last drain.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Wakeup for EventFd {
    fn wake(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            // The counter is saturated, which means the loop has plenty
            // of pending wakes already.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl fmt::Debug for EventFd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventFd").field("fd", &self.fd).finish()
    }
}
