//! Collection of testing utilities.

// Not all functions are used in all tests, causing warnings of unused
// functions while other tests are actually using them.
#![allow(dead_code)]

use std::fs::File;
use std::io;
use std::os::unix::io::FromRawFd;
use std::time::Duration;

/// Allowed margin for deadlines to be overrun.
pub const TIMEOUT_MARGIN: Duration = Duration::from_millis(10);

/// Initialise the test setup, things like logging etc.
pub fn init() {
    let env = env_logger::Env::new().filter("LOG_LEVEL");
    // Logger could already be set, so we ignore the result.
    drop(env_logger::try_init_from_env(env));
}

/// Create a new nonblocking unix pipe.
///
/// Returns the (receiving, sending) ends. The `File`s close the
/// descriptors on drop.
pub fn new_pipe() -> io::Result<(File, File)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } == -1 {
        Err(io::Error::last_os_error())
    } else {
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        Ok((receiver, sender))
    }
}
