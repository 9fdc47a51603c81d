//! Self-pipe signal delivery.
//!
//! The handler does exactly one thing: write the signal number to a
//! pipe. The owning loop reads the pipe like any other fd, so all real
//! signal logic runs in normal context.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

static PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

pub(crate) struct SignalPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

/// Writes a synthetic "signal" from ordinary code; used for
/// programmatic shutdown.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SignalSender {
    fd: RawFd,
}

impl SignalSender {
    pub(crate) fn send(&self, signo: i32) {
        let byte = signo as u8;
        unsafe {
            libc::write(self.fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

impl SignalPipe {
    pub(crate) fn new() -> io::Result<SignalPipe> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(SignalPipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Routes `signals` into the pipe. Only one pipe per process can be
    /// installed at a time; a fresh install supersedes the previous one.
    pub(crate) fn install(&self, signals: &[i32]) -> io::Result<()> {
        PIPE_WRITE.store(self.write_fd, Ordering::Relaxed);
        for &signo in signals {
            let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as usize;
            action.sa_flags = libc::SA_RESTART;
            unsafe {
                libc::sigemptyset(&mut action.sa_mask);
                if libc::sigaction(signo, &action, std::ptr::null_mut()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }

    /// Restores default dispositions; used in freshly forked children
    /// before they install their own pipe.
    pub(crate) fn reset(signals: &[i32]) {
        for &signo in signals {
            unsafe {
                libc::signal(signo, libc::SIG_DFL);
            }
        }
    }

    pub(crate) fn sender(&self) -> SignalSender {
        SignalSender { fd: self.write_fd }
    }

    /// Waits up to `timeout_ms` for a signal; `None` on timeout.
    pub(crate) fn wait(&self, timeout_ms: i32) -> io::Result<Option<i32>> {
        let mut pfd = libc::pollfd {
            fd: self.read_fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(None);
        }
        let mut byte = 0u8;
        let n = unsafe {
            libc::read(
                self.read_fd,
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
            )
        };
        if n == 1 {
            Ok(Some(i32::from(byte)))
        } else {
            Ok(None)
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_round_trips_through_pipe() {
        let pipe = SignalPipe::new().unwrap();
        let sender = pipe.sender();
        assert_eq!(pipe.wait(0).unwrap(), None);
        sender.send(libc::SIGQUIT);
        assert_eq!(pipe.wait(100).unwrap(), Some(libc::SIGQUIT));
    }
}
