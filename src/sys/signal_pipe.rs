//! Self-pipe signal trampoline shared by the POLL poller.
//!
//! A `signal(2)` handler cannot safely do much more than call a short list
//! of async-signal-safe functions, so the handler here only writes one byte
//! (the signal number) to a pipe whose read end the poller watches like any
//! other descriptor. If that write fails — the pipe is full, which can only
//! happen under a signal storm — the handler falls back to OR-ing the
//! signal into a lock-free bitmask and setting a rescan flag; the poller
//! checks that flag before every blocking call and, if set, synthesizes
//! deliveries from the mask instead of calling into the kernel.
//!
//! The installed handler and the write end of the pipe are process-wide
//! statics: `signal(2)` handlers are plain `extern "C" fn`s with no room for
//! a closure environment, so there is exactly one self-pipe live at a time,
//! matching this crate's single-threaded, single-base-at-a-time design.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use log::error;

use crate::poller::Ready;

static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static RESCAN: AtomicBool = AtomicBool::new(false);
static SIGNAL_MASK: AtomicU64 = AtomicU64::new(0);

/// Signal numbers at or above this can't be represented in the fallback
/// bitmask; the pipe write is expected to succeed for them, as it does for
/// everything else barring a full pipe.
const MASK_BITS: i32 = 64;

extern "C" fn trampoline(signum: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    let byte = [signum as u8];
    let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    if n != 1 {
        if signum < MASK_BITS {
            SIGNAL_MASK.fetch_or(1u64 << signum, Ordering::SeqCst);
        }
        RESCAN.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn rescan_pending() -> bool {
    RESCAN.load(Ordering::SeqCst)
}

/// Drains the fallback bitmask, returning the signal numbers it held.
pub(crate) fn take_rescan_signals() -> Vec<i32> {
    RESCAN.store(false, Ordering::SeqCst);
    let mask = SIGNAL_MASK.swap(0, Ordering::SeqCst);
    (0..MASK_BITS).filter(|s| mask & (1u64 << s) != 0).collect()
}

/// Reads every byte currently buffered on the pipe and turns each into a
/// `Ready::Signal`. EAGAIN/EINTR end the drain normally; anything else is
/// an invariant violation (the pipe is privately owned, non-blocking, and
/// never written to except by `trampoline`).
pub(crate) fn drain_into(fd: RawFd, ready: &mut Vec<Ready>) {
    let mut buf = [0u8; 128];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            for &b in &buf[..n as usize] {
                ready.push(Ready::Signal(i32::from(b)));
            }
            if (n as usize) < buf.len() {
                break;
            }
            continue;
        }
        if n == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => break,
            _ => panic!("self-pipe read failed: {}", err),
        }
    }
}

/// Owns the pipe fds and the set of signal dispositions this base has
/// overridden, so they can be restored when the last watcher for each
/// signal is removed.
#[derive(Debug)]
pub(crate) struct SignalPlumbing {
    read_fd: RawFd,
    write_fd: RawFd,
    installed: Vec<(i32, libc::sighandler_t)>,
}

impl SignalPlumbing {
    pub(crate) fn create() -> io::Result<SignalPlumbing> {
        let mut fds: [RawFd; 2] = [-1, -1];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        for &fd in &fds {
            if unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) } == -1 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        PIPE_WRITE_FD.store(fds[1], Ordering::SeqCst);
        Ok(SignalPlumbing { read_fd: fds[0], write_fd: fds[1], installed: Vec::new() })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    pub(crate) fn install(&mut self, signum: i32) -> io::Result<()> {
        if self.installed.iter().any(|&(s, _)| s == signum) {
            return Ok(());
        }
        let prev = unsafe { libc::signal(signum, trampoline as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        self.installed.push((signum, prev));
        Ok(())
    }

    pub(crate) fn restore(&mut self, signum: i32) {
        if let Some(pos) = self.installed.iter().position(|&(s, _)| s == signum) {
            let (_, prev) = self.installed.swap_remove(pos);
            unsafe {
                libc::signal(signum, prev);
            }
        }
    }

    pub(crate) fn installed_count(&self) -> usize {
        self.installed.len()
    }
}

impl Drop for SignalPlumbing {
    fn drop(&mut self) {
        for &(signum, prev) in &self.installed {
            unsafe {
                libc::signal(signum, prev);
            }
        }
        PIPE_WRITE_FD.store(-1, Ordering::SeqCst);
        if unsafe { libc::close(self.read_fd) } == -1 {
            error!("error closing self-pipe read end: {}", io::Error::last_os_error());
        }
        if unsafe { libc::close(self.write_fd) } == -1 {
            error!("error closing self-pipe write end: {}", io::Error::last_os_error());
        }
    }
}
