//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::os::unix::io::RawFd;

/// Initialises `env_logger` once; safe to call from every test.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::new().filter("LOG_LEVEL")).is_test(true).try_init();
}

/// A non-blocking unix pipe, closed on drop.
pub struct Pipe {
    pub r: RawFd,
    pub w: RawFd,
}

impl Pipe {
    pub fn new() -> Pipe {
        let mut fds: [RawFd; 2] = [-1, -1];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        for &fd in &fds {
            assert_eq!(unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) }, 0);
        }
        Pipe { r: fds[0], w: fds[1] }
    }

    pub fn write_byte(&self) {
        let byte = [1u8];
        let n = unsafe { libc::write(self.w, byte.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
    }

    pub fn drain_one(&self) {
        let mut buf = [0u8; 1];
        let _ = unsafe { libc::read(self.r, buf.as_mut_ptr() as *mut libc::c_void, 1) };
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.r);
            libc::close(self.w);
        }
    }
}
