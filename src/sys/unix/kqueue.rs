//! Kernel-queue poller (`kqueue(2)`), for the BSD family and macOS.
//!
//! Every I/O registration maps one-to-one onto kqueue filters: a
//! `READ|WRITE` event is two independent `EVFILT_READ`/`EVFILT_WRITE`
//! changes sharing the same `udata` pointer. Filters for a registration
//! that isn't `PERSIST` and only asks for one condition are submitted with
//! `EV_ONESHOT`, so the kernel retires them itself on first fire; a
//! combined read+write registration is always submitted without
//! `EV_ONESHOT` (deleting just one half of a pair mid-fire is awkward to
//! get right), so the core is told via the returned condition's `PERSIST`
//! bit whether it still needs to tear the registration down itself.
//!
//! Signals are delivered natively through `EVFILT_SIGNAL`, which requires
//! the process to not run the signal's default disposition; each
//! registration installs `SIG_IGN` and remembers the prior handler so
//! `del_signal` can put it back.

use std::cmp::min;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;
use std::{io, mem, ptr};

use log::error;

use crate::event::EventInner;
use crate::flag::Flag;
use crate::poller::{Poller, Ready};

// Each OS that implements kqueue picked different field types for `kevent`.
#[cfg(not(target_os = "netbsd"))]
#[allow(non_camel_case_types)]
type nchanges_t = libc::c_int;
#[cfg(target_os = "netbsd")]
#[allow(non_camel_case_types)]
type nchanges_t = libc::size_t;

#[cfg(any(target_os = "freebsd", target_os = "openbsd", target_os = "dragonfly"))]
#[allow(non_camel_case_types)]
type kevent_flags_t = libc::c_ushort;
#[cfg(target_os = "macos")]
#[allow(non_camel_case_types)]
type kevent_flags_t = u16;
#[cfg(target_os = "netbsd")]
#[allow(non_camel_case_types)]
type kevent_flags_t = u32;

fn new_kevent(ident: libc::uintptr_t, filter: libc::c_short, flags: kevent_flags_t, udata: *mut libc::c_void) -> libc::kevent {
    libc::kevent {
        ident,
        filter: filter as _,
        flags: flags as _,
        fflags: 0,
        data: 0,
        udata: udata as _,
    }
}

#[derive(Debug)]
pub(crate) struct KqPoller {
    kq: RawFd,
    buf: Vec<libc::kevent>,
    n_filters: usize,
    signals: Vec<(i32, libc::sighandler_t)>,
}

/// Whether an I/O registration's backend filter(s) survive their own fire:
/// either the user asked for `PERSIST`, or it's a combined read+write
/// registration, which this poller never submits as `EV_ONESHOT`.
fn backend_persists(interest: Flag) -> bool {
    interest.contains(Flag::PERSIST) || interest.contains(Flag::READ | Flag::WRITE)
}

impl KqPoller {
    pub(crate) fn new() -> io::Result<KqPoller> {
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(KqPoller { kq, buf: Vec::new(), n_filters: 0, signals: Vec::new() })
    }

    fn submit(&self, changes: &mut [libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let n = unsafe {
            libc::kevent(self.kq, changes.as_ptr(), changes.len() as nchanges_t, ptr::null_mut(), 0, ptr::null())
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            // EINTR during EV_ADD/EV_DELETE submission: FreeBSD's kevent(2)
            // applies every change in the list before reporting EINTR, so
            // there's nothing left to retry.
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Poller for KqPoller {
    fn dispatch(&mut self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> io::Result<()> {
        let want = self.n_filters.max(1);
        if self.buf.len() < want {
            self.buf.resize(want, unsafe { mem::zeroed() });
        }

        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: min(d.as_secs(), libc::time_t::max_value() as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(d.subsec_nanos()),
        });
        let timespec_ptr = timespec.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);

        let n = unsafe {
            libc::kevent(self.kq, ptr::null(), 0, self.buf.as_mut_ptr(), self.buf.len() as nchanges_t, timespec_ptr)
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for kevent in &self.buf[..n as usize] {
            match kevent.filter as libc::c_int {
                libc::EVFILT_READ | libc::EVFILT_WRITE => {
                    let ptr = kevent.udata as *const EventInner;
                    // Safe: the `Rc` behind `ptr` is kept alive by the base's
                    // `io_list` for the entire lifetime of the registration,
                    // and no callback runs between the poller filling `ready`
                    // and the base draining it, so the pointee can't have
                    // been dropped yet.
                    let ev: Rc<EventInner> = unsafe {
                        Rc::increment_strong_count(ptr);
                        Rc::from_raw(ptr)
                    };
                    let interest = ev.state.borrow().interest;
                    let cond = if kevent.filter as libc::c_int == libc::EVFILT_READ { Flag::READ } else { Flag::WRITE };
                    ready.push(Ready::Io { ev, cond, backend_persists: backend_persists(interest) });
                }
                libc::EVFILT_SIGNAL => {
                    ready.push(Ready::Signal(kevent.ident as i32));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn add_io(&mut self, ev: &Rc<EventInner>) -> io::Result<()> {
        let (fd, interest) = {
            let st = ev.state.borrow();
            (st.ident, st.interest)
        };
        let persist = backend_persists(interest);
        let flags: kevent_flags_t = libc::EV_ADD as kevent_flags_t | if persist { 0 } else { libc::EV_ONESHOT as kevent_flags_t };
        let udata = Rc::as_ptr(ev) as *mut libc::c_void;

        let mut changes = Vec::with_capacity(2);
        if interest.contains(Flag::READ) {
            changes.push(new_kevent(fd as libc::uintptr_t, libc::EVFILT_READ, flags, udata));
        }
        if interest.contains(Flag::WRITE) {
            changes.push(new_kevent(fd as libc::uintptr_t, libc::EVFILT_WRITE, flags, udata));
        }
        self.submit(&mut changes)?;
        self.n_filters += changes.len();
        Ok(())
    }

    fn del_io(&mut self, ev: &Rc<EventInner>) -> io::Result<()> {
        let (fd, interest) = {
            let st = ev.state.borrow();
            (st.ident, st.interest)
        };
        let mut changes = Vec::with_capacity(2);
        if interest.contains(Flag::READ) {
            changes.push(new_kevent(fd as libc::uintptr_t, libc::EVFILT_READ, libc::EV_DELETE as kevent_flags_t, ptr::null_mut()));
        }
        if interest.contains(Flag::WRITE) {
            changes.push(new_kevent(fd as libc::uintptr_t, libc::EVFILT_WRITE, libc::EV_DELETE as kevent_flags_t, ptr::null_mut()));
        }
        let removed = changes.len();
        match self.submit(&mut changes) {
            // The kernel already dropped an EV_ONESHOT filter on its own
            // fire; deleting it again is a benign no-op from the core's
            // point of view.
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => {}
            other => other?,
        }
        self.n_filters = self.n_filters.saturating_sub(removed);
        Ok(())
    }

    fn add_signal(&mut self, signum: i32) -> io::Result<()> {
        let prev = unsafe { libc::signal(signum, libc::SIG_IGN) };
        if prev == libc::SIG_ERR {
            return Err(io::Error::last_os_error());
        }
        self.signals.push((signum, prev));
        let mut changes = [new_kevent(signum as libc::uintptr_t, libc::EVFILT_SIGNAL, libc::EV_ADD as kevent_flags_t, ptr::null_mut())];
        self.submit(&mut changes)?;
        self.n_filters += 1;
        Ok(())
    }

    fn del_signal(&mut self, signum: i32) -> io::Result<()> {
        if let Some(pos) = self.signals.iter().position(|&(s, _)| s == signum) {
            let (_, prev) = self.signals.swap_remove(pos);
            unsafe {
                libc::signal(signum, prev);
            }
        }
        let mut changes = [new_kevent(signum as libc::uintptr_t, libc::EVFILT_SIGNAL, libc::EV_DELETE as kevent_flags_t, ptr::null_mut())];
        match self.submit(&mut changes) {
            Err(ref err) if err.raw_os_error() == Some(libc::ENOENT) => {}
            other => other?,
        }
        self.n_filters = self.n_filters.saturating_sub(1);
        Ok(())
    }
}

impl Drop for KqPoller {
    fn drop(&mut self) {
        for &(signum, prev) in &self.signals {
            unsafe {
                libc::signal(signum, prev);
            }
        }
        if unsafe { libc::close(self.kq) } == -1 {
            error!("error closing kqueue: {}", io::Error::last_os_error());
        }
    }
}
