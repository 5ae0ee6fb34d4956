//! Portable `poll(2)`-backed poller.
//!
//! Registered descriptors live in a dense `pollfd` array so a dispatch call
//! is a single `poll(2)` syscall over a packed prefix. Deleting a slot in
//! the middle of that array would otherwise force a shift of everything
//! after it, so removal is lazy: the slot is handed to a free-index heap
//! and only physically compacted (swapped with the highest live index) the
//! next time the poller is about to block. A generation counter stamped on
//! recycled slots lets the scan loop recognise and skip a slot that was
//! reused for a different registration between `poll(2)` returning and the
//! scan reaching it — which can happen because firing one descriptor's
//! callback is deferred to the dispatch loop, but slot recycling from an
//! *earlier* entry in the very same scan is not.
//!
//! Signal delivery has no poll(2) equivalent, so this backend multiplexes
//! it through a self-pipe (see `signal_pipe`): the read end occupies an
//! ordinary slot, but — unlike every other slot — it is never tied to an
//! `Event` and is special-cased in the scan loop.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::event::EventInner;
use crate::flag::Flag;
use crate::poller::{Poller, Ready};
use crate::sys::signal_pipe::{self, SignalPlumbing};

struct Slot {
    fd: RawFd,
    ev: Option<Rc<EventInner>>,
    gen: u32,
}

#[derive(Debug)]
pub(crate) struct PollPoller {
    slots: Vec<Slot>,
    pfds: Vec<libc::pollfd>,
    nfds: usize,
    live: BinaryHeap<usize>,
    free: BinaryHeap<Reverse<usize>>,
    gen: u32,
    plumbing: Option<SignalPlumbing>,
    pipe_slot: Option<usize>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Slot").field("fd", &self.fd).finish()
    }
}

impl PollPoller {
    pub(crate) fn new() -> io::Result<PollPoller> {
        Ok(PollPoller {
            slots: Vec::new(),
            pfds: Vec::new(),
            nfds: 0,
            live: BinaryHeap::new(),
            free: BinaryHeap::new(),
            gen: 0,
            plumbing: None,
            pipe_slot: None,
        })
    }

    fn alloc_slot(&mut self, fd: RawFd, events: libc::c_short, ev: Option<Rc<EventInner>>) -> usize {
        let idx = match self.free.pop() {
            Some(Reverse(idx)) => idx,
            None => {
                let idx = self.slots.len();
                self.slots.push(Slot { fd: -1, ev: None, gen: self.gen });
                self.pfds.push(libc::pollfd { fd: -1, events: 0, revents: 0 });
                idx
            }
        };
        self.slots[idx] = Slot { fd, ev, gen: self.gen };
        self.pfds[idx] = libc::pollfd { fd, events, revents: 0 };
        self.live.push(idx);
        self.nfds += 1;
        idx
    }

    fn free_slot(&mut self, idx: usize) {
        self.slots[idx].ev = None;
        self.slots[idx].fd = -1;
        self.slots[idx].gen = self.gen;
        self.pfds[idx].fd = -1;
        self.free.push(Reverse(idx));
        self.nfds -= 1;
    }

    fn live_top(&mut self) -> Option<usize> {
        while let Some(&idx) = self.live.peek() {
            if self.slots[idx].fd != -1 {
                return Some(idx);
            }
            self.live.pop();
        }
        None
    }

    /// Moves occupied high-index slots down into free low-index slots
    /// until the occupied prefix is as short as possible.
    fn pack(&mut self) {
        loop {
            let hi = match self.live_top() {
                Some(idx) => idx,
                None => break,
            };
            let lo = match self.free.peek() {
                Some(&Reverse(idx)) => idx,
                None => break,
            };
            if hi <= lo {
                break;
            }
            self.live.pop();
            self.free.pop();

            self.pfds[lo] = self.pfds[hi];
            self.slots[lo].fd = self.slots[hi].fd;
            self.slots[lo].ev = self.slots[hi].ev.take();
            self.slots[lo].gen = self.gen;
            if let Some(ev) = &self.slots[lo].ev {
                ev.state.borrow_mut().cookie = crate::event::Cookie::PollSlot(lo);
            }
            if self.pipe_slot == Some(hi) {
                self.pipe_slot = Some(lo);
            }

            self.slots[hi].fd = -1;
            self.slots[hi].gen = self.gen;
            self.pfds[hi].fd = -1;

            self.live.push(lo);
            self.free.push(Reverse(hi));
        }
    }
}

impl Poller for PollPoller {
    fn dispatch(&mut self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> io::Result<()> {
        if signal_pipe::rescan_pending() {
            for sig in signal_pipe::take_rescan_signals() {
                ready.push(Ready::Signal(sig));
            }
            return Ok(());
        }

        self.pack();

        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                let ms = d.as_millis();
                if ms > i32::max_value() as u128 {
                    i32::max_value()
                } else {
                    ms as i32
                }
            }
        };

        let n = unsafe { libc::poll(self.pfds.as_mut_ptr(), self.nfds as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(());
        }

        self.gen = self.gen.wrapping_add(1);
        if self.gen == 0 {
            for slot in &mut self.slots {
                slot.gen = u32::max_value();
            }
            self.gen = 1;
        }

        let mut remaining = n;
        for idx in 0..self.nfds {
            if remaining == 0 {
                break;
            }
            if self.slots[idx].gen == self.gen {
                // Recycled by an earlier del_io/pack within this very scan;
                // pfds[idx] no longer belongs to the occupant poll(2) saw.
                continue;
            }
            let revents = self.pfds[idx].revents;
            if revents == 0 {
                continue;
            }
            remaining -= 1;

            if Some(idx) == self.pipe_slot {
                if revents & libc::POLLIN != 0 {
                    let fd = self.plumbing.as_ref().expect("pipe slot without plumbing").read_fd();
                    signal_pipe::drain_into(fd, ready);
                }
                continue;
            }

            let ev = match &self.slots[idx].ev {
                Some(ev) => ev.clone(),
                None => continue,
            };
            let interest = ev.state.borrow().interest;
            let mut cond = Flag::NONE;
            if revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 && interest.contains(Flag::READ) {
                cond = cond | Flag::READ;
            }
            if revents & (libc::POLLOUT | libc::POLLERR) != 0 && interest.contains(Flag::WRITE) {
                cond = cond | Flag::WRITE;
            }
            if !cond.is_empty() {
                // poll(2) is always level-triggered: the slot is never
                // consumed automatically, so the core must be told so it
                // can tear a non-PERSIST registration down itself.
                ready.push(Ready::Io { ev, cond, backend_persists: true });
            }
        }
        Ok(())
    }

    fn add_io(&mut self, ev: &Rc<EventInner>) -> io::Result<()> {
        let (fd, interest) = {
            let st = ev.state.borrow();
            (st.ident, st.interest)
        };
        let mut events = 0;
        if interest.contains(Flag::READ) {
            events |= libc::POLLIN;
        }
        if interest.contains(Flag::WRITE) {
            events |= libc::POLLOUT;
        }
        let idx = self.alloc_slot(fd, events, Some(ev.clone()));
        ev.state.borrow_mut().cookie = crate::event::Cookie::PollSlot(idx);
        Ok(())
    }

    fn del_io(&mut self, ev: &Rc<EventInner>) -> io::Result<()> {
        let idx = match ev.state.borrow().cookie {
            crate::event::Cookie::PollSlot(idx) => idx,
            crate::event::Cookie::None => return Ok(()),
        };
        self.free_slot(idx);
        ev.state.borrow_mut().cookie = crate::event::Cookie::None;
        Ok(())
    }

    fn add_signal(&mut self, signum: i32) -> io::Result<()> {
        if self.plumbing.is_none() {
            let plumbing = SignalPlumbing::create()?;
            let idx = self.alloc_slot(plumbing.read_fd(), libc::POLLIN, None);
            self.pipe_slot = Some(idx);
            self.plumbing = Some(plumbing);
        }
        self.plumbing.as_mut().unwrap().install(signum)
    }

    fn del_signal(&mut self, signum: i32) -> io::Result<()> {
        if let Some(plumbing) = self.plumbing.as_mut() {
            plumbing.restore(signum);
            if plumbing.installed_count() == 0 {
                if let Some(idx) = self.pipe_slot.take() {
                    self.free_slot(idx);
                }
                self.plumbing = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_reclaims_high_indices() {
        let mut p = PollPoller::new().unwrap();
        let a = p.alloc_slot(10, libc::POLLIN, None);
        let b = p.alloc_slot(11, libc::POLLIN, None);
        let c = p.alloc_slot(12, libc::POLLIN, None);
        assert_eq!((a, b, c), (0, 1, 2));
        p.free_slot(0);
        p.pack();
        // slot 2 (fd 12) should have moved down into the freed slot 0.
        assert_eq!(p.slots[0].fd, 12);
        assert_eq!(p.nfds, 2);
    }

    #[test]
    fn deleting_interior_slots_then_adding_compacts_to_a_dense_prefix() {
        let mut p = PollPoller::new().unwrap();
        let a = p.alloc_slot(20, libc::POLLIN, None);
        let b = p.alloc_slot(21, libc::POLLIN, None);
        let c = p.alloc_slot(22, libc::POLLIN, None);
        let d = p.alloc_slot(23, libc::POLLIN, None);
        assert_eq!((a, b, c, d), (0, 1, 2, 3));

        // Delete the middle two, mirroring del_io's free_slot call.
        p.free_slot(b);
        p.free_slot(c);
        assert_eq!(p.nfds, 2);

        // A further registration reuses a freed low index rather than
        // growing the array.
        let e = p.alloc_slot(24, libc::POLLIN, None);
        assert!(e == 1 || e == 2);
        assert_eq!(p.nfds, 3);

        p.pack();

        assert_eq!(p.nfds, 3);
        let occupied: std::collections::BTreeSet<usize> =
            (0..p.slots.len()).filter(|&i| p.slots[i].fd != -1).collect();
        assert_eq!(occupied, [0usize, 1, 2].into_iter().collect());
    }
}
