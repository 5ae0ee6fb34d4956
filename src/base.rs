//! The reactor core: the event state machine, the dispatch loop, and the
//! registration bookkeeping (`add`/`del`/`pending`) that sits in front of
//! the poller.

use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::trace;

use crate::event::{Event, EventInner, Kind, ON_FIRE, ON_HEAP, ON_LIST};
use crate::flag::Flag;
use crate::heap::TimeoutHeap;
use crate::list::{IntrusiveList, LinkField};
use crate::poller::{Poller, Ready};

/// Number of distinct signal numbers a base can track at once. Large
/// enough to cover the standard and real-time signal ranges on Linux and
/// the BSDs.
pub(crate) const NSIG: usize = 65;

/// Development-only guard against a callback that keeps re-arming a
/// zero-timeout timer and never lets the loop actually block. Disabled in
/// release builds, mirroring the original's debug-only abort.
#[cfg(debug_assertions)]
const MAX_IDLE_SPINS: u32 = 30;

/// The dispatch loop, its containers, and the active poller.
///
/// There is no hidden process-wide instance: every registration call takes
/// an explicit `&mut EventBase`, including from inside a callback.
pub struct EventBase {
    heap: TimeoutHeap,
    signal_lists: Vec<IntrusiveList>,
    io_list: IntrusiveList,
    fire_queue: IntrusiveList,
    event_count: usize,
    running: bool,
    poller: Box<dyn Poller>,
    ready_buf: Vec<Ready>,
}

impl EventBase {
    /// Creates a base with the default poller for this target: `kqueue` on
    /// the BSD family when the `kqueue` feature is enabled, `poll(2)`
    /// otherwise.
    pub fn new() -> io::Result<EventBase> {
        let poller = crate::sys::new_poller()?;
        Ok(EventBase {
            heap: TimeoutHeap::new(),
            signal_lists: (0..NSIG).map(|_| IntrusiveList::new(LinkField::Reg)).collect(),
            io_list: IntrusiveList::new(LinkField::Reg),
            fire_queue: IntrusiveList::new(LinkField::Fire),
            event_count: 0,
            running: false,
            poller,
            ready_buf: Vec::new(),
        })
    }

    /// Number of distinct events currently holding the loop open: every
    /// event that is `ON_LIST` (registered for I/O or a signal) or
    /// `ON_HEAP` (has a pending deadline) counts once, even if it holds
    /// both at once via a companion timeout. Exposed mainly for tests.
    pub fn event_count(&self) -> usize {
        self.event_count
    }

    /// Registers (or re-arms) `ev`. For an I/O event, `timeout` is an
    /// optional companion deadline that fires `TIMEOUT` alongside
    /// `READ`/`WRITE` if the descriptor isn't ready first. For a pure timer
    /// event `timeout` is required. For a signal event it is again an
    /// optional companion deadline.
    ///
    /// Calling `add` on an event that is already registered re-keys its
    /// deadline without duplicating the I/O or signal registration.
    pub fn add(&mut self, ev: &Event, timeout: Option<Duration>) -> io::Result<()> {
        debug_assert!(ev.is_initialized(), "event_set was never called on this event");
        match ev.kind() {
            Kind::Io => self.add_io(ev, timeout),
            Kind::Timeout => {
                let d = timeout.expect("a pure timer event requires a timeout");
                self.add_timeout(ev, d)
            }
            Kind::Signal => self.add_signal(ev, timeout),
        }
    }

    fn add_io(&mut self, ev: &Event, timeout: Option<Duration>) -> io::Result<()> {
        let inner = ev.inner.clone();
        let now = Instant::now();
        if !inner.state.borrow().is_set(ON_LIST) {
            self.poller.add_io(&inner)?;
            inner.state.borrow_mut().set(ON_LIST);
            self.io_list.push_back(inner.clone());
            self.event_count += 1;
            trace!("event_add: fd {} registered for I/O", inner.state.borrow().ident);
        }
        if let Some(d) = timeout {
            self.arm_timeout(&inner, d, now);
        }
        Ok(())
    }

    fn add_timeout(&mut self, ev: &Event, duration: Duration) -> io::Result<()> {
        let inner = ev.inner.clone();
        let now = Instant::now();
        self.arm_timeout(&inner, duration, now);
        Ok(())
    }

    fn add_signal(&mut self, ev: &Event, timeout: Option<Duration>) -> io::Result<()> {
        let inner = ev.inner.clone();
        let now = Instant::now();
        let signum = inner.state.borrow().ident;
        assert!(signum >= 0 && (signum as usize) < NSIG, "signal number out of range");
        let idx = signum as usize;
        if !inner.state.borrow().is_set(ON_LIST) {
            if self.signal_lists[idx].is_empty() {
                self.poller.add_signal(signum)?;
            }
            inner.state.borrow_mut().set(ON_LIST);
            self.signal_lists[idx].push_back(inner.clone());
            self.event_count += 1;
            trace!("event_add: signal {} registered", signum);
        }
        if let Some(d) = timeout {
            self.arm_timeout(&inner, d, now);
        }
        Ok(())
    }

    /// Inserts or re-keys `inner`'s heap entry. `event_count` is only bumped
    /// on a brand-new heap membership, and only when nothing else is
    /// already counting this event: an I/O or signal event is already
    /// represented in `event_count` via its `ON_LIST` membership by the
    /// time its companion timeout is armed (`add_io`/`add_signal` set
    /// `ON_LIST` before calling this), so a companion timeout never adds a
    /// second count for the same event. A pure timer event never carries
    /// `ON_LIST`, so its first heap insertion is the only count it gets.
    fn arm_timeout(&mut self, inner: &Rc<EventInner>, duration: Duration, now: Instant) {
        let was_on_heap = inner.state.borrow().is_set(ON_HEAP);
        if was_on_heap {
            self.heap.remove(inner);
        } else {
            let already_counted = inner.state.borrow().is_set(ON_LIST);
            inner.state.borrow_mut().set(ON_HEAP);
            if !already_counted {
                self.event_count += 1;
            }
        }
        let deadline = now + duration;
        inner.state.borrow_mut().deadline = Some(deadline);
        self.heap.insert(deadline, inner.clone());
    }

    /// Unregisters `ev` from every container currently holding it
    /// (I/O or signal list, heap, fire queue). A no-op if `ev` isn't
    /// registered. Removing an event whose callback is already queued for
    /// delivery (`ON_FIRE`) cancels that pending delivery.
    pub fn del(&mut self, ev: &Event) -> io::Result<()> {
        let inner = ev.inner.clone();
        // A companion timeout never adds a second count to an I/O/signal
        // event (see `arm_timeout`), so `event_count` owes this event at
        // most one decrement here, however many of ON_LIST/ON_HEAP it
        // currently holds.
        let was_counted = {
            let st = inner.state.borrow();
            st.is_set(ON_LIST) || st.is_set(ON_HEAP)
        };
        match inner.state.borrow().kind {
            Kind::Io => self.del_io(&inner)?,
            Kind::Signal => self.del_signal_inner(&inner)?,
            Kind::Timeout => {}
        }
        if inner.state.borrow().is_set(ON_HEAP) {
            self.heap.remove(&inner);
            inner.state.borrow_mut().clear(ON_HEAP);
        }
        if inner.state.borrow().is_set(ON_FIRE) {
            self.fire_queue.remove(&inner);
            inner.state.borrow_mut().clear(ON_FIRE);
        }
        if was_counted {
            self.event_count -= 1;
        }
        Ok(())
    }

    /// Unregisters `inner` from the poller and the I/O list, if registered.
    /// Does not touch `event_count`: callers decide whether this event's
    /// single count is owed back once every container it held is gone.
    fn del_io(&mut self, inner: &Rc<EventInner>) -> io::Result<()> {
        if !inner.state.borrow().is_set(ON_LIST) {
            return Ok(());
        }
        self.poller.del_io(inner)?;
        self.io_list.remove(inner);
        inner.state.borrow_mut().clear(ON_LIST);
        Ok(())
    }

    /// Unregisters `inner` from its per-signal list, if registered, and
    /// from the poller once that list empties. Does not touch
    /// `event_count`; see `del_io`.
    fn del_signal_inner(&mut self, inner: &Rc<EventInner>) -> io::Result<()> {
        if !inner.state.borrow().is_set(ON_LIST) {
            return Ok(());
        }
        let signum = inner.state.borrow().ident;
        let idx = signum as usize;
        self.signal_lists[idx].remove(inner);
        inner.state.borrow_mut().clear(ON_LIST);
        if self.signal_lists[idx].is_empty() {
            self.poller.del_signal(signum)?;
        }
        Ok(())
    }

    /// Returns the subset of `mask` currently pending on `ev`, and (if
    /// `TIMEOUT` was requested and the event is on the heap) the time
    /// remaining until its deadline.
    pub fn pending(&self, ev: &Event, mask: Flag) -> (Flag, Option<Duration>) {
        let st = ev.inner.state.borrow();
        let mut result = Flag::NONE;
        if st.is_set(ON_LIST) || st.is_set(ON_FIRE) {
            match st.kind {
                Kind::Io => {
                    if mask.intersects(Flag::READ) && st.interest.contains(Flag::READ) {
                        result = result | Flag::READ;
                    }
                    if mask.intersects(Flag::WRITE) && st.interest.contains(Flag::WRITE) {
                        result = result | Flag::WRITE;
                    }
                }
                Kind::Signal => {
                    if mask.intersects(Flag::SIGNAL) {
                        result = result | Flag::SIGNAL;
                    }
                }
                Kind::Timeout => {}
            }
        }
        let remaining = if mask.intersects(Flag::TIMEOUT) && st.is_set(ON_HEAP) {
            result = result | Flag::TIMEOUT;
            st.deadline.map(|d| d.saturating_duration_since(Instant::now()))
        } else {
            None
        };
        (result, remaining)
    }

    /// Clears the running flag; the dispatch loop exits after the callback
    /// that called this returns.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Runs the dispatch loop until no events remain registered or a
    /// callback calls [`EventBase::stop`].
    ///
    /// Each pass: expire due timers, deliver the fire queue, check whether
    /// any work remains, then block in the poller for at most the next
    /// deadline.
    pub fn dispatch(&mut self) -> io::Result<()> {
        self.running = true;
        #[cfg(debug_assertions)]
        let mut idle_spins: u32 = 0;

        while self.running {
            let now = Instant::now();
            while let Some(ev) = self.heap.extract_if_le(now) {
                self.expire_timeout(&ev)?;
            }

            let mut delivered = 0u32;
            while let Some(ev) = self.fire_queue.pop_front() {
                let (ident, fires) = {
                    let mut st = ev.state.borrow_mut();
                    st.clear(ON_FIRE);
                    let fires = st.fires;
                    st.fires = Flag::NONE;
                    (st.ident, fires)
                };
                ev.fire(ident, fires, self);
                delivered += 1;
                if !self.running {
                    return Ok(());
                }
            }

            if self.event_count == 0 {
                return Ok(());
            }

            let timeout = self.heap.first().map(|(deadline, _)| {
                deadline.saturating_duration_since(Instant::now())
            });

            #[cfg(debug_assertions)]
            {
                if delivered == 0 && timeout == Some(Duration::from_secs(0)) {
                    idle_spins += 1;
                    debug_assert!(
                        idle_spins < MAX_IDLE_SPINS,
                        "dispatch loop spun {} times without blocking; a callback is likely \
                         re-arming a zero-timeout timer on every pass",
                        MAX_IDLE_SPINS
                    );
                } else {
                    idle_spins = 0;
                }
            }

            self.ready_buf.clear();
            {
                let EventBase { poller, ready_buf, .. } = self;
                poller.dispatch(timeout, ready_buf)?;
            }
            let ready = std::mem::take(&mut self.ready_buf);
            for r in ready {
                match r {
                    Ready::Io { ev, cond, backend_persists } => self.fire_event(ev, cond, backend_persists)?,
                    Ready::Signal(sig) => self.fire_signal(sig),
                }
            }
        }
        Ok(())
    }

    /// Drains a single expired heap entry: tears down whatever else the
    /// event is registered under, then queues it for delivery with
    /// `TIMEOUT` set. Per §4.1 step 2 this teardown runs unconditionally —
    /// `PERSIST` has no bearing on a companion-timeout expiry, only on
    /// whether a *readiness* firing (`fire_event`) leaves the registration
    /// standing.
    fn expire_timeout(&mut self, ev: &Rc<EventInner>) -> io::Result<()> {
        let kind = ev.state.borrow().kind;
        match kind {
            Kind::Io => self.del_io(ev)?,
            Kind::Signal => self.del_signal_inner(ev)?,
            Kind::Timeout => {}
        }

        {
            let mut st = ev.state.borrow_mut();
            st.clear(ON_HEAP);
            st.deadline = None;
        }
        self.event_count -= 1;

        let mut st = ev.state.borrow_mut();
        st.fires = st.fires | Flag::TIMEOUT;
        if !st.is_set(ON_FIRE) {
            st.set(ON_FIRE);
            drop(st);
            self.fire_queue.push_back(ev.clone());
        }
        Ok(())
    }

    /// Accounts for a readiness notification handed back by the poller.
    /// `backend_persists` says whether the backend's own registration for
    /// `cond` is still alive and would otherwise keep re-firing on its own
    /// (a level-triggered `poll(2)` slot, or a kqueue filter registered
    /// without `EV_ONESHOT`). When the event's own interest lacks
    /// `PERSIST`, this delivery must be its last: a still-alive backend
    /// registration is explicitly deleted, while one the backend already
    /// retired itself (a true kqueue one-shot filter) is just reflected in
    /// the base's own bookkeeping.
    fn fire_event(&mut self, ev: Rc<EventInner>, cond: Flag, backend_persists: bool) -> io::Result<()> {
        {
            let mut st = ev.state.borrow_mut();
            st.fires = st.fires | (cond & (Flag::READ | Flag::WRITE));
            if st.is_set(ON_FIRE) {
                // Already queued for delivery this turn (a combined
                // read+write kqueue registration can report both filters in
                // the same batch). The first call already ran whatever
                // one-shot teardown applies; running it again would double
                // the io_list/heap bookkeeping against containers the event
                // has already left.
                return Ok(());
            }
        }

        let interest_persists = ev.state.borrow().interest.contains(Flag::PERSIST);
        if !interest_persists {
            if backend_persists {
                self.poller.del_io(&ev)?;
            }
            if ev.state.borrow().is_set(ON_HEAP) {
                self.heap.remove(&ev);
                ev.state.borrow_mut().clear(ON_HEAP);
            }
            self.io_list.remove(&ev);
            ev.state.borrow_mut().clear(ON_LIST);
            // One count covers both ON_LIST and a companion ON_HEAP
            // membership (see `arm_timeout`), so this is torn down once,
            // not once per container.
            self.event_count -= 1;
        }

        let mut st = ev.state.borrow_mut();
        if !st.is_set(ON_FIRE) {
            st.set(ON_FIRE);
            drop(st);
            self.fire_queue.push_back(ev);
        }
        Ok(())
    }

    /// Fans a signal delivery out to every event watching `signum`.
    pub(crate) fn fire_signal(&mut self, signum: i32) {
        let members = self.signal_lists[signum as usize].collect();
        for ev in members {
            let mut st = ev.state.borrow_mut();
            st.fires = st.fires | Flag::SIGNAL;
            if !st.is_set(ON_FIRE) {
                st.set(ON_FIRE);
                drop(st);
                self.fire_queue.push_back(ev);
            }
        }
    }
}

impl fmt::Debug for EventBase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventBase")
            .field("event_count", &self.event_count)
            .field("running", &self.running)
            .finish()
    }
}
