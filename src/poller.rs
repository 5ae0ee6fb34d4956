//! The pluggable poller contract.
//!
//! A poller blocks the process until an I/O condition or signal is ready
//! (or a deadline passes) and translates whatever the OS handed back into a
//! neutral list of [`Ready`] entries. It does not run callbacks itself —
//! `EventBase::dispatch` does that, after the poller call returns, so a
//! poller implementation never has to re-enter its own `&mut self`.

use std::fmt;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::event::EventInner;

/// One readiness notification handed back from a poller's `dispatch`.
pub(crate) enum Ready {
    Io {
        ev: Rc<EventInner>,
        cond: crate::flag::Flag,
        /// Whether the backend registration for `cond` is still alive and
        /// will keep re-firing on its own (a level-triggered `poll(2)` slot,
        /// or a kqueue filter submitted without `EV_ONESHOT`). When this is
        /// `true` and the event's own interest lacks `PERSIST`, the core
        /// must explicitly tear the registration down; when it's `false`
        /// the backend already consumed a true one-shot filter by itself.
        backend_persists: bool,
    },
    Signal(i32),
}

pub(crate) trait Poller: fmt::Debug {
    /// Blocks for at most `timeout` (or indefinitely if `None`), then
    /// appends every readiness notification it collected to `ready`.
    fn dispatch(&mut self, timeout: Option<Duration>, ready: &mut Vec<Ready>) -> io::Result<()>;

    fn add_io(&mut self, ev: &Rc<EventInner>) -> io::Result<()>;
    fn del_io(&mut self, ev: &Rc<EventInner>) -> io::Result<()>;

    /// Registers interest in `signum`. The poller owns whatever plumbing
    /// (kqueue `EVFILT_SIGNAL`, a self-pipe) it needs to learn about
    /// delivery; this is purely backend bookkeeping and does not touch the
    /// base's own event accounting, which is already updated by the signal
    /// event's own `add`.
    fn add_signal(&mut self, signum: i32) -> io::Result<()>;
    fn del_signal(&mut self, signum: i32) -> io::Result<()>;
}
