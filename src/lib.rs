//! A single-threaded event-notification core: one dispatch loop that
//! multiplexes I/O readiness on file descriptors, delivery of POSIX
//! signals, and relative/wall timeouts, and hands each off to a
//! user-supplied callback.
//!
//! The loop itself (`EventBase::dispatch`) is oblivious to how readiness is
//! actually observed — that's the job of a pluggable [poller](poller), of
//! which there are two: a kernel-queue backend (`kqueue`, BSD family and
//! macOS) and a portable `poll(2)` backend that also doubles as the
//! fallback everywhere else. Exactly one is compiled in, chosen by
//! [`EventBase::new`] at construction time; there is no runtime
//! reselection.
//!
//! # Examples
//!
//! A one-shot read, woken up by a byte written to the other end of a pipe:
//!
//! ```no_run
//! use std::os::unix::io::RawFd;
//! use levent::{EventBase, Event, Flag};
//!
//! # fn make_pipe() -> (RawFd, RawFd) { unimplemented!() }
//! let (r, _w) = make_pipe();
//! let mut base = EventBase::new().unwrap();
//!
//! let ev = Event::io(r, Flag::READ, |_ident, fires, _base, _arg| {
//!     assert!(fires.contains(Flag::READ));
//! }, ());
//! base.add(&ev, None).unwrap();
//! base.dispatch().unwrap();
//! ```
//!
//! # Threading
//!
//! Nothing here is `Send` or `Sync`. All registration, dispatch and
//! callback invocation is expected to happen on one thread; see the
//! top-level design notes for why (no locks, no cross-thread wakeups).

#![warn(
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]

mod base;
mod event;
mod flag;
mod heap;
mod list;
mod poller;
mod sys;

pub use crate::base::EventBase;
pub use crate::event::Event;
pub use crate::flag::Flag;

/// The number of distinct signal numbers an [`EventBase`] can track at
/// once; [`Event::signal`]'s `signum` must be smaller than this.
pub const NSIG: usize = base::NSIG;
