//! Backend selection: picks the poller `EventBase::new` wires up.
//!
//! `kqueue` is only ever chosen when the `kqueue` feature is enabled *and*
//! the target is one of the BSD family members (including macOS) that
//! actually implement it; every other unix target, and any target where
//! the feature is off, falls back to the portable `poll(2)` backend. This
//! mirrors `event_init`'s `EVENT_OPS_DEFAULT` selection in the original C
//! implementation.

use std::io;

use crate::poller::Poller;

#[cfg(unix)]
mod unix;

#[cfg(feature = "poll")]
mod poll;
#[cfg(feature = "poll")]
mod signal_pipe;

#[cfg(all(
    feature = "kqueue",
    any(
        target_os = "freebsd",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ),
))]
pub(crate) fn new_poller() -> io::Result<Box<dyn Poller>> {
    self::unix::kqueue::KqPoller::new().map(|p| Box::new(p) as Box<dyn Poller>)
}

#[cfg(not(all(
    feature = "kqueue",
    any(
        target_os = "freebsd",
        target_os = "macos",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ),
)))]
pub(crate) fn new_poller() -> io::Result<Box<dyn Poller>> {
    self::poll::PollPoller::new().map(|p| Box::new(p) as Box<dyn Poller>)
}
