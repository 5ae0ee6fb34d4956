//! The event record: identity, requested conditions and the callback to run
//! when those conditions are met.
//!
//! An `Event` is a cheap, cloneable handle (`Rc`) onto shared, interior-
//! mutable storage. That storage is split into three independently
//! borrowable cells — `state`, `callback` and `user_data` — so that a
//! callback invoked by the dispatch loop can freely call back into
//! [`EventBase`](crate::EventBase) to add or remove events, including
//! itself, without tripping `RefCell`'s borrow rules.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use crate::flag::Flag;
use crate::list::Links;

/// What an event is attached to.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Kind {
    Io,
    Timeout,
    Signal,
}

/// Placement bits: which of the base's containers currently reference this
/// event. Mirrors `EV_INITIALIZED`/`EV_ON_LIST`/`EV_ON_FIRE`/`EV_ON_HEAP`.
pub(crate) const INITIALIZED: u8 = 1 << 0;
pub(crate) const ON_LIST: u8 = 1 << 1;
pub(crate) const ON_FIRE: u8 = 1 << 2;
pub(crate) const ON_HEAP: u8 = 1 << 3;

/// Backend-private handle stashed on an event so a poller can find its own
/// bookkeeping (a `poll(2)` slot index, say) without a side table.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Cookie {
    None,
    PollSlot(usize),
}

/// The mutable, frequently-touched half of an event: identity, requested
/// and fired conditions, placement bits, and list/heap linkage.
pub(crate) struct EventState {
    pub(crate) ident: i32,
    pub(crate) kind: Kind,
    pub(crate) interest: Flag,
    pub(crate) bits: u8,
    pub(crate) fires: Flag,
    pub(crate) deadline: Option<Instant>,
    pub(crate) cookie: Cookie,
    pub(crate) reg_links: Links,
    pub(crate) fire_links: Links,
}

impl EventState {
    fn new() -> EventState {
        EventState {
            ident: -1,
            kind: Kind::Io,
            interest: Flag::NONE,
            bits: 0,
            fires: Flag::NONE,
            deadline: None,
            cookie: Cookie::None,
            reg_links: Links::default(),
            fire_links: Links::default(),
        }
    }

    pub(crate) fn is_set(&self, bit: u8) -> bool {
        self.bits & bit != 0
    }

    pub(crate) fn set(&mut self, bit: u8) {
        self.bits |= bit;
    }

    pub(crate) fn clear(&mut self, bit: u8) {
        self.bits &= !bit;
    }
}

type BoxedCallback = Box<dyn FnMut(i32, Flag, &mut crate::base::EventBase, &mut dyn Any)>;

/// Shared storage behind an [`Event`] handle.
pub(crate) struct EventInner {
    pub(crate) state: RefCell<EventState>,
    callback: RefCell<BoxedCallback>,
    user_data: RefCell<Box<dyn Any>>,
}

impl EventInner {
    fn new(callback: BoxedCallback, user_data: Box<dyn Any>) -> Rc<EventInner> {
        Rc::new(EventInner {
            state: RefCell::new(EventState::new()),
            callback: RefCell::new(callback),
            user_data: RefCell::new(user_data),
        })
    }

    /// Invokes the stored callback. Only ever called from
    /// `EventBase::dispatch`'s fire-queue delivery, which supplies the
    /// `&mut EventBase` the callback may use to re-arm or tear down events.
    pub(crate) fn fire(&self, ident: i32, fires: Flag, base: &mut crate::base::EventBase) {
        let mut cb = self.callback.borrow_mut();
        let mut ud = self.user_data.borrow_mut();
        (cb)(ident, fires, base, &mut **ud);
    }
}

/// A handle to a registrable unit of work: an I/O readiness condition on a
/// descriptor, a POSIX signal, or a timeout.
///
/// Cloning an `Event` clones the handle, not the underlying registration —
/// both handles refer to the same entry in whatever container(s) currently
/// hold it.
#[derive(Clone)]
pub struct Event {
    pub(crate) inner: Rc<EventInner>,
}

impl Event {
    fn from_inner(inner: Rc<EventInner>) -> Event {
        Event { inner }
    }

    /// Builds an event watching a file descriptor for `interest`
    /// (`READ`/`WRITE`, optionally `PERSIST`).
    pub fn io<F, A>(fd: i32, interest: Flag, callback: F, user_data: A) -> Event
    where
        F: FnMut(i32, Flag, &mut crate::base::EventBase, &mut dyn Any) + 'static,
        A: Any + 'static,
    {
        let inner = EventInner::new(Box::new(callback), Box::new(user_data));
        {
            let mut st = inner.state.borrow_mut();
            st.ident = fd;
            st.kind = Kind::Io;
            st.interest = interest;
            st.set(INITIALIZED);
        }
        Event::from_inner(inner)
    }

    /// Builds a timeout-only event (no descriptor, no signal).
    pub fn timer<F, A>(callback: F, user_data: A) -> Event
    where
        F: FnMut(i32, Flag, &mut crate::base::EventBase, &mut dyn Any) + 'static,
        A: Any + 'static,
    {
        let inner = EventInner::new(Box::new(callback), Box::new(user_data));
        {
            let mut st = inner.state.borrow_mut();
            st.ident = -1;
            st.kind = Kind::Timeout;
            st.interest = Flag::NONE;
            st.set(INITIALIZED);
        }
        Event::from_inner(inner)
    }

    /// Builds an event watching a signal number. `PERSIST` is implied:
    /// signal registrations always survive their own firing.
    pub fn signal<F, A>(signum: i32, callback: F, user_data: A) -> Event
    where
        F: FnMut(i32, Flag, &mut crate::base::EventBase, &mut dyn Any) + 'static,
        A: Any + 'static,
    {
        let inner = EventInner::new(Box::new(callback), Box::new(user_data));
        {
            let mut st = inner.state.borrow_mut();
            st.ident = signum;
            st.kind = Kind::Signal;
            st.interest = Flag::PERSIST;
            st.set(INITIALIZED);
        }
        Event::from_inner(inner)
    }

    /// The descriptor or signal number this event is attached to, or `-1`
    /// for a pure timeout. Mirrors the C `EVENT_FD()` accessor.
    pub fn ident(&self) -> i32 {
        self.inner.state.borrow().ident
    }

    /// Whether this event has ever been set up (vs. default-constructed).
    pub fn is_initialized(&self) -> bool {
        self.inner.state.borrow().is_set(INITIALIZED)
    }

    pub(crate) fn kind(&self) -> Kind {
        self.inner.state.borrow().kind
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("Event")
            .field("ident", &st.ident)
            .field("kind", &st.kind)
            .field("interest", &st.interest)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::new_test_event;
    use super::*;

    #[test]
    fn fresh_event_is_initialized_with_requested_ident() {
        let inner = new_test_event(7);
        assert_eq!(inner.state.borrow().ident, 7);
    }

    #[test]
    fn clone_shares_storage() {
        let a = Event::timer(|_, _, _, _| {}, ());
        let b = a.clone();
        assert!(Rc::ptr_eq(&a.inner, &b.inner));
    }
}
