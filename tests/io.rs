//! I/O readiness scenarios: one-shot reads, and a persistent read paired
//! with a re-arming companion timeout.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use levent::{Event, EventBase, Flag};

mod support;
use support::Pipe;

#[test]
fn one_shot_read_fires_once_then_unregisters() {
    support::init();
    let mut base = EventBase::new().unwrap();
    let pipe = Pipe::new();

    let fire_count = Rc::new(RefCell::new(0u32));
    let fire_count_clone = fire_count.clone();
    let ev = Event::io(
        pipe.r,
        Flag::READ,
        move |_ident, fires, _base, _arg| {
            assert_eq!(fires, Flag::READ);
            *fire_count_clone.borrow_mut() += 1;
        },
        (),
    );

    base.add(&ev, None).unwrap();
    pipe.write_byte();
    base.dispatch().unwrap();

    assert_eq!(*fire_count.borrow(), 1);
    assert_eq!(base.event_count(), 0);

    // A second write must not cause a second invocation: the event is no
    // longer registered with either the poller or the I/O list.
    pipe.write_byte();
    base.dispatch().unwrap();
    assert_eq!(*fire_count.borrow(), 1);
}

#[test]
fn persistent_read_with_companion_timeout_rearms() {
    support::init();
    let mut base = EventBase::new().unwrap();
    let pipe = Pipe::new();

    let fires_seen = Rc::new(RefCell::new(Vec::new()));
    let self_handle: Rc<RefCell<Option<Event>>> = Rc::new(RefCell::new(None));

    let fires_seen_clone = fires_seen.clone();
    let self_handle_clone = self_handle.clone();
    let pipe_r = pipe.r;
    let ev = Event::io(
        pipe_r,
        Flag::READ | Flag::PERSIST,
        move |_ident, fires, base, _arg| {
            fires_seen_clone.borrow_mut().push(fires);
            if fires.contains(Flag::READ) {
                let mut buf = [0u8; 1];
                unsafe { libc::read(pipe_r, buf.as_mut_ptr() as *mut libc::c_void, 1) };
                // Re-arm the companion timeout; no further writes happen,
                // so the next firing on this event is the TIMEOUT.
                let me = self_handle_clone.borrow().clone().unwrap();
                base.add(&me, Some(Duration::from_millis(50))).unwrap();
            } else {
                base.stop();
            }
        },
        (),
    );
    *self_handle.borrow_mut() = Some(ev.clone());

    base.add(&ev, Some(Duration::from_millis(50))).unwrap();
    pipe.write_byte();
    base.dispatch().unwrap();

    let seen = fires_seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], Flag::READ);
    assert_eq!(seen[1], Flag::TIMEOUT);
    // The companion timeout's expiry tears the I/O registration down
    // unconditionally (PERSIST only protects a readiness firing, not a
    // timeout one), so nothing is left registered once it fires.
    assert_eq!(base.event_count(), 0);
}

#[test]
fn del_is_idempotent() {
    support::init();
    let mut base = EventBase::new().unwrap();
    let pipe = Pipe::new();
    let ev = Event::io(pipe.r, Flag::READ, |_, _, _, _| {}, ());

    base.add(&ev, None).unwrap();
    base.del(&ev).unwrap();
    base.del(&ev).unwrap();
    assert_eq!(base.event_count(), 0);
}

#[test]
fn readd_without_timeout_is_a_noop_for_a_registered_event() {
    support::init();
    let mut base = EventBase::new().unwrap();
    let pipe = Pipe::new();
    let ev = Event::io(pipe.r, Flag::READ, |_, _, _, _| {}, ());

    base.add(&ev, None).unwrap();
    assert_eq!(base.event_count(), 1);
    base.add(&ev, None).unwrap();
    assert_eq!(base.event_count(), 1);
}
