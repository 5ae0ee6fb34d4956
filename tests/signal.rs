//! Signal delivery: a persistent `SIGUSR1` watcher raised while the loop
//! is (about to be) blocked in `dispatch`.

use std::cell::RefCell;
use std::rc::Rc;

use levent::{Event, EventBase, Flag};

mod support;

#[test]
fn signal_delivery_fires_and_del_restores_disposition() {
    support::init();
    let mut base = EventBase::new().unwrap();

    let fire_count = Rc::new(RefCell::new(0u32));
    let fire_count_clone = fire_count.clone();
    let ev = Event::signal(
        libc::SIGUSR1,
        move |ident, fires, base, _arg| {
            assert_eq!(ident, libc::SIGUSR1);
            assert!(fires.contains(Flag::SIGNAL));
            *fire_count_clone.borrow_mut() += 1;
            base.stop();
        },
        (),
    );

    base.add(&ev, None).unwrap();
    assert_eq!(base.event_count(), 1);

    // Raised twice before the loop gets a chance to run: the handler (or
    // its rescan fallback) may coalesce these into a single delivery, but
    // it must never be zero.
    unsafe {
        libc::raise(libc::SIGUSR1);
        libc::raise(libc::SIGUSR1);
    }

    base.dispatch().unwrap();

    let count = *fire_count.borrow();
    assert!(count >= 1 && count <= 2, "expected 1 or 2 deliveries, got {}", count);

    base.del(&ev).unwrap();
    assert_eq!(base.event_count(), 0);
}

#[test]
fn del_restores_the_prior_disposition() {
    support::init();
    let mut base = EventBase::new().unwrap();

    // Install a sentinel handler before this base ever touches SIGUSR2, so
    // we have something distinctive to check for after `del`.
    extern "C" fn sentinel(_sig: libc::c_int) {}
    let prior = unsafe { libc::signal(libc::SIGUSR2, sentinel as libc::sighandler_t) };
    assert_ne!(prior, libc::SIG_ERR);

    let ev = Event::signal(libc::SIGUSR2, |_, _, _, _| {}, ());
    base.add(&ev, None).unwrap();
    base.del(&ev).unwrap();
    assert_eq!(base.event_count(), 0);

    let restored = unsafe { libc::signal(libc::SIGUSR2, libc::SIG_DFL) };
    assert_eq!(restored, sentinel as libc::sighandler_t, "del did not restore the pre-existing handler");
}
