//! Pure-timer scenarios: a single deadline firing exactly once, and
//! multiple deadlines firing in non-decreasing order relative to one
//! another.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use levent::{Event, EventBase, Flag};

mod support;

/// Slack added on top of the requested deadline before a test calls a slow
/// `dispatch` pass a failure; CI machines occasionally run well behind a
/// scheduled wakeup.
const TIMEOUT_MARGIN: Duration = Duration::from_millis(200);

#[test]
fn fires_once_after_its_deadline() {
    support::init();
    let mut base = EventBase::new().unwrap();

    let fired = Rc::new(RefCell::new(Vec::new()));
    let fired_clone = fired.clone();
    let ev = Event::timer(
        move |ident, fires, _base, arg| {
            let arg = arg.downcast_ref::<i32>().unwrap();
            fired_clone.borrow_mut().push((ident, fires, *arg));
        },
        42i32,
    );

    let start = Instant::now();
    let deadline = Duration::from_millis(10);
    base.add(&ev, Some(deadline)).unwrap();
    base.dispatch().unwrap();
    let elapsed = start.elapsed();

    assert!(elapsed >= deadline);
    #[cfg(not(feature = "disable_test_deadline"))]
    assert!(
        elapsed <= deadline + TIMEOUT_MARGIN,
        "timer fired too late: {:?}, wanted <= {:?}",
        elapsed,
        deadline + TIMEOUT_MARGIN
    );
    assert_eq!(base.event_count(), 0);
    assert_eq!(*fired.borrow(), vec![(-1, Flag::TIMEOUT, 42)]);
}

#[test]
fn fires_in_deadline_order() {
    support::init();
    let mut base = EventBase::new().unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));

    let make = |label: &'static str, order: Rc<RefCell<Vec<&'static str>>>| {
        Event::timer(
            move |_ident, fires, _base, _arg| {
                assert_eq!(fires, Flag::TIMEOUT);
                order.borrow_mut().push(label);
            },
            (),
        )
    };

    let a = make("A", order.clone());
    let b = make("B", order.clone());
    let c = make("C", order.clone());

    base.add(&a, Some(Duration::from_millis(30))).unwrap();
    base.add(&b, Some(Duration::from_millis(10))).unwrap();
    base.add(&c, Some(Duration::from_millis(20))).unwrap();

    base.dispatch().unwrap();

    assert_eq!(*order.borrow(), vec!["B", "C", "A"]);
}

#[test]
fn re_arming_from_within_the_callback_rekeys_the_deadline() {
    support::init();
    let mut base = EventBase::new().unwrap();

    let fire_count = Rc::new(RefCell::new(0u32));
    let self_handle: Rc<RefCell<Option<Event>>> = Rc::new(RefCell::new(None));
    let self_handle_clone = self_handle.clone();
    let fire_count_clone = fire_count.clone();

    let ev = Event::timer(
        move |_ident, fires, base, _arg| {
            assert_eq!(fires, Flag::TIMEOUT);
            *fire_count_clone.borrow_mut() += 1;
            if *fire_count_clone.borrow() == 1 {
                let me = self_handle_clone.borrow().clone().unwrap();
                base.add(&me, Some(Duration::from_millis(5))).unwrap();
            }
        },
        (),
    );
    *self_handle.borrow_mut() = Some(ev.clone());

    base.add(&ev, Some(Duration::from_millis(5))).unwrap();
    assert_eq!(base.event_count(), 1);
    base.dispatch().unwrap();
    assert_eq!(*fire_count.borrow(), 2);
    assert_eq!(base.event_count(), 0);
}
