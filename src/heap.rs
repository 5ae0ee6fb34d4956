//! The timeout heap.
//!
//! A binary min-heap keyed by deadline, storing `Rc<EventInner>` handles
//! rather than plain values. Arbitrary removal (needed when an event is
//! deleted, or re-added with a fresh deadline while still on the heap) is
//! done by scanning for the entry by pointer identity and rebuilding the
//! heap around it. Ties are
//! broken arbitrarily; nothing in the dispatch loop depends on order among
//! equal deadlines.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Instant;

use crate::event::EventInner;

struct HeapEntry {
    deadline: Instant,
    ev: Rc<EventInner>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &HeapEntry) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &HeapEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &HeapEntry) -> Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

pub(crate) struct TimeoutHeap {
    entries: BinaryHeap<Reverse<HeapEntry>>,
}

impl TimeoutHeap {
    pub(crate) fn new() -> TimeoutHeap {
        TimeoutHeap { entries: BinaryHeap::new() }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert(&mut self, deadline: Instant, ev: Rc<EventInner>) {
        self.entries.push(Reverse(HeapEntry { deadline, ev }));
    }

    /// Removes `ev` from the heap, if present. `O(n)`: see module docs.
    pub(crate) fn remove(&mut self, ev: &Rc<EventInner>) {
        // TODO: use an indexed heap if profiling ever shows this matters.
        let idx = self.entries.iter().position(|Reverse(e)| Rc::ptr_eq(&e.ev, ev));
        if let Some(idx) = idx {
            let mut v = std::mem::replace(&mut self.entries, BinaryHeap::new()).into_vec();
            v.swap_remove(idx);
            self.entries = BinaryHeap::from(v);
        }
    }

    pub(crate) fn first(&self) -> Option<(Instant, Rc<EventInner>)> {
        self.entries.peek().map(|Reverse(e)| (e.deadline, e.ev.clone()))
    }

    /// Pops the head if its deadline has passed, i.e. `deadline <= now`.
    pub(crate) fn extract_if_le(&mut self, now: Instant) -> Option<Rc<EventInner>> {
        match self.entries.peek() {
            Some(Reverse(e)) if e.deadline <= now => {
                self.entries.pop().map(|Reverse(e)| e.ev)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::new_test_event;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order() {
        let mut heap = TimeoutHeap::new();
        let now = Instant::now();
        let a = new_test_event(1);
        let b = new_test_event(2);
        let c = new_test_event(3);
        heap.insert(now + Duration::from_secs(3), a.clone());
        heap.insert(now + Duration::from_secs(1), b.clone());
        heap.insert(now + Duration::from_secs(2), c.clone());

        let far_future = now + Duration::from_secs(10);
        let first = heap.extract_if_le(far_future).unwrap();
        assert!(Rc::ptr_eq(&first, &b));
        let second = heap.extract_if_le(far_future).unwrap();
        assert!(Rc::ptr_eq(&second, &c));
        let third = heap.extract_if_le(far_future).unwrap();
        assert!(Rc::ptr_eq(&third, &a));
        assert!(heap.is_empty());
    }

    #[test]
    fn extract_respects_now() {
        let mut heap = TimeoutHeap::new();
        let now = Instant::now();
        let a = new_test_event(1);
        heap.insert(now + Duration::from_secs(5), a);
        assert!(heap.extract_if_le(now).is_none());
    }

    #[test]
    fn remove_arbitrary_entry() {
        let mut heap = TimeoutHeap::new();
        let now = Instant::now();
        let a = new_test_event(1);
        let b = new_test_event(2);
        heap.insert(now + Duration::from_secs(1), a.clone());
        heap.insert(now + Duration::from_secs(2), b.clone());
        heap.remove(&a);
        let (_, remaining) = heap.first().unwrap();
        assert!(Rc::ptr_eq(&remaining, &b));
    }
}
