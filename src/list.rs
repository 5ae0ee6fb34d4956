//! An intrusive FIFO list over `Rc<EventInner>`.
//!
//! A single event can be a member of two lists at once (its registration
//! list and the fire queue), so the link fields live directly on
//! `EventState` and are selected by `LinkField` rather than being a
//! standalone node wrapper.

use std::rc::{Rc, Weak};

use crate::event::{EventInner, EventState};

/// Which pair of `prev`/`next` fields on `EventState` a list instance uses.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum LinkField {
    /// The registration list (I/O events waiting on a poller, or the events
    /// hanging off a single signal number).
    Reg,
    /// The fire queue.
    Fire,
}

#[derive(Default)]
pub(crate) struct Links {
    pub(crate) prev: Weak<EventInner>,
    pub(crate) next: Option<Rc<EventInner>>,
}

pub(crate) struct IntrusiveList {
    field: LinkField,
    head: Option<Rc<EventInner>>,
    tail: Weak<EventInner>,
    len: usize,
}

impl IntrusiveList {
    pub(crate) fn new(field: LinkField) -> IntrusiveList {
        IntrusiveList { field, head: None, tail: Weak::new(), len: 0 }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn field_mut<'s>(&self, state: &'s mut EventState) -> &'s mut Links {
        match self.field {
            LinkField::Reg => &mut state.reg_links,
            LinkField::Fire => &mut state.fire_links,
        }
    }

    fn field_ref<'s>(&self, state: &'s EventState) -> &'s Links {
        match self.field {
            LinkField::Reg => &state.reg_links,
            LinkField::Fire => &state.fire_links,
        }
    }

    /// Appends `ev` to the tail. The caller is responsible for the
    /// corresponding placement bit.
    pub(crate) fn push_back(&mut self, ev: Rc<EventInner>) {
        {
            let mut st = ev.state.borrow_mut();
            let links = self.field_mut(&mut st);
            links.prev = self.tail.clone();
            links.next = None;
        }
        match self.tail.upgrade() {
            Some(old_tail) => {
                let mut old_st = old_tail.state.borrow_mut();
                self.field_mut(&mut old_st).next = Some(Rc::clone(&ev));
            }
            None => self.head = Some(Rc::clone(&ev)),
        }
        self.tail = Rc::downgrade(&ev);
        self.len += 1;
    }

    /// Removes `ev` from the list. `ev` must currently be a member;
    /// callers gate this on the relevant placement bit.
    pub(crate) fn remove(&mut self, ev: &Rc<EventInner>) {
        let (prev, next) = {
            let mut st = ev.state.borrow_mut();
            let links = self.field_mut(&mut st);
            let prev = links.prev.clone();
            let next = links.next.take();
            links.prev = Weak::new();
            (prev, next)
        };
        match prev.upgrade() {
            Some(prev_rc) => {
                let mut pst = prev_rc.state.borrow_mut();
                self.field_mut(&mut pst).next = next.clone();
            }
            None => self.head = next.clone(),
        }
        match &next {
            Some(next_rc) => {
                let mut nst = next_rc.state.borrow_mut();
                self.field_mut(&mut nst).prev = prev;
            }
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<Rc<EventInner>> {
        let head = self.head.clone()?;
        self.remove(&head);
        Some(head)
    }

    /// Snapshot of the current members, head to tail. Used for fan-out
    /// delivery (e.g. signal lists) where the list itself is not mutated
    /// while a member's own state is being touched.
    pub(crate) fn collect(&self) -> Vec<Rc<EventInner>> {
        let mut v = Vec::with_capacity(self.len);
        let mut cur = self.head.clone();
        while let Some(node) = cur {
            let next = {
                let st = node.state.borrow();
                self.field_ref(&st).next.clone()
            };
            v.push(node);
            cur = next;
        }
        v
    }
}
