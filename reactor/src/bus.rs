//! A small synchronous pub/sub bus.
//!
//! Used for the reactor's own broadcast notifications (`tick`, `events-done`,
//! `shutdown`) where several independent, unrelated parts of the system each want to
//! run a bit of cleanup or bookkeeping on every firing. Per-connection events
//! (`data-received`, `data-sent`, `closed`) are not routed through here: each
//! connection has exactly one owner, so those are delivered directly as drained
//! [`crate::connection::ConnEvent`] values instead of through a registry.
//!
//! Handlers are kept in insertion order. Unregistering while a `raise` is under way
//! is safe: the slot is tombstoned immediately and only physically removed the next
//! time something registers, mirroring the "mark as tombstone, compact lazily"
//! contract in the design notes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(usize);

struct Slot<A> {
    handler: Option<Box<dyn FnMut(&A)>>,
}

pub struct Bus<A> {
    slots: Vec<Slot<A>>,
    dirty: bool,
}

impl<A> Default for Bus<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Bus<A> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            dirty: false,
        }
    }

    fn compact(&mut self) {
        self.slots.retain(|slot| slot.handler.is_some());
        self.dirty = false;
    }

    pub fn register(&mut self, handler: impl FnMut(&A) + 'static) -> SubscriptionId {
        if self.dirty {
            self.compact();
        }
        self.slots.push(Slot {
            handler: Some(Box::new(handler)),
        });
        SubscriptionId(self.slots.len() - 1)
    }

    pub fn unregister(&mut self, id: SubscriptionId) {
        if let Some(slot) = self.slots.get_mut(id.0) {
            slot.handler = None;
            self.dirty = true;
        }
    }

    pub fn raise(&mut self, args: &A) {
        for slot in &mut self.slots {
            if let Some(handler) = slot.handler.as_mut() {
                handler(args);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.handler.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn raises_in_insertion_order() {
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut bus: Bus<()> = Bus::new();

        let o1 = order.clone();
        bus.register(move |_| o1.borrow_mut().push(1));
        let o2 = order.clone();
        bus.register(move |_| o2.borrow_mut().push(2));

        bus.raise(&());
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn unregister_stops_delivery_without_disturbing_others() {
        let calls = Rc::new(Cell::new(0));
        let mut bus: Bus<()> = Bus::new();

        let c = calls.clone();
        let id = bus.register(move |_| c.set(c.get() + 1));
        let c2 = calls.clone();
        bus.register(move |_| c2.set(c2.get() + 1));

        bus.unregister(id);
        bus.raise(&());

        assert_eq!(calls.get(), 1);
    }
}
