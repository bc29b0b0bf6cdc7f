//! The per-tunnel arena mapping 16-bit client numbers to local-socket pairs.
//!
//! A [`Connection`] holds an opaque `user_data` slot; here that slot is an index
//! into this arena rather than a raw pointer, so a tunnel's local-socket
//! bookkeeping is owned in one place and survives independently of whichever
//! `Connection` happens to reference it.

use std::rc::Rc;

use tunsock_reactor::Connection;

/// One multiplexed local-socket pair: the TCP tunnel side and the local domain
/// socket side, cross-linked by the slot they share.
pub struct ClientSpec {
    pub clientno: u16,
    pub sock_conn: Rc<std::cell::RefCell<Connection>>,
    /// Set once the socket-client side's local dial succeeds (or immediately, on
    /// the socket-server side, since its local socket is already connected).
    pub connected: bool,
}

#[derive(Default)]
pub struct ClientRegistry {
    slots: Vec<Option<ClientSpec>>,
}

const CHUNK: usize = 8;

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the lowest free slot and install `spec` there, returning its index.
    /// Used by the side that originates a HELLO: it picks its own id.
    pub fn allocate(&mut self, make: impl FnOnce(u16) -> ClientSpec) -> u16 {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.is_none() {
                let id = idx as u16;
                self.slots[idx] = Some(make(id));
                return id;
            }
        }
        let id = self.slots.len() as u16;
        self.grow_to_fit(id);
        self.slots[id as usize] = Some(make(id));
        id
    }

    /// Install `spec` at exactly `id`, failing if that slot is already occupied.
    /// Used by the side that receives a HELLO and must honor the peer's chosen id.
    pub fn register_at(&mut self, id: u16, make: impl FnOnce(u16) -> ClientSpec) -> Result<(), ()> {
        self.grow_to_fit(id);
        let slot = &mut self.slots[id as usize];
        if slot.is_some() {
            return Err(());
        }
        *slot = Some(make(id));
        Ok(())
    }

    pub fn get(&self, id: u16) -> Option<&ClientSpec> {
        self.slots.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut ClientSpec> {
        self.slots.get_mut(id as usize).and_then(|s| s.as_mut())
    }

    /// Free the slot, if occupied, returning its contents.
    pub fn release(&mut self, id: u16) -> Option<ClientSpec> {
        self.slots.get_mut(id as usize).and_then(|s| s.take())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSpec> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    fn grow_to_fit(&mut self, id: u16) {
        let needed = id as usize + 1;
        if self.slots.len() < needed {
            let rounded = ((needed + CHUNK - 1) / CHUNK) * CHUNK;
            self.slots.resize_with(rounded, || None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use tunsock_reactor::Mode;

    fn spec(id: u16) -> ClientSpec {
        let (a, _b) = UnixStream::pair().unwrap();
        let conn = Connection::new(tunsock_reactor::Transport::Unix(a), Mode::Normal, 0).unwrap();
        ClientSpec {
            clientno: id,
            sock_conn: Rc::new(std::cell::RefCell::new(conn)),
            connected: false,
        }
    }

    #[test]
    fn allocate_picks_lowest_free_slot_and_reuses_after_release() {
        let mut reg = ClientRegistry::new();
        let a = reg.allocate(spec);
        let b = reg.allocate(spec);
        let c = reg.allocate(spec);
        assert_eq!((a, b, c), (0, 1, 2));

        reg.release(b);
        let reused = reg.allocate(spec);
        assert_eq!(reused, 1);
    }

    #[test]
    fn register_at_rejects_taken_slot() {
        let mut reg = ClientRegistry::new();
        reg.register_at(5, spec).unwrap();
        assert!(reg.register_at(5, spec).is_err());
    }

    #[test]
    fn interleaved_hello_bye_hello_matches_slot_accounting() {
        let mut reg = ClientRegistry::new();
        reg.allocate(spec); // 0
        reg.allocate(spec); // 1
        reg.allocate(spec); // 2
        reg.release(1);
        reg.allocate(spec); // reuses 1

        let ids: Vec<u16> = reg.iter().map(|s| s.clientno).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2]);
    }
}
