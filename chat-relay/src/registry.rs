//! Bounded, ordered set of live endpoints.
//!
//! Slot 0 always holds the control channel's read end and slot 1 the
//! listener; clients follow in admission order. Removal shifts later slots
//! down without reordering them. Callers that discover removals while
//! walking the registry should collect ids from [`Registry::client_ids`]
//! and remove afterwards.

use anyhow::{Result, ensure};
use thiserror::Error;

use crate::{
    config::RESERVED_SLOTS,
    endpoint::{Endpoint, EndpointId, Role},
};

const CONTROL_SLOT: usize = 0;
const LISTENER_SLOT: usize = 1;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The endpoint is handed back; the caller owns closing it.
    #[error("registry is full ({capacity} slots)")]
    Full { capacity: usize, rejected: Endpoint },
    #[error("only client endpoints can be added, got {0:?}")]
    NotAClient(Role),
}

#[derive(Debug)]
struct Slot {
    id: EndpointId,
    endpoint: Endpoint,
}

#[derive(Debug)]
pub struct Registry {
    slots: Vec<Slot>,
    capacity: usize,
    next_id: u64,
}

impl Registry {
    pub fn new(control_in: Endpoint, listener: Endpoint, capacity: usize) -> Result<Self> {
        ensure!(
            control_in.role() == Role::ControlIn,
            "slot 0 must be the control channel, got {:?}",
            control_in.role()
        );
        ensure!(
            listener.role() == Role::Listener,
            "slot 1 must be the listener, got {:?}",
            listener.role()
        );
        ensure!(
            capacity > RESERVED_SLOTS,
            "capacity {capacity} leaves no room for clients"
        );

        let mut registry = Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next_id: 0,
        };
        registry.push(control_in);
        registry.push(listener);
        Ok(registry)
    }

    fn push(&mut self, endpoint: Endpoint) -> EndpointId {
        let id = EndpointId::new(self.next_id);
        self.next_id += 1;
        self.slots.push(Slot { id, endpoint });
        id
    }

    pub fn try_add(&mut self, endpoint: Endpoint) -> Result<EndpointId, RegistryError> {
        if endpoint.role() != Role::Client {
            return Err(RegistryError::NotAClient(endpoint.role()));
        }
        if self.is_full() {
            return Err(RegistryError::Full {
                capacity: self.capacity,
                rejected: endpoint,
            });
        }
        Ok(self.push(endpoint))
    }

    /// Closes and drops a client, keeping the survivors in order.
    ///
    /// Returns `false` for unknown ids and for the reserved slots.
    pub fn remove(&mut self, id: EndpointId) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        if index < RESERVED_SLOTS {
            return false;
        }
        let mut slot = self.slots.remove(index);
        slot.endpoint.close();
        true
    }

    fn position(&self, id: EndpointId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    pub fn get_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .map(|slot| &mut slot.endpoint)
    }

    pub fn control_in_mut(&mut self) -> &mut Endpoint {
        &mut self.slots[CONTROL_SLOT].endpoint
    }

    pub fn listener_mut(&mut self) -> &mut Endpoint {
        &mut self.slots[LISTENER_SLOT].endpoint
    }

    /// Every endpoint in registry order, reserved slots included.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (EndpointId, &mut Endpoint)> {
        self.slots
            .iter_mut()
            .map(|slot| (slot.id, &mut slot.endpoint))
    }

    pub fn for_each_client<F>(&mut self, mut f: F)
    where
        F: FnMut(EndpointId, &mut Endpoint),
    {
        for slot in &mut self.slots[RESERVED_SLOTS..] {
            f(slot.id, &mut slot.endpoint);
        }
    }

    /// Snapshot of client ids, safe to hold across removals.
    pub fn client_ids(&self) -> Vec<EndpointId> {
        self.slots[RESERVED_SLOTS..]
            .iter()
            .map(|slot| slot.id)
            .collect()
    }

    /// Total slots, reserved ones included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn client_capacity(&self) -> usize {
        self.capacity - RESERVED_SLOTS
    }

    pub fn client_count(&self) -> usize {
        self.slots.len() - RESERVED_SLOTS
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Closes clients in order, then the listener, then the control channel.
    pub fn close_all(&mut self) {
        for slot in self.slots.drain(RESERVED_SLOTS..) {
            let mut endpoint = slot.endpoint;
            endpoint.close();
        }
        self.slots[LISTENER_SLOT].endpoint.close();
        self.slots[CONTROL_SLOT].endpoint.close();
    }
}
