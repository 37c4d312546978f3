//! Scratch slots written by instrumented code.
//!
//! Each module namespace owns one `attr`/`index` pair. Pairs live in a
//! thread-local table, so concurrent interpreters on different threads never
//! observe each other's slots. A missing slot means "no data" and is never an
//! error.

use std::cell::RefCell;
use std::collections::HashMap;

use exlens_ir::ScratchSlot;

use crate::value::{NamespaceId, Value};

#[derive(Debug, Clone, Default)]
pub struct SlotPair {
    pub attr: Option<Value>,
    pub index: Option<Value>,
}

impl SlotPair {
    pub fn is_empty(&self) -> bool {
        self.attr.is_none() && self.index.is_none()
    }

    fn slot_mut(&mut self, slot: ScratchSlot) -> &mut Option<Value> {
        match slot {
            ScratchSlot::Attr => &mut self.attr,
            ScratchSlot::Index => &mut self.index,
        }
    }
}

thread_local! {
    static SLOTS: RefCell<HashMap<NamespaceId, SlotPair>> = RefCell::new(HashMap::new());
}

pub fn store(namespace: NamespaceId, slot: ScratchSlot, value: Value) {
    SLOTS.with(|slots| {
        *slots
            .borrow_mut()
            .entry(namespace)
            .or_default()
            .slot_mut(slot) = Some(value);
    });
}

pub fn clear(namespace: NamespaceId, slot: ScratchSlot) {
    SLOTS.with(|slots| {
        let mut slots = slots.borrow_mut();
        if let Some(pair) = slots.get_mut(&namespace) {
            *pair.slot_mut(slot) = None;
            if pair.is_empty() {
                slots.remove(&namespace);
            }
        }
    });
}

pub fn peek(namespace: NamespaceId, slot: ScratchSlot) -> Option<Value> {
    SLOTS.with(|slots| {
        slots
            .borrow()
            .get(&namespace)
            .and_then(|pair| match slot {
                ScratchSlot::Attr => pair.attr.clone(),
                ScratchSlot::Index => pair.index.clone(),
            })
    })
}

pub fn take(namespace: NamespaceId, slot: ScratchSlot) -> Option<Value> {
    let value = peek(namespace, slot);
    clear(namespace, slot);
    value
}

/// Removes and returns both slots of a namespace.
pub fn take_pair(namespace: NamespaceId) -> SlotPair {
    SLOTS.with(|slots| slots.borrow_mut().remove(&namespace).unwrap_or_default())
}

/// True when either slot of the namespace holds a value.
pub fn is_set(namespace: NamespaceId) -> bool {
    SLOTS.with(|slots| slots.borrow().contains_key(&namespace))
}

/// Drops every slot on the current thread.
pub fn reset() {
    SLOTS.with(|slots| slots.borrow_mut().clear());
}
