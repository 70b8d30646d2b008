//! Slot storage for header elements.
//!
//! Elements are addressed by [`HeaderId`], an index plus the generation of the
//! slot at the time the element was stored. Clearing the arena bumps every
//! generation, so ids handed out before a clear stop resolving instead of
//! silently pointing at a recycled element.

use crate::store::element::HeaderElement;

/// Stable handle on one header occurrence of a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeaderId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    element: Option<HeaderElement>,
}

#[derive(Debug, Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub(crate) fn insert(&mut self, element: HeaderElement) -> HeaderId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.element = Some(element);
            return HeaderId { index, generation: slot.generation };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot { generation: 0, element: Some(element) });
        HeaderId { index, generation: 0 }
    }

    pub(crate) fn get(&self, id: HeaderId) -> Option<&HeaderElement> {
        self.slots.get(id.index as usize).filter(|slot| slot.generation == id.generation).and_then(|slot| slot.element.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: HeaderId) -> Option<&mut HeaderElement> {
        self.slots.get_mut(id.index as usize).filter(|slot| slot.generation == id.generation).and_then(|slot| slot.element.as_mut())
    }

    /// Empties every slot onto the free list.
    pub(crate) fn clear(&mut self) {
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            slot.element = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(u32::try_from(index).unwrap_or(u32::MAX));
        }
    }
}
