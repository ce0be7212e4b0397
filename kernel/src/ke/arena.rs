//! Generational arena
//!
//! Dispatcher records (threads, objects, wait blocks, APCs) live in slabs
//! and refer to each other through [`Handle`]s instead of raw pointers. A
//! handle carries the slot generation, so a handle to a freed record is
//! detected rather than silently aliasing whatever reused the slot.

use alloc::vec::Vec;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};

use super::bugcheck::codes;

/// Typed index into an [`Arena`]
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Pack into a single word (index in the low half)
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`to_raw`](Self::to_raw)
    pub const fn from_raw(raw: u64) -> Self {
        Self::new(raw as u32, (raw >> 32) as u32)
    }
}

// Manual impls: derives would require `T: Copy` and friends.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.index, self.generation).cmp(&(other.index, other.generation))
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32, next_free: Option<u32> },
}

/// Slab of `T` addressed by generational handles
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handle the next insertion will return
    fn next_handle(&self) -> Handle<T> {
        match self.free_head {
            Some(index) => match &self.slots[index as usize] {
                Slot::Vacant { generation, .. } => Handle::new(index, *generation),
                Slot::Occupied { .. } => {
                    crate::bugcheck!(codes::KERNEL_SECURITY_CHECK_FAILURE, super::bugcheck::CORRUPT_LIST_ENTRY, index)
                }
            },
            None => Handle::new(self.slots.len() as u32, 0),
        }
    }

    pub fn insert(&mut self, value: T) -> Handle<T> {
        self.insert_with(|_| value)
    }

    /// Insert a value that needs to know its own handle
    pub fn insert_with(&mut self, f: impl FnOnce(Handle<T>) -> T) -> Handle<T> {
        let handle = self.next_handle();
        let value = f(handle);
        let slot = Slot::Occupied {
            generation: handle.generation,
            value,
        };

        if handle.index() == self.slots.len() {
            self.slots.push(slot);
        } else {
            self.free_head = match &self.slots[handle.index()] {
                Slot::Vacant { next_free, .. } => *next_free,
                Slot::Occupied { .. } => None,
            };
            self.slots[handle.index()] = slot;
        }

        self.len += 1;
        handle
    }

    pub fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        if !self.contains(handle) {
            return None;
        }

        let vacant = Slot::Vacant {
            generation: handle.generation.wrapping_add(1),
            next_free: self.free_head,
        };
        let old = core::mem::replace(&mut self.slots[handle.index()], vacant);
        self.free_head = Some(handle.index);
        self.len -= 1;

        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index()) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index()) {
            Some(Slot::Occupied { generation, value }) if *generation == handle.generation => Some(value),
            _ => None,
        }
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| match slot {
            Slot::Occupied { generation, value } => Some((Handle::new(index as u32, *generation), value)),
            Slot::Vacant { .. } => None,
        })
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cold]
fn stale_handle(index: u32, generation: u32) -> ! {
    crate::bugcheck!(codes::INVALID_KERNEL_HANDLE, index, generation)
}

impl<T> Index<Handle<T>> for Arena<T> {
    type Output = T;

    fn index(&self, handle: Handle<T>) -> &T {
        match self.get(handle) {
            Some(value) => value,
            None => stale_handle(handle.index, handle.generation),
        }
    }
}

impl<T> IndexMut<Handle<T>> for Arena<T> {
    fn index_mut(&mut self, handle: Handle<T>) -> &mut T {
        let (index, generation) = (handle.index, handle.generation);
        match self.get_mut(handle) {
            Some(value) => value,
            None => stale_handle(index, generation),
        }
    }
}
