//! Doubly-linked list (NT LIST_ENTRY style) over arena handles
//!
//! The list entry is embedded in the containing record like a LIST_ENTRY,
//! but links are [`Handle`]s into the record's [`Arena`] instead of raw
//! pointers. A [`ListHead`] owns the head/tail indices; every operation is
//! handed the arena and a [`Link`] selecting which embedded entry to use,
//! since one record can sit on several lists at once (a thread is on its
//! process list and on a ready queue).
//!
//! Insert and remove are O(1). Linking an entry that is already linked, or
//! removing one that is not, is list corruption and bugchecks.

use super::arena::{Arena, Handle};
use super::bugcheck::{codes, CORRUPT_LIST_ENTRY};

/// Entry embedded in a list member
pub struct ListEntry<T> {
    flink: Option<Handle<T>>,
    blink: Option<Handle<T>>,
    linked: bool,
}

impl<T> ListEntry<T> {
    pub const fn new() -> Self {
        Self {
            flink: None,
            blink: None,
            linked: false,
        }
    }

    /// Is this entry currently on a list
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

impl<T> Default for ListEntry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for ListEntry<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListEntry")
            .field("flink", &self.flink)
            .field("blink", &self.blink)
            .field("linked", &self.linked)
            .finish()
    }
}

/// Selects the embedded [`ListEntry`] a list threads through
pub struct Link<T> {
    pub get: fn(&T) -> &ListEntry<T>,
    pub get_mut: fn(&mut T) -> &mut ListEntry<T>,
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Link<T> {}

/// Build a [`Link`] for a field: `link!(KThread, wait_list_entry)`
#[macro_export]
macro_rules! link {
    ($ty:ty, $field:ident) => {
        $crate::ke::list::Link::<$ty> {
            get: |item: &$ty| &item.$field,
            get_mut: |item: &mut $ty| &mut item.$field,
        }
    };
}

/// List head: first/last member and a count
pub struct ListHead<T> {
    head: Option<Handle<T>>,
    tail: Option<Handle<T>>,
    len: usize,
}

impl<T> ListHead<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn first(&self) -> Option<Handle<T>> {
        self.head
    }

    pub fn last(&self) -> Option<Handle<T>> {
        self.tail
    }

    /// Member following `item`
    pub fn next(arena: &Arena<T>, item: Handle<T>, link: Link<T>) -> Option<Handle<T>> {
        (link.get)(&arena[item]).flink
    }

    /// Member preceding `item`
    pub fn prev(arena: &Arena<T>, item: Handle<T>, link: Link<T>) -> Option<Handle<T>> {
        (link.get)(&arena[item]).blink
    }

    fn claim(arena: &mut Arena<T>, item: Handle<T>, link: Link<T>) -> &mut ListEntry<T> {
        let entry = (link.get_mut)(&mut arena[item]);
        if entry.linked {
            corrupt(item)
        }
        entry.linked = true;
        entry
    }

    pub fn insert_head(&mut self, arena: &mut Arena<T>, item: Handle<T>, link: Link<T>) {
        let old_head = self.head;
        let entry = Self::claim(arena, item, link);
        entry.blink = None;
        entry.flink = old_head;

        match old_head {
            Some(next) => (link.get_mut)(&mut arena[next]).blink = Some(item),
            None => self.tail = Some(item),
        }
        self.head = Some(item);
        self.len += 1;
    }

    pub fn insert_tail(&mut self, arena: &mut Arena<T>, item: Handle<T>, link: Link<T>) {
        let old_tail = self.tail;
        let entry = Self::claim(arena, item, link);
        entry.flink = None;
        entry.blink = old_tail;

        match old_tail {
            Some(prev) => (link.get_mut)(&mut arena[prev]).flink = Some(item),
            None => self.head = Some(item),
        }
        self.tail = Some(item);
        self.len += 1;
    }

    /// Link `item` directly after `after`, which must be on this list
    pub fn insert_after(&mut self, arena: &mut Arena<T>, after: Handle<T>, item: Handle<T>, link: Link<T>) {
        if !(link.get)(&arena[after]).linked {
            corrupt(after)
        }

        let next = (link.get)(&arena[after]).flink;
        let entry = Self::claim(arena, item, link);
        entry.blink = Some(after);
        entry.flink = next;

        (link.get_mut)(&mut arena[after]).flink = Some(item);
        match next {
            Some(next) => (link.get_mut)(&mut arena[next]).blink = Some(item),
            None => self.tail = Some(item),
        }
        self.len += 1;
    }

    /// Unlink `item` from this list
    pub fn remove_entry(&mut self, arena: &mut Arena<T>, item: Handle<T>, link: Link<T>) {
        let entry = (link.get_mut)(&mut arena[item]);
        if !entry.linked {
            corrupt(item)
        }

        let (flink, blink) = (entry.flink.take(), entry.blink.take());
        entry.linked = false;

        match blink {
            Some(prev) => (link.get_mut)(&mut arena[prev]).flink = flink,
            None => {
                if self.head != Some(item) {
                    corrupt(item)
                }
                self.head = flink;
            }
        }
        match flink {
            Some(next) => (link.get_mut)(&mut arena[next]).blink = blink,
            None => {
                if self.tail != Some(item) {
                    corrupt(item)
                }
                self.tail = blink;
            }
        }
        self.len -= 1;
    }

    pub fn remove_head(&mut self, arena: &mut Arena<T>, link: Link<T>) -> Option<Handle<T>> {
        let item = self.head?;
        self.remove_entry(arena, item, link);
        Some(item)
    }

    pub fn remove_tail(&mut self, arena: &mut Arena<T>, link: Link<T>) -> Option<Handle<T>> {
        let item = self.tail?;
        self.remove_entry(arena, item, link);
        Some(item)
    }

    /// Walk members from head to tail
    pub fn iter<'a>(&self, arena: &'a Arena<T>, link: Link<T>) -> ListIter<'a, T> {
        ListIter {
            arena,
            link,
            next: self.head,
        }
    }

    /// Collect member handles, head first
    pub fn handles(&self, arena: &Arena<T>, link: Link<T>) -> alloc::vec::Vec<Handle<T>> {
        self.iter(arena, link).collect()
    }
}

impl<T> Default for ListHead<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for ListHead<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ListHead")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}

pub struct ListIter<'a, T> {
    arena: &'a Arena<T>,
    link: Link<T>,
    next: Option<Handle<T>>,
}

impl<T> Iterator for ListIter<'_, T> {
    type Item = Handle<T>;

    fn next(&mut self) -> Option<Handle<T>> {
        let item = self.next?;
        self.next = (self.link.get)(&self.arena[item]).flink;
        Some(item)
    }
}

#[cold]
fn corrupt<T>(item: Handle<T>) -> ! {
    crate::bugcheck!(codes::KERNEL_SECURITY_CHECK_FAILURE, CORRUPT_LIST_ENTRY, item.to_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Node {
        value: u32,
        entry: ListEntry<Node>,
        other: ListEntry<Node>,
    }

    fn node(arena: &mut Arena<Node>, value: u32) -> Handle<Node> {
        arena.insert(Node {
            value,
            entry: ListEntry::new(),
            other: ListEntry::new(),
        })
    }

    fn values(list: &ListHead<Node>, arena: &Arena<Node>) -> Vec<u32> {
        list.iter(arena, crate::link!(Node, entry)).map(|h| arena[h].value).collect()
    }

    #[test]
    fn test_insert_order() {
        let mut arena = Arena::new();
        let mut list = ListHead::new();
        let link = crate::link!(Node, entry);

        let a = node(&mut arena, 1);
        let b = node(&mut arena, 2);
        let c = node(&mut arena, 3);
        list.insert_tail(&mut arena, a, link);
        list.insert_tail(&mut arena, b, link);
        list.insert_head(&mut arena, c, link);

        assert_eq!(values(&list, &arena), [3, 1, 2]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.first(), Some(c));
        assert_eq!(list.last(), Some(b));
    }

    #[test]
    fn test_insert_after_and_remove() {
        let mut arena = Arena::new();
        let mut list = ListHead::new();
        let link = crate::link!(Node, entry);

        let a = node(&mut arena, 1);
        let b = node(&mut arena, 2);
        let c = node(&mut arena, 3);
        list.insert_tail(&mut arena, a, link);
        list.insert_tail(&mut arena, b, link);
        list.insert_after(&mut arena, a, c, link);
        assert_eq!(values(&list, &arena), [1, 3, 2]);

        list.remove_entry(&mut arena, c, link);
        assert_eq!(values(&list, &arena), [1, 2]);
        assert!(!arena[c].entry.is_linked());

        assert_eq!(list.remove_tail(&mut arena, link), Some(b));
        assert_eq!(list.remove_head(&mut arena, link), Some(a));
        assert!(list.is_empty());
        assert_eq!(list.remove_head(&mut arena, link), None);
    }

    #[test]
    fn test_member_of_two_lists() {
        let mut arena = Arena::new();
        let mut first = ListHead::new();
        let mut second = ListHead::new();

        let a = node(&mut arena, 1);
        let b = node(&mut arena, 2);
        first.insert_tail(&mut arena, a, crate::link!(Node, entry));
        first.insert_tail(&mut arena, b, crate::link!(Node, entry));
        second.insert_tail(&mut arena, b, crate::link!(Node, other));
        second.insert_tail(&mut arena, a, crate::link!(Node, other));

        let order: Vec<_> = second.iter(&arena, crate::link!(Node, other)).collect();
        assert_eq!(order, [b, a]);
        assert_eq!(values(&first, &arena), [1, 2]);
    }

    #[test]
    #[should_panic(expected = "KERNEL_SECURITY_CHECK_FAILURE")]
    fn test_double_insert_bugchecks() {
        let mut arena = Arena::new();
        let mut list = ListHead::new();
        let a = node(&mut arena, 1);
        list.insert_tail(&mut arena, a, crate::link!(Node, entry));
        list.insert_tail(&mut arena, a, crate::link!(Node, entry));
    }
}
