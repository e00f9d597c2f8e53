//! Index-linked doubly-linked lists over an entry arena.
//!
//! Entries live in an arena and are addressed by slot index. Each slot
//! carries a [`Links`] record; an [`EntryList`] only stores head, tail and a
//! count, so one arena can host several lists (the controller keeps three).
//! A slot is a member of at most one list at a time, and the list that owns
//! it is the only one allowed to touch its links.
//!
//! Head is the most recently added entry, tail the least recently added.
//!
//! Lists are not synchronized; the controller's mutex guards every call.

/// Neighbour indices of one arena slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Links {
    /// Towards the head.
    pub prev: Option<usize>,
    /// Towards the tail.
    pub next: Option<usize>,
}

/// Storage that owns the [`Links`] of each slot.
pub trait LinkStore {
    /// Links of slot `idx`.
    fn links(&self, idx: usize) -> &Links;
    /// Mutable links of slot `idx`.
    fn links_mut(&mut self, idx: usize) -> &mut Links;
}

impl LinkStore for Vec<Links> {
    fn links(&self, idx: usize) -> &Links {
        &self[idx]
    }

    fn links_mut(&mut self, idx: usize) -> &mut Links {
        &mut self[idx]
    }
}

/// Head/tail/count of one list threaded through a [`LinkStore`].
#[derive(Debug, Default)]
pub struct EntryList {
    head: Option<usize>,
    tail: Option<usize>,
    count: usize,
}

impl EntryList {
    /// Empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            count: 0,
        }
    }

    /// Number of linked slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// True if nothing is linked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Most recently added slot.
    #[must_use]
    pub fn head(&self) -> Option<usize> {
        self.head
    }

    /// Oldest slot.
    #[must_use]
    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    /// Insert `idx` at the head. `idx` must not be on any list.
    pub fn add_head<S: LinkStore + ?Sized>(&mut self, store: &mut S, idx: usize) {
        debug_assert_eq!(*store.links(idx), Links::default(), "slot {idx} already linked");
        debug_assert_ne!(self.head, Some(idx));

        let old_head = self.head;
        *store.links_mut(idx) = Links {
            prev: None,
            next: old_head,
        };
        match old_head {
            Some(h) => store.links_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.count += 1;
    }

    /// Unlink `idx`, which must be a member of this list.
    pub fn extract<S: LinkStore + ?Sized>(&mut self, store: &mut S, idx: usize) {
        let Links { prev, next } = *store.links(idx);

        match prev {
            Some(p) => store.links_mut(p).next = next,
            None => {
                debug_assert_eq!(self.head, Some(idx), "slot {idx} is not on this list");
                self.head = next;
            }
        }
        match next {
            Some(n) => store.links_mut(n).prev = prev,
            None => {
                debug_assert_eq!(self.tail, Some(idx), "slot {idx} is not on this list");
                self.tail = prev;
            }
        }

        *store.links_mut(idx) = Links::default();
        self.count -= 1;
    }

    /// Unlink and return the least recently added entry.
    pub fn extract_tail<S: LinkStore + ?Sized>(&mut self, store: &mut S) -> Option<usize> {
        let tail = self.tail?;
        self.extract(store, tail);
        Some(tail)
    }

    /// First entry, scanning tail to head, for which `pred` holds.
    pub fn find_from_tail<S, F>(&self, store: &S, mut pred: F) -> Option<usize>
    where
        S: LinkStore + ?Sized,
        F: FnMut(usize) -> bool,
    {
        let mut cur = self.tail;
        while let Some(idx) = cur {
            if pred(idx) {
                return Some(idx);
            }
            cur = store.links(idx).prev;
        }
        None
    }

    /// Splice every entry of `self` onto the head of `dst` in O(1).
    ///
    /// Relative order is kept: `self`'s entries end up newer than `dst`'s.
    /// `self` is left empty.
    pub fn move_into<S: LinkStore + ?Sized>(&mut self, store: &mut S, dst: &mut EntryList) {
        let (Some(src_head), Some(src_tail)) = (self.head, self.tail) else {
            return;
        };

        match dst.head {
            Some(dst_head) => {
                store.links_mut(src_tail).next = Some(dst_head);
                store.links_mut(dst_head).prev = Some(src_tail);
            }
            None => dst.tail = Some(src_tail),
        }
        dst.head = Some(src_head);
        dst.count += self.count;

        *self = EntryList::new();
    }

    /// Indices from head to tail.
    pub fn iter<'a, S: LinkStore + ?Sized>(&self, store: &'a S) -> Iter<'a, S> {
        Iter {
            store,
            cur: self.head,
        }
    }
}

/// Head-to-tail iterator returned by [`EntryList::iter`].
pub struct Iter<'a, S: ?Sized> {
    store: &'a S,
    cur: Option<usize>,
}

impl<S: LinkStore + ?Sized> Iterator for Iter<'_, S> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let idx = self.cur?;
        self.cur = self.store.links(idx).next;
        Some(idx)
    }
}
