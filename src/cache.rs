use crate::id::PageId;
use crate::page::Page;
use std::collections::HashMap;
use std::sync::Arc;

const NIL: usize = usize::MAX;

struct Slot {
    pgid: PageId,
    page: Option<Arc<Page>>,
    dirty: bool,
    prev: usize,
    next: usize,
}

/// LRU map from page number to page. Clean pages live on an intrusive list
/// of slab indices and are evicted from the tail once there are more than
/// `capacity` of them. Dirty pages are kept off the list, so they are never
/// evicted until they are marked clean or removed.
pub(crate) struct PageCache {
    capacity: usize,
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
    index: HashMap<PageId, usize>,
    head: usize,
    tail: usize,
    clean: usize,
}

impl PageCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::new(),
            free_slots: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            clean: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn contains(&self, pgid: PageId) -> bool {
        self.index.contains_key(&pgid)
    }

    pub(crate) fn is_dirty(&self, pgid: PageId) -> bool {
        self.index
            .get(&pgid)
            .map_or(false, |&i| self.slots[i].dirty)
    }

    pub(crate) fn get(&mut self, pgid: PageId) -> Option<Arc<Page>> {
        let i = *self.index.get(&pgid)?;
        if !self.slots[i].dirty {
            self.unlink(i);
            self.push_front(i);
        }
        self.slots[i].page.clone()
    }

    pub(crate) fn insert_clean(&mut self, pgid: PageId, page: Arc<Page>) {
        self.insert(pgid, page, false);
        self.evict();
    }

    pub(crate) fn insert_dirty(&mut self, pgid: PageId, page: Arc<Page>) {
        self.insert(pgid, page, true);
    }

    /// Unpins a dirty page after it has been written.
    pub(crate) fn mark_clean(&mut self, pgid: PageId) {
        let Some(&i) = self.index.get(&pgid) else {
            return;
        };
        if self.slots[i].dirty {
            self.slots[i].dirty = false;
            self.push_front(i);
            self.clean += 1;
        }
        self.evict();
    }

    pub(crate) fn remove(&mut self, pgid: PageId) -> Option<Arc<Page>> {
        let i = self.index.remove(&pgid)?;
        if !self.slots[i].dirty {
            self.unlink(i);
            self.clean -= 1;
        }
        self.free_slots.push(i);
        self.slots[i].page.take()
    }

    fn insert(&mut self, pgid: PageId, page: Arc<Page>, dirty: bool) {
        if let Some(&i) = self.index.get(&pgid) {
            if !self.slots[i].dirty {
                self.unlink(i);
                self.clean -= 1;
            }
            self.slots[i].page = Some(page);
            self.slots[i].dirty = dirty;
            if !dirty {
                self.push_front(i);
                self.clean += 1;
            }
            return;
        }

        let slot = Slot {
            pgid,
            page: Some(page),
            dirty,
            prev: NIL,
            next: NIL,
        };
        let i = if let Some(i) = self.free_slots.pop() {
            self.slots[i] = slot;
            i
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        };
        self.index.insert(pgid, i);
        if !dirty {
            self.push_front(i);
            self.clean += 1;
        }
    }

    fn evict(&mut self) {
        while self.clean > self.capacity && self.tail != NIL {
            let i = self.tail;
            let pgid = self.slots[i].pgid;
            log::trace!("evict page {pgid:?}");
            self.unlink(i);
            self.clean -= 1;
            self.index.remove(&pgid);
            self.slots[i].page = None;
            self.free_slots.push(i);
        }
    }

    fn push_front(&mut self, i: usize) {
        self.slots[i].prev = NIL;
        self.slots[i].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = i;
        }
        self.head = i;
        if self.tail == NIL {
            self.tail = i;
        }
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.slots[i].prev, self.slots[i].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.slots[i].prev = NIL;
        self.slots[i].next = NIL;
    }
}
