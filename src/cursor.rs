use crate::btree::{self, child_of, node_of, LookupHop, Seek};
use crate::db::{StoreInner, Transaction};
use crate::id::PageId;

/// Where `Cursor::seek_range` lands when the key itself is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePolicy {
    EqualOrGreater,
    EqualOrLess,
}

/// Ordered iteration over the entries a transaction sees.
///
/// The cursor remembers the descent path to its entry and moves to the
/// neighbouring leaves through it. Any change to the tree made after the
/// path was taken (by this transaction or a commit) makes the cursor descend
/// again using the last key it returned, since the pages on the old path
/// may have been copied or reused.
pub struct Cursor<'t, 's> {
    tx: &'t Transaction<'s>,
    path: Vec<LookupHop>,
    current: Option<(Vec<u8>, Vec<u8>)>,
    epoch: u64,
}

type Entry = (Vec<u8>, Vec<u8>);

impl<'t, 's> Cursor<'t, 's> {
    pub(crate) fn new(tx: &'t Transaction<'s>) -> Self {
        Self {
            tx,
            path: Vec::new(),
            current: None,
            epoch: 0,
        }
    }

    /// The entry the cursor is at, as of the moment it got there.
    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        self.current
            .as_ref()
            .map(|(key, value)| (key.as_slice(), value.as_slice()))
    }

    pub fn first(&mut self) -> anyhow::Result<bool> {
        let mut inner = self.tx.lock();
        let result = self.edge(&mut inner, Seek::First);
        inner.track(result)
    }

    pub fn last(&mut self) -> anyhow::Result<bool> {
        let mut inner = self.tx.lock();
        let result = self.edge(&mut inner, Seek::Last);
        inner.track(result)
    }

    /// Moves to the next entry. Returns false at the end, leaving the cursor
    /// where it was. An unpositioned cursor starts at the first entry.
    pub fn next(&mut self) -> anyhow::Result<bool> {
        let mut inner = self.tx.lock();
        let result = self.step(&mut inner, true);
        inner.track(result)
    }

    pub fn previous(&mut self) -> anyhow::Result<bool> {
        let mut inner = self.tx.lock();
        let result = self.step(&mut inner, false);
        inner.track(result)
    }

    /// Positions at exactly `key`.
    pub fn seek(&mut self, key: &[u8]) -> anyhow::Result<bool> {
        let mut inner = self.tx.lock();
        let result = self.seek_key(&mut inner, key, None);
        inner.track(result)
    }

    pub fn seek_range(&mut self, key: &[u8], policy: RangePolicy) -> anyhow::Result<bool> {
        let mut inner = self.tx.lock();
        let result = self.seek_key(&mut inner, key, Some(policy));
        inner.track(result)
    }

    fn edge(&mut self, inner: &mut StoreInner, seek: Seek) -> anyhow::Result<bool> {
        let Some(root) = inner.root_of(self.tx)? else {
            self.path.clear();
            self.current = None;
            return Ok(false);
        };
        let (path, _) = btree::descend(&mut inner.pager, &inner.config, root, seek)?;
        self.settle(inner, path)
    }

    fn seek_key(
        &mut self,
        inner: &mut StoreInner,
        key: &[u8],
        policy: Option<RangePolicy>,
    ) -> anyhow::Result<bool> {
        let Some(root) = inner.root_of(self.tx)? else {
            return Ok(false);
        };
        let (mut path, _) = btree::descend(&mut inner.pager, &inner.config, root, Seek::Key(key))?;
        let found = path.last().map_or(false, |hop| hop.found);
        let positioned = match (found, policy) {
            (true, _) => true,
            (false, None) => false,
            (false, Some(RangePolicy::EqualOrGreater)) => advance(inner, &mut path)?,
            (false, Some(RangePolicy::EqualOrLess)) => retreat(inner, &mut path)?,
        };
        if !positioned {
            return Ok(false);
        }
        self.settle(inner, path)
    }

    fn step(&mut self, inner: &mut StoreInner, forward: bool) -> anyhow::Result<bool> {
        let Some(mut path) = self.current_path(inner)? else {
            let seek = if forward { Seek::First } else { Seek::Last };
            return self.edge(inner, seek);
        };
        let moved = if forward {
            advance(inner, &mut path)?
        } else {
            retreat(inner, &mut path)?
        };
        if !moved {
            return Ok(false);
        }
        self.settle(inner, path)
    }

    /// Path to the current entry, or where it would be if it was deleted
    /// since. `None` when the cursor is not positioned.
    fn current_path(&self, inner: &mut StoreInner) -> anyhow::Result<Option<Vec<LookupHop>>> {
        let Some((key, _)) = &self.current else {
            return Ok(None);
        };
        if self.epoch == inner.epoch {
            return Ok(Some(self.path.clone()));
        }
        let Some(root) = inner.root_of(self.tx)? else {
            return Ok(Some(Vec::new()));
        };
        log::trace!("tree changed under the cursor, descend again");
        let (path, _) = btree::descend(&mut inner.pager, &inner.config, root, Seek::Key(key))?;
        Ok(Some(path))
    }

    fn settle(&mut self, inner: &mut StoreInner, path: Vec<LookupHop>) -> anyhow::Result<bool> {
        let Some(entry) = entry_at(inner, &path)? else {
            return Ok(false);
        };
        self.path = path;
        self.current = Some(entry);
        self.epoch = inner.epoch;
        Ok(true)
    }
}

fn entry_at(inner: &mut StoreInner, path: &[LookupHop]) -> anyhow::Result<Option<Entry>> {
    let Some(hop) = path.last() else {
        return Ok(None);
    };
    let page = inner.pager.read_node(hop.pgid)?;
    let node = node_of(&page)?;
    let Some(entry) = node.nodes.get(hop.index) else {
        return Ok(None);
    };
    let value = btree::read_value(&mut inner.pager, &entry.value)?;
    Ok(Some((entry.key.clone(), value)))
}

fn leaf_len(inner: &mut StoreInner, pgid: PageId) -> anyhow::Result<usize> {
    let page = inner.pager.read_node(pgid)?;
    Ok(node_of(&page)?.nodes.len())
}

/// Moves the path to the following entry. A leaf hop that is not `found`
/// points at the insertion position, which already is the following entry.
fn advance(inner: &mut StoreInner, path: &mut Vec<LookupHop>) -> anyhow::Result<bool> {
    let Some(leaf) = path.last().copied() else {
        return Ok(false);
    };
    let target = if leaf.found { leaf.index + 1 } else { leaf.index };
    if target < leaf_len(inner, leaf.pgid)? {
        let last = path.len() - 1;
        path[last].index = target;
        path[last].found = true;
        return Ok(true);
    }

    // right sibling: leftmost leaf under the nearest ancestor's next child
    for level in (0..path.len() - 1).rev() {
        let hop = path[level];
        let page = inner.pager.read_node(hop.pgid)?;
        let node = node_of(&page)?;
        if hop.index + 1 < node.nodes.len() {
            let child = child_of(node, hop.index + 1)?;
            let (rest, _) = btree::descend(&mut inner.pager, &inner.config, child, Seek::First)?;
            path.truncate(level + 1);
            path[level].index += 1;
            path.extend(rest);
            return Ok(true);
        }
    }
    Ok(false)
}

fn retreat(inner: &mut StoreInner, path: &mut Vec<LookupHop>) -> anyhow::Result<bool> {
    let Some(leaf) = path.last_mut() else {
        return Ok(false);
    };
    if leaf.index > 0 {
        leaf.index -= 1;
        leaf.found = true;
        return Ok(true);
    }

    for level in (0..path.len() - 1).rev() {
        let hop = path[level];
        if hop.index == 0 {
            continue;
        }
        let page = inner.pager.read_node(hop.pgid)?;
        let child = child_of(node_of(&page)?, hop.index - 1)?;
        let (rest, _) = btree::descend(&mut inner.pager, &inner.config, child, Seek::Last)?;
        path.truncate(level + 1);
        path[level].index -= 1;
        path.extend(rest);
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Setting, Store};

    fn key(i: u32) -> Vec<u8> {
        format!("key{i:05}").into_bytes()
    }

    fn filled_store(dir: &tempfile::TempDir, count: u32) -> Store {
        let store = Store::open(&dir.path().join("store"), Setting::default()).unwrap();
        let tx = store.begin_write().unwrap();
        for i in 0..count {
            tx.put(&key(i), format!("value{i:0100}").as_bytes()).unwrap();
        }
        tx.commit(1).unwrap();
        store
    }

    #[test]
    fn test_walk_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let store = filled_store(&dir, 1000);
        let tx = store.begin_read().unwrap();
        let mut cursor = tx.cursor();

        let mut keys = Vec::new();
        while cursor.next().unwrap() {
            keys.push(cursor.current().unwrap().0.to_vec());
        }
        assert_eq!((0..1000).map(key).collect::<Vec<_>>(), keys);
        // stays on the last entry
        assert_eq!(Some(&key(999)[..]), cursor.current().map(|(k, _)| k));

        let mut cursor = tx.cursor();
        let mut keys = Vec::new();
        while cursor.previous().unwrap() {
            keys.push(cursor.current().unwrap().0.to_vec());
        }
        assert_eq!((0..1000).rev().map(key).collect::<Vec<_>>(), keys);
    }

    #[test]
    fn test_seek() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("store"), Setting::default()).unwrap();
        let tx = store.begin_write().unwrap();
        for i in (0..600).step_by(2) {
            tx.put(&key(i), b"v").unwrap();
        }

        let mut cursor = tx.cursor();
        assert!(cursor.seek(&key(100)).unwrap());
        assert!(!cursor.seek(&key(101)).unwrap());
        assert_eq!(Some(&key(100)[..]), cursor.current().map(|(k, _)| k));

        assert!(cursor.seek_range(&key(101), RangePolicy::EqualOrGreater).unwrap());
        assert_eq!(Some(&key(102)[..]), cursor.current().map(|(k, _)| k));
        assert!(cursor.seek_range(&key(101), RangePolicy::EqualOrLess).unwrap());
        assert_eq!(Some(&key(100)[..]), cursor.current().map(|(k, _)| k));

        assert!(!cursor.seek_range(&key(599), RangePolicy::EqualOrGreater).unwrap());
        assert!(cursor.seek_range(&key(599), RangePolicy::EqualOrLess).unwrap());
        assert_eq!(Some(&key(598)[..]), cursor.current().map(|(k, _)| k));
        assert!(!cursor.seek_range(b"a", RangePolicy::EqualOrLess).unwrap());
        assert!(cursor.seek_range(b"a", RangePolicy::EqualOrGreater).unwrap());
        assert_eq!(Some(&key(0)[..]), cursor.current().map(|(k, _)| k));
    }

    #[test]
    fn test_cursor_survives_tree_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = filled_store(&dir, 500);
        let tx = store.begin_write().unwrap();
        let mut cursor = tx.cursor();

        assert!(cursor.first().unwrap());
        for _ in 0..99 {
            assert!(cursor.next().unwrap());
        }
        assert_eq!(Some(&key(99)[..]), cursor.current().map(|(k, _)| k));

        // merges pages around the cursor
        for i in 100..300 {
            assert!(tx.del(&key(i)).unwrap());
        }
        assert!(cursor.next().unwrap());
        assert_eq!(Some(&key(300)[..]), cursor.current().map(|(k, _)| k));

        // the current key itself goes away
        assert!(tx.del(&key(300)).unwrap());
        assert!(cursor.next().unwrap());
        assert_eq!(Some(&key(301)[..]), cursor.current().map(|(k, _)| k));

        // splits pages around the cursor
        for i in 0..200 {
            tx.put(format!("key00300-{i:03}").as_bytes(), &[1u8; 200]).unwrap();
        }
        assert!(cursor.previous().unwrap());
        assert_eq!(Some(&b"key00300-199"[..]), cursor.current().map(|(k, _)| k));
        assert!(cursor.previous().unwrap());
        assert_eq!(Some(&b"key00300-198"[..]), cursor.current().map(|(k, _)| k));
    }
}
