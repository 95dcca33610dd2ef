use crate::error::Error;
use crate::history::{Collector, Horizon};
use crate::id::PageId;
use crate::overflow;
use crate::page::{
    empty_node_capacity, HistoryNode, Node, NodeKind, NodePage, NodeValue, Page, HISTORY_NODE_SIZE,
};
use crate::pager::Pager;
use anyhow::anyhow;
use indexmap::IndexSet;
use std::cmp::Ordering;
use std::sync::Arc;

pub type Comparator = fn(&[u8], &[u8]) -> Ordering;

// a corrupted file could make a branch point back at one of its ancestors
const MAX_DEPTH: usize = 64;

#[derive(Clone, Copy)]
pub(crate) struct TreeConfig {
    pub(crate) page_size: usize,
    pub(crate) overflow_threshold: usize,
    pub(crate) fill_threshold: u32,
    pub(crate) compare: Comparator,
}

/// Bookkeeping of the active write transaction.
pub(crate) struct WriteState {
    pub(crate) root: Option<PageId>,
    pub(crate) horizon: Horizon,
    /// Pages written by this transaction, in the order they were created.
    pub(crate) dirty: IndexSet<PageId>,
    /// Every page number handed out to this transaction. They all go back to
    /// the pool on abort.
    pub(crate) allocated: Vec<PageId>,
    /// Pages both allocated and released by this transaction.
    pub(crate) free: Vec<PageId>,
    /// History nodes that did not fit into their page.
    pub(crate) residue: Vec<HistoryNode>,
}

impl WriteState {
    pub(crate) fn new(root: Option<PageId>, horizon: Horizon) -> Self {
        Self {
            root,
            horizon,
            dirty: IndexSet::new(),
            allocated: Vec::new(),
            free: Vec::new(),
            residue: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LookupHop {
    pub(crate) pgid: PageId,
    /// Child index in a branch, node position in a leaf.
    pub(crate) index: usize,
    pub(crate) found: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Seek<'k> {
    Key(&'k [u8]),
    First,
    Last,
}

pub(crate) fn node_of(page: &Page) -> anyhow::Result<&NodePage> {
    page.as_node()
        .ok_or_else(|| Error::corrupted(page.number().get(), "expected a branch or leaf page").into())
}

pub(crate) fn child_of(page: &NodePage, index: usize) -> anyhow::Result<PageId> {
    page.nodes
        .get(index)
        .and_then(|node| node.value.child())
        .ok_or_else(|| {
            Error::corrupted(page.number.get(), format!("branch has no child at {index}")).into()
        })
}

/// The first entry of a branch is treated as minus infinity, so this is the
/// last child whose separator is not greater than `key`.
pub(crate) fn child_index(page: &NodePage, key: &[u8], compare: Comparator) -> usize {
    page.nodes
        .get(1..)
        .map_or(0, |rest| rest.partition_point(|n| compare(&n.key, key).is_le()))
}

pub(crate) fn search_leaf(page: &NodePage, key: &[u8], compare: Comparator) -> (usize, bool) {
    match page.nodes.binary_search_by(|n| compare(&n.key, key)) {
        Ok(i) => (i, true),
        Err(i) => (i, false),
    }
}

/// Read-only descent from `root`. The last hop is the leaf; for a key seek
/// its index is where the key is or would be inserted.
pub(crate) fn descend(
    pager: &mut Pager,
    config: &TreeConfig,
    root: PageId,
    seek: Seek,
) -> anyhow::Result<(Vec<LookupHop>, Arc<Page>)> {
    let mut path = Vec::new();
    let mut pgid = root;
    loop {
        if path.len() >= MAX_DEPTH {
            return Err(Error::corrupted(pgid.get(), "tree is too deep").into());
        }
        let page = pager.read_node(pgid)?;
        let node = node_of(&page)?;
        if node.is_leaf() {
            let (index, found) = match seek {
                Seek::Key(key) => search_leaf(node, key, config.compare),
                Seek::First => (0, !node.nodes.is_empty()),
                Seek::Last => (node.nodes.len().saturating_sub(1), !node.nodes.is_empty()),
            };
            path.push(LookupHop {
                pgid,
                index,
                found,
            });
            return Ok((path, page));
        }

        let index = match seek {
            Seek::Key(key) => child_index(node, key, config.compare),
            Seek::First => 0,
            Seek::Last => node.nodes.len().saturating_sub(1),
        };
        let child = child_of(node, index)?;
        path.push(LookupHop {
            pgid,
            index,
            found: false,
        });
        pgid = child;
    }
}

pub(crate) fn read_value(pager: &mut Pager, value: &NodeValue) -> anyhow::Result<Vec<u8>> {
    match value {
        NodeValue::Inline(data) => Ok(data.clone()),
        NodeValue::Overflow(first) => overflow::read(pager, *first),
        NodeValue::Child(pgid) => Err(anyhow!("page {pgid:?} is not a value")),
    }
}

pub(crate) fn get(
    pager: &mut Pager,
    config: &TreeConfig,
    root: Option<PageId>,
    key: &[u8],
) -> anyhow::Result<Option<Vec<u8>>> {
    let Some(root) = root else {
        return Ok(None);
    };
    let (path, leaf) = descend(pager, config, root, Seek::Key(key))?;
    let Some(hop) = path.last() else {
        return Ok(None);
    };
    if !hop.found {
        return Ok(None);
    }
    let node = node_of(&leaf)?;
    let Some(entry) = node.nodes.get(hop.index) else {
        return Ok(None);
    };
    read_value(pager, &entry.value).map(Some)
}

/// Copy-on-write mutation of the tree owned by a write transaction.
pub(crate) struct BTree<'a> {
    pager: &'a mut Pager,
    collector: &'a mut Collector,
    tx: &'a mut WriteState,
    config: &'a TreeConfig,
}

impl<'a> BTree<'a> {
    pub(crate) fn new(
        pager: &'a mut Pager,
        collector: &'a mut Collector,
        tx: &'a mut WriteState,
        config: &'a TreeConfig,
    ) -> BTree<'a> {
        BTree {
            pager,
            collector,
            tx,
            config,
        }
    }

    pub(crate) fn get(&mut self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        get(self.pager, self.config, self.tx.root, key)
    }

    pub(crate) fn put(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let value = self.store_value(value)?;
        let node = Node {
            key: key.to_vec(),
            value,
        };

        if self.tx.root.is_none() {
            let mut leaf = self.new_node(NodeKind::Leaf)?;
            leaf.nodes.push(node);
            log::debug!("new root leaf {:?}", leaf.number);
            self.tx.root = Some(leaf.number);
            self.pager.put_node(leaf);
            return Ok(());
        }

        let path = self.lookup_for_update(key)?;
        let Some(&hop) = path.last() else {
            return Err(anyhow!("lookup returned an empty path"));
        };
        let mut leaf = self.load(hop.pgid)?;
        if hop.found {
            let old = leaf.nodes.remove(hop.index);
            self.release_value(&mut leaf, old.value)?;
        }
        self.insert_node(&path, path.len() - 1, leaf, hop.index, node)
    }

    pub(crate) fn del(&mut self, key: &[u8]) -> anyhow::Result<bool> {
        let Some(root) = self.tx.root else {
            return Ok(false);
        };
        // nothing gets copied when the key is not there
        let (path, _) = descend(self.pager, self.config, root, Seek::Key(key))?;
        if !path.last().map_or(false, |hop| hop.found) {
            return Ok(false);
        }

        let path = self.lookup_for_update(key)?;
        let Some(&hop) = path.last() else {
            return Err(anyhow!("lookup returned an empty path"));
        };
        if !hop.found {
            return Err(Error::Integrity(format!("key vanished from page {:?}", hop.pgid)).into());
        }
        let mut leaf = self.load(hop.pgid)?;
        let node = leaf.nodes.remove(hop.index);
        self.release_value(&mut leaf, node.value)?;
        self.pager.put_node(leaf);
        self.rebalance(&path, path.len() - 1)?;
        Ok(true)
    }

    /// Descends to the leaf of `key`, touching every page on the way so the
    /// whole path belongs to this transaction.
    fn lookup_for_update(&mut self, key: &[u8]) -> anyhow::Result<Vec<LookupHop>> {
        let Some(root) = self.tx.root else {
            return Err(anyhow!("cannot descend into an empty tree"));
        };
        let root = self.touch(root)?;
        self.tx.root = Some(root);

        let mut path = Vec::new();
        let mut pgid = root;
        loop {
            if path.len() >= MAX_DEPTH {
                return Err(Error::corrupted(pgid.get(), "tree is too deep").into());
            }
            let mut page = self.load(pgid)?;
            if page.is_leaf() {
                let (index, found) = search_leaf(&page, key, self.config.compare);
                path.push(LookupHop {
                    pgid,
                    index,
                    found,
                });
                return Ok(path);
            }

            let index = child_index(&page, key, self.config.compare);
            let child = child_of(&page, index)?;
            let touched = self.touch(child)?;
            if touched != child {
                page.nodes[index].value = NodeValue::Child(touched);
                self.pager.put_node(page);
            }
            path.push(LookupHop {
                pgid,
                index,
                found: false,
            });
            pgid = touched;
        }
    }

    fn insert_node(
        &mut self,
        path: &[LookupHop],
        depth: usize,
        mut page: NodePage,
        index: usize,
        node: Node,
    ) -> anyhow::Result<()> {
        let needed = node.space_needed();
        page.make_room(needed, &mut self.tx.residue);
        let fits = page.space_left() >= needed;
        page.nodes.insert(index, node);
        if fits {
            self.pager.put_node(page);
            return Ok(());
        }
        self.split(path, depth, page)
    }

    /// Divides an overfull page in two and pushes the separator into the
    /// parent, growing the tree when the page is the root.
    fn split(&mut self, path: &[LookupHop], depth: usize, mut left: NodePage) -> anyhow::Result<()> {
        if left.nodes.len() < 2 {
            return Err(Error::Integrity(format!(
                "page {:?} overflows with a single node",
                left.number
            ))
            .into());
        }
        let capacity = empty_node_capacity(self.config.page_size) - HISTORY_NODE_SIZE;
        let at = split_point(&left.nodes, capacity);

        let mut right = self.new_node(left.kind)?;
        right.nodes = left.nodes.split_off(at);
        left.make_room(HISTORY_NODE_SIZE, &mut self.tx.residue);
        if left.used() > left.capacity() || right.used() > right.capacity() {
            return Err(Error::Integrity(format!(
                "cannot split page {:?}: left={} right={}",
                left.number,
                left.used(),
                right.used()
            ))
            .into());
        }

        // a branch keeps its separator as the key of its first entry
        let separator = right.nodes[0].key.clone();
        let (left_pgid, right_pgid) = (left.number, right.number);
        log::debug!(
            "split page {left_pgid:?} at {at}, {} nodes move to {right_pgid:?}",
            right.nodes.len()
        );
        self.pager.put_node(left);
        self.pager.put_node(right);

        let separator = Node {
            key: separator,
            value: NodeValue::Child(right_pgid),
        };
        if depth == 0 {
            let mut root = self.new_node(NodeKind::Branch)?;
            root.nodes.push(Node {
                key: Vec::new(),
                value: NodeValue::Child(left_pgid),
            });
            root.nodes.push(separator);
            log::debug!("tree grows, new root {:?}", root.number);
            self.tx.root = Some(root.number);
            self.pager.put_node(root);
            return Ok(());
        }

        let parent_hop = path[depth - 1];
        let parent = self.load(parent_hop.pgid)?;
        self.insert_node(path, depth - 1, parent, parent_hop.index + 1, separator)
    }

    fn rebalance(&mut self, path: &[LookupHop], depth: usize) -> anyhow::Result<()> {
        let page = self.load(path[depth].pgid)?;
        if depth == 0 {
            return self.shrink_root(page);
        }
        if page.full_enough(self.config.fill_threshold) {
            return Ok(());
        }

        let parent_hop = path[depth - 1];
        let parent = self.load(parent_hop.pgid)?;
        if parent.nodes.len() < 2 {
            return Ok(());
        }
        let ci = parent_hop.index;
        let si = if ci == 0 { 1 } else { ci - 1 };
        let sibling = self.load(child_of(&parent, si)?)?;
        let from_right = si > ci;

        if self.can_donate(&sibling, from_right, 3) {
            return self.transfer(parent, page, ci, si, 3);
        }
        if page.used() + sibling.used() + HISTORY_NODE_SIZE <= empty_node_capacity(self.config.page_size)
        {
            self.merge(parent, page, sibling, ci, si)?;
            return self.rebalance(path, depth - 1);
        }
        self.transfer(parent, page, ci, si, 2)
    }

    fn shrink_root(&mut self, mut page: NodePage) -> anyhow::Result<()> {
        if page.nodes.is_empty() {
            log::debug!("tree is empty, release root {:?}", page.number);
            if let Some(hn) = self.release(page.number, Some(page.sync_id)) {
                self.tx.residue.push(hn);
            }
            self.tx.residue.append(&mut page.history);
            self.tx.root = None;
            return Ok(());
        }

        while !page.is_leaf() && page.nodes.len() == 1 {
            let child = child_of(&page, 0)?;
            log::debug!("tree shrinks, root {:?} -> {child:?}", page.number);
            if let Some(hn) = self.release(page.number, Some(page.sync_id)) {
                self.tx.residue.push(hn);
            }
            self.tx.residue.append(&mut page.history);
            self.tx.root = Some(child);
            page = self.load(child)?;
        }
        Ok(())
    }

    /// Whether `donor` can give away its boundary node and stay above the
    /// fill threshold.
    fn can_donate(&self, donor: &NodePage, from_right: bool, min_entries: usize) -> bool {
        if donor.nodes.len() < min_entries {
            return false;
        }
        let boundary = if from_right {
            donor.nodes.first()
        } else {
            donor.nodes.last()
        };
        let Some(boundary) = boundary else {
            return false;
        };
        let remaining = donor.used() - boundary.size();
        remaining * 100 > self.config.fill_threshold as usize * donor.capacity()
    }

    /// Moves boundary nodes from the sibling at `si` into `page` at `ci` until
    /// the page is full enough or the sibling cannot give any more.
    fn transfer(
        &mut self,
        mut parent: NodePage,
        mut page: NodePage,
        ci: usize,
        si: usize,
        min_entries: usize,
    ) -> anyhow::Result<()> {
        let from_right = si > ci;
        let sibling_pgid = self.touch_child(&mut parent, si)?;
        let mut sibling = self.load(sibling_pgid)?;
        let threshold = self.config.fill_threshold;

        let mut moved = 0;
        while !page.full_enough(threshold) && self.can_donate(&sibling, from_right, min_entries) {
            let (mut node, separator, separator_index) = if from_right {
                let node = sibling.nodes[0].clone();
                (node, sibling.nodes[1].key.clone(), si)
            } else {
                let node = sibling.nodes[sibling.nodes.len() - 1].clone();
                let separator = node.key.clone();
                (node, separator, ci)
            };
            if !page.is_leaf() {
                if from_right {
                    node.key = parent.nodes[si].key.clone();
                } else if let Some(first) = page.nodes.first_mut() {
                    first.key = parent.nodes[ci].key.clone();
                }
            }

            let needed = node.space_needed();
            page.make_room(needed, &mut self.tx.residue);
            if page.space_left() < needed {
                break;
            }
            if !self.fit_separator(&mut parent, separator_index, &separator) {
                break;
            }

            if from_right {
                sibling.nodes.remove(0);
                page.nodes.push(node);
            } else {
                sibling.nodes.pop();
                page.nodes.insert(0, node);
            }
            parent.nodes[separator_index].key = separator;
            moved += 1;
        }

        log::debug!(
            "transfer {moved} nodes from {:?} to {:?}",
            sibling.number,
            page.number
        );
        self.pager.put_node(sibling);
        self.pager.put_node(page);
        self.pager.put_node(parent);
        Ok(())
    }

    /// Makes room in `parent` for a separator that may be longer than the
    /// one it replaces.
    fn fit_separator(&mut self, parent: &mut NodePage, index: usize, separator: &[u8]) -> bool {
        let old = parent.nodes[index].key.len();
        if separator.len() <= old {
            return true;
        }
        let grow = separator.len() - old;
        parent.make_room(grow, &mut self.tx.residue);
        parent.space_left() >= grow
    }

    /// Merges the right one of the two neighbours into the left one and
    /// drops the right one from the parent.
    fn merge(
        &mut self,
        mut parent: NodePage,
        page: NodePage,
        sibling: NodePage,
        ci: usize,
        si: usize,
    ) -> anyhow::Result<()> {
        let right_index = ci.max(si);
        let (mut dst, mut src) = if si > ci {
            (page, sibling)
        } else {
            let dst_pgid = self.touch_child(&mut parent, si)?;
            (self.load(dst_pgid)?, page)
        };

        if !src.is_leaf() {
            if let Some(first) = src.nodes.first_mut() {
                first.key = parent.nodes[right_index].key.clone();
            }
        }
        dst.make_room(src.used() + HISTORY_NODE_SIZE, &mut self.tx.residue);
        if dst.space_left() < src.used() {
            return Err(Error::Integrity(format!(
                "page {:?} cannot take the nodes of {:?}",
                dst.number, src.number
            ))
            .into());
        }

        log::debug!("merge page {:?} into {:?}", src.number, dst.number);
        dst.nodes.append(&mut src.nodes);
        for hn in src.history.drain(..) {
            dst.push_history(hn, &mut self.tx.residue);
        }
        if let Some(hn) = self.release(src.number, Some(src.sync_id)) {
            dst.push_history(hn, &mut self.tx.residue);
        }
        parent.nodes.remove(right_index);

        self.pager.put_node(dst);
        self.pager.put_node(parent);
        Ok(())
    }

    /// Returns the transaction's own copy of `pgid`, copying the page first
    /// when it is still the committed version. The caller updates the parent.
    fn touch(&mut self, pgid: PageId) -> anyhow::Result<PageId> {
        if self.pager.is_dirty(pgid) {
            return Ok(pgid);
        }
        let mut page = self.load(pgid)?;
        let born = page.sync_id;
        let number = self.allocate()?;
        page.number = number;
        page.sync_id = self.tx.horizon.last_synced_id + 1;
        page.commit_id = self.tx.horizon.revision;
        let hn = self.tx.horizon.supersede(pgid, Some(born));
        page.push_history(hn, &mut self.tx.residue);
        log::debug!("touch page {pgid:?} -> {number:?}");

        self.tx.dirty.insert(number);
        self.pager.put_node(page);
        Ok(number)
    }

    fn touch_child(&mut self, parent: &mut NodePage, index: usize) -> anyhow::Result<PageId> {
        let child = child_of(parent, index)?;
        let touched = self.touch(child)?;
        parent.nodes[index].value = NodeValue::Child(touched);
        Ok(touched)
    }

    fn load(&mut self, pgid: PageId) -> anyhow::Result<NodePage> {
        let page = self.pager.read_node(pgid)?;
        Ok(node_of(&page)?.clone())
    }

    fn allocate(&mut self) -> anyhow::Result<PageId> {
        if let Some(pgid) = self.tx.free.pop() {
            return Ok(pgid);
        }
        let pgid = match self.collector.take() {
            Some(pgid) => pgid,
            None => self.pager.next_page()?,
        };
        self.tx.allocated.push(pgid);
        Ok(pgid)
    }

    fn new_node(&mut self, kind: NodeKind) -> anyhow::Result<NodePage> {
        let pgid = self.allocate()?;
        let mut page = NodePage::new(pgid, kind, self.config.page_size);
        page.sync_id = self.tx.horizon.last_synced_id + 1;
        page.commit_id = self.tx.horizon.revision;
        self.tx.dirty.insert(pgid);
        Ok(page)
    }

    /// Gives up a page the new tree no longer references. Pages written by
    /// this transaction are reused right away; committed ones are returned as
    /// history for the caller to keep.
    fn release(&mut self, pgid: PageId, born: Option<u32>) -> Option<HistoryNode> {
        if self.pager.is_dirty(pgid) {
            self.pager.forget(pgid);
            self.tx.dirty.shift_remove(&pgid);
            self.tx.free.push(pgid);
            None
        } else {
            Some(self.tx.horizon.supersede(pgid, born))
        }
    }

    fn store_value(&mut self, value: &[u8]) -> anyhow::Result<NodeValue> {
        if value.len() <= self.config.overflow_threshold {
            return Ok(NodeValue::Inline(value.to_vec()));
        }
        let count = overflow::pages_needed(value.len(), self.config.page_size);
        let pages = (0..count)
            .map(|_| self.allocate())
            .collect::<anyhow::Result<Vec<_>>>()?;
        for page in overflow::build(&pages, value, self.config.page_size) {
            self.tx.dirty.insert(page.number);
            self.pager.put_overflow(page);
        }
        log::debug!("store {} bytes on {count} overflow pages", value.len());
        Ok(NodeValue::Overflow(pages[0]))
    }

    fn release_value(&mut self, leaf: &mut NodePage, value: NodeValue) -> anyhow::Result<()> {
        let NodeValue::Overflow(first) = value else {
            return Ok(());
        };
        for pgid in overflow::pages(self.pager, first)? {
            if let Some(hn) = self.release(pgid, None) {
                leaf.push_history(hn, &mut self.tx.residue);
            }
        }
        Ok(())
    }
}

/// First index past which the cumulative node size exceeds half of
/// `capacity`, moved one further when the right half would not fit.
fn split_point(nodes: &[Node], capacity: usize) -> usize {
    let total: usize = nodes.iter().map(Node::size).sum();
    let half = capacity / 2;
    let mut at = nodes.len() - 1;
    let mut acc = 0;
    for (i, node) in nodes.iter().enumerate() {
        acc += node.size();
        if acc > half {
            at = i;
            break;
        }
    }
    let mut at = at.clamp(1, nodes.len() - 1);
    let left: usize = nodes[..at].iter().map(Node::size).sum();
    if total - left > capacity && at + 1 < nodes.len() {
        at += 1;
    }
    at
}
