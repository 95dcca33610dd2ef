use crate::btree::{node_of, TreeConfig};
use crate::error::Error;
use crate::id::PageId;
use crate::overflow;
use crate::page::NodeValue;
use crate::pager::Pager;
use std::collections::BTreeSet;

/// What a full walk of one tree found.
#[derive(Debug, Default)]
pub(crate) struct TreeReport {
    /// Every page the tree references, overflow pages included.
    pub(crate) pages: BTreeSet<PageId>,
    /// Superseded pages still listed in the history of live pages.
    pub(crate) history: BTreeSet<PageId>,
    pub(crate) entries: u64,
    pub(crate) depth: u32,
    pub(crate) branch_pages: u64,
    pub(crate) leaf_pages: u64,
    pub(crate) overflow_pages: u64,
    /// Non-root pages at or below the fill threshold.
    pub(crate) underfull: Vec<PageId>,
}

/// Walks the whole tree under `root`, decoding every page (which verifies
/// its checksum) and checking the structure: key order, separator bounds,
/// child pointers, uniform leaf depth and overflow chains.
pub(crate) fn check_tree(
    pager: &mut Pager,
    config: &TreeConfig,
    root: Option<PageId>,
) -> anyhow::Result<TreeReport> {
    let mut walker = Walker {
        pager,
        config,
        report: TreeReport::default(),
    };
    if let Some(root) = root {
        walker.visit(root, 1, None, None)?;
    }

    let report = walker.report;
    if let Some(pgid) = report.history.intersection(&report.pages).next() {
        return Err(integrity(format!(
            "page {pgid:?} is both live and listed as superseded"
        )));
    }
    Ok(report)
}

fn integrity(msg: String) -> anyhow::Error {
    Error::Integrity(msg).into()
}

struct Walker<'a> {
    pager: &'a mut Pager,
    config: &'a TreeConfig,
    report: TreeReport,
}

impl Walker<'_> {
    fn claim(&mut self, pgid: PageId) -> anyhow::Result<()> {
        if pgid.is_reserved() || pgid.get() >= self.pager.page_count() {
            return Err(integrity(format!("page {pgid:?} is out of range")));
        }
        if !self.report.pages.insert(pgid) {
            return Err(integrity(format!("page {pgid:?} is referenced twice")));
        }
        Ok(())
    }

    fn visit(
        &mut self,
        pgid: PageId,
        depth: u32,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> anyhow::Result<()> {
        self.claim(pgid)?;
        let page = self.pager.read_node(pgid)?;
        let node = node_of(&page)?;
        let compare = self.config.compare;
        let is_root = depth == 1;

        if node.used() > node.capacity() {
            return Err(integrity(format!(
                "page {pgid:?} uses {} bytes of {}",
                node.used(),
                node.capacity()
            )));
        }
        if node.nodes.is_empty() {
            return Err(integrity(format!("page {pgid:?} is empty")));
        }
        if !is_root && !node.full_enough(self.config.fill_threshold) {
            self.report.underfull.push(pgid);
        }
        self.report.history.extend(node.history.iter().map(|hn| hn.page));

        // the first separator of a branch is only a lower bound
        let keyed = if node.is_leaf() {
            &node.nodes[..]
        } else {
            let expected = lower.unwrap_or_default();
            if node.nodes[0].key != expected {
                return Err(integrity(format!(
                    "first key of branch {pgid:?} does not match its separator"
                )));
            }
            &node.nodes[1..]
        };
        for pair in keyed.windows(2) {
            if compare(&pair[0].key, &pair[1].key).is_ge() {
                return Err(integrity(format!("keys of page {pgid:?} are not sorted")));
            }
        }
        if let (Some(first), Some(lower)) = (keyed.first(), lower) {
            if compare(&first.key, lower).is_lt() {
                return Err(integrity(format!("page {pgid:?} has a key below its separator")));
            }
        }
        if let (Some(last), Some(upper)) = (keyed.last(), upper) {
            if compare(&last.key, upper).is_ge() {
                return Err(integrity(format!(
                    "page {pgid:?} has a key above the next separator"
                )));
            }
        }

        if node.is_leaf() {
            self.report.leaf_pages += 1;
            self.report.entries += node.nodes.len() as u64;
            if self.report.depth == 0 {
                self.report.depth = depth;
            } else if self.report.depth != depth {
                return Err(integrity(format!(
                    "leaf {pgid:?} is at depth {depth}, others at {}",
                    self.report.depth
                )));
            }
            for entry in &node.nodes {
                match &entry.value {
                    NodeValue::Inline(data) => {
                        if data.len() > self.config.overflow_threshold {
                            return Err(integrity(format!(
                                "page {pgid:?} holds {} bytes inline",
                                data.len()
                            )));
                        }
                    }
                    NodeValue::Overflow(first) => {
                        for pgid in overflow::pages(self.pager, *first)? {
                            self.claim(pgid)?;
                            self.report.overflow_pages += 1;
                        }
                    }
                    NodeValue::Child(_) => {
                        return Err(integrity(format!("leaf {pgid:?} points at a child page")));
                    }
                }
            }
            return Ok(());
        }

        self.report.branch_pages += 1;
        for (i, entry) in node.nodes.iter().enumerate() {
            let Some(child) = entry.value.child() else {
                return Err(integrity(format!("branch {pgid:?} holds a value")));
            };
            let child_lower = if i == 0 { lower } else { Some(&entry.key[..]) };
            let child_upper = match node.nodes.get(i + 1) {
                Some(next) => Some(&next.key[..]),
                None => upper,
            };
            self.visit(child, depth + 1, child_lower, child_upper)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{Node, NodeKind, NodePage};
    use std::fs::OpenOptions;

    fn pager() -> (tempfile::TempDir, Pager) {
        let dir = tempfile::tempdir().unwrap();
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("store"))
            .unwrap();
        (dir, Pager::new(f, 4096, 16).unwrap())
    }

    fn config() -> TreeConfig {
        TreeConfig {
            page_size: 4096,
            overflow_threshold: 1000,
            fill_threshold: 25,
            compare: |a, b| a.cmp(b),
        }
    }

    fn leaf(pager: &mut Pager, keys: &[&str]) -> PageId {
        let pgid = pager.next_page().unwrap();
        let mut page = NodePage::new(pgid, NodeKind::Leaf, 4096);
        for key in keys {
            page.nodes.push(Node {
                key: key.as_bytes().to_vec(),
                value: NodeValue::Inline(b"v".to_vec()),
            });
        }
        pager.put_node(page);
        pgid
    }

    fn branch(pager: &mut Pager, children: &[(&str, PageId)]) -> PageId {
        let pgid = pager.next_page().unwrap();
        let mut page = NodePage::new(pgid, NodeKind::Branch, 4096);
        for (key, child) in children {
            page.nodes.push(Node {
                key: key.as_bytes().to_vec(),
                value: NodeValue::Child(*child),
            });
        }
        pager.put_node(page);
        pgid
    }

    #[test]
    fn test_valid_tree() {
        let (_dir, mut pager) = pager();
        let left = leaf(&mut pager, &["a", "b"]);
        let right = leaf(&mut pager, &["m", "z"]);
        let root = branch(&mut pager, &[("", left), ("m", right)]);

        let report = check_tree(&mut pager, &config(), Some(root)).unwrap();
        assert_eq!(4, report.entries);
        assert_eq!(2, report.depth);
        assert_eq!(1, report.branch_pages);
        assert_eq!(2, report.leaf_pages);
        assert_eq!(3, report.pages.len());
        // tiny leaves are far below the threshold
        assert_eq!(vec![left, right], report.underfull);

        let report = check_tree(&mut pager, &config(), None).unwrap();
        assert_eq!(0, report.entries);
    }

    #[test]
    fn test_key_outside_separator() {
        let (_dir, mut pager) = pager();
        let left = leaf(&mut pager, &["a", "n"]);
        let right = leaf(&mut pager, &["m", "z"]);
        let root = branch(&mut pager, &[("", left), ("m", right)]);

        let err = check_tree(&mut pager, &config(), Some(root)).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Integrity(_))));
    }

    #[test]
    fn test_shared_child() {
        let (_dir, mut pager) = pager();
        let left = leaf(&mut pager, &["a"]);
        let root = branch(&mut pager, &[("", left), ("m", left)]);
        let err = check_tree(&mut pager, &config(), Some(root)).unwrap_err();
        assert!(err.to_string().contains("referenced twice"));
    }
}
