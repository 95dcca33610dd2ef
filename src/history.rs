use crate::id::PageId;
use crate::page::{HistoryNode, MarkerPayload};
use std::collections::BTreeSet;

/// Where the generations stand when deciding whether a superseded page can
/// be handed out again.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Horizon {
    pub(crate) last_synced_id: u32,
    /// Revision of the commit being made (or of the current marker).
    pub(crate) revision: u32,
    /// Oldest snapshot revision held by a live read transaction.
    pub(crate) oldest_reader: Option<u32>,
    pub(crate) depth: u32,
}

impl Horizon {
    /// A history node with `sync_id == 0` describes a page that was created
    /// and superseded between two syncs, so no marker on disk can reach it.
    /// Otherwise the last `depth` synced generations must have moved past it,
    /// which keeps the trees of both marker slots intact.
    pub(crate) fn reclaimable(&self, hn: &HistoryNode) -> bool {
        let durable_ok =
            hn.sync_id == 0 || hn.sync_id.saturating_add(self.depth) <= self.last_synced_id;
        let chain_ok = hn.commit_id.saturating_add(self.depth) <= self.revision;
        let readers_ok = self
            .oldest_reader
            .map_or(true, |oldest| hn.commit_id <= oldest);
        durable_ok && chain_ok && readers_ok
    }

    /// History node for a page superseded by the commit being built.
    /// `born_sync_id` is the sync generation the page was written in, when
    /// known (overflow pages do not record it).
    pub(crate) fn supersede(&self, page: PageId, born_sync_id: Option<u32>) -> HistoryNode {
        let never_durable = born_sync_id.map_or(false, |born| born > self.last_synced_id);
        HistoryNode {
            page,
            sync_id: if never_durable {
                0
            } else {
                self.last_synced_id + 1
            },
            commit_id: self.revision,
        }
    }
}

/// The collectible pool and the store-wide residue.
#[derive(Debug, Default)]
pub(crate) struct Collector {
    pool: BTreeSet<PageId>,
    residue: Vec<HistoryNode>,
}

impl Collector {
    pub(crate) fn from_payload(payload: MarkerPayload) -> Self {
        Self {
            pool: payload.pool.into_iter().collect(),
            residue: payload.residue,
        }
    }

    /// Rebuilds the pool from every tree page number that is not in `used`.
    /// The residue starts empty.
    pub(crate) fn rebuild(used: &BTreeSet<PageId>, page_count: u32) -> Self {
        let pool = (PageId::FIRST_TREE_PAGE..page_count)
            .filter_map(PageId::new)
            .filter(|pgid| !used.contains(pgid))
            .collect();
        Self {
            pool,
            residue: Vec::new(),
        }
    }

    pub(crate) fn payload(&self) -> MarkerPayload {
        MarkerPayload {
            pool: self.pool.iter().copied().collect(),
            residue: self.residue.clone(),
        }
    }

    pub(crate) fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub(crate) fn residue_len(&self) -> usize {
        self.residue.len()
    }

    /// Lowest collectible page number, so the file stays dense.
    pub(crate) fn take(&mut self) -> Option<PageId> {
        self.pool.pop_first()
    }

    pub(crate) fn release(&mut self, pages: impl IntoIterator<Item = PageId>) {
        self.pool.extend(pages);
    }

    pub(crate) fn add_residue(&mut self, history: impl IntoIterator<Item = HistoryNode>) {
        self.residue.extend(history);
    }

    /// Moves every reclaimable entry of `history` into the pool and returns
    /// the page numbers that became free.
    pub(crate) fn collect(&mut self, history: &mut Vec<HistoryNode>, horizon: &Horizon) -> Vec<PageId> {
        let mut freed = Vec::new();
        history.retain(|hn| {
            if horizon.reclaimable(hn) {
                freed.push(hn.page);
                false
            } else {
                true
            }
        });
        if !freed.is_empty() {
            log::debug!("reclaim pages {freed:?}");
        }
        self.pool.extend(freed.iter().copied());
        freed
    }

    pub(crate) fn sweep_residue(&mut self, horizon: &Horizon) -> Vec<PageId> {
        let mut residue = std::mem::take(&mut self.residue);
        let freed = self.collect(&mut residue, horizon);
        self.residue = residue;
        freed
    }
}
