use crate::btree::{self, BTree, Comparator, TreeConfig, WriteState};
use crate::cursor::Cursor;
use crate::error::Error;
use crate::file_lock::{FileLock, LockMode};
use crate::history::{Collector, Horizon};
use crate::id::PageId;
use crate::integrity::{self, TreeReport};
use crate::overflow;
use crate::page::{
    empty_node_capacity, space_needed, MarkerPage, MarkerPayload, Page, SpecPage,
};
use crate::pager::Pager;
use anyhow::anyhow;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::OpenOptions;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone)]
pub struct Setting {
    pub mode: OpenMode,
    /// Only used when the file is created. An existing store keeps the page
    /// size and thresholds it was created with.
    pub page_size: usize,
    pub max_key_size: usize,
    pub overflow_threshold: usize,
    /// Percent of a page below which a page is rebalanced after a delete.
    pub page_fill_threshold: u32,
    /// How many generations a superseded page is kept before it is reused.
    pub commit_chain_depth: u32,
    pub cache_size: usize,
    /// Sync after every that many commits. Zero disables it.
    pub auto_sync_rate: u64,
    /// Walk the whole tree on open even if both marker slots look fine.
    pub verify_on_open: bool,
    pub compare: Comparator,
}

impl std::default::Default for Setting {
    fn default() -> Self {
        Self {
            mode: OpenMode::ReadWrite,
            page_size: 4096,
            max_key_size: 512,
            overflow_threshold: 1000,
            page_fill_threshold: 25,
            commit_chain_depth: 1,
            cache_size: 1000,
            auto_sync_rate: 0,
            verify_on_open: false,
            compare: |a, b| a.cmp(b),
        }
    }
}

impl Setting {
    fn validate(&self) -> anyhow::Result<()> {
        Pager::check_page_size(self.page_size)?;
        check_limits(
            self.page_size,
            self.max_key_size,
            self.overflow_threshold,
            self.page_fill_threshold,
        )?;
        if self.commit_chain_depth == 0 {
            return Err(anyhow!("commit chain depth must be at least 1"));
        }
        Ok(())
    }
}

fn check_limits(
    page_size: usize,
    max_key_size: usize,
    overflow_threshold: usize,
    fill_threshold: u32,
) -> anyhow::Result<()> {
    if max_key_size == 0 || max_key_size > u16::MAX as usize {
        return Err(anyhow!("invalid maximum key size {max_key_size}"));
    }
    if fill_threshold > 50 {
        return Err(anyhow!(
            "page fill threshold must be at most 50 percent, but got {fill_threshold}"
        ));
    }
    // every split must leave two nodes that fit
    let largest = space_needed(max_key_size, overflow_threshold);
    if 2 * largest > empty_node_capacity(page_size) {
        return Err(anyhow!(
            "key size {max_key_size} and overflow threshold {overflow_threshold} are too large for pages of {page_size} bytes"
        ));
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub commits: u64,
    pub syncs: u64,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub entries: u64,
    pub depth: u32,
    pub reads: u64,
    pub hits: u64,
    pub writes: u64,
}

/// The tree as of one commit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    pub(crate) root: Option<PageId>,
    pub(crate) revision: u32,
    pub(crate) tag: u64,
}

pub(crate) struct StoreInner {
    mode: OpenMode,
    max_key_size: usize,
    depth: u32,
    auto_sync_rate: u64,
    pub(crate) config: TreeConfig,
    pub(crate) pager: Pager,
    collector: Collector,

    current: Snapshot,
    synced_revision: u32,
    last_synced_id: u32,
    /// Overflow pages holding the payload of marker slot 1 and 2.
    slot_chains: [Vec<PageId>; 2],

    pub(crate) write: Option<WriteState>,
    readers: BTreeMap<u32, usize>,
    /// Bumped by every change to the pages, so cursors know when their
    /// descent path went stale.
    pub(crate) epoch: u64,

    commits: u64,
    syncs: u64,
    last_error: Option<String>,
}

/// An open store file. Readers and the single writer share it through
/// `Transaction`s.
pub struct Store {
    pub(crate) inner: Mutex<StoreInner>,
}

struct LoadedMarker {
    marker: MarkerPage,
    payload: MarkerPayload,
    chain: Vec<PageId>,
}

fn slot_index(slot: PageId) -> usize {
    if slot == PageId::marker_slot(1) {
        0
    } else {
        1
    }
}

impl Store {
    pub fn open(path: &Path, setting: Setting) -> anyhow::Result<Self> {
        setting.validate()?;
        let read_only = setting.mode == OpenMode::ReadOnly;

        let lock_mode = if read_only {
            LockMode::Shared
        } else {
            LockMode::Exclusive
        };
        let f = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .truncate(false)
            .open(path)?;
        let mut f = FileLock::lock(f, lock_mode)?;

        let spec = match Pager::read_spec(&mut f)? {
            Some(Page::Spec(spec)) => spec,
            Some(_) => return Err(Error::corrupted(0, "expected the spec page").into()),
            None if read_only => {
                return Err(anyhow!("store file {} is empty", path.display()));
            }
            None => {
                let spec = SpecPage {
                    page_size: setting.page_size as u32,
                    key_size: setting.max_key_size as u32,
                    overflow_threshold: setting.overflow_threshold as u32,
                    fill_threshold: setting.page_fill_threshold,
                };
                let mut pager = Pager::new(f, setting.page_size, setting.cache_size)?;
                Self::init_store(&mut pager, &spec)?;
                log::debug!("created store {}", path.display());
                return Self::load(pager, &spec, &setting);
            }
        };

        let page_size = spec.page_size as usize;
        Pager::check_page_size(page_size)?;
        check_limits(
            page_size,
            spec.key_size as usize,
            spec.overflow_threshold as usize,
            spec.fill_threshold,
        )?;
        let pager = Pager::new(f, page_size, setting.cache_size)?;
        Self::load(pager, &spec, &setting)
    }

    fn init_store(pager: &mut Pager, spec: &SpecPage) -> anyhow::Result<()> {
        pager.write(&Page::Spec(spec.clone()))?;
        let size = PageId::FIRST_TREE_PAGE as u64 * spec.page_size as u64;
        // both slots start valid; the older one is simply never chosen
        for sync_id in [1, 0] {
            pager.write(&Page::Marker(MarkerPage {
                number: PageId::marker_slot(sync_id),
                root: None,
                revision: 0,
                sync_id,
                tag: 0,
                size,
                chain: None,
                payload: MarkerPayload::default(),
            }))?;
        }
        pager.sync()?;
        Ok(())
    }

    fn load(mut pager: Pager, spec: &SpecPage, setting: &Setting) -> anyhow::Result<Self> {
        let page_size = pager.page_size();
        let config = TreeConfig {
            page_size,
            overflow_threshold: spec.overflow_threshold as usize,
            fill_threshold: spec.fill_threshold,
            compare: setting.compare,
        };

        let mut loaded = Vec::new();
        for slot in [PageId::marker_slot(1), PageId::marker_slot(2)] {
            match Self::load_marker(&mut pager, slot) {
                Ok(marker) => loaded.push(marker),
                Err(err) => log::warn!("marker page {slot:?} is not usable: {err:#}"),
            }
        }
        loaded.sort_by(|a, b| b.marker.sync_id.cmp(&a.marker.sync_id));
        let walk_required = loaded.len() < 2 || setting.verify_on_open;

        let mut chosen = None;
        for (i, candidate) in loaded.iter().enumerate() {
            pager.set_page_count((candidate.marker.size / page_size as u64) as u32);
            if !walk_required && i == 0 {
                chosen = Some((i, None));
                break;
            }
            match integrity::check_tree(&mut pager, &config, candidate.marker.root) {
                Ok(report) => {
                    chosen = Some((i, Some(report)));
                    break;
                }
                Err(err) => log::warn!(
                    "tree of marker {:?} with sync id {} is broken: {err:#}",
                    candidate.marker.number,
                    candidate.marker.sync_id
                ),
            }
        }
        let Some((chosen, report)) = chosen else {
            return Err(Error::BothMarkersCorrupted.into());
        };
        if chosen > 0 {
            log::warn!("falling back to the older marker slot");
        }

        let LoadedMarker {
            marker,
            payload,
            chain,
        } = loaded.remove(chosen);
        let mut slot_chains = [Vec::new(), Vec::new()];
        // a newer slot that failed is overwritten by the next sync; its
        // chain lies past the recorded size
        for other in loaded {
            if other.marker.sync_id < marker.sync_id {
                slot_chains[slot_index(other.marker.number)] = other.chain;
            }
        }
        slot_chains[slot_index(marker.number)] = chain;

        let page_count = (marker.size / page_size as u64) as u32;
        pager.set_page_count(page_count);
        if setting.mode == OpenMode::ReadWrite {
            pager.set_file_size(marker.size)?;
        }

        let collector = match report {
            None => Collector::from_payload(payload),
            Some(report) => Self::rebuild_collector(report, payload, &slot_chains, page_count),
        };
        log::debug!(
            "open store at revision {} sync id {} with {} collectible pages and {} residue",
            marker.revision,
            marker.sync_id,
            collector.pool_len(),
            collector.residue_len()
        );

        let current = Snapshot {
            root: marker.root,
            revision: marker.revision,
            tag: marker.tag,
        };
        let inner = StoreInner {
            mode: setting.mode,
            max_key_size: spec.key_size as usize,
            depth: setting.commit_chain_depth,
            auto_sync_rate: setting.auto_sync_rate,
            config,
            pager,
            collector,
            current,
            synced_revision: marker.revision,
            last_synced_id: marker.sync_id,
            slot_chains,
            write: None,
            readers: BTreeMap::new(),
            epoch: 0,
            commits: 0,
            syncs: 0,
            last_error: None,
        };
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    fn load_marker(pager: &mut Pager, slot: PageId) -> anyhow::Result<LoadedMarker> {
        let Page::Marker(mut marker) = pager.read_uncached(slot)? else {
            return Err(Error::corrupted(slot.get(), "expected a marker page").into());
        };
        let (payload, chain) = match marker.chain {
            None => (std::mem::take(&mut marker.payload), Vec::new()),
            Some(first) => {
                let payload = MarkerPayload::decode(&overflow::read(pager, first)?)?;
                (payload, overflow::pages(pager, first)?)
            }
        };
        Ok(LoadedMarker {
            marker,
            payload,
            chain,
        })
    }

    /// Everything below the page count that neither the tree nor any
    /// history references is collectible.
    fn rebuild_collector(
        report: TreeReport,
        payload: MarkerPayload,
        slot_chains: &[Vec<PageId>; 2],
        page_count: u32,
    ) -> Collector {
        let mut used: BTreeSet<PageId> = report.pages;
        used.extend(report.history);
        used.extend(payload.residue.iter().map(|hn| hn.page));
        used.extend(slot_chains.iter().flatten().copied());

        let mut collector = Collector::rebuild(&used, page_count);
        log::warn!(
            "rebuilt the collectible pool with {} pages",
            collector.pool_len()
        );
        collector.add_residue(payload.residue);
        collector
    }

    /// Syncs and closes the store. Dropping a store without closing it
    /// loses everything committed after the last sync.
    pub fn close(self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        if inner.mode == OpenMode::ReadWrite {
            let result = inner.sync();
            inner.track(result)?;
        }
        Ok(())
    }

    pub fn begin_read(&self) -> anyhow::Result<Transaction<'_>> {
        let mut inner = self.inner.lock();
        let snapshot = inner.current;
        *inner.readers.entry(snapshot.revision).or_default() += 1;
        Ok(Transaction {
            store: self,
            read_only: true,
            snapshot,
            finished: false,
        })
    }

    pub fn begin_write(&self) -> anyhow::Result<Transaction<'_>> {
        let mut inner = self.inner.lock();
        let result = inner.begin_write();
        let snapshot = inner.track(result)?;
        Ok(Transaction {
            store: self,
            read_only: false,
            snapshot,
            finished: false,
        })
    }

    pub fn sync(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let result = inner.sync();
        inner.track(result)
    }

    /// Tag of the last commit.
    pub fn tag(&self) -> u64 {
        self.inner.lock().current.tag
    }

    /// Size of the store file in bytes.
    pub fn size(&self) -> anyhow::Result<u64> {
        self.inner.lock().pager.file_size()
    }

    pub fn is_writing(&self) -> bool {
        self.inner.lock().write.is_some()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn is_corrupted(&self) -> bool {
        self.inner.lock().pager.is_corrupted()
    }

    pub fn stats(&self) -> anyhow::Result<Stats> {
        let mut inner = self.inner.lock();
        let root = inner.current.root;
        let inner = &mut *inner;
        let report = integrity::check_tree(&mut inner.pager, &inner.config, root)?;
        let pager = inner.pager.stats();
        Ok(Stats {
            commits: inner.commits,
            syncs: inner.syncs,
            branch_pages: report.branch_pages,
            leaf_pages: report.leaf_pages,
            overflow_pages: report.overflow_pages,
            entries: report.entries,
            depth: report.depth,
            reads: pager.reads,
            hits: pager.hits,
            writes: pager.writes,
        })
    }

    /// Walks the committed tree and cross-checks it against the collectible
    /// pages. Fails with `Error::Integrity` on the first inconsistency.
    pub fn check_integrity(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        let result = inner.check_integrity();
        inner.track(result)
    }
}

impl StoreInner {
    pub(crate) fn track<T>(&mut self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        if let Err(err) = &result {
            self.last_error = Some(format!("{err:#}"));
        }
        result
    }

    fn horizon(&self, revision: u32) -> Horizon {
        Horizon {
            last_synced_id: self.last_synced_id,
            revision,
            oldest_reader: self.readers.keys().next().copied(),
            depth: self.depth,
        }
    }

    fn begin_write(&mut self) -> anyhow::Result<Snapshot> {
        if self.mode == OpenMode::ReadOnly {
            return Err(Error::ReadOnlyStore.into());
        }
        if self.write.is_some() {
            return Err(Error::WriteInProgress.into());
        }
        let horizon = self.horizon(self.current.revision + 1);
        self.write = Some(WriteState::new(self.current.root, horizon));
        log::debug!("begin write on revision {}", self.current.revision);
        Ok(self.current)
    }

    pub(crate) fn check_key(&self, key: &[u8]) -> anyhow::Result<()> {
        if key.is_empty() {
            return Err(Error::EmptyKey.into());
        }
        if key.len() > self.max_key_size {
            return Err(Error::KeyTooLarge {
                size: key.len(),
                max: self.max_key_size,
            }
            .into());
        }
        Ok(())
    }

    /// Root the given transaction sees.
    pub(crate) fn root_of(&self, tx: &Transaction) -> anyhow::Result<Option<PageId>> {
        if tx.read_only {
            return Ok(tx.snapshot.root);
        }
        match &self.write {
            Some(write) => Ok(write.root),
            None => Err(anyhow!("write transaction is no longer active")),
        }
    }

    fn with_tree<T>(&mut self, f: impl FnOnce(&mut BTree) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let Some(write) = self.write.as_mut() else {
            return Err(anyhow!("write transaction is no longer active"));
        };
        self.epoch += 1;
        let mut btree = BTree::new(&mut self.pager, &mut self.collector, write, &self.config);
        f(&mut btree)
    }

    fn commit(&mut self, tag: u64) -> anyhow::Result<()> {
        let Some(tx) = self.write.take() else {
            return Err(anyhow!("write transaction is no longer active"));
        };
        let revision = self.current.revision + 1;
        let horizon = self.horizon(revision);

        let mut freed = Vec::new();
        if let Err(err) = self.flush(&tx, &horizon, &mut freed) {
            log::error!("cannot commit revision {revision}: {err:#}");
            self.rollback(tx);
            return Err(err);
        }

        self.collector.release(freed.iter().copied());
        self.collector.add_residue(tx.residue);
        freed.extend(self.collector.sweep_residue(&horizon));
        for pgid in freed {
            self.pager.forget(pgid);
        }
        self.collector.release(tx.free);

        self.current = Snapshot {
            root: tx.root,
            revision,
            tag,
        };
        self.epoch += 1;
        self.commits += 1;
        log::debug!(
            "commit revision {revision} tag={tag} pages={}",
            tx.dirty.len()
        );
        #[cfg(debug_assertions)]
        {
            let check = integrity::check_tree(&mut self.pager, &self.config, tx.root);
            debug_assert!(
                check.is_ok(),
                "tree is inconsistent after revision {revision}: {check:?}"
            );
        }

        if self.auto_sync_rate > 0 && self.commits % self.auto_sync_rate == 0 {
            self.sync()?;
        }
        Ok(())
    }

    /// Writes every dirty page. Reclaimable history is stripped from the
    /// pages before they are written and collected into `freed`; nothing is
    /// handed to the collector until every write succeeded.
    fn flush(
        &mut self,
        tx: &WriteState,
        horizon: &Horizon,
        freed: &mut Vec<PageId>,
    ) -> anyhow::Result<()> {
        for &pgid in tx.dirty.iter() {
            let page = self.pager.read(pgid)?;
            if let Some(node) = page.as_node() {
                if node.history.iter().any(|hn| horizon.reclaimable(hn)) {
                    let mut node = node.clone();
                    node.history.retain(|hn| {
                        if horizon.reclaimable(hn) {
                            freed.push(hn.page);
                            false
                        } else {
                            true
                        }
                    });
                    self.pager.put_node(node);
                }
            }
            self.pager.flush(pgid)?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(tx) = self.write.take() {
            log::debug!(
                "abort write on revision {}, discard {} pages",
                self.current.revision,
                tx.dirty.len()
            );
            self.rollback(tx);
        }
    }

    fn rollback(&mut self, tx: WriteState) {
        for pgid in tx.dirty {
            self.pager.forget(pgid);
        }
        self.collector.release(tx.allocated);
        self.epoch += 1;
    }

    fn end_read(&mut self, revision: u32) {
        if let Some(count) = self.readers.get_mut(&revision) {
            *count -= 1;
            if *count == 0 {
                self.readers.remove(&revision);
            }
        }
    }

    /// Makes the last commit durable: data pages first, then the marker slot
    /// the previous sync did not use, each step followed by an fsync.
    fn sync(&mut self) -> anyhow::Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Ok(());
        }
        if self.write.is_some() {
            return Err(Error::WriteInProgress.into());
        }
        if self.current.revision == self.synced_revision {
            return Ok(());
        }

        if let Err(err) = self.write_marker() {
            log::error!("cannot sync revision {}: {err:#}", self.current.revision);
            return Err(err);
        }

        let horizon = self.horizon(self.current.revision);
        for pgid in self.collector.sweep_residue(&horizon) {
            self.pager.forget(pgid);
        }
        self.syncs += 1;
        Ok(())
    }

    fn write_marker(&mut self) -> anyhow::Result<()> {
        self.pager.sync()?;

        let page_size = self.pager.page_size();
        let sync_id = self.last_synced_id + 1;
        let slot = PageId::marker_slot(sync_id);
        let slot_chain = &self.slot_chains[slot_index(slot)];
        let mut payload = self.collector.payload();
        // the chain of the marker being overwritten is free once the new
        // marker is on disk
        payload.pool.extend(slot_chain.iter().copied());

        // chain pages come from the end of the file so the payload does not
        // change while it is being written
        let (chain, chain_pages, payload) = if MarkerPage::payload_fits_inline(&payload, page_size)
        {
            (None, Vec::new(), payload)
        } else {
            let data = payload.encode();
            let count = overflow::pages_needed(data.len(), page_size);
            let pages = (0..count)
                .map(|_| self.pager.next_page())
                .collect::<anyhow::Result<Vec<_>>>()?;
            for page in overflow::build(&pages, &data, page_size) {
                self.pager.write(&Page::Overflow(page))?;
            }
            (pages.first().copied(), pages, MarkerPayload::default())
        };

        let marker = MarkerPage {
            number: slot,
            root: self.current.root,
            revision: self.current.revision,
            sync_id,
            tag: self.current.tag,
            size: self.pager.page_count() as u64 * page_size as u64,
            chain,
            payload,
        };
        self.pager.write(&Page::Marker(marker))?;
        self.pager.sync()?;

        log::debug!(
            "synced revision {} into {slot:?} with sync id {sync_id}",
            self.current.revision
        );
        self.last_synced_id = sync_id;
        self.synced_revision = self.current.revision;

        // the slot just overwritten no longer needs its chain
        let old = std::mem::replace(&mut self.slot_chains[slot_index(slot)], chain_pages);
        self.collector.release(old);
        Ok(())
    }

    fn check_integrity(&mut self) -> anyhow::Result<()> {
        let report = integrity::check_tree(&mut self.pager, &self.config, self.current.root)?;
        let payload = self.collector.payload();
        for pgid in payload.pool.iter().chain(self.slot_chains.iter().flatten()) {
            if report.pages.contains(pgid) {
                return Err(Error::Integrity(format!("live page {pgid:?} is collectible")).into());
            }
            if report.history.contains(pgid) {
                return Err(Error::Integrity(format!(
                    "page {pgid:?} is collectible but still listed as history"
                ))
                .into());
            }
        }
        for hn in &payload.residue {
            if report.pages.contains(&hn.page) {
                return Err(Error::Integrity(format!(
                    "live page {:?} is listed in the residue",
                    hn.page
                ))
                .into());
            }
        }
        Ok(())
    }
}

/// A read snapshot or the single write transaction of a store. Dropping an
/// unfinished write transaction aborts it.
pub struct Transaction<'s> {
    pub(crate) store: &'s Store,
    read_only: bool,
    snapshot: Snapshot,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Tag of the commit this transaction started from.
    pub fn tag(&self) -> u64 {
        self.snapshot.tag
    }

    pub fn revision(&self) -> u32 {
        self.snapshot.revision
    }

    pub(crate) fn lock(&self) -> MutexGuard<'s, StoreInner> {
        self.store.inner.lock()
    }

    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let mut inner = self.lock();
        let result = inner.root_of(self).and_then(|root| {
            let inner = &mut *inner;
            btree::get(&mut inner.pager, &inner.config, root, key)
        });
        inner.track(result)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let result = self
            .check_writable()
            .and_then(|_| inner.check_key(key))
            .and_then(|_| inner.with_tree(|btree| btree.put(key, value)));
        inner.track(result)
    }

    /// Removes `key`, returning whether it was there.
    pub fn del(&self, key: &[u8]) -> anyhow::Result<bool> {
        let mut inner = self.lock();
        let result = self.check_writable().and_then(|_| {
            if key.is_empty() {
                return Ok(false);
            }
            inner.with_tree(|btree| btree.del(key))
        });
        inner.track(result)
    }

    pub fn cursor(&self) -> Cursor<'_, 's> {
        Cursor::new(self)
    }

    /// Publishes the changes as the store's new state, stamped with `tag`.
    /// Committing a read transaction just ends it.
    pub fn commit(mut self, tag: u64) -> anyhow::Result<()> {
        self.finished = true;
        let mut inner = self.lock();
        if self.read_only {
            inner.end_read(self.snapshot.revision);
            return Ok(());
        }
        let result = inner.commit(tag);
        inner.track(result)
    }

    pub fn abort(mut self) {
        self.finished = true;
        let mut inner = self.lock();
        if self.read_only {
            inner.end_read(self.snapshot.revision);
        } else {
            inner.abort();
        }
    }

    fn check_writable(&self) -> anyhow::Result<()> {
        if self.read_only {
            return Err(Error::ReadOnlyTransaction.into());
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut inner = self.lock();
        if self.read_only {
            inner.end_read(self.snapshot.revision);
        } else {
            inner.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setting_validation() {
        assert!(Setting::default().validate().is_ok());

        let setting = Setting {
            commit_chain_depth: 0,
            ..Setting::default()
        };
        assert!(setting.validate().is_err());

        let setting = Setting {
            page_size: 5000,
            ..Setting::default()
        };
        assert!(setting.validate().is_err());

        let setting = Setting {
            overflow_threshold: 2000,
            ..Setting::default()
        };
        assert!(setting.validate().is_err());

        let setting = Setting {
            page_size: 8192,
            overflow_threshold: 2000,
            ..Setting::default()
        };
        assert!(setting.validate().is_ok());
    }

    #[test]
    fn test_marker_slots_alternate_on_sync() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("store"), Setting::default()).unwrap();

        for i in 0..4u64 {
            let tx = store.begin_write().unwrap();
            tx.put(b"counter", &i.to_be_bytes()).unwrap();
            tx.commit(i).unwrap();
            store.sync().unwrap();

            let inner = store.inner.lock();
            assert_eq!(i as u32 + 2, inner.last_synced_id);
            assert_eq!(inner.current.revision, inner.synced_revision);
        }

        // nothing new to sync
        store.sync().unwrap();
        assert_eq!(4, store.inner.lock().syncs);
    }

    #[test]
    fn test_large_pool_goes_to_marker_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        let store = Store::open(&path, Setting::default()).unwrap();

        // enough leaves that the freed page list outgrows the marker page
        let tx = store.begin_write().unwrap();
        for i in 0..6000u32 {
            tx.put(format!("key{i:06}").as_bytes(), &[7u8; 1000]).unwrap();
        }
        tx.commit(1).unwrap();
        store.sync().unwrap();

        let tx = store.begin_write().unwrap();
        for i in 0..6000u32 {
            assert!(tx.del(format!("key{i:06}").as_bytes()).unwrap());
        }
        tx.commit(2).unwrap();
        store.sync().unwrap();
        // a third sync moves the deleted tree past both marker slots
        let tx = store.begin_write().unwrap();
        tx.put(b"last", b"one").unwrap();
        tx.commit(3).unwrap();
        store.sync().unwrap();
        {
            let inner = store.inner.lock();
            assert!(inner.collector.pool_len() > 1000);
            assert!(!inner.slot_chains[slot_index(PageId::marker_slot(4))].is_empty());
        }
        store.check_integrity().unwrap();
        store.close().unwrap();

        let store = Store::open(&path, Setting::default()).unwrap();
        assert_eq!(3, store.tag());
        let tx = store.begin_read().unwrap();
        assert_eq!(Some(b"one".to_vec()), tx.get(b"last").unwrap());
        assert_eq!(None, tx.get(b"key000001").unwrap());
        drop(tx);
        store.check_integrity().unwrap();
    }
}
