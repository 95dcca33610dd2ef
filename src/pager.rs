use crate::cache::PageCache;
use crate::error::Error;
use crate::id::PageId;
use crate::page::{self, NodePage, OverflowPage, Page, MAXIMUM_PAGE_SIZE, MINIMUM_PAGE_SIZE};
use anyhow::anyhow;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PagerStats {
    pub(crate) reads: u64,
    pub(crate) hits: u64,
    pub(crate) writes: u64,
}

/// Fixed-size page I/O on top of a single file, with the page cache in front
/// of reads. Pages are addressed by number; page `n` lives at `n * page_size`.
pub(crate) struct Pager {
    f: File,
    page_size: usize,
    page_count: u32,
    cache: PageCache,
    buff: Box<[u8]>,
    stats: PagerStats,
    corrupted: bool,
}

impl Pager {
    pub(crate) fn new(f: File, page_size: usize, cache_size: usize) -> anyhow::Result<Self> {
        Self::check_page_size(page_size)?;
        Ok(Self {
            f,
            page_size,
            page_count: PageId::FIRST_TREE_PAGE,
            cache: PageCache::new(cache_size),
            buff: vec![0u8; page_size].into_boxed_slice(),
            stats: PagerStats::default(),
            corrupted: false,
        })
    }

    pub(crate) fn check_page_size(page_size: usize) -> anyhow::Result<()> {
        if page_size.count_ones() != 1 {
            return Err(anyhow!(
                "page size must be a power of 2, but got {}",
                page_size
            ));
        }
        if page_size < MINIMUM_PAGE_SIZE {
            return Err(anyhow!(
                "page size must be at least {} bytes, but got {}",
                MINIMUM_PAGE_SIZE,
                page_size
            ));
        }
        if page_size > MAXIMUM_PAGE_SIZE {
            return Err(anyhow!(
                "page size must be at most {} bytes, but got {}",
                MAXIMUM_PAGE_SIZE,
                page_size
            ));
        }
        Ok(())
    }

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn stats(&self) -> PagerStats {
        self.stats
    }

    pub(crate) fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    /// Number of page slots in use, reserved pages included. New pages that
    /// do not come from the collectible pool are numbered from here.
    pub(crate) fn page_count(&self) -> u32 {
        self.page_count
    }

    pub(crate) fn set_page_count(&mut self, page_count: u32) {
        self.page_count = page_count.max(PageId::FIRST_TREE_PAGE);
    }

    pub(crate) fn next_page(&mut self) -> anyhow::Result<PageId> {
        let Some(pgid) = PageId::new(self.page_count) else {
            return Err(anyhow!("store is full, no page numbers left"));
        };
        self.page_count += 1;
        Ok(pgid)
    }

    /// Reads a tree page through the cache.
    pub(crate) fn read(&mut self, pgid: PageId) -> anyhow::Result<Arc<Page>> {
        if let Some(page) = self.cache.get(pgid) {
            self.stats.hits += 1;
            log::trace!("cache hit {pgid:?}");
            return Ok(page);
        }
        log::trace!("cache miss {pgid:?}");
        let page = Arc::new(self.read_uncached(pgid)?);
        self.cache.insert_clean(pgid, page.clone());
        Ok(page)
    }

    pub(crate) fn read_node(&mut self, pgid: PageId) -> anyhow::Result<Arc<Page>> {
        let page = self.read(pgid)?;
        if page.as_node().is_none() {
            return Err(Error::corrupted(pgid.get(), "expected a branch or leaf page").into());
        }
        Ok(page)
    }

    pub(crate) fn read_overflow(&mut self, pgid: PageId) -> anyhow::Result<Arc<Page>> {
        let page = self.read(pgid)?;
        if page.as_overflow().is_none() {
            return Err(Error::corrupted(pgid.get(), "expected an overflow page").into());
        }
        Ok(page)
    }

    /// Reads and decodes a page straight from the file. Any checksum or page
    /// number mismatch flags the store as corrupted.
    pub(crate) fn read_uncached(&mut self, pgid: PageId) -> anyhow::Result<Page> {
        self.stats.reads += 1;
        let ok = read_page(&mut self.f, pgid, self.page_size, &mut self.buff)?;
        if !ok {
            self.corrupted = true;
            return Err(Error::corrupted(pgid.get(), "page is beyond the end of the file").into());
        }
        match page::decode(pgid, &self.buff) {
            Ok(page) => Ok(page),
            Err(err) => {
                if err.downcast_ref::<Error>().is_some() {
                    self.corrupted = true;
                }
                Err(err)
            }
        }
    }

    pub(crate) fn write(&mut self, page: &Page) -> anyhow::Result<()> {
        page::encode(page, &mut self.buff)?;
        write_page(&mut self.f, page.number(), self.page_size, &self.buff)?;
        self.stats.writes += 1;
        Ok(())
    }

    pub(crate) fn is_dirty(&self, pgid: PageId) -> bool {
        self.cache.is_dirty(pgid)
    }

    pub(crate) fn put_dirty(&mut self, page: Page) {
        let pgid = page.number();
        self.cache.insert_dirty(pgid, Arc::new(page));
    }

    pub(crate) fn put_node(&mut self, page: NodePage) {
        self.put_dirty(Page::Node(page));
    }

    pub(crate) fn put_overflow(&mut self, page: OverflowPage) {
        self.put_dirty(Page::Overflow(page));
    }

    /// Writes a dirty page and lets the cache evict it from now on.
    pub(crate) fn flush(&mut self, pgid: PageId) -> anyhow::Result<()> {
        let Some(page) = self.cache.get(pgid) else {
            return Err(anyhow!("dirty page {pgid:?} is missing from the cache"));
        };
        self.write(&page)?;
        self.cache.mark_clean(pgid);
        Ok(())
    }

    /// Drops a page from the cache without writing it.
    pub(crate) fn forget(&mut self, pgid: PageId) {
        self.cache.remove(pgid);
    }

    pub(crate) fn sync(&self) -> anyhow::Result<()> {
        self.f.sync_all()?;
        Ok(())
    }

    pub(crate) fn file_size(&self) -> anyhow::Result<u64> {
        Ok(self.f.metadata()?.len())
    }

    pub(crate) fn set_file_size(&mut self, size: u64) -> anyhow::Result<()> {
        self.f.set_len(size)?;
        Ok(())
    }

    /// Reads the first page without knowing the page size yet. Only the
    /// spec page header is needed, and the spec page never uses its tail.
    pub(crate) fn read_spec(f: &mut File) -> anyhow::Result<Option<Page>> {
        let size = f.metadata()?.len();
        if size == 0 {
            return Ok(None);
        }
        if size < MINIMUM_PAGE_SIZE as u64 {
            return Err(Error::corrupted(0, "file is smaller than one page").into());
        }
        let mut buff = vec![0u8; MINIMUM_PAGE_SIZE];
        f.seek(SeekFrom::Start(0))?;
        f.read_exact(&mut buff)?;
        Ok(Some(page::decode(PageId::SPEC, &buff)?))
    }
}

fn read_page(f: &mut File, id: PageId, page_size: usize, buff: &mut [u8]) -> anyhow::Result<bool> {
    let page_size = page_size as u64;
    let file_size = f.metadata()?.len();
    let min_size = id.get() as u64 * page_size + page_size;
    if min_size > file_size {
        return Ok(false);
    }
    f.seek(SeekFrom::Start(id.get() as u64 * page_size))?;
    f.read_exact(buff)?;
    Ok(true)
}

fn write_page(f: &mut File, id: PageId, page_size: usize, buff: &[u8]) -> anyhow::Result<()> {
    let page_size = page_size as u64;
    let file_size = f.metadata()?.len();
    let min_size = id.get() as u64 * page_size + page_size;
    if min_size > file_size {
        f.set_len(min_size)?;
    }
    f.seek(SeekFrom::Start(id.get() as u64 * page_size))?;
    f.write_all(buff)?;
    Ok(())
}
