use crate::bins::{SliceExt, SliceMutExt};
use crate::error::Error;
use crate::id::{PageId, PageIdExt};
use anyhow::anyhow;
use std::ops::Range;

pub(crate) const MINIMUM_PAGE_SIZE: usize = 0x1000;
pub(crate) const MAXIMUM_PAGE_SIZE: usize = 0x8000;

const MAGIC: &[u8] = b"hbtree00";
const VERSION: u32 = 1;

// Every page starts with this header. The checksum covers everything after
// the checksum field that is live according to the offsets: the front part
// up to `fixed header + lower` and the last `upper` bytes of the page.
pub(crate) const PAGE_INFO_SIZE: usize = 16;
const PAGE_INFO_CHECKSUM_RANGE: Range<usize> = 0..4;
const PAGE_INFO_TYPE_RANGE: Range<usize> = 4..8;
const PAGE_INFO_NUMBER_RANGE: Range<usize> = 8..12;
const PAGE_INFO_UPPER_RANGE: Range<usize> = 12..14;
const PAGE_INFO_LOWER_RANGE: Range<usize> = 14..16;

const SPEC_META_SIZE: usize = 28;
const SPEC_MAGIC_RANGE: Range<usize> = 0..8;
const SPEC_VERSION_RANGE: Range<usize> = 8..12;
const SPEC_PAGE_SIZE_RANGE: Range<usize> = 12..16;
const SPEC_KEY_SIZE_RANGE: Range<usize> = 16..20;
const SPEC_OVERFLOW_THRESHOLD_RANGE: Range<usize> = 20..24;
const SPEC_FILL_THRESHOLD_RANGE: Range<usize> = 24..28;

const MARKER_META_SIZE: usize = 36;
const MARKER_ROOT_RANGE: Range<usize> = 0..4;
const MARKER_REVISION_RANGE: Range<usize> = 4..8;
const MARKER_SYNC_ID_RANGE: Range<usize> = 8..12;
const MARKER_TAG_RANGE: Range<usize> = 12..20;
const MARKER_SIZE_RANGE: Range<usize> = 20..28;
const MARKER_FLAGS_RANGE: Range<usize> = 28..32;
const MARKER_CHAIN_RANGE: Range<usize> = 32..36;
const MARKER_FLAG_DATA_ON_OVERFLOW: u32 = 0x1;

const NODE_META_SIZE: usize = 12;
const NODE_SYNC_ID_RANGE: Range<usize> = 0..4;
const NODE_COMMIT_ID_RANGE: Range<usize> = 4..8;
const NODE_HISTORY_SIZE_RANGE: Range<usize> = 8..10;
const NODE_FLAGS_RANGE: Range<usize> = 10..12;
const NODE_FLAG_HAS_OVERFLOW: u16 = 0x1;

pub(crate) const HISTORY_NODE_SIZE: usize = 12;
const HISTORY_PAGE_RANGE: Range<usize> = 0..4;
const HISTORY_SYNC_ID_RANGE: Range<usize> = 4..8;
const HISTORY_COMMIT_ID_RANGE: Range<usize> = 8..12;

const NODE_INDEX_SIZE: usize = 2;
const NODE_HEADER_SIZE: usize = 8;
const NODE_HEADER_KEY_SIZE_RANGE: Range<usize> = 0..2;
const NODE_HEADER_FLAGS_RANGE: Range<usize> = 2..4;
const NODE_HEADER_CONTEXT_RANGE: Range<usize> = 4..8;
const NODE_FLAG_OVERFLOW: u16 = 0x1;

const OVERFLOW_META_SIZE: usize = 4;
const OVERFLOW_NEXT_RANGE: Range<usize> = 0..4;

macro_rules! const_assert {
    ($($tt:tt)*) => {
        const _: () = assert!($($tt)*);
    }
}

const_assert!(PAGE_INFO_LOWER_RANGE.end == PAGE_INFO_SIZE);
const_assert!(range_size(PAGE_INFO_CHECKSUM_RANGE) == 4);
const_assert!(range_size(PAGE_INFO_TYPE_RANGE) == 4);
const_assert!(range_size(PAGE_INFO_NUMBER_RANGE) == 4);
const_assert!(range_size(PAGE_INFO_UPPER_RANGE) == 2);
const_assert!(SPEC_FILL_THRESHOLD_RANGE.end == SPEC_META_SIZE);
const_assert!(range_size(SPEC_MAGIC_RANGE) == 8);
const_assert!(MARKER_CHAIN_RANGE.end == MARKER_META_SIZE);
const_assert!(range_size(MARKER_TAG_RANGE) == 8);
const_assert!(range_size(MARKER_SIZE_RANGE) == 8);
const_assert!(NODE_FLAGS_RANGE.end == NODE_META_SIZE);
const_assert!(HISTORY_COMMIT_ID_RANGE.end == HISTORY_NODE_SIZE);
const_assert!(NODE_HEADER_CONTEXT_RANGE.end == NODE_HEADER_SIZE);
const_assert!(OVERFLOW_NEXT_RANGE.end == OVERFLOW_META_SIZE);
// node offsets are stored as u16
const_assert!(MAXIMUM_PAGE_SIZE <= u16::MAX as usize + 1);

const fn range_size(range: Range<usize>) -> usize {
    range.end - range.start
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageType {
    Spec = 1,
    Marker = 2,
    Branch = 3,
    Leaf = 4,
    Overflow = 5,
}

impl PageType {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(Self::Spec),
            2 => Some(Self::Marker),
            3 => Some(Self::Branch),
            4 => Some(Self::Leaf),
            5 => Some(Self::Overflow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Page {
    Spec(SpecPage),
    Marker(MarkerPage),
    Node(NodePage),
    Overflow(OverflowPage),
}

impl Page {
    pub(crate) fn number(&self) -> PageId {
        match self {
            Page::Spec(_) => PageId::SPEC,
            Page::Marker(page) => page.number,
            Page::Node(page) => page.number,
            Page::Overflow(page) => page.number,
        }
    }

    pub(crate) fn as_node(&self) -> Option<&NodePage> {
        if let Page::Node(page) = self {
            Some(page)
        } else {
            None
        }
    }

    pub(crate) fn as_overflow(&self) -> Option<&OverflowPage> {
        if let Page::Overflow(page) = self {
            Some(page)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SpecPage {
    pub(crate) page_size: u32,
    pub(crate) key_size: u32,
    pub(crate) overflow_threshold: u32,
    pub(crate) fill_threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HistoryNode {
    pub(crate) page: PageId,
    pub(crate) sync_id: u32,
    pub(crate) commit_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct MarkerPayload {
    pub(crate) pool: Vec<PageId>,
    pub(crate) residue: Vec<HistoryNode>,
}

impl MarkerPayload {
    pub(crate) fn encoded_size(&self) -> usize {
        8 + self.pool.len() * 4 + self.residue.len() * HISTORY_NODE_SIZE
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buff = vec![0u8; self.encoded_size()];
        buff[0..4].put_u32(self.pool.len() as u32);
        buff[4..8].put_u32(self.residue.len() as u32);
        let mut offset = 8;
        for pgid in &self.pool {
            buff[offset..].put_u32(pgid.get());
            offset += 4;
        }
        for hn in &self.residue {
            encode_history_node(hn, &mut buff[offset..offset + HISTORY_NODE_SIZE]);
            offset += HISTORY_NODE_SIZE;
        }
        buff
    }

    pub(crate) fn decode(buff: &[u8]) -> anyhow::Result<Self> {
        if buff.len() < 8 {
            return Err(anyhow!("marker payload is truncated"));
        }
        let pool_count = buff[0..4].read_u32() as usize;
        let residue_count = buff[4..8].read_u32() as usize;
        let needed = pool_count
            .checked_mul(4)
            .and_then(|p| residue_count.checked_mul(HISTORY_NODE_SIZE).map(|r| p + r + 8));
        if needed.map_or(true, |needed| needed > buff.len()) {
            return Err(anyhow!(
                "marker payload declares {pool_count} pages and {residue_count} history nodes but has {} bytes",
                buff.len()
            ));
        }

        let mut offset = 8;
        let mut pool = Vec::with_capacity(pool_count);
        for _ in 0..pool_count {
            let Some(pgid) = PageId::new(buff[offset..].read_u32()) else {
                return Err(anyhow!("marker payload contains an invalid page"));
            };
            pool.push(pgid);
            offset += 4;
        }
        let mut residue = Vec::with_capacity(residue_count);
        for _ in 0..residue_count {
            residue.push(decode_history_node(&buff[offset..offset + HISTORY_NODE_SIZE])?);
            offset += HISTORY_NODE_SIZE;
        }
        Ok(Self { pool, residue })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MarkerPage {
    pub(crate) number: PageId,
    pub(crate) root: Option<PageId>,
    pub(crate) revision: u32,
    pub(crate) sync_id: u32,
    pub(crate) tag: u64,
    pub(crate) size: u64,
    /// First page of the overflow chain holding the payload, when it does not
    /// fit inline. The payload is then left empty by `decode`.
    pub(crate) chain: Option<PageId>,
    pub(crate) payload: MarkerPayload,
}

impl MarkerPage {
    pub(crate) fn payload_fits_inline(payload: &MarkerPayload, page_size: usize) -> bool {
        PAGE_INFO_SIZE + MARKER_META_SIZE + payload.encoded_size() <= page_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeKind {
    Branch,
    Leaf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeValue {
    Inline(Vec<u8>),
    Overflow(PageId),
    Child(PageId),
}

impl NodeValue {
    pub(crate) fn child(&self) -> Option<PageId> {
        if let NodeValue::Child(pgid) = self {
            Some(*pgid)
        } else {
            None
        }
    }

    pub(crate) fn inline_len(&self) -> usize {
        if let NodeValue::Inline(data) = self {
            data.len()
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Node {
    pub(crate) key: Vec<u8>,
    pub(crate) value: NodeValue,
}

impl Node {
    /// Bytes this node occupies in the page, index slot included.
    pub(crate) fn size(&self) -> usize {
        NODE_HEADER_SIZE + self.key.len() + self.value.inline_len() + NODE_INDEX_SIZE
    }

    pub(crate) fn space_needed(&self) -> usize {
        space_needed(self.key.len(), self.value.inline_len())
    }
}

/// Space a new node needs before it is inserted. One history node is reserved
/// so the page can always be touched again without spilling.
pub(crate) fn space_needed(key_len: usize, inline_len: usize) -> usize {
    NODE_HEADER_SIZE + key_len + inline_len + NODE_INDEX_SIZE + HISTORY_NODE_SIZE
}

/// Capacity of a node page without any history.
pub(crate) fn empty_node_capacity(page_size: usize) -> usize {
    page_size - PAGE_INFO_SIZE - NODE_META_SIZE
}

pub(crate) fn overflow_capacity(page_size: usize) -> usize {
    page_size - PAGE_INFO_SIZE - OVERFLOW_META_SIZE
}

#[derive(Debug, Clone)]
pub(crate) struct NodePage {
    pub(crate) number: PageId,
    pub(crate) kind: NodeKind,
    pub(crate) page_size: usize,
    /// Sync generation and revision the page was written in.
    pub(crate) sync_id: u32,
    pub(crate) commit_id: u32,
    pub(crate) history: Vec<HistoryNode>,
    pub(crate) nodes: Vec<Node>,
}

impl NodePage {
    pub(crate) fn new(number: PageId, kind: NodeKind, page_size: usize) -> Self {
        Self {
            number,
            kind,
            page_size,
            sync_id: 0,
            commit_id: 0,
            history: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Leaf
    }

    pub(crate) fn header_size(&self) -> usize {
        PAGE_INFO_SIZE + NODE_META_SIZE + self.history.len() * HISTORY_NODE_SIZE
    }

    pub(crate) fn capacity(&self) -> usize {
        self.page_size.saturating_sub(self.header_size())
    }

    pub(crate) fn lower_offset(&self) -> usize {
        self.nodes.len() * NODE_INDEX_SIZE
    }

    pub(crate) fn upper_offset(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.size() - NODE_INDEX_SIZE)
            .sum()
    }

    pub(crate) fn used(&self) -> usize {
        self.nodes.iter().map(Node::size).sum()
    }

    pub(crate) fn space_left(&self) -> usize {
        self.capacity().saturating_sub(self.used())
    }

    /// Fill ratio strictly above `threshold` percent.
    pub(crate) fn full_enough(&self, threshold: u32) -> bool {
        self.used() * 100 > threshold as usize * self.capacity()
    }

    pub(crate) fn has_overflow(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| matches!(n.value, NodeValue::Overflow(_)))
    }

    /// Moves history nodes into `spill` until `needed` bytes are free or the
    /// history is empty. Oldest entries go first.
    pub(crate) fn make_room(&mut self, needed: usize, spill: &mut Vec<HistoryNode>) {
        let wanted = self.used() + needed;
        let base = empty_node_capacity(self.page_size);
        let mut moved = 0;
        while moved < self.history.len() {
            let kept = (self.history.len() - moved) * HISTORY_NODE_SIZE;
            if base.saturating_sub(kept) >= wanted {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            log::debug!(
                "spill {moved} history nodes from page {:?} to residue",
                self.number
            );
            spill.extend(self.history.drain(..moved));
        }
    }

    /// Appends history, spilling whatever does not fit.
    pub(crate) fn push_history(&mut self, hn: HistoryNode, spill: &mut Vec<HistoryNode>) {
        if self.space_left() >= HISTORY_NODE_SIZE {
            self.history.push(hn);
        } else {
            spill.push(hn);
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OverflowPage {
    pub(crate) number: PageId,
    pub(crate) next: Option<PageId>,
    pub(crate) data: Vec<u8>,
}

fn encode_history_node(hn: &HistoryNode, buff: &mut [u8]) {
    buff[HISTORY_PAGE_RANGE].put_u32(hn.page.get());
    buff[HISTORY_SYNC_ID_RANGE].put_u32(hn.sync_id);
    buff[HISTORY_COMMIT_ID_RANGE].put_u32(hn.commit_id);
}

fn decode_history_node(buff: &[u8]) -> anyhow::Result<HistoryNode> {
    let Some(page) = PageId::new(buff[HISTORY_PAGE_RANGE].read_u32()) else {
        return Err(anyhow!("history node references an invalid page"));
    };
    Ok(HistoryNode {
        page,
        sync_id: buff[HISTORY_SYNC_ID_RANGE].read_u32(),
        commit_id: buff[HISTORY_COMMIT_ID_RANGE].read_u32(),
    })
}

fn checksum(buff: &[u8], front_end: usize, upper: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buff[PAGE_INFO_CHECKSUM_RANGE.end..front_end]);
    hasher.update(&buff[buff.len() - upper..]);
    hasher.finalize()
}

fn write_info(buff: &mut [u8], kind: PageType, number: PageId, upper: usize, lower: usize) {
    buff[PAGE_INFO_TYPE_RANGE].put_u32(kind as u32);
    buff[PAGE_INFO_NUMBER_RANGE].copy_from_slice(&number.to_be_bytes());
    buff[PAGE_INFO_UPPER_RANGE].put_u16(upper as u16);
    buff[PAGE_INFO_LOWER_RANGE].put_u16(lower as u16);
}

/// Serializes `page` into a page-sized buffer and stamps its checksum.
pub(crate) fn encode(page: &Page, buff: &mut [u8]) -> anyhow::Result<()> {
    let page_size = buff.len();
    buff.fill(0);

    let (front_end, upper) = match page {
        Page::Spec(spec) => {
            write_info(buff, PageType::Spec, PageId::SPEC, 0, 0);
            let meta = &mut buff[PAGE_INFO_SIZE..PAGE_INFO_SIZE + SPEC_META_SIZE];
            meta[SPEC_MAGIC_RANGE].copy_from_slice(MAGIC);
            meta[SPEC_VERSION_RANGE].put_u32(VERSION);
            meta[SPEC_PAGE_SIZE_RANGE].put_u32(spec.page_size);
            meta[SPEC_KEY_SIZE_RANGE].put_u32(spec.key_size);
            meta[SPEC_OVERFLOW_THRESHOLD_RANGE].put_u32(spec.overflow_threshold);
            meta[SPEC_FILL_THRESHOLD_RANGE].put_u32(spec.fill_threshold);
            (PAGE_INFO_SIZE + SPEC_META_SIZE, 0)
        }
        Page::Marker(marker) => {
            let inline = marker.chain.is_none();
            let payload = if inline {
                marker.payload.encode()
            } else {
                Vec::new()
            };
            let front = PAGE_INFO_SIZE + MARKER_META_SIZE;
            if front + payload.len() > page_size {
                return Err(anyhow!(
                    "marker payload of {} bytes does not fit inline",
                    payload.len()
                ));
            }
            write_info(buff, PageType::Marker, marker.number, 0, payload.len());
            let meta = &mut buff[PAGE_INFO_SIZE..front];
            meta[MARKER_ROOT_RANGE].copy_from_slice(&marker.root.to_be_bytes());
            meta[MARKER_REVISION_RANGE].put_u32(marker.revision);
            meta[MARKER_SYNC_ID_RANGE].put_u32(marker.sync_id);
            meta[MARKER_TAG_RANGE].put_u64(marker.tag);
            meta[MARKER_SIZE_RANGE].put_u64(marker.size);
            let flags = if inline {
                0
            } else {
                MARKER_FLAG_DATA_ON_OVERFLOW
            };
            meta[MARKER_FLAGS_RANGE].put_u32(flags);
            meta[MARKER_CHAIN_RANGE].copy_from_slice(&marker.chain.to_be_bytes());
            buff[front..front + payload.len()].copy_from_slice(&payload);
            (front + payload.len(), 0)
        }
        Page::Node(node) => encode_node(node, buff)?,
        Page::Overflow(overflow) => {
            let front = PAGE_INFO_SIZE + OVERFLOW_META_SIZE;
            if front + overflow.data.len() > page_size {
                return Err(anyhow!(
                    "overflow page {:?} holds {} bytes, more than its capacity",
                    overflow.number,
                    overflow.data.len()
                ));
            }
            write_info(
                buff,
                PageType::Overflow,
                overflow.number,
                0,
                overflow.data.len(),
            );
            buff[PAGE_INFO_SIZE..front][OVERFLOW_NEXT_RANGE]
                .copy_from_slice(&overflow.next.to_be_bytes());
            buff[front..front + overflow.data.len()].copy_from_slice(&overflow.data);
            (front + overflow.data.len(), 0)
        }
    };

    let sum = checksum(buff, front_end, upper);
    buff[PAGE_INFO_CHECKSUM_RANGE].put_u32(sum);

    log::trace!("encode page pgid={:?} checksum={sum:#x}", page.number());
    Ok(())
}

fn encode_node(node: &NodePage, buff: &mut [u8]) -> anyhow::Result<(usize, usize)> {
    let page_size = buff.len();
    let lower = node.lower_offset();
    let upper = node.upper_offset();
    let header_size = node.header_size();
    if header_size + lower + upper > page_size {
        return Err(Error::Integrity(format!(
            "page {:?} overflows: header={header_size} lower={lower} upper={upper}",
            node.number
        ))
        .into());
    }

    let kind = match node.kind {
        NodeKind::Branch => PageType::Branch,
        NodeKind::Leaf => PageType::Leaf,
    };
    write_info(buff, kind, node.number, upper, lower);

    let meta = &mut buff[PAGE_INFO_SIZE..PAGE_INFO_SIZE + NODE_META_SIZE];
    meta[NODE_SYNC_ID_RANGE].put_u32(node.sync_id);
    meta[NODE_COMMIT_ID_RANGE].put_u32(node.commit_id);
    meta[NODE_HISTORY_SIZE_RANGE].put_u16(node.history.len() as u16);
    let flags = if node.has_overflow() {
        NODE_FLAG_HAS_OVERFLOW
    } else {
        0
    };
    meta[NODE_FLAGS_RANGE].put_u16(flags);

    let mut offset = PAGE_INFO_SIZE + NODE_META_SIZE;
    for hn in &node.history {
        encode_history_node(hn, &mut buff[offset..offset + HISTORY_NODE_SIZE]);
        offset += HISTORY_NODE_SIZE;
    }

    let mut data_offset = page_size;
    for (i, n) in node.nodes.iter().enumerate() {
        let inline = n.value.inline_len();
        data_offset -= NODE_HEADER_SIZE + n.key.len() + inline;
        buff[offset + i * NODE_INDEX_SIZE..].put_u16(data_offset as u16);

        let data = &mut buff[data_offset..];
        data[NODE_HEADER_KEY_SIZE_RANGE].put_u16(n.key.len() as u16);
        let (flags, context) = match &n.value {
            NodeValue::Inline(value) => (0, value.len() as u32),
            NodeValue::Overflow(pgid) => (NODE_FLAG_OVERFLOW, pgid.get()),
            NodeValue::Child(pgid) => (0, pgid.get()),
        };
        data[NODE_HEADER_FLAGS_RANGE].put_u16(flags);
        data[NODE_HEADER_CONTEXT_RANGE].put_u32(context);
        let key_start = NODE_HEADER_SIZE;
        data[key_start..key_start + n.key.len()].copy_from_slice(&n.key);
        if let NodeValue::Inline(value) = &n.value {
            let value_start = key_start + n.key.len();
            data[value_start..value_start + value.len()].copy_from_slice(value);
        }
    }

    Ok((header_size + lower, upper))
}

/// Reads the type and offsets and verifies the checksum. Returns the page
/// type, the stored number, and the offsets.
fn verify(expected: PageId, buff: &[u8]) -> anyhow::Result<(PageType, usize, usize)> {
    let page_size = buff.len();
    let corrupted = |reason: String| Error::corrupted(expected.get(), reason);

    if page_size < PAGE_INFO_SIZE {
        return Err(corrupted("page is truncated".into()).into());
    }
    let raw_type = buff[PAGE_INFO_TYPE_RANGE].read_u32();
    let Some(kind) = PageType::from_u32(raw_type) else {
        return Err(corrupted(format!("unknown page type {raw_type}")).into());
    };
    let upper = buff[PAGE_INFO_UPPER_RANGE].read_u16() as usize;
    let lower = buff[PAGE_INFO_LOWER_RANGE].read_u16() as usize;

    let fixed = match kind {
        PageType::Spec => PAGE_INFO_SIZE + SPEC_META_SIZE,
        PageType::Marker => PAGE_INFO_SIZE + MARKER_META_SIZE,
        PageType::Overflow => PAGE_INFO_SIZE + OVERFLOW_META_SIZE,
        PageType::Branch | PageType::Leaf => {
            if page_size < PAGE_INFO_SIZE + NODE_META_SIZE {
                return Err(corrupted("page is truncated".into()).into());
            }
            let meta = &buff[PAGE_INFO_SIZE..PAGE_INFO_SIZE + NODE_META_SIZE];
            let history = meta[NODE_HISTORY_SIZE_RANGE].read_u16() as usize;
            PAGE_INFO_SIZE + NODE_META_SIZE + history * HISTORY_NODE_SIZE
        }
    };
    if fixed + lower + upper > page_size {
        return Err(corrupted(format!(
            "offsets exceed page: header={fixed} lower={lower} upper={upper}"
        ))
        .into());
    }

    let stored = buff[PAGE_INFO_CHECKSUM_RANGE].read_u32();
    let computed = checksum(buff, fixed + lower, upper);
    if stored != computed {
        return Err(corrupted(format!(
            "checksum mismatch, stored={stored:#x} computed={computed:#x}"
        ))
        .into());
    }

    let number = buff[PAGE_INFO_NUMBER_RANGE].read_u32();
    if number != expected.get() {
        return Err(corrupted(format!(
            "page is written with invalid page number {number}"
        ))
        .into());
    }

    Ok((kind, upper, lower))
}

/// Decodes a page read from slot `expected`. Checksum or number mismatches
/// are reported as `Error::Corrupted`.
pub(crate) fn decode(expected: PageId, buff: &[u8]) -> anyhow::Result<Page> {
    let (kind, upper, lower) = verify(expected, buff)?;
    let corrupted = |reason: &str| Error::corrupted(expected.get(), reason);

    let page = match kind {
        PageType::Spec => {
            let meta = &buff[PAGE_INFO_SIZE..PAGE_INFO_SIZE + SPEC_META_SIZE];
            if &meta[SPEC_MAGIC_RANGE] != MAGIC {
                return Err(corrupted("the file is not an hbtree store").into());
            }
            let version = meta[SPEC_VERSION_RANGE].read_u32();
            if version != VERSION {
                return Err(anyhow!("store version {version} is not supported"));
            }
            Page::Spec(SpecPage {
                page_size: meta[SPEC_PAGE_SIZE_RANGE].read_u32(),
                key_size: meta[SPEC_KEY_SIZE_RANGE].read_u32(),
                overflow_threshold: meta[SPEC_OVERFLOW_THRESHOLD_RANGE].read_u32(),
                fill_threshold: meta[SPEC_FILL_THRESHOLD_RANGE].read_u32(),
            })
        }
        PageType::Marker => {
            let front = PAGE_INFO_SIZE + MARKER_META_SIZE;
            let meta = &buff[PAGE_INFO_SIZE..front];
            let flags = meta[MARKER_FLAGS_RANGE].read_u32();
            let chain = PageId::from_be_bytes(meta[MARKER_CHAIN_RANGE].try_into()?);
            let on_overflow = flags & MARKER_FLAG_DATA_ON_OVERFLOW != 0;
            if on_overflow && chain.is_none() {
                return Err(corrupted("marker payload chain is missing").into());
            }
            let payload = if on_overflow {
                MarkerPayload::default()
            } else {
                MarkerPayload::decode(&buff[front..front + lower])?
            };
            Page::Marker(MarkerPage {
                number: expected,
                root: PageId::from_be_bytes(meta[MARKER_ROOT_RANGE].try_into()?),
                revision: meta[MARKER_REVISION_RANGE].read_u32(),
                sync_id: meta[MARKER_SYNC_ID_RANGE].read_u32(),
                tag: meta[MARKER_TAG_RANGE].read_u64(),
                size: meta[MARKER_SIZE_RANGE].read_u64(),
                chain: if on_overflow { chain } else { None },
                payload,
            })
        }
        PageType::Overflow => {
            let front = PAGE_INFO_SIZE + OVERFLOW_META_SIZE;
            let meta = &buff[PAGE_INFO_SIZE..front];
            Page::Overflow(OverflowPage {
                number: expected,
                next: PageId::from_be_bytes(meta[OVERFLOW_NEXT_RANGE].try_into()?),
                data: buff[front..front + lower].to_vec(),
            })
        }
        PageType::Branch | PageType::Leaf => {
            let node_kind = if kind == PageType::Branch {
                NodeKind::Branch
            } else {
                NodeKind::Leaf
            };
            Page::Node(decode_node(expected, node_kind, buff, upper, lower)?)
        }
    };

    log::trace!("decode page pgid={expected:?} kind={kind:?}");
    Ok(page)
}

fn decode_node(
    number: PageId,
    kind: NodeKind,
    buff: &[u8],
    upper: usize,
    lower: usize,
) -> anyhow::Result<NodePage> {
    let page_size = buff.len();
    let corrupted = |reason: String| Error::corrupted(number.get(), reason);

    let meta = &buff[PAGE_INFO_SIZE..PAGE_INFO_SIZE + NODE_META_SIZE];
    let history_size = meta[NODE_HISTORY_SIZE_RANGE].read_u16() as usize;
    let mut offset = PAGE_INFO_SIZE + NODE_META_SIZE;
    let mut history = Vec::with_capacity(history_size);
    for _ in 0..history_size {
        history.push(decode_history_node(&buff[offset..offset + HISTORY_NODE_SIZE])?);
        offset += HISTORY_NODE_SIZE;
    }

    if lower % NODE_INDEX_SIZE != 0 {
        return Err(corrupted(format!("odd index area size {lower}")).into());
    }
    let count = lower / NODE_INDEX_SIZE;
    let data_start = page_size - upper;
    let mut nodes = Vec::with_capacity(count);
    let mut data_size = 0;
    for i in 0..count {
        let node_offset = buff[offset + i * NODE_INDEX_SIZE..].read_u16() as usize;
        if node_offset < data_start || node_offset + NODE_HEADER_SIZE > page_size {
            return Err(corrupted(format!("node {i} at offset {node_offset} is out of range")).into());
        }
        let header = &buff[node_offset..node_offset + NODE_HEADER_SIZE];
        let key_size = header[NODE_HEADER_KEY_SIZE_RANGE].read_u16() as usize;
        let flags = header[NODE_HEADER_FLAGS_RANGE].read_u16();
        let context = header[NODE_HEADER_CONTEXT_RANGE].read_u32();

        let key_start = node_offset + NODE_HEADER_SIZE;
        if key_start + key_size > page_size {
            return Err(corrupted(format!("key of node {i} is out of range")).into());
        }
        let key = buff[key_start..key_start + key_size].to_vec();

        let value = match kind {
            NodeKind::Branch => {
                let Some(child) = PageId::new(context) else {
                    return Err(corrupted(format!("branch node {i} has no child")).into());
                };
                NodeValue::Child(child)
            }
            NodeKind::Leaf if flags & NODE_FLAG_OVERFLOW != 0 => {
                let Some(pgid) = PageId::new(context) else {
                    return Err(corrupted(format!("leaf node {i} has no overflow page")).into());
                };
                NodeValue::Overflow(pgid)
            }
            NodeKind::Leaf => {
                let value_start = key_start + key_size;
                let value_size = context as usize;
                if value_start + value_size > page_size {
                    return Err(corrupted(format!("value of node {i} is out of range")).into());
                }
                NodeValue::Inline(buff[value_start..value_start + value_size].to_vec())
            }
        };
        let node = Node { key, value };
        data_size += node.size() - NODE_INDEX_SIZE;
        nodes.push(node);
    }

    if data_size != upper {
        return Err(corrupted(format!(
            "node data takes {data_size} bytes but upper offset is {upper}"
        ))
        .into());
    }

    Ok(NodePage {
        number,
        kind,
        page_size,
        sync_id: meta[NODE_SYNC_ID_RANGE].read_u32(),
        commit_id: meta[NODE_COMMIT_ID_RANGE].read_u32(),
        history,
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgid(n: u32) -> PageId {
        PageId::new(n).unwrap()
    }

    fn sample_leaf() -> NodePage {
        let mut page = NodePage::new(pgid(7), NodeKind::Leaf, 4096);
        page.sync_id = 3;
        page.commit_id = 11;
        page.history.push(HistoryNode {
            page: pgid(5),
            sync_id: 2,
            commit_id: 10,
        });
        page.nodes.push(Node {
            key: b"alpha".to_vec(),
            value: NodeValue::Inline(b"one".to_vec()),
        });
        page.nodes.push(Node {
            key: b"beta".to_vec(),
            value: NodeValue::Overflow(pgid(9)),
        });
        page
    }

    #[test]
    fn test_node_page_codec() {
        let page = sample_leaf();
        let mut buff = vec![0u8; 4096];
        encode(&Page::Node(page.clone()), &mut buff).unwrap();

        let decoded = decode(pgid(7), &buff).unwrap();
        let decoded = decoded.as_node().unwrap();
        assert_eq!(page.nodes, decoded.nodes);
        assert_eq!(page.history, decoded.history);
        assert_eq!(3, decoded.sync_id);
        assert_eq!(11, decoded.commit_id);
        assert!(decoded.has_overflow());
        assert_eq!(page.used() + page.header_size() + page.space_left(), 4096);
    }

    #[test]
    fn test_checksum_skips_slack() {
        let page = sample_leaf();
        let mut buff = vec![0u8; 4096];
        encode(&Page::Node(page.clone()), &mut buff).unwrap();

        // the middle of the page is neither header, index nor node data
        buff[2048] ^= 0xff;
        assert!(decode(pgid(7), &buff).is_ok());

        buff[4095] ^= 0xff;
        let err = decode(pgid(7), &buff).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Corrupted { page: 7, .. })
        ));
    }

    #[test]
    fn test_wrong_page_number() {
        let mut buff = vec![0u8; 4096];
        encode(&Page::Node(sample_leaf()), &mut buff).unwrap();
        let err = decode(pgid(8), &buff).unwrap_err();
        assert!(err.to_string().contains("invalid page number 7"));
    }

    #[test]
    fn test_zeroed_page_is_corrupted() {
        let buff = vec![0u8; 4096];
        assert!(decode(pgid(3), &buff).is_err());
    }

    #[test]
    fn test_marker_inline_and_chained() {
        let payload = MarkerPayload {
            pool: vec![pgid(4), pgid(6)],
            residue: vec![HistoryNode {
                page: pgid(8),
                sync_id: 0,
                commit_id: 2,
            }],
        };
        let mut marker = MarkerPage {
            number: pgid(1),
            root: Some(pgid(3)),
            revision: 12,
            sync_id: 5,
            tag: 999,
            size: 4096 * 10,
            chain: None,
            payload: payload.clone(),
        };
        let mut buff = vec![0u8; 4096];
        encode(&Page::Marker(marker.clone()), &mut buff).unwrap();
        let Page::Marker(decoded) = decode(pgid(1), &buff).unwrap() else {
            panic!("expected a marker page");
        };
        assert_eq!(Some(pgid(3)), decoded.root);
        assert_eq!(999, decoded.tag);
        assert_eq!(payload, decoded.payload);

        marker.chain = Some(pgid(20));
        encode(&Page::Marker(marker), &mut buff).unwrap();
        let Page::Marker(decoded) = decode(pgid(1), &buff).unwrap() else {
            panic!("expected a marker page");
        };
        assert_eq!(Some(pgid(20)), decoded.chain);
        assert!(decoded.payload.pool.is_empty());
        assert_eq!(payload, MarkerPayload::decode(&payload.encode()).unwrap());
    }

    #[test]
    fn test_spec_page_codec() {
        let spec = SpecPage {
            page_size: 4096,
            key_size: 512,
            overflow_threshold: 25,
            fill_threshold: 40,
        };
        let mut buff = vec![0u8; 4096];
        encode(&Page::Spec(spec.clone()), &mut buff).unwrap();
        let Page::Spec(decoded) = decode(PageId::SPEC, &buff).unwrap() else {
            panic!("expected a spec page");
        };
        assert_eq!(spec, decoded);

        // every setting is covered by the checksum
        buff[PAGE_INFO_SIZE + SPEC_FILL_THRESHOLD_RANGE.start] ^= 0xff;
        assert!(decode(PageId::SPEC, &buff).is_err());
    }

    #[test]
    fn test_make_room_spills_history() {
        let mut page = NodePage::new(pgid(3), NodeKind::Leaf, 4096);
        for i in 0..300 {
            page.history.push(HistoryNode {
                page: pgid(100 + i),
                sync_id: 1,
                commit_id: 1,
            });
        }
        let mut spill = Vec::new();
        let needed = space_needed(100, 400);
        assert!(page.space_left() < needed);
        page.make_room(needed, &mut spill);
        assert!(page.space_left() >= needed);
        assert_eq!(300, page.history.len() + spill.len());
        assert_eq!(100, spill[0].page.get());
    }
}
