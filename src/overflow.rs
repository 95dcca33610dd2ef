use crate::error::Error;
use crate::id::PageId;
use crate::page::{overflow_capacity, OverflowPage};
use crate::pager::Pager;
use std::collections::HashSet;

/// Number of overflow pages a value of `len` bytes takes.
pub(crate) fn pages_needed(len: usize, page_size: usize) -> usize {
    len.div_ceil(overflow_capacity(page_size)).max(1)
}

/// Splits `data` over the given page numbers, linking each page to the next.
/// `pages` must hold exactly `pages_needed(data.len())` numbers.
pub(crate) fn build(pages: &[PageId], data: &[u8], page_size: usize) -> Vec<OverflowPage> {
    let capacity = overflow_capacity(page_size);
    debug_assert_eq!(pages.len(), pages_needed(data.len(), page_size));

    let mut chunks = data.chunks(capacity);
    pages
        .iter()
        .enumerate()
        .map(|(i, &number)| OverflowPage {
            number,
            next: pages.get(i + 1).copied(),
            data: chunks.next().unwrap_or_default().to_vec(),
        })
        .collect()
}

/// Reassembles the value stored in the chain starting at `first`.
pub(crate) fn read(pager: &mut Pager, first: PageId) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::new();
    walk(pager, first, |page| data.extend_from_slice(&page.data))?;
    Ok(data)
}

/// Page numbers of the chain starting at `first`, in chain order.
pub(crate) fn pages(pager: &mut Pager, first: PageId) -> anyhow::Result<Vec<PageId>> {
    let mut result = Vec::new();
    walk(pager, first, |page| result.push(page.number))?;
    Ok(result)
}

fn walk(
    pager: &mut Pager,
    first: PageId,
    mut f: impl FnMut(&OverflowPage),
) -> anyhow::Result<()> {
    let mut visited = HashSet::new();
    let mut next = Some(first);
    while let Some(pgid) = next {
        if !visited.insert(pgid) {
            return Err(Error::corrupted(pgid.get(), "overflow chain loops back").into());
        }
        let page = pager.read_overflow(pgid)?;
        let Some(page) = page.as_overflow() else {
            return Err(Error::corrupted(pgid.get(), "expected an overflow page").into());
        };
        f(page);
        next = page.next;
    }
    Ok(())
}
