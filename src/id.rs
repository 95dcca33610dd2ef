use std::fmt;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct PageId(u32);

impl PageId {
    pub(crate) const SPEC: PageId = PageId(0);
    pub(crate) const FIRST_TREE_PAGE: u32 = 3;

    const INVALID: u32 = u32::MAX;

    #[inline]
    pub(crate) fn new(id: u32) -> Option<Self> {
        if id == Self::INVALID {
            None
        } else {
            Some(Self(id))
        }
    }

    #[inline]
    pub(crate) fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn from_be_bytes(pgid: [u8; 4]) -> Option<Self> {
        Self::new(u32::from_be_bytes(pgid))
    }

    /// Marker slot page for the given sync generation. Generations alternate
    /// between page 1 (odd) and page 2 (even).
    #[inline]
    pub(crate) fn marker_slot(sync_id: u32) -> Self {
        if sync_id % 2 == 1 {
            Self(1)
        } else {
            Self(2)
        }
    }

    #[inline]
    pub(crate) fn is_reserved(self) -> bool {
        self.0 < Self::FIRST_TREE_PAGE
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) trait PageIdExt {
    fn to_be_bytes(&self) -> [u8; 4];
}

impl PageIdExt for PageId {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl PageIdExt for Option<PageId> {
    #[inline]
    fn to_be_bytes(&self) -> [u8; 4] {
        if let Some(pgid) = self {
            pgid.to_be_bytes()
        } else {
            PageId::INVALID.to_be_bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_page_roundtrip() {
        let none: Option<PageId> = None;
        assert_eq!(None, PageId::from_be_bytes(none.to_be_bytes()));
        let some = PageId::new(42);
        assert_eq!(some, PageId::from_be_bytes(some.to_be_bytes()));
        assert!(PageId::new(u32::MAX).is_none());
    }

    #[test]
    fn test_marker_slots_alternate() {
        assert_eq!(1, PageId::marker_slot(1).get());
        assert_eq!(2, PageId::marker_slot(2).get());
        assert_eq!(1, PageId::marker_slot(3).get());
        assert!(PageId::marker_slot(7).is_reserved());
        assert!(!PageId::new(3).unwrap().is_reserved());
    }
}
