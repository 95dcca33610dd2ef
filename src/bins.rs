pub(crate) trait SliceExt {
    fn read_u16(&self) -> u16;
    fn read_u32(&self) -> u32;
    fn read_u64(&self) -> u64;
}

// Callers check lengths before reading; page buffers are always page-sized.
impl SliceExt for [u8] {
    fn read_u16(&self) -> u16 {
        let mut b = [0u8; 2];
        b.copy_from_slice(&self[..2]);
        u16::from_be_bytes(b)
    }
    fn read_u32(&self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self[..4]);
        u32::from_be_bytes(b)
    }
    fn read_u64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self[..8]);
        u64::from_be_bytes(b)
    }
}

pub(crate) trait SliceMutExt {
    fn put_u16(&mut self, v: u16);
    fn put_u32(&mut self, v: u32);
    fn put_u64(&mut self, v: u64);
}

impl SliceMutExt for [u8] {
    fn put_u16(&mut self, v: u16) {
        self[..2].copy_from_slice(&v.to_be_bytes());
    }
    fn put_u32(&mut self, v: u32) {
        self[..4].copy_from_slice(&v.to_be_bytes());
    }
    fn put_u64(&mut self, v: u64) {
        self[..8].copy_from_slice(&v.to_be_bytes());
    }
}
