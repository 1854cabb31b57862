//! Wire layout constants: stream IDs, patch type tag, and the fixed header
//! every patch starts with.

use crate::crc32::crc32;
use crate::stream::{SinkStream, SourceStream};
use anyhow::{ensure, Result};

/// Stream IDs multiplexed into a [`crate::stream::SinkStreamSet`]/
/// [`crate::stream::SourceStreamSet`]. Label pool streams start at
/// [`PatchField::LABELS`] and run one per pool (`LABELS + pool`).
pub mod patch_field {
    pub const COMMAND: usize = 0;
    pub const SRC_SKIP: usize = 1;
    pub const DST_SKIP: usize = 2;
    pub const COPY_COUNT: usize = 3;
    pub const EXTRA_DATA: usize = 4;
    pub const RAW_DELTA_SKIP: usize = 5;
    pub const RAW_DELTA_DIFF: usize = 6;
    pub const REFERENCE_DELTA: usize = 7;
    pub const LABELS: usize = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    Raw = 0,
    Single = 1,
    Ensemble = 2,
}

impl PatchType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(PatchType::Raw),
            1 => Some(PatchType::Single),
            2 => Some(PatchType::Ensemble),
            _ => None,
        }
    }
}

/// `'Z' | ('u' << 8) | ('c' << 16)`, written/read as a VarInt like every other
/// header field (the patch format has no fixed-width preamble: everything
/// rides the same stream-set framing).
pub const MAGIC: u32 = b'Z' as u32 | (b'u' as u32) << 8 | (b'c' as u32) << 16;

#[derive(Debug, Clone, Copy)]
pub struct ZucchiniHeader {
    pub old_size: u32,
    pub old_crc: u32,
    pub new_size: u32,
    pub new_crc: u32,
}

impl ZucchiniHeader {
    pub fn compute(old_image: &[u8], new_image: &[u8]) -> Self {
        ZucchiniHeader {
            old_size: old_image.len() as u32,
            old_crc: crc32(old_image),
            new_size: new_image.len() as u32,
            new_crc: crc32(new_image),
        }
    }

    pub fn write(&self, out: &mut SinkStream) {
        out.write_varint_u32(MAGIC);
        out.write_varint_u32(self.old_size);
        out.write_varint_u32(self.old_crc);
        out.write_varint_u32(self.new_size);
        out.write_varint_u32(self.new_crc);
    }

    pub fn read(src: &mut SourceStream) -> Result<Self> {
        let magic = src.read_varint_u32()?;
        ensure!(magic == MAGIC, "not a zucchini patch (bad magic)");
        Ok(ZucchiniHeader {
            old_size: src.read_varint_u32()?,
            old_crc: src.read_varint_u32()?,
            new_size: src.read_varint_u32()?,
            new_crc: src.read_varint_u32()?,
        })
    }

    /// Verifies `old_image`/`new_image` (when available) against this
    /// header's recorded size/CRC.
    pub fn verify_old(&self, old_image: &[u8]) -> Result<()> {
        ensure!(old_image.len() as u32 == self.old_size, "old image size mismatch");
        ensure!(crc32(old_image) == self.old_crc, "old image CRC mismatch");
        Ok(())
    }

    pub fn verify_new(&self, new_image: &[u8]) -> Result<()> {
        ensure!(new_image.len() as u32 == self.new_size, "new image size mismatch");
        ensure!(crc32(new_image) == self.new_crc, "new image CRC mismatch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips() {
        let old = b"old image bytes".to_vec();
        let new = b"new image bytes, a bit longer".to_vec();
        let header = ZucchiniHeader::compute(&old, &new);

        let mut sink = SinkStream::new();
        header.write(&mut sink);
        let mut src = SourceStream::new(sink.bytes());
        let read_back = ZucchiniHeader::read(&mut src).unwrap();

        assert_eq!(read_back.old_size, old.len() as u32);
        assert_eq!(read_back.new_size, new.len() as u32);
        read_back.verify_old(&old).unwrap();
        read_back.verify_new(&new).unwrap();
    }

    #[test]
    fn rejects_bad_magic() {
        let mut sink = SinkStream::new();
        sink.write_varint_u32(0xDEAD_BEEF);
        let mut src = SourceStream::new(sink.bytes());
        assert!(ZucchiniHeader::read(&mut src).is_err());
    }

    #[test]
    fn verify_catches_crc_mismatch() {
        let old = b"hello".to_vec();
        let new = b"world!".to_vec();
        let header = ZucchiniHeader::compute(&old, &new);
        assert!(header.verify_old(b"hellX").is_err());
    }
}
