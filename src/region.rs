//! Byte-range views and RVA↔file-offset translation.
//!
//! An `Image` is just `&[u8]`: Rust slices already give bounds-checked
//! contiguous access without hand-rolled pointer arithmetic. What remains is
//! the per-format mapping between a "relative virtual address"
//! (section-relative, as referenced by code) and a flat file offset (as used
//! by every other component in this crate).

use anyhow::{ensure, Result};

/// A contiguous byte view into an old/new file, or into an embedded element
/// of one. All offsets handed to disassemblers/reference holders/encoded
/// views are relative to the start of an `Image`.
pub type Image<'a> = &'a [u8];

/// One mapped section/segment: its RVA range and the file offset its first
/// byte lives at. Used by both the PE and ELF translators, which differ only
/// in how they populate this table from their respective header formats.
#[derive(Debug, Clone, Copy)]
pub struct SectionMapping {
    pub rva_begin: u32,
    pub rva_end: u32,
    pub file_offset: u32,
}

impl SectionMapping {
    fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.rva_begin && rva < self.rva_end
    }

    fn contains_offset(&self, offset: u32) -> bool {
        let len = self.rva_end - self.rva_begin;
        offset >= self.file_offset && offset < self.file_offset + len
    }
}

/// Format-aware RVA↔file-offset translator, built from a format's section or
/// program-header table. PE and ELF disassemblers each build one of these
/// from their own header representation; DEX and the no-op disassembler use
/// the identity translator since DEX addressing is already offset-based.
#[derive(Debug, Clone, Default)]
pub struct AddressTranslator {
    mappings: Vec<SectionMapping>,
}

impl AddressTranslator {
    pub fn new(mappings: Vec<SectionMapping>) -> Self {
        AddressTranslator { mappings }
    }

    /// Identity translator: RVA and file offset coincide (DEX, no-op).
    pub fn identity() -> Self {
        AddressTranslator { mappings: vec![] }
    }

    fn is_identity(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn rva_to_offset(&self, rva: u32) -> Result<u32> {
        if self.is_identity() {
            return Ok(rva);
        }
        for m in &self.mappings {
            if m.contains_rva(rva) {
                return Ok(m.file_offset + (rva - m.rva_begin));
            }
        }
        Err(anyhow::anyhow!("rva_to_offset: {rva:#x} is not mapped by any section"))
    }

    pub fn offset_to_rva(&self, offset: u32) -> Result<u32> {
        if self.is_identity() {
            return Ok(offset);
        }
        for m in &self.mappings {
            if m.contains_offset(offset) {
                return Ok(m.rva_begin + (offset - m.file_offset));
            }
        }
        Err(anyhow::anyhow!(
            "offset_to_rva: {offset:#x} is not mapped by any section"
        ))
    }
}

/// Validates that `[offset, offset+len)` lies within an image of size
/// `image_len`, rejecting both out-of-bounds ranges and `offset+len`
/// overflow. Used throughout the disassemblers to reject malformed headers.
pub fn check_range(offset: u64, len: u64, image_len: u64) -> Result<()> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| anyhow::anyhow!("range {offset:#x}+{len:#x} overflows"))?;
    ensure!(end <= image_len, "range {offset:#x}+{len:#x} exceeds image size {image_len:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> AddressTranslator {
        AddressTranslator::new(vec![
            SectionMapping { rva_begin: 0x1000, rva_end: 0x2000, file_offset: 0x400 },
            SectionMapping { rva_begin: 0x2000, rva_end: 0x3000, file_offset: 0x1400 },
        ])
    }

    #[test]
    fn translates_rva_to_offset_and_back() {
        let t = translator();
        assert_eq!(t.rva_to_offset(0x1010).unwrap(), 0x410);
        assert_eq!(t.offset_to_rva(0x410).unwrap(), 0x1010);
        assert_eq!(t.rva_to_offset(0x2010).unwrap(), 0x1410);
    }

    #[test]
    fn rejects_unmapped_rva() {
        let t = translator();
        assert!(t.rva_to_offset(0x5000).is_err());
    }

    #[test]
    fn identity_translator_passes_through() {
        let t = AddressTranslator::identity();
        assert_eq!(t.rva_to_offset(0x1234).unwrap(), 0x1234);
        assert_eq!(t.offset_to_rva(0x1234).unwrap(), 0x1234);
    }

    #[test]
    fn check_range_rejects_overflow_and_oob() {
        assert!(check_range(10, 5, 20).is_ok());
        assert!(check_range(18, 5, 20).is_err());
        assert!(check_range(u64::MAX - 1, 5, u64::MAX).is_err());
    }
}
