//! Format detection and reference parsing.
//!
//! Every concrete disassembler implements [`Disassembler`] over an in-memory
//! image slice. `parse` may shrink the image to the portion it recognizes
//! (trailing garbage past the last section/segment is dropped); callers must
//! use the (possibly-shrunk) slice returned by [`Disassembler::image`] rather
//! than the original buffer from that point on.

pub mod arm;
pub mod dex;
pub mod elf;
pub mod no_op;
pub mod pe;
pub mod rel32;

use crate::model::{Reference, ReferenceTraits, ReferenceType};
use crate::reference_holder::ReferenceHolder;
use crate::region::AddressTranslator;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Format+architecture discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ExeType {
    NoOp = 0,
    Win32X86 = 1,
    Win32X64 = 2,
    ElfX86 = 3,
    ElfArm32 = 4,
    ElfAArch64 = 5,
    Dex = 6,
}

impl ExeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExeType::NoOp => "no-op",
            ExeType::Win32X86 => "Windows PE x86",
            ExeType::Win32X64 => "Windows PE x64",
            ExeType::ElfX86 => "ELF x86",
            ExeType::ElfArm32 => "ELF ARM32",
            ExeType::ElfAArch64 => "ELF AArch64",
            ExeType::Dex => "DEX",
        }
    }
}

/// A parsed image: format detection, reference extraction, and reference
/// write-back, plus address translation.
pub trait Disassembler {
    fn exe_type(&self) -> ExeType;

    /// The (possibly shrunk-to-detected-length) image this disassembler
    /// parsed.
    fn image(&self) -> &[u8];

    fn num_reference_types(&self) -> u8;

    fn reference_traits(&self, ty: ReferenceType) -> ReferenceTraits;

    /// All references of `ty` whose `location` falls in `[lower, upper)`,
    /// ascending by location.
    fn find(&mut self, ty: ReferenceType, lower: u32, upper: u32) -> Vec<Reference>;

    fn translator(&self) -> &AddressTranslator;

    /// Populates a [`ReferenceHolder`] by calling `find` once per type over
    /// the whole image. Disassemblers with a trivial 1:1 traits-index-to-type
    /// mapping can rely on this default.
    fn build_reference_holder(&mut self) -> ReferenceHolder {
        let mut holder = ReferenceHolder::new();
        let len = self.image().len() as u32;
        for ty in 0..self.num_reference_types() {
            let traits = self.reference_traits(ty);
            let refs = self.find(ty, 0, len);
            holder.insert(traits, refs);
        }
        holder
    }
}

/// Runs quick-detect for every known format in priority order, then
/// full-parses the first match (retrying subsequent candidates if full parse
/// or the minimum-size check fails), falling back to the no-op disassembler.
pub fn detect_and_parse(image: &[u8]) -> Box<dyn Disassembler + '_> {
    if image.len() >= 16 {
        if pe::quick_detect_x86(image) {
            if let Some(d) = pe::DisassemblerWin32::parse(image, pe::Bitness::X86) {
                return Box::new(d);
            }
        }
        if pe::quick_detect_x64(image) {
            if let Some(d) = pe::DisassemblerWin32::parse(image, pe::Bitness::X64) {
                return Box::new(d);
            }
        }
        if elf::quick_detect(image) {
            if let Some(d) = elf::DisassemblerElf::parse(image) {
                return Box::new(d);
            }
        }
        if dex::quick_detect(image) {
            if let Some(d) = dex::DisassemblerDex::parse(image) {
                return Box::new(d);
            }
        }
    }
    Box::new(no_op::DisassemblerNoOp::new(image))
}

/// Quick-detect only, for ensemble scanning: returns the detected type and
/// the number of bytes it claims, without doing a full parse.
pub fn quick_detect(image: &[u8]) -> Option<(ExeType, usize)> {
    if image.len() < 16 {
        return None;
    }
    if pe::quick_detect_x86(image) {
        return Some((ExeType::Win32X86, pe::DisassemblerWin32::detected_length(image, pe::Bitness::X86)?));
    }
    if pe::quick_detect_x64(image) {
        return Some((ExeType::Win32X64, pe::DisassemblerWin32::detected_length(image, pe::Bitness::X64)?));
    }
    if elf::quick_detect(image) {
        return Some((elf::detected_exe_type(image)?, elf::detected_length(image)?));
    }
    if dex::quick_detect(image) {
        return Some((ExeType::Dex, dex::detected_length(image)?));
    }
    None
}
