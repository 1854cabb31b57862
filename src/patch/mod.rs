//! Patch container format, generation, and application.

pub mod applicator;
pub mod format;
pub mod generator;

use crate::disassembler::{dex, elf, no_op, pe, Disassembler, ExeType};
use anyhow::{anyhow, Result};

/// Builds the disassembler matching an already-known `exe_type` over a
/// sub-image (an ensemble element's byte range). Used by both the generator
/// and the applicator, which always know the type up front (detected once by
/// ensemble matching, carried through the patch rather than re-detected).
pub(crate) fn make_disassembler(exe_type: ExeType, image: &[u8]) -> Result<Box<dyn Disassembler + '_>> {
    match exe_type {
        ExeType::NoOp => Ok(Box::new(no_op::DisassemblerNoOp::new(image))),
        ExeType::Win32X86 => pe::DisassemblerWin32::parse(image, pe::Bitness::X86)
            .map(|d| Box::new(d) as Box<dyn Disassembler + '_>)
            .ok_or_else(|| anyhow!("failed to parse PE32 element")),
        ExeType::Win32X64 => pe::DisassemblerWin32::parse(image, pe::Bitness::X64)
            .map(|d| Box::new(d) as Box<dyn Disassembler + '_>)
            .ok_or_else(|| anyhow!("failed to parse PE32+ element")),
        ExeType::ElfX86 | ExeType::ElfArm32 | ExeType::ElfAArch64 => elf::DisassemblerElf::parse(image)
            .map(|d| Box::new(d) as Box<dyn Disassembler + '_>)
            .ok_or_else(|| anyhow!("failed to parse ELF element")),
        ExeType::Dex => dex::DisassemblerDex::parse(image)
            .map(|d| Box::new(d) as Box<dyn Disassembler + '_>)
            .ok_or_else(|| anyhow!("failed to parse DEX element")),
    }
}

/// Encodes a label table's entries as a count followed by wrapping deltas
/// against a running value. Wrapping arithmetic means `UNUSED_INDEX` holes
/// round-trip exactly even though they are nowhere near the running value.
pub(crate) fn write_element_labels(stream: &mut crate::stream::SinkStream, labels: &[crate::model::Offset]) {
    stream.write_varint_u32(labels.len() as u32);
    let mut current: u32 = 0;
    for &v in labels {
        stream.write_varint_u32(v.wrapping_sub(current));
        current = v;
    }
}

pub(crate) fn read_element_labels(stream: &mut crate::stream::SourceStream) -> Result<Vec<crate::model::Offset>> {
    let count = stream.read_varint_u32()?;
    let mut current: u32 = 0;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let delta = stream.read_varint_u32()?;
        current = current.wrapping_add(delta);
        out.push(current);
    }
    Ok(out)
}
