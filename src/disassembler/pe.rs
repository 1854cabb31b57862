//! PE32/PE32+ disassembler.

use super::rel32::{self, Candidate};
use super::{Disassembler, ExeType};
use crate::diagnostics::RateLimitedLog;
use crate::model::{is_marked, Reference, ReferenceTraits, ReferenceType};
use crate::region::{check_range, AddressTranslator, SectionMapping};
use anyhow::Result;
use serde::Deserialize;

static MARK_ALIASED_TARGETS: RateLimitedLog = RateLimitedLog::new(10);

const OFFSET_OF_NEW_EXE_HEADER: usize = 0x3C;
const INDEX_OF_BASE_RELOCATION_TABLE: usize = 5;
const CODE_CHARACTERISTICS: u32 = 0x0000_0020 | 0x2000_0000; // CNT_CODE | MEM_EXECUTE

pub const RELOC: ReferenceType = 0;
pub const ABS32: ReferenceType = 1;
pub const REL32: ReferenceType = 2;
const TYPE_COUNT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitness {
    X86,
    X64,
}

impl Bitness {
    fn magic(self) -> u16 {
        match self {
            Bitness::X86 => 0x10b,
            Bitness::X64 => 0x20b,
        }
    }
    fn reloc_type(self) -> u16 {
        match self {
            Bitness::X86 => 3,
            Bitness::X64 => 10,
        }
    }
    fn va_width(self) -> u32 {
        match self {
            Bitness::X86 => 4,
            Bitness::X64 => 8,
        }
    }
    pub fn exe_type(self) -> ExeType {
        match self {
            Bitness::X86 => ExeType::Win32X86,
            Bitness::X64 => ExeType::Win32X64,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct CoffHeader {
    machine: u16,
    number_of_sections: u16,
    time_date_stamp: u32,
    pointer_to_symbol_table: u32,
    number_of_symbols: u32,
    size_of_optional_header: u16,
    characteristics: u16,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct DataDirectory {
    virtual_address: u32,
    size: u32,
}

/// `IMAGE_OPTIONAL_HEADER{32,64}` field offsets relative to the optional
/// header's start, up through `NumberOfRvaAndSizes` (everything after that is
/// the data directory array). PE32 carries an extra `BaseOfData` field PE32+
/// drops, shifting every subsequent offset by 4.
struct OptionalHeaderLayout {
    image_base: usize,
    image_base_width: usize,
    size_of_image: usize,
    number_of_rva_and_sizes: usize,
    data_directory: usize,
}

const PE32_LAYOUT: OptionalHeaderLayout = OptionalHeaderLayout {
    image_base: 28,
    image_base_width: 4,
    size_of_image: 56,
    number_of_rva_and_sizes: 92,
    data_directory: 96,
};

const PE32_PLUS_LAYOUT: OptionalHeaderLayout = OptionalHeaderLayout {
    image_base: 24,
    image_base_width: 8,
    size_of_image: 56,
    number_of_rva_and_sizes: 108,
    data_directory: 112,
};

impl Bitness {
    fn layout(self) -> &'static OptionalHeaderLayout {
        match self {
            Bitness::X86 => &PE32_LAYOUT,
            Bitness::X64 => &PE32_PLUS_LAYOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct SectionHeaderRaw {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    pointer_to_linenumbers: u32,
    number_of_relocations: u16,
    number_of_linenumbers: u16,
    characteristics: u32,
}

#[derive(Debug, Clone, Copy)]
struct Section {
    virtual_address: u32,
    virtual_size: u32,
    file_offset: u32,
    size_of_raw_data: u32,
    characteristics: u32,
}

impl Section {
    fn is_code(&self) -> bool {
        (self.characteristics & CODE_CHARACTERISTICS) == CODE_CHARACTERISTICS
    }
}

fn read<'a, T: Deserialize<'a>>(image: &'a [u8], pos: usize, len: usize) -> Result<T> {
    check_range(pos as u64, len as u64, image.len() as u64)?;
    Ok(bincode::deserialize(&image[pos..pos + len])?)
}

struct Header {
    image_base: u64,
    size_of_image: u32,
    sections: Vec<Section>,
    base_relocation_table: DataDirectory,
    detected_length: usize,
}

fn parse_header(image: &[u8], bitness: Bitness) -> Option<Header> {
    if image.len() < 0x40 || &image[0..2] != b"MZ" {
        return None;
    }
    let pe_header_offset: u32 =
        u32::from_le_bytes(image[OFFSET_OF_NEW_EXE_HEADER..OFFSET_OF_NEW_EXE_HEADER + 4].try_into().ok()?);
    if pe_header_offset & 0x7 != 0 {
        return None;
    }
    let pe_header_offset = pe_header_offset as usize;
    if pe_header_offset + 4 > image.len() || &image[pe_header_offset..pe_header_offset + 4] != b"PE\0\0" {
        return None;
    }

    let coff_pos = pe_header_offset + 4;
    let coff: CoffHeader = read(image, coff_pos, 20).ok()?;
    let opt_pos = coff_pos + 20;
    let layout = bitness.layout();
    if (coff.size_of_optional_header as usize) < layout.data_directory {
        return None;
    }

    let magic = u16::from_le_bytes(image.get(opt_pos..opt_pos + 2)?.try_into().ok()?);
    if magic != bitness.magic() {
        return None;
    }

    let image_base: u64 = match bitness {
        Bitness::X86 => u32::from_le_bytes(
            image.get(opt_pos + layout.image_base..opt_pos + layout.image_base + 4)?.try_into().ok()?,
        ) as u64,
        Bitness::X64 => u64::from_le_bytes(
            image.get(opt_pos + layout.image_base..opt_pos + layout.image_base + 8)?.try_into().ok()?,
        ),
    };
    let _ = layout.image_base_width;

    let size_of_image = u32::from_le_bytes(
        image.get(opt_pos + layout.size_of_image..opt_pos + layout.size_of_image + 4)?.try_into().ok()?,
    );
    let number_of_rva_and_sizes = u32::from_le_bytes(
        image
            .get(opt_pos + layout.number_of_rva_and_sizes..opt_pos + layout.number_of_rva_and_sizes + 4)?
            .try_into()
            .ok()?,
    );

    let data_dir_pos = opt_pos + layout.data_directory;
    if INDEX_OF_BASE_RELOCATION_TABLE as u32 >= number_of_rva_and_sizes {
        return None;
    }
    let base_relocation_table: DataDirectory =
        read(image, data_dir_pos + INDEX_OF_BASE_RELOCATION_TABLE * 8, 8).ok()?;

    let sections_count = coff.number_of_sections as usize;
    let sections_pos = opt_pos + coff.size_of_optional_header as usize;
    let mut sections = Vec::with_capacity(sections_count);
    let mut detected_length: u32 = 0;
    let mut has_code_section = false;
    for i in 0..sections_count {
        let raw: SectionHeaderRaw = read(image, sections_pos + i * 40, 40).ok()?;
        check_range(raw.pointer_to_raw_data as u64, raw.size_of_raw_data as u64, image.len() as u64).ok()?;
        let section = Section {
            virtual_address: raw.virtual_address,
            virtual_size: raw.virtual_size,
            file_offset: raw.pointer_to_raw_data,
            size_of_raw_data: raw.size_of_raw_data,
            characteristics: raw.characteristics,
        };
        if section.is_code() {
            has_code_section = true;
        }
        detected_length = detected_length.max(section.file_offset + section.size_of_raw_data);
        sections.push(section);
    }
    if !has_code_section || detected_length as usize > image.len() {
        return None;
    }

    Some(Header {
        image_base,
        size_of_image,
        sections,
        base_relocation_table,
        detected_length: detected_length as usize,
    })
}

pub fn quick_detect_x86(image: &[u8]) -> bool {
    parse_header(image, Bitness::X86).is_some()
}

pub fn quick_detect_x64(image: &[u8]) -> bool {
    parse_header(image, Bitness::X64).is_some()
}

pub struct DisassemblerWin32<'a> {
    image: &'a [u8],
    bitness: Bitness,
    header: Header,
    translator: AddressTranslator,
    reloc_blocks: Vec<u32>,
    abs32_locations: Option<Vec<u32>>,
    rel32_locations: Option<Vec<u32>>,
}

impl<'a> DisassemblerWin32<'a> {
    pub fn parse(image: &'a [u8], bitness: Bitness) -> Option<Self> {
        let header = parse_header(image, bitness)?;
        let image = &image[..header.detected_length];
        let mappings = header
            .sections
            .iter()
            .map(|s| SectionMapping {
                rva_begin: s.virtual_address,
                rva_end: s.virtual_address + s.virtual_size.max(s.size_of_raw_data),
                file_offset: s.file_offset,
            })
            .collect();
        let translator = AddressTranslator::new(mappings);
        let mut d = DisassemblerWin32 {
            image,
            bitness,
            header,
            translator,
            reloc_blocks: Vec::new(),
            abs32_locations: None,
            rel32_locations: None,
        };
        d.parse_relocs();
        Some(d)
    }

    /// Used by ensemble quick-detect: how many bytes this format claims,
    /// without building the full disassembler.
    pub fn detected_length(image: &[u8], bitness: Bitness) -> Option<usize> {
        parse_header(image, bitness).map(|h| h.detected_length)
    }

    fn parse_relocs(&mut self) {
        if !self.reloc_blocks.is_empty() {
            return;
        }
        let relocs_size = self.header.base_relocation_table.size;
        if relocs_size == 0 {
            return;
        }
        let Ok(rva_offset) = self.translator.rva_to_offset(self.header.base_relocation_table.virtual_address)
        else {
            return;
        };
        let start = rva_offset as usize;
        let end = start + relocs_size as usize;
        if end > self.image.len() {
            return;
        }
        let mut block = start;
        while block + 8 < end {
            let size = u32::from_le_bytes(self.image[block + 4..block + 8].try_into().unwrap());
            if size < 8 || size & 0x3 != 0 {
                break;
            }
            let block_end = block + size as usize;
            if block_end <= block || block_end > self.image.len() {
                break;
            }
            self.reloc_blocks.push(block as u32);
            block = block_end;
        }
    }

    fn find_relocs(&self, lower: u32, upper: u32) -> Vec<Reference> {
        let mut out = Vec::new();
        if self.reloc_blocks.is_empty() {
            return out;
        }
        let reloc_type = self.bitness.reloc_type();
        for &block in &self.reloc_blocks {
            let block = block as usize;
            let page_rva = u32::from_le_bytes(self.image[block..block + 4].try_into().unwrap());
            let size = u32::from_le_bytes(self.image[block + 4..block + 8].try_into().unwrap());
            let end_entries = block + size as usize;
            let mut cursor = block + 8;
            while cursor + 2 <= end_entries && cursor + 2 <= self.image.len() {
                let entry = u16::from_le_bytes(self.image[cursor..cursor + 2].try_into().unwrap());
                let ty = entry >> 12;
                let page_offset = (entry & 0xFFF) as u32;
                if ty as u16 == reloc_type {
                    let rva = page_rva + page_offset;
                    if let Ok(target) = self.translator.rva_to_offset(rva) {
                        if (target as u64) + (self.bitness.va_width() as u64) <= self.image.len() as u64 {
                            let location = cursor as u32;
                            if location >= lower && location < upper {
                                out.push(Reference::new(location, target));
                            }
                        }
                    }
                }
                cursor += 2;
            }
        }
        out
    }

    fn get_abs32_locations(&mut self) -> &[u32] {
        if self.abs32_locations.is_none() {
            let mut locs: Vec<u32> =
                self.find_relocs(0, self.image.len() as u32).into_iter().map(|r| r.target).collect();
            locs.sort_unstable();
            self.abs32_locations = Some(locs);
        }
        self.abs32_locations.as_deref().unwrap()
    }

    fn find_abs32(&mut self, lower: u32, upper: u32) -> Vec<Reference> {
        let va_width = self.bitness.va_width() as usize;
        let image_base = self.header.image_base;
        let bitness = self.bitness;
        let translator = self.translator.clone();
        let locations: Vec<u32> =
            self.get_abs32_locations().iter().copied().filter(|&l| l >= lower && l < upper).collect();
        let mut out = Vec::new();
        for location in locations {
            let loc = location as usize;
            if loc + va_width > self.image.len() {
                continue;
            }
            let address: u64 = match bitness {
                Bitness::X86 => u32::from_le_bytes(self.image[loc..loc + 4].try_into().unwrap()) as u64,
                Bitness::X64 => u64::from_le_bytes(self.image[loc..loc + 8].try_into().unwrap()),
            };
            let rva = address.wrapping_sub(image_base) as u32;
            let Ok(target) = translator.rva_to_offset(rva) else { continue };
            if is_marked(target) {
                MARK_ALIASED_TARGETS.warn(|| format!("dropping mark-aliased abs32 target at {location:#x} (offset {target:#x} has top bit set)"));
                continue;
            }
            out.push(Reference::new(location, target));
        }
        out
    }

    fn ensure_rel32(&mut self) {
        if self.rel32_locations.is_some() {
            return;
        }
        let abs32 = self.get_abs32_locations().to_vec();
        let mut rel32 = Vec::new();
        let sections = self.header.sections.clone();
        for section in &sections {
            if (section.characteristics & CODE_CHARACTERISTICS) != CODE_CHARACTERISTICS {
                continue;
            }
            let begin = section.file_offset as usize;
            let end = (begin + section.size_of_raw_data as usize).min(self.image.len());
            if begin >= end {
                continue;
            }
            let code = &self.image[begin..end];
            let candidates: Vec<Candidate> = match self.bitness {
                Bitness::X86 => rel32::scan_x86(code, begin as u32, &abs32),
                Bitness::X64 => rel32::scan_x64(code, begin as u32, &abs32),
            };
            let from_offset_to_rva = section.virtual_address as i64 - section.file_offset as i64;
            let start_rva = section.virtual_address;
            let end_rva = start_rva + section.virtual_size;
            for c in candidates {
                let loc = c.location as usize;
                if loc + 4 > self.image.len() {
                    continue;
                }
                let displacement = i32::from_le_bytes(self.image[loc..loc + 4].try_into().unwrap());
                let rel32_rva = (c.location as i64 + from_offset_to_rva) as i64;
                let target_rva = rel32_rva + 4 + displacement as i64;
                if target_rva < 0 || target_rva as u64 >= self.header.size_of_image as u64 {
                    continue;
                }
                let target_rva = target_rva as u32;
                if c.can_point_outside_section || (start_rva <= target_rva && target_rva < end_rva) {
                    rel32.push(c.location);
                }
            }
        }
        rel32.sort_unstable();
        self.rel32_locations = Some(rel32);
    }

    fn reloc_block_page_rva_for(&self, location: u32) -> Option<u32> {
        for &block in &self.reloc_blocks {
            let block = block as usize;
            let size = u32::from_le_bytes(self.image[block + 4..block + 8].try_into().unwrap());
            let start_entries = block + 8;
            let end_entries = block + size as usize;
            if (location as usize) >= start_entries && (location as usize) < end_entries {
                return Some(u32::from_le_bytes(self.image[block..block + 4].try_into().unwrap()));
            }
        }
        None
    }

    /// Re-encodes a reference's target in place, dispatching to the `write_*`
    /// free functions below by type (patch applicator write-back).
    pub fn write_reference(&self, image: &mut [u8], ty: ReferenceType, location: u32, target: u32) -> Result<()> {
        match ty {
            RELOC => {
                let page_rva = self
                    .reloc_block_page_rva_for(location)
                    .ok_or_else(|| anyhow::anyhow!("reloc location {location} not in any reloc block"))?;
                write_reloc(image, &self.translator, self.bitness, page_rva, location, target)
            }
            ABS32 => write_abs32(image, &self.translator, self.bitness, self.header.image_base, location, target),
            REL32 => write_rel32(image, &self.translator, location, target),
            _ => anyhow::bail!("PE has 3 reference types, got {ty}"),
        }
    }

    fn find_rel32(&mut self, lower: u32, upper: u32) -> Vec<Reference> {
        self.ensure_rel32();
        let translator = self.translator.clone();
        let size_of_image = self.header.size_of_image;
        let sections = self.header.sections.clone();
        let locations: Vec<u32> =
            self.rel32_locations.as_ref().unwrap().iter().copied().filter(|&l| l >= lower && l < upper).collect();
        let mut out = Vec::new();
        for location in locations {
            let loc = location as usize;
            if loc + 4 > self.image.len() {
                continue;
            }
            let displacement = i32::from_le_bytes(self.image[loc..loc + 4].try_into().unwrap());
            let Ok(rva) = translator.offset_to_rva(location) else { continue };
            let target_rva = (rva as i64 + 4 + displacement as i64) as i64;
            if target_rva < 0 || target_rva as u64 >= size_of_image as u64 {
                continue;
            }
            let Ok(target) = translator.rva_to_offset(target_rva as u32) else { continue };
            let _ = &sections;
            out.push(Reference::new(location, target));
        }
        out
    }
}

impl<'a> Disassembler for DisassemblerWin32<'a> {
    fn exe_type(&self) -> ExeType {
        self.bitness.exe_type()
    }

    fn image(&self) -> &[u8] {
        self.image
    }

    fn num_reference_types(&self) -> u8 {
        TYPE_COUNT
    }

    fn reference_traits(&self, ty: ReferenceType) -> ReferenceTraits {
        match ty {
            RELOC => ReferenceTraits { ty: RELOC, pool: 0, width: 2 },
            ABS32 => ReferenceTraits { ty: ABS32, pool: 0, width: self.bitness.va_width() as u8 },
            REL32 => ReferenceTraits { ty: REL32, pool: 0, width: 4 },
            _ => unreachable!("PE has 3 reference types, got {ty}"),
        }
    }

    fn find(&mut self, ty: ReferenceType, lower: u32, upper: u32) -> Vec<Reference> {
        match ty {
            RELOC => self.find_relocs(lower, upper),
            ABS32 => self.find_abs32(lower, upper),
            REL32 => self.find_rel32(lower, upper),
            _ => unreachable!("PE has 3 reference types, got {ty}"),
        }
    }

    fn translator(&self) -> &AddressTranslator {
        &self.translator
    }
}

/// Re-encodes a reloc entry's target in place (patch applicator write-back).
pub fn write_reloc(
    image: &mut [u8],
    translator: &AddressTranslator,
    bitness: Bitness,
    reloc_block_page_rva: u32,
    location: u32,
    target: u32,
) -> Result<()> {
    let target_rva = translator.offset_to_rva(target)?;
    let offset = target_rva.wrapping_sub(reloc_block_page_rva) & 0xFFF;
    let entry = offset as u16 | (bitness.reloc_type() << 12);
    let loc = location as usize;
    image[loc..loc + 2].copy_from_slice(&entry.to_le_bytes());
    Ok(())
}

/// Re-encodes an abs32 reference's target in place.
pub fn write_abs32(
    image: &mut [u8],
    translator: &AddressTranslator,
    bitness: Bitness,
    image_base: u64,
    location: u32,
    target: u32,
) -> Result<()> {
    let target_rva = translator.offset_to_rva(target)?;
    let address = image_base + target_rva as u64;
    let loc = location as usize;
    match bitness {
        Bitness::X86 => image[loc..loc + 4].copy_from_slice(&(address as u32).to_le_bytes()),
        Bitness::X64 => image[loc..loc + 8].copy_from_slice(&address.to_le_bytes()),
    }
    Ok(())
}

/// Re-encodes a rel32 reference's target in place.
pub fn write_rel32(
    image: &mut [u8],
    translator: &AddressTranslator,
    location: u32,
    target: u32,
) -> Result<()> {
    let rel32_rva = translator.offset_to_rva(location)?;
    let target_rva = translator.offset_to_rva(target)?;
    let displacement = target_rva as i64 - rel32_rva as i64 - 4;
    let loc = location as usize;
    image[loc..loc + 4].copy_from_slice(&(displacement as i32).to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_pe32(code: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 0x200];
        image[0..2].copy_from_slice(b"MZ");
        image[OFFSET_OF_NEW_EXE_HEADER..OFFSET_OF_NEW_EXE_HEADER + 4].copy_from_slice(&0x80u32.to_le_bytes());
        image[0x80..0x84].copy_from_slice(b"PE\0\0");

        let coff_pos = 0x84;
        image[coff_pos..coff_pos + 2].copy_from_slice(&0x14Cu16.to_le_bytes()); // machine
        image[coff_pos + 2..coff_pos + 4].copy_from_slice(&1u16.to_le_bytes()); // 1 section
        image[coff_pos + 16..coff_pos + 18].copy_from_slice(&224u16.to_le_bytes()); // size_of_optional_header

        let opt_pos = coff_pos + 20;
        image[opt_pos..opt_pos + 2].copy_from_slice(&0x10Bu16.to_le_bytes()); // PE32 magic
        image[opt_pos + PE32_LAYOUT.image_base..opt_pos + PE32_LAYOUT.image_base + 4]
            .copy_from_slice(&0x0040_0000u32.to_le_bytes());
        image[opt_pos + PE32_LAYOUT.size_of_image..opt_pos + PE32_LAYOUT.size_of_image + 4]
            .copy_from_slice(&0x1000u32.to_le_bytes());
        image[opt_pos + PE32_LAYOUT.number_of_rva_and_sizes..opt_pos + PE32_LAYOUT.number_of_rva_and_sizes + 4]
            .copy_from_slice(&16u32.to_le_bytes());
        // Base relocation table (index 5): zero size -> no relocs, which is fine for this test.

        let sections_pos = opt_pos + 224;
        let mut name = [0u8; 8];
        name[..4].copy_from_slice(b".text");
        image[sections_pos..sections_pos + 8].copy_from_slice(&name[..8.min(name.len())]);
        image[sections_pos + 8..sections_pos + 12].copy_from_slice(&(code.len() as u32).to_le_bytes());
        image[sections_pos + 12..sections_pos + 16].copy_from_slice(&0x1000u32.to_le_bytes());
        image[sections_pos + 16..sections_pos + 20].copy_from_slice(&(code.len() as u32).to_le_bytes());
        image[sections_pos + 20..sections_pos + 24].copy_from_slice(&0x200u32.to_le_bytes());
        image[sections_pos + 36..sections_pos + 40]
            .copy_from_slice(&CODE_CHARACTERISTICS.to_le_bytes());

        image[0x200 - code.len()..0x200].copy_from_slice(code);
        image
    }

    #[test]
    fn parses_minimal_pe32_header() {
        let image = build_minimal_pe32(&[0x90; 16]);
        assert!(quick_detect_x86(&image));
        let d = DisassemblerWin32::parse(&image, Bitness::X86);
        assert!(d.is_some());
        assert_eq!(d.unwrap().exe_type(), ExeType::Win32X86);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut image = vec![0u8; 0x200];
        image[0..2].copy_from_slice(b"XX");
        assert!(!quick_detect_x86(&image));
    }
}
