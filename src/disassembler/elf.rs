//! ELF x86/ARM32/AArch64 disassembler.

use super::arm;
use super::rel32;
use super::{Disassembler, ExeType};
use crate::model::{Reference, ReferenceTraits, ReferenceType};
use crate::region::{check_range, AddressTranslator, SectionMapping};
use anyhow::Result;
use serde::Deserialize;

const EI_CLASS: usize = 4;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;

const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_AARCH64: u16 = 183;

const SHT_REL: u32 = 9;
const SHT_RELA: u32 = 4;
const SHF_EXECINSTR: u32 = 0x4;
const R_386_RELATIVE: u32 = 8;

pub const RELOC: ReferenceType = 0;
pub const ABS32: ReferenceType = 1;
// x86 has a single rel32 type; ARM32/AArch64 expose one type per encoding
// starting here.
pub const REL32_BASE: ReferenceType = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    Arm32,
    Aarch64,
}

impl Arch {
    fn exe_type(self) -> ExeType {
        match self {
            Arch::X86 => ExeType::ElfX86,
            Arch::Arm32 => ExeType::ElfArm32,
            Arch::Aarch64 => ExeType::ElfAArch64,
        }
    }
    fn machine(self) -> u16 {
        match self {
            Arch::X86 => EM_386,
            Arch::Arm32 => EM_ARM,
            Arch::Aarch64 => EM_AARCH64,
        }
    }
    fn num_rel32_types(self) -> u8 {
        match self {
            Arch::X86 => 1,
            Arch::Arm32 => 5,  // A24, T8, T11, T21, T24
            Arch::Aarch64 => 3, // Immd14, Immd19, Immd26
        }
    }
    fn num_reference_types(self) -> u8 {
        REL32_BASE + self.num_rel32_types()
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Elf32Header {
    ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u32,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Elf32SectionHeader {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u32,
    sh_addr: u32,
    sh_offset: u32,
    sh_size: u32,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u32,
    sh_entsize: u32,
}

/// ELF64 differs from ELF32 only in the width of address/offset/size fields
/// in the file header and section headers; entries are re-widened into the
/// same [`SectionHeader`]/[`ElfHeader`] shape below after reading.
#[derive(Debug, Clone, Copy, Deserialize)]
struct Elf64Header {
    ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct Elf64SectionHeader {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

#[derive(Debug, Clone, Copy)]
struct Section {
    addr: u64,
    offset: u64,
    size: u64,
    sh_type: u32,
    flags: u64,
    link: u32,
    entsize: u64,
}

impl Section {
    fn is_exec(&self) -> bool {
        self.flags & SHF_EXECINSTR as u64 != 0 && self.size > 0
    }
}

fn read<'a, T: Deserialize<'a>>(image: &'a [u8], pos: usize, len: usize) -> Result<T> {
    check_range(pos as u64, len as u64, image.len() as u64)?;
    Ok(bincode::deserialize(&image[pos..pos + len])?)
}

struct Header {
    is64: bool,
    e_machine: u16,
    sections: Vec<Section>,
    detected_length: usize,
}

fn parse_header(image: &[u8]) -> Option<Header> {
    if image.len() < 0x34 || &image[0..4] != b"\x7FELF" {
        return None;
    }
    let class = image[EI_CLASS];
    let is64 = match class {
        c if c == ELFCLASS32 => false,
        c if c == ELFCLASS64 => true,
        _ => return None,
    };

    let (e_machine, e_shoff, e_shnum, e_shentsize, sections): (u16, u64, u16, u16, Vec<Section>);
    if is64 {
        let h: Elf64Header = read(image, 0, 64).ok()?;
        e_machine = h.e_machine;
        e_shoff = h.e_shoff;
        e_shnum = h.e_shnum;
        e_shentsize = h.e_shentsize;
        let mut v = Vec::with_capacity(h.e_shnum as usize);
        for i in 0..h.e_shnum as usize {
            let raw: Elf64SectionHeader = read(image, h.e_shoff as usize + i * e_shentsize as usize, 64).ok()?;
            v.push(Section {
                addr: raw.sh_addr,
                offset: raw.sh_offset,
                size: raw.sh_size,
                sh_type: raw.sh_type,
                flags: raw.sh_flags,
                link: raw.sh_link,
                entsize: raw.sh_entsize,
            });
        }
        sections = v;
    } else {
        let h: Elf32Header = read(image, 0, 52).ok()?;
        e_machine = h.e_machine;
        e_shoff = h.e_shoff as u64;
        e_shnum = h.e_shnum;
        e_shentsize = h.e_shentsize;
        let mut v = Vec::with_capacity(h.e_shnum as usize);
        for i in 0..h.e_shnum as usize {
            let raw: Elf32SectionHeader = read(image, h.e_shoff as usize + i * e_shentsize as usize, 40).ok()?;
            v.push(Section {
                addr: raw.sh_addr as u64,
                offset: raw.sh_offset as u64,
                size: raw.sh_size as u64,
                sh_type: raw.sh_type,
                flags: raw.sh_flags as u64,
                link: raw.sh_link,
                entsize: raw.sh_entsize as u64,
            });
        }
        sections = v;
    }
    let _ = (e_shoff, e_shnum, e_shentsize);

    let mut detected_length: u64 = 0;
    for s in &sections {
        if s.sh_type != 8 /* SHT_NOBITS */ {
            check_range(s.offset, s.size, image.len() as u64).ok()?;
            detected_length = detected_length.max(s.offset + s.size);
        }
    }
    if detected_length == 0 || detected_length > image.len() as u64 {
        return None;
    }

    Some(Header { is64, e_machine, sections, detected_length: detected_length as usize })
}

pub fn quick_detect(image: &[u8]) -> bool {
    parse_header(image).is_some()
}

pub fn detected_exe_type(image: &[u8]) -> Option<ExeType> {
    let h = parse_header(image)?;
    Some(arch_of(h.e_machine)?.exe_type())
}

pub fn detected_length(image: &[u8]) -> Option<usize> {
    parse_header(image).map(|h| h.detected_length)
}

fn arch_of(e_machine: u16) -> Option<Arch> {
    match e_machine {
        EM_386 => Some(Arch::X86),
        EM_ARM => Some(Arch::Arm32),
        EM_AARCH64 => Some(Arch::Aarch64),
        _ => None,
    }
}

pub struct DisassemblerElf<'a> {
    image: &'a [u8],
    arch: Arch,
    header: Header,
    translator: AddressTranslator,
    abs32_locations: Option<Vec<u32>>,
    rel32_locations: Option<Vec<Vec<u32>>>, // indexed by (type - REL32_BASE)
}

impl<'a> DisassemblerElf<'a> {
    pub fn parse(image: &'a [u8]) -> Option<Self> {
        let header = parse_header(image)?;
        let arch = arch_of(header.e_machine)?;
        let image = &image[..header.detected_length];
        let mappings = header
            .sections
            .iter()
            .filter(|s| s.addr != 0 && s.size > 0)
            .map(|s| SectionMapping {
                rva_begin: s.addr as u32,
                rva_end: (s.addr + s.size) as u32,
                file_offset: s.offset as u32,
            })
            .collect();
        let translator = AddressTranslator::new(mappings);
        Some(DisassemblerElf {
            image,
            arch,
            header,
            translator,
            abs32_locations: None,
            rel32_locations: None,
        })
    }

    fn find_relocs(&self, lower: u32, upper: u32) -> Vec<Reference> {
        if self.arch != Arch::X86 {
            return Vec::new();
        }
        let entsize_rel = 8usize;
        let entsize_rela = 12usize;
        let mut out = Vec::new();
        for s in &self.header.sections {
            if s.sh_type != SHT_REL && s.sh_type != SHT_RELA {
                continue;
            }
            let entsize = if s.sh_type == SHT_REL { entsize_rel } else { entsize_rela };
            let count = if entsize == 0 { 0 } else { s.size as usize / entsize };
            for i in 0..count {
                let pos = s.offset as usize + i * entsize;
                if pos + 8 > self.image.len() {
                    break;
                }
                let r_offset = u32::from_le_bytes(self.image[pos..pos + 4].try_into().unwrap());
                let r_info = u32::from_le_bytes(self.image[pos + 4..pos + 8].try_into().unwrap());
                let r_type = r_info & 0xFF;
                if r_type != R_386_RELATIVE {
                    continue;
                }
                let Ok(location) = self.translator.rva_to_offset(r_offset) else { continue };
                if location < lower || location >= upper {
                    continue;
                }
                if (location as usize) + 4 > self.image.len() {
                    continue;
                }
                let raw_target_rva =
                    u32::from_le_bytes(self.image[location as usize..location as usize + 4].try_into().unwrap());
                let Ok(target) = self.translator.rva_to_offset(raw_target_rva) else { continue };
                out.push(Reference::new(location, target));
            }
        }
        out.sort_by_key(|r| r.location);
        out
    }

    fn get_abs32_locations(&mut self) -> &[u32] {
        if self.abs32_locations.is_none() {
            let mut locs: Vec<u32> = self.find_relocs(0, self.image.len() as u32).into_iter().map(|r| r.location).collect();
            locs.sort_unstable();
            self.abs32_locations = Some(locs);
        }
        self.abs32_locations.as_deref().unwrap()
    }

    fn find_abs32(&mut self, lower: u32, upper: u32) -> Vec<Reference> {
        // Abs32 targets are the relocated words themselves: each reloc
        // location holds a raw absolute RVA that `find_relocs` already
        // translated, so abs32's own references coincide with the reloc
        // targets.
        self.find_relocs(lower, upper)
            .into_iter()
            .map(|r| Reference::new(r.location, r.target))
            .collect()
    }

    fn exec_sections(&self) -> Vec<Section> {
        self.header.sections.iter().filter(|s| s.is_exec()).copied().collect()
    }

    fn ensure_rel32(&mut self) {
        if self.rel32_locations.is_some() {
            return;
        }
        let abs32 = self.get_abs32_locations().to_vec();
        let mut per_type: Vec<Vec<u32>> = vec![Vec::new(); self.arch.num_rel32_types() as usize];
        let sections = self.exec_sections();
        match self.arch {
            Arch::X86 => {
                for s in &sections {
                    let begin = s.offset as usize;
                    let end = (begin + s.size as usize).min(self.image.len());
                    if begin >= end {
                        continue;
                    }
                    let code = &self.image[begin..end];
                    for c in rel32::scan_x86(code, begin as u32, &abs32) {
                        per_type[0].push(c.location);
                    }
                }
            }
            Arch::Arm32 => {
                for s in &sections {
                    let begin = s.offset as usize;
                    let end = (begin + s.size as usize).min(self.image.len());
                    if begin >= end {
                        continue;
                    }
                    let code = &self.image[begin..end];
                    if arm::is_arm_mode(code) {
                        let mut i = 0usize;
                        while i + 4 <= code.len() {
                            let word = u32::from_le_bytes(code[i..i + 4].try_into().unwrap());
                            if arm::read_a24(word).is_some() {
                                per_type[0].push((begin + i) as u32);
                            }
                            i += 4;
                        }
                    } else {
                        let mut i = 0usize;
                        while i + 2 <= code.len() {
                            let hw = u16::from_le_bytes(code[i..i + 2].try_into().unwrap());
                            if i + 4 <= code.len() {
                                let hw2 = u16::from_le_bytes(code[i + 2..i + 4].try_into().unwrap());
                                if arm::read_t21(hw, hw2).is_some() {
                                    per_type[3].push((begin + i) as u32);
                                    i += 4;
                                    continue;
                                }
                                if arm::read_t24(hw, hw2).is_some() {
                                    per_type[4].push((begin + i) as u32);
                                    i += 4;
                                    continue;
                                }
                            }
                            if arm::read_t8(hw).is_some() {
                                per_type[1].push((begin + i) as u32);
                            } else if arm::read_t11(hw).is_some() {
                                per_type[2].push((begin + i) as u32);
                            }
                            i += 2;
                        }
                    }
                }
            }
            Arch::Aarch64 => {
                for s in &sections {
                    let begin = s.offset as usize;
                    let end = (begin + s.size as usize).min(self.image.len());
                    if begin >= end {
                        continue;
                    }
                    let code = &self.image[begin..end];
                    let mut i = 0usize;
                    while i + 4 <= code.len() {
                        let word = u32::from_le_bytes(code[i..i + 4].try_into().unwrap());
                        let loc = (begin + i) as u32;
                        if word & 0x7E00_0000 == 0x3600_0000 {
                            per_type[0].push(loc); // TBZ/TBNZ
                        } else if word & 0xFF00_0010 == 0x5400_0000 || word & 0x7F00_0000 == 0x3400_0000 {
                            per_type[1].push(loc); // B.cond / CBZ/CBNZ
                        } else if word & 0x7C00_0000 == 0x1400_0000 {
                            per_type[2].push(loc); // B / BL
                        }
                        i += 4;
                    }
                }
            }
        }
        for v in per_type.iter_mut() {
            v.sort_unstable();
        }
        self.rel32_locations = Some(per_type);
    }

    /// Re-encodes a reference's target in place (patch applicator
    /// write-back), the structural inverse of `find`/`decode_displacement`.
    pub fn write_reference(&self, image: &mut [u8], ty: ReferenceType, location: u32, target: u32) -> Result<()> {
        let loc = location as usize;
        match ty {
            RELOC | ABS32 => {
                let target_rva = self.translator.offset_to_rva(target)?;
                image[loc..loc + 4].copy_from_slice(&target_rva.to_le_bytes());
                Ok(())
            }
            rel if rel >= REL32_BASE && rel < self.arch.num_reference_types() => {
                let idx = (rel - REL32_BASE) as usize;
                let rva = self.translator.offset_to_rva(location)?;
                let target_rva = self.translator.offset_to_rva(target)?;
                let displacement = target_rva as i64 - rva as i64;
                match self.arch {
                    Arch::X86 => {
                        let d = (displacement - 4) as i32;
                        image[loc..loc + 4].copy_from_slice(&d.to_le_bytes());
                    }
                    Arch::Arm32 => match idx {
                        0 => {
                            let word = u32::from_le_bytes(image[loc..loc + 4].try_into().unwrap());
                            let w = arm::write_a24(word, (displacement - 8) as i32);
                            image[loc..loc + 4].copy_from_slice(&w.to_le_bytes());
                        }
                        1 => {
                            let hw = u16::from_le_bytes(image[loc..loc + 2].try_into().unwrap());
                            let w = arm::write_t8(hw, (displacement - 4) as i32);
                            image[loc..loc + 2].copy_from_slice(&w.to_le_bytes());
                        }
                        2 => {
                            let hw = u16::from_le_bytes(image[loc..loc + 2].try_into().unwrap());
                            let w = arm::write_t11(hw, (displacement - 4) as i32);
                            image[loc..loc + 2].copy_from_slice(&w.to_le_bytes());
                        }
                        3 => {
                            let hw1 = u16::from_le_bytes(image[loc..loc + 2].try_into().unwrap());
                            let hw2 = u16::from_le_bytes(image[loc + 2..loc + 4].try_into().unwrap());
                            let (w1, w2) = arm::write_t21(hw1, hw2, (displacement - 4) as i32);
                            image[loc..loc + 2].copy_from_slice(&w1.to_le_bytes());
                            image[loc + 2..loc + 4].copy_from_slice(&w2.to_le_bytes());
                        }
                        4 => {
                            let hw1 = u16::from_le_bytes(image[loc..loc + 2].try_into().unwrap());
                            let hw2 = u16::from_le_bytes(image[loc + 2..loc + 4].try_into().unwrap());
                            let (w1, w2) = arm::write_t24(hw1, hw2, (displacement - 4) as i32);
                            image[loc..loc + 2].copy_from_slice(&w1.to_le_bytes());
                            image[loc + 2..loc + 4].copy_from_slice(&w2.to_le_bytes());
                        }
                        _ => unreachable!(),
                    },
                    Arch::Aarch64 => {
                        let word = u32::from_le_bytes(image[loc..loc + 4].try_into().unwrap());
                        let w = match idx {
                            0 => arm::write_immd14(word, displacement as i32),
                            1 => arm::write_immd19(word, displacement as i32),
                            2 => arm::write_immd26(word, displacement as i32),
                            _ => unreachable!(),
                        };
                        image[loc..loc + 4].copy_from_slice(&w.to_le_bytes());
                    }
                }
                Ok(())
            }
            _ => anyhow::bail!("ELF reference type {ty} out of range"),
        }
    }
}

impl<'a> Disassembler for DisassemblerElf<'a> {
    fn exe_type(&self) -> ExeType {
        self.arch.exe_type()
    }

    fn image(&self) -> &[u8] {
        self.image
    }

    fn num_reference_types(&self) -> u8 {
        self.arch.num_reference_types()
    }

    fn reference_traits(&self, ty: ReferenceType) -> ReferenceTraits {
        match ty {
            RELOC => ReferenceTraits { ty, pool: 0, width: if self.header.is64 { 8 } else { 4 } },
            ABS32 => ReferenceTraits { ty, pool: 1, width: if self.header.is64 { 8 } else { 4 } },
            rel if rel >= REL32_BASE && rel < self.arch.num_reference_types() => {
                let width = match self.arch {
                    Arch::X86 => 4,
                    Arch::Arm32 => match rel - REL32_BASE {
                        0 => 4, // A24
                        1 | 2 => 2, // T8, T11
                        3 | 4 => 4, // T21, T24
                        _ => unreachable!(),
                    },
                    Arch::Aarch64 => 4,
                };
                ReferenceTraits { ty: rel, pool: 2, width }
            }
            _ => unreachable!("ELF reference type {ty} out of range"),
        }
    }

    fn find(&mut self, ty: ReferenceType, lower: u32, upper: u32) -> Vec<Reference> {
        match ty {
            RELOC => self.find_relocs(lower, upper),
            ABS32 => self.find_abs32(lower, upper),
            rel if rel >= REL32_BASE => {
                self.ensure_rel32();
                let idx = (rel - REL32_BASE) as usize;
                let width = self.reference_traits(rel).width;
                let translator = self.translator.clone();
                let size_of_image = self.image.len() as u32;
                let locs: Vec<u32> = self.rel32_locations.as_ref().unwrap()[idx]
                    .iter()
                    .copied()
                    .filter(|&l| l >= lower && l < upper)
                    .collect();
                let mut out = Vec::new();
                for location in locs {
                    let loc = location as usize;
                    if loc + width as usize > self.image.len() {
                        continue;
                    }
                    let displacement = decode_displacement(self.image, loc, self.arch, idx);
                    let Ok(rva) = translator.offset_to_rva(location) else { continue };
                    let target_rva = rva as i64 + displacement as i64;
                    if target_rva < 0 || target_rva as u64 >= size_of_image as u64 {
                        continue;
                    }
                    let Ok(target) = translator.rva_to_offset(target_rva as u32) else { continue };
                    out.push(Reference::new(location, target));
                }
                out
            }
            _ => unreachable!("ELF reference type {ty} out of range"),
        }
    }

    fn translator(&self) -> &AddressTranslator {
        &self.translator
    }
}

fn decode_displacement(image: &[u8], loc: usize, arch: Arch, idx: usize) -> i32 {
    match arch {
        Arch::X86 => i32::from_le_bytes(image[loc..loc + 4].try_into().unwrap()) + 4,
        Arch::Arm32 => match idx {
            0 => arm::read_a24(u32::from_le_bytes(image[loc..loc + 4].try_into().unwrap())).unwrap_or(0) + 8,
            1 => arm::read_t8(u16::from_le_bytes(image[loc..loc + 2].try_into().unwrap())).unwrap_or(0) + 4,
            2 => arm::read_t11(u16::from_le_bytes(image[loc..loc + 2].try_into().unwrap())).unwrap_or(0) + 4,
            3 => {
                let hw1 = u16::from_le_bytes(image[loc..loc + 2].try_into().unwrap());
                let hw2 = u16::from_le_bytes(image[loc + 2..loc + 4].try_into().unwrap());
                arm::read_t21(hw1, hw2).unwrap_or(0) + 4
            }
            4 => {
                let hw1 = u16::from_le_bytes(image[loc..loc + 2].try_into().unwrap());
                let hw2 = u16::from_le_bytes(image[loc + 2..loc + 4].try_into().unwrap());
                arm::read_t24(hw1, hw2).unwrap_or(0) + 4
            }
            _ => unreachable!(),
        },
        Arch::Aarch64 => {
            let word = u32::from_le_bytes(image[loc..loc + 4].try_into().unwrap());
            match idx {
                0 => arm::read_immd14(word),
                1 => arm::read_immd19(word),
                2 => arm::read_immd26(word),
                _ => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_elf32_x86(code: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 0x200];
        image[0..4].copy_from_slice(b"\x7FELF");
        image[EI_CLASS] = ELFCLASS32;
        image[0x12..0x14].copy_from_slice(&(EM_386).to_le_bytes()); // e_machine
        let shoff = 0x100u32;
        image[0x20..0x24].copy_from_slice(&shoff.to_le_bytes()); // e_shoff
        image[0x2E..0x30].copy_from_slice(&40u16.to_le_bytes()); // e_shentsize
        image[0x30..0x32].copy_from_slice(&1u16.to_le_bytes()); // e_shnum=1

        let sh_pos = shoff as usize;
        image[sh_pos + 4..sh_pos + 8].copy_from_slice(&1u32.to_le_bytes()); // sh_type=SHT_PROGBITS
        image[sh_pos + 8..sh_pos + 12].copy_from_slice(&(SHF_EXECINSTR).to_le_bytes());
        image[sh_pos + 12..sh_pos + 16].copy_from_slice(&0x1000u32.to_le_bytes()); // sh_addr
        image[sh_pos + 16..sh_pos + 20].copy_from_slice(&0x80u32.to_le_bytes()); // sh_offset
        image[sh_pos + 20..sh_pos + 24].copy_from_slice(&(code.len() as u32).to_le_bytes());

        image[0x80..0x80 + code.len()].copy_from_slice(code);
        image
    }

    #[test]
    fn parses_minimal_elf32_x86() {
        let image = build_minimal_elf32_x86(&[0x90; 16]);
        assert!(quick_detect(&image));
        let d = DisassemblerElf::parse(&image);
        assert!(d.is_some());
        assert_eq!(d.unwrap().exe_type(), ExeType::ElfX86);
    }

    #[test]
    fn rejects_non_elf_magic() {
        let image = vec![0u8; 64];
        assert!(!quick_detect(&image));
    }
}
