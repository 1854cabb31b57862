//! End-to-end scenarios exercising the patch format, the VarInt codec, and
//! ensemble matching against the public API, one test per worked example.

use zucchini::ensemble::EnsembleMatcher;
use zucchini::equivalence_map::{Equivalence, EQUIVALENCE_LENGTH_THRESHOLD};
use zucchini::patch::applicator::apply;
use zucchini::patch::format::patch_field;
use zucchini::patch::generator::{generate, GenerateOptions};
use zucchini::stream::{SinkStream, SourceStream, SourceStreamSet};

fn raw_options() -> GenerateOptions {
    GenerateOptions { force_raw: true, imposed_matches: String::new() }
}

/// Decodes the patch's global equivalence list straight off the wire, the
/// same delta scheme `patch::applicator` uses internally, so tests can assert
/// on exact src/dst/length triples without a crate-internal hook.
fn decode_equivalences(patch_bytes: &[u8]) -> Vec<Equivalence> {
    let mut top = SourceStream::new(patch_bytes);
    // ZucchiniHeader: magic, old_size, old_crc, new_size, new_crc.
    for _ in 0..5 {
        top.read_varint_u32().unwrap();
    }
    let streams = SourceStreamSet::init(&mut top).unwrap();
    let mut src_skip = streams.get(patch_field::SRC_SKIP);
    let mut dst_skip = streams.get(patch_field::DST_SKIP);
    let mut copy_count = streams.get(patch_field::COPY_COUNT);

    let mut out = Vec::new();
    let mut cur = Equivalence { src: 0, dst: 0, length: 0 };
    while !src_skip.is_empty() {
        let diff_src = src_skip.read_varint_i32().unwrap();
        let diff_dst = dst_skip.read_varint_u32().unwrap();
        let raw_len = copy_count.read_varint_u32().unwrap();
        let length = raw_len + EQUIVALENCE_LENGTH_THRESHOLD as u32;
        let src = (cur.src as i64 + cur.length as i64 + diff_src as i64) as u32;
        let dst = cur.dst + cur.length + diff_dst;
        cur = Equivalence { src, dst, length };
        out.push(cur);
    }
    out
}

fn stream_is_empty(patch_bytes: &[u8], key: usize) -> bool {
    let mut top = SourceStream::new(patch_bytes);
    for _ in 0..5 {
        top.read_varint_u32().unwrap();
    }
    let streams = SourceStreamSet::init(&mut top).unwrap();
    streams.get(key).is_empty()
}

#[test]
fn scenario_1_raw_identical_files() {
    let image: Vec<u8> = (0..=255u8).collect();
    let patch = generate(&raw_options(), &image, &image).unwrap();

    let equivs = decode_equivalences(&patch);
    assert_eq!(equivs, vec![Equivalence { src: 0, dst: 0, length: 256 }]);
    assert!(stream_is_empty(&patch, patch_field::EXTRA_DATA));
    assert!(stream_is_empty(&patch, patch_field::RAW_DELTA_SKIP));

    let produced = apply(&image, &patch).unwrap();
    assert_eq!(produced, image);
}

#[test]
fn scenario_2_single_byte_change() {
    let old = vec![0xAA, 0xBB, 0xCC, 0xDD];
    let new = vec![0xAA, 0xBB, 0xCE, 0xDD];
    let patch = generate(&raw_options(), &old, &new).unwrap();

    let equivs = decode_equivalences(&patch);
    assert_eq!(equivs, vec![Equivalence { src: 0, dst: 0, length: 4 }]);
    assert!(stream_is_empty(&patch, patch_field::EXTRA_DATA));

    let mut top = SourceStream::new(&patch);
    for _ in 0..5 {
        top.read_varint_u32().unwrap();
    }
    let streams = SourceStreamSet::init(&mut top).unwrap();
    let mut skip = streams.get(patch_field::RAW_DELTA_SKIP);
    let mut diff = streams.get(patch_field::RAW_DELTA_DIFF);
    assert_eq!(skip.read_varint_u32().unwrap(), 2);
    assert_eq!(diff.read_i8().unwrap(), 2);
    assert!(skip.is_empty());
    assert!(diff.is_empty());

    let produced = apply(&old, &patch).unwrap();
    assert_eq!(produced, new);
}

#[test]
fn scenario_3_varint_codec() {
    let mut sink = SinkStream::new();
    sink.write_varint_u32(0x0000_007F);
    assert_eq!(sink.bytes(), &[0x7F]);

    let mut sink = SinkStream::new();
    sink.write_varint_u32(0x0000_0080);
    assert_eq!(sink.bytes(), &[0x80, 0x01]);

    let mut sink = SinkStream::new();
    sink.write_varint_u32(0x0000_3FFF);
    assert_eq!(sink.bytes(), &[0xFF, 0x7F]);

    let mut sink = SinkStream::new();
    sink.write_varint_u32(0xFFFF_FFFF);
    assert_eq!(sink.bytes(), &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);

    for value in [0x7Fu32, 0x80, 0x3FFF, 0xFFFF_FFFF] {
        let mut sink = SinkStream::new();
        sink.write_varint_u32(value);
        let mut src = SourceStream::new(sink.bytes());
        assert_eq!(src.read_varint_u32().unwrap(), value);
        assert!(src.is_empty());
    }
}

const OFFSET_OF_NEW_EXE_HEADER: usize = 0x3C;
const CODE_CHARACTERISTICS: u32 = 0x0000_0020 | 0x2000_0000;

/// Hand-built minimal PE32 image with one `.text` section and no relocations,
/// padded to `total_len` bytes (header occupies the first 0x200 bytes, the
/// remainder is the section's raw data so the detector's length matches
/// `total_len` exactly). `fill` seeds the section bytes so distinct images
/// compare unequal / at the right histogram distance.
fn build_pe32(total_len: usize, fill: u8) -> Vec<u8> {
    assert!(total_len > 0x200);
    let mut image = vec![0u8; total_len];
    image[0..2].copy_from_slice(b"MZ");
    image[OFFSET_OF_NEW_EXE_HEADER..OFFSET_OF_NEW_EXE_HEADER + 4].copy_from_slice(&0x80u32.to_le_bytes());
    image[0x80..0x84].copy_from_slice(b"PE\0\0");

    let coff_pos = 0x84;
    image[coff_pos..coff_pos + 2].copy_from_slice(&0x14Cu16.to_le_bytes()); // machine: x86
    image[coff_pos + 2..coff_pos + 4].copy_from_slice(&1u16.to_le_bytes()); // 1 section
    image[coff_pos + 16..coff_pos + 18].copy_from_slice(&224u16.to_le_bytes()); // size_of_optional_header

    let opt_pos = coff_pos + 20;
    image[opt_pos..opt_pos + 2].copy_from_slice(&0x10Bu16.to_le_bytes()); // PE32 magic
    image[opt_pos + 28..opt_pos + 32].copy_from_slice(&0x0040_0000u32.to_le_bytes()); // image base
    image[opt_pos + 56..opt_pos + 60].copy_from_slice(&(total_len as u32).to_le_bytes()); // size of image
    image[opt_pos + 92..opt_pos + 96].copy_from_slice(&16u32.to_le_bytes()); // number of rva/sizes
    // data directory entry 5 (base relocation table) left zeroed: no relocs.

    let sections_pos = opt_pos + 224;
    let raw_size = (total_len - 0x200) as u32;
    image[sections_pos..sections_pos + 5].copy_from_slice(b".text");
    image[sections_pos + 8..sections_pos + 12].copy_from_slice(&raw_size.to_le_bytes()); // virtual size
    image[sections_pos + 12..sections_pos + 16].copy_from_slice(&0x1000u32.to_le_bytes()); // virtual address
    image[sections_pos + 16..sections_pos + 20].copy_from_slice(&raw_size.to_le_bytes()); // size of raw data
    image[sections_pos + 20..sections_pos + 24].copy_from_slice(&0x200u32.to_le_bytes()); // pointer to raw data
    image[sections_pos + 36..sections_pos + 40].copy_from_slice(&CODE_CHARACTERISTICS.to_le_bytes());

    for (i, byte) in image[0x200..].iter_mut().enumerate() {
        *byte = fill.wrapping_add((i % 251) as u8);
    }
    image
}

/// Flips roughly `pct` percent of a PE's section bytes deterministically
/// (every `100/pct`-th byte), simulating a near-identical rebuild.
fn perturb(image: &mut [u8], pct: usize) {
    let stride = (100 / pct).max(1);
    for i in (0x200..image.len()).step_by(stride) {
        image[i] ^= 0xFF;
    }
}

#[test]
fn scenario_4_ensemble_matcher_heuristic() {
    let header_old = vec![0u8; 1024];
    let header_new = vec![0u8; 1024];

    let pe_a = build_pe32(100 * 1024, 0x11);
    let mut pe_a_new = pe_a.clone();
    perturb(&mut pe_a_new, 1);

    let pe_b = build_pe32(200 * 1024, 0x77);
    let mut pe_b_new = build_pe32(210 * 1024, 0x77);
    perturb(&mut pe_b_new, 2);

    let mut old_image = Vec::new();
    old_image.extend_from_slice(&header_old);
    old_image.extend_from_slice(&pe_a);
    old_image.extend_from_slice(&pe_b);

    let mut new_image = Vec::new();
    new_image.extend_from_slice(&header_new);
    new_image.extend_from_slice(&pe_a_new);
    new_image.extend_from_slice(&pe_b_new);

    let mut matcher = EnsembleMatcher::new();
    matcher.run_match(&old_image, &new_image, "").unwrap();

    assert_eq!(matcher.matches.len(), 2);
    assert_eq!(matcher.num_identical, 0);

    let a_match = matcher.matches.iter().find(|m| m.old.start as usize == header_old.len()).unwrap();
    assert_eq!(a_match.old.len() as usize, pe_a.len());
    assert_eq!(a_match.new.len() as usize, pe_a_new.len());

    let b_match = matcher.matches.iter().find(|m| m.old.len() as usize == pe_b.len()).unwrap();
    assert_eq!(b_match.new.len() as usize, pe_b_new.len());

    // Header region and the (empty) trailing gap are both reported as separators.
    assert_eq!(matcher.separators.len(), 2);
    assert_eq!(matcher.separators[0], (0, header_new.len() as u32));
    let (trailing_start, trailing_end) = *matcher.separators.last().unwrap();
    assert_eq!(trailing_start, trailing_end);
}

#[test]
fn scenario_5_imposed_matches() {
    let old = vec![0u8; 300];
    let new = vec![0u8; 300];

    let mut matcher = EnsembleMatcher::new();
    matcher.run_match(&old, &new, "0+100=0+100,200+50=150+50").unwrap();
    assert_eq!(matcher.matches.len(), 2);
    assert!(matcher.matches[0].new.start <= matcher.matches[1].new.start);
    for w in matcher.matches.windows(2) {
        assert!(w[0].new.end <= w[1].new.start);
    }

    let mut matcher = EnsembleMatcher::new();
    let err = matcher.run_match(&old, &new, "0+100=0+100,50+100=50+100").unwrap_err();
    assert!(format!("{err}").len() > 0);
}

#[test]
fn scenario_6_pe_reloc_parse() {
    // A single minimal PE with a base relocation table containing one block:
    // page_rva=0x1000, block size=0x0C (8-byte header + two 2-byte entries),
    // entries 0x3010 and 0x3014 (reloc type 3 in the top nibble, offset in
    // the bottom 12 bits), each landing inside the .text section mapped at
    // virtual address 0x1000.
    let total_len = 0x400;
    let mut image = build_pe32(total_len, 0x00);

    let reloc_block_offset = 0x200 + 0x100; // inside the .text section's raw data
    image[reloc_block_offset..reloc_block_offset + 4].copy_from_slice(&0x1000u32.to_le_bytes()); // page_rva
    image[reloc_block_offset + 4..reloc_block_offset + 8].copy_from_slice(&0x0Cu32.to_le_bytes()); // block size
    let entry0 = 0x010u16 | (3 << 12);
    let entry1 = 0x014u16 | (3 << 12);
    image[reloc_block_offset + 8..reloc_block_offset + 10].copy_from_slice(&entry0.to_le_bytes());
    image[reloc_block_offset + 10..reloc_block_offset + 12].copy_from_slice(&entry1.to_le_bytes());

    // Point the base relocation table data directory (index 5) at the block.
    let opt_pos = 0x84 + 20;
    let data_dir_pos = opt_pos + 96 + 5 * 8;
    let reloc_rva = 0x1000u32 + (reloc_block_offset as u32 - 0x200);
    image[data_dir_pos..data_dir_pos + 4].copy_from_slice(&reloc_rva.to_le_bytes());
    image[data_dir_pos + 4..data_dir_pos + 8].copy_from_slice(&0x0Cu32.to_le_bytes());

    let d = zucchini::disassembler::pe::DisassemblerWin32::parse(&image, zucchini::disassembler::pe::Bitness::X86);
    assert!(d.is_some());
    let mut d = d.unwrap();

    let holder = d.build_reference_holder();
    let targets: Vec<u32> = holder
        .iter_sorted_by_type()
        .filter(|tr| tr.ty == zucchini::disassembler::pe::RELOC)
        .map(|tr| tr.reference.target)
        .collect();
    assert_eq!(targets.len(), 2);
    for target in &targets {
        // Both entries resolve to file offsets inside the .text section's
        // raw data (rva 0x1000 maps to file offset 0x200).
        assert!(*target >= 0x200 && *target < total_len as u32);
    }
}
