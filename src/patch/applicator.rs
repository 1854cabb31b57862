//! Patch application: reconstructs the new image from an old image and a
//! patch produced by [`super::generator::generate`], the structural inverse
//! of the generator's emission order.

use super::format::{patch_field, PatchType, ZucchiniHeader};
use super::{make_disassembler, read_element_labels};
use crate::disassembler::{dex, elf, pe, ExeType};
use crate::equivalence_map::{Equivalence, EquivalenceMap, EQUIVALENCE_LENGTH_THRESHOLD};
use crate::label_manager::{OrderedLabelManager, UnorderedLabelManager};
use crate::model::{unmark_index, Offset, Reference, ReferenceType};
use crate::reference_holder::ReferenceHolder;
use crate::stream::{SourceStream, SourceStreamSet};
use anyhow::{anyhow, ensure, Result};

struct ElementHeader {
    old: (u32, u32),
    new: (u32, u32),
    exe_type: ExeType,
    label_tables: Vec<Vec<Offset>>,
}

/// Label pool streams are keyed by a *local* pool index that every element
/// reuses, so each key carries one element's table after another; this holds
/// one persistent cursor per key across the whole patch, lazily opened on
/// first use (mirrors [`PersistentStreams::reference_delta`]).
struct PersistentStreams<'a> {
    label_streams: Vec<SourceStream<'a>>,
    reference_delta: SourceStream<'a>,
}

impl<'a> PersistentStreams<'a> {
    fn new(streams: &SourceStreamSet<'a>) -> Self {
        PersistentStreams { label_streams: Vec::new(), reference_delta: streams.get(patch_field::REFERENCE_DELTA) }
    }

    fn label_stream(&mut self, streams: &SourceStreamSet<'a>, pool: usize) -> &mut SourceStream<'a> {
        while self.label_streams.len() <= pool {
            let idx = self.label_streams.len();
            self.label_streams.push(streams.get(patch_field::LABELS + idx));
        }
        &mut self.label_streams[pool]
    }
}

fn read_element_header(
    command: &mut SourceStream,
    streams: &SourceStreamSet,
    persistent: &mut PersistentStreams,
    old_bounds: (u32, u32),
    new_bounds: (u32, u32),
) -> Result<ElementHeader> {
    let exe_type = ExeType::try_from(command.read_varint_u32()? as u8).map_err(|_| anyhow!("bad exe type in patch"))?;
    let pool_count = command.read_varint_u32()? as usize;
    let mut label_tables = Vec::with_capacity(pool_count);
    for pool in 0..pool_count {
        label_tables.push(read_element_labels(persistent.label_stream(streams, pool))?);
    }
    Ok(ElementHeader { old: old_bounds, new: new_bounds, exe_type, label_tables })
}

/// Decodes the global (spans the whole patch) equivalence stream into an
/// ascending-by-dst list of equivalences in whole-image coordinates,
/// inverting [`super::generator::emit_equivalence`].
fn read_global_equivalences(streams: &SourceStreamSet) -> Result<Vec<Equivalence>> {
    let mut src_skip = streams.get(patch_field::SRC_SKIP);
    let mut dst_skip = streams.get(patch_field::DST_SKIP);
    let mut copy_count = streams.get(patch_field::COPY_COUNT);

    let mut out = Vec::new();
    let mut cur = Equivalence { src: 0, dst: 0, length: 0 };
    while !src_skip.is_empty() {
        let diff_src = src_skip.read_varint_i32()?;
        let diff_dst = dst_skip.read_varint_u32()?;
        let raw_len = copy_count.read_varint_u32()?;
        let length = raw_len + EQUIVALENCE_LENGTH_THRESHOLD as u32;
        let src = (cur.src as i64 + cur.length as i64 + diff_src as i64) as u32;
        let dst = cur.dst + cur.length + diff_dst;
        cur = Equivalence { src, dst, length };
        out.push(cur);
    }
    Ok(out)
}

/// Rebuilds `new_image` from `old_image`, the equivalence list, and the
/// extra-data stream: copy the gap before each equivalence from extra data,
/// then copy the equivalence's span out of the old image.
fn apply_equivalences_and_extra_data(
    old_image: &[u8],
    new_len: usize,
    equivs: &[Equivalence],
    streams: &SourceStreamSet,
) -> Result<Vec<u8>> {
    let mut extra = streams.get(patch_field::EXTRA_DATA);
    let mut new_image = vec![0u8; new_len];
    let mut cursor = 0u32;
    for e in equivs {
        if cursor < e.dst {
            let gap = (e.dst - cursor) as usize;
            new_image[cursor as usize..e.dst as usize].copy_from_slice(extra.read_bytes(gap)?);
        }
        new_image[e.dst as usize..(e.dst + e.length) as usize]
            .copy_from_slice(&old_image[e.src as usize..(e.src + e.length) as usize]);
        cursor = e.dst + e.length;
    }
    if (cursor as usize) < new_len {
        let gap = new_len - cursor as usize;
        new_image[cursor as usize..].copy_from_slice(extra.read_bytes(gap)?);
    }
    Ok(new_image)
}

/// Applies the raw byte corrections recorded against the concatenation of
/// all equivalence spans, the inverse of [`super::generator::emit_raw_delta`]
/// (addition undoes the generator's subtraction).
fn apply_raw_deltas(new_image: &mut [u8], equivs: &[Equivalence], streams: &SourceStreamSet) -> Result<()> {
    let mut skip_stream = streams.get(patch_field::RAW_DELTA_SKIP);
    let mut diff_stream = streams.get(patch_field::RAW_DELTA_DIFF);

    let mut eq_idx = 0usize;
    let mut base_copy_offset: u32 = 0;
    let mut prev: i64 = 0;
    while !skip_stream.is_empty() {
        let skip = skip_stream.read_varint_u32()? as i64;
        let copy_offset = (prev + skip) as u32;
        let diff = diff_stream.read_i8()?;
        prev = copy_offset as i64 + 1;

        while eq_idx < equivs.len() && copy_offset >= base_copy_offset + equivs[eq_idx].length {
            base_copy_offset += equivs[eq_idx].length;
            eq_idx += 1;
        }
        ensure!(eq_idx < equivs.len(), "raw delta copy offset past end of equivalences");
        let dst_pos = equivs[eq_idx].dst + (copy_offset - base_copy_offset);
        new_image[dst_pos as usize] = new_image[dst_pos as usize].wrapping_add(diff as u8);
    }
    Ok(())
}

fn collect_pool_refs(holder: &ReferenceHolder, pool: u8) -> Vec<Reference> {
    let mut v = Vec::new();
    for ty in 0..holder.type_count() as ReferenceType {
        if holder.pool(ty) == pool {
            v.extend_from_slice(holder.get(ty));
        }
    }
    v
}

fn local_equivalences(global: &[Equivalence], old_base: u32, new_base: u32, new_len: u32) -> EquivalenceMap {
    let local: Vec<Equivalence> = global
        .iter()
        .filter(|e| e.dst >= new_base && e.dst < new_base + new_len)
        .map(|e| Equivalence { src: e.src - old_base, dst: e.dst - new_base, length: e.length })
        .collect();
    EquivalenceMap::new(local)
}

/// Re-encodes a reference's target into `real_image` (a mutable view over
/// just this element's byte range), by reparsing `snapshot` (an immutable
/// copy of the same bytes, taken before this element's reference corrections
/// began) to recover the format's layout.
fn write_back(exe_type: ExeType, snapshot: &[u8], real_image: &mut [u8], ty: ReferenceType, location: Offset, target: Offset) -> Result<()> {
    match exe_type {
        ExeType::NoOp => Ok(()),
        ExeType::Win32X86 => pe::DisassemblerWin32::parse(snapshot, pe::Bitness::X86)
            .ok_or_else(|| anyhow!("failed to reparse PE32 element for write-back"))?
            .write_reference(real_image, ty, location, target),
        ExeType::Win32X64 => pe::DisassemblerWin32::parse(snapshot, pe::Bitness::X64)
            .ok_or_else(|| anyhow!("failed to reparse PE32+ element for write-back"))?
            .write_reference(real_image, ty, location, target),
        ExeType::ElfX86 | ExeType::ElfArm32 | ExeType::ElfAArch64 => elf::DisassemblerElf::parse(snapshot)
            .ok_or_else(|| anyhow!("failed to reparse ELF element for write-back"))?
            .write_reference(real_image, ty, location, target),
        ExeType::Dex => dex::DisassemblerDex::parse(snapshot)
            .ok_or_else(|| anyhow!("failed to reparse DEX element for write-back"))?
            .write_reference(real_image, ty, location, target),
    }
}

fn find_exact(holder: &ReferenceHolder, ty: ReferenceType, location: Offset) -> Option<Reference> {
    let refs = holder.get(ty);
    refs.binary_search_by_key(&location, |r| r.location).ok().map(|i| refs[i])
}

/// Applies reference corrections for a single matched element: projects old
/// reference targets through the element's equivalences and the transmitted
/// label deltas, then re-encodes each corrected target at its (already
/// correctly positioned) new location.
fn apply_reference_corrections(
    old_image: &[u8],
    new_image: &mut [u8],
    elt: &ElementHeader,
    global_equivs: &[Equivalence],
    ref_delta: &mut SourceStream,
) -> Result<()> {
    if elt.exe_type == ExeType::NoOp {
        return Ok(());
    }
    let (old_start, old_size) = elt.old;
    let (new_start, new_size) = elt.new;
    let old_sub = &old_image[old_start as usize..(old_start + old_size) as usize];
    let new_snapshot = new_image[new_start as usize..(new_start + new_size) as usize].to_vec();

    let mut old_disasm = make_disassembler(elt.exe_type, old_sub)?;
    let mut new_disasm = make_disassembler(elt.exe_type, &new_snapshot)?;
    let mut old_holder = old_disasm.build_reference_holder();
    let new_holder = new_disasm.build_reference_holder();
    let pool_count = elt.label_tables.len();

    let mut old_labels_by_pool = Vec::with_capacity(pool_count);
    for pool in 0..pool_count {
        let mut mgr = OrderedLabelManager::new();
        mgr.allocate(&collect_pool_refs(&old_holder, pool as u8));
        old_labels_by_pool.push(mgr);
    }
    for ty in 0..old_disasm.num_reference_types() {
        let traits = old_disasm.reference_traits(ty);
        let mut refs = old_holder.get(ty).to_vec();
        old_labels_by_pool[traits.pool as usize].assign(&mut refs);
        old_holder.insert(traits, refs);
    }

    let mut new_labels_by_pool = Vec::with_capacity(pool_count);
    for table in &elt.label_tables {
        let mut mgr = UnorderedLabelManager::new();
        mgr.init(table.clone());
        new_labels_by_pool.push(mgr);
    }

    let local_map = local_equivalences(global_equivs, old_start, new_start, new_size);

    for ty in 0..new_disasm.num_reference_types() {
        let traits = new_disasm.reference_traits(ty);
        let pool = traits.pool as usize;
        let mut bwd = local_map.backward_mapper();
        for nref in new_holder.get(ty) {
            let Some(e) = bwd.map(nref.location) else { continue };
            let src_loc = e.src + (nref.location - e.dst);
            let Some(oref) = find_exact(&old_holder, ty, src_loc) else { continue };
            let delta = ref_delta.read_varint_i32()?;
            let new_label_idx = (unmark_index(oref.target) as i64 + delta as i64) as u32;
            let target = new_labels_by_pool[pool].table().at(new_label_idx);
            write_back(
                elt.exe_type,
                &new_snapshot,
                &mut new_image[new_start as usize..(new_start + new_size) as usize],
                ty,
                nref.location,
                target,
            )?;
        }
    }
    Ok(())
}

/// Top-level entry point: verifies the old image, decodes the command
/// stream into one or more element headers, reconstructs the new image from
/// the global equivalence/extra-data/raw-delta streams, then walks each
/// element applying its reference corrections, the inverse of
/// [`super::generator::generate`].
pub fn apply(old_image: &[u8], patch_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut top = SourceStream::new(patch_bytes);
    let header = ZucchiniHeader::read(&mut top)?;
    header.verify_old(old_image)?;

    let streams = SourceStreamSet::init(&mut top)?;
    let mut command = streams.get(patch_field::COMMAND);
    let patch_type =
        PatchType::from_u32(command.read_varint_u32()?).ok_or_else(|| anyhow!("bad patch type in patch"))?;
    let mut persistent = PersistentStreams::new(&streams);

    let mut elements = Vec::new();
    match patch_type {
        PatchType::Raw | PatchType::Single => {
            let elt = read_element_header(
                &mut command,
                &streams,
                &mut persistent,
                (0, header.old_size),
                (0, header.new_size),
            )?;
            elements.push(elt);
        }
        PatchType::Ensemble => {
            let num_elements = command.read_varint_u32()? as usize;
            for _ in 0..num_elements {
                let old_start = command.read_varint_u32()?;
                let old_size = command.read_varint_u32()?;
                let new_start = command.read_varint_u32()?;
                let new_size = command.read_varint_u32()?;
                let elt = read_element_header(
                    &mut command,
                    &streams,
                    &mut persistent,
                    (old_start, old_size),
                    (new_start, new_size),
                )?;
                elements.push(elt);
            }
        }
    }

    let global_equivs = read_global_equivalences(&streams)?;
    let mut new_image =
        apply_equivalences_and_extra_data(old_image, header.new_size as usize, &global_equivs, &streams)?;
    apply_raw_deltas(&mut new_image, &global_equivs, &streams)?;

    for elt in &elements {
        apply_reference_corrections(old_image, &mut new_image, elt, &global_equivs, &mut persistent.reference_delta)?;
    }

    header.verify_new(&new_image)?;
    Ok(new_image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::generator::{generate, GenerateOptions};

    #[test]
    fn rejects_corrupt_magic() {
        let mut bytes = vec![0u8; 4];
        bytes[0] = 0xFF;
        assert!(apply(b"old", &bytes).is_err());
    }

    #[test]
    fn rejects_old_image_mismatch() {
        let old_image = b"the quick brown fox".to_vec();
        let new_image = b"the slow brown fox, indeed".to_vec();
        let opts = GenerateOptions { force_raw: true, imposed_matches: String::new() };
        let patch = generate(&opts, &old_image, &new_image).unwrap();
        assert!(apply(b"not the old image at all", &patch).is_err());
    }

    #[test]
    fn single_match_patch_roundtrips() {
        let old_image = vec![0x10u8; 64];
        let mut new_image = old_image.clone();
        new_image[10] = 0xAB;
        new_image[40] = 0xCD;
        let opts = GenerateOptions::default();
        let patch = generate(&opts, &old_image, &new_image).unwrap();
        let applied = apply(&old_image, &patch).unwrap();
        assert_eq!(applied, new_image);
    }
}
