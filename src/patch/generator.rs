//! Patch generation: drives ensemble matching, builds a two-pass
//! equivalence map and label projection per matched element, and emits the
//! delta-encoded equivalence/extra-data/raw-delta/reference-delta/label
//! streams that make up the patch body.

use super::format::{patch_field, PatchType, ZucchiniHeader};
use super::{make_disassembler, write_element_labels};
use crate::disassembler::ExeType;
use crate::encoded_view::EncodedView;
use crate::ensemble::{Element, EnsembleMatcher};
use crate::equivalence_map::{
    self, Equivalence, EquivalenceMap, EQUIVALENCE_LENGTH_THRESHOLD, LARGE_EQUIVALENCE_SCORE, MIN_EQUIVALENCE_SCORE,
};
use crate::label_manager::{OrderedLabelManager, UnorderedLabelManager};
use crate::model::{unmark_index, Offset, Reference, ReferenceType, UNUSED_INDEX};
use crate::reference_bytes_mixer::{ArmMixer, BytesMixer};
use crate::reference_holder::ReferenceHolder;
use crate::stream::{SinkStream, SinkStreamSet};
use crate::suffix_array::SuffixArray;
use anyhow::Result;

pub struct GenerateOptions {
    pub force_raw: bool,
    pub imposed_matches: String,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        GenerateOptions { force_raw: false, imposed_matches: String::new() }
    }
}

/// Running state threaded through the whole patch body: the equivalence
/// stream's previous block (for delta-encoding src/dst/length) and the raw
/// delta stream's cumulative "bytes copied so far" counter, both of which
/// span every element and separator in new-image order.
struct PatchState {
    cur_equiv: Equivalence,
    raw_delta_prev: i64,
    global_copy_offset: u32,
}

impl PatchState {
    fn new() -> Self {
        PatchState { cur_equiv: Equivalence { src: 0, dst: 0, length: 0 }, raw_delta_prev: 0, global_copy_offset: 0 }
    }
}

fn emit_equivalence(streams: &mut SinkStreamSet, state: &mut PatchState, e: Equivalence) {
    let diff_src = e.src as i64 - (state.cur_equiv.src as i64 + state.cur_equiv.length as i64);
    let diff_dst = e.dst - (state.cur_equiv.dst + state.cur_equiv.length);
    let raw_len = e.length as i64 - EQUIVALENCE_LENGTH_THRESHOLD;
    streams.get(patch_field::SRC_SKIP).write_varint_i32(diff_src as i32);
    streams.get(patch_field::DST_SKIP).write_varint_u32(diff_dst);
    streams.get(patch_field::COPY_COUNT).write_varint_u32(raw_len.max(0) as u32);
    state.cur_equiv = e;
}

fn emit_extra_data(streams: &mut SinkStreamSet, bytes: &[u8]) {
    streams.get(patch_field::EXTRA_DATA).write_bytes(bytes);
}

fn emit_raw_delta(streams: &mut SinkStreamSet, state: &mut PatchState, copy_offset: u32, diff: i8) {
    let skip = copy_offset as i64 - state.raw_delta_prev;
    streams.get(patch_field::RAW_DELTA_SKIP).write_varint_u32(skip as u32);
    streams.get(patch_field::RAW_DELTA_DIFF).write_i8(diff);
    state.raw_delta_prev = copy_offset as i64 + 1;
}

/// Top-level entry point: runs ensemble matching, picks RAW/SINGLE/ENSEMBLE,
/// and serializes the resulting patch.
pub fn generate(opts: &GenerateOptions, old_image: &[u8], new_image: &[u8]) -> Result<Vec<u8>> {
    let mut matcher = EnsembleMatcher::new();
    let patch_type = if opts.force_raw {
        matcher.run_raw_match(old_image, new_image);
        PatchType::Raw
    } else {
        match matcher.run_match(old_image, new_image, &opts.imposed_matches) {
            Ok(()) if !matcher.matches.is_empty() => {
                let whole_image_match = matcher.matches.len() == 1
                    && matcher.matches[0].old.start == 0
                    && matcher.matches[0].old.end == old_image.len() as u32
                    && matcher.matches[0].new.start == 0
                    && matcher.matches[0].new.end == new_image.len() as u32;
                if whole_image_match {
                    PatchType::Single
                } else {
                    PatchType::Ensemble
                }
            }
            _ => {
                matcher.run_raw_match(old_image, new_image);
                PatchType::Raw
            }
        }
    };

    let mut streams = SinkStreamSet::new();
    streams.get(patch_field::COMMAND).write_varint_u32(patch_type as u32);

    let mut state = PatchState::new();
    match patch_type {
        PatchType::Raw | PatchType::Single => {
            let m = matcher.matches[0];
            generate_for_match(old_image, new_image, &m.old, &m.new, &mut streams, &mut state)?;
        }
        PatchType::Ensemble => {
            streams.get(patch_field::COMMAND).write_varint_u32(matcher.matches.len() as u32);
            generate_ensemble(old_image, new_image, &matcher, &mut streams, &mut state)?;
        }
    }

    let header = ZucchiniHeader::compute(old_image, new_image);
    let mut out = SinkStream::new();
    header.write(&mut out);
    out.write_bytes(&streams.serialize_to_vec()?);
    Ok(out.into_bytes())
}

fn generate_ensemble(
    old_image: &[u8],
    new_image: &[u8],
    matcher: &EnsembleMatcher,
    streams: &mut SinkStreamSet,
    state: &mut PatchState,
) -> Result<()> {
    // Separator equivalence maps share one suffix array over the whole old
    // image rather than rebuilding it per gap.
    let no_refs = ReferenceHolder::new();
    let old_view = EncodedView::new(old_image, &no_refs);
    let old_ranks = equivalence_map::materialize_ranks(&old_view);
    let sa = SuffixArray::new(&old_ranks);

    let n = matcher.matches.len();
    for i in 0..n {
        let (sep_start, sep_end) = matcher.separators[i];
        if sep_end > sep_start {
            generate_separator(old_image, new_image, &old_view, &old_ranks, &sa, sep_start, sep_end, streams, state)?;
        }
        let m = &matcher.matches[i];
        streams.get(patch_field::COMMAND).write_varint_u32(m.old.start);
        streams.get(patch_field::COMMAND).write_varint_u32(m.old.len());
        streams.get(patch_field::COMMAND).write_varint_u32(m.new.start);
        streams.get(patch_field::COMMAND).write_varint_u32(m.new.len());
        generate_for_match(old_image, new_image, &m.old, &m.new, streams, state)?;
    }
    let (sep_start, sep_end) = matcher.separators[n];
    if sep_end > sep_start {
        generate_separator(old_image, new_image, &old_view, &old_ranks, &sa, sep_start, sep_end, streams, state)?;
    }
    Ok(())
}

/// Raw (reference-free) equivalence matching for an ensemble separator: a
/// stretch of "new" image not covered by any matched element, diffed against
/// the whole "old" image.
fn generate_separator(
    old_image: &[u8],
    new_image: &[u8],
    old_view: &EncodedView,
    old_ranks: &[usize],
    sa: &SuffixArray,
    start: u32,
    end: u32,
    streams: &mut SinkStreamSet,
    state: &mut PatchState,
) -> Result<()> {
    let no_refs = ReferenceHolder::new();
    let new_sub = &new_image[start as usize..end as usize];
    let new_view = EncodedView::new(new_sub, &no_refs);
    let new_ranks = equivalence_map::materialize_ranks(&new_view);
    let mut map = equivalence_map::build(old_view, old_ranks, sa, &new_view, &new_ranks, MIN_EQUIVALENCE_SCORE);
    map.sort_by_dst();
    emit_raw_equivalences(old_image, new_sub, &map, 0, start, streams, state);
    Ok(())
}

/// Emits equivalences/extra-data/raw-delta for a map with no references
/// (separators, or any element whose exe type has none). `old_base`/`new_base`
/// displace local equivalence coordinates into whole-patch global offsets.
fn emit_raw_equivalences(
    old_image: &[u8],
    new_sub: &[u8],
    map: &EquivalenceMap,
    old_base: u32,
    new_base: u32,
    streams: &mut SinkStreamSet,
    state: &mut PatchState,
) {
    let mut cursor = 0u32;
    for e in map.iter() {
        if cursor < e.dst {
            emit_extra_data(streams, &new_sub[cursor as usize..e.dst as usize]);
        }
        emit_equivalence(streams, state, Equivalence { src: e.src + old_base, dst: e.dst + new_base, length: e.length });
        cursor = e.dst + e.length;
    }
    if (cursor as usize) < new_sub.len() {
        emit_extra_data(streams, &new_sub[cursor as usize..]);
    }

    for e in map.iter() {
        for i in 0..e.length {
            let a = new_sub[(e.dst + i) as usize];
            let b = old_image[(old_base as usize) + (e.src + i) as usize];
            let diff = a.wrapping_sub(b);
            if diff != 0 {
                emit_raw_delta(streams, state, state.global_copy_offset + i, diff as i8);
            }
        }
        state.global_copy_offset += e.length;
    }
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

/// Projects old labels onto the new image through a skeleton equivalence map:
/// each old label is assigned to the covering equivalence with greatest
/// length, tied-broken by smallest destination; unprojectable labels get
/// `UNUSED_INDEX`.
fn project_labels(old_mgr: &OrderedLabelManager, map: &EquivalenceMap) -> UnorderedLabelManager {
    let old_labels = old_mgr.table().labels();
    let mut projected = vec![UNUSED_INDEX; old_labels.len()];
    for (idx, &l) in old_labels.iter().enumerate() {
        let mut best: Option<&Equivalence> = None;
        for e in map.as_slice() {
            if l >= e.src && l < e.src + e.length {
                let better = match best {
                    None => true,
                    Some(b) => e.length > b.length || (e.length == b.length && e.dst < b.dst),
                };
                if better {
                    best = Some(e);
                }
            }
        }
        if let Some(e) = best {
            projected[idx] = e.dst + (l - e.src);
        }
    }
    let mut mgr = UnorderedLabelManager::new();
    mgr.init(projected);
    mgr
}

fn find_exact(holder: &ReferenceHolder, ty: ReferenceType, location: Offset) -> Option<Reference> {
    let refs = holder.get(ty);
    refs.binary_search_by_key(&location, |r| r.location).ok().map(|i| refs[i])
}

/// Generates the full per-element pipeline: reference extraction, two-pass
/// equivalence map construction and label projection, then
/// equivalence/extra-data/raw-delta/reference-delta/label stream emission.
fn generate_for_match(
    old_image: &[u8],
    new_image: &[u8],
    old_elt: &Element,
    new_elt: &Element,
    streams: &mut SinkStreamSet,
    state: &mut PatchState,
) -> Result<()> {
    let old_sub = &old_image[old_elt.start as usize..old_elt.end as usize];
    let new_sub = &new_image[new_elt.start as usize..new_elt.end as usize];

    streams.get(patch_field::COMMAND).write_varint_u32(u8::from(new_elt.exe_type) as u32);

    if old_elt.exe_type == ExeType::NoOp || new_elt.exe_type == ExeType::NoOp {
        streams.get(patch_field::COMMAND).write_varint_u32(0); // pool_count
        let no_refs = ReferenceHolder::new();
        let old_view = EncodedView::new(old_sub, &no_refs);
        let new_view = EncodedView::new(new_sub, &no_refs);
        let old_ranks = equivalence_map::materialize_ranks(&old_view);
        let new_ranks = equivalence_map::materialize_ranks(&new_view);
        let sa = SuffixArray::new(&old_ranks);
        let mut map = equivalence_map::build(&old_view, &old_ranks, &sa, &new_view, &new_ranks, MIN_EQUIVALENCE_SCORE);
        map.sort_by_dst();
        emit_raw_equivalences(old_sub, new_sub, &map, old_elt.start, new_elt.start, streams, state);
        return Ok(());
    }

    let mut old_disasm = make_disassembler(old_elt.exe_type, old_sub)?;
    let mut new_disasm = make_disassembler(new_elt.exe_type, new_sub)?;
    let mut old_holder = old_disasm.build_reference_holder();
    let mut new_holder = new_disasm.build_reference_holder();
    let pool_count = old_holder.pool_count().max(new_holder.pool_count());

    // Pass 1: coarse skeleton map over unassigned (raw) ranks, used only to
    // project old labels onto candidate new positions.
    let (skeleton, mut old_labels_by_pool, mut new_labels_by_pool) = {
        let old_view = EncodedView::new(old_disasm.image(), &old_holder);
        let new_view = EncodedView::new(new_disasm.image(), &new_holder);
        let old_ranks = equivalence_map::materialize_ranks(&old_view);
        let new_ranks = equivalence_map::materialize_ranks(&new_view);
        let sa = SuffixArray::new(&old_ranks);
        let skeleton = equivalence_map::build(&old_view, &old_ranks, &sa, &new_view, &new_ranks, LARGE_EQUIVALENCE_SCORE);

        let mut old_labels_by_pool = vec![OrderedLabelManager::new(); pool_count];
        let mut new_labels_by_pool = vec![UnorderedLabelManager::new(); pool_count];
        for pool in 0..pool_count {
            let refs = collect_pool_refs(&old_holder, pool as u8);
            old_labels_by_pool[pool].allocate(&refs);
            new_labels_by_pool[pool] = project_labels(&old_labels_by_pool[pool], &skeleton);
        }
        (skeleton, old_labels_by_pool, new_labels_by_pool)
    };
    let _ = &skeleton;

    // Mark references with the projected labels before the fine pass, so the
    // encoded view can tell "same projected target" apart from "different".
    for ty in 0..old_disasm.num_reference_types() {
        let traits = old_disasm.reference_traits(ty);
        let mut refs = old_holder.get(ty).to_vec();
        old_labels_by_pool[traits.pool as usize].assign(&mut refs);
        old_holder.insert(traits, refs);
    }
    for ty in 0..new_disasm.num_reference_types() {
        let traits = new_disasm.reference_traits(ty);
        let mut refs = new_holder.get(ty).to_vec();
        new_labels_by_pool[traits.pool as usize].assign(&mut refs);
        new_holder.insert(traits, refs);
    }

    // Pass 2: fine equivalence map at the real threshold, plus any new
    // reference targets the skeleton pass couldn't project (extra labels).
    let (mut final_map, extra_by_pool) = {
        let mut old_view = EncodedView::new(old_disasm.image(), &old_holder);
        let mut new_view = EncodedView::new(new_disasm.image(), &new_holder);
        for pool in 0..pool_count {
            let cnt = old_labels_by_pool[pool].len();
            old_view.set_label_count(pool as u8, cnt);
            new_view.set_label_count(pool as u8, cnt);
        }
        let old_ranks = equivalence_map::materialize_ranks(&old_view);
        let new_ranks = equivalence_map::materialize_ranks(&new_view);
        let sa = SuffixArray::new(&old_ranks);
        let map = equivalence_map::build(&old_view, &old_ranks, &sa, &new_view, &new_ranks, MIN_EQUIVALENCE_SCORE);

        let mut extra_by_pool = Vec::with_capacity(pool_count);
        for pool in 0..pool_count {
            let refs = collect_pool_refs(&new_holder, pool as u8);
            let mut extra = OrderedLabelManager::new();
            extra.allocate(&refs);
            extra_by_pool.push(extra);
        }
        (map, extra_by_pool)
    };
    final_map.sort_by_dst();

    for pool in 0..pool_count {
        let extra_targets = extra_by_pool[pool].table().labels().to_vec();
        new_labels_by_pool[pool].digest(extra_targets);
    }
    for ty in 0..new_disasm.num_reference_types() {
        let traits = new_disasm.reference_traits(ty);
        let mut refs = new_holder.get(ty).to_vec();
        new_labels_by_pool[traits.pool as usize].assign_or_allocate(&mut refs);
        new_holder.insert(traits, refs);
    }

    streams.get(patch_field::COMMAND).write_varint_u32(pool_count as u32);
    for pool in 0..pool_count {
        write_element_labels(streams.get(patch_field::LABELS + pool), new_labels_by_pool[pool].table().labels());
    }

    emit_raw_equivalences(old_sub, new_sub, &final_map, old_elt.start, new_elt.start, streams, state);
    generate_reference_aware_raw_delta(old_sub, new_sub, &final_map, &new_holder, old_disasm.translator(), new_disasm.translator(), new_elt.exe_type, streams, state)?;
    generate_references_delta(&old_holder, &new_holder, &final_map, new_disasm.num_reference_types(), streams);

    Ok(())
}

/// Bytewise raw-delta diff of each equivalence's span, mixing reference
/// opcode/displacement bytes where the exe type needs it: a later
/// reference-correction pass fixes the target, so the raw diff only needs to
/// encode what mixing doesn't already predict.
fn generate_reference_aware_raw_delta(
    old_sub: &[u8],
    new_sub: &[u8],
    map: &EquivalenceMap,
    new_holder: &ReferenceHolder,
    old_translator: &crate::region::AddressTranslator,
    new_translator: &crate::region::AddressTranslator,
    exe_type: ExeType,
    streams: &mut SinkStreamSet,
    state: &mut PatchState,
) -> Result<()> {
    let mixer = ArmMixer::for_exe_type(exe_type);
    let new_ref_list: Vec<_> = new_holder.iter_sorted_by_location().collect();
    let mut ref_cursor = 0usize;

    for e in map.iter() {
        let mut i = 0u32;
        while i < e.length {
            let new_loc = e.dst + i;
            while ref_cursor < new_ref_list.len() && new_ref_list[ref_cursor].reference.location < new_loc {
                ref_cursor += 1;
            }
            let at_ref = ref_cursor < new_ref_list.len() && new_ref_list[ref_cursor].reference.location == new_loc;
            if at_ref {
                let tref = new_ref_list[ref_cursor];
                let width = new_holder.width(tref.ty) as u32;
                let nbytes = mixer.num_bytes(tref.ty);
                let old_loc = e.src + i;
                if nbytes == 0 {
                    // Nothing for the mixer to predict: the later reference-correction
                    // pass will rewrite this whole field, so no raw diff is needed.
                } else if nbytes as u32 <= width {
                    let mut out = new_sub[new_loc as usize..new_loc as usize + nbytes].to_vec();
                    let old_bytes = &old_sub[old_loc as usize..old_loc as usize + nbytes];
                    let old_rva = old_translator.offset_to_rva(old_loc)?;
                    let new_rva = new_translator.offset_to_rva(new_loc)?;
                    mixer.mix(tref.ty, old_bytes, old_rva, new_rva, &mut out);
                    for k in 0..nbytes {
                        let diff = out[k].wrapping_sub(old_bytes[k]);
                        if diff != 0 {
                            emit_raw_delta(streams, state, state.global_copy_offset + i + k as u32, diff as i8);
                        }
                    }
                    for k in nbytes as u32..width {
                        let a = new_sub[(new_loc + k) as usize];
                        let b = old_sub[(old_loc + k) as usize];
                        let diff = a.wrapping_sub(b);
                        if diff != 0 {
                            emit_raw_delta(streams, state, state.global_copy_offset + i + k, diff as i8);
                        }
                    }
                } else {
                    for k in 0..width {
                        let a = new_sub[(new_loc + k) as usize];
                        let b = old_sub[(old_loc + k) as usize];
                        let diff = a.wrapping_sub(b);
                        if diff != 0 {
                            emit_raw_delta(streams, state, state.global_copy_offset + i + k, diff as i8);
                        }
                    }
                }
                i += width;
                ref_cursor += 1;
            } else {
                let a = new_sub[new_loc as usize];
                let b = old_sub[(e.src + i) as usize];
                let diff = a.wrapping_sub(b);
                if diff != 0 {
                    emit_raw_delta(streams, state, state.global_copy_offset + i, diff as i8);
                }
                i += 1;
            }
        }
        state.global_copy_offset += e.length;
    }
    Ok(())
}

/// Emits the signed label-index delta for every new reference covered by an
/// equivalence: references outside all equivalences live in extra data and
/// need no correction.
fn generate_references_delta(
    old_holder: &ReferenceHolder,
    new_holder: &ReferenceHolder,
    map: &EquivalenceMap,
    num_types: u8,
    streams: &mut SinkStreamSet,
) {
    for ty in 0..num_types {
        let refs = new_holder.get(ty);
        let mut bwd = map.backward_mapper();
        for nref in refs {
            if let Some(e) = bwd.map(nref.location) {
                let src_loc = e.src + (nref.location - e.dst);
                if let Some(oref) = find_exact(old_holder, ty, src_loc) {
                    let delta = unmark_index(nref.target) as i64 - unmark_index(oref.target) as i64;
                    streams.get(patch_field::REFERENCE_DELTA).write_varint_i32(delta as i32);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_patch_roundtrips_through_applicator() {
        let old_image = b"the quick brown fox jumps over the lazy dog".to_vec();
        let new_image = b"the quick brown cat jumps over the lazy dog, again".to_vec();
        let opts = GenerateOptions { force_raw: true, imposed_matches: String::new() };
        let patch = generate(&opts, &old_image, &new_image).unwrap();

        let applied = crate::patch::applicator::apply(&old_image, &patch).unwrap();
        assert_eq!(applied, new_image);
    }

    #[test]
    fn ensemble_patch_generates_without_error() {
        let old_image = vec![0x42u8; 256];
        let mut new_image = old_image.clone();
        new_image[100] = 0x99;
        let opts = GenerateOptions::default();
        let patch = generate(&opts, &old_image, &new_image).unwrap();
        assert!(!patch.is_empty());
    }
}
