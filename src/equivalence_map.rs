//! Suffix-array-seeded, bidirectionally-extended equivalence block matching.

use crate::encoded_view::{EncodedView, MISMATCH_FATAL};
use crate::model::{Offset, NULL_OFFSET};
use crate::suffix_array::SuffixArray;

/// Base cost charged against every candidate equivalence before extension;
/// an equivalence must earn this back (plus `minimum_length`) through
/// matching tokens to survive.
const BASE_EQUIVALENCE_COST: i64 = 12;
/// Suffix-array seeds shorter than this are discarded outright.
const MIN_MATCH_LENGTH: usize = 6;
/// Threshold for the coarse first-pass ("skeleton") equivalence map used for
/// label projection.
pub const LARGE_EQUIVALENCE_SCORE: i64 = 128;
/// Threshold for the final, fine-grained equivalence map.
pub const MIN_EQUIVALENCE_SCORE: i64 = 4;

/// Every equivalence surviving `build()` at [`MIN_EQUIVALENCE_SCORE`] has
/// `length >= MIN_EQUIVALENCE_SCORE + BASE_EQUIVALENCE_COST` (since `score =
/// length - BASE_EQUIVALENCE_COST` must clear `minimum_length`). The patch
/// wire format subtracts this floor from each equivalence's encoded length so
/// the VarInt stays small; the decoder adds it back.
pub const EQUIVALENCE_LENGTH_THRESHOLD: i64 = MIN_EQUIVALENCE_SCORE + BASE_EQUIVALENCE_COST;

/// `(src, dst, length)`: bytes `old[src..src+length)` approximately match
/// `new[dst..dst+length)` under the rank metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Equivalence {
    pub src: Offset,
    pub dst: Offset,
    pub length: Offset,
}

pub const NULL_EQUIVALENCE: Equivalence =
    Equivalence { src: NULL_OFFSET, dst: NULL_OFFSET, length: NULL_OFFSET };

impl Equivalence {
    /// Advances to the next equivalence given delta-encoded wire parameters:
    /// `src` and `dst` move past this block plus a signed/unsigned delta
    /// respectively; `length` is the new block's raw length.
    pub fn advance(&mut self, diff_src: i32, diff_dst: u32, new_length: u32) {
        self.src = (self.src as i64 + self.length as i64 + diff_src as i64) as Offset;
        self.dst += self.length + diff_dst;
        self.length = new_length;
    }
}

/// Materializes an [`EncodedView`]'s per-position rank into a plain array so
/// the equivalence-map builder and suffix array can index it directly rather
/// than recomputing ranks on every access.
pub fn materialize_ranks(view: &EncodedView) -> Vec<usize> {
    (0..view.len() as Offset).map(|k| view.rank(k)).collect()
}

/// Ordered sequence of equivalences, with the two mutually-exclusive sort
/// orders (`src`, `dst`) the forward/backward mappers each require.
#[derive(Debug, Default, Clone)]
pub struct EquivalenceMap {
    equivs: Vec<Equivalence>,
}

impl EquivalenceMap {
    pub fn new(equivs: Vec<Equivalence>) -> Self {
        EquivalenceMap { equivs }
    }

    pub fn is_empty(&self) -> bool {
        self.equivs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.equivs.len()
    }

    pub fn as_slice(&self) -> &[Equivalence] {
        &self.equivs
    }

    pub fn sort_by_src(&mut self) {
        self.equivs.sort_by_key(|e| e.src);
    }

    pub fn sort_by_dst(&mut self) {
        self.equivs.sort_by_key(|e| e.dst);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Equivalence> {
        self.equivs.iter()
    }

    /// Must be called on a map sorted by `src`; successive calls must use
    /// ascending `src`.
    pub fn forward_mapper(&self) -> ForwardMapper<'_> {
        ForwardMapper { equivs: &self.equivs, cursor: 0 }
    }

    /// Must be called on a map sorted by `dst`; successive calls must use
    /// ascending `dst`.
    pub fn backward_mapper(&self) -> BackwardMapper<'_> {
        BackwardMapper { equivs: &self.equivs, cursor: 0 }
    }
}

/// Maps an old-image offset to the equivalence covering it, in ascending
/// query order. Advances monotonically through a `src`-sorted map.
pub struct ForwardMapper<'a> {
    equivs: &'a [Equivalence],
    cursor: usize,
}

impl<'a> ForwardMapper<'a> {
    pub fn map(&mut self, src: Offset) -> Option<&'a Equivalence> {
        while self.cursor < self.equivs.len()
            && self.equivs[self.cursor].src + self.equivs[self.cursor].length <= src
        {
            self.cursor += 1;
        }
        if self.cursor < self.equivs.len() && self.equivs[self.cursor].src <= src {
            Some(&self.equivs[self.cursor])
        } else {
            None
        }
    }
}

/// Maps a new-image offset to the equivalence covering it, in ascending
/// query order. Advances monotonically through a `dst`-sorted map.
pub struct BackwardMapper<'a> {
    equivs: &'a [Equivalence],
    cursor: usize,
}

impl<'a> BackwardMapper<'a> {
    pub fn map(&mut self, dst: Offset) -> Option<&'a Equivalence> {
        while self.cursor < self.equivs.len()
            && dst >= self.equivs[self.cursor].dst + self.equivs[self.cursor].length
        {
            self.cursor += 1;
        }
        if self.cursor < self.equivs.len() && dst >= self.equivs[self.cursor].dst {
            Some(&self.equivs[self.cursor])
        } else {
            None
        }
    }
}

/// Builds an equivalence map between `old_view`/`new_view`, seeding
/// candidates from `old_sa` (built over `old_ranks`) and extending each seed
/// bidirectionally with a cost/benefit heuristic. The returned map is sorted
/// by `src`.
pub fn build(
    old_view: &EncodedView,
    old_ranks: &[usize],
    old_sa: &SuffixArray,
    new_view: &EncodedView,
    new_ranks: &[usize],
    minimum_length: i64,
) -> EquivalenceMap {
    let old_size = old_ranks.len();
    let new_size = new_ranks.len();
    let mut equivs: Vec<Equivalence> = Vec::new();
    let mut previous_scores: Vec<i64> = Vec::new();
    let mut pe_cache: Option<Equivalence> = None;

    let mut dst: usize = 0;
    while dst < new_size {
        if !new_view.is_token(dst as Offset) {
            dst += 1;
            continue;
        }

        let (src0, length0) = old_sa.search(old_ranks, &new_ranks[dst..]);
        if length0 < MIN_MATCH_LENGTH {
            dst += 1;
            continue;
        }

        if let Some(last) = equivs.last() {
            let last_end = last.dst as usize + last.length as usize;
            if dst < last_end
                && (dst as i64 - src0 as i64) == (last.dst as i64 - last.src as i64)
            {
                dst = last_end;
                continue;
            }
        }

        let mut src = src0;
        let mut length = length0;
        let next_dst = dst + length;
        let current_dst = dst;

        let mut score: i64 = length as i64 - BASE_EQUIVALENCE_COST;
        let mut best_score = score;
        let mut overlap_score: i64 = 0;
        let mut best_pos: usize = 0;
        let mut penalty: i64 = 0;
        // Index into `equivs`, mirroring the C++ reverse iterator: starts at
        // the last element and walks toward the front as backward extension
        // crosses into earlier equivalences.
        let mut previous_equiv_idx: Option<usize> = equivs.len().checked_sub(1);

        let backward_limit = dst.min(src);
        for k in 1..=backward_limit {
            if !new_view.is_token((dst - k) as Offset) {
                continue;
            }

            if let Some(idx) = previous_equiv_idx {
                let prev = equivs[idx];
                let prev_end = prev.dst as usize + prev.length as usize;
                if dst - k < prev_end {
                    previous_scores.resize(prev.length as usize + 1, 0);
                    let same_as_cached =
                        pe_cache.is_some_and(|pe| pe.dst == prev.dst && pe.src == prev.src);
                    if !same_as_cached {
                        pe_cache = Some(prev);
                        let mut pscore: i64 = -BASE_EQUIVALENCE_COST;
                        let mut best_pscore = pscore;
                        for i in 0..prev.length as usize {
                            if new_view.is_token((prev.dst as usize + i) as Offset) {
                                let d = new_view.distance(
                                    old_ranks[prev.src as usize + i],
                                    new_ranks[prev.dst as usize + i],
                                );
                                pscore += 1 - d as i64;
                                best_pscore = best_pscore.max(pscore);
                            }
                            previous_scores[i + 1] =
                                if best_pscore >= minimum_length { best_pscore } else { 0 };
                        }
                    }
                    overlap_score = *previous_scores.last().unwrap();
                    previous_equiv_idx = if idx == 0 { None } else { Some(idx - 1) };
                }
            }

            let dist = new_view.distance(new_ranks[dst - k], old_ranks[src - k]);
            if dist != MISMATCH_FATAL {
                score += 1 - dist as i64;
                penalty = (penalty - 1).max(0) + dist as i64;
            } else {
                break;
            }
            if penalty >= BASE_EQUIVALENCE_COST {
                break;
            }

            if let Some(pe) = pe_cache {
                let i = (dst - k) as i64 - pe.dst as i64;
                if i >= 0 && (i as usize) < previous_scores.len() {
                    score -= overlap_score - previous_scores[i as usize];
                    overlap_score = previous_scores[i as usize];
                }
            }
            if score >= best_score {
                best_score = score;
                best_pos = k;
            }
        }
        dst -= best_pos;
        src -= best_pos;
        length += best_pos;

        let mut best_pos = length;
        let mut penalty: i64 = 0;
        let mut k = length;
        while dst + k < new_size && src + k < old_size {
            if !new_view.is_token((dst + k) as Offset) {
                if best_pos == k {
                    best_pos = k + 1;
                }
                k += 1;
                continue;
            }
            let dist = new_view.distance(new_ranks[dst + k], old_ranks[src + k]);
            if dist != MISMATCH_FATAL {
                score += 1 - dist as i64;
                penalty = (penalty - 1).max(0) + dist as i64;
            } else {
                break;
            }
            if penalty >= BASE_EQUIVALENCE_COST {
                break;
            }
            if score >= best_score {
                best_score = score;
                best_pos = k + 1;
            }
            k += 1;
        }
        length = best_pos;

        if best_score >= minimum_length {
            while let Some(last) = equivs.last() {
                if dst < last.dst as usize {
                    equivs.pop();
                    pe_cache = None;
                } else {
                    break;
                }
            }
            if let Some(last_idx) = equivs.len().checked_sub(1) {
                let last = equivs[last_idx];
                let last_end = last.dst as usize + last.length as usize;
                if dst < last_end {
                    equivs[last_idx].length = (dst - last.dst as usize) as Offset;
                    let truncated = equivs[last_idx];

                    let mut pscore: i64 = -BASE_EQUIVALENCE_COST;
                    let mut best_pscore = pscore;
                    let mut best_ppos: usize = 0;
                    for i in 0..truncated.length as usize {
                        if !new_view.is_token((truncated.dst as usize + i) as Offset) {
                            if best_ppos == i {
                                best_ppos = i + 1;
                            }
                            continue;
                        }
                        pscore += 1
                            - new_view.distance(
                                old_ranks[truncated.src as usize + i],
                                new_ranks[truncated.dst as usize + i],
                            ) as i64;
                        if pscore >= best_pscore {
                            best_pscore = pscore;
                            best_ppos = i + 1;
                        }
                    }
                    if best_pscore >= minimum_length {
                        equivs[last_idx].length = best_ppos as Offset;
                    } else {
                        equivs.pop();
                        pe_cache = None;
                    }
                }
            }

            equivs.push(Equivalence { src: src as Offset, dst: dst as Offset, length: length as Offset });
            dst = next_dst;
        } else {
            dst = current_dst + 1;
        }
    }

    equivs.sort_by_key(|e| e.src);
    EquivalenceMap::new(equivs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReferenceTraits;
    use crate::reference_holder::ReferenceHolder;

    fn no_refs() -> ReferenceHolder {
        ReferenceHolder::new()
    }

    #[test]
    fn identical_images_yield_one_maximal_equivalence() {
        let image: Vec<u8> = (0u8..=255).collect();
        let holder = no_refs();
        let old_view = EncodedView::new(&image, &holder);
        let new_view = EncodedView::new(&image, &holder);
        let old_ranks = materialize_ranks(&old_view);
        let new_ranks = materialize_ranks(&new_view);
        let sa = SuffixArray::new(&old_ranks);

        let map = build(&old_view, &old_ranks, &sa, &new_view, &new_ranks, MIN_EQUIVALENCE_SCORE);
        assert_eq!(map.len(), 1);
        let e = map.as_slice()[0];
        assert_eq!((e.src, e.dst, e.length), (0, 0, image.len() as Offset));
    }

    #[test]
    fn equivalences_are_dst_disjoint_and_in_bounds() {
        let old_image: Vec<u8> = b"the quick brown fox jumps over the lazy dog, over and over".to_vec();
        let new_image: Vec<u8> = b"the quick brown cat jumps over the lazy dog, again and over".to_vec();
        let holder = no_refs();
        let old_view = EncodedView::new(&old_image, &holder);
        let new_view = EncodedView::new(&new_image, &holder);
        let old_ranks = materialize_ranks(&old_view);
        let new_ranks = materialize_ranks(&new_view);
        let sa = SuffixArray::new(&old_ranks);

        let map = build(&old_view, &old_ranks, &sa, &new_view, &new_ranks, MIN_EQUIVALENCE_SCORE);
        let mut by_dst = map.as_slice().to_vec();
        by_dst.sort_by_key(|e| e.dst);
        for w in by_dst.windows(2) {
            assert!(w[0].dst + w[0].length <= w[1].dst, "dst ranges overlap: {w:?}");
        }
        for e in map.as_slice() {
            assert!(e.src as usize + e.length as usize <= old_image.len());
            assert!(e.dst as usize + e.length as usize <= new_image.len());
        }
        // Sorted by src after Build().
        assert!(map.as_slice().windows(2).all(|w| w[0].src <= w[1].src));
    }

    #[test]
    fn forward_and_backward_mapper_cover_equivalence_span() {
        let equivs = vec![
            Equivalence { src: 0, dst: 0, length: 10 },
            Equivalence { src: 20, dst: 10, length: 5 },
        ];
        let map = EquivalenceMap::new(equivs);
        let mut fwd = map.forward_mapper();
        assert_eq!(fwd.map(5).unwrap().dst, 0);
        assert_eq!(fwd.map(21).unwrap().dst, 10);

        let mut bwd = map.backward_mapper();
        assert_eq!(bwd.map(0).unwrap().src, 0);
        assert_eq!(bwd.map(12).unwrap().src, 20);
    }
}
