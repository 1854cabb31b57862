//! Abstract rank sequence over image bytes + typed references.

use crate::model::{is_marked, unmark_index, Offset, Pool, NO_REF_TYPE};
use crate::reference_holder::ReferenceHolder;

/// Rank assigned to a reference *continuation* byte (every byte of a
/// reference after its first).
pub const REFERENCE_PADDING_RANK: usize = 256;

/// First rank value used by reference heads; raw bytes occupy `0..256`.
pub const BASE_REF_RANK: usize = 257;

/// Sentinel [`EncodedView::distance`] result meaning the two ranks can never
/// be considered similar (mixing a reference rank with a raw-byte rank, or
/// references of different types).
pub const MISMATCH_FATAL: i32 = -1;
const MISMATCH_REFERENCE: i32 = 2;
const MISMATCH_RAW: i32 = 2;

/// Per-position rank view over an image, built once from its reference
/// holder. Computes ranks on demand rather than precomputing the whole
/// sequence (cardinality can be large, but the `types` side table lets each
/// query stay O(1) amortized).
pub struct EncodedView<'a> {
    image: &'a [u8],
    /// `types[k]`: the reference type occupying byte `k`, or `NO_REF_TYPE`.
    types: Vec<u8>,
    references: &'a ReferenceHolder,
    /// Per-pool "unassigned" sentinel rank base; indexed by pool.
    label_count: Vec<usize>,
}

impl<'a> EncodedView<'a> {
    pub fn new(image: &'a [u8], references: &'a ReferenceHolder) -> Self {
        let mut types = vec![NO_REF_TYPE; image.len()];
        for tref in references.iter_sorted_by_type() {
            let width = references.width(tref.ty) as u32;
            for i in 0..width {
                types[(tref.reference.location + i) as usize] = tref.ty;
            }
        }
        let label_count = vec![1usize; references.type_count().max(references.pool_count())];
        EncodedView { image, types, references, label_count }
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// Sets the label count for `pool`, used both by [`Self::rank`] (to pick
    /// the "unassigned" sentinel) and [`Self::cardinality`].
    pub fn set_label_count(&mut self, pool: Pool, count: usize) {
        let pool = pool as usize;
        if pool >= self.label_count.len() {
            self.label_count.resize(pool + 1, 1);
        }
        self.label_count[pool] = count;
    }

    pub fn rank(&self, idx: Offset) -> usize {
        let ty = self.types[idx as usize];
        if ty == NO_REF_TYPE {
            return self.image[idx as usize] as usize;
        }
        let reference = self
            .references
            .find(ty, idx)
            .expect("types table and reference holder disagree");
        debug_assert!(idx >= reference.location);
        if idx != reference.location {
            return REFERENCE_PADDING_RANK;
        }
        let target = if is_marked(reference.target) {
            unmark_index(reference.target) as usize
        } else {
            self.label_count[self.references.pool(ty) as usize]
        };
        target * self.references.type_count() + ty as usize + BASE_REF_RANK
    }

    pub fn cardinality(&self) -> usize {
        let type_count = self.references.type_count();
        if type_count == 0 {
            return BASE_REF_RANK;
        }
        let max_width = (0..type_count)
            .map(|ty| self.label_count[self.references.pool(ty as u8) as usize] + 1)
            .max()
            .unwrap_or(1);
        max_width * type_count + BASE_REF_RANK
    }

    /// True for every non-reference byte, and for the head byte of a
    /// reference only.
    pub fn is_token(&self, idx: Offset) -> bool {
        let ty = self.types[idx as usize];
        if ty == NO_REF_TYPE {
            return true;
        }
        let reference = self
            .references
            .find(ty, idx)
            .expect("types table and reference holder disagree");
        idx == reference.location
    }

    /// Symmetric rank-compatibility metric used by the equivalence-map
    /// builder.
    pub fn distance(&self, a: usize, b: usize) -> i32 {
        let type_count = self.references.type_count();
        if a >= BASE_REF_RANK && b >= BASE_REF_RANK {
            let (a, b) = (a - BASE_REF_RANK, b - BASE_REF_RANK);
            let ty_a = a % type_count;
            let ty_b = b % type_count;
            if ty_a != ty_b {
                return MISMATCH_FATAL;
            }
            if a / type_count != b / type_count {
                MISMATCH_REFERENCE
            } else {
                0
            }
        } else if a < BASE_REF_RANK && b < BASE_REF_RANK {
            if a != b {
                MISMATCH_RAW
            } else {
                0
            }
        } else {
            MISMATCH_FATAL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{mark_index, Reference, ReferenceTraits};

    fn holder_with_one_abs32(location: u32, target: Offset) -> ReferenceHolder {
        let mut h = ReferenceHolder::new();
        h.insert(
            ReferenceTraits { ty: 0, pool: 0, width: 4 },
            vec![Reference::new(location, target)],
        );
        h
    }

    #[test]
    fn rank_of_raw_byte_is_its_value() {
        let image = [0x41u8, 0x00, 0x00, 0x00, 0x99];
        let holder = ReferenceHolder::new();
        let view = EncodedView::new(&image, &holder);
        assert_eq!(view.rank(0), 0x41);
        assert_eq!(view.rank(4), 0x99);
    }

    #[test]
    fn reference_head_and_continuation_ranks() {
        let image = [0u8; 8];
        let holder = holder_with_one_abs32(2, mark_index(5));
        let mut view = EncodedView::new(&image, &holder);
        view.set_label_count(0, 10);
        assert_eq!(view.rank(3), REFERENCE_PADDING_RANK);
        assert!(view.rank(2) >= BASE_REF_RANK);
        assert!(view.is_token(2));
        assert!(!view.is_token(3));
        assert!(view.is_token(0));
    }

    #[test]
    fn rank_always_below_cardinality() {
        let image = [0u8; 8];
        let holder = holder_with_one_abs32(2, mark_index(5));
        let mut view = EncodedView::new(&image, &holder);
        view.set_label_count(0, 10);
        for k in 0..image.len() as Offset {
            assert!(view.rank(k) < view.cardinality());
        }
    }

    #[test]
    fn distance_rules() {
        let image = [0u8; 8];
        let holder = holder_with_one_abs32(0, mark_index(1));
        let view = EncodedView::new(&image, &holder);
        assert_eq!(view.distance(5, 5), 0);
        assert_eq!(view.distance(5, 6), MISMATCH_RAW);
        assert_eq!(view.distance(5, BASE_REF_RANK), MISMATCH_FATAL);
        assert_eq!(view.distance(BASE_REF_RANK, BASE_REF_RANK), 0);
    }
}
