//! Ordered (binary-search) and unordered (hash) target-to-index label
//! managers.

use crate::model::{is_marked, mark_index, unmark_index, Offset, Reference, UNUSED_INDEX};
use std::collections::HashMap;

/// Shared behavior: the label table itself, and `unassign` (the inverse of
/// `assign`), which both manager flavors implement identically.
#[derive(Debug, Default, Clone)]
pub struct LabelTable {
    labels: Vec<Offset>,
}

impl LabelTable {
    pub fn labels(&self) -> &[Offset] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn at(&self, index: Offset) -> Offset {
        self.labels[index as usize]
    }

    pub fn clear(&mut self) {
        self.labels.clear();
    }

    /// Replaces `reference.target` with the table value it points to, if
    /// marked. No-op for unmarked references.
    pub fn unassign_one(&self, reference: &mut Reference) {
        if is_marked(reference.target) {
            reference.target = self.labels[unmark_index(reference.target) as usize];
        }
    }

    pub fn unassign(&self, refs: &mut [Reference]) {
        for r in refs.iter_mut() {
            self.unassign_one(r);
        }
    }
}

/// Maintains a sorted, duplicate-free, hole-free target table; assigns labels
/// via binary search. Used for old-image references, whose full target set is
/// known up front.
#[derive(Debug, Default, Clone)]
pub struct OrderedLabelManager {
    table: LabelTable,
}

impl OrderedLabelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &LabelTable {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn at(&self, index: Offset) -> Offset {
        self.table.at(index)
    }

    /// Appends unmarked targets found in `refs`, sorts, and deduplicates.
    /// Invalidates any indices previously assigned via [`Self::assign`].
    pub fn allocate(&mut self, refs: &[Reference]) {
        self.table
            .labels
            .extend(refs.iter().filter(|r| !is_marked(r.target)).map(|r| r.target));
        self.table.labels.sort_unstable();
        self.table.labels.dedup();
    }

    /// For each unmarked reference in `refs`, binary-searches its target and
    /// replaces it with the marked index on a hit. Unmatched targets are left
    /// unmarked.
    pub fn assign(&self, refs: &mut [Reference]) {
        if self.table.is_empty() {
            return;
        }
        for r in refs.iter_mut() {
            if is_marked(r.target) {
                continue;
            }
            if let Ok(idx) = self.table.labels.binary_search(&r.target) {
                r.target = mark_index(idx as Offset);
            }
        }
    }

    pub fn unassign(&self, refs: &mut [Reference]) {
        self.table.unassign(refs);
    }

    /// `allocate` then `assign`.
    pub fn allocate_and_assign(&mut self, refs: &mut [Reference]) {
        self.allocate(refs);
        self.assign(refs);
    }
}

/// Maintains a possibly-sparse (holed) target table alongside a `target ->
/// index` hash map, with cursors tracking how much of the table is already
/// reflected in the map. Used to project labels onto the new image, where not
/// every old-image target has a counterpart.
#[derive(Debug, Default, Clone)]
pub struct UnorderedLabelManager {
    table: LabelTable,
    map: HashMap<Offset, Offset>,
    first_unindexed_label: usize,
    first_unused_idx: usize,
}

impl UnorderedLabelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &LabelTable {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn at(&self, index: Offset) -> Offset {
        self.table.at(index)
    }

    /// Wholesale load, typically right after label projection.
    pub fn init(&mut self, labels: Vec<Offset>) {
        self.table.clear();
        self.table.labels = labels;
        self.map.clear();
        self.first_unindexed_label = 0;
        self.first_unused_idx = 0;
    }

    fn update_map(&mut self) {
        while self.first_unindexed_label < self.table.labels.len() {
            let target = self.table.labels[self.first_unindexed_label];
            if target != UNUSED_INDEX {
                self.map.insert(target, self.first_unindexed_label as Offset);
            }
            self.first_unindexed_label += 1;
        }
    }

    /// Lazily rebuilds the map up to `first_unindexed_label`, then assigns any
    /// unmarked reference whose target is present.
    pub fn assign(&mut self, refs: &mut [Reference]) {
        if self.table.is_empty() {
            return;
        }
        self.update_map();
        for r in refs.iter_mut() {
            if is_marked(r.target) {
                continue;
            }
            if let Some(&idx) = self.map.get(&r.target) {
                r.target = mark_index(idx);
            }
        }
    }

    /// Assigns when a target is already present, else appends it as a new
    /// label (filling holes left by [`Self::digest`] first).
    pub fn assign_or_allocate(&mut self, refs: &mut [Reference]) {
        self.update_map();
        let mut new_targets = Vec::new();
        for r in refs.iter_mut() {
            if is_marked(r.target) {
                continue;
            }
            if let Some(&idx) = self.map.get(&r.target) {
                r.target = mark_index(idx);
            } else {
                new_targets.push(r.target);
            }
        }
        if !new_targets.is_empty() {
            self.table.labels.extend(new_targets);
            let tail = &mut self.table.labels[self.first_unindexed_label..];
            tail.sort_unstable();
            let mut write = self.first_unindexed_label;
            let mut last: Option<Offset> = None;
            for i in self.first_unindexed_label..self.table.labels.len() {
                let v = self.table.labels[i];
                if last != Some(v) {
                    self.table.labels[write] = v;
                    write += 1;
                    last = Some(v);
                }
            }
            self.table.labels.truncate(write);
            self.update_map();
            for r in refs.iter_mut() {
                if is_marked(r.target) {
                    continue;
                }
                if let Some(&idx) = self.map.get(&r.target) {
                    r.target = mark_index(idx);
                }
            }
        }
    }

    pub fn allocate_and_assign(&mut self, refs: &mut [Reference]) {
        self.assign_or_allocate(refs);
        self.assign(refs);
    }

    pub fn unassign(&self, refs: &mut [Reference]) {
        self.table.unassign(refs);
    }

    /// Appends `labels` to the table, filling existing `UNUSED_INDEX` holes in
    /// place before extending, and advances the incremental cursors to match.
    pub fn digest(&mut self, labels: impl IntoIterator<Item = Offset>) {
        self.first_unindexed_label = 0;
        let mut it = labels.into_iter().peekable();
        while let Some(&value) = it.peek() {
            if self.first_unused_idx >= self.table.labels.len() {
                self.table.labels.push(value);
                it.next();
            } else if self.table.labels[self.first_unused_idx] == UNUSED_INDEX {
                self.table.labels[self.first_unused_idx] = value;
                it.next();
            }
            // Else: slot is occupied by a still-valid label; skip past it
            // without consuming `value`, continuing the in-place hole-filling
            // scan.
            self.first_unused_idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_allocate_and_assign_roundtrip() {
        let mut mgr = OrderedLabelManager::new();
        let mut refs = vec![Reference::new(0, 100), Reference::new(4, 200), Reference::new(8, 100)];
        mgr.allocate_and_assign(&mut refs);
        assert!(refs.iter().all(|r| is_marked(r.target)));
        assert_eq!(mgr.len(), 2); // 100 and 200, deduplicated.

        let mut clone = refs.clone();
        mgr.unassign(&mut clone);
        assert_eq!(clone[0].target, 100);
        assert_eq!(clone[1].target, 200);
        assert_eq!(clone[2].target, 100);
    }

    #[test]
    fn ordered_assign_leaves_unmatched_targets_unmarked() {
        let mut mgr = OrderedLabelManager::new();
        mgr.allocate(&[Reference::new(0, 10)]);
        let mut refs = vec![Reference::new(0, 999)];
        mgr.assign(&mut refs);
        assert!(!is_marked(refs[0].target));
    }

    #[test]
    fn unordered_digest_fills_holes_before_extending() {
        let mut mgr = UnorderedLabelManager::new();
        mgr.init(vec![10, UNUSED_INDEX, 30, UNUSED_INDEX]);
        mgr.digest(vec![20, 40, 50]);
        assert_eq!(mgr.table().labels(), &[10, 20, 30, 40, 50]);
    }

    #[test]
    fn unordered_assign_or_allocate_reuses_existing_and_appends_new() {
        let mut mgr = UnorderedLabelManager::new();
        mgr.init(vec![10, 20]);
        let mut refs = vec![Reference::new(0, 10), Reference::new(4, 99)];
        mgr.assign_or_allocate(&mut refs);
        assert_eq!(unmark_index(refs[0].target), 0);
        assert!(is_marked(refs[1].target));
        assert_eq!(mgr.at(unmark_index(refs[1].target)), 99);
    }

    #[test]
    fn mark_is_idempotent_across_both_managers() {
        let mut ordered = OrderedLabelManager::new();
        ordered.allocate(&[Reference::new(0, 5)]);
        let mut refs = vec![Reference::new(0, 5)];
        ordered.assign(&mut refs);
        let before = refs[0].target;
        ordered.assign(&mut refs); // Already marked: must be skipped, not re-marked.
        assert_eq!(refs[0].target, before);
    }
}
