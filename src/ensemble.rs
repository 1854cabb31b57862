//! Ensemble matching: finds embedded executables inside an archive-like
//! image and pairs old/new elements for independent patching.

use crate::binary_data_histogram::BinaryDataHistogram;
use crate::disassembler::{self, ExeType};
use anyhow::{bail, Result};

/// Matching is O(n^2) in element count; an archive with hundreds of
/// embedded executables is pathological, so we cap and error rather than
/// let a crafted archive blow up patch generation.
pub const ELEMENT_LIMIT: usize = 256;

const MAX_BLOAT: f64 = 2.0;
const MIN_WORRISOME_DIFFERENCE: u64 = 2 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    pub exe_type: ExeType,
    pub start: u32,
    pub end: u32,
}

impl Element {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    fn bytes<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        &image[self.start as usize..self.end as usize]
    }
}

/// Scans `image` left to right, quick-detecting an executable at each byte
/// offset that one hasn't already been claimed by; on a match, skips past
/// the detected element's length, producing a sequential non-overlapping
/// list of embedded elements.
pub fn find_embedded_elements(image: &[u8]) -> Vec<Element> {
    let mut elements = Vec::new();
    let len = image.len() as u32;
    let mut pos = 0u32;
    while pos < len {
        if elements.len() >= ELEMENT_LIMIT {
            break;
        }
        if let Some((exe_type, detected_len)) = disassembler::quick_detect(&image[pos as usize..]) {
            let detected_len = detected_len as u32;
            if detected_len > 0 {
                elements.push(Element { exe_type, start: pos, end: pos + detected_len });
                pos += detected_len;
                continue;
            }
        }
        pos += 1;
    }
    elements
}

#[derive(Debug, Clone, Copy)]
pub struct Match {
    pub old: Element,
    pub new: Element,
}

#[derive(Default)]
pub struct EnsembleMatcher {
    pub matches: Vec<Match>,
    pub separators: Vec<(u32, u32)>,
    pub num_identical: usize,
    pub verbose: bool,
}

impl EnsembleMatcher {
    pub fn new() -> Self {
        EnsembleMatcher::default()
    }

    /// Finds elements in `old_image`/`new_image` and matches them, either by
    /// parsing `imposed_matches` (format `"#+#=#+#,..."`, offset+size in old
    /// `=` offset+size in new) or by running the size/histogram heuristic
    /// when it's empty.
    pub fn run_match(&mut self, old_image: &[u8], new_image: &[u8], imposed_matches: &str) -> Result<()> {
        self.reset();
        if imposed_matches.is_empty() {
            let old_elements = find_embedded_elements(old_image);
            let new_elements = find_embedded_elements(new_image);
            if old_elements.len() >= ELEMENT_LIMIT || new_elements.len() >= ELEMENT_LIMIT {
                bail!("found too many embedded elements (limit is {ELEMENT_LIMIT})");
            }
            self.match_ensembles(old_image, &old_elements, new_image, &new_elements);
        } else {
            let (num_identical, matches) = parse_imposed_matches(imposed_matches, old_image, new_image)?;
            self.num_identical = num_identical;
            self.matches = matches;
        }
        trim_matches(&mut self.matches);
        self.generate_separators(new_image.len() as u32);
        Ok(())
    }

    /// Trivially matches the whole old image to the whole new image as one
    /// raw (non-ensemble) element pair.
    pub fn run_raw_match(&mut self, old_image: &[u8], new_image: &[u8]) {
        self.reset();
        self.matches.push(Match {
            old: Element { exe_type: ExeType::NoOp, start: 0, end: old_image.len() as u32 },
            new: Element { exe_type: ExeType::NoOp, start: 0, end: new_image.len() as u32 },
        });
    }

    fn reset(&mut self) {
        self.matches.clear();
        self.separators.clear();
        self.num_identical = 0;
    }

    fn generate_separators(&mut self, new_len: u32) {
        let mut cursor = 0u32;
        for m in &self.matches {
            self.separators.push((cursor, m.new.start));
            cursor = m.new.end;
        }
        self.separators.push((cursor, new_len));
    }

    fn match_ensembles(&mut self, old_image: &[u8], old_elements: &[Element], new_image: &[u8], new_elements: &[Element]) {
        let old_histograms: Vec<BinaryDataHistogram> =
            old_elements.iter().map(|e| BinaryDataHistogram::compute(e.bytes(old_image))).collect();

        for new_elt in new_elements {
            let new_bytes = new_elt.bytes(new_image);
            let new_his = BinaryDataHistogram::compute(new_bytes);

            let mut best_dist = f64::INFINITY;
            let mut best_iold: Option<usize> = None;
            let mut is_identical = false;

            for (iold, old_elt) in old_elements.iter().enumerate() {
                if old_elt.exe_type != new_elt.exe_type {
                    continue;
                }
                if unsafe_difference(old_elt.len() as u64, new_elt.len() as u64) {
                    continue;
                }
                let dist = old_histograms[iold].compare(&new_his);
                if dist < best_dist {
                    best_iold = Some(iold);
                    best_dist = dist;
                    if best_dist == 0.0 && old_elt.bytes(old_image) == new_bytes {
                        is_identical = true;
                        break;
                    }
                }
            }

            if let Some(iold) = best_iold {
                if is_identical {
                    self.num_identical += 1;
                } else {
                    self.matches.push(Match { old: old_elements[iold], new: *new_elt });
                }
            }
        }
    }
}

fn unsafe_difference(old_size: u64, new_size: u64) -> bool {
    let lo = old_size.min(new_size);
    let hi = old_size.max(new_size);
    if hi - lo < MIN_WORRISOME_DIFFERENCE {
        return false;
    }
    (hi as f64) >= (lo as f64) * MAX_BLOAT
}

fn is_dex_match(m: &Match) -> bool {
    m.old.exe_type == ExeType::Dex
}

/// Multi-DEX archives can move content across file boundaries between old
/// and new, which this patcher doesn't track; forcing DEX-to-DEX matches in
/// that case tends to produce bigger patches than leaving them unmatched, so
/// when more than one DEX match is found we drop all of them.
fn trim_matches(matches: &mut Vec<Match>) {
    let dex_count = matches.iter().filter(|m| is_dex_match(m)).count();
    if dex_count > 1 {
        matches.retain(|m| !is_dex_match(m));
    }
}

fn parse_imposed_matches(spec: &str, old_image: &[u8], new_image: &[u8]) -> Result<(usize, Vec<Match>)> {
    #[derive(Clone, Copy)]
    struct Raw {
        old_start: u32,
        old_size: u32,
        new_start: u32,
        new_size: u32,
    }

    let mut raws = Vec::new();
    for entry in spec.split(',') {
        let (old_part, new_part) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("imposed match missing '=': {entry}"))?;
        let (old_off, old_size) = old_part
            .split_once('+')
            .ok_or_else(|| anyhow::anyhow!("imposed match missing '+': {old_part}"))?;
        let (new_off, new_size) = new_part
            .split_once('+')
            .ok_or_else(|| anyhow::anyhow!("imposed match missing '+': {new_part}"))?;
        let old_start: u32 = old_off.parse()?;
        let old_size: u32 = old_size.parse()?;
        let new_start: u32 = new_off.parse()?;
        let new_size: u32 = new_size.parse()?;
        if old_size == 0 || new_size == 0 {
            bail!("imposed matches must have non-zero size");
        }
        if (old_start as u64 + old_size as u64) > old_image.len() as u64 {
            bail!("imposed match out of bounds in old image: {entry}");
        }
        if (new_start as u64 + new_size as u64) > new_image.len() as u64 {
            bail!("imposed match out of bounds in new image: {entry}");
        }
        raws.push(Raw { old_start, old_size, new_start, new_size });
    }

    raws.sort_by_key(|r| r.new_start);
    for w in raws.windows(2) {
        if w[0].new_start + w[0].new_size > w[1].new_start {
            bail!("imposed matches overlap in new image");
        }
    }

    let mut num_identical = 0;
    let mut matches = Vec::new();
    for r in raws {
        let old_bytes = &old_image[r.old_start as usize..(r.old_start + r.old_size) as usize];
        let new_bytes = &new_image[r.new_start as usize..(r.new_start + r.new_size) as usize];
        if old_bytes == new_bytes {
            num_identical += 1;
            continue;
        }
        let old_type = disassembler::detect_and_parse(old_bytes).exe_type();
        let new_type = disassembler::detect_and_parse(new_bytes).exe_type();
        if old_type == ExeType::NoOp || new_type == ExeType::NoOp {
            continue;
        }
        if old_type != new_type {
            bail!("inconsistent types in imposed match: {old_type:?} vs {new_type:?}");
        }
        matches.push(Match {
            old: Element { exe_type: old_type, start: r.old_start, end: r.old_start + r.old_size },
            new: Element { exe_type: new_type, start: r.new_start, end: r.new_start + r.new_size },
        });
    }
    Ok((num_identical, matches))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_match_covers_whole_images() {
        let mut m = EnsembleMatcher::new();
        m.run_raw_match(&[1, 2, 3], &[4, 5]);
        assert_eq!(m.matches.len(), 1);
        assert_eq!(m.matches[0].new.end, 2);
    }

    #[test]
    fn unsafe_difference_rejects_large_relative_bloat() {
        assert!(unsafe_difference(1 << 20, 10 << 20));
        assert!(!unsafe_difference(1 << 20, 3 << 20)); // below the 2MiB floor is ignored
        assert!(!unsafe_difference(10 << 20, 11 << 20)); // below 2x bloat
    }

    #[test]
    fn parse_imposed_matches_rejects_overlap() {
        let old = vec![0u8; 100];
        let new = vec![0u8; 100];
        let err = parse_imposed_matches("0+10=0+10,0+10=5+10", &old, &new);
        assert!(err.is_err());
    }

    #[test]
    fn parse_imposed_matches_skips_identical() {
        let old = vec![7u8; 20];
        let new = vec![7u8; 20];
        let (num_identical, matches) = parse_imposed_matches("0+20=0+20", &old, &new).unwrap();
        assert_eq!(num_identical, 1);
        assert!(matches.is_empty());
    }

    #[test]
    fn trim_matches_drops_all_dex_when_ambiguous() {
        let dex = Element { exe_type: ExeType::Dex, start: 0, end: 1 };
        let mut matches = vec![Match { old: dex, new: dex }, Match { old: dex, new: dex }];
        trim_matches(&mut matches);
        assert!(matches.is_empty());
    }
}
