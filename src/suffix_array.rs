//! Suffix array over a rank sequence, with a longest-common-prefix search.
//!
//! Treated as a replaceable collaborator behind a narrow interface
//! (constructor, `search(pattern) -> (position, common_prefix_length)`,
//! expected memory cost around `4 x len` bytes). We provide an in-tree
//! implementation behind that interface (prefix-doubling construction,
//! O(n log^2 n)) so the crate is self-contained; a production build could
//! swap this module for a faster external crate without touching callers.

/// Suffix array built over an arbitrary rank sequence (not just bytes): the
/// encoded view's ranks range well past 255, so construction works on
/// `usize` keys rather than assuming a byte alphabet.
pub struct SuffixArray {
    sa: Vec<u32>,
}

impl SuffixArray {
    /// Builds the suffix array of `text` via prefix doubling: at each
    /// doubling step `k`, sort suffixes by their already-known rank over the
    /// first `k` symbols plus the rank of the next `k`-symbol block, then
    /// derive the next rank array from that order.
    pub fn new(text: &[usize]) -> Self {
        let n = text.len();
        let mut sa: Vec<u32> = (0..n as u32).collect();
        if n <= 1 {
            return SuffixArray { sa };
        }

        let mut rank: Vec<i64> = text.iter().map(|&v| v as i64).collect();
        let mut tmp = vec![0i64; n];
        let mut k: usize = 1;

        loop {
            let key = |i: u32| -> (i64, i64) {
                let i = i as usize;
                let second = if i + k < n { rank[i + k] } else { -1 };
                (rank[i], second)
            };
            sa.sort_unstable_by_key(|&i| key(i));

            tmp[sa[0] as usize] = 0;
            for idx in 1..n {
                let prev_key = key(sa[idx - 1]);
                let cur_key = key(sa[idx]);
                let bump = if prev_key < cur_key { 1 } else { 0 };
                tmp[sa[idx] as usize] = tmp[sa[idx - 1] as usize] + bump;
            }
            rank.copy_from_slice(&tmp);

            if rank[sa[n - 1] as usize] as usize == n - 1 {
                break; // All suffixes now have distinct rank: fully sorted.
            }
            if k >= n {
                break;
            }
            k *= 2;
        }

        SuffixArray { sa }
    }

    pub fn len(&self) -> usize {
        self.sa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sa.is_empty()
    }

    /// The suffix array itself (`sa[i]` = start offset of the `i`-th
    /// lexicographically smallest suffix), for callers that want direct
    /// access (e.g. diagnostics).
    pub fn order(&self) -> &[u32] {
        &self.sa
    }

    /// Finds the suffix (by start position in the original text) with the
    /// longest common prefix against `pattern`, returning `(position,
    /// common_prefix_length)`. Ties are broken toward the lexicographically
    /// smaller of the two suffix-array neighbors straddling `pattern`'s
    /// insertion point, matching the `std::lower_bound`-then-compare-
    /// neighbors approach a real suffix array library would use.
    pub fn search(&self, text: &[usize], pattern: &[usize]) -> (usize, usize) {
        if self.sa.is_empty() || pattern.is_empty() {
            return (0, 0);
        }
        let n = self.sa.len();
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let suffix = &text[self.sa[mid] as usize..];
            if suffix < pattern {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let mut best_len = 0usize;
        let mut best_pos = 0usize;
        if lo < n {
            let pos = self.sa[lo] as usize;
            let len = common_prefix_len(&text[pos..], pattern);
            if len > best_len {
                best_len = len;
                best_pos = pos;
            }
        }
        if lo > 0 {
            let pos = self.sa[lo - 1] as usize;
            let len = common_prefix_len(&text[pos..], pattern);
            if len > best_len {
                best_len = len;
                best_pos = pos;
            }
        }
        (best_pos, best_len)
    }
}

fn common_prefix_len(a: &[usize], b: &[usize]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(bytes: &[u8]) -> Vec<usize> {
        bytes.iter().map(|&b| b as usize).collect()
    }

    #[test]
    fn finds_exact_substring() {
        let text = ranks(b"abracadabra");
        let sa = SuffixArray::new(&text);
        let pattern = ranks(b"cadabra");
        let (pos, len) = sa.search(&text, &pattern);
        assert_eq!(len, 7);
        assert_eq!(&text[pos..pos + len], &pattern[..]);
    }

    #[test]
    fn finds_longest_partial_match() {
        let text = ranks(b"banana");
        let sa = SuffixArray::new(&text);
        let pattern = ranks(b"anaconda");
        let (pos, len) = sa.search(&text, &pattern);
        // "ana" is the longest common prefix achievable against any suffix of
        // "banana" (suffixes "anana", "ana", "a" all start with "ana"/"a").
        assert_eq!(len, 3);
        assert_eq!(&text[pos..pos + len], &ranks(b"ana")[..]);
    }

    #[test]
    fn order_is_lexicographically_sorted() {
        let text = ranks(b"mississippi");
        let sa = SuffixArray::new(&text);
        for w in sa.order().windows(2) {
            assert!(&text[w[0] as usize..] <= &text[w[1] as usize..]);
        }
    }

    #[test]
    fn handles_empty_and_singleton() {
        let empty: Vec<usize> = vec![];
        let sa = SuffixArray::new(&empty);
        assert_eq!(sa.len(), 0);

        let one = vec![5usize];
        let sa = SuffixArray::new(&one);
        assert_eq!(sa.order(), &[0]);
    }
}
