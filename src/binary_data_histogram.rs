//! Binary-data similarity heuristic: a 65536-slot histogram over
//! consecutive 2-byte windows, compared by Euclidean distance. Used to rank
//! candidate old/new element pairings when no match is externally imposed.

pub const NUM_SLOTS: usize = 1 << 16;

pub struct BinaryDataHistogram {
    histogram: Vec<i32>,
    valid: bool,
}

impl BinaryDataHistogram {
    /// Data shorter than 2 bytes has no 2-byte windows, so its histogram is
    /// all zero and marked invalid rather than compared as "similar to
    /// everything".
    pub fn compute(data: &[u8]) -> Self {
        let mut histogram = vec![0i32; NUM_SLOTS];
        if data.len() < 2 {
            return BinaryDataHistogram { histogram, valid: false };
        }
        for window in data.windows(2) {
            let v = u16::from_le_bytes([window[0], window[1]]) as usize;
            histogram[v] += 1;
        }
        BinaryDataHistogram { histogram, valid: true }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Euclidean distance between two histograms; 0 for identical inputs,
    /// though the converse need not hold (e.g. "aba" and "bab" share a
    /// histogram).
    pub fn compare(&self, other: &BinaryDataHistogram) -> f64 {
        let sum_sq: i64 = self
            .histogram
            .iter()
            .zip(other.histogram.iter())
            .map(|(&a, &b)| {
                let d = (a - b) as i64;
                d * d
            })
            .sum();
        (sum_sq as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_data_has_zero_distance() {
        let a = BinaryDataHistogram::compute(b"hello world");
        let b = BinaryDataHistogram::compute(b"hello world");
        assert!(a.is_valid());
        assert_eq!(a.compare(&b), 0.0);
    }

    #[test]
    fn short_data_is_invalid() {
        let h = BinaryDataHistogram::compute(b"a");
        assert!(!h.is_valid());
    }

    #[test]
    fn dissimilar_data_has_positive_distance() {
        let a = BinaryDataHistogram::compute(&[0u8; 64]);
        let b = BinaryDataHistogram::compute(&(0..64).collect::<Vec<u8>>());
        assert!(a.compare(&b) > 0.0);
    }
}
