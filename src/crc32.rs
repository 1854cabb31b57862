//! CRC-32 of a byte buffer, used only as an accidental-corruption check in
//! the patch header (IEEE polynomial `0xEDB88320`, reflected, initial
//! `0xFFFFFFFF`, final xor `0xFFFFFFFF`). `crc32fast` implements exactly this
//! variant; we wrap it so call sites name
//! the Zucchini operation rather than reach for the crate directly.

pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_zero_crc() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn known_vector() {
        // Standard IEEE CRC-32 check value for the ASCII string "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
