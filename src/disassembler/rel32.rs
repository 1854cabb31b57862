//! Heuristic x86/x64 rel32 opcode scan, shared by the PE and ELF x86
//! disassemblers.
//!
//! This disregards instruction alignment and decodes nothing beyond the
//! handful of opcode bytes needed to locate a trailing rel32 field: false
//! positives are expected and pruned by the caller via bounds/taboo checks.

/// A candidate rel32 field: `location` is the offset of its first byte
/// (always 4 bytes wide), within the scanned segment's coordinate space.
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub location: u32,
    /// True for instruction variants (RIP-relative loads/LEAs) whose target
    /// legitimately lies outside the containing section.
    pub can_point_outside_section: bool,
}

/// True if `[location, location+4)` overlaps any abs32 reference location in
/// `abs32_locations` (each `abs32_width` bytes wide, sorted ascending) — the
/// "taboo region" check.
fn overlaps_taboo(location: u32, abs32_locations: &[u32], abs32_width: u32) -> bool {
    let field_end = location + 4;
    let idx = abs32_locations.partition_point(|&l| l + abs32_width <= location);
    abs32_locations[idx..]
        .iter()
        .take_while(|&&l| l < field_end)
        .any(|_| true)
}

/// Scans x86 code for `E8`/`E9` (5-byte call/jmp rel32) and `0F 8x` (6-byte
/// Jcc rel32). `base` is the offset of `code[0]` in the disassembler's
/// coordinate space.
pub fn scan_x86(code: &[u8], base: u32, abs32_locations: &[u32]) -> Vec<Candidate> {
    scan_common(code, base, abs32_locations, 4, false)
}

/// Scans x64 code for the same x86 opcodes plus RIP-relative `FF 15`/`FF 25`
/// and `89`/`8B`/`8D` with ModRM `mod=00, rm=101` (load-effective-address /
/// mov forms whose rel32 legitimately targets outside the section).
pub fn scan_x64(code: &[u8], base: u32, abs32_locations: &[u32]) -> Vec<Candidate> {
    let mut out = scan_common(code, base, abs32_locations, 8, false);
    let mut i = 0usize;
    while i + 1 < code.len() {
        let is_rip_form = (code[i] == 0xFF && (code[i + 1] == 0x15 || code[i + 1] == 0x25))
            || ((code[i] == 0x89 || code[i] == 0x8B || code[i] == 0x8D)
                && (code[i + 1] & 0xC7) == 0x05);
        if is_rip_form && i + 2 + 4 <= code.len() {
            let loc = base + i as u32 + 2;
            if !overlaps_taboo(loc, abs32_locations, 8) {
                out.push(Candidate { location: loc, can_point_outside_section: true });
            }
        }
        i += 1;
    }
    out.sort_by_key(|c| c.location);
    out
}

fn scan_common(
    code: &[u8],
    base: u32,
    abs32_locations: &[u32],
    abs32_width: u32,
    _reserved: bool,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < code.len() {
        if (code[i] == 0xE8 || code[i] == 0xE9) && i + 1 + 4 <= code.len() {
            let loc = base + i as u32 + 1;
            if !overlaps_taboo(loc, abs32_locations, abs32_width) {
                out.push(Candidate { location: loc, can_point_outside_section: false });
            }
        } else if code[i] == 0x0F && i + 1 < code.len() && (code[i + 1] & 0xF0) == 0x80 && i + 2 + 4 <= code.len()
        {
            let loc = base + i as u32 + 2;
            if !overlaps_taboo(loc, abs32_locations, abs32_width) {
                out.push(Candidate { location: loc, can_point_outside_section: false });
            }
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_call_rel32() {
        let mut code = vec![0x90u8; 10];
        code[2] = 0xE8;
        code[3..7].copy_from_slice(&10i32.to_le_bytes());
        let cands = scan_x86(&code, 0, &[]);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].location, 3);
    }

    #[test]
    fn finds_jcc_rel32() {
        let mut code = vec![0x90u8; 10];
        code[0] = 0x0F;
        code[1] = 0x84;
        code[2..6].copy_from_slice(&0i32.to_le_bytes());
        let cands = scan_x86(&code, 0, &[]);
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].location, 2);
    }

    #[test]
    fn taboo_region_suppresses_candidate() {
        let mut code = vec![0x90u8; 10];
        code[0] = 0xE8;
        code[1..5].copy_from_slice(&0i32.to_le_bytes());
        let cands = scan_x86(&code, 0, &[1]); // abs32 at offset 1 overlaps [1,5)
        assert!(cands.is_empty());
    }

    #[test]
    fn x64_rip_lea_can_point_outside_section() {
        let mut code = vec![0x90u8; 10];
        code[0] = 0x8D; // LEA
        code[1] = 0x05; // mod=00, reg=000, rm=101
        code[2..6].copy_from_slice(&0i32.to_le_bytes());
        let cands = scan_x64(&code, 0, &[]);
        assert!(cands.iter().any(|c| c.location == 2 && c.can_point_outside_section));
    }
}
