//! Reference byte mixing: for formats where an instruction's opcode and
//! displacement share a byte range (ARM32/
//! AArch64 branch encodings), raw bytewise diffing of an equivalence's
//! unmatched middle bytes fights with reference-target correction. Mixing
//! pre-combines new's opcode bits with old's displacement bits before the
//! raw-delta diff runs, so the diff only has to encode the (usually zero)
//! difference the relocation correction will apply on top.
//!
//! x86/PE/DEX encode displacement in its own byte span separate from any
//! opcode bits, so they get the no-op mixer: raw-delta diffing skips that
//! span entirely (see [`BytesMixer::num_bytes`]) and target correction
//! during patch application overwrites it unconditionally.

use crate::diagnostics::RateLimitedLog;
use crate::disassembler::{arm, elf, ExeType};
use crate::model::ReferenceType;

static MIX_FAILURES: RateLimitedLog = RateLimitedLog::new(10);

pub trait BytesMixer {
    /// Number of leading bytes of a reference's encoding this mixer cares
    /// about; 0 means raw-delta diffing runs unmodified.
    fn num_bytes(&self, ty: ReferenceType) -> usize;

    /// Combines `old`'s displacement with `new`'s opcode bits into `out`
    /// (already `new`'s bytes, `num_bytes(ty)` long). `old_rva`/`new_rva` are
    /// the instruction's own address in each image, needed because ARM
    /// branch displacements are PC-relative.
    fn mix(&self, ty: ReferenceType, old: &[u8], old_rva: u32, new_rva: u32, out: &mut [u8]);
}

pub struct NoOpMixer;

impl BytesMixer for NoOpMixer {
    fn num_bytes(&self, _ty: ReferenceType) -> usize {
        0
    }

    fn mix(&self, _ty: ReferenceType, _old: &[u8], _old_rva: u32, _new_rva: u32, _out: &mut [u8]) {}
}

pub struct ArmMixer {
    is_arm32: bool,
}

impl ArmMixer {
    pub fn new(is_arm32: bool) -> Self {
        ArmMixer { is_arm32 }
    }

    /// Picks the mixer the pair of disassemblers' exe type needs. Both sides
    /// are assumed to share a type by the time a patch element's
    /// generator/applicator constructs this.
    pub fn for_exe_type(exe_type: ExeType) -> Box<dyn BytesMixer> {
        match exe_type {
            ExeType::ElfArm32 => Box::new(ArmMixer::new(true)),
            ExeType::ElfAArch64 => Box::new(ArmMixer::new(false)),
            _ => Box::new(NoOpMixer),
        }
    }
}

impl BytesMixer for ArmMixer {
    fn num_bytes(&self, ty: ReferenceType) -> usize {
        let idx = ty.wrapping_sub(elf::REL32_BASE);
        if self.is_arm32 {
            match idx {
                0 | 3 | 4 => 4, // A24, T21, T24
                1 | 2 => 2,     // T8, T11
                _ => 0,
            }
        } else {
            match idx {
                0 | 1 | 2 => 4, // Immd14, Immd19, Immd26
                _ => 0,
            }
        }
    }

    fn mix(&self, ty: ReferenceType, old: &[u8], old_rva: u32, new_rva: u32, out: &mut [u8]) {
        let idx = ty.wrapping_sub(elf::REL32_BASE);
        if self.is_arm32 {
            mix_arm32(idx, old, old_rva, new_rva, out);
        } else {
            mix_aarch64(idx, old, old_rva, new_rva, out);
        }
    }
}

fn mix_arm32(idx: u8, old: &[u8], old_rva: u32, new_rva: u32, out: &mut [u8]) {
    let ok = (|| -> Option<()> {
        match idx {
            0 => {
                let word = u32::from_le_bytes(old.get(0..4)?.try_into().ok()?);
                let disp = arm::read_a24(word)?;
                let new_disp = rebased(old_rva, disp, new_rva, 8)?;
                let new_word = u32::from_le_bytes(out.get(0..4)?.try_into().ok()?);
                out[0..4].copy_from_slice(&arm::write_a24(new_word, new_disp).to_le_bytes());
            }
            1 => {
                let hw = u16::from_le_bytes(old.get(0..2)?.try_into().ok()?);
                let disp = arm::read_t8(hw)?;
                let new_disp = rebased(old_rva, disp, new_rva, 4)?;
                let new_hw = u16::from_le_bytes(out.get(0..2)?.try_into().ok()?);
                out[0..2].copy_from_slice(&arm::write_t8(new_hw, new_disp).to_le_bytes());
            }
            2 => {
                let hw = u16::from_le_bytes(old.get(0..2)?.try_into().ok()?);
                let disp = arm::read_t11(hw)?;
                let new_disp = rebased(old_rva, disp, new_rva, 4)?;
                let new_hw = u16::from_le_bytes(out.get(0..2)?.try_into().ok()?);
                out[0..2].copy_from_slice(&arm::write_t11(new_hw, new_disp).to_le_bytes());
            }
            3 => {
                let h1 = u16::from_le_bytes(old.get(0..2)?.try_into().ok()?);
                let h2 = u16::from_le_bytes(old.get(2..4)?.try_into().ok()?);
                let disp = arm::read_t21(h1, h2)?;
                let new_disp = rebased(old_rva, disp, new_rva, 4)?;
                let n1 = u16::from_le_bytes(out.get(0..2)?.try_into().ok()?);
                let n2 = u16::from_le_bytes(out.get(2..4)?.try_into().ok()?);
                let (w1, w2) = arm::write_t21(n1, n2, new_disp);
                out[0..2].copy_from_slice(&w1.to_le_bytes());
                out[2..4].copy_from_slice(&w2.to_le_bytes());
            }
            4 => {
                let h1 = u16::from_le_bytes(old.get(0..2)?.try_into().ok()?);
                let h2 = u16::from_le_bytes(old.get(2..4)?.try_into().ok()?);
                let disp = arm::read_t24(h1, h2)?;
                let new_disp = rebased(old_rva, disp, new_rva, 4)?;
                let n1 = u16::from_le_bytes(out.get(0..2)?.try_into().ok()?);
                let n2 = u16::from_le_bytes(out.get(2..4)?.try_into().ok()?);
                let (w1, w2) = arm::write_t24(n1, n2, new_disp);
                out[0..2].copy_from_slice(&w1.to_le_bytes());
                out[2..4].copy_from_slice(&w2.to_le_bytes());
            }
            _ => return None,
        }
        Some(())
    })();
    // Mix failure (usually a Thumb2/ARM mode misidentification at a section
    // boundary) is non-fatal: `out` is left as `new`'s bytes, same as the
    // no-op mixer would have produced.
    if ok.is_none() {
        MIX_FAILURES.warn(|| format!("ARM32 reference byte mix failed for displacement kind {idx} at rva {old_rva:#x}"));
    }
}

fn mix_aarch64(idx: u8, old: &[u8], old_rva: u32, new_rva: u32, out: &mut [u8]) {
    let ok = (|| -> Option<()> {
        let word = u32::from_le_bytes(old.get(0..4)?.try_into().ok()?);
        let new_word = u32::from_le_bytes(out.get(0..4)?.try_into().ok()?);
        let new_bytes = match idx {
            0 => {
                let disp = arm::read_immd14(word);
                arm::write_immd14(new_word, rebased(old_rva, disp, new_rva, 0)?)
            }
            1 => {
                let disp = arm::read_immd19(word);
                arm::write_immd19(new_word, rebased(old_rva, disp, new_rva, 0)?)
            }
            2 => {
                let disp = arm::read_immd26(word);
                arm::write_immd26(new_word, rebased(old_rva, disp, new_rva, 0)?)
            }
            _ => return None,
        };
        out[0..4].copy_from_slice(&new_bytes.to_le_bytes());
        Some(())
    })();
    if ok.is_none() {
        MIX_FAILURES.warn(|| format!("AArch64 reference byte mix failed for displacement kind {idx} at rva {old_rva:#x}"));
    }
}

/// Recomputes a PC-relative displacement for an instruction that moved from
/// `old_rva` to `new_rva`, keeping its absolute target fixed. `pc_bias` is
/// the architecture's program-counter-ahead-of-instruction offset (ARM32
/// reads PC as the instruction address plus 8/4 depending on mode; AArch64
/// has no bias).
fn rebased(old_rva: u32, old_disp: i32, new_rva: u32, pc_bias: i64) -> Option<i32> {
    let target = old_rva as i64 + pc_bias + old_disp as i64;
    let new_disp = target - (new_rva as i64 + pc_bias);
    i32::try_from(new_disp).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_op_mixer_reports_zero_bytes() {
        let mixer = NoOpMixer;
        assert_eq!(mixer.num_bytes(elf::REL32_BASE), 0);
    }

    #[test]
    fn arm_mixer_rebases_a24_displacement() {
        let mixer = ArmMixer::new(true);
        let ty = elf::REL32_BASE; // A24
        assert_eq!(mixer.num_bytes(ty), 4);

        let old_rva = 0x1000u32;
        let old_word = 0xEB00_0010u32; // BL, imm24=0x10 -> disp = 0x40
        let old = old_word.to_le_bytes();

        let new_rva = 0x1004u32; // instruction moved 4 bytes later
        let mut out = old_word.to_le_bytes(); // pretend new's opcode bits match

        mixer.mix(ty, &old, old_rva, new_rva, &mut out);
        let mixed_word = u32::from_le_bytes(out);
        let mixed_disp = arm::read_a24(mixed_word).unwrap();
        // Absolute target must be preserved across the rebasing.
        assert_eq!(old_rva as i64 + 8 + 0x40, new_rva as i64 + 8 + mixed_disp as i64);
    }

    #[test]
    fn aarch64_mixer_rebases_immd26() {
        let mixer = ArmMixer::new(false);
        let ty = elf::REL32_BASE + 2; // Immd26
        let old_rva = 0x2000u32;
        let old_word = 0x1400_0100u32;
        let old = old_word.to_le_bytes();
        let new_rva = 0x2010u32;
        let mut out = old_word.to_le_bytes();
        mixer.mix(ty, &old, old_rva, new_rva, &mut out);
        let mixed = u32::from_le_bytes(out);
        let mixed_disp = arm::read_immd26(mixed);
        assert_eq!(old_rva as i64 + 0x400, new_rva as i64 + mixed_disp as i64);
    }
}
