//! The short pulse feature of the pulse blaster.
//!
//! The sequencer can only process an instruction every `5 * clock_period`, hence
//! `min_inst_length = 5 * clock_period`. Outputs can nevertheless be pulsed for any multiple
//! of the clock period: three bits of the flags word, starting at `short_pulse_bit_num`,
//! hold a period count `N`. During such an instruction, channels whose bit is high stay high
//! for `N` clock periods and are low for the rest of the instruction, channels whose bit is low
//! stay low throughout.
//!
//! | N   | bits | high for (500 MHz clock) |
//! |-----|------|--------------------------|
//! | 0   | 000  | no short pulse           |
//! | 1   | 001  | 2 ns                     |
//! | 2   | 010  | 4 ns                     |
//! | 3   | 011  | 6 ns                     |
//! | 4   | 100  | 8 ns                     |
//! | 5   | 101  | 10 ns                    |
//!
//! (On some boards `000` means "always low" rather than "no short pulse".)

use std::cmp::max;

use log::warn;

use crate::instruction::{Flags, Opcode, PbInstruction, PbInstructions};

/// Number of clock periods the sequencer needs per instruction.
pub const MIN_INST_CLOCK_PERIODS: u64 = 5;
/// Width of the short pulse period count in the flags word.
pub const SHORT_PULSE_FIELD_BITS: u32 = 3;

pub fn min_inst_length(clock_period_ns: u64) -> u64 {
    MIN_INST_CLOCK_PERIODS * clock_period_ns
}

/// Whether any instruction is not longer than the minimum instruction length, i.e. whether
/// [`short_pulse_feature`] is needed for the program to run.
pub fn has_short_pulses(pb_insts: &[PbInstruction], clock_period_ns: u64) -> bool {
    let min_length = min_inst_length(clock_period_ns);
    pb_insts.iter().any(|inst| inst.length <= min_length)
}

/// Period count `N` encoded in `flags`, `0` if the instruction carries no short pulse.
pub fn short_pulse_periods(flags: Flags, short_pulse_bit_num: u32) -> u32 {
    let field_mask = (1 << SHORT_PULSE_FIELD_BITS) - 1;
    flags.checked_shr(short_pulse_bit_num).unwrap_or(0) & field_mask
}

/// Rewrites every instruction of length `<= 5 * clock_period_ns` into a short pulse
/// instruction of exactly `5 * clock_period_ns`.
///
/// The rewritten flags carry `N = length / clock_period_ns` at `short_pulse_bit_num`, so the
/// high channels are high for the original length only. An all-low instruction directly
/// following a short pulse instruction is absorbed by it: the short pulse instruction then
/// covers both original spans (at least `5 * clock_period_ns`), and its channels are low after
/// the `N` periods anyway. The absorbed instruction's opcode is kept if it is not
/// [`Opcode::Continue`], and branch targets are renumbered to the shortened list.
///
/// The total duration never shrinks, but grows wherever short instructions are stretched.
///
/// # Panics
///
/// Panics if `clock_period_ns` is zero or the short pulse field does not fit the flags word
/// (see [`crate::compiler::CompileConfig::validate`]).
///
/// # Example
///
/// ```
/// use pbcompiler_backend::instruction::*;
/// use pbcompiler_backend::short_pulse::short_pulse_feature;
///
/// // channel 0 high for 2 ns, then all low for 8 ns, then high for 10 ns
/// let insts = vec![
///     PbInstruction::new_continue(0b1, 2),
///     PbInstruction::new_continue(0b0, 8),
///     PbInstruction::new_continue(0b1, 10),
/// ];
/// let expected = vec![
///     PbInstruction::new_continue(1 << 21 | 0b1, 10),
///     PbInstruction::new_continue(5 << 21 | 0b1, 10),
/// ];
/// assert_eq!(short_pulse_feature(&insts, 2, 21), expected);
/// ```
pub fn short_pulse_feature(
    pb_insts: &[PbInstruction],
    clock_period_ns: u64,
    short_pulse_bit_num: u32,
) -> PbInstructions {
    assert!(clock_period_ns > 0, "Clock period must be at least 1 ns");
    assert!(
        short_pulse_bit_num + SHORT_PULSE_FIELD_BITS <= Flags::BITS,
        "Short pulse field at bit {} does not fit {}-bit flags",
        short_pulse_bit_num,
        Flags::BITS
    );
    let min_length = min_inst_length(clock_period_ns);
    let mut new_insts: PbInstructions = Vec::with_capacity(pb_insts.len());
    // Original (unstretched) span covered by each new instruction
    let mut spans: Vec<u64> = Vec::with_capacity(pb_insts.len());
    // Index of the new instruction covering each original instruction
    let mut new_index: Vec<usize> = Vec::with_capacity(pb_insts.len());

    for inst in pb_insts {
        let follows_short_pulse = new_insts
            .last()
            .is_some_and(|prev| short_pulse_periods(prev.flags, short_pulse_bit_num) > 0);
        if inst.flags == 0 && follows_short_pulse {
            let last = new_insts.len() - 1;
            spans[last] += inst.length;
            let prev = &mut new_insts[last];
            prev.length = max(spans[last], min_length);
            if inst.opcode != Opcode::Continue {
                prev.opcode = inst.opcode;
                prev.data = inst.data;
            }
            new_index.push(last);
            continue;
        }

        let mut new_inst = *inst;
        if inst.length <= min_length {
            let periods = inst.length / clock_period_ns;
            if periods == 0 {
                warn!(
                    "Instruction {} is shorter than one clock period of {} ns and is encoded as no short pulse",
                    inst, clock_period_ns
                );
            }
            new_inst.flags |= (periods as Flags) << short_pulse_bit_num;
            new_inst.length = min_length;
        }
        new_insts.push(new_inst);
        spans.push(inst.length);
        new_index.push(new_insts.len() - 1);
    }

    for inst in new_insts.iter_mut() {
        if inst.opcode == Opcode::Branch {
            if let Some(&target) = new_index.get(inst.data as usize) {
                inst.data = target as u32;
            }
        }
    }
    new_insts
}
