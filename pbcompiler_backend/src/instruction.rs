//! Provides definitions and implementations for pulse blaster instructions.
//!
//! ## Main Structures and Enumerations:
//!
//! - [`Opcode`]: The operations understood by the pulse blaster sequencer. Values are wire
//!   compatible with the vendor library, so `Opcode::Branch as u32 == 6`.
//!
//! - [`PbInstruction`]: One schedulable unit of hardware execution, composed of the output
//!   `flags`, an [`Opcode`], the opcode argument `data` and the instruction `length` in ns.
//!
//! ## Building instructions
//!
//! [`build_pb_insts`] folds the time-ordered `(length, update_flags)` pairs produced by
//! [`crate::timeline::ordered_inst_lengths_and_update_flags`] into the minimal list of
//! instructions. Edges of several channels sharing a timestamp show up as zero-length
//! intervals, which are composed into the next instruction instead of being emitted.
//!
//! [`make_continuous`] turns a one-shot program into a repeating one by letting its last
//! instruction branch back to a given instruction.

use std::fmt;
use std::iter::zip;

use crate::error::{PbError, Result};

/// Output state of the pulse blaster: the `n`th least significant bit drives physical
/// channel `n`.
///
/// E.g. `flags = 5 = 0b101` means physical channels 0 and 2 are high, all others low.
/// XOR toggles channels: `(1 << 12) ^ (1 << 15)` has channels 12 and 15 high, and
/// `(1 << 12) ^ (1 << 15) ^ (1 << 12)` has only channel 15 high.
pub type Flags = u32;

/// Sequencer operation of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Continue = 0,
    Stop = 1,
    Loop = 2,
    EndLoop = 3,
    Jsr = 4,
    Rts = 5,
    Branch = 6,
    LongDelay = 7,
    Wait = 8,
}
impl Opcode {
    /// Wire value written to the instruction memory.
    pub fn code(self) -> u32 {
        self as u32
    }
}
impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Opcode::Continue => "CONTINUE",
                Opcode::Stop => "STOP",
                Opcode::Loop => "LOOP",
                Opcode::EndLoop => "END_LOOP",
                Opcode::Jsr => "JSR",
                Opcode::Rts => "RTS",
                Opcode::Branch => "BRANCH",
                Opcode::LongDelay => "LONG_DELAY",
                Opcode::Wait => "WAIT",
            }
        )
    }
}

/// A single pulse blaster instruction.
///
/// - `flags`: channels asserted high during the whole instruction. After short pulse
///   processing the bits starting at `short_pulse_bit_num` additionally encode a pulse
///   duration in clock periods (see [`crate::short_pulse`]).
/// - `opcode`: what the sequencer does once `length` has elapsed.
/// - `data`: opcode argument, e.g. the zero-based instruction index for [`Opcode::Branch`].
/// - `length`: instruction duration in ns, strictly positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PbInstruction {
    pub flags: Flags,
    pub opcode: Opcode,
    pub data: u32,
    pub length: u64,
}
impl PbInstruction {
    pub fn new(flags: Flags, opcode: Opcode, data: u32, length: u64) -> Self {
        Self {
            flags,
            opcode,
            data,
            length,
        }
    }

    /// Shortcut for the fall-through instruction the builder emits.
    pub fn new_continue(flags: Flags, length: u64) -> Self {
        Self::new(flags, Opcode::Continue, 0, length)
    }

    /// The `(flags, opcode, data, length)` tuple handed to the hardware loader.
    ///
    /// ```
    /// use pbcompiler_backend::instruction::*;
    ///
    /// let inst = PbInstruction::new(0b11, Opcode::Branch, 0, 10);
    /// assert_eq!(inst.to_tuple(), (3, 6, 0, 10));
    /// ```
    pub fn to_tuple(&self) -> (Flags, u32, u32, u64) {
        (self.flags, self.opcode.code(), self.data, self.length)
    }
}
impl fmt::Display for PbInstruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{:024b}, {}, {}, {} ns]",
            self.flags, self.opcode, self.data, self.length
        )
    }
}

pub type PbInstructions = Vec<PbInstruction>;

/// Folds time-ordered `(length, update_flags)` pairs into instructions.
///
/// All channels start low. Every `update_flags` is XOR-ed into the running flags; a pair
/// with `length == 0` emits nothing, so its update is carried into the next instruction.
/// This is how simultaneous edges of several channels are merged.
///
/// # Panics
///
/// Panics if the two slices differ in length.
///
/// # Example
///
/// ```
/// use pbcompiler_backend::instruction::*;
///
/// // channel 0 and channel 1 go high at the same time
/// let insts = build_pb_insts(&[0, 4, 6], &[0b01, 0b10, 0b11]);
/// assert_eq!(
///     insts,
///     vec![PbInstruction::new_continue(0b11, 4), PbInstruction::new_continue(0b00, 6)]
/// );
/// ```
pub fn build_pb_insts(inst_lengths: &[u64], update_flags: &[Flags]) -> PbInstructions {
    assert_eq!(
        inst_lengths.len(),
        update_flags.len(),
        "Got {} instruction lengths but {} update flags",
        inst_lengths.len(),
        update_flags.len()
    );
    zip(inst_lengths, update_flags)
        .scan(0, |flags: &mut Flags, (&length, &update)| {
            *flags ^= update;
            Some((*flags, length))
        })
        .filter(|&(_, length)| length > 0)
        .map(|(flags, length)| PbInstruction::new_continue(flags, length))
        .collect()
}

/// Changes the last instruction to branch to instruction number `branch_to` (zero-indexed),
/// keeping its flags and length.
///
/// # Errors
///
/// - [`PbError::EmptyProgram`] if `pb_insts` is empty.
/// - [`PbError::BranchOutOfRange`] if `branch_to` is not an index of `pb_insts`.
///
/// # Example
///
/// ```
/// use pbcompiler_backend::instruction::*;
///
/// let insts = vec![PbInstruction::new_continue(1, 10), PbInstruction::new_continue(0, 20)];
/// let looped = make_continuous(insts, 0).unwrap();
/// assert_eq!(looped[1], PbInstruction::new(0, Opcode::Branch, 0, 20));
/// assert!(make_continuous(vec![], 0).is_err());
/// ```
pub fn make_continuous(mut pb_insts: PbInstructions, branch_to: usize) -> Result<PbInstructions> {
    let num_insts = pb_insts.len();
    if branch_to >= num_insts && num_insts > 0 {
        return Err(PbError::BranchOutOfRange {
            branch_to,
            num_insts,
        });
    }
    let last = pb_insts.last_mut().ok_or(PbError::EmptyProgram)?;
    last.opcode = Opcode::Branch;
    last.data = branch_to as u32;
    Ok(pb_insts)
}

/// Total duration of a program in ns.
pub fn calc_pulse_program_duration(pb_insts: &[PbInstruction]) -> u64 {
    pb_insts.iter().map(|inst| inst.length).sum()
}

/// Physical channel numbers below `short_pulse_bit_num` that are high in any instruction.
pub fn extract_channels_used(pb_insts: &[PbInstruction], short_pulse_bit_num: u32) -> Vec<u32> {
    let used_flags = pb_insts.iter().fold(0, |acc, inst| acc | inst.flags);
    (0..short_pulse_bit_num.min(Flags::BITS))
        .filter(|&num| used_flags & (1 << num) != 0)
        .collect()
}
