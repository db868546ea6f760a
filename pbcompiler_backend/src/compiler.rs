//! Top-level compile entry point: channels in, final instruction list out.
//!
//! [`create_pb_insts`] runs the stages of the compiler in order:
//! 1. [`ordered_inst_lengths_and_update_flags`]: sorted edges of all channels,
//! 2. [`build_pb_insts`]: cumulative XOR into minimal instructions,
//! 3. [`make_continuous`] if the program should repeat,
//! 4. [`short_pulse_feature`] if any instruction is too short for the sequencer.
//!
//! Hardware-specific constants travel in [`CompileConfig`] rather than in globals.

use log::{info, warn};

use crate::channel::BaseChannel;
use crate::diagnostics::log_pb_insts;
use crate::error::{PbError, Result};
use crate::instruction::{build_pb_insts, make_continuous, Flags, PbInstructions};
use crate::short_pulse::{has_short_pulses, short_pulse_feature, SHORT_PULSE_FIELD_BITS};
use crate::timeline::{last_edge, ordered_inst_lengths_and_update_flags};

/// How the end of a one-shot program is determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramLength {
    /// Trailing time (ns) after the last edge during which all channels are low.
    AllOffPadding(u64),
    /// Total program duration (ns), measured from `t = 0`.
    Total(u64),
}
impl ProgramLength {
    /// Resolves to the all-off padding following `last_edge`.
    pub fn all_off_padding(self, last_edge: u64) -> Result<u64> {
        match self {
            ProgramLength::AllOffPadding(padding) => Ok(padding),
            ProgramLength::Total(program_length) => program_length
                .checked_sub(last_edge)
                .ok_or(PbError::ProgramTooShort {
                    program_length,
                    last_edge,
                }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShortPulseMode {
    /// Apply the short pulse feature whenever an instruction is too short.
    Auto,
    /// Leave too short instructions untouched.
    Disabled,
}

/// Parameters of [`create_pb_insts`].
///
/// - `program_length`: see [`ProgramLength`].
/// - `continuous`: if `true`, the last instruction branches to instruction `branch_to`.
/// - `clock_period_ns`: period of the board clock, 2 ns for a 500 MHz board.
/// - `short_pulse_bit_num`: first flags bit of the short pulse field, typically the number of
///   physical outputs of the board.
/// - `short_pulse`: see [`ShortPulseMode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompileConfig {
    pub program_length: ProgramLength,
    pub continuous: bool,
    pub branch_to: usize,
    pub clock_period_ns: u64,
    pub short_pulse_bit_num: u32,
    pub short_pulse: ShortPulseMode,
}
impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            program_length: ProgramLength::AllOffPadding(0),
            continuous: true,
            branch_to: 0,
            clock_period_ns: 2,
            short_pulse_bit_num: 21,
            short_pulse: ShortPulseMode::Auto,
        }
    }
}
impl CompileConfig {
    pub fn validate(&self) -> Result<()> {
        if self.clock_period_ns == 0 {
            return Err(PbError::InvalidClock(
                "clock period must be at least 1 ns".to_string(),
            ));
        }
        if self.short_pulse_bit_num + SHORT_PULSE_FIELD_BITS > Flags::BITS {
            return Err(PbError::InvalidShortPulseBit {
                bit: self.short_pulse_bit_num,
            });
        }
        Ok(())
    }
}

/// Compiles `channels` into the instruction list to be loaded onto the board.
///
/// An empty program (no channels and no padding) yields an empty list, which is never made
/// continuous.
///
/// # Errors
///
/// - invalid `config` ([`CompileConfig::validate`]),
/// - [`PbError::ChannelOutOfRange`] for a channel at or above the short pulse field,
/// - [`PbError::ProgramTooShort`] if a [`ProgramLength::Total`] ends before the last edge,
/// - [`PbError::OverlappingPulses`] if pulses of a channel overlap,
/// - [`PbError::BranchOutOfRange`] if `branch_to` is not an instruction of the program.
///
/// # Example
///
/// ```
/// use pbcompiler_backend::channel::PulseBlasterChannel;
/// use pbcompiler_backend::compiler::*;
/// use pbcompiler_backend::instruction::*;
///
/// let channels = vec![PulseBlasterChannel::new(0b1, vec![20], vec![40])];
/// let config = CompileConfig {
///     program_length: ProgramLength::Total(100),
///     ..Default::default()
/// };
/// let insts = create_pb_insts(&channels, &config).unwrap();
/// assert_eq!(
///     insts,
///     vec![
///         PbInstruction::new_continue(0b0, 20),
///         PbInstruction::new_continue(0b1, 40),
///         PbInstruction::new(0b0, Opcode::Branch, 0, 40),
///     ]
/// );
/// ```
pub fn create_pb_insts<C: BaseChannel>(channels: &[C], config: &CompileConfig) -> Result<PbInstructions> {
    config.validate()?;
    for chan in channels {
        // Bits from the short pulse field upwards are not outputs
        if chan.channel_number() >= config.short_pulse_bit_num {
            return Err(PbError::ChannelOutOfRange {
                number: chan.channel_number(),
                max: config.short_pulse_bit_num,
            });
        }
        chan.check_no_overlaps()?;
    }
    let all_off_padding = config.program_length.all_off_padding(last_edge(channels))?;

    let (inst_lengths, update_flags) = ordered_inst_lengths_and_update_flags(channels, all_off_padding);
    let mut pb_insts = build_pb_insts(&inst_lengths, &update_flags);
    if pb_insts.is_empty() {
        return Ok(pb_insts);
    }
    if config.continuous {
        pb_insts = make_continuous(pb_insts, config.branch_to)?;
    }
    if has_short_pulses(&pb_insts, config.clock_period_ns) {
        match config.short_pulse {
            ShortPulseMode::Auto => {
                warn!("Applied short pulse feature. This might affect the pulse program duration.");
                pb_insts = short_pulse_feature(&pb_insts, config.clock_period_ns, config.short_pulse_bit_num);
            }
            ShortPulseMode::Disabled => {
                warn!("Pulse program contains instructions shorter than the minimum instruction length")
            }
        }
    }
    info!("Compiled {} channels into {} instructions", channels.len(), pb_insts.len());
    log_pb_insts(&pb_insts);
    Ok(pb_insts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::PulseBlasterChannel;
    use crate::instruction::{calc_pulse_program_duration, Opcode, PbInstruction};

    fn generate_pb_channels(t1: u64) -> Vec<PulseBlasterChannel> {
        vec![
            PulseBlasterChannel::new(1 << 0, vec![6], vec![10]),
            PulseBlasterChannel::new(1 << 1, vec![t1, 16], vec![8, 14]),
        ]
    }

    fn padding(p: u64) -> ProgramLength {
        ProgramLength::AllOffPadding(p)
    }

    #[test]
    fn plain_program_without_post_processing() {
        let config = CompileConfig {
            program_length: padding(22),
            continuous: false,
            short_pulse: ShortPulseMode::Disabled,
            ..Default::default()
        };
        let insts = create_pb_insts(&generate_pb_channels(2), &config).unwrap();
        let expected: Vec<_> = [(0b000, 2), (0b010, 4), (0b011, 4), (0b001, 6), (0b010, 14), (0b000, 22)]
            .into_iter()
            .map(|(flags, length)| PbInstruction::new_continue(flags, length))
            .collect();
        assert_eq!(insts, expected);
        assert_eq!(calc_pulse_program_duration(&insts), 52);
    }

    #[test]
    fn one_shot_program_with_short_pulses() {
        let config = CompileConfig {
            program_length: padding(22),
            continuous: false,
            ..Default::default()
        };
        let insts = create_pb_insts(&generate_pb_channels(2), &config).unwrap();
        let expected: Vec<_> = [
            (0b001000000000000000000000, 10),
            (0b010000000000000000000010, 10),
            (0b010000000000000000000011, 10),
            (0b011000000000000000000001, 10),
            (0b000000000000000000000010, 14),
            (0b000000000000000000000000, 22),
        ]
        .into_iter()
        .map(|(flags, length)| PbInstruction::new_continue(flags, length))
        .collect();
        assert_eq!(insts, expected);
    }

    #[test]
    fn continuous_program_with_short_pulses() {
        let insts = create_pb_insts(
            &generate_pb_channels(2),
            &CompileConfig {
                program_length: padding(22),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(insts.len(), 6);
        assert_eq!(insts[0], PbInstruction::new_continue(1 << 21, 10));
        assert_eq!(insts[5], PbInstruction::new(0, Opcode::Branch, 0, 22));
        assert_eq!(insts[5].to_tuple(), (0, 6, 0, 22));
    }

    #[test]
    fn empty_program() {
        let channels: Vec<PulseBlasterChannel> = vec![];
        assert!(create_pb_insts(&channels, &CompileConfig::default())
            .unwrap()
            .is_empty());
        let config = CompileConfig {
            program_length: ProgramLength::Total(0),
            ..Default::default()
        };
        assert!(create_pb_insts(&channels, &config).unwrap().is_empty());
    }

    #[test]
    fn padding_only_program() {
        let channels: Vec<PulseBlasterChannel> = vec![];
        let config = CompileConfig {
            program_length: padding(100),
            ..Default::default()
        };
        assert_eq!(
            create_pb_insts(&channels, &config).unwrap(),
            vec![PbInstruction::new(0, Opcode::Branch, 0, 100)]
        );
    }

    #[test]
    fn total_program_length() {
        let config = CompileConfig {
            program_length: ProgramLength::Total(30),
            continuous: false,
            short_pulse: ShortPulseMode::Disabled,
            ..Default::default()
        };
        // last edge at 30: nothing is appended
        let insts = create_pb_insts(&generate_pb_channels(2), &config).unwrap();
        assert_eq!(calc_pulse_program_duration(&insts), 30);
        assert_eq!(insts.last(), Some(&PbInstruction::new_continue(0b010, 14)));

        let config = CompileConfig {
            program_length: ProgramLength::Total(20),
            ..config
        };
        assert_eq!(
            create_pb_insts(&generate_pb_channels(2), &config),
            Err(PbError::ProgramTooShort {
                program_length: 20,
                last_edge: 30
            })
        );
    }

    #[test]
    fn branch_to_later_instruction() {
        let config = CompileConfig {
            program_length: padding(22),
            branch_to: 4,
            short_pulse: ShortPulseMode::Disabled,
            ..Default::default()
        };
        let insts = create_pb_insts(&generate_pb_channels(2), &config).unwrap();
        assert_eq!(insts[5], PbInstruction::new(0, Opcode::Branch, 4, 22));

        let config = CompileConfig {
            branch_to: 6,
            ..config
        };
        assert!(matches!(
            create_pb_insts(&generate_pb_channels(2), &config),
            Err(PbError::BranchOutOfRange { .. })
        ));
    }

    #[test]
    fn rejects_invalid_config_and_channels() {
        let channels = generate_pb_channels(2);
        let config = CompileConfig {
            clock_period_ns: 0,
            ..Default::default()
        };
        assert!(matches!(
            create_pb_insts(&channels, &config),
            Err(PbError::InvalidClock(_))
        ));
        let config = CompileConfig {
            short_pulse_bit_num: 30,
            ..Default::default()
        };
        assert_eq!(
            create_pb_insts(&channels, &config),
            Err(PbError::InvalidShortPulseBit { bit: 30 })
        );
        let overlapping = vec![PulseBlasterChannel::new(1, vec![0, 5], vec![10, 10])];
        assert!(matches!(
            create_pb_insts(&overlapping, &CompileConfig::default()),
            Err(PbError::OverlappingPulses { .. })
        ));
    }

    #[test]
    fn rejects_channels_in_short_pulse_field() {
        let channels = vec![
            PulseBlasterChannel::new(1 << 22, vec![0], vec![100]),
            PulseBlasterChannel::new(1 << 0, vec![200], vec![4]),
        ];
        let config = CompileConfig {
            program_length: padding(50),
            ..Default::default()
        };
        assert_eq!(
            create_pb_insts(&channels, &config),
            Err(PbError::ChannelOutOfRange { number: 22, max: 21 })
        );
        // the same output is fine with the field moved up
        let config = CompileConfig {
            short_pulse_bit_num: 23,
            continuous: false,
            ..config
        };
        let insts = create_pb_insts(&channels, &config).unwrap();
        assert_eq!(insts[0], PbInstruction::new_continue(1 << 22, 100));
        assert_eq!(insts[1], PbInstruction::new_continue(0, 100));
    }

    #[test]
    fn no_short_pulses_for_long_program() {
        let channels = vec![
            PulseBlasterChannel::new(1 << 0, vec![60], vec![100]),
            PulseBlasterChannel::new(1 << 1, vec![300, 16], vec![400, 14]),
        ];
        let config = CompileConfig {
            program_length: padding(20),
            continuous: false,
            ..Default::default()
        };
        let insts = create_pb_insts(&channels, &config).unwrap();
        assert!(!has_short_pulses(&insts, 2));
        assert!(insts
            .iter()
            .all(|inst| crate::short_pulse::short_pulse_periods(inst.flags, 21) == 0));
    }
}
