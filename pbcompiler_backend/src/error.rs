//! Error type shared by all fallible operations of the compiler.
//!
//! The compiler itself is a pure function of its inputs, so every error here is either a
//! caller-contract violation (overlapping pulses, an out-of-range channel number, an unknown
//! device) or a structurally impossible request such as looping an empty program.

use crate::instruction::Flags;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum PbError {
    #[error("Cannot make an empty pulse program continuous: there is no last instruction to branch from")]
    EmptyProgram,

    #[error("Branch target {branch_to} is out of range for a program of {num_insts} instructions")]
    BranchOutOfRange { branch_to: usize, num_insts: usize },

    #[error("Channel number {number} is out of range, the board provides channels 0..{max}")]
    ChannelOutOfRange { number: u32, max: u32 },

    #[error("Got {num_starts} start times but {num_lengths} pulse lengths")]
    PulseCountMismatch { num_starts: usize, num_lengths: usize },

    #[error("Invalid time value {value} ns: times must be finite and non-negative")]
    InvalidTime { value: f64 },

    #[error("Pulse {start}-{end} ns overlaps with pulse {other_start}-{other_end} ns on channel with flags {flags:#026b}")]
    OverlappingPulses {
        flags: Flags,
        start: u64,
        end: u64,
        other_start: u64,
        other_end: u64,
    },

    #[error("Requested program length {program_length} ns is shorter than the last pulse edge at {last_edge} ns")]
    ProgramTooShort { program_length: u64, last_edge: u64 },

    #[error("Invalid clock: {0}")]
    InvalidClock(String),

    #[error("Short pulse bit {bit} leaves no room for the 3-bit short pulse field in a 32-bit flags word")]
    InvalidShortPulseBit { bit: u32 },

    #[error("Invalid name {0:?}: expecting a letter or underscore followed by letters, digits or underscores")]
    InvalidName(String),

    #[error("Device {0} already registered")]
    DuplicateDevice(String),

    #[error("There is no device {0} registered")]
    UnknownDevice(String),

    #[error("Device {device} already has a channel {channel}")]
    DuplicateChannel { device: String, channel: String },

    #[error("Physical channel {number} of device {device} is already registered as {channel}")]
    DuplicatePhysicalChannel {
        device: String,
        channel: String,
        number: u32,
    },

    #[error("Device {device} does not have channel {channel}")]
    UnknownChannel { device: String, channel: String },

    #[error("Device {0} is not compiled")]
    NotCompiled(String),

    #[error("Invalid {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("Pulse blaster driver error: {0}")]
    Driver(String),
}

pub type Result<T, E = PbError> = std::result::Result<T, E>;
