//! Read-only views of compiled programs: bit-string dumps, timing diagrams and per-tick replay.
//!
//! Nothing in this module alters instruction data.
//!
//! ## Plot lines
//! [`make_plot_lines`] turns a program into one step line per used channel, as
//! `(times, levels)` vertex lists ready for any plotting frontend. Instructions carrying a
//! short pulse field (see [`crate::short_pulse`]) are drawn as the `N`-period pulse the
//! hardware actually produces, not as the stretched instruction.

use indexmap::IndexMap;
use log::{debug, log_enabled, Level};
use ndarray::Array1;

use crate::instruction::{calc_pulse_program_duration, extract_channels_used, Flags, PbInstruction};
use crate::short_pulse::short_pulse_periods;

/// Channel number -> display name.
pub type ChannelsLookUp = IndexMap<u32, String>;
/// Channel name -> `(times_ns, levels)` vertices of its step line.
pub type PlotLines = IndexMap<String, (Vec<u64>, Vec<u8>)>;

/// Formats the `width` least significant bits of `flags`, most significant first.
///
/// ```
/// use pbcompiler_backend::diagnostics::format_flags;
///
/// assert_eq!(format_flags(0b101, 6), "000101");
/// ```
pub fn format_flags(flags: Flags, width: usize) -> String {
    format!("{:0width$b}", flags, width = width)
}

/// One line per instruction, prefixed by its index (the target of a branch).
pub fn format_pb_insts(pb_insts: &[PbInstruction]) -> String {
    pb_insts
        .iter()
        .enumerate()
        .map(|(i, inst)| format!("{i:>4}: {inst}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn log_pb_insts(pb_insts: &[PbInstruction]) {
    if log_enabled!(Level::Debug) {
        for line in format_pb_insts(pb_insts).lines() {
            debug!("{line}");
        }
    }
}

/// Drawing parameters of [`make_plot_lines`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlotConfig {
    pub low: u8,
    pub high: u8,
    pub clock_period_ns: u64,
    pub short_pulse_bit_num: u32,
}
impl Default for PlotConfig {
    fn default() -> Self {
        Self {
            low: 0,
            high: 1,
            clock_period_ns: 2,
            short_pulse_bit_num: 21,
        }
    }
}

struct StepLine<'a> {
    times: Vec<u64>,
    levels: Vec<u8>,
    config: &'a PlotConfig,
}
impl<'a> StepLine<'a> {
    fn new(config: &'a PlotConfig) -> Self {
        Self {
            times: vec![0],
            levels: vec![config.low],
            config,
        }
    }

    fn is_high(&self) -> bool {
        self.levels.last() == Some(&self.config.high)
    }

    fn push(&mut self, time: u64, level: u8) {
        self.times.push(time);
        self.levels.push(level);
    }

    fn rise(&mut self, time: u64) {
        self.push(time, self.config.low);
        self.push(time, self.config.high);
    }

    fn fall(&mut self, time: u64) {
        self.push(time, self.config.high);
        self.push(time, self.config.low);
    }

    /// Short pulse of the instruction spanning `time..time + length`, on a line which is
    /// already high.
    fn short_pulse_from_high(&mut self, time: u64, length: u64, periods: u32) {
        let end = time + self.config.clock_period_ns * periods as u64;
        if end < time + length {
            self.fall(end);
        }
    }

    /// Short pulse of the instruction spanning `time..time + length`, on a low line. A pulse
    /// covering the whole instruction is left high for the next instruction to close.
    fn short_pulse_from_low(&mut self, time: u64, length: u64, periods: u32) {
        let end = time + self.config.clock_period_ns * periods as u64;
        self.rise(time);
        self.push(end, self.config.high);
        if end < time + length {
            self.push(end, self.config.low);
        }
    }

    fn finish(mut self, end: u64) -> (Vec<u64>, Vec<u8>) {
        if self.times.last() != Some(&end) {
            let level = self.levels.last().copied().unwrap_or(self.config.low);
            self.push(end, level);
        }
        (self.times, self.levels)
    }
}

/// Creates a step line for every channel that is high somewhere in `pb_insts`.
///
/// Lines are named after `channels_lookup`, falling back to `chan_{n}` for channels it does not
/// list. All lines start at `(0, low)` and end at the program duration.
///
/// # Example
///
/// ```
/// use pbcompiler_backend::diagnostics::*;
/// use pbcompiler_backend::instruction::PbInstruction;
///
/// let insts = vec![
///     PbInstruction::new_continue(0b00, 10),
///     PbInstruction::new_continue(0b10, 20),
/// ];
/// let lookup: ChannelsLookUp = [(1, "laser".to_string())].into_iter().collect();
/// let lines = make_plot_lines(&insts, Some(&lookup), &PlotConfig::default());
/// assert_eq!(lines["laser"], (vec![0, 10, 10, 30], vec![0, 0, 1, 1]));
/// ```
pub fn make_plot_lines(
    pb_insts: &[PbInstruction],
    channels_lookup: Option<&ChannelsLookUp>,
    config: &PlotConfig,
) -> PlotLines {
    let used_channels = extract_channels_used(pb_insts, config.short_pulse_bit_num);
    let mut lines: IndexMap<u32, (String, StepLine)> = used_channels
        .into_iter()
        .map(|num| {
            let name = channels_lookup
                .and_then(|lookup| lookup.get(&num).cloned())
                .unwrap_or_else(|| format!("chan_{num}"));
            (num, (name, StepLine::new(config)))
        })
        .collect();

    let mut time = 0;
    for inst in pb_insts {
        let periods = short_pulse_periods(inst.flags, config.short_pulse_bit_num);
        for (&num, (_, line)) in lines.iter_mut() {
            let is_high = inst.flags & (1 << num) != 0;
            let was_high = line.is_high();
            match (periods > 0, is_high, was_high) {
                (true, true, true) => line.short_pulse_from_high(time, inst.length, periods),
                (true, true, false) => line.short_pulse_from_low(time, inst.length, periods),
                (false, true, false) => line.rise(time),
                (_, false, true) => line.fall(time),
                _ => {}
            }
        }
        time += inst.length;
    }

    lines
        .into_values()
        .map(|(name, line)| (name, line.finish(time)))
        .collect()
}

/// Samples the output state every `tick_ns`, starting at `t = 0`.
///
/// Sample `i` holds the flags of the instruction running at `i * tick_ns`. Short pulse fields
/// are replayed as they are stored, not decoded.
///
/// # Panics
///
/// Panics if `tick_ns` is zero.
pub fn replay_flags(pb_insts: &[PbInstruction], tick_ns: u64) -> Array1<Flags> {
    assert!(tick_ns > 0, "Replay tick must be at least 1 ns");
    let num_samps = (calc_pulse_program_duration(pb_insts) / tick_ns) as usize;
    let mut samps = Array1::zeros(num_samps);
    let mut insts = pb_insts.iter();
    let (mut flags, mut inst_end) = (0, 0);
    for (i, samp) in samps.iter_mut().enumerate() {
        let time = i as u64 * tick_ns;
        while time >= inst_end {
            match insts.next() {
                Some(inst) => {
                    flags = inst.flags;
                    inst_end += inst.length;
                }
                None => break,
            }
        }
        *samp = flags;
    }
    samps
}
