//! Implements struct and methods corresponding to pulse blaster boards. See [`BaseDevice`] for
//! implementation details.
//!
//! ## Device
//! Every [`Device`] corresponds to one physical board with its own clock. A `Device`
//! trivially implements the [`BaseDevice`] trait by supplying field methods.
//!
//! [`Device`] fields keep track of the named channels wired to the board's physical outputs,
//! as well as board-wide data such as the clock period, the position of the short pulse field
//! and the trailing all-off padding of the program.
//!
//! ### Edit and compile caches
//! Pulses are edited per channel into an edit cache of [`PulseBook`]s, kept sorted and checked
//! for overlaps at insertion. [`BaseDevice::compile`] turns the edit cache into
//! [`PulseBlasterChannel`]s, runs [`create_pb_insts`] and stores the resulting instruction list
//! in the compile cache, from where it is handed to the hardware loader (see
//! [`crate::loader`]).
//!
//! ### Generated channels
//! - **Sync out** ([`BaseDevice::add_sync_out`]): a 50 % duty cycle clock on one output,
//!   e.g. to trigger a counter. The program is stretched to an integer number of sync periods.
//! - **PWM** ([`BaseDevice::pwm`]): a single pulse at `t = 0` on every listed channel followed
//!   by all-off padding, which repeats at the requested frequency once the program is looped.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::channel::*;
use crate::compiler::{create_pb_insts, CompileConfig, ProgramLength, ShortPulseMode};
use crate::diagnostics::{format_pb_insts, make_plot_lines, ChannelsLookUp, PlotConfig, PlotLines};
use crate::error::{PbError, Result};
use crate::instruction::*;
use crate::short_pulse::SHORT_PULSE_FIELD_BITS;
use crate::timeline::last_edge;
use crate::utils::*;

/// Edit cache of one named channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelBook {
    number: u32,
    pulses: BTreeSet<PulseBook>,
}
impl ChannelBook {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            pulses: BTreeSet::new(),
        }
    }
    /// Physical output number
    pub fn number(&self) -> u32 {
        self.number
    }
    pub fn flags(&self) -> Flags {
        1 << self.number
    }
    pub fn pulses(&self) -> &BTreeSet<PulseBook> {
        &self.pulses
    }
    pub fn is_edited(&self) -> bool {
        !self.pulses.is_empty()
    }
    pub fn last_pulse_end(&self) -> u64 {
        self.pulses.last().map_or(0, |pulse| pulse.end)
    }
    pub fn clear(&mut self) {
        self.pulses.clear()
    }

    /// Inserts all `pulses` or none of them.
    pub fn insert_pulses(&mut self, pulses: impl IntoIterator<Item = PulseBook>) -> Result<()> {
        let mut edited = self.pulses.clone();
        for pulse in pulses {
            insert_pulse(&mut edited, self.flags(), pulse)?;
        }
        self.pulses = edited;
        Ok(())
    }

    pub fn to_pb_channel(&self) -> PulseBlasterChannel {
        PulseBlasterChannel::new(
            self.flags(),
            self.pulses.iter().map(|pulse| pulse.start).collect(),
            self.pulses.iter().map(|pulse| pulse.length()).collect(),
        )
    }
}

/// Sync out setting of a device: `channel` outputs a clock of `frequency_mhz`.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncOut {
    pub channel: String,
    pub frequency_mhz: f64,
}

/// Sync period in ns for `frequency_mhz`, checked to give pulses of at least one clock period.
fn sync_out_period_ns(frequency_mhz: f64, clock_period_ns: u64) -> Result<f64> {
    let invalid = PbError::InvalidParameter {
        name: "sync_out_mhz",
        value: frequency_mhz,
    };
    if !frequency_mhz.is_finite() || frequency_mhz <= 0. {
        return Err(invalid);
    }
    let period_ns = 1e3 / frequency_mhz;
    if period_ns / 2. < clock_period_ns as f64 {
        return Err(invalid);
    }
    Ok(period_ns)
}

/// Adds a sync out channel on output `number` to `channels`.
///
/// The program duration (last pulse end) is rounded up to an integer number `N` of sync
/// periods `p = 1e3 / frequency_mhz` ns. Pulses ending exactly at the old duration are extended
/// to the new one, and the sync channel gets `N` pulses starting at `k * p` of length `p / 2`.
/// Sync times are quantized to `clock_period_ns` like any other channel.
///
/// # Errors
///
/// [`PbError::InvalidParameter`] unless half a sync period lasts at least one clock period.
///
/// # Example
///
/// ```
/// use pbcompiler_backend::channel::*;
/// use pbcompiler_backend::device::with_sync_out;
///
/// let channels = vec![PulseBlasterChannel::new(0b1, vec![0], vec![250])];
/// let channels = with_sync_out(channels, 3, 10., 2).unwrap();
/// assert_eq!(channels[0].pulse_lengths(), &[300]);
/// assert_eq!(channels[1].flags(), 0b1000);
/// assert_eq!(channels[1].start_times(), &[0, 100, 200]);
/// assert_eq!(channels[1].pulse_lengths(), &[50, 50, 50]);
/// ```
pub fn with_sync_out(
    channels: Vec<PulseBlasterChannel>,
    number: u32,
    frequency_mhz: f64,
    clock_period_ns: u64,
) -> Result<Vec<PulseBlasterChannel>> {
    let period_ns = sync_out_period_ns(frequency_mhz, clock_period_ns)?;
    let duration = last_edge(&channels);
    let num_periods = (duration as f64 / period_ns).ceil() as u64;
    let adjusted_duration = round_to_clock(num_periods as f64 * period_ns, clock_period_ns)?.max(duration);
    debug!(
        "Sync out at {frequency_mhz} MHz: program end moved from {duration} ns to {adjusted_duration} ns"
    );

    let mut channels: Vec<PulseBlasterChannel> = channels
        .into_iter()
        .map(|chan| {
            let pulse_lengths = chan
                .pulses()
                .map(|(&start, &length)| {
                    if start + length == duration {
                        adjusted_duration - start
                    } else {
                        length
                    }
                })
                .collect();
            PulseBlasterChannel::new(chan.flags(), chan.start_times().to_vec(), pulse_lengths)
        })
        .collect();

    let start_times: Vec<f64> = (0..num_periods).map(|k| k as f64 * period_ns).collect();
    let pulse_lengths = vec![0.5 * period_ns; start_times.len()];
    channels.push(new_pb_channel(number, &start_times, &pulse_lengths, clock_period_ns)?);
    Ok(channels)
}

/// The `BaseDevice` trait defines the operations of a pulse blaster board through default
/// implementations on top of a handful of field methods.
///
/// # Trait Methods and Their Functionality:
///
/// - **Field methods**: direct access to the name, clock period, short pulse bit, channel
///   registry and caches of the device.
///
/// - **Channel management**: [`BaseDevice::add_channel`], [`BaseDevice::chan`] and
///   [`BaseDevice::channels_lookup`].
///
/// - **Editing**: [`BaseDevice::high`], [`BaseDevice::pulse_train`],
///   [`BaseDevice::set_all_off_padding`], [`BaseDevice::add_sync_out`] and [`BaseDevice::pwm`].
///   All times are in ns and rounded to the board clock.
///
/// - **Compilation**: [`BaseDevice::compile`] fills the compile cache, read back with
///   [`BaseDevice::pb_insts`], [`BaseDevice::plot_lines`] and [`BaseDevice::total_run_time`].
///
/// - **Status and caches**: [`BaseDevice::is_edited`], [`BaseDevice::is_compiled`],
///   [`BaseDevice::is_fresh_compiled`], [`BaseDevice::clear_edit_cache`] and
///   [`BaseDevice::clear_compile_cache`].
pub trait BaseDevice {
    // Immutable accessors (getters)
    fn name(&self) -> &str;
    fn clock_period_ns(&self) -> u64;
    fn short_pulse_bit_num(&self) -> u32;
    fn all_off_padding_ns(&self) -> u64;
    fn sync_out(&self) -> Option<&SyncOut>;
    fn channels(&self) -> &IndexMap<String, ChannelBook>;
    fn compiled_insts(&self) -> Option<&PbInstructions>;
    fn fresh(&self) -> bool;

    // Mutable accessors
    fn all_off_padding_ns_(&mut self) -> &mut u64;
    fn sync_out_(&mut self) -> &mut Option<SyncOut>;
    fn channels_(&mut self) -> &mut IndexMap<String, ChannelBook>;
    fn compiled_insts_(&mut self) -> &mut Option<PbInstructions>;
    fn fresh_(&mut self) -> &mut bool;

    /// Shortcut to borrow a channel by name
    fn chan(&self, name: &str) -> Result<&ChannelBook> {
        self.channels()
            .get(name)
            .ok_or_else(|| PbError::UnknownChannel {
                device: self.name().to_string(),
                channel: name.to_string(),
            })
    }

    /// Edits the channel `name` and marks the compile cache as stale.
    fn edit_chan<F, R>(&mut self, name: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut ChannelBook) -> Result<R>,
    {
        let device = self.name().to_string();
        let chan = self
            .channels_()
            .get_mut(name)
            .ok_or_else(|| PbError::UnknownChannel {
                device,
                channel: name.to_string(),
            })?;
        let result = f(chan);
        if result.is_ok() {
            *self.fresh_() = false;
        }
        result
    }

    /// Registers channel `name` driving physical output `number`.
    ///
    /// # Errors
    /// - [`PbError::InvalidName`] unless `name` matches `^[A-Za-z_][A-Za-z0-9_]*$`.
    /// - [`PbError::ChannelOutOfRange`] unless `number` is below both the short pulse bit and
    ///   [`MAX_CHANNELS`].
    /// - [`PbError::DuplicateChannel`] / [`PbError::DuplicatePhysicalChannel`] if the name or
    ///   the output is already taken.
    fn add_channel(&mut self, name: &str, number: u32) -> Result<()> {
        check_name(name)?;
        let max = self.short_pulse_bit_num().min(MAX_CHANNELS);
        if number >= max {
            return Err(PbError::ChannelOutOfRange { number, max });
        }
        if self.channels().contains_key(name) {
            return Err(PbError::DuplicateChannel {
                device: self.name().to_string(),
                channel: name.to_string(),
            });
        }
        if let Some((other, _)) = self.channels().iter().find(|(_, chan)| chan.number() == number) {
            return Err(PbError::DuplicatePhysicalChannel {
                device: self.name().to_string(),
                channel: other.to_string(),
                number,
            });
        }
        self.channels_().insert(name.to_string(), ChannelBook::new(number));
        Ok(())
    }

    /// Channel number -> name of all registered channels.
    fn channels_lookup(&self) -> ChannelsLookUp {
        self.channels()
            .iter()
            .map(|(name, chan)| (chan.number(), name.clone()))
            .collect()
    }

    /// Rounds a time in ns to the device clock.
    fn to_ticks_ns(&self, time_ns: f64) -> Result<u64> {
        round_to_clock(time_ns, self.clock_period_ns())
    }

    /// Rounds `(t_ns, duration_ns)` to the device clock and checks the pulse is not empty.
    fn pulse_book(&self, t_ns: f64, duration_ns: f64) -> Result<PulseBook> {
        let start = self.to_ticks_ns(t_ns)?;
        let length = self.to_ticks_ns(duration_ns)?;
        if length == 0 {
            return Err(PbError::InvalidParameter {
                name: "duration_ns",
                value: duration_ns,
            });
        }
        let end = start.checked_add(length).ok_or(PbError::InvalidTime {
            value: t_ns + duration_ns,
        })?;
        Ok(PulseBook::new(start, end))
    }

    /// Sets channel `chan_name` high for `duration_ns` starting at `t_ns`.
    ///
    /// Start and duration are rounded to the clock separately (half to even).
    ///
    /// # Errors
    /// - [`PbError::UnknownChannel`]
    /// - [`PbError::InvalidTime`] for negative or non-finite times,
    /// - [`PbError::InvalidParameter`] if the duration rounds to zero,
    /// - [`PbError::OverlappingPulses`] if the pulse overlaps an earlier one of the channel.
    fn high(&mut self, chan_name: &str, t_ns: f64, duration_ns: f64) -> Result<()> {
        let pulse = self.pulse_book(t_ns, duration_ns)?;
        self.edit_chan(chan_name, |chan| chan.insert_pulses([pulse]))
    }

    /// Adds a train of pulses to channel `chan_name`: all of them or, on error, none.
    fn pulse_train(&mut self, chan_name: &str, start_times_ns: &[f64], pulse_lengths_ns: &[f64]) -> Result<()> {
        if start_times_ns.len() != pulse_lengths_ns.len() {
            return Err(PbError::PulseCountMismatch {
                num_starts: start_times_ns.len(),
                num_lengths: pulse_lengths_ns.len(),
            });
        }
        let pulses = start_times_ns
            .iter()
            .zip(pulse_lengths_ns)
            .map(|(&t, &duration)| self.pulse_book(t, duration))
            .collect::<Result<Vec<_>>>()?;
        self.edit_chan(chan_name, |chan| chan.insert_pulses(pulses))
    }

    /// Sets the time all channels stay low after the last pulse end.
    fn set_all_off_padding(&mut self, padding_ns: f64) -> Result<()> {
        let padding = self.to_ticks_ns(padding_ns)?;
        *self.all_off_padding_ns_() = padding;
        *self.fresh_() = false;
        Ok(())
    }

    /// Makes channel `chan_name` output a `sync_out_mhz` clock when compiling, see
    /// [`with_sync_out`]. Pulses edited on that channel are ignored.
    fn add_sync_out(&mut self, chan_name: &str, sync_out_mhz: f64) -> Result<()> {
        self.chan(chan_name)?;
        sync_out_period_ns(sync_out_mhz, self.clock_period_ns())?;
        *self.sync_out_() = Some(SyncOut {
            channel: chan_name.to_string(),
            frequency_mhz: sync_out_mhz,
        });
        *self.fresh_() = false;
        Ok(())
    }

    /// Pulse width modulation of `chan_names` at `frequency_hz`.
    ///
    /// Each channel is high for `duty_cycle_percent / 100` of the period starting at `t = 0`,
    /// and the all-off padding is set to the rest of the period. Compile with
    /// `continuous = true` to repeat the period. Either every channel and the padding are
    /// edited, or on error nothing is.
    ///
    /// # Example
    ///
    /// ```
    /// use pbcompiler_backend::device::*;
    ///
    /// let mut dev = Device::new("pb", 500e6, 21).unwrap();
    /// dev.add_channel("led", 0).unwrap();
    /// dev.pwm(&["led"], 1e6, 25.).unwrap();
    /// assert_eq!(dev.compile(true, 0).unwrap(), 1000);
    /// assert_eq!(dev.pb_insts().unwrap()[0].length, 250);
    /// ```
    fn pwm(&mut self, chan_names: &[&str], frequency_hz: f64, duty_cycle_percent: f64) -> Result<()> {
        if !frequency_hz.is_finite() || frequency_hz <= 0. {
            return Err(PbError::InvalidParameter {
                name: "frequency_hz",
                value: frequency_hz,
            });
        }
        if !(0. ..=100.).contains(&duty_cycle_percent) {
            return Err(PbError::InvalidParameter {
                name: "duty_cycle_percent",
                value: duty_cycle_percent,
            });
        }
        let period_ns = 1e9 / frequency_hz;
        let up_ns = duty_cycle_percent / 100. * period_ns;
        let padding = self.to_ticks_ns(period_ns - up_ns)?;

        let mut edited: IndexMap<&str, ChannelBook> = IndexMap::new();
        for &name in chan_names {
            if !edited.contains_key(name) {
                edited.insert(name, self.chan(name)?.clone());
            }
        }
        if self.to_ticks_ns(up_ns)? > 0 {
            let pulse = self.pulse_book(0., up_ns)?;
            for &name in chan_names {
                if let Some(chan) = edited.get_mut(name) {
                    chan.insert_pulses([pulse])?;
                }
            }
        } else {
            warn!(
                "PWM duty cycle {duty_cycle_percent} % of {period_ns} ns is shorter than the clock period, channels stay low"
            );
        }

        for (name, chan) in edited {
            if let Some(book) = self.channels_().get_mut(name) {
                *book = chan;
            }
        }
        *self.all_off_padding_ns_() = padding;
        *self.fresh_() = false;
        Ok(())
    }

    /// A device is edited if any of its channels holds pulses.
    fn is_edited(&self) -> bool {
        self.channels().values().any(|chan| chan.is_edited())
    }
    fn is_compiled(&self) -> bool {
        self.compiled_insts().is_some()
    }
    /// Compiled, and not edited since.
    fn is_fresh_compiled(&self) -> bool {
        self.is_compiled() && self.fresh()
    }
    /// Clears all pulses and the sync out setting. The all-off padding is a board setting and
    /// is kept.
    fn clear_edit_cache(&mut self) {
        for chan in self.channels_().values_mut() {
            chan.clear()
        }
        *self.sync_out_() = None;
        *self.fresh_() = false;
    }
    fn clear_compile_cache(&mut self) {
        *self.compiled_insts_() = None;
        *self.fresh_() = false;
    }

    /// End of the latest edited pulse in ns.
    fn last_pulse_end(&self) -> u64 {
        self.channels()
            .values()
            .map(|chan| chan.last_pulse_end())
            .max()
            .unwrap_or(0)
    }

    /// Channels handed to the compiler, the sync out channel included.
    fn pb_channels(&self) -> Result<Vec<PulseBlasterChannel>> {
        let sync_name = self.sync_out().map(|sync| sync.channel.as_str());
        let channels: Vec<PulseBlasterChannel> = self
            .channels()
            .iter()
            .filter(|(name, _)| Some(name.as_str()) != sync_name)
            .map(|(_, chan)| chan.to_pb_channel())
            .collect();
        match self.sync_out() {
            Some(sync) => {
                let sync_chan = self.chan(&sync.channel)?;
                if sync_chan.is_edited() {
                    warn!(
                        "Pulses edited on sync out channel {}/{} are ignored",
                        self.name(),
                        sync.channel
                    );
                }
                with_sync_out(channels, sync_chan.number(), sync.frequency_mhz, self.clock_period_ns())
            }
            None => Ok(channels),
        }
    }

    /// Compiles the edit cache into the instruction list of the board.
    ///
    /// With `continuous = true` the last instruction branches to instruction `branch_to`.
    /// Short instructions are handled with the short pulse feature.
    ///
    /// Returns the total program duration in ns.
    fn compile(&mut self, continuous: bool, branch_to: usize) -> Result<u64> {
        let config = CompileConfig {
            program_length: ProgramLength::AllOffPadding(self.all_off_padding_ns()),
            continuous,
            branch_to,
            clock_period_ns: self.clock_period_ns(),
            short_pulse_bit_num: self.short_pulse_bit_num(),
            short_pulse: ShortPulseMode::Auto,
        };
        let pb_insts = create_pb_insts(&self.pb_channels()?, &config)?;
        let duration = calc_pulse_program_duration(&pb_insts);
        info!(
            "Device {}: compiled {} instructions, {} ns",
            self.name(),
            pb_insts.len(),
            duration
        );
        *self.compiled_insts_() = Some(pb_insts);
        *self.fresh_() = true;
        Ok(duration)
    }

    /// The compiled instruction list.
    fn pb_insts(&self) -> Result<&[PbInstruction]> {
        self.compiled_insts()
            .map(|insts| insts.as_slice())
            .ok_or_else(|| PbError::NotCompiled(self.name().to_string()))
    }

    fn total_run_time(&self) -> Result<u64> {
        Ok(calc_pulse_program_duration(self.pb_insts()?))
    }

    fn format_insts(&self) -> Result<String> {
        Ok(format_pb_insts(self.pb_insts()?))
    }

    /// Timing diagram of the compiled program, lines named after the channels.
    fn plot_lines(&self) -> Result<PlotLines> {
        let config = PlotConfig {
            clock_period_ns: self.clock_period_ns(),
            short_pulse_bit_num: self.short_pulse_bit_num(),
            ..Default::default()
        };
        Ok(make_plot_lines(self.pb_insts()?, Some(&self.channels_lookup()), &config))
    }
}

/// A pulse blaster board.
///
/// - `clock_period_ns`: derived from the clock frequency passed to [`Device::new`], 2 ns for
///   the usual 500 MHz board.
/// - `short_pulse_bit_num`: first bit of the short pulse field, which is also the number of
///   usable physical outputs (21 on a PulseBlasterESR-PRO).
#[derive(Clone, Debug)]
pub struct Device {
    name: String,
    clock_period_ns: u64,
    short_pulse_bit_num: u32,
    all_off_padding_ns: u64,
    sync_out: Option<SyncOut>,
    channels: IndexMap<String, ChannelBook>,
    compiled_insts: Option<PbInstructions>,
    fresh: bool,
}

impl BaseDevice for Device {
    fn name(&self) -> &str {
        &self.name
    }
    fn clock_period_ns(&self) -> u64 {
        self.clock_period_ns
    }
    fn short_pulse_bit_num(&self) -> u32 {
        self.short_pulse_bit_num
    }
    fn all_off_padding_ns(&self) -> u64 {
        self.all_off_padding_ns
    }
    fn sync_out(&self) -> Option<&SyncOut> {
        self.sync_out.as_ref()
    }
    fn channels(&self) -> &IndexMap<String, ChannelBook> {
        &self.channels
    }
    fn compiled_insts(&self) -> Option<&PbInstructions> {
        self.compiled_insts.as_ref()
    }
    fn fresh(&self) -> bool {
        self.fresh
    }

    fn all_off_padding_ns_(&mut self) -> &mut u64 {
        &mut self.all_off_padding_ns
    }
    fn sync_out_(&mut self) -> &mut Option<SyncOut> {
        &mut self.sync_out
    }
    fn channels_(&mut self) -> &mut IndexMap<String, ChannelBook> {
        &mut self.channels
    }
    fn compiled_insts_(&mut self) -> &mut Option<PbInstructions> {
        &mut self.compiled_insts
    }
    fn fresh_(&mut self) -> &mut bool {
        &mut self.fresh
    }
}

impl Device {
    /// Constructs a board running at `clock_frequency_hz` whose short pulse field starts at
    /// bit `short_pulse_bit_num`.
    ///
    /// # Errors
    /// - [`PbError::InvalidName`] for names which are not identifiers,
    /// - [`PbError::InvalidClock`] unless the clock period is at least 1 ns,
    /// - [`PbError::InvalidShortPulseBit`] if the short pulse field does not fit the flags word.
    ///
    /// # Example
    /// ```
    /// use pbcompiler_backend::device::*;
    ///
    /// let dev = Device::new("PB_ESR_PRO", 500e6, 21).unwrap();
    /// assert_eq!(dev.clock_period_ns(), 2);
    /// assert!(!dev.is_edited());
    /// assert!(Device::new("PB", 500e6, 30).is_err());
    /// ```
    pub fn new(name: &str, clock_frequency_hz: f64, short_pulse_bit_num: u32) -> Result<Self> {
        check_name(name)?;
        let clock_period_ns = clock_period_from_frequency(clock_frequency_hz)?;
        if short_pulse_bit_num + SHORT_PULSE_FIELD_BITS > Flags::BITS {
            return Err(PbError::InvalidShortPulseBit {
                bit: short_pulse_bit_num,
            });
        }
        Ok(Self {
            name: name.to_string(),
            clock_period_ns,
            short_pulse_bit_num,
            all_off_padding_ns: 0,
            sync_out: None,
            channels: IndexMap::new(),
            compiled_insts: None,
            fresh: false,
        })
    }
}
