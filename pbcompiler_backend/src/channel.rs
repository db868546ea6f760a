//! Struct and methods corresponding to pulse blaster output channels. See [`BaseChannel`] for
//! implementation details.
//!
//! A [`PulseBlasterChannel`] describes the pulse train of one physical output: the `flags` word
//! with the single bit of that output set, and the `(start_time, pulse_length)` pairs during
//! which the output is high. All times are integer ns, quantized to the board clock by
//! [`new_pb_channel`].
//!
//! ## Editing behavior
//! Channels are immutable once constructed. Devices collect pulses in an edit cache of
//! [`PulseBook`]s, kept sorted and free of overlaps by a `BTreeSet`, and turn it into a
//! `PulseBlasterChannel` when compiling (see [`crate::device`]).

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::iter::Zip;
use std::slice::Iter;

use crate::error::{PbError, Result};
use crate::instruction::Flags;
use crate::utils::round_to_clock;

/// Number of physical output channels of the board (24-bit flags word).
pub const MAX_CHANNELS: u32 = 24;

pub trait BaseChannel {
    // Field methods
    fn flags(&self) -> Flags;
    fn start_times(&self) -> &[u64];
    fn pulse_lengths(&self) -> &[u64];

    /// Physical output driven by this channel (index of the flags bit).
    fn channel_number(&self) -> u32 {
        self.flags().trailing_zeros()
    }
    fn num_pulses(&self) -> usize {
        self.start_times().len()
    }
    /// `(start_time, pulse_length)` pairs
    fn pulses(&self) -> Zip<Iter<'_, u64>, Iter<'_, u64>> {
        self.start_times().iter().zip(self.pulse_lengths().iter())
    }
    /// End of the latest pulse, `0` for a channel without pulses.
    fn last_pulse_end(&self) -> u64 {
        self.pulses()
            .map(|(start, length)| start + length)
            .max()
            .unwrap_or(0)
    }

    /// Checks that no two pulses of the channel overlap. Touching pulses are allowed.
    fn check_no_overlaps(&self) -> Result<()> {
        let mut pulses: Vec<(u64, u64)> = self
            .pulses()
            .map(|(&start, &length)| (start, start + length))
            .collect();
        pulses.sort_unstable();
        for pair in pulses.windows(2) {
            let ((start, end), (other_start, other_end)) = (pair[0], pair[1]);
            if other_start < end {
                return Err(PbError::OverlappingPulses {
                    flags: self.flags(),
                    start,
                    end,
                    other_start,
                    other_end,
                });
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PulseBlasterChannel {
    flags: Flags,
    start_times: Vec<u64>,
    pulse_lengths: Vec<u64>,
}

impl BaseChannel for PulseBlasterChannel {
    fn flags(&self) -> Flags {
        self.flags
    }
    fn start_times(&self) -> &[u64] {
        &self.start_times
    }
    fn pulse_lengths(&self) -> &[u64] {
        &self.pulse_lengths
    }
}

impl PulseBlasterChannel {
    /// Raw constructor: takes already quantized ns values and performs no checks.
    ///
    /// # Panics
    ///
    /// Panics if `start_times` and `pulse_lengths` differ in length.
    pub fn new(flags: Flags, start_times: Vec<u64>, pulse_lengths: Vec<u64>) -> Self {
        assert_eq!(
            start_times.len(),
            pulse_lengths.len(),
            "Channel with flags {flags:#b} got {} start times but {} pulse lengths",
            start_times.len(),
            pulse_lengths.len()
        );
        Self {
            flags,
            start_times,
            pulse_lengths,
        }
    }
}

impl fmt::Display for PulseBlasterChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Channel {} (flags: {:024b}, #pulses: {})",
            self.channel_number(),
            self.flags,
            self.num_pulses()
        )
    }
}

/// Creates a channel for physical output `channel_number` from times in ns.
///
/// Start times and pulse lengths are rounded to the nearest multiple of `clock_period_ns`,
/// ties going to the even multiple.
///
/// # Errors
///
/// - [`PbError::PulseCountMismatch`] if the two slices differ in length.
/// - [`PbError::ChannelOutOfRange`] if `channel_number >= MAX_CHANNELS`.
/// - [`PbError::InvalidClock`] for a zero clock period.
/// - [`PbError::InvalidTime`] for negative or non-finite times.
/// - [`PbError::OverlappingPulses`] if pulses overlap after rounding.
///
/// # Example
///
/// ```
/// use pbcompiler_backend::channel::*;
///
/// let chan = new_pb_channel(3, &[0., 11.], &[5., 3.], 2).unwrap();
/// assert_eq!(chan.flags(), 0b1000);
/// assert_eq!(chan.start_times(), &[0, 12]);
/// assert_eq!(chan.pulse_lengths(), &[4, 4]);
///
/// // pulses 0-10 and 8-12 overlap
/// assert!(new_pb_channel(3, &[0., 8.], &[10., 4.], 2).is_err());
/// ```
pub fn new_pb_channel(
    channel_number: u32,
    start_times: &[f64],
    pulse_lengths: &[f64],
    clock_period_ns: u64,
) -> Result<PulseBlasterChannel> {
    if start_times.len() != pulse_lengths.len() {
        return Err(PbError::PulseCountMismatch {
            num_starts: start_times.len(),
            num_lengths: pulse_lengths.len(),
        });
    }
    if channel_number >= MAX_CHANNELS {
        return Err(PbError::ChannelOutOfRange {
            number: channel_number,
            max: MAX_CHANNELS,
        });
    }
    if clock_period_ns == 0 {
        return Err(PbError::InvalidClock("clock period must be at least 1 ns".to_string()));
    }
    let quantize = |times: &[f64]| -> Result<Vec<u64>> {
        times
            .iter()
            .map(|&t| round_to_clock(t, clock_period_ns))
            .collect()
    };
    let chan = PulseBlasterChannel::new(
        1 << channel_number,
        quantize(start_times)?,
        quantize(pulse_lengths)?,
    );
    chan.check_no_overlaps()?;
    Ok(chan)
}

/// A pulse in a device's edit cache: `start` is inclusive, `end` exclusive (both ns).
///
/// `PulseBook` orders by `start` to allow sorting and range queries inside a `BTreeSet`.
#[derive(Clone, Copy, Debug)]
pub struct PulseBook {
    pub start: u64,
    pub end: u64,
}
impl PulseBook {
    /// # Panics
    ///
    /// Panics unless `end` is strictly greater than `start`.
    pub fn new(start: u64, end: u64) -> Self {
        assert!(
            end > start,
            "Pulse end {} should be strictly greater than start {}",
            end,
            start
        );
        Self { start, end }
    }

    pub fn length(&self) -> u64 {
        self.end - self.start
    }
}
impl Ord for PulseBook {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start)
    }
}
impl PartialOrd for PulseBook {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for PulseBook {
    fn eq(&self, other: &Self) -> bool {
        self.start == other.start
    }
}
impl Eq for PulseBook {}
impl fmt::Display for PulseBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PulseBook({}-{} ns)", self.start, self.end)
    }
}

/// Inserts `pulse` into a sorted edit cache, rejecting overlaps with its neighbours.
pub fn insert_pulse(pulses: &mut BTreeSet<PulseBook>, flags: Flags, pulse: PulseBook) -> Result<()> {
    let overlap = |other: &PulseBook| PbError::OverlappingPulses {
        flags,
        start: pulse.start,
        end: pulse.end,
        other_start: other.start,
        other_end: other.end,
    };
    if let Some(next) = pulses.range(&pulse..).next() {
        if next.start < pulse.end {
            return Err(overlap(next));
        }
    }
    if let Some(prev) = pulses.range(..&pulse).next_back() {
        if prev.end > pulse.start {
            return Err(overlap(prev));
        }
    }
    pulses.insert(pulse);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_channel() {
        let chan = PulseBlasterChannel::new(1 << 5, vec![6, 30], vec![10, 4]);
        assert_eq!(chan.channel_number(), 5);
        assert_eq!(chan.num_pulses(), 2);
        assert_eq!(chan.last_pulse_end(), 34);
        assert_eq!(
            chan.pulses().collect::<Vec<_>>(),
            vec![(&6, &10), (&30, &4)]
        );
        assert_eq!(
            chan.to_string(),
            "Channel 5 (flags: 000000000000000000100000, #pulses: 2)"
        );
    }

    #[test]
    fn empty_channel() {
        let chan = new_pb_channel(0, &[], &[], 2).unwrap();
        assert_eq!(chan.num_pulses(), 0);
        assert_eq!(chan.last_pulse_end(), 0);
    }

    #[test]
    fn quantizes_to_clock() {
        let chan = new_pb_channel(1, &[1., 3., 10.2], &[1., 2.9, 7.], 2).unwrap();
        assert_eq!(chan.flags(), 2);
        assert_eq!(chan.start_times(), &[0, 4, 10]);
        assert_eq!(chan.pulse_lengths(), &[0, 2, 8]);
    }

    #[test]
    fn constructor_errors() {
        assert_eq!(
            new_pb_channel(0, &[0.], &[], 2),
            Err(PbError::PulseCountMismatch {
                num_starts: 1,
                num_lengths: 0
            })
        );
        assert_eq!(
            new_pb_channel(24, &[0.], &[2.], 2),
            Err(PbError::ChannelOutOfRange { number: 24, max: 24 })
        );
        assert!(matches!(
            new_pb_channel(0, &[0.], &[2.], 0),
            Err(PbError::InvalidClock(_))
        ));
        assert_eq!(
            new_pb_channel(0, &[-2.], &[2.], 2),
            Err(PbError::InvalidTime { value: -2. })
        );
    }

    #[test]
    fn overlaps_detected_regardless_of_order() {
        let chan = PulseBlasterChannel::new(1, vec![20, 0, 8], vec![4, 10, 4]);
        assert_eq!(
            chan.check_no_overlaps(),
            Err(PbError::OverlappingPulses {
                flags: 1,
                start: 0,
                end: 10,
                other_start: 8,
                other_end: 12
            })
        );
        // touching pulses are fine
        let chan = PulseBlasterChannel::new(1, vec![10, 0], vec![4, 10]);
        assert!(chan.check_no_overlaps().is_ok());
    }

    #[test]
    fn insert_pulse_keeps_order_and_rejects_overlaps() {
        let mut pulses = BTreeSet::new();
        insert_pulse(&mut pulses, 1, PulseBook::new(10, 20)).unwrap();
        insert_pulse(&mut pulses, 1, PulseBook::new(0, 10)).unwrap();
        insert_pulse(&mut pulses, 1, PulseBook::new(30, 32)).unwrap();
        assert!(insert_pulse(&mut pulses, 1, PulseBook::new(15, 25)).is_err());
        assert!(insert_pulse(&mut pulses, 1, PulseBook::new(25, 31)).is_err());
        assert!(insert_pulse(&mut pulses, 1, PulseBook::new(5, 8)).is_err());
        let starts: Vec<u64> = pulses.iter().map(|p| p.start).collect();
        assert_eq!(starts, vec![0, 10, 30]);
    }

    #[test]
    #[should_panic(expected = "should be strictly greater than start")]
    fn empty_pulse_book() {
        PulseBook::new(5, 5);
    }
}
