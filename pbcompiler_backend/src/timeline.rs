//! Event extraction: from channels to a time-ordered list of flag updates.
//!
//! Every pulse contributes two edges, one at its start and one at its end, both carrying the
//! channel's flags. Since XOR is self-inverse, applying the same flags twice switches the
//! channel on and off again, so the cumulative XOR of the sorted updates reconstructs the
//! output state at every instant.
//!
//! A seed event `(0, 0)` makes sure the first interval is measured from `t = 0`. The last
//! interval runs from the last edge for `all_off_padding` ns, during which all channels are low.

use crate::channel::BaseChannel;
use crate::instruction::Flags;

/// An edge of the program: at `time` (ns), XOR `update_flags` into the output state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PbEvent {
    time: u64,
    update_flags: Flags,
}

/// Returns `(inst_lengths, update_flags)`, two parallel arrays of equal length.
///
/// `update_flags[i]` is applied at the start of the interval of length `inst_lengths[i]`.
/// Edges sharing a timestamp are all retained: the earlier of them get a zero length, and it
/// is up to [`crate::instruction::build_pb_insts`] to compose them into one instruction.
///
/// # Example
///
/// ```
/// use pbcompiler_backend::channel::PulseBlasterChannel;
/// use pbcompiler_backend::timeline::ordered_inst_lengths_and_update_flags;
///
/// let (c0, c1) = (1, 2);
/// let channels = vec![
///     PulseBlasterChannel::new(c0, vec![6], vec![10]),
///     PulseBlasterChannel::new(c1, vec![2, 16], vec![8, 14]),
/// ];
/// let (lengths, updates) = ordered_inst_lengths_and_update_flags(&channels, 22);
/// assert_eq!(lengths, vec![2, 4, 4, 6, 0, 14, 22]);
/// assert_eq!(updates, vec![0, c1, c0, c1, c0, c1, c1]);
/// ```
pub fn ordered_inst_lengths_and_update_flags<C: BaseChannel>(
    channels: &[C],
    all_off_padding: u64,
) -> (Vec<u64>, Vec<Flags>) {
    let num_edges: usize = channels.iter().map(|c| 2 * c.num_pulses()).sum();
    let mut events = Vec::with_capacity(num_edges + 1);
    events.push(PbEvent {
        time: 0,
        update_flags: 0,
    });
    for chan in channels {
        for (&start, &length) in chan.pulses() {
            events.push(PbEvent {
                time: start,
                update_flags: chan.flags(),
            });
            events.push(PbEvent {
                time: start + length,
                update_flags: chan.flags(),
            });
        }
    }
    // Stable: edges at the same time keep their insertion order
    events.sort_by_key(|event| event.time);

    let inst_lengths = events
        .windows(2)
        .map(|pair| pair[1].time - pair[0].time)
        .chain(std::iter::once(all_off_padding))
        .collect();
    let update_flags = events.iter().map(|event| event.update_flags).collect();
    (inst_lengths, update_flags)
}

/// Time of the latest edge over all channels.
pub fn last_edge<C: BaseChannel>(channels: &[C]) -> u64 {
    channels
        .iter()
        .map(|chan| chan.last_pulse_end())
        .max()
        .unwrap_or(0)
}
