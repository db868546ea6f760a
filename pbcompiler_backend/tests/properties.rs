//! Property tests of the compile pipeline on random, overlap-free pulse trains.

use pbcompiler_backend::{
    build_pb_insts, calc_pulse_program_duration, create_pb_insts, extract_channels_used,
    has_short_pulses, last_edge, min_inst_length, ordered_inst_lengths_and_update_flags,
    replay_flags, short_pulse_feature, BaseChannel, CompileConfig, Flags, Opcode, PbInstruction,
    ProgramLength, PulseBlasterChannel,
};
use proptest::prelude::*;

const CLK: u64 = 2;

/// Pulses as `(gap_before, length)` pairs in clock periods, laid out back to back.
fn arb_pulse_train(max_pulses: usize) -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0_u64..12, 1_u64..12), 0..=max_pulses)
}

fn to_channel(number: u32, train: &[(u64, u64)], min_periods: u64) -> PulseBlasterChannel {
    let (mut start_times, mut pulse_lengths) = (vec![], vec![]);
    let mut t = 0;
    for &(gap, length) in train {
        t += (gap + min_periods) * CLK;
        start_times.push(t);
        pulse_lengths.push((length + min_periods) * CLK);
        t += (length + min_periods) * CLK;
    }
    PulseBlasterChannel::new(1 << number, start_times, pulse_lengths)
}

fn arb_channels() -> impl Strategy<Value = Vec<PulseBlasterChannel>> {
    prop::collection::vec(arb_pulse_train(6), 0..=4).prop_map(|trains| {
        trains
            .iter()
            .enumerate()
            .map(|(number, train)| to_channel(number as u32, train, 0))
            .collect()
    })
}

fn expected_flags(channels: &[PulseBlasterChannel], time: u64) -> Flags {
    channels
        .iter()
        .filter(|chan| {
            chan.pulses()
                .any(|(&start, &length)| start <= time && time < start + length)
        })
        .fold(0, |acc, chan| acc | chan.flags())
}

proptest! {
    #[test]
    fn instructions_reproduce_channel_states(channels in arb_channels(), padding in 0_u64..20) {
        let padding = padding * CLK;
        let (lengths, updates) = ordered_inst_lengths_and_update_flags(&channels, padding);
        let pb_insts = build_pb_insts(&lengths, &updates);

        prop_assert!(pb_insts.iter().all(|inst| inst.length > 0));
        prop_assert_eq!(calc_pulse_program_duration(&pb_insts), last_edge(&channels) + padding);

        let samps = replay_flags(&pb_insts, 1);
        for (time, &flags) in samps.iter().enumerate() {
            prop_assert_eq!(flags, expected_flags(&channels, time as u64), "at {} ns", time);
        }
        // all channels low after the last edge
        if let Some(&flags) = samps.get(last_edge(&channels) as usize) {
            prop_assert_eq!(flags, 0);
        }
    }

    #[test]
    fn short_pulse_pass_only_stretches(channels in arb_channels(), padding in 0_u64..20) {
        let (lengths, updates) = ordered_inst_lengths_and_update_flags(&channels, padding * CLK);
        let pb_insts = build_pb_insts(&lengths, &updates);
        let processed = short_pulse_feature(&pb_insts, CLK, 21);

        prop_assert!(processed.len() <= pb_insts.len());
        prop_assert!(processed.iter().all(|inst| inst.length >= min_inst_length(CLK)));
        prop_assert!(
            calc_pulse_program_duration(&processed) >= calc_pulse_program_duration(&pb_insts)
        );
        // no output channel appears or disappears
        let used = |insts: &[PbInstruction]| extract_channels_used(insts, 21);
        prop_assert_eq!(used(&processed), used(&pb_insts));
    }

    #[test]
    fn long_instructions_pass_through(train in arb_pulse_train(8), padding in 6_u64..20) {
        // every gap and pulse lasts at least 6 clock periods
        let channels = vec![to_channel(5, &train, 6)];
        let (lengths, updates) = ordered_inst_lengths_and_update_flags(&channels, padding * CLK);
        let pb_insts = build_pb_insts(&lengths, &updates);
        prop_assert!(!has_short_pulses(&pb_insts, CLK));
        prop_assert_eq!(short_pulse_feature(&pb_insts, CLK, 21), pb_insts);
    }

    #[test]
    fn continuous_program_branches_home(channels in arb_channels(), padding in 1_u64..20) {
        let config = CompileConfig {
            program_length: ProgramLength::AllOffPadding(padding * CLK),
            ..Default::default()
        };
        let compiled = create_pb_insts(&channels, &config).unwrap();
        let last = compiled.last().unwrap();
        prop_assert_eq!(last.opcode, Opcode::Branch);
        prop_assert_eq!(last.data, 0);
        prop_assert!(compiled[..compiled.len() - 1]
            .iter()
            .all(|inst| inst.opcode == Opcode::Continue));
    }
}
