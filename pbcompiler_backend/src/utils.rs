// Helpers shared by the channel, device and experiment modules
use regex::Regex;

use crate::error::{PbError, Result};

/// Rounds a time in ns to the nearest multiple of `clock_period_ns`.
///
/// Halfway cases round to the even multiple (`f64::round_ties_even`), the same convention as
/// Python's `round`, so with a 2 ns clock `3 ns -> 4 ns` and `5 ns -> 4 ns`.
///
/// # Errors
///
/// [`PbError::InvalidTime`] for negative or non-finite times, and for times beyond the `u64`
/// ns range.
pub fn round_to_clock(time_ns: f64, clock_period_ns: u64) -> Result<u64> {
    let invalid = || PbError::InvalidTime { value: time_ns };
    if !time_ns.is_finite() || time_ns < 0. {
        return Err(invalid());
    }
    let periods = (time_ns / clock_period_ns as f64).round_ties_even();
    if periods >= u64::MAX as f64 {
        return Err(invalid());
    }
    (periods as u64).checked_mul(clock_period_ns).ok_or_else(invalid)
}

/// Converts a clock frequency to an integer clock period in ns.
pub fn clock_period_from_frequency(clock_frequency_hz: f64) -> Result<u64> {
    if !clock_frequency_hz.is_finite() || clock_frequency_hz <= 0. {
        return Err(PbError::InvalidClock(format!(
            "clock frequency {clock_frequency_hz} Hz must be positive"
        )));
    }
    let clock_period_ns = (1e9 / clock_frequency_hz).round();
    if clock_period_ns < 1. {
        return Err(PbError::InvalidClock(format!(
            "clock frequency {clock_frequency_hz} Hz has a period below 1 ns"
        )));
    }
    Ok(clock_period_ns as u64)
}

// Channel and device names end up as plot labels and python dict keys
pub fn check_name(name: &str) -> Result<()> {
    let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
    if re.is_match(name) {
        Ok(())
    } else {
        Err(PbError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_is_half_to_even() {
        assert_eq!(round_to_clock(3., 2).unwrap(), 4);
        assert_eq!(round_to_clock(5., 2).unwrap(), 4);
        assert_eq!(round_to_clock(7., 2).unwrap(), 8);
        assert_eq!(round_to_clock(6.9, 2).unwrap(), 6);
        assert_eq!(round_to_clock(0., 2).unwrap(), 0);
        assert_eq!(round_to_clock(14., 4).unwrap(), 16);
    }

    #[test]
    fn rounding_rejects_times_beyond_u64() {
        assert_eq!(round_to_clock(1e20, 2), Err(PbError::InvalidTime { value: 1e20 }));
        // fits in periods, overflows in ns
        assert_eq!(round_to_clock(4e19, 4), Err(PbError::InvalidTime { value: 4e19 }));
        assert_eq!(round_to_clock(1e18, 2).unwrap(), 1_000_000_000_000_000_000);
    }

    #[test]
    fn rounding_rejects_bad_times() {
        assert_eq!(
            round_to_clock(-1., 2),
            Err(PbError::InvalidTime { value: -1. })
        );
        assert!(round_to_clock(f64::NAN, 2).is_err());
        assert!(round_to_clock(f64::INFINITY, 2).is_err());
    }

    #[test]
    fn clock_period() {
        assert_eq!(clock_period_from_frequency(500e6).unwrap(), 2);
        assert_eq!(clock_period_from_frequency(100e6).unwrap(), 10);
        assert!(clock_period_from_frequency(0.).is_err());
        assert!(clock_period_from_frequency(5e9).is_err());
    }

    #[test]
    fn names() {
        assert!(check_name("laser").is_ok());
        assert!(check_name("_aom_2").is_ok());
        assert!(check_name("2aom").is_err());
        assert!(check_name("sync out").is_err());
        assert!(check_name("").is_err());
    }
}
