//! Pulse timing and display helpers for fluidics_core.
use std::time::Duration;

/// Number of milliseconds in one second.
pub const MILLIS_PER_SEC: u64 = 1_000;
/// Pump "on" phase of every pulse (ms).
pub const DEFAULT_ON_MS: u64 = 50;
/// Shortest allowed pump "off" phase (ms).
pub const DEFAULT_MIN_OFF_MS: u64 = 150;

/// Convert a period in seconds to whole milliseconds, truncating any
/// fraction of a millisecond.
/// - Negative, NaN and sub-millisecond values clamp to 0.
#[inline]
pub fn period_ms(period_s: f64) -> u64 {
    let ms = (period_s * MILLIS_PER_SEC as f64).floor();
    if ms.is_finite() && ms > 0.0 {
        ms.min(u64::MAX as f64) as u64
    } else {
        0
    }
}

/// Off phase for a pulse train with total `period_s`:
/// `max(max(period_ms, on_ms) - on_ms, min_off_ms)`.
#[inline]
pub fn off_duration_ms(period_s: f64, on_ms: u64, min_off_ms: u64) -> u64 {
    (period_ms(period_s).max(on_ms) - on_ms).max(min_off_ms)
}

/// `HH:MM:SS`; hours keep counting past 99.
pub fn format_hms(d: Duration) -> String {
    let s = d.as_secs();
    format!("{:02}:{:02}:{:02}", s / 3600, (s / 60) % 60, s % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.5, 450)]
    #[case(0.24, 190)]
    #[case(1.0, 950)]
    #[case(0.2, 150)]
    #[case(0.099, 150)]
    #[case(0.0, 150)]
    #[case(-1.0, 150)]
    #[case(f64::NAN, 150)]
    fn off_phase_respects_floor(#[case] period_s: f64, #[case] off: u64) {
        assert_eq!(off_duration_ms(period_s, DEFAULT_ON_MS, DEFAULT_MIN_OFF_MS), off);
    }

    #[test]
    fn period_truncates_to_millis() {
        assert_eq!(period_ms(0.2404), 240);
        assert_eq!(period_ms(0.2409), 240);
        assert_eq!(period_ms(0.9999), 999);
        assert_eq!(period_ms(1e-4), 0);
    }

    #[test]
    fn hms_formatting() {
        assert_eq!(format_hms(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_hms(Duration::from_secs(3 * 3600 + 25 * 60 + 7)), "03:25:07");
        assert_eq!(format_hms(Duration::from_secs(16 * 3600)), "16:00:00");
    }
}
