//! Timer interval coalescing.
//!
//! Periodic housekeeping timers are rounded so that many of them land on
//! shared deadlines, keeping the number of distinct wakeups low when a
//! worker carries thousands of connections.

use std::time::Duration;

/// How precisely a timer's requested interval must be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// Rounded to whole seconds.
    VeryCoarse,
    /// Aligned to a common boundary when one lies within 5% of the
    /// requested interval.
    Coarse,
    /// Fired at the requested interval, millisecond-accurate.
    Precise,
}

/// Boundaries coarse timers snap to, largest first so the widest
/// alignment wins when several qualify.
const COARSE_BOUNDARIES_MS: [u64; 6] = [500, 250, 200, 100, 50, 25];

/// Rounds `interval` according to `precision`.
pub fn round(interval: Duration, precision: Precision) -> Duration {
    match precision {
        Precision::Precise => interval,
        Precision::VeryCoarse => {
            let ms = interval.as_millis() as u64;
            let secs = (ms + 500) / 1000;
            Duration::from_secs(secs.max(1))
        }
        Precision::Coarse => {
            let ms = interval.as_millis() as u64;
            if ms == 0 {
                return interval;
            }
            let tolerance = ms / 20;
            for boundary in COARSE_BOUNDARIES_MS {
                let candidate = ((ms + boundary / 2) / boundary) * boundary;
                if candidate == 0 {
                    continue;
                }
                if candidate.abs_diff(ms) <= tolerance {
                    return Duration::from_millis(candidate);
                }
            }
            interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coarse(ms: u64) -> u64 {
        round(Duration::from_millis(ms), Precision::Coarse).as_millis() as u64
    }

    #[test]
    fn very_coarse_rounds_to_seconds() {
        let r = |ms| round(Duration::from_millis(ms), Precision::VeryCoarse).as_millis();
        assert_eq!(r(400), 1000);
        assert_eq!(r(1000), 1000);
        assert_eq!(r(1499), 1000);
        assert_eq!(r(1500), 2000);
        assert_eq!(r(4000), 4000);
    }

    #[test]
    fn coarse_aligns_within_tolerance() {
        // 5% of 980 is 49; 1000 is a multiple of 500 within that window.
        assert_eq!(coarse(980), 1000);
        assert_eq!(coarse(103), 100);
        assert_eq!(coarse(52), 50);
        assert_eq!(coarse(26), 25);
    }

    #[test]
    fn coarse_leaves_outliers_alone() {
        // Nothing within 5% of 37ms lands on a boundary multiple.
        assert_eq!(coarse(37), 37);
        assert_eq!(coarse(12), 12);
    }

    #[test]
    fn coarse_prefers_widest_boundary() {
        // 1000 is a multiple of 500 as well as of 100; the 500 grid wins.
        assert_eq!(coarse(1001), 1000);
    }

    #[test]
    fn precise_is_untouched() {
        let d = Duration::from_millis(1234);
        assert_eq!(round(d, Precision::Precise), d);
    }
}
