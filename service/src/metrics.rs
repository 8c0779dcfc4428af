//! Lightweight metrics helpers.

use std::time::Duration;

/// Whole windows between a pipeline watermark and the current height.
pub fn windows_behind(current_height: u64, watermark: u64, interval: u64) -> u64 {
    if interval == 0 {
        return 0;
    }
    current_height.saturating_sub(watermark) / interval
}

pub fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_behind_counts_whole_windows() {
        assert_eq!(windows_behind(1000, 800, 50), 4);
        assert_eq!(windows_behind(1000, 990, 50), 0);
        assert_eq!(windows_behind(800, 1000, 50), 0);
        assert_eq!(windows_behind(1000, 0, 0), 0);
    }

    #[test]
    fn rate_per_sec_handles_zero_duration() {
        assert_eq!(rate_per_sec(10, Duration::from_secs(0)), None);
        let rate = rate_per_sec(10, Duration::from_secs(2)).expect("rate");
        assert!((rate - 5.0).abs() < 1e-6);
    }
}
