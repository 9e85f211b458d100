//! Monotonic tick counter.
//!
//! Ticks are nanoseconds since the first query in the process; the epoch is
//! established lazily so there is no init call to forget.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds elapsed since the process timer epoch.
pub fn ticks() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

pub fn to_sec(ticks: u64) -> f64 {
    ticks as f64 / 1_000_000_000.0
}

pub fn to_ms(ticks: u64) -> f64 {
    ticks as f64 / 1_000_000.0
}

pub fn to_us(ticks: u64) -> f64 {
    ticks as f64 / 1_000.0
}

/// Returns the ticks elapsed since `*last` and moves `*last` forward.
/// A zero `*last` starts the lap at the current time.
pub fn lap(last: &mut u64) -> u64 {
    let now = ticks();
    let delta = if *last == 0 { 0 } else { now - *last };
    *last = now;
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ticks_are_monotonic() {
        let a = ticks();
        std::thread::sleep(Duration::from_millis(5));
        let b = ticks();
        assert!(b > a);
        assert!(to_ms(b - a) >= 4.0);
    }

    #[test]
    fn lap_measures_deltas() {
        let mut last = 0;
        assert_eq!(lap(&mut last), 0);
        std::thread::sleep(Duration::from_millis(2));
        assert!(lap(&mut last) > 0);
    }

    #[test]
    fn conversions() {
        assert_eq!(to_sec(1_500_000_000), 1.5);
        assert_eq!(to_ms(2_000_000), 2.0);
        assert_eq!(to_us(3_000), 3.0);
    }
}
