//! Jittered tick periods.

use std::time::Duration;

use rand::Rng;

/// Stretch `base` by a random fraction of itself, up to `max_factor`.
///
/// The result is never shorter than `base`. A factor of zero (or anything
/// non-finite or negative) yields exactly `base`.
pub fn jittered(base: Duration, max_factor: f64) -> Duration {
    if !max_factor.is_finite() || max_factor <= 0.0 {
        return base;
    }
    let stretch = rand::thread_rng().gen_range(0.0..max_factor);
    let extra = Duration::try_from_secs_f64(base.as_secs_f64() * stretch).unwrap_or(Duration::MAX);
    base.saturating_add(extra)
}
