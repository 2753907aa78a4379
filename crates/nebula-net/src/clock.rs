//! Host-time synchronization.
//!
//! The host's session clock is authoritative: milliseconds since it started
//! hosting. A client seeds its estimate from the `join_accept` timestamp plus
//! half the RTT, then every host heartbeat sets a new *desired* time. The
//! client's *current* time chases the desired time by running slightly fast
//! or slow (dilation bounded to ±5%) instead of jumping, unless the error is
//! so large that a hard reset is the only sensible option.

use std::time::{Duration, Instant};

/// Largest deviation of the clock rate from real time.
pub const MAX_DILATION: f64 = 0.05;

/// Errors beyond this snap the clock instead of dilating.
pub const SNAP_THRESHOLD: Duration = Duration::from_secs(1);

/// Errors below this are left alone.
const TOLERANCE_MS: f64 = 1.0;

/// Error at which dilation saturates.
const FULL_DILATION_ERROR_MS: f64 = 100.0;

/// How the client clock reacts to its current error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockAdjustment {
    /// Within tolerance.
    None,
    /// Ahead of the host; run slow.
    SlowDown,
    /// Behind the host; run fast.
    SpeedUp,
    /// Too far off; snap to the desired time.
    HardReset,
}

/// Decide how to adjust given `error_ms = current - desired`.
///
/// - `|error| < 1ms`: no adjustment
/// - `1ms <= |error| <= 1s`: dilate
/// - `|error| > 1s`: hard reset
pub fn compute_adjustment(error_ms: f64) -> ClockAdjustment {
    if error_ms.abs() > SNAP_THRESHOLD.as_secs_f64() * 1000.0 {
        ClockAdjustment::HardReset
    } else if error_ms >= TOLERANCE_MS {
        ClockAdjustment::SlowDown
    } else if error_ms <= -TOLERANCE_MS {
        ClockAdjustment::SpeedUp
    } else {
        ClockAdjustment::None
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    /// No reference yet.
    Unsynced,
    /// Hosting: elapsed time since `origin`.
    Authoritative { origin: Instant },
    /// Following a host.
    Following {
        current_ms: f64,
        updated_at: Instant,
        desired_ms: f64,
        desired_at: Instant,
    },
}

/// The session's view of host time.
#[derive(Debug, Clone)]
pub struct HostClock {
    mode: Mode,
    dilation: f64,
}

impl HostClock {
    /// A clock with no reference; reads zero until hosting or seeded.
    pub fn new() -> Self {
        Self {
            mode: Mode::Unsynced,
            dilation: 1.0,
        }
    }

    /// Become the authoritative clock, starting at zero.
    pub fn start_authoritative(&mut self, now: Instant) {
        self.mode = Mode::Authoritative { origin: now };
        self.dilation = 1.0;
    }

    /// Seed from a host timestamp received with `rtt` round trip.
    pub fn seed(&mut self, host_time_ms: u32, rtt: Duration, now: Instant) {
        let estimate = f64::from(host_time_ms) + millis(rtt) / 2.0;
        self.mode = Mode::Following {
            current_ms: estimate,
            updated_at: now,
            desired_ms: estimate,
            desired_at: now,
        };
        self.dilation = 1.0;
        tracing::debug!("Host clock seeded at {:.0}ms (rtt {:?})", estimate, rtt);
    }

    /// Record a host heartbeat timestamp as the new desired time.
    ///
    /// Ignored unless following a host.
    pub fn on_host_time(&mut self, host_time_ms: u32, rtt: Duration, now: Instant) {
        if let Mode::Following {
            desired_ms,
            desired_at,
            ..
        } = &mut self.mode
        {
            *desired_ms = f64::from(host_time_ms) + millis(rtt) / 2.0;
            *desired_at = now;
        }
    }

    /// Advance the current time and retune the dilation.
    pub fn update(&mut self, now: Instant) -> ClockAdjustment {
        let Mode::Following {
            current_ms,
            updated_at,
            desired_ms,
            desired_at,
        } = &mut self.mode
        else {
            return ClockAdjustment::None;
        };

        *current_ms += millis(now.saturating_duration_since(*updated_at)) * self.dilation;
        *updated_at = now;
        let desired_now = *desired_ms + millis(now.saturating_duration_since(*desired_at));
        let error = *current_ms - desired_now;

        let adjustment = compute_adjustment(error);
        match adjustment {
            ClockAdjustment::HardReset => {
                tracing::info!("Host clock off by {:.0}ms, snapping", error);
                *current_ms = desired_now;
                self.dilation = 1.0;
            }
            ClockAdjustment::None => self.dilation = 1.0,
            ClockAdjustment::SlowDown | ClockAdjustment::SpeedUp => {
                let scale = (error / FULL_DILATION_ERROR_MS).clamp(-1.0, 1.0);
                self.dilation = 1.0 - scale * MAX_DILATION;
            }
        }
        adjustment
    }

    /// Current host time in milliseconds.
    pub fn now_ms(&self, now: Instant) -> u32 {
        let ms = match self.mode {
            Mode::Unsynced => 0.0,
            Mode::Authoritative { origin } => millis(now.saturating_duration_since(origin)),
            Mode::Following {
                current_ms,
                updated_at,
                ..
            } => current_ms + millis(now.saturating_duration_since(updated_at)) * self.dilation,
        };
        ms.max(0.0) as u32
    }

    /// Current rate multiplier, within `1 ± MAX_DILATION`.
    pub fn dilation(&self) -> f64 {
        self.dilation
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self.mode, Mode::Authoritative { .. })
    }

    /// Whether the clock has any reference at all.
    pub fn is_synced(&self) -> bool {
        !matches!(self.mode, Mode::Unsynced)
    }

    /// Forget the reference.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_adjustment_thresholds() {
        assert_eq!(compute_adjustment(0.5), ClockAdjustment::None);
        assert_eq!(compute_adjustment(20.0), ClockAdjustment::SlowDown);
        assert_eq!(compute_adjustment(-20.0), ClockAdjustment::SpeedUp);
        assert_eq!(compute_adjustment(1500.0), ClockAdjustment::HardReset);
        assert_eq!(compute_adjustment(-1500.0), ClockAdjustment::HardReset);
    }

    #[test]
    fn test_unsynced_reads_zero() {
        let clock = HostClock::new();
        assert_eq!(clock.now_ms(Instant::now()), 0);
        assert!(!clock.is_synced());
    }

    #[test]
    fn test_authoritative_counts_elapsed() {
        let t0 = Instant::now();
        let mut clock = HostClock::new();
        clock.start_authoritative(t0);
        assert_eq!(clock.now_ms(t0 + ms(1500)), 1500);
        assert!(clock.is_authoritative());
    }

    #[test]
    fn test_seed_adds_half_rtt() {
        let t0 = Instant::now();
        let mut clock = HostClock::new();
        clock.seed(10_000, ms(100), t0);
        assert_eq!(clock.now_ms(t0), 10_050);
        assert_eq!(clock.now_ms(t0 + ms(200)), 10_250);
    }

    #[test]
    fn test_behind_speeds_up_within_bound() {
        let t0 = Instant::now();
        let mut clock = HostClock::new();
        clock.seed(1_000, Duration::ZERO, t0);
        clock.on_host_time(1_300, Duration::ZERO, t0);

        assert_eq!(clock.update(t0), ClockAdjustment::SpeedUp);
        assert!((clock.dilation() - (1.0 + MAX_DILATION)).abs() < 1e-9);
    }

    #[test]
    fn test_ahead_slows_down_proportionally() {
        let t0 = Instant::now();
        let mut clock = HostClock::new();
        clock.seed(1_000, Duration::ZERO, t0);
        clock.on_host_time(950, Duration::ZERO, t0);

        assert_eq!(clock.update(t0), ClockAdjustment::SlowDown);
        assert!(clock.dilation() < 1.0);
        assert!(clock.dilation() >= 1.0 - MAX_DILATION);
    }

    #[test]
    fn test_dilation_converges() {
        let t0 = Instant::now();
        let mut clock = HostClock::new();
        clock.seed(1_000, Duration::ZERO, t0);
        clock.on_host_time(1_040, Duration::ZERO, t0);

        let mut now = t0;
        for _ in 0..600 {
            now += ms(16);
            clock.update(now);
        }
        let expected = 1_040 + 600 * 16;
        let error = i64::from(clock.now_ms(now)) - expected;
        assert!(error.abs() <= 2, "clock still off by {error}ms");
    }

    #[test]
    fn test_large_error_snaps() {
        let t0 = Instant::now();
        let mut clock = HostClock::new();
        clock.seed(1_000, Duration::ZERO, t0);
        clock.on_host_time(5_000, Duration::ZERO, t0);

        assert_eq!(clock.update(t0), ClockAdjustment::HardReset);
        assert_eq!(clock.now_ms(t0), 5_000);
        assert_eq!(clock.dilation(), 1.0);
    }

    #[test]
    fn test_heartbeat_ignored_when_hosting() {
        let t0 = Instant::now();
        let mut clock = HostClock::new();
        clock.start_authoritative(t0);
        clock.on_host_time(99_999, Duration::ZERO, t0);
        assert_eq!(clock.update(t0 + ms(10)), ClockAdjustment::None);
        assert_eq!(clock.now_ms(t0 + ms(10)), 10);
    }
}
