//! Fixed-timestep frame driver.
//!
//! Accumulates wall time and runs whole simulation steps at [`FIXED_DT`], so
//! ship motion and network flushing stay independent of how fast the main
//! loop spins.

use std::time::{Duration, Instant};

use tracing::warn;

/// Simulation step: 60 Hz.
pub const FIXED_DT: Duration = Duration::from_nanos(16_666_667);

/// Longest wall-clock gap fed into the accumulator in one tick.
pub const MAX_FRAME_TIME: Duration = Duration::from_millis(250);

pub struct FrameLoop {
    previous_time: Option<Instant>,
    accumulator: Duration,
    frame_count: u64,
}

impl FrameLoop {
    pub fn new() -> Self {
        Self {
            previous_time: None,
            accumulator: Duration::ZERO,
            frame_count: 0,
        }
    }

    /// Run as many fixed steps as the time since the last call allows.
    ///
    /// Returns the number of steps taken. The first call only starts the clock.
    pub fn tick(&mut self, now: Instant, mut step: impl FnMut(Duration)) -> u32 {
        let Some(previous) = self.previous_time.replace(now) else {
            return 0;
        };
        let mut frame_time = now.saturating_duration_since(previous);
        if frame_time > MAX_FRAME_TIME {
            warn!(
                "Frame time {:.1}ms exceeds maximum, clamping to {:.1}ms",
                frame_time.as_secs_f64() * 1000.0,
                MAX_FRAME_TIME.as_secs_f64() * 1000.0
            );
            frame_time = MAX_FRAME_TIME;
        }

        self.accumulator += frame_time;
        let mut steps = 0;
        while self.accumulator >= FIXED_DT {
            step(FIXED_DT);
            self.accumulator -= FIXED_DT;
            self.frame_count += 1;
            steps += 1;
        }
        steps
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl Default for FrameLoop {
    fn default() -> Self {
        Self::new()
    }
}
