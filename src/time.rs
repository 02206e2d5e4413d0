//! Simulation timing.
//!
//! Turns wall-clock frame deltas into bounded solver steps. The frame delta is
//! exponentially smoothed so a single hitch does not produce one huge step,
//! and each step is capped at `time_step_max`.
//!
//! # Example
//!
//! ```ignore
//! use liquid_bridge::time::SimulationClock;
//!
//! let mut clock = SimulationClock::new(&config);
//!
//! // Once per host frame:
//! let plan = clock.plan(frame_delta);
//! for _ in 0..plan.iterations {
//!     // ... enqueue one solver step of size plan.step ...
//!     clock.record_step(plan.step);
//! }
//! ```

use crate::config::FluidConfig;

/// Weight kept from the previous smoothed delta on every sample.
pub const DELTA_SMOOTHING: f32 = 0.98;

/// Steps to run for one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepPlan {
    /// Number of steps, 0 when nothing should run.
    pub iterations: u32,
    /// Size of each step in simulation time units.
    pub step: f32,
}

impl StepPlan {
    /// A plan that runs nothing.
    pub const NONE: Self = Self {
        iterations: 0,
        step: 0.0,
    };

    /// Whether the plan performs no work.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.iterations == 0 || self.step <= 0.0
    }
}

/// Accumulates wall time into bounded simulation steps.
#[derive(Debug, Clone)]
pub struct SimulationClock {
    /// Simulation time units per wall-clock second.
    sim_time_per_sec: f32,
    /// Upper bound on one step.
    time_step_max: f32,
    /// Steps per frame.
    iterations_per_frame: u32,
    /// Smoothed frame delta, seeded by the first positive sample.
    smoothed_delta: Option<f32>,
    /// Simulation time advanced so far.
    elapsed: f64,
    /// Steps recorded so far.
    steps: u64,
    /// Frames planned with a positive delta.
    frames: u64,
    /// Whether planning yields zero iterations.
    paused: bool,
}

impl SimulationClock {
    /// Create a clock using the timing fields of `config`.
    pub fn new(config: &FluidConfig) -> Self {
        Self {
            sim_time_per_sec: config.sim_time_per_sec,
            time_step_max: config.time_step_max,
            iterations_per_frame: config.iterations_per_frame,
            smoothed_delta: None,
            elapsed: 0.0,
            steps: 0,
            frames: 0,
            paused: !config.run_simulation,
        }
    }

    /// Pick up timing changes from `config` without resetting counters.
    pub fn configure(&mut self, config: &FluidConfig) {
        self.sim_time_per_sec = config.sim_time_per_sec;
        self.time_step_max = config.time_step_max;
        self.iterations_per_frame = config.iterations_per_frame;
    }

    /// Fold `delta` into the smoothed delta and plan this frame's steps.
    ///
    /// Non-positive or non-finite deltas are ignored entirely and plan nothing.
    /// While paused the delta is still smoothed but no iterations are planned.
    pub fn plan(&mut self, delta: f32) -> StepPlan {
        if !(delta.is_finite() && delta > 0.0) {
            return StepPlan::NONE;
        }

        let smoothed = match self.smoothed_delta {
            Some(previous) => previous * DELTA_SMOOTHING + delta * (1.0 - DELTA_SMOOTHING),
            None => delta,
        };
        self.smoothed_delta = Some(smoothed);
        self.frames += 1;

        if self.paused || self.iterations_per_frame == 0 {
            return StepPlan::NONE;
        }

        let step = (self.sim_time_per_sec * smoothed / self.iterations_per_frame as f32).min(self.time_step_max);
        StepPlan {
            iterations: self.iterations_per_frame,
            step,
        }
    }

    /// Record one completed step of size `step`.
    pub fn record_step(&mut self, step: f32) {
        self.elapsed += step as f64;
        self.steps += 1;
    }

    /// Simulation time advanced so far.
    #[inline]
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Steps recorded so far.
    #[inline]
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Frames planned with a positive delta.
    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Current smoothed delta, if any sample has been seen.
    #[inline]
    pub fn smoothed_delta(&self) -> Option<f32> {
        self.smoothed_delta
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Stop planning steps.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume planning steps.
    pub fn resume(&mut self) {
        self.paused = false;
    }
}

impl Default for SimulationClock {
    fn default() -> Self {
        Self::new(&FluidConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_clock_new() {
        let clock = SimulationClock::default();
        assert_eq!(clock.steps(), 0);
        assert_eq!(clock.elapsed(), 0.0);
        assert!(!clock.is_paused());
        assert_eq!(clock.smoothed_delta(), None);
    }

    #[test]
    fn test_first_sample_seeds_smoothing() {
        let mut clock = SimulationClock::default();
        let plan = clock.plan(0.016);
        assert_eq!(plan.iterations, 1);
        assert!((plan.step - 0.64).abs() < 1e-5);
    }

    #[test]
    fn test_smoothing_factor() {
        let mut clock = SimulationClock::default();
        clock.plan(0.01);
        clock.plan(0.02);
        let expected = 0.01 * 0.98 + 0.02 * 0.02;
        assert!((clock.smoothed_delta().unwrap() - expected).abs() < 1e-7);
    }

    #[test]
    fn test_step_capped() {
        let mut clock = SimulationClock::default();
        let plan = clock.plan(1.0);
        assert_eq!(plan.step, 1.0);
    }

    #[test]
    fn test_step_split_across_iterations() {
        let config = FluidConfig {
            iterations_per_frame: 4,
            ..Default::default()
        };
        let mut clock = SimulationClock::new(&config);
        let plan = clock.plan(0.016);
        assert_eq!(plan.iterations, 4);
        assert!((plan.step - 0.16).abs() < 1e-5);
    }

    #[test]
    fn test_non_positive_delta_ignored() {
        let mut clock = SimulationClock::default();
        assert!(clock.plan(0.0).is_empty());
        assert!(clock.plan(-0.5).is_empty());
        assert!(clock.plan(f32::NAN).is_empty());
        assert!(clock.plan(f32::INFINITY).is_empty());
        assert_eq!(clock.smoothed_delta(), None);
        assert_eq!(clock.frames(), 0);
    }

    #[test]
    fn test_paused_still_smooths() {
        let mut clock = SimulationClock::default();
        clock.pause();
        assert!(clock.plan(0.016).is_empty());
        assert_eq!(clock.smoothed_delta(), Some(0.016));
        clock.resume();
        assert!(!clock.plan(0.016).is_empty());
    }

    #[test]
    fn test_random_deltas_bounded() {
        let config = FluidConfig {
            iterations_per_frame: 3,
            time_step_max: 0.5,
            ..Default::default()
        };
        let mut clock = SimulationClock::new(&config);
        let mut rng = rand::thread_rng();
        for _ in 0..1_000 {
            let before = clock.elapsed();
            let plan = clock.plan(rng.gen_range(-0.05..0.2));
            assert!(plan.step <= 0.5);
            for _ in 0..plan.iterations {
                clock.record_step(plan.step);
            }
            assert!(clock.elapsed() >= before);
        }
    }
}
