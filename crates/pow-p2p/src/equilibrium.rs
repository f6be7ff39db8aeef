//! Coupled rate-control scalars that derive loop cadences.
//!
//! Each component owns one [`EquilibriumState`] holding two scalars:
//!
//! - `lambda`: paces bootstrap discovery and broadcast flushes
//! - `eta`: paces peer exchange and the gossip listen window
//!
//! Both start at `1/√2`. Every loop tick relaxes its scalar toward that
//! baseline and may excite it by a bounded amount proportional to the load
//! observed during the tick. A higher state means a shorter cadence. The
//! values are diagnostic and are never used for admission or consensus.

use serde::Serialize;
use std::f64::consts::FRAC_1_SQRT_2;
use std::time::Duration;

/// Resting value of both scalars.
pub const BASELINE: f64 = FRAC_1_SQRT_2;
/// Weight kept from the previous state on each relaxation step.
pub const DECAY: f64 = 0.99;
/// Maximum excitation applied by one fully loaded tick.
pub const EXCITATION_GAIN: f64 = 0.0005;
/// Lowest value a scalar may take.
pub const MIN_STATE: f64 = 0.5;
/// Highest value a scalar may take.
pub const MAX_STATE: f64 = 1.0;
/// Cleanup loops run this many baseline cadences apart.
pub const CLEANUP_CADENCE_FACTOR: u32 = 5;

/// The two rate-control scalars of one component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EquilibriumState {
    lambda: f64,
    eta: f64,
}

impl Default for EquilibriumState {
    fn default() -> Self {
        Self::new()
    }
}

impl EquilibriumState {
    /// Creates a state at baseline.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lambda: BASELINE,
            eta: BASELINE,
        }
    }

    /// Returns the lambda scalar.
    #[must_use]
    pub const fn lambda(&self) -> f64 {
        self.lambda
    }

    /// Returns the eta scalar.
    #[must_use]
    pub const fn eta(&self) -> f64 {
        self.eta
    }

    /// Returns `lambda / eta`.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        self.lambda / self.eta
    }

    /// Advances lambda by one tick with the given load in `[0, 1]`.
    pub fn tick_lambda(&mut self, load: f64) {
        self.lambda = step(self.lambda, load);
    }

    /// Advances eta by one tick with the given load in `[0, 1]`.
    pub fn tick_eta(&mut self, load: f64) {
        self.eta = step(self.eta, load);
    }

    /// Resets both scalars to baseline.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Returns the lambda-derived cadence for `scale`.
    #[must_use]
    pub fn lambda_cadence(&self, scale: Duration) -> Duration {
        cadence(scale, self.lambda)
    }

    /// Returns the eta-derived cadence for `scale`.
    #[must_use]
    pub fn eta_cadence(&self, scale: Duration) -> Duration {
        cadence(scale, self.eta)
    }
}

/// Returns the cadence a loop runs at when its scalar sits at baseline.
#[must_use]
pub fn baseline_cadence(scale: Duration) -> Duration {
    cadence(scale, BASELINE)
}

/// Returns the cadence of the cleanup loops for `scale`.
#[must_use]
pub fn cleanup_cadence(scale: Duration) -> Duration {
    baseline_cadence(scale) * CLEANUP_CADENCE_FACTOR
}

fn cadence(scale: Duration, state: f64) -> Duration {
    scale.div_f64(state.clamp(MIN_STATE, MAX_STATE))
}

fn step(state: f64, load: f64) -> f64 {
    let load = if load.is_finite() { load.clamp(0.0, 1.0) } else { 0.0 };
    let relaxed = DECAY.mul_add(state, (1.0 - DECAY) * BASELINE);
    (relaxed + EXCITATION_GAIN * load).clamp(MIN_STATE, MAX_STATE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_baseline() {
        let state = EquilibriumState::new();
        assert!((state.lambda() - 0.707_11).abs() < 1e-5);
        assert!((state.eta() - 0.707_11).abs() < 1e-5);
        assert!((state.ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn idle_ticks_stay_at_baseline() {
        let mut state = EquilibriumState::new();
        for _ in 0..10_000 {
            state.tick_lambda(0.0);
            state.tick_eta(0.0);
        }
        assert!((state.lambda() - BASELINE).abs() < 1e-9);
        assert!((state.eta() - BASELINE).abs() < 1e-9);
    }

    #[test]
    fn relaxes_back_after_excitation() {
        let mut state = EquilibriumState::new();
        for _ in 0..200 {
            state.tick_lambda(1.0);
        }
        let excited = state.lambda();
        assert!(excited > BASELINE);

        for _ in 0..2_000 {
            state.tick_lambda(0.0);
        }
        assert!((state.lambda() - BASELINE).abs() < 1e-6);
    }

    #[test]
    fn sustained_full_load_stays_bounded() {
        let mut state = EquilibriumState::new();
        for _ in 0..100_000 {
            state.tick_eta(1.0);
        }
        // Fixed point is BASELINE + gain / (1 - decay)
        let fixed_point = BASELINE + EXCITATION_GAIN / (1.0 - DECAY);
        assert!((state.eta() - fixed_point).abs() < 1e-6);
        assert!(state.eta() <= MAX_STATE);
    }

    #[test]
    fn pathological_load_is_clamped() {
        let mut state = EquilibriumState::new();
        state.tick_lambda(f64::NAN);
        state.tick_lambda(f64::INFINITY);
        state.tick_lambda(-5.0);
        state.tick_lambda(1e9);
        assert!(state.lambda() >= MIN_STATE && state.lambda() <= MAX_STATE);
    }

    #[test]
    fn baseline_cadence_is_ten_root_two_seconds() {
        let cadence = baseline_cadence(Duration::from_secs(10));
        assert_eq!(cadence.as_millis(), 14_142);
    }

    #[test]
    fn cleanup_cadence_is_five_baseline_cadences() {
        let cadence = cleanup_cadence(Duration::from_secs(10));
        assert_eq!(cadence.as_millis(), 70_710);
    }

    #[test]
    fn excited_state_shortens_cadence() {
        let mut state = EquilibriumState::new();
        let before = state.lambda_cadence(Duration::from_secs(10));
        for _ in 0..100 {
            state.tick_lambda(1.0);
        }
        assert!(state.lambda_cadence(Duration::from_secs(10)) < before);
        assert_eq!(
            state.eta_cadence(Duration::from_secs(10)),
            baseline_cadence(Duration::from_secs(10))
        );
    }

    #[test]
    fn reset_restores_baseline() {
        let mut state = EquilibriumState::new();
        for _ in 0..50 {
            state.tick_lambda(1.0);
        }
        state.reset();
        assert_eq!(state, EquilibriumState::new());
    }
}
