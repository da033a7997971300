//! Continuous-action stochastic policies over the scalar price multiplier.
//!
//! The source composes an "agent" by multiply-inheriting a policy class and
//! an action class at runtime (spec.md §9, Design Notes). In Rust that
//! becomes two traits, [`ActionStrategy`] here and [`PolicyOptimizer`] in
//! [`optimizer`], with the bandit holding one of each by composition
//! instead of inheritance.

pub mod optimizer;

use std::f64::consts::{E, PI};

use rand::SeedableRng;

use crate::error::AppError;

const SCALE: f64 = 1e-6;
/// Mean is clamped at an upper bound equivalent to `1e-1` in scaled space:
/// `ln(1e-1 / SCALE) = ln(1e5)`.
const MEAN_UPPER_BOUND_INTERNAL: f64 = 11.512_925_464_970_229; // ln(1e5)

/// A scalar continuous-action policy producing a price multiplier.
///
/// `sample`'s returned `log_prob` is the density at *sampling time* — the
/// basis for PPO's importance-ratio correctness (spec.md §4.1 invariant).
/// `trainable_parameters` returns the `(mean, log_stddev)` pair a
/// [`PolicyOptimizer`](optimizer::PolicyOptimizer) steps in place; a
/// [`DeterministicPolicy`] returns none, and the bandit must not attach an
/// optimizer to it.
pub trait ActionStrategy: Send {
    fn sample(&mut self) -> (f64, f64);
    fn scaled(&self, action_internal: f64) -> Result<f64, AppError>;
    fn current_mean(&self) -> f64;
    fn current_stddev(&self) -> f64;
    fn trainable_parameters(&mut self) -> Vec<&mut f64>;
    /// log-density of `action_internal` under the *current* parameters
    /// (used to recompute `logp_new` during a PPO update).
    fn log_prob(&self, action_internal: f64) -> f64;
    fn entropy(&self) -> f64;
    fn mean_internal(&self) -> f64;
    fn log_stddev_internal(&self) -> f64;
    fn initial_mean_internal(&self) -> f64;
    fn initial_log_stddev_internal(&self) -> f64;
    /// Overwrites the current parameters from a previously saved, already
    /// scaled `(mean, stddev)` pair (adopted save state, spec.md §4.4).
    fn restore(&mut self, mean_scaled: f64, stddev_scaled: f64);
    fn has_trainable_parameters(&self) -> bool {
        !self.trainable_parameters_is_empty_hint()
    }
    #[doc(hidden)]
    fn trainable_parameters_is_empty_hint(&self) -> bool;
}

fn scale_action(action_internal: f64) -> Result<f64, AppError> {
    let value = action_internal.exp() * SCALE;
    if !value.is_finite() {
        return Err(AppError::NumericOverflow { action: action_internal });
    }
    Ok(value)
}

fn gaussian_log_prob(x: f64, mean: f64, stddev: f64) -> f64 {
    let z = (x - mean) / stddev;
    -0.5 * z * z - stddev.ln() - 0.5 * (2.0 * PI).ln()
}

fn gaussian_entropy(stddev: f64) -> f64 {
    stddev.ln() + 0.5 * (2.0 * PI * E).ln()
}

/// `exp(N(mean, exp(log_stddev))) * 1e-6`, parameters kept in log-space.
pub struct ScaledGaussianPolicy {
    mean: f64,
    log_stddev: f64,
    initial_mean: f64,
    initial_log_stddev: f64,
    rng: rand_chacha::ChaCha20Rng,
}

impl ScaledGaussianPolicy {
    pub fn initialize(initial_mean_scaled: f64, initial_stddev_scaled: f64) -> Self {
        let mean = (initial_mean_scaled / SCALE).ln();
        let log_stddev = (initial_stddev_scaled / SCALE).ln();
        Self {
            mean,
            log_stddev,
            initial_mean: mean,
            initial_log_stddev: log_stddev,
            rng: rand_chacha::ChaCha20Rng::from_entropy(),
        }
    }

    fn clamped_mean(&self) -> f64 {
        self.mean.min(MEAN_UPPER_BOUND_INTERNAL)
    }
}

impl ActionStrategy for ScaledGaussianPolicy {
    fn sample(&mut self) -> (f64, f64) {
        use rand::Rng;
        let stddev = self.log_stddev.exp();
        let z: f64 = self.rng.sample(rand_distr::StandardNormal);
        let action = self.mean + stddev * z;
        let log_prob = gaussian_log_prob(action, self.mean, stddev);
        (action, log_prob)
    }

    fn scaled(&self, action_internal: f64) -> Result<f64, AppError> {
        scale_action(action_internal)
    }

    fn current_mean(&self) -> f64 {
        scale_action(self.clamped_mean()).unwrap_or(f64::MAX)
    }

    fn current_stddev(&self) -> f64 {
        self.log_stddev.exp()
    }

    fn trainable_parameters(&mut self) -> Vec<&mut f64> {
        vec![&mut self.mean, &mut self.log_stddev]
    }

    fn log_prob(&self, action_internal: f64) -> f64 {
        gaussian_log_prob(action_internal, self.mean, self.log_stddev.exp())
    }

    fn entropy(&self) -> f64 {
        gaussian_entropy(self.log_stddev.exp())
    }

    fn mean_internal(&self) -> f64 {
        self.mean
    }

    fn log_stddev_internal(&self) -> f64 {
        self.log_stddev
    }

    fn initial_mean_internal(&self) -> f64 {
        self.initial_mean
    }

    fn initial_log_stddev_internal(&self) -> f64 {
        self.initial_log_stddev
    }

    fn restore(&mut self, mean_scaled: f64, stddev_scaled: f64) {
        self.mean = (mean_scaled / SCALE).ln();
        self.log_stddev = (stddev_scaled / SCALE).ln();
    }

    fn trainable_parameters_is_empty_hint(&self) -> bool {
        false
    }
}

/// Always emits the (clamped) mean with zero variance. Has no trainable
/// parameters; a bandit wrapping this must treat `updatePolicy` as always
/// "no update" and must not construct an optimizer for it.
pub struct DeterministicPolicy {
    mean: f64,
}

impl DeterministicPolicy {
    pub fn initialize(initial_mean_scaled: f64) -> Self {
        Self {
            mean: (initial_mean_scaled / SCALE).ln(),
        }
    }
}

impl ActionStrategy for DeterministicPolicy {
    fn sample(&mut self) -> (f64, f64) {
        (self.mean, 0.0)
    }

    fn scaled(&self, action_internal: f64) -> Result<f64, AppError> {
        scale_action(action_internal)
    }

    fn current_mean(&self) -> f64 {
        scale_action(self.mean.min(MEAN_UPPER_BOUND_INTERNAL)).unwrap_or(f64::MAX)
    }

    fn current_stddev(&self) -> f64 {
        0.0
    }

    fn trainable_parameters(&mut self) -> Vec<&mut f64> {
        Vec::new()
    }

    fn log_prob(&self, _action_internal: f64) -> f64 {
        0.0
    }

    fn entropy(&self) -> f64 {
        0.0
    }

    fn mean_internal(&self) -> f64 {
        self.mean
    }

    fn log_stddev_internal(&self) -> f64 {
        f64::NEG_INFINITY
    }

    fn initial_mean_internal(&self) -> f64 {
        self.mean
    }

    fn initial_log_stddev_internal(&self) -> f64 {
        f64::NEG_INFINITY
    }

    fn restore(&mut self, mean_scaled: f64, _stddev_scaled: f64) {
        self.mean = (mean_scaled / SCALE).ln();
    }

    fn trainable_parameters_is_empty_hint(&self) -> bool {
        true
    }
}

/// Picks a concrete [`ActionStrategy`] by configuration key, mirroring the
/// source's class-lookup-by-string-name composition (spec.md §9).
pub struct ActionStrategyFactory;

impl ActionStrategyFactory {
    pub fn create(
        key: &str,
        initial_mean_scaled: f64,
        initial_stddev_scaled: f64,
    ) -> Result<Box<dyn ActionStrategy>, AppError> {
        match key {
            "scaled_gaussian" | "gaussian" => Ok(Box::new(ScaledGaussianPolicy::initialize(
                initial_mean_scaled,
                initial_stddev_scaled,
            ))),
            "deterministic" => Ok(Box::new(DeterministicPolicy::initialize(initial_mean_scaled))),
            other => Err(AppError::UnknownFactoryKey {
                kind: "policy",
                key: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_round_trips_scaled_mean_and_stddev() {
        let policy = ScaledGaussianPolicy::initialize(5e-8, 1e-1);
        assert!((policy.current_mean() - 5e-8).abs() < 1e-12);
        assert!((policy.current_stddev() - 1e-1).abs() < 1e-9);
    }

    #[test]
    fn scaled_overflows_to_error_not_nan() {
        let policy = ScaledGaussianPolicy::initialize(5e-8, 1e-1);
        let err = policy.scaled(10_000.0).unwrap_err();
        assert!(matches!(err, AppError::NumericOverflow { .. }));
    }

    #[test]
    fn mean_is_clamped_in_external_view() {
        let mut policy = ScaledGaussianPolicy::initialize(5e-8, 1e-1);
        *policy.trainable_parameters()[0] = 1000.0; // far past the clamp
        assert!((policy.current_mean() - 1e-1).abs() < 1e-6);
    }

    #[test]
    fn deterministic_policy_has_no_trainable_parameters() {
        let mut policy = DeterministicPolicy::initialize(5e-8);
        assert!(policy.trainable_parameters().is_empty());
        assert_eq!(policy.sample().1, 0.0);
    }
}
