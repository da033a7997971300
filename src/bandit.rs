//! PPO-family bandits driving a single [`ActionStrategy`] (spec.md §4.2).
//!
//! An episode is one `get_action` / `add_reward` pair. Experience
//! accumulates in a FIFO buffer; `update_policy` is a no-op (`Ok(None)`)
//! until the buffer is full, then replays the whole buffer for
//! `ppo_iterations` epochs, standardizing advantages once per call and
//! recomputing the importance ratio against the *current* parameters on
//! every epoch (they move epoch to epoch, so the ratio isn't fixed at 1).

use std::collections::VecDeque;

use crate::error::AppError;
use crate::policy::optimizer::PolicyOptimizer;
use crate::policy::ActionStrategy;

const ENTROPY_COEFF: f64 = 1e-1;
const PULL_COEFF: f64 = 1e-1;

pub trait Bandit: Send {
    /// Samples an action from the policy, scales it, and remembers the
    /// internal action/log-prob pair for the matching `add_reward`.
    fn get_action(&mut self) -> Result<f64, AppError>;
    fn add_reward(&mut self, reward: f64) -> Result<(), AppError>;
    /// `None` means "no update" — the buffer isn't full yet (spec.md §4.2).
    /// `Some(loss)` is the final scalar loss after the last PPO iteration.
    fn update_policy(&mut self) -> Result<Option<f64>, AppError>;
    fn current_mean(&self) -> f64;
    fn current_stddev(&self) -> f64;
    fn restore(&mut self, mean_scaled: f64, stddev_scaled: f64);
    #[doc(hidden)]
    fn buffer_len_hint(&self) -> usize {
        0
    }
}

struct ExperienceBuffer {
    actions: VecDeque<f64>,
    log_probs: VecDeque<f64>,
    rewards: VecDeque<f64>,
    max_size: usize,
}

impl ExperienceBuffer {
    fn new(max_size: usize) -> Self {
        Self {
            actions: VecDeque::new(),
            log_probs: VecDeque::new(),
            rewards: VecDeque::new(),
            max_size,
        }
    }

    fn push(&mut self, action: f64, log_prob: f64, reward: f64) {
        self.actions.push_back(action);
        self.log_probs.push_back(log_prob);
        self.rewards.push_back(reward);
        while self.actions.len() > self.max_size {
            self.actions.pop_front();
            self.log_probs.pop_front();
            self.rewards.pop_front();
        }
    }

    fn check_consistent(&self) -> Result<(), AppError> {
        if self.actions.len() != self.rewards.len() || self.actions.len() != self.log_probs.len() {
            return Err(AppError::BufferInconsistent {
                actions: self.actions.len(),
                rewards: self.rewards.len(),
                log_probs: self.log_probs.len(),
            });
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.actions.clear();
        self.log_probs.clear();
        self.rewards.clear();
    }

    fn len(&self) -> usize {
        self.actions.len()
    }
}

/// Generalizes the PPO-clip, rolling-PPO and vanilla-policy-gradient
/// variants: the differences are purely in clip width, epoch count and
/// whether the buffer survives an update (spec.md §9, Design Notes).
pub struct PpoBandit {
    policy: Box<dyn ActionStrategy>,
    optimizer: Box<dyn PolicyOptimizer>,
    buffer: ExperienceBuffer,
    ppo_iterations: u32,
    clip_eps: f64,
    rolling: bool,
    pending: Option<(f64, f64)>, // (action_internal, log_prob_at_sample_time)
}

impl PpoBandit {
    pub fn new(
        policy: Box<dyn ActionStrategy>,
        optimizer: Box<dyn PolicyOptimizer>,
        buffer_max_size: usize,
        ppo_iterations: u32,
        clip_eps: f64,
        rolling: bool,
    ) -> Self {
        Self {
            policy,
            optimizer,
            buffer: ExperienceBuffer::new(buffer_max_size),
            ppo_iterations,
            clip_eps,
            rolling,
            pending: None,
        }
    }

    /// One epoch over the buffer: standardized advantages, PPO-clipped
    /// surrogate with entropy bonus, pulled toward the initial policy.
    /// Gradients are closed-form (spec.md §9: "this can be hand-coded").
    /// Returns `mean_over_batch(ppo_loss + entropy_coeff * entropy_loss) +
    /// pull_terms` (spec.md §4.2 step 3f).
    fn epoch(&mut self) -> f64 {
        let n = self.buffer.len();
        if n == 0 {
            return 0.0;
        }

        let mean_reward: f64 = self.buffer.rewards.iter().sum::<f64>() / n as f64;
        let variance: f64 =
            self.buffer.rewards.iter().map(|r| (r - mean_reward).powi(2)).sum::<f64>() / n as f64;
        let std = variance.sqrt().max(1e-8);
        let advantages: Vec<f64> = self.buffer.rewards.iter().map(|r| (r - mean_reward) / std).collect();

        let mut grad_mean = 0.0;
        let mut grad_log_stddev = 0.0;
        let mut ppo_loss_sum = 0.0;

        for i in 0..n {
            let action = self.buffer.actions[i];
            let old_log_prob = self.buffer.log_probs[i];
            let advantage = advantages[i];

            let mu = self.policy.mean_internal();
            let log_sigma = self.policy.log_stddev_internal();
            let sigma = log_sigma.exp();

            let new_log_prob = self.policy.log_prob(action);
            let ratio = (new_log_prob - old_log_prob).exp();

            let d_logp_d_mu = (action - mu) / (sigma * sigma);
            let d_logp_d_logsigma = (action - mu).powi(2) / (sigma * sigma) - 1.0;

            let unclipped = ratio * advantage;
            let clipped_ratio = ratio.clamp(1.0 - self.clip_eps, 1.0 + self.clip_eps);
            let clipped = clipped_ratio * advantage;
            ppo_loss_sum += -unclipped.min(clipped);

            // Gradient of -min(unclipped, clipped) w.r.t. ratio: flows
            // through whichever branch is selected, zero when the other
            // branch is selected *and* the clip has saturated.
            let ratio_in_bounds = ratio >= 1.0 - self.clip_eps && ratio <= 1.0 + self.clip_eps;
            let d_loss_d_ratio = if unclipped <= clipped || ratio_in_bounds {
                -advantage
            } else {
                0.0
            };

            grad_mean += d_loss_d_ratio * ratio * d_logp_d_mu;
            grad_log_stddev += d_loss_d_ratio * ratio * d_logp_d_logsigma;
        }

        grad_mean /= n as f64;
        grad_log_stddev /= n as f64;

        // Entropy bonus: loss includes -entropy_coeff * H, dH/d(log_sigma) = 1.
        grad_log_stddev += -ENTROPY_COEFF;

        let mean = self.policy.mean_internal();
        let initial_mean = self.policy.initial_mean_internal();
        let log_stddev = self.policy.log_stddev_internal();
        let initial_log_stddev = self.policy.initial_log_stddev_internal();

        grad_mean += PULL_COEFF * (mean - initial_mean).signum();
        let mean_pull_term = PULL_COEFF * (mean - initial_mean).abs();
        let stddev_pull_term = if log_stddev > initial_log_stddev {
            grad_log_stddev += PULL_COEFF;
            PULL_COEFF * (log_stddev - initial_log_stddev)
        } else {
            0.0
        };

        let mut params = self.policy.trainable_parameters();
        if params.len() == 2 {
            self.optimizer.step(&mut params, &[grad_mean, grad_log_stddev]);
        }

        let entropy_term = -ENTROPY_COEFF * self.policy.entropy();
        ppo_loss_sum / n as f64 + entropy_term + mean_pull_term + stddev_pull_term
    }
}

impl Bandit for PpoBandit {
    fn get_action(&mut self) -> Result<f64, AppError> {
        let (action_internal, log_prob) = self.policy.sample();
        self.pending = Some((action_internal, log_prob));
        self.policy.scaled(action_internal)
    }

    fn add_reward(&mut self, reward: f64) -> Result<(), AppError> {
        let (action_internal, log_prob) = self
            .pending
            .take()
            .expect("add_reward called without a matching get_action");
        self.buffer.push(action_internal, log_prob, reward);
        Ok(())
    }

    fn update_policy(&mut self) -> Result<Option<f64>, AppError> {
        self.buffer.check_consistent()?;
        if self.buffer.len() < self.buffer.max_size {
            return Ok(None);
        }
        if !self.policy.has_trainable_parameters() {
            return Ok(None);
        }
        let mut loss = 0.0;
        for _ in 0..self.ppo_iterations {
            loss = self.epoch();
        }
        if !self.rolling {
            self.buffer.clear();
        }
        Ok(Some(loss))
    }

    fn current_mean(&self) -> f64 {
        self.policy.current_mean()
    }

    fn current_stddev(&self) -> f64 {
        self.policy.current_stddev()
    }

    fn restore(&mut self, mean_scaled: f64, stddev_scaled: f64) {
        self.policy.restore(mean_scaled, stddev_scaled);
    }

    fn buffer_len_hint(&self) -> usize {
        self.buffer.len()
    }
}

/// Wraps a policy with no training step at all — used for a fixed
/// `deterministic` action or to disable learning without removing the
/// rest of the pricing loop's plumbing.
pub struct NoUpdateBandit {
    policy: Box<dyn ActionStrategy>,
}

impl NoUpdateBandit {
    pub fn new(policy: Box<dyn ActionStrategy>) -> Self {
        Self { policy }
    }
}

impl Bandit for NoUpdateBandit {
    fn get_action(&mut self) -> Result<f64, AppError> {
        let (action_internal, _log_prob) = self.policy.sample();
        self.policy.scaled(action_internal)
    }

    fn add_reward(&mut self, _reward: f64) -> Result<(), AppError> {
        Ok(())
    }

    fn update_policy(&mut self) -> Result<Option<f64>, AppError> {
        Ok(None)
    }

    fn current_mean(&self) -> f64 {
        self.policy.current_mean()
    }

    fn current_stddev(&self) -> f64 {
        self.policy.current_stddev()
    }

    fn restore(&mut self, mean_scaled: f64, stddev_scaled: f64) {
        self.policy.restore(mean_scaled, stddev_scaled);
    }
}

/// Picks a concrete [`Bandit`] by configuration key.
pub struct BanditFactory;

impl BanditFactory {
    pub fn create(
        key: &str,
        policy: Box<dyn ActionStrategy>,
        optimizer: Box<dyn PolicyOptimizer>,
        buffer_max_size: usize,
    ) -> Result<Box<dyn Bandit>, AppError> {
        match key {
            "rolling_ppo" => Ok(Box::new(PpoBandit::new(policy, optimizer, buffer_max_size, 10, 0.1, true))),
            "ppo" => Ok(Box::new(PpoBandit::new(policy, optimizer, buffer_max_size, 10, 0.1, false))),
            "vpg" => Ok(Box::new(PpoBandit::new(policy, optimizer, buffer_max_size, 1, f64::INFINITY, false))),
            "no_update" => Ok(Box::new(NoUpdateBandit::new(policy))),
            other => Err(AppError::UnknownFactoryKey {
                kind: "bandit",
                key: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::optimizer::AdamOptimizer;
    use crate::policy::{DeterministicPolicy, ScaledGaussianPolicy};

    #[test]
    fn buffer_inconsistent_is_caught_before_training() {
        let policy = Box::new(ScaledGaussianPolicy::initialize(5e-8, 1e-1));
        let optimizer = Box::new(AdamOptimizer::new(0.01, 2));
        let mut bandit = PpoBandit::new(policy, optimizer, 10, 10, 0.1, true);
        bandit.buffer.actions.push_back(0.0);
        bandit.buffer.log_probs.push_back(0.0);
        // rewards deliberately left empty
        let err = bandit.update_policy().unwrap_err();
        assert!(matches!(err, AppError::BufferInconsistent { .. }));
    }

    #[test]
    fn update_is_a_no_op_before_the_buffer_is_full() {
        let policy = Box::new(ScaledGaussianPolicy::initialize(5e-8, 1e-1));
        let optimizer = Box::new(AdamOptimizer::new(0.01, 2));
        let mut bandit = BanditFactory::create("rolling_ppo", policy, optimizer, 10).unwrap();
        for _ in 0..5 {
            let _ = bandit.get_action().unwrap();
            bandit.add_reward(1.0).unwrap();
        }
        let loss = bandit.update_policy().unwrap();
        assert_eq!(loss, None);
        assert_eq!(bandit.buffer_len_hint(), 5);
    }

    #[test]
    fn rolling_bandit_keeps_buffer_and_returns_finite_loss_once_full() {
        let policy = Box::new(ScaledGaussianPolicy::initialize(5e-8, 1e-1));
        let optimizer = Box::new(AdamOptimizer::new(0.01, 2));
        let mut bandit = BanditFactory::create("rolling_ppo", policy, optimizer, 10).unwrap();
        for _ in 0..10 {
            let _ = bandit.get_action().unwrap();
            bandit.add_reward(1.0).unwrap();
        }
        let loss = bandit.update_policy().unwrap().expect("buffer is full, must train");
        assert!(loss.is_finite());
        assert_eq!(bandit.buffer_len_hint(), 10);
    }

    #[test]
    fn non_rolling_bandit_clears_buffer_once_full_and_returns_finite_loss() {
        let policy = Box::new(ScaledGaussianPolicy::initialize(5e-8, 1e-1));
        let optimizer = Box::new(AdamOptimizer::new(0.01, 2));
        let mut bandit = BanditFactory::create("ppo", policy, optimizer, 10).unwrap();
        for _ in 0..10 {
            let _ = bandit.get_action().unwrap();
            bandit.add_reward(1.0).unwrap();
        }
        let loss = bandit.update_policy().unwrap().expect("buffer is full, must train");
        assert!(loss.is_finite());
        assert_eq!(bandit.buffer_len_hint(), 0);
    }

    #[test]
    fn fifty_pairs_produce_a_loss_after_the_buffer_first_fills() {
        // spec.md §8 scenario 5: buffer_max_size = 10, 50 consecutive pairs,
        // at least one non-null loss after tick 10, buffer never exceeds 10.
        let policy = Box::new(ScaledGaussianPolicy::initialize(5e-8, 1e-1));
        let optimizer = Box::new(AdamOptimizer::new(0.01, 2));
        let mut bandit = BanditFactory::create("rolling_ppo", policy, optimizer, 10).unwrap();
        let mut saw_update = false;
        for tick in 1..=50 {
            let _ = bandit.get_action().unwrap();
            bandit.add_reward(1.0).unwrap();
            let loss = bandit.update_policy().unwrap();
            if tick < 10 {
                assert_eq!(loss, None);
            }
            if let Some(loss) = loss {
                assert!(loss.is_finite());
                saw_update = true;
            }
            assert!(bandit.buffer_len_hint() <= 10);
        }
        assert!(saw_update);
    }

    #[test]
    fn no_update_bandit_never_moves_the_mean() {
        let policy = Box::new(DeterministicPolicy::initialize(5e-8));
        let mut bandit = NoUpdateBandit::new(policy);
        let before = bandit.current_mean();
        for _ in 0..20 {
            let _ = bandit.get_action().unwrap();
            bandit.add_reward(1000.0).unwrap();
            bandit.update_policy().unwrap();
        }
        assert_eq!(bandit.current_mean(), before);
    }

    #[test]
    fn buffer_respects_max_size_and_drops_oldest() {
        let mut buffer = ExperienceBuffer::new(3);
        for i in 0..5 {
            buffer.push(i as f64, 0.0, 0.0);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.actions, VecDeque::from(vec![2.0, 3.0, 4.0]));
    }

    #[test]
    fn unknown_bandit_key_is_rejected() {
        let policy = Box::new(ScaledGaussianPolicy::initialize(5e-8, 1e-1));
        let optimizer = Box::new(AdamOptimizer::new(0.01, 2));
        let err = BanditFactory::create("not_a_real_bandit", policy, optimizer, 10).unwrap_err();
        assert!(matches!(err, AppError::UnknownFactoryKey { .. }));
    }
}
