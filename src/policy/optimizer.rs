//! Gradient-based optimizers stepping a policy's trainable parameters in
//! place. The bandit borrows parameter handles from the policy for the
//! duration of one `update_policy()` call rather than the optimizer owning
//! them, breaking the cyclic policy/optimizer reference the source's
//! mixin composition has (spec.md §9, Design Notes).

pub trait PolicyOptimizer: Send {
    /// `params` and `grads` are parallel slices of equal length; `step`
    /// descends each parameter by its corresponding gradient in place.
    fn step(&mut self, params: &mut [&mut f64], grads: &[f64]);
}

/// Adam (Kingma & Ba 2014), default learning rate 0.01 per spec.md §4.4.
pub struct AdamOptimizer {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    t: u64,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl AdamOptimizer {
    pub fn new(lr: f64, n_params: usize) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
            m: vec![0.0; n_params],
            v: vec![0.0; n_params],
        }
    }
}

impl PolicyOptimizer for AdamOptimizer {
    fn step(&mut self, params: &mut [&mut f64], grads: &[f64]) {
        self.t += 1;
        let t = self.t as i32;
        for i in 0..params.len() {
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * grads[i];
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * grads[i] * grads[i];
            let m_hat = self.m[i] / (1.0 - self.beta1.powi(t));
            let v_hat = self.v[i] / (1.0 - self.beta2.powi(t));
            *params[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}

/// AdamW: Adam with decoupled weight decay.
pub struct AdamWOptimizer {
    adam: AdamOptimizer,
    weight_decay: f64,
}

impl AdamWOptimizer {
    pub fn new(lr: f64, n_params: usize) -> Self {
        Self {
            adam: AdamOptimizer::new(lr, n_params),
            weight_decay: 1e-2,
        }
    }
}

impl PolicyOptimizer for AdamWOptimizer {
    fn step(&mut self, params: &mut [&mut f64], grads: &[f64]) {
        let lr = self.adam.lr;
        let decay = self.weight_decay;
        for p in params.iter_mut() {
            **p -= lr * decay * **p;
        }
        self.adam.step(params, grads);
    }
}

/// Picks a concrete [`PolicyOptimizer`] by configuration key.
pub struct OptimizerFactory;

impl OptimizerFactory {
    pub fn create(
        key: &str,
        lr: f64,
        n_params: usize,
    ) -> Result<Box<dyn PolicyOptimizer>, crate::error::AppError> {
        match key {
            "adam" => Ok(Box::new(AdamOptimizer::new(lr, n_params))),
            "adamw" => Ok(Box::new(AdamWOptimizer::new(lr, n_params))),
            other => Err(crate::error::AppError::UnknownFactoryKey {
                kind: "optimizer",
                key: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adam_descends_toward_zero_gradient() {
        let mut x = 10.0;
        let mut optimizer = AdamOptimizer::new(0.1, 1);
        for _ in 0..200 {
            let grad = 2.0 * x; // gradient of x^2
            optimizer.step(&mut [&mut x], &[grad]);
        }
        assert!(x.abs() < 1.0, "expected x to approach 0, got {x}");
    }
}
