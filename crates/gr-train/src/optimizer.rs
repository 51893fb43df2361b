use crate::error::{Result, TrainError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    /// Adam with bias correction and decoupled weight decay.
    AdamW,
    /// Plain gradient descent with weight decay.
    Sgd,
}

/// Optimizer hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::AdamW,
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl OptimizerConfig {
    pub fn sgd(learning_rate: f64) -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            learning_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainError::InvalidConfig(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(TrainError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {beta}"
                )));
            }
        }
        if self.eps < 0.0 || self.weight_decay < 0.0 {
            return Err(TrainError::InvalidConfig(
                "eps and weight decay must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct ParamState {
    m: Vec<f64>,
    v: Vec<f64>,
    grad: Vec<f64>,
}

/// Per-parameter optimizer state for one fit.
///
/// Gradients are summed over the rows of a logical batch by `accumulate`
/// and averaged when `step` applies the update.
#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
    states: Vec<ParamState>,
    pending: usize,
    steps: u64,
}

impl Optimizer {
    /// State for parameters with `sizes[i]` elements each.
    pub fn new(config: OptimizerConfig, sizes: &[usize]) -> Result<Self> {
        config.validate()?;
        let states = sizes
            .iter()
            .map(|&n| ParamState {
                m: vec![0.0; n],
                v: vec![0.0; n],
                grad: vec![0.0; n],
            })
            .collect();
        Ok(Optimizer {
            config,
            states,
            pending: 0,
            steps: 0,
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Rows accumulated since the last step.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Adds one row's gradients, one slice per parameter.
    pub fn accumulate(&mut self, grads: &[Vec<f64>]) -> Result<()> {
        check_lengths(&self.states, grads)?;
        for (state, grad) in self.states.iter_mut().zip(grads) {
            for (acc, g) in state.grad.iter_mut().zip(grad) {
                *acc += g;
            }
        }
        self.pending += 1;
        Ok(())
    }

    /// Applies one update to `params` in place using the averaged
    /// accumulated gradients, then clears the accumulators.
    pub fn step(&mut self, params: &mut [Vec<f64>]) -> Result<()> {
        check_lengths(&self.states, params)?;
        if self.pending == 0 {
            return Ok(());
        }
        let c = self.config;
        let scale = 1.0 / self.pending as f64;
        let t = self.steps + 1;
        let decay = 1.0 - c.learning_rate * c.weight_decay;
        let beta1h = 1.0 / (1.0 - powu(c.beta1, t));
        let beta2h = 1.0 / (1.0 - powu(c.beta2, t));

        for (state, w) in self.states.iter_mut().zip(params.iter_mut()) {
            for i in 0..w.len() {
                let g = state.grad[i] * scale;
                match c.kind {
                    OptimizerKind::AdamW => {
                        state.m[i] = c.beta1 * state.m[i] + (1.0 - c.beta1) * g;
                        state.v[i] = c.beta2 * state.v[i] + (1.0 - c.beta2) * g * g;
                        let mh = state.m[i] * beta1h;
                        let vh = (state.v[i] * beta2h).sqrt() + c.eps;
                        w[i] = w[i] * decay - c.learning_rate * mh / vh;
                    }
                    OptimizerKind::Sgd => {
                        w[i] = w[i] * decay - c.learning_rate * g;
                    }
                }
                state.grad[i] = 0.0;
            }
        }
        self.pending = 0;
        self.steps += 1;
        Ok(())
    }
}

/// `base^exp` for any step count.
fn powu(base: f64, exp: u64) -> f64 {
    match i32::try_from(exp) {
        Ok(e) => base.powi(e),
        Err(_) => base.powf(exp as f64),
    }
}

fn check_lengths(states: &[ParamState], values: &[Vec<f64>]) -> Result<()> {
    let matches = states.len() == values.len()
        && states.iter().zip(values).all(|(s, v)| s.grad.len() == v.len());
    if matches {
        Ok(())
    } else {
        Err(TrainError::InvalidConfig(
            "parameter layout does not match optimizer state".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_defaults_are_valid() {
        let c = OptimizerConfig::default();
        assert_eq!(c.kind, OptimizerKind::AdamW);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let c = OptimizerConfig {
            beta1: 1.0,
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(TrainError::InvalidConfig(_))));
        assert!(OptimizerConfig::sgd(0.0).validate().is_err());
    }

    #[test]
    fn test_sgd_averages_batch() {
        let mut opt = Optimizer::new(OptimizerConfig::sgd(0.1), &[2]).unwrap();
        opt.accumulate(&[vec![1.0, -2.0]]).unwrap();
        opt.accumulate(&[vec![3.0, 0.0]]).unwrap();
        assert_eq!(opt.pending(), 2);
        let mut params = vec![vec![1.0, 1.0]];
        opt.step(&mut params).unwrap();
        assert_relative_eq!(params[0][0], 0.8);
        assert_relative_eq!(params[0][1], 1.1);
        assert_eq!(opt.pending(), 0);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_adamw_first_step_moves_by_lr() {
        // bias correction makes the first step lr * sign(g)
        let mut opt = Optimizer::new(OptimizerConfig::default(), &[2]).unwrap();
        opt.accumulate(&[vec![0.5, -4.0]]).unwrap();
        let mut params = vec![vec![0.0, 0.0]];
        opt.step(&mut params).unwrap();
        assert_relative_eq!(params[0][0], -1e-3, epsilon = 1e-9);
        assert_relative_eq!(params[0][1], 1e-3, epsilon = 1e-9);
    }

    #[test]
    fn test_weight_decay() {
        let c = OptimizerConfig {
            weight_decay: 0.5,
            learning_rate: 0.1,
            ..OptimizerConfig::sgd(0.1)
        };
        let mut opt = Optimizer::new(c, &[1]).unwrap();
        opt.accumulate(&[vec![0.0]]).unwrap();
        let mut params = vec![vec![2.0]];
        opt.step(&mut params).unwrap();
        assert_relative_eq!(params[0][0], 1.9);
    }

    #[test]
    fn test_powu_past_i32_range() {
        assert_eq!(powu(0.5, 3), 0.125);
        let steps = 1u64 << 32;
        let expected = (-(steps as f64) * 1e-10).exp();
        assert_relative_eq!(powu(1.0 - 1e-10, steps), expected, max_relative = 1e-5);
        // a wrapped i32 exponent would be 0 and give 1.0
        assert!(powu(0.999, steps) < 1e-9);
    }

    #[test]
    fn test_layout_mismatch() {
        let mut opt = Optimizer::new(OptimizerConfig::default(), &[2]).unwrap();
        assert!(opt.accumulate(&[vec![1.0]]).is_err());
        assert!(opt.step(&mut [vec![1.0, 2.0], vec![3.0]]).is_err());
    }
}
