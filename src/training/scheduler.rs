use std::f64::consts::PI;
use tracing::{info, warn};

/// Learning rate schedulers, stepped once per training batch
#[derive(Debug, Clone, PartialEq)]
pub enum LearningRateScheduler {
    /// Constant learning rate
    Constant { lr: f64 },
    /// Cyclical rate bouncing linearly between `base_lr` and `max_lr`
    Triangular {
        base_lr: f64,
        max_lr: f64,
        step_size: usize,
    },
    /// Triangular with the amplitude halved every cycle
    Triangular2 {
        base_lr: f64,
        max_lr: f64,
        step_size: usize,
    },
    /// Cosine decay from `lr` to `eta_min` over `t_max` steps
    Cosine { lr: f64, t_max: usize, eta_min: f64 },
}

impl LearningRateScheduler {
    /// Create constant scheduler
    pub fn constant(lr: f64) -> Self {
        Self::Constant { lr }
    }

    /// Scheduler for a named schedule; unknown or missing names are constant
    pub fn from_schedule(
        schedule: Option<&str>,
        lr: f64,
        steps_per_epoch: usize,
        epochs: usize,
    ) -> Self {
        let step_size = (steps_per_epoch * 5).max(1);
        match schedule {
            None => Self::constant(lr),
            Some("triangular") => Self::Triangular {
                base_lr: lr / 5.0,
                max_lr: lr,
                step_size,
            },
            Some("triangular2") => Self::Triangular2 {
                base_lr: lr / 5.0,
                max_lr: lr,
                step_size,
            },
            Some("cosine") => Self::Cosine {
                lr,
                t_max: (steps_per_epoch * epochs).max(1),
                eta_min: 0.0,
            },
            Some(other) => {
                warn!("Unknown learning rate schedule '{}', using a constant rate", other);
                Self::constant(lr)
            }
        }
    }

    /// Learning rate at a global training step
    pub fn get_lr(&self, step: usize) -> f64 {
        match *self {
            Self::Constant { lr } => lr,
            Self::Triangular {
                base_lr,
                max_lr,
                step_size,
            } => {
                let (_, x) = triangle(step, step_size);
                base_lr + (max_lr - base_lr) * (1.0 - x).max(0.0)
            }
            Self::Triangular2 {
                base_lr,
                max_lr,
                step_size,
            } => {
                let (cycle, x) = triangle(step, step_size);
                let scale = 1.0 / 2f64.powi(cycle as i32 - 1);
                base_lr + (max_lr - base_lr) * (1.0 - x).max(0.0) * scale
            }
            Self::Cosine { lr, t_max, eta_min } => {
                if step >= t_max {
                    eta_min
                } else {
                    let progress = step as f64 / t_max as f64;
                    eta_min + (lr - eta_min) * (1.0 + (PI * progress).cos()) / 2.0
                }
            }
        }
    }
}

impl Default for LearningRateScheduler {
    fn default() -> Self {
        Self::constant(0.0002)
    }
}

/// 1-based cycle number and distance from the cycle peak in [0, 1]
fn triangle(step: usize, step_size: usize) -> (usize, f64) {
    let cycle = 1 + step / (2 * step_size);
    let x = (step as f64 / step_size as f64 - 2.0 * cycle as f64 + 1.0).abs();
    (cycle, x)
}

/// Exponential learning-rate sweep used by the learning rate finder
#[derive(Debug, Clone)]
pub struct LrRangeTest {
    pub min_lr: f64,
    pub max_lr: f64,
    pub steps: usize,
}

impl LrRangeTest {
    pub fn new(steps: usize) -> Self {
        Self {
            min_lr: 1e-7,
            max_lr: 1e1,
            steps: steps.max(2),
        }
    }

    pub fn lr_at(&self, step: usize) -> f64 {
        let fraction = step as f64 / (self.steps - 1) as f64;
        self.min_lr * (self.max_lr / self.min_lr).powf(fraction)
    }
}

/// Bias-corrected exponential moving average of the loss
#[derive(Debug, Clone)]
pub struct LossSmoother {
    beta: f64,
    average: f64,
    count: i32,
    best: f64,
}

impl LossSmoother {
    pub fn new(beta: f64) -> Self {
        Self {
            beta,
            average: 0.0,
            count: 0,
            best: f64::INFINITY,
        }
    }

    /// Add a raw loss and return the smoothed value
    pub fn update(&mut self, loss: f64) -> f64 {
        self.count += 1;
        self.average = self.beta * self.average + (1.0 - self.beta) * loss;
        let smoothed = self.average / (1.0 - self.beta.powi(self.count));
        self.best = self.best.min(smoothed);
        smoothed
    }

    /// Whether the smoothed loss has blown up past four times the best
    pub fn diverged(&self, smoothed: f64) -> bool {
        !smoothed.is_finite() || (self.count > 1 && smoothed > 4.0 * self.best)
    }
}

/// Learning rate at the steepest descent of the smoothed loss curve
pub fn suggest_learning_rate(lrs: &[f64], smoothed_losses: &[f64]) -> Option<f64> {
    let n = lrs.len().min(smoothed_losses.len());
    if n < 5 {
        warn!("Learning rate sweep stopped after {} steps, too few to pick a rate", n);
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for i in 1..n {
        let slope = (smoothed_losses[i] - smoothed_losses[i - 1]) / (lrs[i].ln() - lrs[i - 1].ln());
        if slope.is_finite() && best.map_or(true, |(_, s)| slope < s) {
            best = Some((i, slope));
        }
    }

    match best {
        Some((i, slope)) if slope < 0.0 => {
            info!("Steepest loss descent at learning rate {:.3e}", lrs[i]);
            Some(lrs[i])
        }
        _ => None,
    }
}
