//! Learning rate schedulers

/// Epoch-based learning rate scheduler
pub trait LRScheduler: Send + Sync {
    /// Learning rate to use throughout `epoch`
    fn lr_at(&self, epoch: usize) -> f32;

    fn base_lr(&self) -> f32;
}

/// Multiplies the learning rate by `gamma` at each listed epoch
#[derive(Debug, Clone, PartialEq)]
pub struct StepDecayScheduler {
    base_lr: f32,
    gamma: f32,
    milestones: Vec<usize>,
}

impl StepDecayScheduler {
    pub const DEFAULT_GAMMA: f32 = 0.1;

    pub fn new(base_lr: f32, milestones: &[usize]) -> Self {
        let mut milestones = milestones.to_vec();
        milestones.sort_unstable();
        milestones.dedup();
        Self {
            base_lr,
            gamma: Self::DEFAULT_GAMMA,
            milestones,
        }
    }

    pub fn with_gamma(mut self, gamma: f32) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn milestones(&self) -> &[usize] {
        &self.milestones
    }
}

impl LRScheduler for StepDecayScheduler {
    fn lr_at(&self, epoch: usize) -> f32 {
        let decays = self.milestones.iter().take_while(|&&m| m <= epoch).count();
        self.base_lr * self.gamma.powi(decays as i32)
    }

    fn base_lr(&self) -> f32 {
        self.base_lr
    }
}
