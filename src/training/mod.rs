pub mod scheduler;
pub mod trainer;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of training epochs
    pub epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Training batches per epoch
    pub training_steps: usize,
    /// Validation batches per epoch
    pub validation_steps: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Learning rate schedule: triangular, triangular2 or cosine; constant otherwise
    pub learning_rate_schedule: Option<String>,
    /// Early stopping patience in epochs (0 = disabled)
    pub early_stopping_patience: usize,
    /// Random seed
    pub seed: u64,
    /// Keep the last epoch's weights instead of the best validation epoch's
    pub save_last_model: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 12,
            batch_size: 32,
            training_steps: 72,
            validation_steps: 18,
            learning_rate: 0.0002,
            learning_rate_schedule: None,
            early_stopping_patience: 8,
            seed: 2026,
            save_last_model: false,
        }
    }
}

impl TrainingConfig {
    /// Create configuration for quick testing
    pub fn quick_test() -> Self {
        Self {
            epochs: 2,
            batch_size: 4,
            training_steps: 2,
            validation_steps: 1,
            learning_rate: 0.01,
            ..Default::default()
        }
    }
}

/// Training state
#[derive(Debug, Clone)]
pub struct TrainingState {
    /// Completed epochs
    pub epoch: usize,
    /// Current global step
    pub global_step: usize,
    /// Lowest validation loss so far
    pub best_loss: f64,
    /// Epoch (1-based) that reached `best_loss`
    pub best_epoch: usize,
    /// Number of epochs without improvement
    pub epochs_without_improvement: usize,
    /// Training loss history
    pub train_loss_history: Vec<f64>,
    /// Validation loss history
    pub val_loss_history: Vec<f64>,
    /// Learning rate at the end of each epoch
    pub lr_history: Vec<f64>,
}

impl TrainingState {
    /// Create new training state
    pub fn new() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            best_loss: f64::INFINITY,
            best_epoch: 0,
            epochs_without_improvement: 0,
            train_loss_history: Vec::new(),
            val_loss_history: Vec::new(),
            lr_history: Vec::new(),
        }
    }

    /// Update after epoch; returns true when validation loss improved
    pub fn update_epoch(&mut self, train_loss: f64, val_loss: f64, lr: f64) -> bool {
        self.epoch += 1;
        self.train_loss_history.push(train_loss);
        self.val_loss_history.push(val_loss);
        self.lr_history.push(lr);

        if val_loss < self.best_loss {
            self.best_loss = val_loss;
            self.best_epoch = self.epoch;
            self.epochs_without_improvement = 0;
            true
        } else {
            self.epochs_without_improvement += 1;
            false
        }
    }

    /// Check if should stop early
    pub fn should_stop_early(&self, patience: usize) -> bool {
        patience > 0 && self.epochs_without_improvement >= patience
    }
}

impl Default for TrainingState {
    fn default() -> Self {
        Self::new()
    }
}

/// Training result
#[derive(Debug, Clone)]
pub struct TrainingResult {
    /// Final training state
    pub state: TrainingState,
    /// Path of the saved model
    pub model_file: Option<PathBuf>,
    /// Training duration in seconds
    pub duration_secs: f64,
}
