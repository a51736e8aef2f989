use crate::data::generator::BatchSource;
use crate::model::architecture::{input_tensors, BurnModel, MultimodalModel};
use crate::model::checkpoint::save_model;
use crate::model::loss::{loss_value, multitask_loss};
use crate::model::{Model, ModelConfig};
use crate::tensor_map::TensorMap;
use crate::training::scheduler::{suggest_learning_rate, LearningRateScheduler, LossSmoother, LrRangeTest};
use crate::training::{TrainingConfig, TrainingResult, TrainingState};
use crate::utils::format_duration;
use anyhow::{anyhow, Result};
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Trainer for multimodal multitask models
pub struct Trainer<B: AutodiffBackend> {
    /// Training configuration
    config: TrainingConfig,
    /// Device
    device: B::Device,
}

/// Loss curve of a learning rate sweep
#[derive(Debug, Clone, Default)]
pub struct LrSweep {
    pub learning_rates: Vec<f64>,
    pub smoothed_losses: Vec<f64>,
    pub suggestion: Option<f64>,
}

fn progress_bar(steps: usize, prefix: String) -> Result<ProgressBar> {
    let style = ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    Ok(ProgressBar::new(steps as u64).with_style(style).with_prefix(prefix))
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Create new trainer
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        Self { config, device }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Mean validation loss over `validation_steps` batches
    fn validation_loss(
        &self,
        network: &MultimodalModel<B::InnerBackend>,
        inputs: &[TensorMap],
        outputs: &[TensorMap],
        valid: &mut dyn BatchSource,
    ) -> Result<f64> {
        let steps = self.config.validation_steps.max(1);
        let mut total = 0.0;
        for _ in 0..steps {
            let batch = valid.next_batch()?;
            let tensors = input_tensors::<B::InnerBackend>(inputs, &batch.inputs, &self.device)?;
            let output = network.forward(tensors);
            let loss = multitask_loss(outputs, output.logits, &batch.outputs, &self.device)?;
            total += loss_value(loss);
        }
        Ok(total / steps as f64)
    }

    /// Train with validation each epoch and early stopping on validation loss.
    ///
    /// The best epoch's weights are written to `model_file` as training
    /// progresses; with `save_last_model` the final weights are kept instead.
    pub fn train(
        &self,
        model: BurnModel<B>,
        train: &mut dyn BatchSource,
        valid: &mut dyn BatchSource,
        model_file: &Path,
    ) -> Result<(BurnModel<B::InnerBackend>, TrainingResult)> {
        info!("Starting training with configuration: {:?}", self.config);
        let start_time = Instant::now();

        let name = model.name().to_string();
        let inputs = model.input_maps().to_vec();
        let outputs = model.output_maps().to_vec();
        let model_config: ModelConfig = model.config().clone();
        let mut network = model.into_network();

        let mut optimizer = AdamConfig::new().init::<B, MultimodalModel<B>>();
        let scheduler = LearningRateScheduler::from_schedule(
            self.config.learning_rate_schedule.as_deref(),
            self.config.learning_rate,
            self.config.training_steps,
            self.config.epochs,
        );
        let steps = self.config.training_steps.max(1);
        let mut state = TrainingState::new();
        let mut best: Option<MultimodalModel<B::InnerBackend>> = None;
        let mut lr = scheduler.get_lr(0);

        for epoch in 0..self.config.epochs {
            let pb = progress_bar(steps, format!("Epoch {}/{}", epoch + 1, self.config.epochs))?;
            let mut epoch_loss = 0.0;

            for _ in 0..steps {
                let batch = train.next_batch()?;
                lr = scheduler.get_lr(state.global_step);

                let tensors = input_tensors::<B>(&inputs, &batch.inputs, &self.device)?;
                let output = network.forward(tensors);
                let loss = multitask_loss(&outputs, output.logits, &batch.outputs, &self.device)?;
                let value = loss_value(loss.clone());
                epoch_loss += value;

                let grads = GradientsParams::from_grads(loss.backward(), &network);
                network = optimizer.step(lr, network, grads);
                state.global_step += 1;

                pb.set_message(format!("loss {:.4}", value));
                pb.inc(1);
            }
            pb.finish_and_clear();

            let train_loss = epoch_loss / steps as f64;
            let valid_network = network.valid();
            let val_loss = self.validation_loss(&valid_network, &inputs, &outputs, valid)?;
            let improved = state.update_epoch(train_loss, val_loss, lr);
            info!(
                "Epoch {}/{}: loss {:.4}, val_loss {:.4}, lr {:.2e}",
                epoch + 1,
                self.config.epochs,
                train_loss,
                val_loss,
                lr
            );

            if improved {
                if !self.config.save_last_model {
                    let checkpoint = BurnModel::from_parts(
                        &name,
                        valid_network.clone(),
                        inputs.clone(),
                        outputs.clone(),
                        model_config.clone(),
                        &self.device,
                    );
                    save_model(&checkpoint, model_file, state.epoch, Some(val_loss))?;
                }
                best = Some(valid_network);
            } else {
                debug!(
                    "Validation loss did not improve from {:.4} for {} epochs",
                    state.best_loss, state.epochs_without_improvement
                );
            }

            if state.should_stop_early(self.config.early_stopping_patience) {
                info!(
                    "Early stopping after epoch {}, best epoch was {}",
                    state.epoch, state.best_epoch
                );
                break;
            }
        }

        let keep_last = self.config.save_last_model || best.is_none();
        let final_network = match best {
            Some(best) if !keep_last => best,
            _ => network.valid(),
        };
        let trained = BurnModel::from_parts(&name, final_network, inputs, outputs, model_config, &self.device);
        if keep_last {
            let last_loss = state.val_loss_history.last().copied();
            save_model(&trained, model_file, state.epoch, last_loss)?;
        }

        let duration_secs = start_time.elapsed().as_secs_f64();
        info!(
            "Training finished after {} epochs in {}",
            state.epoch,
            format_duration(duration_secs)
        );
        Ok((
            trained,
            TrainingResult {
                state,
                model_file: Some(model_file.to_path_buf()),
                duration_secs,
            },
        ))
    }

    /// Exponential learning rate sweep on a throwaway model
    pub fn find_learning_rate(&self, model: BurnModel<B>, train: &mut dyn BatchSource) -> Result<LrSweep> {
        let sweep = LrRangeTest::new(self.config.training_steps);
        info!(
            "Sweeping learning rate from {:.1e} to {:.1e} over {} steps",
            sweep.min_lr, sweep.max_lr, sweep.steps
        );

        let inputs = model.input_maps().to_vec();
        let outputs = model.output_maps().to_vec();
        let mut network = model.into_network();
        let mut optimizer = AdamConfig::new().init::<B, MultimodalModel<B>>();
        let mut smoother = LossSmoother::new(0.98);
        let mut result = LrSweep::default();

        for step in 0..sweep.steps {
            let lr = sweep.lr_at(step);
            let batch = train.next_batch()?;
            let tensors = input_tensors::<B>(&inputs, &batch.inputs, &self.device)?;
            let output = network.forward(tensors);
            let loss = multitask_loss(&outputs, output.logits, &batch.outputs, &self.device)?;

            let smoothed = smoother.update(loss_value(loss.clone()));
            if smoother.diverged(smoothed) {
                info!("Loss diverged at learning rate {:.3e}, stopping the sweep", lr);
                break;
            }
            result.learning_rates.push(lr);
            result.smoothed_losses.push(smoothed);

            let grads = GradientsParams::from_grads(loss.backward(), &network);
            network = optimizer.step(lr, network, grads);
        }

        result.suggestion = suggest_learning_rate(&result.learning_rates, &result.smoothed_losses);
        Ok(result)
    }
}
