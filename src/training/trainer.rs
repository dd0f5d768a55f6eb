//! Data-parallel contrastive trainer
//!
//! Every rank holds a mirrored copy of the model and optimizer. A step runs
//! the two views through the backbone and projection head, gathers the second
//! views from every rank, evaluates the contrastive loss against the global
//! batch, adds the classifier's cross-entropy, and sum-reduces gradients and
//! metrics in one collective so all replicas apply the same update.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, SeedableRng};

use super::{
    checkpoints::{Checkpoint, CheckpointManager, CheckpointMetadata, METRICS_FILE},
    metrics::{EpochSummary, MetricTracker, MetricsHistory},
    optimizers::{Optimizer, SGDOptimizer},
    schedulers::{LRScheduler, StepDecayScheduler},
};
use crate::{
    config::{ContrastConfig, DataSource},
    data::{Augment, Batch, DataLoader, Dataset, InMemoryDataset, SyntheticClusters, ViewMode},
    distributed::{run_replicas, CollectorKind, GlobalCollector},
    error::{ContrastError, ContrastResult},
    nn::{
        losses::{
            accuracy_per_example, compute_average_loss, ContrastiveEngine, CrossEntropyLoss, Reduction,
        },
        models::{ContrastModel, ModelGradients},
    },
};

/// Where a run currently stands
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    /// Next epoch to run
    pub epoch: usize,
    pub global_step: usize,
    pub learning_rate: f32,
    pub train_loss: f32,
    pub val_acc: f32,
}

/// Global metrics of one applied step
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepOutcome {
    pub loss: f32,
    pub contrastive_loss: f32,
    pub class_loss: f32,
    pub acc: f32,
}

/// Result of evaluating on dual views
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalReport {
    pub contrastive_loss: f32,
    pub accuracy: f32,
    /// Global accuracy of each evaluated batch
    pub batch_accs: Vec<f32>,
    pub steps: usize,
    /// Examples past the last complete global batch, scored for accuracy only
    pub tail_examples: usize,
}

/// Read-only inputs shared by every rank for one pass over a loader
#[derive(Clone)]
struct PassContext {
    engine: Arc<ContrastiveEngine>,
    loader: DataLoader,
    collector: CollectorKind,
    timeout: Duration,
    epoch: usize,
    max_steps: Option<usize>,
    log_every: usize,
    weight_decay: f32,
    stop: Arc<AtomicBool>,
}

impl PassContext {
    fn global_batch(&self) -> usize {
        self.loader.batch_size()
    }

    fn steps(&self) -> usize {
        let available = self.loader.num_batches();
        self.max_steps.map_or(available, |cap| cap.min(available))
    }
}

/// What one rank brings back from a training pass
struct ReplicaRun {
    model: ContrastModel,
    optimizer: SGDOptimizer,
    tracker: MetricTracker,
    interrupted: bool,
}

// slots appended after the gradients in the step all-reduce
const SLOT_CONTRASTIVE: usize = 0;
const SLOT_CLASS: usize = 1;
const SLOT_CORRECT: usize = 2;
const SLOT_STOP: usize = 3;
const SLOT_FAULT: usize = 4;
const STEP_SLOTS: usize = 5;

/// Per-rank result of the local part of a step
struct LocalStep {
    gradients: ModelGradients,
    contrastive_sum: f32,
    class_sum: f32,
    correct: f32,
}

/// Forward and backward for this rank's shard. Collective via `from_views`.
fn local_step(
    model: &ContrastModel,
    engine: &ContrastiveEngine,
    batch: &Batch,
    collector: &dyn GlobalCollector,
    global_batch: usize,
) -> ContrastResult<LocalStep> {
    let features = model.features(&batch.view1)?;
    let key_features = model.features(&batch.view2)?;
    let queries = model.project(&features)?;
    let keys = model.project(&key_features)?;

    let contrast = engine.from_views(&batch.labels, &queries.normalized, &keys.normalized, collector)?;

    // every local row carries 1/B of the global mean
    let upstream = vec![1.0 / global_batch as f32; batch.len()];
    let grad_sims = engine.backward(&contrast.relations, &contrast.similarities, &upstream)?;
    let grad_queries = grad_sims.matmul(&contrast.keys)?;
    let grad_projection = model.projection_backward(&features, &queries, &grad_queries)?;

    let logits = model.classify(&features)?;
    let (class_losses, grad_logits) =
        CrossEntropyLoss::new(Reduction::None).forward_backward(&logits, &batch.labels, &upstream)?;
    let grad_classifier = model.classifier_backward(&features, &grad_logits)?;
    let correct: f32 = accuracy_per_example(&logits, &batch.labels)?.iter().sum();

    let contrastive_sum = compute_average_loss(&contrast.losses, global_batch)?;
    let class_sum = compute_average_loss(&class_losses, global_batch)?;
    if !(contrastive_sum + class_sum).is_finite() {
        return Err(ContrastError::numerical(
            "total loss",
            &format!("contrastive {} + class {}", contrastive_sum, class_sum),
        ));
    }

    let gradients = ModelGradients::new(&grad_projection, &grad_classifier);
    if !gradients.all_finite() {
        return Err(ContrastError::numerical("gradients", "non-finite parameter gradient"));
    }

    Ok(LocalStep {
        gradients,
        contrastive_sum,
        class_sum,
        correct,
    })
}

/// One synchronized step on one rank.
///
/// Returns `Ok(None)` when any rank asked to stop, in which case nothing is
/// applied. A local fault is still announced through the all-reduce so the
/// other ranks abort the same step instead of waiting on a barrier.
fn train_step(
    model: &mut ContrastModel,
    optimizer: &mut SGDOptimizer,
    batch: &Batch,
    collector: &dyn GlobalCollector,
    ctx: &PassContext,
) -> ContrastResult<Option<StepOutcome>> {
    let num_parameters = model.num_parameters();
    let stop = if ctx.stop.load(Ordering::SeqCst) { 1.0 } else { 0.0 };

    let local = local_step(model, &ctx.engine, batch, collector, ctx.global_batch());
    let mut payload = vec![0.0f32; num_parameters + STEP_SLOTS];
    let local_error = match local {
        Ok(step) => {
            payload[..num_parameters].copy_from_slice(step.gradients.as_slice());
            let tail = &mut payload[num_parameters..];
            tail[SLOT_CONTRASTIVE] = step.contrastive_sum;
            tail[SLOT_CLASS] = step.class_sum;
            tail[SLOT_CORRECT] = step.correct;
            None
        }
        Err(e @ ContrastError::DistributedError(_)) => return Err(e),
        Err(e) => {
            payload[num_parameters + SLOT_FAULT] = 1.0;
            Some(e)
        }
    };
    payload[num_parameters + SLOT_STOP] = stop;

    let reduced = collector.all_reduce_sum(&payload)?;
    let (gradients, tail) = reduced.split_at(num_parameters);

    if tail[SLOT_FAULT] > 0.0 {
        return Err(local_error.unwrap_or_else(|| {
            ContrastError::numerical(
                "training step",
                &format!("{} peer rank(s) failed the step", tail[SLOT_FAULT]),
            )
        }));
    }
    if tail[SLOT_STOP] > 0.0 {
        return Ok(None);
    }

    optimizer.step(&mut model.parameters_mut(), gradients)?;

    let penalty = 0.5 * ctx.weight_decay * model.l2_penalty();
    Ok(Some(StepOutcome {
        loss: tail[SLOT_CONTRASTIVE] + tail[SLOT_CLASS] + penalty,
        contrastive_loss: tail[SLOT_CONTRASTIVE],
        class_loss: tail[SLOT_CLASS],
        acc: tail[SLOT_CORRECT] / ctx.global_batch() as f32,
    }))
}

fn train_replica(
    mut model: ContrastModel,
    mut optimizer: SGDOptimizer,
    collector: &dyn GlobalCollector,
    ctx: &PassContext,
) -> ContrastResult<ReplicaRun> {
    let mut tracker = MetricTracker::new();
    let mut interrupted = false;
    let shard = ctx.loader.shard(ctx.epoch, collector.rank(), collector.world_size())?;

    for (step, batch) in shard.take(ctx.steps()).enumerate() {
        let batch = batch?;
        match train_step(&mut model, &mut optimizer, &batch, collector, ctx)? {
            Some(outcome) => {
                tracker.record_scalar("loss", outcome.loss);
                tracker.record_scalar("contrastive_loss", outcome.contrastive_loss);
                tracker.record_scalar("class_loss", outcome.class_loss);
                tracker.record_scalar("acc", outcome.acc);
                tracker.step();

                if collector.rank() == 0 && (step + 1) % ctx.log_every == 0 {
                    tracing::info!(
                        epoch = ctx.epoch,
                        step = step + 1,
                        loss = outcome.loss,
                        acc = outcome.acc,
                        "training"
                    );
                }
            }
            None => {
                if collector.rank() == 0 {
                    tracing::warn!(epoch = ctx.epoch, step, "stop requested, discarding step");
                }
                interrupted = true;
                break;
            }
        }
    }

    Ok(ReplicaRun {
        model,
        optimizer,
        tracker,
        interrupted,
    })
}

fn eval_replica(
    model: &ContrastModel,
    collector: &dyn GlobalCollector,
    ctx: &PassContext,
) -> ContrastResult<EvalReport> {
    let global_batch = ctx.global_batch();
    let mut report = EvalReport::default();
    let mut contrastive_total = 0.0f32;
    let shard = ctx.loader.shard(ctx.epoch, collector.rank(), collector.world_size())?;

    for batch in shard.take(ctx.steps()) {
        let batch = batch?;
        let features = model.features(&batch.view1)?;
        let queries = model.project(&features)?;
        let keys = model.project(&model.features(&batch.view2)?)?;
        let contrast =
            ctx.engine
                .from_views(&batch.labels, &queries.normalized, &keys.normalized, collector)?;
        let logits = model.classify(&features)?;
        let accuracy = accuracy_per_example(&logits, &batch.labels)?;

        let reduced = collector.all_reduce_sum(&[
            compute_average_loss(&contrast.losses, global_batch)?,
            compute_average_loss(&accuracy, global_batch)?,
        ])?;
        contrastive_total += reduced[0];
        report.batch_accs.push(reduced[1]);
        report.steps += 1;
    }

    if report.steps > 0 {
        report.contrastive_loss = contrastive_total / report.steps as f32;
    }

    // classification needs no gather, so every rank scores the leftover
    // examples itself and the mirrored models agree on the result
    let mut correct = report.batch_accs.iter().sum::<f32>() * global_batch as f32;
    let mut examples = report.steps * global_batch;
    if ctx.steps() == ctx.loader.num_batches() {
        if let Some(tail) = ctx.loader.remainder(ctx.epoch)? {
            let logits = model.classify(&model.features(&tail.view1)?)?;
            correct += accuracy_per_example(&logits, &tail.labels)?.iter().sum::<f32>();
            examples += tail.len();
            report.tail_examples = tail.len();
        }
    }
    if examples > 0 {
        report.accuracy = correct / examples as f32;
    }
    Ok(report)
}

/// First rank's output; every rank returns the same mirrored state
fn first_rank<R>(outputs: Vec<R>) -> ContrastResult<R> {
    outputs
        .into_iter()
        .next()
        .ok_or_else(|| ContrastError::DistributedError("replica group returned no results".to_string()))
}

fn join_error(e: tokio::task::JoinError) -> ContrastError {
    ContrastError::DistributedError(format!("training task failed: {}", e))
}

/// Build train and validation sets from the configured source
pub fn load_datasets(config: &ContrastConfig) -> ContrastResult<(Arc<dyn Dataset>, Arc<dyn Dataset>)> {
    match &config.data.source {
        DataSource::Synthetic(synthetic) => {
            let (train, val) = SyntheticClusters::generate(synthetic, config.seed)?;
            Ok((Arc::new(train), Arc::new(val)))
        }
        DataSource::Files { train, val } => Ok((
            Arc::new(InMemoryDataset::load(train)?),
            Arc::new(InMemoryDataset::load(val)?),
        )),
    }
}

/// Owns the model, optimizer and output directory of one run
pub struct Trainer {
    config: ContrastConfig,
    engine: Arc<ContrastiveEngine>,
    model: ContrastModel,
    optimizer: SGDOptimizer,
    scheduler: StepDecayScheduler,
    train_loader: DataLoader,
    val_loader: DataLoader,
    checkpoint_manager: CheckpointManager,
    history: MetricsHistory,
    state: TrainingState,
    stop: Arc<AtomicBool>,
}

impl Trainer {
    /// Create a trainer for `config`, building datasets from its data source
    pub fn new(config: ContrastConfig) -> ContrastResult<Self> {
        config.validate()?;
        let (train, val) = load_datasets(&config)?;
        Self::with_datasets(config, train, val)
    }

    pub fn with_datasets(
        config: ContrastConfig,
        train: Arc<dyn Dataset>,
        val: Arc<dyn Dataset>,
    ) -> ContrastResult<Self> {
        config.validate()?;
        if train.input_dim() != val.input_dim() {
            return Err(ContrastError::shape_mismatch(
                "validation inputs",
                &train.input_dim().to_string(),
                &val.input_dim().to_string(),
            ));
        }

        let training = &config.training;
        let engine = ContrastiveEngine::new(config.loss.variant, config.loss.temperature_scale)?;
        let model = ContrastModel::new(
            &config.model,
            train.input_dim(),
            train.num_classes().max(val.num_classes()),
            &mut StdRng::seed_from_u64(config.seed),
        );
        let optimizer = SGDOptimizer::new(training.learning_rate, training.momentum, training.weight_decay);
        let scheduler = StepDecayScheduler::new(training.learning_rate, &training.lr_decays);

        let train_loader = DataLoader::new(train, training.batch_size)
            .with_shuffle(config.data.shuffle)
            .with_views(ViewMode::Augmented(Augment::new(&config.data.augment)))
            .with_seed(config.seed);
        let val_loader = DataLoader::new(val, training.batch_size).with_views(ViewMode::Dual);
        if val_loader.num_batches() == 0 {
            tracing::warn!(
                val_size = val_loader.dataset().len(),
                batch_size = training.batch_size,
                "validation set is smaller than one global batch; only accuracy will be evaluated"
            );
        }

        tracing::info!(
            variant = %config.loss.variant,
            workers = config.distributed.num_workers,
            batch_size = training.batch_size,
            parameters = model.num_parameters(),
            "created trainer"
        );

        Ok(Self {
            checkpoint_manager: CheckpointManager::new(&config.output.out_dir),
            state: TrainingState {
                learning_rate: training.learning_rate,
                ..Default::default()
            },
            engine: Arc::new(engine),
            model,
            optimizer,
            scheduler,
            train_loader,
            val_loader,
            history: MetricsHistory::default(),
            stop: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn config(&self) -> &ContrastConfig {
        &self.config
    }

    pub fn model(&self) -> &ContrastModel {
        &self.model
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn history(&self) -> &MetricsHistory {
        &self.history
    }

    pub fn engine(&self) -> &ContrastiveEngine {
        &self.engine
    }

    pub fn val_loader(&self) -> &DataLoader {
        &self.val_loader
    }

    pub fn out_dir(&self) -> PathBuf {
        self.checkpoint_manager.checkpoint_dir().to_path_buf()
    }

    /// Flag that stops training after the current step, discarding that step
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Resume from the output directory when loading, otherwise start clean.
    ///
    /// Returns whether a checkpoint was restored.
    pub async fn prepare_output(&mut self) -> ContrastResult<bool> {
        if self.config.output.load {
            return self.restore().await;
        }
        self.checkpoint_manager.clear().await?;
        Ok(false)
    }

    /// Load the checkpoint and metrics history from the output directory
    pub async fn restore(&mut self) -> ContrastResult<bool> {
        let Some(checkpoint) = self.checkpoint_manager.load_checkpoint().await? else {
            tracing::warn!(
                dir = %self.checkpoint_manager.checkpoint_dir().display(),
                "no checkpoint to load, starting from scratch"
            );
            self.checkpoint_manager.ensure_dir().await?;
            return Ok(false);
        };

        let model = ContrastModel::from_weights(&checkpoint.weights)?;
        if model.input_dim() != self.model.input_dim() || model.num_classes() != self.model.num_classes() {
            return Err(ContrastError::ConfigurationError(format!(
                "checkpoint model ({} inputs, {} classes) does not fit the data ({} inputs, {} classes)",
                model.input_dim(),
                model.num_classes(),
                self.model.input_dim(),
                self.model.num_classes()
            )));
        }
        if checkpoint.metadata.variant != self.config.loss.variant {
            tracing::warn!(
                saved = %checkpoint.metadata.variant,
                configured = %self.config.loss.variant,
                "resuming with a different loss variant"
            );
        }

        self.model = model;
        self.optimizer = self.optimizer.clone().with_state(checkpoint.optimizer);
        self.state = TrainingState {
            epoch: checkpoint.metadata.epochs_completed,
            global_step: checkpoint.metadata.global_step,
            learning_rate: checkpoint.metadata.learning_rate,
            train_loss: checkpoint.metadata.train_loss,
            val_acc: checkpoint.metadata.val_acc,
        };
        self.history = MetricsHistory::load(&self.checkpoint_manager.path(METRICS_FILE))
            .await?
            .unwrap_or_default();
        Ok(true)
    }

    fn pass_context(&self, loader: &DataLoader, epoch: usize, max_steps: Option<usize>) -> PassContext {
        PassContext {
            engine: Arc::clone(&self.engine),
            loader: loader.clone(),
            collector: self.config.collector_kind(),
            timeout: self.config.gather_timeout(),
            epoch,
            max_steps,
            log_every: self.config.training.log_every,
            weight_decay: self.config.training.weight_decay,
            stop: Arc::clone(&self.stop),
        }
    }

    /// Run the remaining epochs, evaluating and checkpointing after each
    pub async fn fit(&mut self) -> ContrastResult<&MetricsHistory> {
        for epoch in self.state.epoch..self.config.training.epochs {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let summary = self.train_epoch(epoch).await?;
            if summary.interrupted {
                tracing::warn!(epoch, "training interrupted; epoch not checkpointed");
                break;
            }
        }
        Ok(&self.history)
    }

    /// Train one epoch, evaluate, and persist metrics and the checkpoint
    pub async fn train_epoch(&mut self, epoch: usize) -> ContrastResult<EpochSummary> {
        let started = Instant::now();
        let lr = self.scheduler.lr_at(epoch);
        if lr != self.optimizer.get_lr() {
            tracing::info!(epoch, learning_rate = lr, "learning rate changed");
        }
        self.optimizer.set_lr(lr);

        let ctx = self.pass_context(&self.train_loader, epoch, self.config.training.train_steps);
        let model = self.model.clone();
        let optimizer = self.optimizer.clone();
        let run = tokio::task::spawn_blocking(move || {
            run_replicas(ctx.collector, ctx.timeout, |collector| {
                train_replica(model.clone(), optimizer.clone(), collector, &ctx)
            })
        })
        .await
        .map_err(join_error)??;
        let run = first_rank(run)?;

        let steps = run.tracker.num_steps();
        self.model = run.model;
        self.optimizer = run.optimizer;
        self.state.global_step += steps;
        self.state.learning_rate = lr;

        let mut summary = EpochSummary {
            epoch,
            learning_rate: lr,
            steps,
            train_loss: run.tracker.mean("loss").unwrap_or(0.0),
            contrastive_loss: run.tracker.mean("contrastive_loss").unwrap_or(0.0),
            class_loss: run.tracker.mean("class_loss").unwrap_or(0.0),
            train_acc: run.tracker.mean("acc").unwrap_or(0.0),
            interrupted: run.interrupted,
            ..Default::default()
        };
        if run.interrupted {
            summary.duration_secs = started.elapsed().as_secs_f64();
            return Ok(summary);
        }

        let eval = self.evaluate_epoch(epoch).await?;
        summary.val_acc = eval.accuracy;
        summary.val_contrastive_loss = eval.contrastive_loss;
        summary.duration_secs = started.elapsed().as_secs_f64();

        tracing::info!(
            epoch,
            steps,
            train_loss = summary.train_loss,
            train_acc = summary.train_acc,
            val_acc = summary.val_acc,
            secs = summary.duration_secs,
            "epoch finished"
        );

        self.state.epoch = epoch + 1;
        self.state.train_loss = summary.train_loss;
        self.state.val_acc = summary.val_acc;
        self.history.push_epoch(&run.tracker, eval.batch_accs, summary.clone());

        self.checkpoint_manager.ensure_dir().await?;
        self.history.save(&self.checkpoint_manager.path(METRICS_FILE)).await?;
        if self.config.output.checkpoint {
            self.checkpoint_manager.save_checkpoint(&self.checkpoint()).await?;
        }
        Ok(summary)
    }

    /// Contrastive loss and accuracy of the current model on validation dual views.
    ///
    /// The contrastive loss covers complete global batches only. Accuracy
    /// also counts the leftover examples when every batch is evaluated.
    pub async fn evaluate(&self) -> ContrastResult<EvalReport> {
        self.evaluate_epoch(self.state.epoch).await
    }

    async fn evaluate_epoch(&self, epoch: usize) -> ContrastResult<EvalReport> {
        let ctx = self.pass_context(&self.val_loader, epoch, self.config.training.val_steps);
        let model = self.model.clone();
        let reports = tokio::task::spawn_blocking(move || {
            run_replicas(ctx.collector, ctx.timeout, |collector| eval_replica(&model, collector, &ctx))
        })
        .await
        .map_err(join_error)??;
        first_rank(reports)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            metadata: CheckpointMetadata {
                epochs_completed: self.state.epoch,
                global_step: self.state.global_step,
                learning_rate: self.state.learning_rate,
                train_loss: self.state.train_loss,
                val_acc: self.state.val_acc,
                variant: self.config.loss.variant,
                version: crate::VERSION.to_string(),
            },
            weights: self.model.to_weights(),
            optimizer: self.optimizer.state(),
        }
    }
}
