//! Two-phase training.
//!
//! The [`Trainer`] is a state machine over [`TrainingPhase`]:
//!
//! ```text
//! Idle --run_warmup--> WarmupTraining --run_augmented--> AugmentedTraining --finish--> Trained
//! ```
//!
//! Warm-up passes see the training images as they are; augmented passes
//! see them through the bound [`AugmentationPipeline`]. Parameters,
//! optimizer state and the iteration counter carry over between phases.
//! Weights and biases are updated by two SGD optimizers with their own
//! learning-rate schedules; the L2 penalty only applies to weights.

use burn::{
    grad_clipping::GradientClippingConfig,
    module::{AutodiffModule, Module, ParamId},
    nn::loss::CrossEntropyLossConfig,
    optim::{
        adaptor::OptimizerAdaptor, decay::WeightDecayConfig, momentum::MomentumConfig,
        GradientsParams, Optimizer, Sgd, SgdConfig,
    },
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Tensor,
    },
};
use classifier_core::{
    ConfigurationError, DatasetError, GradientClipPolicy, ImageDimensions, LabeledSample,
    NormalizationPolicy, PassMetrics, Result, TrainingParams, TrainingPhase, TrainingPhaseError,
};
use classifier_dataset::{
    fit_scaler, ApplicationStats, AugmentationPipeline, BatchSource, ImageBatch, ImageLoader,
    PixelScaler, Split,
};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::architecture::ArchitectureSpec;
use crate::model::ConvClassifier;
use crate::observer::{TracingObserver, TrainingObserver};
use crate::schedule::StepSchedule;

type SgdOptimizer<B> =
    OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, ConvClassifier<B>, B>;

/// Per-pass metrics and optimizer state at the end of training
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub passes: Vec<PassMetrics>,
    /// Total batches processed across both phases
    pub iterations: usize,
    pub final_weight_rate: f64,
    pub final_bias_rate: f64,
}

impl TrainingHistory {
    pub fn phase(&self, phase: TrainingPhase) -> impl Iterator<Item = &PassMetrics> {
        self.passes.iter().filter(move |m| m.phase == phase)
    }

    pub fn last(&self) -> Option<&PassMetrics> {
        self.passes.last()
    }
}

/// A trained, read-only classifier on an inference backend.
#[derive(Debug, Clone)]
pub struct TrainedModel<B: Backend> {
    model: ConvClassifier<B>,
    spec: ArchitectureSpec,
    labels: Vec<String>,
    normalization: NormalizationPolicy,
    scaler: PixelScaler,
    history: TrainingHistory,
    device: B::Device,
}

impl<B: Backend> TrainedModel<B> {
    pub(crate) fn new(
        model: ConvClassifier<B>,
        spec: ArchitectureSpec,
        labels: Vec<String>,
        normalization: NormalizationPolicy,
        scaler: PixelScaler,
        history: TrainingHistory,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            spec,
            labels,
            normalization,
            scaler,
            history,
            device,
        }
    }

    pub fn model(&self) -> &ConvClassifier<B> {
        &self.model
    }

    pub fn spec(&self) -> &ArchitectureSpec {
        &self.spec
    }

    /// Class names, indexed by class id
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn input(&self) -> ImageDimensions {
        self.spec.input()
    }

    pub fn normalization(&self) -> NormalizationPolicy {
        self.normalization
    }

    /// Scaler of the last training phase
    pub fn scaler(&self) -> PixelScaler {
        self.scaler
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Most likely class id per image
    pub fn predict(&self, images: Tensor<B, 4>) -> Vec<usize> {
        self.model.predict(images)
    }
}

struct BoundData {
    train: Vec<LabeledSample>,
    labels: Vec<String>,
    augmentation: AugmentationPipeline,
}

/// Model parameters, optimizers and the iteration counter
struct TrainingRun<B: AutodiffBackend> {
    model: ConvClassifier<B>,
    weight_optim: SgdOptimizer<B>,
    bias_optim: SgdOptimizer<B>,
    bias_ids: Vec<ParamId>,
    weight_schedule: StepSchedule,
    bias_schedule: StepSchedule,
    iteration: usize,
}

struct BatchOutcome {
    loss: f64,
    correct: usize,
    size: usize,
}

impl<B: AutodiffBackend> TrainingRun<B> {
    fn new(spec: &ArchitectureSpec, model: ConvClassifier<B>) -> Self {
        let momentum = MomentumConfig::new()
            .with_momentum(spec.momentum())
            .with_dampening(0.0)
            .with_nesterov(true);
        let clipping = match spec.gradient_clip() {
            GradientClipPolicy::None => None,
            GradientClipPolicy::Norm { threshold } => Some(GradientClippingConfig::Norm(threshold)),
        };
        let weight_decay = (spec.l2() > 0.0).then(|| WeightDecayConfig::new(spec.l2() as f32));

        let weight_optim = SgdConfig::new()
            .with_momentum(Some(momentum.clone()))
            .with_weight_decay(weight_decay)
            .with_gradient_clipping(clipping.clone())
            .init();
        let bias_optim = SgdConfig::new()
            .with_momentum(Some(momentum))
            .with_gradient_clipping(clipping)
            .init();

        Self {
            bias_ids: model.bias_param_ids(),
            model,
            weight_optim,
            bias_optim,
            weight_schedule: spec.weight_schedule(),
            bias_schedule: spec.bias_schedule(),
            iteration: 0,
        }
    }

    /// One forward/backward/update step on a batch.
    fn fit_batch(mut self, batch: ImageBatch<B>) -> (Self, BatchOutcome) {
        let size = batch.targets.dims()[0];

        let output = self.model.forward(batch.images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), batch.targets.clone());
        let loss_value: f64 = loss.clone().into_scalar().elem();

        let predictions = output.argmax(1).flatten::<1>(0, 1);
        let correct: i64 = predictions
            .equal(batch.targets)
            .int()
            .sum()
            .into_scalar()
            .elem();

        let grads = loss.backward();
        let mut weight_grads = GradientsParams::from_grads(grads, &self.model);
        let mut bias_grads = GradientsParams::new();
        for id in &self.bias_ids {
            if let Some(grad) = weight_grads.remove::<B::InnerBackend, 1>(*id) {
                bias_grads.register::<B::InnerBackend, 1>(*id, grad);
            }
        }

        let weight_rate = self.weight_schedule.learning_rate(self.iteration);
        let bias_rate = self.bias_schedule.learning_rate(self.iteration);
        self.model = self.weight_optim.step(weight_rate, self.model, weight_grads);
        self.model = self.bias_optim.step(bias_rate, self.model, bias_grads);
        self.iteration += 1;

        (
            self,
            BatchOutcome {
                loss: loss_value,
                correct: correct.max(0) as usize,
                size,
            },
        )
    }
}

/// Two-phase trainer for a [`ConvClassifier`]
pub struct Trainer<B: AutodiffBackend> {
    state: TrainingPhase,
    phase_complete: bool,
    spec: ArchitectureSpec,
    params: TrainingParams,
    loader: ImageLoader,
    device: B::Device,
    observer: Box<dyn TrainingObserver>,
    shuffle_rng: ChaCha8Rng,
    bound: Option<BoundData>,
    run: Option<TrainingRun<B>>,
    warmup_scaler: Option<PixelScaler>,
    last_scaler: Option<PixelScaler>,
    history: Vec<PassMetrics>,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Creates an idle trainer. `spec.input()` must match the loader's dimensions.
    pub fn new(
        spec: ArchitectureSpec,
        params: TrainingParams,
        loader: ImageLoader,
        device: B::Device,
    ) -> std::result::Result<Self, ConfigurationError> {
        params.validate()?;
        if spec.input() != loader.dims() {
            return Err(ConfigurationError::DimensionMismatch {
                context: "architecture input".to_string(),
                expected: spec.input(),
                actual: loader.dims(),
            });
        }

        Ok(Self {
            state: TrainingPhase::Idle,
            phase_complete: false,
            shuffle_rng: ChaCha8Rng::seed_from_u64(params.shuffle_seed),
            spec,
            params,
            loader,
            device,
            observer: Box::new(TracingObserver),
            bound: None,
            run: None,
            warmup_scaler: None,
            last_scaler: None,
            history: Vec::new(),
        })
    }

    /// Replaces the default [`TracingObserver`].
    pub fn with_observer(mut self, observer: impl TrainingObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn state(&self) -> TrainingPhase {
        self.state
    }

    pub fn spec(&self) -> &ArchitectureSpec {
        &self.spec
    }

    /// Batches processed so far
    pub fn iteration(&self) -> usize {
        self.run.as_ref().map(|run| run.iteration).unwrap_or(0)
    }

    pub fn history(&self) -> &[PassMetrics] {
        &self.history
    }

    /// Application counts of the bound augmentation pipeline
    pub fn augmentation_stats(&self) -> Option<ApplicationStats> {
        self.bound.as_ref().map(|bound| bound.augmentation.stats())
    }

    /// Binds the train subset and the pipeline for the augmented phase,
    /// and initialises the model. Only valid while idle.
    pub fn bind(&mut self, split: &Split, augmentation: AugmentationPipeline) -> Result<()> {
        if self.state != TrainingPhase::Idle {
            return Err(TrainingPhaseError::InvalidTransition {
                from: self.state,
                to: TrainingPhase::WarmupTraining,
            }
            .into());
        }
        self.spec.validate(self.loader.dims(), split.num_labels())?;
        if split.train.is_empty() {
            return Err(TrainingPhaseError::EmptyTrainSet {
                phase: TrainingPhase::WarmupTraining,
            }
            .into());
        }

        let mut init_rng = ChaCha8Rng::seed_from_u64(self.spec.init_seed());
        let model = self.spec.init::<B, _>(&self.device, &mut init_rng)?;
        debug!("Initialised model with {} parameters", model.num_params());

        self.run = Some(TrainingRun::new(&self.spec, model));
        self.bound = Some(BoundData {
            train: split.train.clone(),
            labels: split.labels.clone(),
            augmentation,
        });
        Ok(())
    }

    /// Idle -> WarmupTraining: runs the unaugmented passes.
    pub fn run_warmup(&mut self) -> Result<()> {
        self.advance(TrainingPhase::WarmupTraining)?;
        self.run_phase(TrainingPhase::WarmupTraining)?;
        Ok(())
    }

    /// WarmupTraining -> AugmentedTraining: runs the augmented passes.
    pub fn run_augmented(&mut self) -> Result<()> {
        self.advance(TrainingPhase::AugmentedTraining)?;
        self.run_phase(TrainingPhase::AugmentedTraining)?;
        Ok(())
    }

    /// AugmentedTraining -> Trained: freezes the parameters.
    pub fn finish(mut self) -> Result<TrainedModel<B::InnerBackend>> {
        self.advance(TrainingPhase::Trained)?;

        let invalid = TrainingPhaseError::InvalidTransition {
            from: TrainingPhase::AugmentedTraining,
            to: TrainingPhase::Trained,
        };
        let (Some(run), Some(bound)) = (self.run.take(), self.bound.take()) else {
            return Err(invalid.into());
        };
        let last_iteration = run.iteration.saturating_sub(1);
        let history = TrainingHistory {
            passes: self.history,
            iterations: run.iteration,
            final_weight_rate: run.weight_schedule.learning_rate(last_iteration),
            final_bias_rate: run.bias_schedule.learning_rate(last_iteration),
        };

        Ok(TrainedModel::new(
            run.model.valid(),
            self.spec,
            bound.labels,
            self.params.normalization,
            self.last_scaler.unwrap_or_else(PixelScaler::full_range),
            history,
            self.device,
        ))
    }

    /// Binds `split` and `augmentation`, then runs both phases to completion.
    pub fn fit(
        mut self,
        split: &Split,
        augmentation: AugmentationPipeline,
    ) -> Result<TrainedModel<B::InnerBackend>> {
        self.bind(split, augmentation)?;
        self.run_warmup()?;
        self.run_augmented()?;
        self.finish()
    }

    fn advance(&mut self, to: TrainingPhase) -> std::result::Result<(), TrainingPhaseError> {
        let ready = match self.state {
            TrainingPhase::Idle => self.run.is_some(),
            _ => self.phase_complete,
        };
        if !ready || self.state.next() != Some(to) {
            return Err(TrainingPhaseError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!("Trainer transition: {} -> {}", self.state, to);
        self.state = to;
        self.phase_complete = false;
        Ok(())
    }

    fn run_phase(&mut self, phase: TrainingPhase) -> std::result::Result<(), TrainingPhaseError> {
        let augmented = phase == TrainingPhase::AugmentedTraining;
        let Self {
            params,
            loader,
            device,
            observer,
            shuffle_rng,
            bound,
            run,
            warmup_scaler,
            last_scaler,
            history,
            phase_complete,
            ..
        } = self;

        let missing = || TrainingPhaseError::InvalidTransition {
            from: TrainingPhase::Idle,
            to: phase,
        };
        let bound = bound.as_mut().ok_or_else(missing)?;
        let mut current = run.take().ok_or_else(missing)?;

        let passes = if augmented {
            params.augmented_passes
        } else {
            params.warmup_passes
        };
        observer.on_phase_start(phase, passes, bound.train.len());

        let scaler = match (params.normalization, augmented, *warmup_scaler) {
            (NormalizationPolicy::FitOnce, true, Some(scaler)) => scaler,
            _ => {
                let pipeline = if augmented {
                    Some(&mut bound.augmentation)
                } else {
                    None
                };
                fit_scaler(&bound.train, loader, pipeline).map_err(|e| sample_error(phase, e))?
            }
        };
        if !augmented {
            *warmup_scaler = Some(scaler);
        }
        *last_scaler = Some(scaler);
        observer.on_scaler_fitted(phase, scaler.min(), scaler.max());

        for pass in 1..=passes {
            let mut order: Vec<usize> = (0..bound.train.len()).collect();
            order.shuffle(shuffle_rng);

            let mut source =
                BatchSource::new(&bound.train, params.batch_size, *loader, scaler).with_order(order);
            if augmented {
                source = source.with_augmentation(&mut bound.augmentation);
            }

            let mut loss_sum = 0.0;
            let mut batches = 0usize;
            let mut correct = 0usize;
            let mut seen = 0usize;

            while let Some(batch) = source.next_batch::<B>(device) {
                let batch = batch.map_err(|e| sample_error(phase, e))?;
                let (next, outcome) = current.fit_batch(batch);
                current = next;

                loss_sum += outcome.loss;
                batches += 1;
                correct += outcome.correct;
                seen += outcome.size;

                if current.iteration % params.score_interval == 0 {
                    observer.on_iteration(phase, current.iteration, outcome.loss);
                }
            }

            let metrics = PassMetrics {
                phase,
                pass,
                mean_loss: loss_sum / batches.max(1) as f64,
                accuracy: correct as f64 / seen.max(1) as f64,
                iteration: current.iteration,
            };
            observer.on_pass_end(&metrics);
            history.push(metrics);
        }

        if augmented {
            debug!("Augmentation: {}", bound.augmentation.stats());
        }

        *run = Some(current);
        *phase_complete = true;
        observer.on_phase_end(phase);
        Ok(())
    }
}

fn sample_error(phase: TrainingPhase, source: DatasetError) -> TrainingPhaseError {
    TrainingPhaseError::Sample {
        phase,
        path: source.path().map(|p| p.to_path_buf()).unwrap_or_default(),
        source,
    }
}
