//! Declarative network description.
//!
//! An [`ArchitectureSpec`] is a frozen list of layer descriptors plus the
//! optimizer hyperparameters that go with them. It is built once through
//! [`ArchitectureSpecBuilder`], validated by shape inference, and turned
//! into a trainable [`ConvClassifier`] with [`ArchitectureSpec::init`].
//!
//! An `ArchitectureSpec` is serializable; model archives store it in their header so a
//! saved model can be rebuilt without any other configuration.

use std::fmt;

use burn::tensor::backend::Backend;
use classifier_core::{ArchitectureConfig, ConfigurationError, GradientClipPolicy, ImageDimensions};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::ConvClassifier;
use crate::schedule::StepSchedule;

/// Non-linearity applied after a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Identity,
    Relu,
    /// Only valid on the output layer
    Softmax,
}

/// Normal weight initialisation `N(mean, std)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightInit {
    pub mean: f64,
    pub std: f64,
}

impl WeightInit {
    pub fn normal(mean: f64, std: f64) -> Self {
        Self { mean, std }
    }
}

/// Cross-channel local response normalisation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LrnParams {
    pub k: f64,
    /// Window size across channels, must be odd
    pub n: usize,
    pub alpha: f64,
    pub beta: f64,
}

impl Default for LrnParams {
    fn default() -> Self {
        Self {
            k: 2.0,
            n: 5,
            alpha: 1e-4,
            beta: 0.75,
        }
    }
}

/// One layer of the network, in forward order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSpec {
    Convolution {
        out_channels: usize,
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
        activation: Activation,
        /// Overrides the global weight initialisation
        #[serde(default)]
        init: Option<WeightInit>,
    },
    LocalResponseNorm(LrnParams),
    MaxPool {
        kernel: [usize; 2],
        stride: [usize; 2],
        padding: [usize; 2],
    },
    Dense {
        units: usize,
        activation: Activation,
        #[serde(default)]
        init: Option<WeightInit>,
    },
    Output {
        units: usize,
        activation: Activation,
        #[serde(default)]
        init: Option<WeightInit>,
    },
}

impl LayerSpec {
    pub fn name(&self) -> &'static str {
        match self {
            LayerSpec::Convolution { .. } => "convolution",
            LayerSpec::LocalResponseNorm(_) => "local response norm",
            LayerSpec::MaxPool { .. } => "max pool",
            LayerSpec::Dense { .. } => "dense",
            LayerSpec::Output { .. } => "output",
        }
    }
}

/// Activation shape after a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerShape {
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat(usize),
}

impl LayerShape {
    pub fn features(&self) -> usize {
        match *self {
            LayerShape::Spatial {
                channels,
                height,
                width,
            } => channels * height * width,
            LayerShape::Flat(features) => features,
        }
    }
}

impl fmt::Display for LayerShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerShape::Spatial {
                channels,
                height,
                width,
            } => write!(f, "{channels}x{height}x{width}"),
            LayerShape::Flat(features) => write!(f, "{features}"),
        }
    }
}

/// Frozen network description and optimizer hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    input: ImageDimensions,
    layers: Vec<LayerSpec>,
    weight_init: WeightInit,
    weight_schedule: StepSchedule,
    bias_schedule: StepSchedule,
    momentum: f64,
    l2: f64,
    gradient_clip: GradientClipPolicy,
    init_seed: u64,
}

impl ArchitectureSpec {
    pub fn builder() -> ArchitectureSpecBuilder {
        ArchitectureSpecBuilder::default()
    }

    /// The reference network for 30x30 RGB input
    pub fn reference(num_labels: usize) -> Result<Self, ConfigurationError> {
        Self::from_config(
            &ArchitectureConfig::default(),
            ImageDimensions::default(),
            num_labels,
        )
    }

    /// Lays out the reference topology with the widths and hyperparameters of `config`.
    pub fn from_config(
        config: &ArchitectureConfig,
        input: ImageDimensions,
        num_labels: usize,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let dense_init = WeightInit::normal(0.0, config.dense_init_std);

        let mut builder = Self::builder()
            .input(input)
            .weight_init(WeightInit::normal(0.0, config.weight_init_std))
            .weight_schedule(StepSchedule::from_config(&config.weight_schedule)?)
            .bias_schedule(StepSchedule::from_config(&config.bias_schedule)?)
            .momentum(config.momentum)
            .l2(config.l2)
            .gradient_clip(config.gradient_clip)
            .init_seed(config.init_seed)
            .convolution(config.conv1_filters, 11, 4, 0)
            .local_response_norm(LrnParams::default())
            .max_pool(3, 2, 1)
            .convolution(config.conv2_filters, 5, 1, 2)
            .max_pool(3, 2, 1);

        for &units in &config.dense_units {
            builder = builder.layer(LayerSpec::Dense {
                units,
                activation: Activation::Relu,
                init: Some(dense_init),
            });
        }

        builder.output(num_labels).build()
    }

    /// Returns a copy whose output layer has `num_labels` units.
    pub fn with_num_labels(&self, num_labels: usize) -> Result<Self, ConfigurationError> {
        let mut spec = self.clone();
        if let Some(LayerSpec::Output { units, .. }) = spec.layers.last_mut() {
            *units = num_labels;
        }
        spec.check()?;
        Ok(spec)
    }

    /// Checks the architecture against the loader's dimensions and the label count.
    pub fn validate(&self, input: ImageDimensions, num_labels: usize) -> Result<(), ConfigurationError> {
        if self.input != input {
            return Err(ConfigurationError::DimensionMismatch {
                context: "architecture input".to_string(),
                expected: self.input,
                actual: input,
            });
        }
        if self.num_labels() != num_labels {
            return Err(ConfigurationError::InvalidArchitecture(format!(
                "output layer has {} units but the dataset has {} labels",
                self.num_labels(),
                num_labels
            )));
        }
        self.check()
    }

    /// Output shape of every layer, in order.
    pub fn layer_shapes(&self) -> Result<Vec<LayerShape>, ConfigurationError> {
        let mut shape = LayerShape::Spatial {
            channels: self.input.channels as usize,
            height: self.input.height as usize,
            width: self.input.width as usize,
        };
        let mut shapes = Vec::with_capacity(self.layers.len());

        for (index, layer) in self.layers.iter().enumerate() {
            let invalid = |reason: String| {
                ConfigurationError::InvalidArchitecture(format!(
                    "layer {index} ({}): {reason}",
                    layer.name()
                ))
            };

            shape = match (layer, shape) {
                (
                    LayerSpec::Convolution {
                        out_channels,
                        kernel,
                        stride,
                        padding,
                        ..
                    },
                    LayerShape::Spatial { height, width, .. },
                ) => {
                    let (h, w) = window_output([height, width], *kernel, *stride, *padding)
                        .ok_or_else(|| invalid(format!("kernel {kernel:?} does not fit {height}x{width}")))?;
                    LayerShape::Spatial {
                        channels: *out_channels,
                        height: h,
                        width: w,
                    }
                }
                (
                    LayerSpec::MaxPool {
                        kernel,
                        stride,
                        padding,
                    },
                    LayerShape::Spatial {
                        channels,
                        height,
                        width,
                    },
                ) => {
                    let (h, w) = window_output([height, width], *kernel, *stride, *padding)
                        .ok_or_else(|| invalid(format!("kernel {kernel:?} does not fit {height}x{width}")))?;
                    LayerShape::Spatial {
                        channels,
                        height: h,
                        width: w,
                    }
                }
                (LayerSpec::LocalResponseNorm(_), spatial @ LayerShape::Spatial { .. }) => spatial,
                (LayerSpec::Dense { units, .. } | LayerSpec::Output { units, .. }, _) => {
                    LayerShape::Flat(*units)
                }
                (_, LayerShape::Flat(_)) => {
                    return Err(invalid("spatial layer after a flattened layer".to_string()));
                }
            };
            shapes.push(shape);
        }

        Ok(shapes)
    }

    pub fn input(&self) -> ImageDimensions {
        self.input
    }

    pub fn layers(&self) -> &[LayerSpec] {
        &self.layers
    }

    /// Width of the output layer
    pub fn num_labels(&self) -> usize {
        match self.layers.last() {
            Some(LayerSpec::Output { units, .. }) => *units,
            _ => 0,
        }
    }

    pub fn weight_init(&self) -> WeightInit {
        self.weight_init
    }

    pub fn weight_schedule(&self) -> StepSchedule {
        self.weight_schedule
    }

    pub fn bias_schedule(&self) -> StepSchedule {
        self.bias_schedule
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn l2(&self) -> f64 {
        self.l2
    }

    pub fn gradient_clip(&self) -> GradientClipPolicy {
        self.gradient_clip
    }

    pub fn init_seed(&self) -> u64 {
        self.init_seed
    }

    /// Builds the burn model, sampling weights from `rng`.
    pub fn init<B: Backend, R: Rng + ?Sized>(
        &self,
        device: &B::Device,
        rng: &mut R,
    ) -> Result<ConvClassifier<B>, ConfigurationError> {
        ConvClassifier::from_spec(self, device, rng)
    }

    fn check(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| -> Result<(), ConfigurationError> {
            Err(ConfigurationError::InvalidArchitecture(reason.to_string()))
        };

        let Some(LayerSpec::Output { units, .. }) = self.layers.last() else {
            return invalid("the last layer must be the output layer");
        };
        if *units == 0 {
            return invalid("the output layer needs at least one unit");
        }
        let outputs = self
            .layers
            .iter()
            .filter(|l| matches!(l, LayerSpec::Output { .. }))
            .count();
        if outputs != 1 {
            return invalid("exactly one output layer is allowed");
        }

        for layer in &self.layers {
            match layer {
                LayerSpec::Convolution {
                    out_channels,
                    stride,
                    activation,
                    init,
                    ..
                } => {
                    if *out_channels == 0 || stride.contains(&0) {
                        return invalid("convolutions need non-zero channels and stride");
                    }
                    if *activation == Activation::Softmax {
                        return invalid("softmax is only allowed on the output layer");
                    }
                    check_init(init)?;
                }
                LayerSpec::Dense {
                    units,
                    activation,
                    init,
                } => {
                    if *units == 0 {
                        return invalid("dense layers need at least one unit");
                    }
                    if *activation == Activation::Softmax {
                        return invalid("softmax is only allowed on the output layer");
                    }
                    check_init(init)?;
                }
                LayerSpec::Output { init, .. } => check_init(init)?,
                LayerSpec::MaxPool {
                    kernel,
                    stride,
                    padding,
                } => {
                    if stride.contains(&0) {
                        return invalid("pooling stride must be non-zero");
                    }
                    if padding[0] * 2 > kernel[0] || padding[1] * 2 > kernel[1] {
                        return invalid("pooling padding may be at most half the kernel");
                    }
                }
                LayerSpec::LocalResponseNorm(params) => {
                    if params.n % 2 == 0 {
                        return invalid("local response norm window must be odd");
                    }
                    if ![params.k, params.alpha, params.beta].iter().all(|v| v.is_finite()) {
                        return invalid("local response norm parameters must be finite");
                    }
                }
            }
        }

        check_init(&Some(self.weight_init))?;
        if !(0.0..1.0).contains(&self.momentum) {
            return invalid("momentum must be in [0, 1)");
        }
        if !(self.l2.is_finite() && self.l2 >= 0.0) {
            return invalid("l2 penalty must not be negative");
        }
        if let GradientClipPolicy::Norm { threshold } = self.gradient_clip {
            if !(threshold.is_finite() && threshold > 0.0) {
                return invalid("gradient clipping threshold must be positive");
            }
        }
        for schedule in [self.weight_schedule, self.bias_schedule] {
            StepSchedule::new(schedule.initial_rate(), schedule.decay_rate(), schedule.step())?;
        }

        self.layer_shapes().map(|_| ())
    }
}

fn check_init(init: &Option<WeightInit>) -> Result<(), ConfigurationError> {
    match init {
        Some(init) if !(init.std.is_finite() && init.std > 0.0 && init.mean.is_finite()) => {
            Err(ConfigurationError::InvalidArchitecture(format!(
                "invalid weight initialisation {init:?}"
            )))
        }
        _ => Ok(()),
    }
}

/// Output size of a sliding window, `None` if the window does not fit.
fn window_output(
    size: [usize; 2],
    kernel: [usize; 2],
    stride: [usize; 2],
    padding: [usize; 2],
) -> Option<(usize, usize)> {
    let dim = |i: usize| {
        let padded = size[i] + 2 * padding[i];
        if kernel[i] == 0 || stride[i] == 0 || padded < kernel[i] {
            None
        } else {
            Some((padded - kernel[i]) / stride[i] + 1)
        }
    };
    Some((dim(0)?, dim(1)?))
}

/// Builder for [`ArchitectureSpec`]
#[derive(Debug, Clone)]
pub struct ArchitectureSpecBuilder {
    input: ImageDimensions,
    layers: Vec<LayerSpec>,
    weight_init: WeightInit,
    weight_schedule: StepSchedule,
    bias_schedule: StepSchedule,
    momentum: f64,
    l2: f64,
    gradient_clip: GradientClipPolicy,
    init_seed: u64,
}

impl Default for ArchitectureSpecBuilder {
    fn default() -> Self {
        Self {
            input: ImageDimensions::default(),
            layers: Vec::new(),
            weight_init: WeightInit::normal(0.0, 0.01),
            weight_schedule: StepSchedule::constant(1e-2),
            bias_schedule: StepSchedule::constant(2e-2),
            momentum: 0.9,
            l2: 0.0,
            gradient_clip: GradientClipPolicy::None,
            init_seed: 42,
        }
    }
}

impl ArchitectureSpecBuilder {
    pub fn input(mut self, input: ImageDimensions) -> Self {
        self.input = input;
        self
    }

    pub fn layer(mut self, layer: LayerSpec) -> Self {
        self.layers.push(layer);
        self
    }

    /// Square ReLU convolution with the global initialisation
    pub fn convolution(self, out_channels: usize, kernel: usize, stride: usize, padding: usize) -> Self {
        self.layer(LayerSpec::Convolution {
            out_channels,
            kernel: [kernel, kernel],
            stride: [stride, stride],
            padding: [padding, padding],
            activation: Activation::Relu,
            init: None,
        })
    }

    pub fn local_response_norm(self, params: LrnParams) -> Self {
        self.layer(LayerSpec::LocalResponseNorm(params))
    }

    pub fn max_pool(self, kernel: usize, stride: usize, padding: usize) -> Self {
        self.layer(LayerSpec::MaxPool {
            kernel: [kernel, kernel],
            stride: [stride, stride],
            padding: [padding, padding],
        })
    }

    /// ReLU dense layer with the global initialisation
    pub fn dense(self, units: usize) -> Self {
        self.layer(LayerSpec::Dense {
            units,
            activation: Activation::Relu,
            init: None,
        })
    }

    /// Softmax output layer
    pub fn output(self, units: usize) -> Self {
        self.layer(LayerSpec::Output {
            units,
            activation: Activation::Softmax,
            init: None,
        })
    }

    pub fn weight_init(mut self, init: WeightInit) -> Self {
        self.weight_init = init;
        self
    }

    pub fn weight_schedule(mut self, schedule: StepSchedule) -> Self {
        self.weight_schedule = schedule;
        self
    }

    pub fn bias_schedule(mut self, schedule: StepSchedule) -> Self {
        self.bias_schedule = schedule;
        self
    }

    pub fn momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn l2(mut self, l2: f64) -> Self {
        self.l2 = l2;
        self
    }

    pub fn gradient_clip(mut self, policy: GradientClipPolicy) -> Self {
        self.gradient_clip = policy;
        self
    }

    pub fn init_seed(mut self, seed: u64) -> Self {
        self.init_seed = seed;
        self
    }

    pub fn build(self) -> Result<ArchitectureSpec, ConfigurationError> {
        let spec = ArchitectureSpec {
            input: self.input,
            layers: self.layers,
            weight_init: self.weight_init,
            weight_schedule: self.weight_schedule,
            bias_schedule: self.bias_schedule,
            momentum: self.momentum,
            l2: self.l2,
            gradient_clip: self.gradient_clip,
            init_seed: self.init_seed,
        };
        spec.check()?;
        Ok(spec)
    }
}
