//! Convolutional classifier built from an [`ArchitectureSpec`].
//!
//! The network is a feature extractor (convolutions, local response
//! normalisation, max pooling) followed by a flatten and a stack of dense
//! layers ending in the output layer. `forward` returns logits; the softmax
//! of the output layer is applied by [`ConvClassifier::forward_softmax`] and,
//! during training, inside the cross-entropy loss.

use burn::{
    module::{Ignored, Module, Param, ParamId},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation, backend::Backend, Tensor, TensorData},
};
use classifier_core::ConfigurationError;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::architecture::{Activation, ArchitectureSpec, LayerShape, LayerSpec, LrnParams, WeightInit};

/// One step of the feature extractor, indexing into the layer vectors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeatureStage {
    Conv { index: usize, activation: Activation },
    Norm(LrnParams),
    Pool(usize),
}

/// Layered convolutional classifier
#[derive(Module, Debug)]
pub struct ConvClassifier<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pools: Vec<MaxPool2d>,
    dense: Vec<Linear<B>>,
    output: Linear<B>,
    features: Ignored<Vec<FeatureStage>>,
    dense_activations: Ignored<Vec<Activation>>,
    num_classes: usize,
}

impl<B: Backend> ConvClassifier<B> {
    /// Builds the layers of `spec` and samples their weights from `rng`.
    ///
    /// Weights follow the layer's init override or the global distribution,
    /// biases start at zero.
    pub fn from_spec<R: Rng + ?Sized>(
        spec: &ArchitectureSpec,
        device: &B::Device,
        rng: &mut R,
    ) -> Result<Self, ConfigurationError> {
        let shapes = spec.layer_shapes()?;

        let mut convs = Vec::new();
        let mut pools = Vec::new();
        let mut dense = Vec::new();
        let mut output = None;
        let mut features = Vec::new();
        let mut dense_activations = Vec::new();

        let input = spec.input();
        let mut previous = LayerShape::Spatial {
            channels: input.channels as usize,
            height: input.height as usize,
            width: input.width as usize,
        };

        for (layer, shape) in spec.layers().iter().zip(shapes) {
            match layer {
                LayerSpec::Convolution {
                    out_channels,
                    kernel,
                    stride,
                    padding,
                    activation,
                    init,
                } => {
                    let in_channels = match previous {
                        LayerShape::Spatial { channels, .. } => channels,
                        LayerShape::Flat(features) => features,
                    };
                    let mut conv = Conv2dConfig::new([in_channels, *out_channels], *kernel)
                        .with_stride(*stride)
                        .with_padding(PaddingConfig2d::Explicit(padding[0], padding[1]))
                        .init(device);
                    let init = init.unwrap_or(spec.weight_init());
                    conv.weight = Param::from_tensor(sample_normal(
                        [*out_channels, in_channels, kernel[0], kernel[1]],
                        init,
                        rng,
                        device,
                    )?);
                    conv.bias = Some(Param::from_tensor(Tensor::zeros([*out_channels], device)));

                    features.push(FeatureStage::Conv {
                        index: convs.len(),
                        activation: *activation,
                    });
                    convs.push(conv);
                }
                LayerSpec::LocalResponseNorm(params) => {
                    features.push(FeatureStage::Norm(*params));
                }
                LayerSpec::MaxPool {
                    kernel,
                    stride,
                    padding,
                } => {
                    let pool = MaxPool2dConfig::new(*kernel)
                        .with_strides(*stride)
                        .with_padding(PaddingConfig2d::Explicit(padding[0], padding[1]))
                        .init();
                    features.push(FeatureStage::Pool(pools.len()));
                    pools.push(pool);
                }
                LayerSpec::Dense {
                    units,
                    activation,
                    init,
                } => {
                    let init = init.unwrap_or(spec.weight_init());
                    dense.push(init_linear(previous.features(), *units, init, rng, device)?);
                    dense_activations.push(*activation);
                }
                LayerSpec::Output { units, init, .. } => {
                    let init = init.unwrap_or(spec.weight_init());
                    output = Some(init_linear(previous.features(), *units, init, rng, device)?);
                }
            }
            previous = shape;
        }

        let output = output.ok_or_else(|| {
            ConfigurationError::InvalidArchitecture("missing output layer".to_string())
        })?;

        Ok(Self {
            convs,
            pools,
            dense,
            output,
            features: Ignored(features),
            dense_activations: Ignored(dense_activations),
            num_classes: spec.num_labels(),
        })
    }

    /// Forward pass returning logits of shape [batch, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for stage in self.features.0.iter() {
            x = match *stage {
                FeatureStage::Conv { index, activation } => {
                    activate(self.convs[index].forward(x), activation)
                }
                FeatureStage::Norm(params) => local_response_norm(x, params),
                FeatureStage::Pool(index) => self.pools[index].forward(x),
            };
        }

        // Flatten [batch, channels, height, width] -> [batch, features]
        let [batch, channels, height, width] = x.dims();
        let mut x = x.reshape([batch, channels * height * width]);

        for (layer, activation) in self.dense.iter().zip(self.dense_activations.0.iter()) {
            x = activate(layer.forward(x), *activation);
        }

        self.output.forward(x)
    }

    /// Class probabilities
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        activation::softmax(self.forward(images), 1)
    }

    /// Most likely class id per image
    pub fn predict(&self, images: Tensor<B, 4>) -> Vec<usize> {
        let predictions = self.forward(images).argmax(1).flatten::<1>(0, 1);
        predictions
            .into_data()
            .iter::<i64>()
            .map(|class| class as usize)
            .collect()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Ids of every bias parameter, for routing gradients to the bias optimizer
    pub fn bias_param_ids(&self) -> Vec<ParamId> {
        self.convs
            .iter()
            .filter_map(|conv| conv.bias.as_ref().map(|bias| bias.id))
            .chain(
                self.dense
                    .iter()
                    .filter_map(|layer| layer.bias.as_ref().map(|bias| bias.id)),
            )
            .chain(self.output.bias.as_ref().map(|bias| bias.id))
            .collect()
    }
}

#[cfg(test)]
impl<B: Backend> ConvClassifier<B> {
    /// Replaces the output bias, for tests that need a fixed predictor
    pub(crate) fn with_output_bias(mut self, bias: &[f32], device: &B::Device) -> Self {
        let bias = Tensor::from_data(TensorData::new(bias.to_vec(), [bias.len()]), device);
        self.output.bias = Some(Param::from_tensor(bias));
        self
    }
}

fn activate<B: Backend, const D: usize>(x: Tensor<B, D>, activation: Activation) -> Tensor<B, D> {
    match activation {
        Activation::Relu => activation::relu(x),
        // Softmax only appears on the output layer, which returns logits
        Activation::Identity | Activation::Softmax => x,
    }
}

/// Cross-channel local response normalisation.
///
/// `b_c = a_c / (k + alpha * sum(a_j^2))^beta` where `j` runs over the `n`
/// channels centred on `c`. The window sum is an average pool over the
/// channel axis with zero padding counted, scaled back up by `n`.
pub fn local_response_norm<B: Backend>(x: Tensor<B, 4>, params: LrnParams) -> Tensor<B, 4> {
    let [batch, channels, height, width] = x.dims();
    let pool = AvgPool2dConfig::new([params.n, 1])
        .with_strides([1, 1])
        .with_padding(PaddingConfig2d::Explicit(params.n / 2, 0))
        .with_count_include_pad(true)
        .init();

    let squares = x
        .clone()
        .powf_scalar(2.0)
        .reshape([batch, 1, channels, height * width]);
    let window_sum = pool
        .forward(squares)
        .mul_scalar(params.n as f64)
        .reshape([batch, channels, height, width]);

    let scale = window_sum
        .mul_scalar(params.alpha)
        .add_scalar(params.k)
        .powf_scalar(params.beta);
    x.div(scale)
}

fn init_linear<B: Backend, R: Rng + ?Sized>(
    d_input: usize,
    d_output: usize,
    init: WeightInit,
    rng: &mut R,
    device: &B::Device,
) -> Result<Linear<B>, ConfigurationError> {
    let mut linear = LinearConfig::new(d_input, d_output).init(device);
    linear.weight = Param::from_tensor(sample_normal([d_input, d_output], init, rng, device)?);
    linear.bias = Some(Param::from_tensor(Tensor::zeros([d_output], device)));
    Ok(linear)
}

fn sample_normal<B: Backend, const D: usize, R: Rng + ?Sized>(
    shape: [usize; D],
    init: WeightInit,
    rng: &mut R,
    device: &B::Device,
) -> Result<Tensor<B, D>, ConfigurationError> {
    let normal = Normal::new(init.mean, init.std).map_err(|e| {
        ConfigurationError::InvalidArchitecture(format!("invalid weight initialisation {init:?}: {e}"))
    })?;
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| normal.sample(rng) as f32).collect();
    Ok(Tensor::from_data(TensorData::new(values, shape), device))
}
