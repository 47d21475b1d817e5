use crate::config::{Dimensions, NetworkConfig, Tunables};
use crate::dataset::Label;
use crate::error::{CnnError, Result};
use crate::image::Image;
use crate::layers::{self, Pooled};
use itertools::Itertools;
use ndarray::{Array, Array1, Array2, Array3, Axis, Zip};
use ndarray_rand::{
    RandomExt,
    rand::{Rng, SeedableRng, rngs::StdRng},
    rand_distr::Uniform,
};
use tracing::debug;

/// Half-width of the uniform range every weight is drawn from. The range does
/// not depend on fan-in.
pub const INIT_SCALE: f64 = 0.1;
/// Gradients are clamped to `[-GRADIENT_CLIP, GRADIENT_CLIP]` before each update.
pub const GRADIENT_CLIP: f64 = 5.0;
/// Probabilities are clamped this far away from 0 and 1 before taking logs.
pub const PROBABILITY_EPSILON: f64 = 1e-8;

/// Every learnable value of the network. Shapes are fixed at construction.
///
/// The field order is the order of the model file.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkParameters {
    /// `[filter, row, column]` kernels applied to the input image.
    pub kernels1: Array3<f64>,
    pub bias1: Array1<f64>,
    /// `[filter, row, column]` kernels, filter `f` applied to conv1 channel `f`.
    pub kernels2: Array3<f64>,
    pub bias2: Array1<f64>,
    /// `[hidden unit, flattened pooled index]`.
    pub dense1_weights: Array2<f64>,
    pub dense1_bias: Array1<f64>,
    pub dense2_weights: Array1<f64>,
    pub dense2_bias: f64,
}

impl NetworkParameters {
    pub(crate) fn zeros(dims: &Dimensions) -> NetworkParameters {
        let k = dims.kernel_size;
        NetworkParameters {
            kernels1: Array3::zeros((dims.filters, k, k)),
            bias1: Array1::zeros(dims.filters),
            kernels2: Array3::zeros((dims.filters, k, k)),
            bias2: Array1::zeros(dims.filters),
            dense1_weights: Array2::zeros((dims.hidden_size, dims.flattened())),
            dense1_bias: Array1::zeros(dims.hidden_size),
            dense2_weights: Array1::zeros(dims.hidden_size),
            dense2_bias: 0.0,
        }
    }

    // Weights uniform in [-INIT_SCALE, INIT_SCALE), biases zero. Draw order is
    // kernels1, kernels2, dense1, dense2.
    fn initialize<R: Rng + ?Sized>(dims: &Dimensions, rng: &mut R) -> NetworkParameters {
        let uniform = Uniform::new(-INIT_SCALE, INIT_SCALE);
        let k = dims.kernel_size;
        NetworkParameters {
            kernels1: Array::random_using((dims.filters, k, k), &uniform, rng),
            kernels2: Array::random_using((dims.filters, k, k), &uniform, rng),
            dense1_weights: Array::random_using(
                (dims.hidden_size, dims.flattened()),
                &uniform,
                rng,
            ),
            dense2_weights: Array::random_using(dims.hidden_size, &uniform, rng),
            ..NetworkParameters::zeros(dims)
        }
    }

    /// Total number of scalars.
    pub fn count(&self) -> usize {
        self.kernels1.len()
            + self.bias1.len()
            + self.kernels2.len()
            + self.bias2.len()
            + self.dense1_weights.len()
            + self.dense1_bias.len()
            + self.dense2_weights.len()
            + 1
    }

    /// All values in model-file order.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.kernels1
            .iter()
            .chain(&self.bias1)
            .chain(&self.kernels2)
            .chain(&self.bias2)
            .chain(&self.dense1_weights)
            .chain(&self.dense1_bias)
            .chain(&self.dense2_weights)
            .chain(std::iter::once(&self.dense2_bias))
            .copied()
    }

    /// Mutable counterpart of [`NetworkParameters::values`], same order.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut f64> + '_ {
        self.kernels1
            .iter_mut()
            .chain(self.bias1.iter_mut())
            .chain(self.kernels2.iter_mut())
            .chain(self.bias2.iter_mut())
            .chain(self.dense1_weights.iter_mut())
            .chain(self.dense1_bias.iter_mut())
            .chain(self.dense2_weights.iter_mut())
            .chain(std::iter::once(&mut self.dense2_bias))
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.values().map(|v| v * v).sum()
    }
}

/// Intermediate values of one forward pass, needed to backpropagate through it.
///
/// A trace is built from scratch by every [`Network::trace`] call and describes
/// only the image it was built from; the pooling indices in particular are
/// positions in this trace's own `conv2` buffer.
#[derive(Debug, Clone)]
pub struct ForwardTrace {
    /// Post-ReLU conv1 output, `[filter, row, column]`.
    pub conv1: Array3<f64>,
    /// Post-ReLU conv2 output, `[filter, row, column]`.
    pub conv2: Array3<f64>,
    pub pooled: Pooled,
    /// `pooled.values` flattened channel-major.
    pub flattened: Array1<f64>,
    pub hidden_pre_activation: Array1<f64>,
    pub hidden: Array1<f64>,
    pub probability: f64,
}

/// Output-layer values worth watching during training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputLayerStats {
    pub bias: f64,
    pub mean_weight: f64,
}

/// A two-stage depthwise convolutional binary classifier:
///
/// conv1 -> ReLU -> conv2 -> ReLU -> max-pool -> dense (ReLU) -> dense (sigmoid)
///
/// Inference borrows the network immutably and keeps all activations local to
/// the call. Training and gradient checking need `&mut self`, so one instance
/// serves at most one of them at a time; parallel training needs one network
/// per worker.
#[derive(Debug, Clone)]
pub struct Network {
    dims: Dimensions,
    tunables: Tunables,
    params: NetworkParameters,
}

impl Network {
    pub fn new(config: &NetworkConfig) -> Result<Network> {
        let dims = config.dimensions()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let params = NetworkParameters::initialize(&dims, &mut rng);
        debug!(?dims, parameters = params.count(), "created network");

        Ok(Network {
            dims,
            tunables: config.tunables,
            params,
        })
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dims
    }

    pub fn tunables(&self) -> Tunables {
        self.tunables
    }

    pub fn set_tunables(&mut self, tunables: Tunables) {
        self.tunables = tunables;
    }

    pub fn parameters(&self) -> &NetworkParameters {
        &self.params
    }

    pub(crate) fn parameters_mut(&mut self) -> &mut NetworkParameters {
        &mut self.params
    }

    /// The probability that `image` is a cat.
    pub fn forward(&self, image: &Image) -> Result<f64> {
        Ok(self.trace(image)?.probability)
    }

    // Runs the forward pass and keeps every intermediate value. The image is convolved by each
    // stage-one kernel, the result of each channel is convolved again by its own stage-two kernel,
    // and the pooled maxima are flattened into the dense layers. Nothing is stored on the
    // network, so the trace only ever describes the image it came from.
    pub fn trace(&self, image: &Image) -> Result<ForwardTrace> {
        let expected = (self.dims.input_width, self.dims.input_height);
        let actual = (image.width(), image.height());
        if expected != actual {
            return Err(CnnError::InputSize { expected, actual });
        }

        let p = &self.params;
        let mut conv1 = layers::conv_image(image.pixels(), p.kernels1.view(), p.bias1.view());
        conv1.mapv_inplace(layers::relu);
        let mut conv2 = layers::conv_depthwise(conv1.view(), p.kernels2.view(), p.bias2.view());
        conv2.mapv_inplace(layers::relu);

        let pooled = layers::max_pool(conv2.view(), self.dims.pool_size);
        let flattened = pooled.flatten();

        let hidden_pre_activation = p.dense1_weights.dot(&flattened) + &p.dense1_bias;
        let hidden = hidden_pre_activation.mapv(layers::relu);
        if self.tunables.debug {
            debug!(
                "dense1 activations: {} ...",
                hidden.iter().take(4).map(|a| format!("{a:.3}")).join(" ")
            );
        }

        // A saturated logit would round the sigmoid to exactly 0 or 1, so the output is held
        // inside the same bounds the loss uses.
        let probability = layers::sigmoid(p.dense2_weights.dot(&hidden) + p.dense2_bias)
            .clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON);

        Ok(ForwardTrace {
            conv1,
            conv2,
            pooled,
            flattened,
            hidden_pre_activation,
            hidden,
            probability,
        })
    }

    // Performs one stochastic gradient descent step on a single sample. A fresh forward trace is
    // taken first, every gradient is then computed from the parameters as they stand, and only
    // once all of them are known is each parameter moved. The returned loss is the binary
    // cross-entropy measured before the update.
    pub fn backward_and_update(
        &mut self,
        image: &Image,
        label: Label,
        learning_rate: f64,
    ) -> Result<f64> {
        let trace = self.trace(image)?;
        let loss = binary_cross_entropy(trace.probability, label);
        let gradients = self.gradients(image, &trace, label);
        self.apply_gradients(&gradients, learning_rate);
        Ok(loss)
    }

    // Backpropagates the unregularized loss through the trace of `image`, returning the gradient
    // of every parameter in the same shape as the parameter itself. The output layer's gradient
    // is p - y, which flows back through the hidden ReLU, is routed to the pooling winners, then
    // passes through each convolution stage channel by channel.
    pub(crate) fn gradients(
        &self,
        image: &Image,
        trace: &ForwardTrace,
        label: Label,
    ) -> NetworkParameters {
        let p = &self.params;
        let dims = &self.dims;
        let k = dims.kernel_size;

        // Sigmoid and cross-entropy together reduce to p - y at the logit.
        let ds = trace.probability - label.target();
        let dense2_weights = &trace.hidden * ds;

        let hidden_grad = Zip::from(&p.dense2_weights)
            .and(&trace.hidden_pre_activation)
            .map_collect(|&w, &pre| if pre > 0.0 { ds * w } else { 0.0 });
        let dense1_weights = hidden_grad
            .view()
            .insert_axis(Axis(1))
            .dot(&trace.flattened.view().insert_axis(Axis(0)));

        let pooled_grad = p.dense1_weights.t().dot(&hidden_grad);
        let mut conv2_grad =
            layers::unpool(pooled_grad.view(), &trace.pooled.argmax, trace.conv2.dim());
        mask_inactive(&mut conv2_grad, &trace.conv2);

        let mut kernels2 = Array3::zeros(p.kernels2.raw_dim());
        let mut bias2 = Array1::zeros(dims.filters);
        let mut conv1_grad = Array3::zeros(trace.conv1.raw_dim());
        for f in 0..dims.filters {
            let grad = conv2_grad.index_axis(Axis(0), f);
            let input = trace.conv1.index_axis(Axis(0), f);
            kernels2
                .index_axis_mut(Axis(0), f)
                .assign(&layers::kernel_gradient(input, grad, k));
            bias2[f] = grad.sum();
            conv1_grad.index_axis_mut(Axis(0), f).assign(&layers::input_gradient(
                grad,
                p.kernels2.index_axis(Axis(0), f),
                input.dim(),
            ));
        }
        mask_inactive(&mut conv1_grad, &trace.conv1);

        let mut kernels1 = Array3::zeros(p.kernels1.raw_dim());
        let mut bias1 = Array1::zeros(dims.filters);
        for f in 0..dims.filters {
            let grad = conv1_grad.index_axis(Axis(0), f);
            kernels1
                .index_axis_mut(Axis(0), f)
                .assign(&layers::kernel_gradient(image.pixels(), grad, k));
            bias1[f] = grad.sum();
        }

        NetworkParameters {
            kernels1,
            bias1,
            kernels2,
            bias2,
            dense1_weights,
            dense1_bias: hidden_grad,
            dense2_weights,
            dense2_bias: ds,
        }
    }

    // Adds the L2 term, clips, and steps every parameter. Each gradient was
    // computed before any parameter moved.
    fn apply_gradients(&mut self, gradients: &NetworkParameters, learning_rate: f64) {
        let l2 = self.tunables.l2;
        for (weight, gradient) in self.params.values_mut().zip(gradients.values()) {
            let gradient = (gradient + l2 * *weight).clamp(-GRADIENT_CLIP, GRADIENT_CLIP);
            *weight -= learning_rate * gradient;
        }
    }

    pub fn output_layer_stats(&self) -> OutputLayerStats {
        OutputLayerStats {
            bias: self.params.dense2_bias,
            mean_weight: self.params.dense2_weights.mean().unwrap_or(0.0),
        }
    }
}

/// Binary cross-entropy of a predicted cat probability against the true label.
pub fn binary_cross_entropy(probability: f64, label: Label) -> f64 {
    let p = probability.clamp(PROBABILITY_EPSILON, 1.0 - PROBABILITY_EPSILON);
    match label {
        Label::Cat => -p.ln(),
        Label::Dog => -(1.0 - p).ln(),
    }
}

// ReLU derivative: no gradient flows where the activation was clamped to zero.
fn mask_inactive(grad: &mut Array3<f64>, activation: &Array3<f64>) {
    Zip::from(grad).and(activation).for_each(|g, &a| {
        if a <= 0.0 {
            *g = 0.0;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn small_network() -> Network {
        Network::new(&NetworkConfig::new(8, 8, 2, 3, 2).with_hidden_size(6).with_seed(11)).unwrap()
    }

    #[test]
    fn initializes_weights_in_range_and_biases_at_zero() {
        let network = Network::new(&NetworkConfig::new(16, 16, 4, 3, 2)).unwrap();
        let p = network.parameters();
        assert_eq!(p.dense1_weights.dim(), (32, 144));
        assert_eq!(p.count(), 36 + 4 + 36 + 4 + 32 * 144 + 32 + 32 + 1);
        for weights in [&p.kernels1, &p.kernels2] {
            assert!(weights.iter().all(|w| w.abs() <= INIT_SCALE));
        }
        assert!(p.dense1_weights.iter().chain(&p.dense2_weights).all(|w| w.abs() <= INIT_SCALE));
        assert!(p.bias1.iter().chain(&p.bias2).chain(&p.dense1_bias).all(|&b| b == 0.0));
        assert_eq!(p.dense2_bias, 0.0);
    }

    #[test]
    fn trace_shapes_follow_dimensions() {
        let network = small_network();
        let trace = network.trace(&Image::synthetic(8, 8, Label::Cat)).unwrap();
        assert_eq!(trace.conv1.dim(), (2, 6, 6));
        assert_eq!(trace.conv2.dim(), (2, 4, 4));
        assert_eq!(trace.pooled.values.dim(), (2, 2, 2));
        assert_eq!(trace.pooled.argmax.len(), 8);
        assert!(trace.pooled.argmax.iter().all(|&i| i < 32));
        assert_eq!(trace.hidden.len(), 6);
        assert!(trace.conv1.iter().chain(&trace.conv2).all(|&v| v >= 0.0));
    }

    #[test]
    fn update_uses_pre_update_gradients_with_l2() {
        let mut network = small_network();
        let image = Image::synthetic(8, 8, Label::Dog);
        let before = network.parameters().clone();
        let trace = network.trace(&image).unwrap();
        let gradients = network.gradients(&image, &trace, Label::Cat);
        let l2 = network.tunables().l2;

        let loss = network.backward_and_update(&image, Label::Cat, 0.05).unwrap();
        assert_abs_diff_eq!(loss, -trace.probability.ln(), epsilon = 1e-12);
        let after = network.parameters().values();
        for ((old, new), g) in before.values().zip(after).zip(gradients.values()) {
            let expected = old - 0.05 * (g + l2 * old).clamp(-GRADIENT_CLIP, GRADIENT_CLIP);
            assert_abs_diff_eq!(new, expected, epsilon = 1e-15);
        }
    }

    #[test]
    fn gradients_are_clipped() {
        let mut network = small_network();
        network.set_tunables(Tunables { l2: 1e6, debug: false });
        let before = network.parameters().kernels1[[0, 0, 0]];
        network
            .backward_and_update(&Image::synthetic(8, 8, Label::Cat), Label::Cat, 0.01)
            .unwrap();
        let step = before - network.parameters().kernels1[[0, 0, 0]];
        assert_abs_diff_eq!(step, 0.01 * GRADIENT_CLIP * before.signum(), epsilon = 1e-12);
    }

    #[test]
    fn loss_is_finite_at_saturated_probabilities() {
        assert!(binary_cross_entropy(1.0, Label::Dog).is_finite());
        assert!(binary_cross_entropy(0.0, Label::Cat).is_finite());
        assert!(binary_cross_entropy(1.0, Label::Cat) >= 0.0);
        assert_abs_diff_eq!(
            binary_cross_entropy(0.5, Label::Dog),
            std::f64::consts::LN_2,
            epsilon = 1e-7
        );
    }

    #[test]
    fn output_stats_report_bias_and_mean_weight() {
        let mut network = small_network();
        network.parameters_mut().dense2_weights.fill(0.25);
        network.parameters_mut().dense2_bias = -1.5;
        assert_eq!(
            network.output_layer_stats(),
            OutputLayerStats {
                bias: -1.5,
                mean_weight: 0.25
            }
        );
    }

    #[test]
    fn saturated_logits_stay_inside_the_unit_interval() {
        let mut network = small_network();
        let image = Image::synthetic(8, 8, Label::Cat);
        for (bias, label) in [(40.0, Label::Dog), (-40.0, Label::Cat)] {
            network.parameters_mut().dense2_bias = bias;
            let p = network.forward(&image).unwrap();
            assert!(p > 0.0 && p < 1.0, "bias {bias} gave {p}");
            let loss = network.backward_and_update(&image, label, 0.01).unwrap();
            assert!(loss.is_finite());
        }
    }

    // Collects everything a fmt subscriber writes while it is the thread's default.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn logs_of_forward_pass(debug: bool) -> String {
        let mut network = small_network();
        network.set_tunables(Tunables {
            debug,
            ..Tunables::default()
        });

        let logs = CapturedLogs::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            network.forward(&Image::synthetic(8, 8, Label::Cat)).unwrap();
        });

        String::from_utf8(logs.0.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn debug_tunable_logs_hidden_activations() {
        let logs = logs_of_forward_pass(true);
        assert!(logs.contains("dense1 activations:"), "{logs}");
        assert!(logs.contains("DEBUG"), "{logs}");
        assert!(!logs_of_forward_pass(false).contains("dense1 activations:"));
    }

    #[test]
    fn rejects_mismatched_input() {
        let network = small_network();
        let err = network.forward(&Image::new(9, 8)).unwrap_err();
        assert!(matches!(
            err,
            CnnError::InputSize {
                expected: (8, 8),
                actual: (9, 8)
            }
        ));
    }
}
