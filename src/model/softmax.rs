//! Reference classifier: a frozen dense+ReLU feature extractor followed by a
//! trainable softmax head.
//!
//! Influence is taken with respect to the head parameters only, laid out as the
//! row-major head weights `(num_classes, embedding_dim)` followed by the head bias.
//! The training loss is label-smoothed cross-entropy plus `weight_decay / 2` times
//! the squared norm of the head weights (biases are not decayed); the test loss is
//! the label-smoothed cross-entropy alone.
use super::dense::{relu2, softmax2, Dense};
use super::{Classifier, InputGradient, Objective};
use crate::error::{NNIFError, Result};
use crate::NNIFFloat;
use ndarray::{s, Array, Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SoftmaxClassifier {
    features: Dense,
    head: Dense,
    #[serde(default)]
    weight_decay: NNIFFloat,
    #[serde(default)]
    label_smoothing: NNIFFloat,
}

impl SoftmaxClassifier {
    /// # Errors
    /// If the head does not consume the feature layer's output.
    pub fn new(features: Dense, head: Dense) -> Result<Self> {
        if features.output_dim() != head.input_dim() {
            return Err(NNIFError::model(format!(
                "head expects {} features but the feature layer produces {}",
                head.input_dim(),
                features.output_dim()
            )));
        }
        Ok(Self {
            features,
            head,
            weight_decay: 0.,
            label_smoothing: 0.,
        })
    }

    /// Gaussian initialisation scaled by `1 / sqrt(fan_in)`.
    ///
    /// # Errors
    pub fn random<R: Rng>(
        input_dim: usize,
        embedding_dim: usize,
        num_classes: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let features = Dense::new(
            Array2::<NNIFFloat>::random_using((embedding_dim, input_dim), StandardNormal, rng)
                / (input_dim as NNIFFloat).sqrt(),
            Array1::zeros(embedding_dim),
        )?;
        let head = Dense::new(
            Array2::<NNIFFloat>::random_using((num_classes, embedding_dim), StandardNormal, rng)
                / (embedding_dim as NNIFFloat).sqrt(),
            Array1::zeros(num_classes),
        )?;
        Self::new(features, head)
    }

    /// Reads a JSON checkpoint.
    ///
    /// # Errors
    /// `MissingCheckpoint` if the file does not exist.
    pub fn load_checkpoint(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(NNIFError::MissingCheckpoint(path.display().to_string()));
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub const fn with_weight_decay(mut self, weight_decay: NNIFFloat) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub const fn with_label_smoothing(mut self, label_smoothing: NNIFFloat) -> Self {
        self.label_smoothing = label_smoothing;
        self
    }

    pub const fn features(&self) -> &Dense {
        &self.features
    }

    pub const fn head(&self) -> &Dense {
        &self.head
    }

    /// Flat head parameters in the layout used by `Objective`.
    pub fn head_params(&self) -> Array1<NNIFFloat> {
        self.head
            .weights()
            .iter()
            .chain(self.head.bias().iter())
            .copied()
            .collect()
    }

    /// Copy of the model with the head replaced by a flat parameter vector.
    ///
    /// # Errors
    pub fn with_head_params(&self, theta: ArrayView1<NNIFFloat>) -> Result<Self> {
        let (weights, bias) = self.split_params(theta)?;
        Ok(Self {
            features: self.features.clone(),
            head: Dense::new(weights, bias)?,
            weight_decay: self.weight_decay,
            label_smoothing: self.label_smoothing,
        })
    }

    /// Mean training loss over the batch.
    ///
    /// # Errors
    pub fn train_loss(
        &self,
        x: ArrayView2<NNIFFloat>,
        labels: ArrayView1<usize>,
    ) -> Result<NNIFFloat> {
        self.check_batch(x, labels)?;
        let probs = self.probabilities(x)?;
        let targets = self.targets(labels, self.label_smoothing)?;
        let n = x.nrows() as NNIFFloat;
        let ce = -(&targets * &probs.mapv(NNIFFloat::ln)).sum() / n;
        let decay = 0.5 * self.weight_decay * self.head.weights().mapv(|w| w * w).sum();
        Ok(ce + decay)
    }

    fn split_params(
        &self,
        theta: ArrayView1<NNIFFloat>,
    ) -> Result<(Array2<NNIFFloat>, Array1<NNIFFloat>)> {
        if theta.len() != self.num_params() {
            return Err(NNIFError::model(format!(
                "expected {} parameters, got {}",
                self.num_params(),
                theta.len()
            )));
        }
        let split = self.num_classes() * self.embedding_dim();
        let weights = theta
            .slice(s![..split])
            .to_owned()
            .into_shape((self.num_classes(), self.embedding_dim()))?;
        let bias = theta.slice(s![split..]).to_owned();
        Ok((weights, bias))
    }

    fn probabilities(&self, x: ArrayView2<NNIFFloat>) -> Result<Array2<NNIFFloat>> {
        Ok(softmax2(&self.logits(x)?))
    }

    /// Label-smoothed target distribution: `(1 - s) * onehot + s / C`.
    fn targets(&self, labels: ArrayView1<usize>, smoothing: NNIFFloat) -> Result<Array2<NNIFFloat>> {
        let num_classes = self.num_classes();
        let mut targets = Array2::from_elem(
            (labels.len(), num_classes),
            smoothing / num_classes as NNIFFloat,
        );
        for (i, &label) in labels.iter().enumerate() {
            if label >= num_classes {
                return Err(NNIFError::model(format!(
                    "label {} out of range for {} classes",
                    label, num_classes
                )));
            }
            targets[[i, label]] += 1. - smoothing;
        }
        Ok(targets)
    }

    fn check_batch(&self, x: ArrayView2<NNIFFloat>, labels: ArrayView1<usize>) -> Result<()> {
        if x.nrows() != labels.len() {
            return Err(NNIFError::model(format!(
                "{} inputs given with {} labels",
                x.nrows(),
                labels.len()
            )));
        }
        if x.nrows() == 0 {
            return Err(NNIFError::model("empty batch"));
        }
        Ok(())
    }

    /// Flattens a gradient with respect to the logits into parameter space.
    fn logit_grad_to_params(
        &self,
        logit_grad: ArrayView1<NNIFFloat>,
        embedding: ArrayView1<NNIFFloat>,
        mut out: ArrayViewMut1<NNIFFloat>,
        weight_decay: NNIFFloat,
    ) {
        let dim = self.embedding_dim();
        let num_classes = self.num_classes();
        for k in 0..num_classes {
            let mut block = out.slice_mut(s![k * dim..(k + 1) * dim]);
            block.assign(&embedding);
            block *= logit_grad[k];
            if weight_decay != 0. {
                block.scaled_add(weight_decay, &self.head.weights().row(k));
            }
        }
        out.slice_mut(s![num_classes * dim..]).assign(&logit_grad);
    }
}

impl Classifier for SoftmaxClassifier {
    fn input_dim(&self) -> usize {
        self.features.input_dim()
    }

    fn num_classes(&self) -> usize {
        self.head.output_dim()
    }

    fn embedding_dim(&self) -> usize {
        self.features.output_dim()
    }

    fn logits(&self, x: ArrayView2<NNIFFloat>) -> Result<Array2<NNIFFloat>> {
        self.head.forward2(self.embeddings(x)?.view())
    }

    fn embeddings(&self, x: ArrayView2<NNIFFloat>) -> Result<Array2<NNIFFloat>> {
        Ok(relu2(&self.features.forward2(x)?))
    }
}

impl Objective for SoftmaxClassifier {
    fn num_params(&self) -> usize {
        self.num_classes() * (self.embedding_dim() + 1)
    }

    fn train_grads(
        &self,
        x: ArrayView2<NNIFFloat>,
        labels: ArrayView1<usize>,
    ) -> Result<Array2<NNIFFloat>> {
        self.check_batch(x, labels)?;
        let embeddings = self.embeddings(x)?;
        let logit_grads =
            softmax2(&self.head.forward2(embeddings.view())?) - self.targets(labels, self.label_smoothing)?;
        let mut grads = Array2::zeros((x.nrows(), self.num_params()));
        grads
            .rows_mut()
            .into_iter()
            .zip(logit_grads.rows())
            .zip(embeddings.rows())
            .for_each(|((row, g), h)| self.logit_grad_to_params(g, h, row, self.weight_decay));
        Ok(grads)
    }

    fn train_hvp(
        &self,
        x: ArrayView2<NNIFFloat>,
        labels: ArrayView1<usize>,
        v: ArrayView1<NNIFFloat>,
    ) -> Result<Array1<NNIFFloat>> {
        self.check_batch(x, labels)?;
        let (v_weights, v_bias) = self.split_params(v)?;
        let embeddings = self.embeddings(x)?;
        let probs = softmax2(&self.head.forward2(embeddings.view())?);

        // Directional derivative of the logits, pushed through the softmax
        // cross-entropy Hessian diag(p) - p p^T (independent of the targets).
        let d_logits = embeddings.dot(&v_weights.t()) + &v_bias;
        let p_d = &probs * &d_logits;
        let inner = p_d.sum_axis(Axis(1)).insert_axis(Axis(1));
        let u = &p_d - &(&probs * &inner);

        let n = x.nrows() as NNIFFloat;
        let hv_weights = u.t().dot(&embeddings) / n + &(&v_weights * self.weight_decay);
        let hv_bias = u.sum_axis(Axis(0)) / n;
        Ok(hv_weights.iter().chain(hv_bias.iter()).copied().collect())
    }

    fn test_grad(&self, x: ArrayView1<NNIFFloat>, label: usize) -> Result<Array1<NNIFFloat>> {
        let x = x.insert_axis(Axis(0));
        let labels = Array1::from_elem(1, label);
        let embeddings = self.embeddings(x)?;
        let logit_grads = softmax2(&self.head.forward2(embeddings.view())?)
            - self.targets(labels.view(), self.label_smoothing)?;
        let mut grad = Array::zeros(self.num_params());
        self.logit_grad_to_params(logit_grads.row(0), embeddings.row(0), grad.view_mut(), 0.);
        Ok(grad)
    }
}

impl InputGradient for SoftmaxClassifier {
    fn input_grad(
        &self,
        x: ArrayView2<NNIFFloat>,
        labels: ArrayView1<usize>,
    ) -> Result<Array2<NNIFFloat>> {
        self.check_batch(x, labels)?;
        let pre_activations = self.features.forward2(x)?;
        let embeddings = relu2(&pre_activations);
        let logit_grads =
            softmax2(&self.head.forward2(embeddings.view())?) - self.targets(labels, 0.)?;
        let active = pre_activations.mapv(|a| if a > 0. { 1. } else { 0. });
        let embedding_grads = logit_grads.dot(&self.head.weights()) * active;
        Ok(embedding_grads.dot(&self.features.weights()))
    }
}

impl fmt::Display for SoftmaxClassifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Input {} => {} => ReLU => {} => Softmax", self.input_dim(), self.features, self.head)
    }
}
