//! Model boundary.
//!
//! The pipeline never looks inside a classifier: it needs predictions and
//! embeddings (`Classifier`), first and second order information about the training
//! and test losses with respect to the parameters (`Objective`), and for the
//! gradient attacks the loss gradient with respect to the inputs (`InputGradient`).
pub mod dense;
pub mod softmax;

pub use dense::Dense;
pub use softmax::SoftmaxClassifier;

use crate::error::{NNIFError, Result};
use crate::NNIFFloat;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_stats::QuantileExt;

pub trait Classifier {
    fn input_dim(&self) -> usize;
    fn num_classes(&self) -> usize;
    /// Dimension of the penultimate-layer features used as the metric space.
    fn embedding_dim(&self) -> usize;

    /// # Errors
    fn logits(&self, x: ArrayView2<NNIFFloat>) -> Result<Array2<NNIFFloat>>;

    /// # Errors
    fn embeddings(&self, x: ArrayView2<NNIFFloat>) -> Result<Array2<NNIFFloat>>;

    /// # Errors
    /// If a row of logits has no maximum (e.g. contains NaN).
    fn predict_class(&self, x: ArrayView2<NNIFFloat>) -> Result<Array1<usize>> {
        self.logits(x)?
            .rows()
            .into_iter()
            .map(|row| {
                row.argmax()
                    .map_err(|e| NNIFError::model(format!("argmax of logits failed: {}", e)))
            })
            .collect()
    }
}

/// Differentiable training and test losses over a flat parameter vector.
///
/// The training loss is the one the model was fit with (including regularisation);
/// the test loss is the plain per-example loss whose change is being explained.
pub trait Objective {
    fn num_params(&self) -> usize;

    /// Per-example gradients of the training loss, one row per example.
    ///
    /// # Errors
    fn train_grads(
        &self,
        x: ArrayView2<NNIFFloat>,
        labels: ArrayView1<usize>,
    ) -> Result<Array2<NNIFFloat>>;

    /// Hessian of the mean training loss over the batch, applied to `v`.
    ///
    /// # Errors
    fn train_hvp(
        &self,
        x: ArrayView2<NNIFFloat>,
        labels: ArrayView1<usize>,
        v: ArrayView1<NNIFFloat>,
    ) -> Result<Array1<NNIFFloat>>;

    /// Gradient of the test loss of a single example.
    ///
    /// # Errors
    fn test_grad(&self, x: ArrayView1<NNIFFloat>, label: usize) -> Result<Array1<NNIFFloat>>;
}

pub trait InputGradient: Classifier {
    /// Gradient of the cross-entropy between each row's prediction and `labels`,
    /// with respect to the input row.
    ///
    /// # Errors
    fn input_grad(
        &self,
        x: ArrayView2<NNIFFloat>,
        labels: ArrayView1<usize>,
    ) -> Result<Array2<NNIFFloat>>;
}
