use crate::error::{NNIFError, Result};
use crate::NNIFFloat;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Affine layer `y = W x + b`, with `W` stored as `(output_dim, input_dim)`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Dense {
    weights: Array2<NNIFFloat>,
    bias: Array1<NNIFFloat>,
}

impl Dense {
    /// # Errors
    /// If the bias length does not match the number of weight rows.
    pub fn new(weights: Array2<NNIFFloat>, bias: Array1<NNIFFloat>) -> Result<Self> {
        if weights.nrows() != bias.len() {
            return Err(NNIFError::model(format!(
                "dense layer with {} outputs given a bias of length {}",
                weights.nrows(),
                bias.len()
            )));
        }
        Ok(Self { weights, bias })
    }

    pub fn input_dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.bias.len()
    }

    pub fn weights(&self) -> ArrayView2<NNIFFloat> {
        self.weights.view()
    }

    pub fn bias(&self) -> ArrayView1<NNIFFloat> {
        self.bias.view()
    }

    /// Applies the layer to every row of `x`.
    ///
    /// # Errors
    /// If the rows of `x` have the wrong width.
    pub fn forward2(&self, x: ArrayView2<NNIFFloat>) -> Result<Array2<NNIFFloat>> {
        if x.ncols() != self.input_dim() {
            return Err(NNIFError::model(format!(
                "dense layer expects {} inputs, got {}",
                self.input_dim(),
                x.ncols()
            )));
        }
        Ok(x.dot(&self.weights.t()) + &self.bias)
    }
}

impl fmt::Display for Dense {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Dense {} -> {}", self.input_dim(), self.output_dim())
    }
}

pub fn relu2(x: &Array2<NNIFFloat>) -> Array2<NNIFFloat> {
    x.mapv(|v| if v.lt(&0.) { 0. } else { v })
}

/// Row-wise softmax, shifted by the row maximum for stability.
pub fn softmax2(logits: &Array2<NNIFFloat>) -> Array2<NNIFFloat> {
    let mut out = logits.clone();
    out.rows_mut().into_iter().for_each(|mut row| {
        let max = row.fold(NNIFFloat::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    });
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_forward2() {
        let dense = Dense::new(arr2(&[[1., 2.], [0., -1.]]), arr1(&[0.5, 0.])).unwrap();
        let out = dense.forward2(arr2(&[[1., 1.], [2., 0.]]).view()).unwrap();
        assert_eq!(out, arr2(&[[3.5, -1.], [2.5, 0.]]));
    }

    #[test]
    fn test_mismatched_shapes() {
        assert!(Dense::new(Array2::zeros((2, 3)), Array1::zeros(3)).is_err());
        let dense = Dense::new(Array2::zeros((2, 3)), Array1::zeros(2)).unwrap();
        assert!(dense.forward2(Array2::zeros((1, 2)).view()).is_err());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let probs = softmax2(&arr2(&[[1000., 1000.], [0., 3.], [-5., 2.]]));
        probs.rows().into_iter().for_each(|row| {
            assert_abs_diff_eq!(row.sum(), 1., epsilon = 1e-12);
        });
        assert_abs_diff_eq!(probs[[0, 0]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_relu() {
        assert_eq!(relu2(&arr2(&[[-1., 2.]])), arr2(&[[0., 2.]]));
    }
}
