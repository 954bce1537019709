//! Influence of up-weighting each training example on one test example's loss.
pub mod lissa;

pub use lissa::LissaRecursion;

use crate::config::InfluenceParams;
use crate::error::{NNIFError, Result};
use crate::feeder::TrainingSet;
use crate::model::Objective;
use crate::NNIFFloat;
use log::debug;
use ndarray::{s, Array1, ArrayView1, Axis};
use rand::Rng;

/// Stateless over its inputs: every call only reads the objective and training set.
pub struct InfluenceEstimator<'a, O: ?Sized> {
    objective: &'a O,
    train: &'a TrainingSet,
    params: &'a InfluenceParams,
}

impl<'a, O: Objective + ?Sized> InfluenceEstimator<'a, O> {
    /// # Errors
    /// If the parameters are invalid or the training set is empty.
    pub fn new(objective: &'a O, train: &'a TrainingSet, params: &'a InfluenceParams) -> Result<Self> {
        params.approx.validate()?;
        if params.train_batch_size == 0 {
            return Err(NNIFError::config("train_batch_size must be positive"));
        }
        if train.is_empty() {
            return Err(NNIFError::config("training set is empty"));
        }
        Ok(Self {
            objective,
            train,
            params,
        })
    }

    /// Approximates `H^{-1} v` for the training-loss Hessian `H`.
    ///
    /// # Errors
    pub fn inverse_hvp<R: Rng>(&self, v: ArrayView1<NNIFFloat>, rng: &mut R) -> Result<Array1<NNIFFloat>> {
        if v.len() != self.objective.num_params() {
            return Err(NNIFError::model(format!(
                "vector of length {} for {} parameters",
                v.len(),
                self.objective.num_params()
            )));
        }
        lissa::inverse_hvp(self.objective, self.train, &self.params.approx, v, rng)
    }

    /// `-(1/N) grad_i . ihvp` for every training example `i`, in training order.
    ///
    /// # Errors
    /// `Numerical` if a score is not finite.
    pub fn upweight_scores(&self, ihvp: ArrayView1<NNIFFloat>) -> Result<Array1<NNIFFloat>> {
        let n = self.train.len();
        let mut scores = Array1::zeros(n);
        let batch_size = self.params.train_batch_size;
        for (i, (x, labels)) in self
            .train
            .inputs()
            .axis_chunks_iter(Axis(0), batch_size)
            .zip(self.train.labels().axis_chunks_iter(Axis(0), batch_size))
            .enumerate()
        {
            let start = i * batch_size;
            let grads = self.objective.train_grads(x, labels)?;
            scores
                .slice_mut(s![start..start + x.nrows()])
                .assign(&(grads.dot(&ihvp) / -(n as NNIFFloat)));
        }
        if let Some(i) = lissa::first_non_finite(scores.view()) {
            return Err(NNIFError::numerical(format!(
                "influence score of training example {} is not finite",
                self.train.global_inds()[i]
            )));
        }
        Ok(scores)
    }

    /// Influence score of every training example on the loss of `(x, label)`.
    ///
    /// # Errors
    pub fn score<R: Rng>(
        &self,
        x: ArrayView1<NNIFFloat>,
        label: usize,
        rng: &mut R,
    ) -> Result<Array1<NNIFFloat>> {
        let v = self.objective.test_grad(x, label)?;
        let ihvp = self.inverse_hvp(v.view(), rng)?;
        debug!("inverse hvp norm {:.6}", ihvp.dot(&ihvp).sqrt());
        self.upweight_scores(ihvp.view())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::ApproxParams;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array2, ArrayView2};
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    /// Least squares on two weights: `0.5 (w . x - y)^2` per example.
    struct LeastSquares {
        w: Array1<NNIFFloat>,
    }

    impl Objective for LeastSquares {
        fn num_params(&self) -> usize {
            2
        }

        fn train_grads(&self, x: ArrayView2<NNIFFloat>, labels: ArrayView1<usize>) -> Result<Array2<NNIFFloat>> {
            let residuals = x.dot(&self.w) - labels.mapv(|y| y as NNIFFloat);
            Ok(&x * &residuals.insert_axis(Axis(1)))
        }

        fn train_hvp(
            &self,
            x: ArrayView2<NNIFFloat>,
            _labels: ArrayView1<usize>,
            v: ArrayView1<NNIFFloat>,
        ) -> Result<Array1<NNIFFloat>> {
            Ok(x.t().dot(&x.dot(&v)) / x.nrows() as NNIFFloat)
        }

        fn test_grad(&self, x: ArrayView1<NNIFFloat>, label: usize) -> Result<Array1<NNIFFloat>> {
            Ok(&x * (x.dot(&self.w) - label as NNIFFloat))
        }
    }

    fn setup() -> (LeastSquares, TrainingSet) {
        let x = Array2::from_shape_fn((10, 2), |(i, j)| {
            if j == 0 {
                1. + i as NNIFFloat / 10.
            } else {
                ((i * 3) % 7) as NNIFFloat / 7. - 0.5
            }
        });
        let labels = Array1::from_shape_fn(10, |i| i % 3);
        let train = TrainingSet::new(x, labels, (100..110).collect()).unwrap();
        (LeastSquares { w: arr1(&[0.3, -0.2]) }, train)
    }

    fn closed_form_inverse(train: &TrainingSet, v: &Array1<NNIFFloat>) -> Array1<NNIFFloat> {
        let x = train.inputs();
        let h = x.t().dot(&x) / x.nrows() as NNIFFloat;
        let det = h[[0, 0]] * h[[1, 1]] - h[[0, 1]] * h[[1, 0]];
        arr1(&[
            (h[[1, 1]] * v[0] - h[[0, 1]] * v[1]) / det,
            (h[[0, 0]] * v[1] - h[[1, 0]] * v[0]) / det,
        ])
    }

    fn params(depth: usize, repeats: usize, batch: usize) -> InfluenceParams {
        InfluenceParams {
            train_batch_size: 3,
            approx: ApproxParams {
                scale: 5.,
                damping: 0.,
                num_repeats: repeats,
                recursion_depth: depth,
                recursion_batch_size: batch,
            },
        }
    }

    #[test]
    fn test_full_batch_converges_to_closed_form() {
        let (objective, train) = setup();
        let v = arr1(&[1., 2.]);
        let expected = closed_form_inverse(&train, &v);
        let mut rng = Pcg64::seed_from_u64(1);

        let short = params(20, 1, 10);
        let long = params(3000, 1, 10);
        let short_err = {
            let est = InfluenceEstimator::new(&objective, &train, &short).unwrap();
            let got = est.inverse_hvp(v.view(), &mut rng).unwrap();
            (&got - &expected).mapv(NNIFFloat::abs).sum()
        };
        let est = InfluenceEstimator::new(&objective, &train, &long).unwrap();
        let got = est.inverse_hvp(v.view(), &mut rng).unwrap();
        for (g, e) in got.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(g, e, epsilon = 1e-6);
        }
        assert!(short_err > 1e-6);
    }

    #[test]
    fn test_stochastic_estimate_approaches_closed_form() {
        let (objective, train) = setup();
        let v = arr1(&[1., 2.]);
        let expected = closed_form_inverse(&train, &v);
        let rel_err = |depth: usize, seed: u64| {
            let p = params(depth, 20, 5);
            let est = InfluenceEstimator::new(&objective, &train, &p).unwrap();
            let got = est.inverse_hvp(v.view(), &mut Pcg64::seed_from_u64(seed)).unwrap();
            (&got - &expected).mapv(NNIFFloat::abs).sum() / expected.mapv(NNIFFloat::abs).sum()
        };
        let short = rel_err(20, 2);
        let long = rel_err(2000, 2);
        assert!(long < 0.25, "relative error {}", long);
        assert!(long < short, "depth 2000: {}, depth 20: {}", long, short);
    }

    #[test]
    fn test_non_finite_inputs_are_reported_by_stage() {
        let (objective, train) = setup();
        let p = params(5, 1, 4);
        let est = InfluenceEstimator::new(&objective, &train, &p).unwrap();

        let res = est.upweight_scores(arr1(&[NNIFFloat::NAN, 0.]).view());
        match res {
            Err(NNIFError::Numerical(msg)) => {
                assert!(msg.contains("influence score of training example 100"), "{}", msg);
                assert!(!msg.contains("recursion"), "{}", msg);
            }
            other => panic!("unexpected {:?}", other),
        }

        let res = est.score(arr1(&[NNIFFloat::INFINITY, 0.]).view(), 1, &mut Pcg64::seed_from_u64(7));
        match res {
            Err(NNIFError::Numerical(msg)) => {
                assert!(msg.starts_with("test gradient"), "{}", msg);
                assert!(!msg.contains("recursion"), "{}", msg);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scores_match_closed_form_influence() {
        let (objective, train) = setup();
        let p = params(3000, 1, 10);
        let est = InfluenceEstimator::new(&objective, &train, &p).unwrap();
        let x_test = arr1(&[1.2, 0.1]);
        let scores = est.score(x_test.view(), 2, &mut Pcg64::seed_from_u64(3)).unwrap();
        assert_eq!(scores.len(), 10);

        let v = objective.test_grad(x_test.view(), 2).unwrap();
        let ihvp = closed_form_inverse(&train, &v);
        let grads = objective.train_grads(train.inputs(), train.labels()).unwrap();
        let expected = grads.dot(&ihvp) / -10.;
        for (s, e) in scores.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(s, e, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let (objective, train) = setup();
        let p = params(50, 3, 4);
        let est = InfluenceEstimator::new(&objective, &train, &p).unwrap();
        let x_test = arr1(&[0.7, -0.3]);
        let a = est.score(x_test.view(), 1, &mut Pcg64::seed_from_u64(9)).unwrap();
        let b = est.score(x_test.view(), 1, &mut Pcg64::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_divergence_is_fatal() {
        let (objective, train) = setup();
        let mut p = params(5000, 1, 10);
        p.approx.scale = 0.1;
        let est = InfluenceEstimator::new(&objective, &train, &p).unwrap();
        let res = est.inverse_hvp(arr1(&[1., 2.]).view(), &mut Pcg64::seed_from_u64(4));
        assert!(matches!(res, Err(NNIFError::Numerical(_))));
    }

    #[test]
    fn test_iterator_yields_depth_estimates() {
        let (objective, train) = setup();
        let p = params(7, 1, 4);
        let v = arr1(&[1., 0.]);
        let recursion = LissaRecursion::new(&objective, &train, &p.approx, v.view(), Pcg64::seed_from_u64(5));
        assert_eq!(recursion.size_hint(), (0, Some(7)));
        let estimates: Vec<_> = recursion.collect::<Result<_>>().unwrap();
        assert_eq!(estimates.len(), 7);
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let (objective, train) = setup();
        let p = params(5, 1, 4);
        let est = InfluenceEstimator::new(&objective, &train, &p).unwrap();
        let res = est.inverse_hvp(arr1(&[1., 2., 3.]).view(), &mut Pcg64::seed_from_u64(6));
        assert!(matches!(res, Err(NNIFError::Model(_))));
    }
}
