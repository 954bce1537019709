//! Stochastic Neumann-series approximation of inverse-Hessian-vector products.
use crate::config::ApproxParams;
use crate::error::{NNIFError, Result};
use crate::feeder::TrainingSet;
use crate::model::Objective;
use crate::NNIFFloat;
use log::trace;
use ndarray::{Array1, ArrayView1};
use rand::seq::index;
use rand::Rng;

/// Position of the first NaN or infinite entry.
pub(crate) fn first_non_finite(values: ArrayView1<NNIFFloat>) -> Option<usize> {
    values.iter().position(|v| !v.is_finite())
}

fn check_finite(values: ArrayView1<NNIFFloat>, what: &str, step: usize) -> Result<()> {
    match first_non_finite(values) {
        None => Ok(()),
        Some(_) => Err(NNIFError::numerical(format!(
            "{} is not finite after {} recursion steps, scale may be too small",
            what, step
        ))),
    }
}

/// One repeat of the recursion
///
/// `h_0 = v`, `h_{j+1} = v + (1 - damping) h_j - H_j h_j / scale`
///
/// where `H_j` is the training-loss Hessian on a fresh random batch. Each call to
/// `next` yields `h_j / scale`, the current estimate of `(H + scale * damping I)^{-1} v`.
/// The iterator ends after `recursion_depth` steps, or right after yielding an error.
pub struct LissaRecursion<'a, O: ?Sized, R> {
    objective: &'a O,
    train: &'a TrainingSet,
    params: &'a ApproxParams,
    v: ArrayView1<'a, NNIFFloat>,
    h: Array1<NNIFFloat>,
    step: usize,
    failed: bool,
    rng: R,
}

impl<'a, O: Objective + ?Sized, R: Rng> LissaRecursion<'a, O, R> {
    pub fn new(
        objective: &'a O,
        train: &'a TrainingSet,
        params: &'a ApproxParams,
        v: ArrayView1<'a, NNIFFloat>,
        rng: R,
    ) -> Self {
        Self {
            objective,
            train,
            params,
            v,
            h: v.to_owned(),
            step: 0,
            failed: false,
            rng,
        }
    }

    pub const fn step(&self) -> usize {
        self.step
    }

    fn sample_batch(&mut self) -> Vec<usize> {
        let n = self.train.len();
        if self.params.recursion_batch_size >= n {
            (0..n).collect()
        } else {
            index::sample(&mut self.rng, n, self.params.recursion_batch_size).into_vec()
        }
    }

    fn advance(&mut self) -> Result<Array1<NNIFFloat>> {
        let batch = self.sample_batch();
        let (x, labels) = self.train.select(&batch);
        let hvp = self
            .objective
            .train_hvp(x.view(), labels.view(), self.h.view())?;
        self.h = &self.v + &(&self.h * (1. - self.params.damping)) - &(hvp / self.params.scale);
        self.step += 1;
        check_finite(self.h.view(), "inverse hvp estimate", self.step)?;
        if self.step % 10 == 0 {
            trace!(
                "lissa step {}: |h| = {}",
                self.step,
                self.h.dot(&self.h).sqrt()
            );
        }
        Ok(&self.h / self.params.scale)
    }
}

impl<'a, O: Objective + ?Sized, R: Rng> Iterator for LissaRecursion<'a, O, R> {
    type Item = Result<Array1<NNIFFloat>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.step >= self.params.recursion_depth {
            return None;
        }
        let item = self.advance();
        self.failed = item.is_err();
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.failed {
            0
        } else {
            self.params.recursion_depth - self.step
        };
        (0, Some(remaining))
    }
}

/// Average of `num_repeats` independent recursions, each run to full depth.
///
/// # Errors
/// `Numerical` if any estimate becomes non-finite; model errors are propagated.
pub fn inverse_hvp<O: Objective + ?Sized, R: Rng>(
    objective: &O,
    train: &TrainingSet,
    params: &ApproxParams,
    v: ArrayView1<NNIFFloat>,
    rng: &mut R,
) -> Result<Array1<NNIFFloat>> {
    params.validate()?;
    if train.is_empty() {
        return Err(NNIFError::config("training set is empty"));
    }
    if let Some(i) = first_non_finite(v) {
        return Err(NNIFError::numerical(format!(
            "test gradient is not finite at parameter {}",
            i
        )));
    }
    let mut total = Array1::zeros(v.len());
    for repeat in 0..params.num_repeats {
        let mut last = None;
        for estimate in LissaRecursion::new(objective, train, params, v.view(), &mut *rng) {
            last = Some(estimate?);
        }
        let estimate = last.ok_or_else(|| NNIFError::numerical("recursion produced no estimate"))?;
        trace!("lissa repeat {} finished", repeat);
        total += &estimate;
    }
    Ok(total / params.num_repeats as NNIFFloat)
}
