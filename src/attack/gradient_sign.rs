//! Gradient-sign attacks under the L-infinity norm.
use super::{Attack, AttackParams};
use crate::error::{NNIFError, Result};
use crate::model::InputGradient;
use crate::NNIFFloat;
use log::trace;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

fn sign(v: NNIFFloat) -> NNIFFloat {
    if v > 0. {
        1.
    } else if v < 0. {
        -1.
    } else {
        0.
    }
}

/// Labels whose loss is followed and the direction to follow it in: towards the
/// target for targeted runs, away from the clean prediction otherwise.
fn attack_labels(
    model: &dyn InputGradient,
    x: ArrayView2<NNIFFloat>,
    params: &AttackParams,
) -> Result<(Array1<usize>, NNIFFloat)> {
    match &params.y_target {
        Some(targets) if targets.len() != x.nrows() => Err(NNIFError::model(format!(
            "{} targets for {} inputs",
            targets.len(),
            x.nrows()
        ))),
        Some(targets) => Ok((targets.clone(), -1.)),
        None => Ok((model.predict_class(x)?, 1.)),
    }
}

/// Sign of the input gradient of the loss, computed `batch_size` rows at a time.
fn gradient_sign(
    model: &dyn InputGradient,
    x: ArrayView2<NNIFFloat>,
    labels: ArrayView1<usize>,
    batch_size: usize,
) -> Result<Array2<NNIFFloat>> {
    let batch_size = batch_size.max(1);
    let mut out = Array2::zeros(x.raw_dim());
    for (i, (batch, mut out_batch)) in x
        .axis_chunks_iter(Axis(0), batch_size)
        .zip(out.axis_chunks_iter_mut(Axis(0), batch_size))
        .enumerate()
    {
        let start = i * batch_size;
        let grads = model.input_grad(batch, labels.slice(s![start..start + batch.nrows()]))?;
        out_batch.assign(&grads.mapv(sign));
    }
    Ok(out)
}

/// Single step of size `eps` along the gradient sign.
#[derive(Clone, Debug, Default)]
pub struct FastGradientSign;

impl Attack for FastGradientSign {
    fn generate(
        &self,
        model: &dyn InputGradient,
        x: ArrayView2<NNIFFloat>,
        params: &AttackParams,
    ) -> Result<Array2<NNIFFloat>> {
        let (labels, direction) = attack_labels(model, x, params)?;
        let step = gradient_sign(model, x, labels.view(), params.batch_size)?;
        let mut adv = &x + &(step * (direction * params.eps));
        adv.mapv_inplace(|v| params.clip(v));
        Ok(adv)
    }
}

/// Iterated gradient-sign steps of size `eps_iter`, projected back onto the
/// `eps` ball around the clean input after each step.
#[derive(Clone, Debug, Default)]
pub struct ProjectedGradient;

impl Attack for ProjectedGradient {
    fn generate(
        &self,
        model: &dyn InputGradient,
        x: ArrayView2<NNIFFloat>,
        params: &AttackParams,
    ) -> Result<Array2<NNIFFloat>> {
        let (labels, direction) = attack_labels(model, x, params)?;
        let mut adv = x.to_owned();
        for iter in 0..params.nb_iter {
            let step = gradient_sign(model, adv.view(), labels.view(), params.batch_size)?;
            Zip::from(&mut adv)
                .and(&x)
                .and(&step)
                .for_each(|a, &orig, &g| {
                    let eta = (*a + direction * params.eps_iter * g - orig)
                        .clamp(-params.eps, params.eps);
                    *a = params.clip(orig + eta);
                });
            trace!("pgd iteration {} done", iter);
        }
        Ok(adv)
    }
}
