//! Prediction cache: per-split predicted classes and embeddings.
use crate::error::{NNIFError, Result};
use crate::model::Classifier;
use crate::store::{ArtifactKey, ArtifactStore};
use crate::NNIFFloat;
use log::{debug, info};
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predictions {
    pub classes: Array1<usize>,
    pub embeddings: Array2<NNIFFloat>,
}

impl Predictions {
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn accuracy(&self, labels: ArrayView1<usize>) -> NNIFFloat {
        accuracy(self.classes.view(), labels)
    }
}

/// Fraction of `preds` equal to `labels`; zero for an empty split.
pub fn accuracy(preds: ArrayView1<usize>, labels: ArrayView1<usize>) -> NNIFFloat {
    if preds.is_empty() {
        return 0.;
    }
    let correct = preds
        .iter()
        .zip(labels.iter())
        .filter(|(p, y)| p == y)
        .count();
    correct as NNIFFloat / preds.len() as NNIFFloat
}

/// Runs the model over `inputs` in chunks of `batch_size` rows. The chunking only
/// bounds memory; results do not depend on it.
///
/// # Errors
/// If `batch_size` is zero or the model fails on any batch.
pub fn evaluate<M: Classifier + ?Sized>(
    model: &M,
    inputs: ArrayView2<NNIFFloat>,
    batch_size: usize,
) -> Result<Predictions> {
    if batch_size == 0 {
        return Err(NNIFError::config("batch_size must be positive"));
    }
    if inputs.nrows() == 0 {
        return Ok(Predictions {
            classes: Array1::zeros(0),
            embeddings: Array2::zeros((0, model.embedding_dim())),
        });
    }
    let mut classes = Vec::with_capacity(inputs.nrows());
    let mut embeddings = Vec::new();
    for batch in inputs.axis_chunks_iter(Axis(0), batch_size) {
        classes.extend(model.predict_class(batch)?);
        embeddings.push(model.embeddings(batch)?);
    }
    let views: Vec<_> = embeddings.iter().map(Array2::view).collect();
    Ok(Predictions {
        classes: Array1::from_vec(classes),
        embeddings: concatenate(Axis(0), &views)?,
    })
}

pub fn preds_key(dir: &ArtifactKey, split: &str) -> ArtifactKey {
    dir.join(&format!("x_{}_preds.json", split))
}

pub fn features_key(dir: &ArtifactKey, split: &str) -> ArtifactKey {
    dir.join(&format!("x_{}_features.json", split))
}

/// Loads the cached predictions of `split` or computes and persists them.
///
/// The predictions artifact is written after the embeddings and is the one whose
/// presence marks the split as done.
///
/// # Errors
pub fn load_or_evaluate<S: ArtifactStore, M: Classifier + ?Sized>(
    store: &mut S,
    dir: &ArtifactKey,
    split: &str,
    model: &M,
    inputs: ArrayView2<NNIFFloat>,
    batch_size: usize,
) -> Result<Predictions> {
    let preds_key = preds_key(dir, split);
    let features_key = features_key(dir, split);
    if store.exists(&preds_key) {
        info!("loading {} predictions from {}", split, preds_key);
        let preds = Predictions {
            classes: store.load_json(&preds_key)?,
            embeddings: store.load_json(&features_key)?,
        };
        if preds.classes.len() != preds.embeddings.nrows() {
            return Err(NNIFError::consistency(format!(
                "cached {} predictions ({}) and embeddings ({}) disagree in length",
                split,
                preds.classes.len(),
                preds.embeddings.nrows()
            )));
        }
        return Ok(preds);
    }
    info!("predicting {} set ({} examples)", split, inputs.nrows());
    let preds = evaluate(model, inputs, batch_size)?;
    store.save_json(&features_key, &preds.embeddings)?;
    store.save_json(&preds_key, &preds.classes)?;
    debug!("saved {} and {}", features_key, preds_key);
    Ok(preds)
}
