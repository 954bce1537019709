//! Adversarial attack boundary and the adversarial-set cache.
//!
//! An attack perturbs a whole split at once; the perturbed inputs are then run
//! through the classifier again and the resulting predictions and embeddings are
//! persisted next to the inputs.
pub mod gradient_sign;

pub use gradient_sign::{FastGradientSign, ProjectedGradient};

use crate::error::{NNIFError, Result};
use crate::model::InputGradient;
use crate::predict::{self, Predictions};
use crate::store::{ArtifactKey, ArtifactStore};
use crate::NNIFFloat;
use enum_dispatch::enum_dispatch;
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackKind {
    DeepFool,
    Jsma,
    Cw,
    Fgsm,
    Pgd,
    Ead,
}

impl AttackKind {
    pub const ALL: [Self; 6] = [
        Self::DeepFool,
        Self::Jsma,
        Self::Cw,
        Self::Fgsm,
        Self::Pgd,
        Self::Ead,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::DeepFool => "deepfool",
            Self::Jsma => "jsma",
            Self::Cw => "cw",
            Self::Fgsm => "fgsm",
            Self::Pgd => "pgd",
            Self::Ead => "ead",
        }
    }

    /// Deepfool has no notion of a target class; all others are run targeted.
    pub const fn is_targeted(self) -> bool {
        !matches!(self, Self::DeepFool)
    }

    /// Attack hyperparameters used for every run of this kind. Every attack keeps
    /// its output inside the `[0, 1]` image domain.
    pub fn default_params(self) -> AttackParams {
        let base = AttackParams {
            clip: Some((0., 1.)),
            ..AttackParams::default()
        };
        match self {
            Self::DeepFool => base,
            Self::Jsma => AttackParams {
                theta: 1.0,
                gamma: 0.1,
                ..base
            },
            Self::Cw => AttackParams {
                batch_size: 125,
                confidence: 0.8,
                learning_rate: 0.01,
                initial_const: 0.1,
                ..base
            },
            Self::Fgsm => AttackParams { eps: 0.1, ..base },
            Self::Pgd => AttackParams {
                eps: 0.02,
                eps_iter: 0.002,
                nb_iter: 10,
                ..base
            },
            Self::Ead => AttackParams {
                batch_size: 125,
                confidence: 0.8,
                learning_rate: 0.01,
                initial_const: 0.1,
                decision_rule: Some(DecisionRule::L1),
                ..base
            },
        }
    }

    /// The attack implementation shipped with the crate, if any.
    ///
    /// # Errors
    /// For attacks that must be supplied by the caller.
    pub fn builtin(self) -> Result<AttackMethod> {
        match self {
            Self::Fgsm => Ok(FastGradientSign::default().into()),
            Self::Pgd => Ok(ProjectedGradient::default().into()),
            other => Err(NNIFError::config(format!(
                "no built-in implementation of the {} attack",
                other
            ))),
        }
    }
}

impl fmt::Display for AttackKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for AttackKind {
    type Err = NNIFError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                NNIFError::config(format!(
                    "attack {} is not supported, expected one of deepfool, jsma, cw, fgsm, pgd, ead",
                    s
                ))
            })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionRule {
    L1,
    EN,
}

/// Union of the hyperparameters of all supported attacks. Each attack reads the
/// fields it understands.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttackParams {
    pub clip: Option<(NNIFFloat, NNIFFloat)>,
    /// Target class per input row, set for targeted runs.
    pub y_target: Option<Array1<usize>>,
    pub eps: NNIFFloat,
    pub eps_iter: NNIFFloat,
    pub nb_iter: usize,
    pub theta: NNIFFloat,
    pub gamma: NNIFFloat,
    pub confidence: NNIFFloat,
    pub learning_rate: NNIFFloat,
    pub initial_const: NNIFFloat,
    pub decision_rule: Option<DecisionRule>,
    pub batch_size: usize,
}

impl Default for AttackParams {
    fn default() -> Self {
        Self {
            clip: None,
            y_target: None,
            eps: 0.3,
            eps_iter: 0.05,
            nb_iter: 10,
            theta: 1.0,
            gamma: 1.0,
            confidence: 0.,
            learning_rate: 0.005,
            initial_const: 0.01,
            decision_rule: None,
            batch_size: 125,
        }
    }
}

impl AttackParams {
    pub fn with_targets(mut self, targets: Array1<usize>) -> Self {
        self.y_target = Some(targets);
        self
    }

    pub fn clip(&self, value: NNIFFloat) -> NNIFFloat {
        self.clip.map_or(value, |(lo, hi)| value.clamp(lo, hi))
    }
}

#[enum_dispatch]
pub trait Attack {
    /// Perturbs every row of `x`. The output has the shape of `x` and row `i` is the
    /// adversarial counterpart of row `i`.
    ///
    /// # Errors
    fn generate(
        &self,
        model: &dyn InputGradient,
        x: ArrayView2<NNIFFloat>,
        params: &AttackParams,
    ) -> Result<Array2<NNIFFloat>>;
}

#[enum_dispatch(Attack)]
#[derive(Clone, Debug)]
pub enum AttackMethod {
    FastGradientSign,
    ProjectedGradient,
}

/// Uniformly random target classes, each different from the row's label.
///
/// # Errors
/// If fewer than two classes exist.
pub fn random_targets<R: Rng + ?Sized>(
    labels: ArrayView1<usize>,
    num_classes: usize,
    rng: &mut R,
) -> Result<Array1<usize>> {
    if num_classes < 2 {
        return Err(NNIFError::config(
            "targeted attacks need at least two classes",
        ));
    }
    Ok(labels.mapv(|label| {
        // draw from the other classes and skip over the label
        let draw = rng.gen_range(0..num_classes - 1);
        if draw >= label {
            draw + 1
        } else {
            draw
        }
    }))
}

/// Adversarial inputs of one split together with the model's view of them.
#[derive(Clone, Debug, PartialEq)]
pub struct AdversarialSet {
    pub inputs: Array2<NNIFFloat>,
    pub preds: Array1<usize>,
    pub embeddings: Array2<NNIFFloat>,
    pub targets: Option<Array1<usize>>,
}

impl AdversarialSet {
    pub fn len(&self) -> usize {
        self.preds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preds.is_empty()
    }
}

/// Generates and caches adversarial examples below an attack directory.
pub struct AttackRunner<'a, A> {
    attack: &'a A,
    kind: AttackKind,
    dir: ArtifactKey,
    batch_size: usize,
}

impl<'a, A: Attack> AttackRunner<'a, A> {
    pub fn new(attack: &'a A, kind: AttackKind, dir: ArtifactKey, batch_size: usize) -> Self {
        Self {
            attack,
            kind,
            dir,
            batch_size,
        }
    }

    fn key(&self, prefix: &str, split: &str, suffix: &str) -> ArtifactKey {
        self.dir.join(&format!("{}_{}_{}.json", prefix, split, suffix))
    }

    /// Loads the adversarial set of `split`, or attacks `x` and caches the result.
    /// For targeted attacks the targets are drawn from `rng`, each different from the
    /// true label in `labels`.
    ///
    /// # Errors
    pub fn load_or_generate<S, M, R>(
        &self,
        store: &mut S,
        split: &str,
        model: &M,
        x: ArrayView2<NNIFFloat>,
        labels: ArrayView1<usize>,
        rng: &mut R,
    ) -> Result<AdversarialSet>
    where
        S: ArtifactStore,
        M: InputGradient,
        R: Rng + ?Sized,
    {
        let inputs_key = self.key("X", split, "adv");
        let preds_key = self.key("x", split, "preds_adv");
        let features_key = self.key("x", split, "features_adv");
        let targets_key = self.key("y", split, "targets");

        if store.exists(&preds_key) {
            info!("loading {} adversarial {} set from {}", self.kind, split, self.dir);
            let set = AdversarialSet {
                inputs: store.load_json(&inputs_key)?,
                preds: store.load_json(&preds_key)?,
                embeddings: store.load_json(&features_key)?,
                targets: if self.kind.is_targeted() {
                    Some(store.load_json(&targets_key)?)
                } else {
                    None
                },
            };
            if set.inputs.nrows() != x.nrows() || set.preds.len() != x.nrows() {
                return Err(NNIFError::consistency(format!(
                    "cached adversarial {} set has {} rows, expected {}",
                    split,
                    set.preds.len(),
                    x.nrows()
                )));
            }
            return Ok(set);
        }

        let mut params = self.kind.default_params();
        let targets = if self.kind.is_targeted() {
            let targets = random_targets(labels, model.num_classes(), rng)?;
            params = params.with_targets(targets.clone());
            Some(targets)
        } else {
            None
        };
        info!(
            "attacking {} set ({} examples) with {}",
            split,
            x.nrows(),
            self.kind
        );
        let inputs = self.attack.generate(model, x, &params)?;
        if inputs.dim() != x.dim() {
            return Err(NNIFError::model(format!(
                "attack returned shape {:?} for input shape {:?}",
                inputs.dim(),
                x.dim()
            )));
        }
        let Predictions {
            classes: preds,
            embeddings,
        } = predict::evaluate(model, inputs.view(), self.batch_size)?;

        store.save_json(&inputs_key, &inputs)?;
        if let Some(targets) = &targets {
            store.save_json(&targets_key, targets)?;
        }
        store.save_json(&features_key, &embeddings)?;
        store.save_json(&preds_key, &preds)?;
        debug!("saved adversarial {} set under {}", split, self.dir);
        Ok(AdversarialSet {
            inputs,
            preds,
            embeddings,
            targets,
        })
    }
}
