//! Run configuration.
//!
//! A `RunConfig` is built once (from a JSON file, the CLI, or code) and passed by
//! reference to every component. Nothing reads dataset or attack selection from
//! ambient state.
use crate::attack::AttackKind;
use crate::error::{NNIFError, Result};
use crate::store::ArtifactKey;
use crate::NNIFFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Evaluation subset the pipeline iterates over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetKind {
    #[default]
    Val,
    Test,
}

impl SetKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for SetKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for SetKind {
    type Err = NNIFError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "val" => Ok(Self::Val),
            "test" => Ok(Self::Test),
            other => Err(NNIFError::config(format!(
                "set {} is not supported, expected val or test",
                other
            ))),
        }
    }
}

/// Which labelling of an evaluation example is being explained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Case {
    /// Clean input labelled with the model's prediction.
    Pred,
    /// Adversarial input labelled with the model's adversarial prediction.
    Adv,
}

impl Case {
    pub const ALL: [Self; 2] = [Self::Pred, Self::Adv];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Pred => "pred",
            Self::Adv => "adv",
        }
    }

    /// Salt mixed into the recursion seed so both cases of one example draw
    /// independent batches.
    pub(crate) const fn seed_salt(self) -> u64 {
        match self {
            Self::Pred => 0x5052_4544,
            Self::Adv => 0x0041_4456,
        }
    }
}

impl fmt::Display for Case {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which examples of the evaluation set get influence scores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    /// Every example of the set, in local index order.
    All,
    /// Only examples the network classified correctly and the attack flipped.
    #[default]
    AttackFlipped,
}

/// Hyperparameters of the stochastic inverse-Hessian-vector-product recursion.
///
/// * `scale` divides the Hessian inside the recursion. It must exceed the largest
///   eigenvalue of the training-loss Hessian or the Neumann series diverges; larger
///   values are safer but converge more slowly.
/// * `damping` adds `scale * damping` to the Hessian diagonal, trading bias for
///   stability on non-convex losses. Use `0.` to target `H^{-1} v` exactly.
/// * `recursion_depth` is the number of terms of the series; the truncation bias
///   shrinks geometrically with it.
/// * `num_repeats` independent recursions are averaged; variance shrinks as
///   `1 / num_repeats`.
/// * `recursion_batch_size` training examples are drawn per Hessian-vector product.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApproxParams {
    pub scale: NNIFFloat,
    pub damping: NNIFFloat,
    pub num_repeats: usize,
    pub recursion_depth: usize,
    pub recursion_batch_size: usize,
}

impl Default for ApproxParams {
    fn default() -> Self {
        Self {
            scale: 200.,
            damping: 0.01,
            num_repeats: 5,
            recursion_depth: 49,
            recursion_batch_size: 200,
        }
    }
}

impl ApproxParams {
    /// # Errors
    /// If any parameter makes the recursion meaningless.
    pub fn validate(&self) -> Result<()> {
        if !(self.scale.is_finite() && self.scale > 0.) {
            return Err(NNIFError::config(format!(
                "scale must be positive and finite, got {}",
                self.scale
            )));
        }
        if !(0. ..1.).contains(&self.damping) {
            return Err(NNIFError::config(format!(
                "damping must lie in [0, 1), got {}",
                self.damping
            )));
        }
        if self.num_repeats == 0 || self.recursion_depth == 0 || self.recursion_batch_size == 0 {
            return Err(NNIFError::config(
                "num_repeats, recursion_depth and recursion_batch_size must be positive",
            ));
        }
        Ok(())
    }
}

/// Test gradients are taken one example at a time; training gradients in batches of
/// `train_batch_size`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluenceParams {
    pub train_batch_size: usize,
    pub approx: ApproxParams,
}

impl Default for InfluenceParams {
    fn default() -> Self {
        Self {
            train_batch_size: 200,
            approx: ApproxParams::default(),
        }
    }
}

impl InfluenceParams {
    /// Shallow recursion used over the training subset of the test set.
    pub fn shallow() -> Self {
        Self {
            approx: ApproxParams {
                recursion_depth: 5,
                ..ApproxParams::default()
            },
            ..Self::default()
        }
    }
}

const fn default_batch_size() -> usize {
    125
}

const fn default_test_train_subset() -> Option<usize> {
    Some(5000)
}

const fn default_seed() -> u64 {
    123_456_789
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub dataset: String,
    #[serde(default)]
    pub set: SetKind,
    pub attack: AttackKind,
    /// Directory holding the checkpoint and every cached artifact.
    /// Defaults to `<dataset>/trained_model`.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub selection: Selection,
    /// Influence parameters of the validation set.
    #[serde(default)]
    pub influence: InfluenceParams,
    /// Influence parameters of the test set.
    #[serde(default = "InfluenceParams::shallow")]
    pub test_influence: InfluenceParams,
    /// Number of training examples drawn once and reused as the training set when
    /// evaluating the test set. `None` uses the whole training set.
    #[serde(default = "default_test_train_subset")]
    pub test_train_subset: Option<usize>,
    #[serde(default)]
    pub class_names: Option<Vec<String>>,
}

impl RunConfig {
    pub fn new(dataset: &str, attack: AttackKind) -> Self {
        Self {
            dataset: dataset.to_string(),
            set: SetKind::default(),
            attack,
            checkpoint_dir: None,
            batch_size: default_batch_size(),
            seed: default_seed(),
            selection: Selection::default(),
            influence: InfluenceParams::default(),
            test_influence: InfluenceParams::shallow(),
            test_train_subset: default_test_train_subset(),
            class_names: None,
        }
    }

    pub fn with_set(mut self, set: SetKind) -> Self {
        self.set = set;
        self
    }

    pub fn with_checkpoint_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub const fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_influence(mut self, influence: InfluenceParams) -> Self {
        self.influence = influence;
        self
    }

    pub fn with_test_influence(mut self, influence: InfluenceParams) -> Self {
        self.test_influence = influence;
        self
    }

    pub const fn with_test_train_subset(mut self, size: Option<usize>) -> Self {
        self.test_train_subset = size;
        self
    }

    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        self.class_names = Some(names);
        self
    }

    /// # Errors
    /// If the file cannot be read, does not parse, or fails validation.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    pub fn validate(&self) -> Result<()> {
        if self.dataset.is_empty() {
            return Err(NNIFError::config("dataset identifier is empty"));
        }
        if self.batch_size == 0 {
            return Err(NNIFError::config("batch_size must be positive"));
        }
        if self.influence.train_batch_size == 0 || self.test_influence.train_batch_size == 0 {
            return Err(NNIFError::config("influence train_batch_size must be positive"));
        }
        if self.test_train_subset == Some(0) {
            return Err(NNIFError::config("test_train_subset must be positive"));
        }
        self.influence.approx.validate()?;
        self.test_influence.approx.validate()
    }

    /// Influence parameters of the configured evaluation set.
    pub const fn influence_params(&self) -> &InfluenceParams {
        match self.set {
            SetKind::Val => &self.influence,
            SetKind::Test => &self.test_influence,
        }
    }

    /// Size of the training subset for the configured evaluation set, if one is used.
    pub const fn train_subset(&self) -> Option<usize> {
        match self.set {
            SetKind::Val => None,
            SetKind::Test => self.test_train_subset,
        }
    }

    /// Every attack except deepfool is run targeted.
    pub const fn is_targeted(&self) -> bool {
        self.attack.is_targeted()
    }

    pub fn model_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| Path::new(&self.dataset).join("trained_model"))
    }

    /// `<attack>` or `<attack>_targeted`, relative to the model directory.
    pub fn attack_dir(&self) -> ArtifactKey {
        if self.is_targeted() {
            ArtifactKey::new(&format!("{}_targeted", self.attack))
        } else {
            ArtifactKey::new(self.attack.name())
        }
    }

    /// Directory of the per-sample artifacts of one example and case.
    pub fn sample_dir(&self, global_index: usize, case: Case) -> ArtifactKey {
        let dir = ArtifactKey::new(self.set.name())
            .join(&format!("{}_index_{}", self.set, global_index))
            .join(case.name());
        match case {
            Case::Pred => dir,
            Case::Adv => dir.join(self.attack.name()),
        }
    }

    /// Human readable label, using `class_names` when configured.
    pub fn class_label(&self, class: usize) -> String {
        self.class_names
            .as_ref()
            .and_then(|names| names.get(class).cloned())
            .unwrap_or_else(|| class.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_targeted_derived_from_attack() {
        assert!(!RunConfig::new("cifar10", AttackKind::DeepFool).is_targeted());
        assert!(RunConfig::new("cifar10", AttackKind::Cw).is_targeted());
        assert!(RunConfig::new("cifar10", AttackKind::Fgsm).is_targeted());
    }

    #[test]
    fn test_directory_layout() {
        let cfg = RunConfig::new("cifar10", AttackKind::Cw);
        assert_eq!(cfg.model_dir(), Path::new("cifar10").join("trained_model"));
        assert_eq!(cfg.attack_dir().to_string(), "cw_targeted");
        assert_eq!(
            cfg.sample_dir(42, Case::Pred).to_string(),
            "val/val_index_42/pred"
        );
        assert_eq!(
            cfg.sample_dir(42, Case::Adv).to_string(),
            "val/val_index_42/adv/cw"
        );

        let cfg = RunConfig::new("svhn", AttackKind::DeepFool)
            .with_set(SetKind::Test)
            .with_checkpoint_dir("/tmp/ckpt");
        assert_eq!(cfg.model_dir(), PathBuf::from("/tmp/ckpt"));
        assert_eq!(cfg.attack_dir().to_string(), "deepfool");
        assert_eq!(
            cfg.sample_dir(7, Case::Adv).to_string(),
            "test/test_index_7/adv/deepfool"
        );
    }

    #[test]
    fn test_json_defaults() {
        let cfg: RunConfig =
            serde_json::from_str(r#"{"dataset": "cifar10", "attack": "jsma"}"#).unwrap();
        assert_eq!(cfg.set, SetKind::Val);
        assert_eq!(cfg.batch_size, 125);
        assert_eq!(cfg.seed, 123_456_789);
        assert_eq!(cfg.selection, Selection::AttackFlipped);
        assert_eq!(cfg.influence, InfluenceParams::default());
        assert_eq!(cfg.test_influence.approx.recursion_depth, 5);
        assert_eq!(cfg.test_train_subset, Some(5000));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_per_set_influence_and_subset() {
        let cfg = RunConfig::new("cifar10", AttackKind::Fgsm);
        assert_eq!(cfg.influence_params().approx.recursion_depth, 49);
        assert_eq!(cfg.train_subset(), None);

        let cfg = cfg.with_set(SetKind::Test);
        assert_eq!(cfg.influence_params().approx.recursion_depth, 5);
        assert_eq!(cfg.train_subset(), Some(5000));
        assert_eq!(cfg.clone().with_test_train_subset(None).train_subset(), None);
        assert!(matches!(
            cfg.with_test_train_subset(Some(0)).validate(),
            Err(NNIFError::Config(_))
        ));

        let cfg: RunConfig = serde_json::from_str(
            r#"{"dataset": "svhn", "attack": "pgd", "set": "test", "test_train_subset": null,
                "test_influence": {"approx": {"recursion_depth": 7}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.train_subset(), None);
        assert_eq!(cfg.influence_params().approx.recursion_depth, 7);
        assert_eq!(cfg.influence_params().approx.scale, 200.);
    }

    #[test]
    fn test_unknown_attack_rejected() {
        let res: std::result::Result<RunConfig, _> =
            serde_json::from_str(r#"{"dataset": "cifar10", "attack": "boundary"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_invalid_approx_params() {
        let mut params = ApproxParams::default();
        params.scale = 0.;
        assert!(matches!(params.validate(), Err(NNIFError::Config(_))));
        let mut params = ApproxParams::default();
        params.recursion_depth = 0;
        assert!(params.validate().is_err());
        let mut params = ApproxParams::default();
        params.damping = 1.;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_class_label() {
        let cfg = RunConfig::new("cifar10", AttackKind::Fgsm)
            .with_class_names(vec!["airplane".to_string(), "car".to_string()]);
        assert_eq!(cfg.class_label(1), "car");
        assert_eq!(cfg.class_label(5), "5");
    }
}
