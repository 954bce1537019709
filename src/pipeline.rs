//! Orchestration of the whole analysis.
//!
//! The pipeline caches predictions for every split, runs the attack on the
//! validation and test splits, records who succeeded, and then walks the selected
//! evaluation examples in local-index order. Each example is processed twice, once
//! labelled by the clean prediction and once by the adversarial prediction, and each
//! (example, case) pair moves through
//!
//! `Pending -> Scored -> Ranked -> Persisted`
//!
//! Presence of the scores artifact sends a pair straight to `Persisted`. Since the
//! scores are the last artifact written for a pair, an interrupted run leaves pairs
//! either complete or to be redone from scratch.
use crate::attack::{Attack, AttackRunner};
use crate::bookkeeping::{Bookkeeping, EvaluationRecord};
use crate::config::{Case, RunConfig, SetKind};
use crate::correlate::{Correlation, LabelTransition, Summary};
use crate::error::{NNIFError, Result};
use crate::feeder::{ExampleSource, Feeder, TrainingSet};
use crate::influence::InfluenceEstimator;
use crate::model::{InputGradient, Objective};
use crate::neighbors::{NeighborIndex, NeighborRanking};
use crate::predict;
use crate::store::{ArtifactKey, ArtifactStore};
use crate::NNIFFloat;
use log::{debug, info};
use ndarray::{Array1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Mixes `parts` into `seed`; used so every split and every (example, case) pair
/// draws from its own reproducible stream.
fn derive_seed(seed: u64, parts: &[u64]) -> u64 {
    parts.iter().fold(seed, |acc, &part| {
        acc.rotate_left(17) ^ part.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    })
}

const TRAIN_SUBSET_FILE: &str = "train_mini_indices.json";
/// Keeps the subset stream apart from the per-split attack streams.
const TRAIN_SUBSET_SALT: u64 = 0x7472_6169_6e;

enum SampleState {
    Pending,
    Scored(Array1<NNIFFloat>),
    Ranked(Array1<NNIFFloat>, Box<Correlation>),
    Persisted,
}

impl fmt::Display for SampleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Scored(_) => "scored",
            Self::Ranked(..) => "ranked",
            Self::Persisted => "persisted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub train: NNIFFloat,
    pub val: NNIFFloat,
    pub test: NNIFFloat,
    pub val_adv: NNIFFloat,
    pub test_adv: NNIFFloat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleOutcome {
    pub local_index: usize,
    pub global_index: usize,
    pub case: Case,
    /// False if the scores were already present and nothing was done.
    pub computed: bool,
    pub summary: Option<Summary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub set: SetKind,
    pub accuracy: AccuracyReport,
    pub val_attack_rate: Option<NNIFFloat>,
    pub test_attack_rate: Option<NNIFFloat>,
    pub outcomes: Vec<SampleOutcome>,
}

impl PipelineReport {
    pub fn attack_rate(&self) -> Option<NNIFFloat> {
        match self.set {
            SetKind::Val => self.val_attack_rate,
            SetKind::Test => self.test_attack_rate,
        }
    }

    pub fn num_computed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.computed).count()
    }

    pub fn num_skipped(&self) -> usize {
        self.outcomes.len() - self.num_computed()
    }
}

pub struct Pipeline<'a, S, M, F, A> {
    config: &'a RunConfig,
    store: S,
    model: &'a M,
    feeder: &'a F,
    attack: &'a A,
}

impl<'a, S, M, F, A> Pipeline<'a, S, M, F, A>
where
    S: ArtifactStore,
    M: InputGradient + Objective,
    F: Feeder,
    A: Attack,
{
    /// # Errors
    /// If the configuration is invalid or the model and feeder disagree on the
    /// number of classes.
    pub fn new(config: &'a RunConfig, store: S, model: &'a M, feeder: &'a F, attack: &'a A) -> Result<Self> {
        config.validate()?;
        if model.num_classes() != feeder.num_classes() {
            return Err(NNIFError::config(format!(
                "model predicts {} classes but the dataset has {}",
                model.num_classes(),
                feeder.num_classes()
            )));
        }
        Ok(Self {
            config,
            store,
            model,
            feeder,
            attack,
        })
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// # Errors
    /// Configuration, consistency, numerical, model and I/O errors are all fatal.
    pub fn run(&mut self) -> Result<PipelineReport> {
        let cfg = self.config;
        let root = ArtifactKey::new("");
        info!(
            "running on the {} set of {} with the {} attack",
            cfg.set,
            cfg.dataset,
            cfg.attack
        );

        let train = self.feeder.training_set()?;
        let (train, train_split) = match cfg.train_subset() {
            Some(size) => (self.train_subset(&train, size)?, "train_mini"),
            None => (train, "train"),
        };
        let (val_x, val_y) = self.feeder.eval_split(SetKind::Val)?;
        let (test_x, test_y) = self.feeder.eval_split(SetKind::Test)?;

        let train_preds =
            predict::load_or_evaluate(&mut self.store, &root, train_split, self.model, train.inputs(), cfg.batch_size)?;
        let val_preds =
            predict::load_or_evaluate(&mut self.store, &root, "val", self.model, val_x.view(), cfg.batch_size)?;
        let test_preds =
            predict::load_or_evaluate(&mut self.store, &root, "test", self.model, test_x.view(), cfg.batch_size)?;

        let runner = AttackRunner::new(self.attack, cfg.attack, cfg.attack_dir(), cfg.batch_size);
        let val_adv = runner.load_or_generate(
            &mut self.store,
            SetKind::Val.name(),
            self.model,
            val_x.view(),
            val_y.view(),
            &mut StdRng::seed_from_u64(derive_seed(cfg.seed, &[SetKind::Val as u64])),
        )?;
        let test_adv = runner.load_or_generate(
            &mut self.store,
            SetKind::Test.name(),
            self.model,
            test_x.view(),
            test_y.view(),
            &mut StdRng::seed_from_u64(derive_seed(cfg.seed, &[SetKind::Test as u64])),
        )?;

        let accuracy = AccuracyReport {
            train: train_preds.accuracy(train.labels()),
            val: val_preds.accuracy(val_y.view()),
            test: test_preds.accuracy(test_y.view()),
            val_adv: predict::accuracy(val_adv.preds.view(), val_y.view()),
            test_adv: predict::accuracy(test_adv.preds.view(), test_y.view()),
        };
        info!(
            "train set acc: {}, validation set acc: {}, test set acc: {}",
            accuracy.train, accuracy.val, accuracy.test
        );
        info!(
            "adversarial ({}) validation set acc: {}, adversarial ({}) test set acc: {}",
            cfg.attack, accuracy.val_adv, cfg.attack, accuracy.test_adv
        );

        let bookkeeping = Bookkeeping {
            val: Bookkeeping::build_split(
                self.feeder.val_inds(),
                val_y.view(),
                val_preds.classes.view(),
                val_adv.preds.view(),
            )?,
            test: Bookkeeping::build_split(
                self.feeder.test_inds(),
                test_y.view(),
                test_preds.classes.view(),
                test_adv.preds.view(),
            )?,
        };
        bookkeeping.persist_or_verify(&mut self.store, &cfg.attack_dir().join("info.json"))?;
        let val_attack_rate = bookkeeping.attack_rate(SetKind::Val);
        let test_attack_rate = bookkeeping.attack_rate(SetKind::Test);
        info!(
            "adversarial ({}) validation attack rate: {:?}, test attack rate: {:?}",
            cfg.attack, val_attack_rate, test_attack_rate
        );

        let (eval_x, eval_preds, eval_adv) = match cfg.set {
            SetKind::Val => (val_x, val_preds, val_adv),
            SetKind::Test => (test_x, test_preds, test_adv),
        };
        let selected = bookkeeping.selected(cfg.set, cfg.selection);
        info!("{} examples of the {} set selected", selected.len(), cfg.set);

        info!("ranking training embeddings for clean and adversarial inputs");
        let index = NeighborIndex::build(train_preds.embeddings, train.global_inds().to_vec())?;
        let clean_rankings = index.query_all(eval_preds.embeddings.select(Axis(0), &selected).view())?;
        let adv_rankings = index.query_all(eval_adv.embeddings.select(Axis(0), &selected).view())?;

        let global_inds = self.feeder.eval_inds(cfg.set).to_vec();
        let pred_source = ExampleSource::predicted(eval_x, eval_preds.classes, global_inds.clone())?;
        let adv_source = ExampleSource::adversarial(eval_adv.inputs, eval_adv.preds, global_inds)?;
        let estimator = InfluenceEstimator::new(self.model, &train, cfg.influence_params())?;

        let records = bookkeeping.records(cfg.set);
        let mut outcomes = Vec::with_capacity(2 * selected.len());
        for (i, &local) in selected.iter().enumerate() {
            let record = records.get(&local).ok_or_else(|| {
                NNIFError::consistency(format!("no bookkeeping record for {} index {}", cfg.set, local))
            })?;
            check_sample(record, local, &pred_source, &adv_source)?;
            info!(
                "sample {}/{}: {} index {} (sub={}). real label: {}, adv label: {}, pred label: {}. net_succ={}, attack_succ={}",
                i + 1,
                selected.len(),
                cfg.set,
                record.global_index,
                local,
                cfg.class_label(record.label),
                cfg.class_label(record.adv_pred),
                cfg.class_label(record.pred),
                record.net_succ,
                record.attack_succ
            );
            for (source, ranking) in [(&pred_source, &clean_rankings[i]), (&adv_source, &adv_rankings[i])] {
                outcomes.push(self.process_sample(&estimator, &train, source, ranking, local, record)?);
            }
        }

        Ok(PipelineReport {
            set: cfg.set,
            accuracy,
            val_attack_rate,
            test_attack_rate,
            outcomes,
        })
    }

    /// Restricts the training set to a seeded random subset of `size` examples. The
    /// subset is drawn once and reused by every later run on the same model directory.
    fn train_subset(&mut self, train: &TrainingSet, size: usize) -> Result<TrainingSet> {
        let key = ArtifactKey::new(TRAIN_SUBSET_FILE);
        let global_inds: Vec<usize> = if self.store.exists(&key) {
            info!("loading training subset from {}", key);
            self.store.load_json(&key)?
        } else {
            let mut rng = StdRng::seed_from_u64(derive_seed(self.config.seed, &[TRAIN_SUBSET_SALT]));
            let global_inds = train.sample_global_inds(size, &mut rng);
            self.store.save_json(&key, &global_inds)?;
            info!("saved a training subset of {} examples to {}", global_inds.len(), key);
            global_inds
        };
        train.subset(&global_inds)
    }

    fn process_sample(
        &mut self,
        estimator: &InfluenceEstimator<'_, M>,
        train: &TrainingSet,
        source: &ExampleSource,
        ranking: &NeighborRanking,
        local: usize,
        record: &EvaluationRecord,
    ) -> Result<SampleOutcome> {
        let case = source.case();
        let dir = self.config.sample_dir(record.global_index, case);
        let scores_key = dir.join("scores.json");
        let mut outcome = SampleOutcome {
            local_index: local,
            global_index: record.global_index,
            case,
            computed: false,
            summary: None,
        };

        let mut state = SampleState::Pending;
        loop {
            state = match state {
                SampleState::Pending if self.store.exists(&scores_key) => {
                    info!(
                        "calculation for global index {} ({}) was already done, leaving it",
                        record.global_index, case
                    );
                    SampleState::Persisted
                }
                SampleState::Pending => {
                    let (x, label) = source.example(local)?;
                    let mut rng = StdRng::seed_from_u64(derive_seed(
                        self.config.seed,
                        &[record.global_index as u64, case.seed_salt()],
                    ));
                    let start = Instant::now();
                    let scores = estimator.score(x, label, &mut rng)?;
                    info!(
                        "ihvp + scores calculation time: {:.2?}. global_index: {} (sub: {}), case: {}",
                        start.elapsed(),
                        record.global_index,
                        local,
                        case
                    );
                    SampleState::Scored(scores)
                }
                SampleState::Scored(scores) => {
                    let correlation = Correlation::compute(scores.view(), ranking, train)?;
                    SampleState::Ranked(scores, Box::new(correlation))
                }
                SampleState::Ranked(scores, correlation) => {
                    let labels = LabelTransition {
                        real: self.config.class_label(record.label),
                        adv: self.config.class_label(record.adv_pred),
                        pred: self.config.class_label(record.pred),
                    };
                    let summary = correlation.summary(case, labels);
                    info!("{}", summary);
                    self.persist(&dir, source, local, &scores, &correlation, &summary)?;
                    outcome.computed = true;
                    outcome.summary = Some(summary);
                    SampleState::Persisted
                }
                SampleState::Persisted => break,
            };
            debug!("{} -> {}", dir, state);
        }
        Ok(outcome)
    }

    fn persist(
        &mut self,
        dir: &ArtifactKey,
        source: &ExampleSource,
        local: usize,
        scores: &Array1<NNIFFloat>,
        correlation: &Correlation,
        summary: &Summary,
    ) -> Result<()> {
        let (image, _) = source.example(local)?;
        let store = &mut self.store;
        store.save_json(&dir.join("image.json"), &image)?;
        store.save_json(&dir.join("nearest_neighbors.json"), &correlation.nearest_neighbors)?;
        store.save_json(&dir.join("helpful.json"), &correlation.helpful)?;
        store.save_json(&dir.join("harmful.json"), &correlation.harmful)?;
        store.save_json(&dir.join("helpful_ranks.json"), &correlation.helpful_lookup.ranks)?;
        store.save_json(&dir.join("helpful_dists.json"), &correlation.helpful_lookup.distances)?;
        store.save_json(&dir.join("harmful_ranks.json"), &correlation.harmful_lookup.ranks)?;
        store.save_json(&dir.join("harmful_dists.json"), &correlation.harmful_lookup.distances)?;
        store.save_text(&dir.join("summary.txt"), &summary.to_string())?;
        store.save_json(&dir.join("scores.json"), scores)?;
        debug!("saved artifacts of {}", dir);
        Ok(())
    }
}

/// The per-case sources must agree with the bookkeeping record of the example.
fn check_sample(
    record: &EvaluationRecord,
    local: usize,
    pred_source: &ExampleSource,
    adv_source: &ExampleSource,
) -> Result<()> {
    record.validate()?;
    let (_, pred) = pred_source.example(local)?;
    let (_, adv_pred) = adv_source.example(local)?;
    if pred != record.pred || adv_pred != record.adv_pred {
        return Err(NNIFError::consistency(format!(
            "global index {}: sources say pred {} / adv {}, bookkeeping says {} / {}",
            record.global_index, pred, adv_pred, record.pred, record.adv_pred
        )));
    }
    if pred_source.global_index(local) != Some(record.global_index) {
        return Err(NNIFError::consistency(format!(
            "local index {} maps to {:?}, bookkeeping says {}",
            local,
            pred_source.global_index(local),
            record.global_index
        )));
    }
    Ok(())
}
