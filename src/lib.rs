#![allow(clippy::must_use_candidate, clippy::module_name_repetitions)]
//! Forensics for adversarial inputs: compare the training points that most influence a
//! prediction against the training points nearest to it in embedding space.
extern crate ndarray;
extern crate ndarray_rand;
extern crate ndarray_stats;
extern crate rand;

pub mod attack;
pub mod bookkeeping;
pub mod config;
pub mod correlate;
pub mod error;
pub mod feeder;
pub mod influence;
pub mod logging;
pub mod model;
pub mod neighbors;
pub mod pipeline;
pub mod predict;
pub mod store;
#[cfg(test)]
mod test_util;

pub type NNIFFloat = f64;

pub use crate::attack::{AdversarialSet, Attack, AttackKind, AttackMethod, AttackParams, AttackRunner};
pub use crate::bookkeeping::{Bookkeeping, EvaluationRecord};
pub use crate::config::{ApproxParams, Case, InfluenceParams, RunConfig, Selection, SetKind};
pub use crate::correlate::{find_ranks, Correlation, NearPoint, RankLookup, Summary};
pub use crate::error::{NNIFError, Result};
pub use crate::feeder::{ExampleSource, Feeder, InMemoryFeeder, TrainingSet};
pub use crate::influence::{InfluenceEstimator, LissaRecursion};
pub use crate::model::{Classifier, InputGradient, Objective, SoftmaxClassifier};
pub use crate::neighbors::{Neighbor, NeighborIndex, NeighborRanking};
pub use crate::pipeline::{AccuracyReport, Pipeline, PipelineReport, SampleOutcome};
pub use crate::predict::Predictions;
pub use crate::store::{ArtifactKey, ArtifactStore, FsStore, MemoryStore};
