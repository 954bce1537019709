//! Where do the most influential training points sit in the nearest-neighbor order?
use crate::config::Case;
use crate::error::{NNIFError, Result};
use crate::feeder::TrainingSet;
use crate::neighbors::NeighborRanking;
use crate::NNIFFloat;
use ndarray::ArrayView1;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Size of the helpful/harmful lists and of the neighborhood they are counted in.
pub const SUMMARY_K: usize = 50;
/// Number of most helpful/harmful training points whose ranks are looked up.
pub const RANK_K: usize = 1000;

/// Rank and distance of a list of training points within one neighbor ranking.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RankLookup {
    pub ranks: Vec<usize>,
    pub distances: Vec<NNIFFloat>,
}

fn mean<I: ExactSizeIterator<Item = NNIFFloat>>(values: I) -> NNIFFloat {
    let n = values.len();
    values.sum::<NNIFFloat>() / n as NNIFFloat
}

impl RankLookup {
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// NaN when empty.
    pub fn mean_rank(&self) -> NNIFFloat {
        mean(self.ranks.iter().map(|&r| r as NNIFFloat))
    }

    /// NaN when empty.
    pub fn mean_distance(&self) -> NNIFFloat {
        mean(self.distances.iter().copied())
    }
}

/// Global index to position map of a ranking that contains every index once.
pub struct RankTable<'a> {
    ranking: &'a NeighborRanking,
    positions: HashMap<usize, usize>,
}

impl<'a> RankTable<'a> {
    /// # Errors
    /// `Consistency` if an index occurs more than once in the ranking.
    pub fn new(ranking: &'a NeighborRanking) -> Result<Self> {
        let positions = ranking.positions();
        if positions.len() != ranking.len() {
            return Err(NNIFError::consistency(format!(
                "neighbor ranking of length {} holds only {} distinct training indices",
                ranking.len(),
                positions.len()
            )));
        }
        Ok(Self { ranking, positions })
    }

    /// # Errors
    /// `Consistency` if an index is absent from the ranking.
    pub fn rank_of(&self, global_index: usize) -> Result<usize> {
        let rank = *self.positions.get(&global_index).ok_or_else(|| {
            NNIFError::consistency(format!(
                "training index {} is missing from the neighbor ranking",
                global_index
            ))
        })?;
        debug_assert_eq!(self.ranking.entries()[rank].global_index, global_index);
        Ok(rank)
    }

    /// # Errors
    pub fn find_ranks(&self, global_indices: &[usize]) -> Result<RankLookup> {
        let mut lookup = RankLookup::default();
        for &idx in global_indices {
            let rank = self.rank_of(idx)?;
            lookup.ranks.push(rank);
            lookup.distances.push(self.ranking.entries()[rank].distance);
        }
        Ok(lookup)
    }
}

/// Locates each of `global_indices` in `ranking`.
///
/// # Errors
/// `Consistency` if an index is absent from the ranking or the ranking repeats one.
pub fn find_ranks(ranking: &NeighborRanking, global_indices: &[usize]) -> Result<RankLookup> {
    RankTable::new(ranking)?.find_ranks(global_indices)
}

/// Local training indices sorted by ascending influence score.
#[derive(Clone, Debug, PartialEq)]
pub struct InfluenceOrder {
    ascending: Vec<usize>,
}

impl InfluenceOrder {
    /// # Errors
    /// `Numerical` if a score is not finite.
    pub fn from_scores(scores: ArrayView1<NNIFFloat>) -> Result<Self> {
        if let Some(i) = scores.iter().position(|s| !s.is_finite()) {
            return Err(NNIFError::numerical(format!(
                "influence score of training example {} is {}",
                i, scores[i]
            )));
        }
        let mut ascending: Vec<usize> = (0..scores.len()).collect();
        ascending.sort_by_key(|&i| OrderedFloat(scores[i]));
        Ok(Self { ascending })
    }

    /// The `k` lowest scores, most harmful first.
    pub fn harmful(&self, k: usize) -> &[usize] {
        &self.ascending[..k.min(self.ascending.len())]
    }

    /// The `k` highest scores, most helpful first.
    pub fn helpful(&self, k: usize) -> Vec<usize> {
        let k = k.min(self.ascending.len());
        self.ascending[self.ascending.len() - k..]
            .iter()
            .rev()
            .copied()
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InfluentialPoint {
    pub global_index: usize,
    pub label: usize,
    pub score: NNIFFloat,
    pub knn_rank: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NearPoint {
    pub global_index: usize,
    pub label: usize,
    pub distance: NNIFFloat,
}

/// Everything derived from one score vector and the matching neighbor ranking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub nearest_neighbors: Vec<NearPoint>,
    pub helpful: Vec<InfluentialPoint>,
    pub harmful: Vec<InfluentialPoint>,
    pub helpful_in_knn: usize,
    pub harmful_in_knn: usize,
    pub helpful_lookup: RankLookup,
    pub harmful_lookup: RankLookup,
}

impl Correlation {
    /// Both K values are capped at the training-set size.
    ///
    /// # Errors
    /// `Numerical` for non-finite scores, `Consistency` if the ranking does not
    /// cover the training set exactly once.
    pub fn compute(
        scores: ArrayView1<NNIFFloat>,
        ranking: &NeighborRanking,
        train: &TrainingSet,
    ) -> Result<Self> {
        if scores.len() != train.len() || ranking.len() != train.len() {
            return Err(NNIFError::consistency(format!(
                "{} scores and a ranking of {} for {} training examples",
                scores.len(),
                ranking.len(),
                train.len()
            )));
        }
        let order = InfluenceOrder::from_scores(scores)?;
        let table = RankTable::new(ranking)?;
        let globals = train.global_inds();
        let labels = train.labels();
        let label_of: HashMap<usize, usize> =
            globals.iter().copied().zip(labels.iter().copied()).collect();
        let to_global = |locals: &[usize]| -> Vec<usize> { locals.iter().map(|&l| globals[l]).collect() };

        let knn: HashSet<usize> = ranking.first(SUMMARY_K).iter().map(|n| n.global_index).collect();
        let nearest_neighbors = ranking
            .first(SUMMARY_K)
            .iter()
            .map(|n| {
                Ok(NearPoint {
                    global_index: n.global_index,
                    label: *label_of.get(&n.global_index).ok_or_else(|| {
                        NNIFError::consistency(format!(
                            "neighbor {} is not a training example",
                            n.global_index
                        ))
                    })?,
                    distance: n.distance,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let points = |locals: &[usize]| -> Result<Vec<InfluentialPoint>> {
            locals
                .iter()
                .map(|&l| {
                    Ok(InfluentialPoint {
                        global_index: globals[l],
                        label: labels[l],
                        score: scores[l],
                        knn_rank: table.rank_of(globals[l])?,
                    })
                })
                .collect()
        };
        let helpful = points(&order.helpful(SUMMARY_K))?;
        let harmful = points(order.harmful(SUMMARY_K))?;
        let count_in_knn =
            |pts: &[InfluentialPoint]| pts.iter().filter(|p| knn.contains(&p.global_index)).count();

        Ok(Self {
            helpful_in_knn: count_in_knn(&helpful),
            harmful_in_knn: count_in_knn(&harmful),
            helpful_lookup: table.find_ranks(&to_global(&order.helpful(RANK_K)))?,
            harmful_lookup: table.find_ranks(&to_global(order.harmful(RANK_K)))?,
            nearest_neighbors,
            helpful,
            harmful,
        })
    }

    pub fn summary(&self, case: Case, labels: LabelTransition) -> Summary {
        Summary {
            case,
            labels,
            k: self.nearest_neighbors.len(),
            num_helpful: self.helpful.len(),
            num_harmful: self.harmful.len(),
            helpful_in_knn: self.helpful_in_knn,
            harmful_in_knn: self.harmful_in_knn,
            helpful_rank_mean: self.helpful_lookup.mean_rank(),
            harmful_rank_mean: self.harmful_lookup.mean_rank(),
            helpful_dist_mean: self.helpful_lookup.mean_distance(),
            harmful_dist_mean: self.harmful_lookup.mean_distance(),
        }
    }
}

/// Rendered class names of the true label, the adversarial prediction and the clean
/// prediction of one example.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelTransition {
    pub real: String,
    pub adv: String,
    pub pred: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub case: Case,
    pub labels: LabelTransition,
    pub k: usize,
    pub num_helpful: usize,
    pub num_harmful: usize,
    pub helpful_in_knn: usize,
    pub harmful_in_knn: usize,
    pub helpful_rank_mean: NNIFFloat,
    pub harmful_rank_mean: NNIFFloat,
    pub helpful_dist_mean: NNIFFloat,
    pub harmful_dist_mean: NNIFFloat,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{}: {} out of {} harmful images are in the {}-NN",
            self.case, self.harmful_in_knn, self.num_harmful, self.k
        )?;
        writeln!(
            f,
            "{}: {} out of {} helpful images are in the {}-NN",
            self.case, self.helpful_in_knn, self.num_helpful, self.k
        )?;
        writeln!(
            f,
            "label ({} -> {}). pred: {}. {}",
            self.labels.real, self.labels.adv, self.labels.pred, self.case
        )?;
        writeln!(
            f,
            "helpful/harmful_rank mean: {}/{}",
            self.helpful_rank_mean, self.harmful_rank_mean
        )?;
        write!(
            f,
            "helpful/harmful_dist mean: {}/{}",
            self.helpful_dist_mean, self.harmful_dist_mean
        )
    }
}
