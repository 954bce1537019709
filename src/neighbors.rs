//! Euclidean ranking of the whole training set in embedding space.
use crate::error::{NNIFError, Result};
use crate::NNIFFloat;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub global_index: usize,
    pub distance: NNIFFloat,
}

/// Every training point ordered by distance to one query, nearest first. Points at
/// equal distance keep training-set order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NeighborRanking {
    entries: Vec<Neighbor>,
}

impl NeighborRanking {
    pub fn entries(&self) -> &[Neighbor] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The `k` nearest, or all of them if fewer exist.
    pub fn first(&self, k: usize) -> &[Neighbor] {
        &self.entries[..k.min(self.entries.len())]
    }

    pub fn global_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|n| n.global_index)
    }

    /// Rank of each global index.
    pub fn positions(&self) -> HashMap<usize, usize> {
        self.entries
            .iter()
            .enumerate()
            .map(|(rank, n)| (n.global_index, rank))
            .collect()
    }
}

pub struct NeighborIndex {
    embeddings: Array2<NNIFFloat>,
    global_inds: Vec<usize>,
}

impl NeighborIndex {
    /// # Errors
    /// If the index list does not match the embedding rows.
    pub fn build(embeddings: Array2<NNIFFloat>, global_inds: Vec<usize>) -> Result<Self> {
        if embeddings.nrows() != global_inds.len() {
            return Err(NNIFError::consistency(format!(
                "{} embeddings for {} training indices",
                embeddings.nrows(),
                global_inds.len()
            )));
        }
        Ok(Self {
            embeddings,
            global_inds,
        })
    }

    pub fn len(&self) -> usize {
        self.global_inds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.global_inds.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.embeddings.ncols()
    }

    /// # Errors
    /// If `query` has the wrong dimension or contains a non-finite value.
    pub fn query(&self, query: ArrayView1<NNIFFloat>) -> Result<NeighborRanking> {
        if query.len() != self.dim() {
            return Err(NNIFError::consistency(format!(
                "query of dimension {} against embeddings of dimension {}",
                query.len(),
                self.dim()
            )));
        }
        if query.iter().any(|v| !v.is_finite()) {
            return Err(NNIFError::numerical("query embedding is not finite"));
        }
        let mut scored: Vec<(OrderedFloat<NNIFFloat>, usize)> = self
            .embeddings
            .axis_iter(Axis(0))
            .enumerate()
            .map(|(local, row)| {
                let sq: NNIFFloat = row
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                (OrderedFloat(sq.sqrt()), local)
            })
            .collect();
        // stable, so ties stay in local order
        scored.sort_by_key(|(dist, _)| *dist);
        Ok(NeighborRanking {
            entries: scored
                .into_iter()
                .map(|(dist, local)| Neighbor {
                    global_index: self.global_inds[local],
                    distance: dist.into_inner(),
                })
                .collect(),
        })
    }

    /// Rankings for every row of `queries`, computed in parallel.
    ///
    /// # Errors
    pub fn query_all(&self, queries: ArrayView2<NNIFFloat>) -> Result<Vec<NeighborRanking>> {
        let rows: Vec<_> = queries.axis_iter(Axis(0)).collect();
        rows.into_par_iter().map(|q| self.query(q)).collect()
    }
}
