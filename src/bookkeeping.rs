//! Success/failure record of the network and the attack on the evaluation splits.
use crate::config::{Selection, SetKind};
use crate::error::{NNIFError, Result};
use crate::store::{ArtifactKey, ArtifactStore};
use crate::NNIFFloat;
use log::{info, warn};
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub global_index: usize,
    pub label: usize,
    pub pred: usize,
    pub adv_pred: usize,
    /// The clean input is classified correctly.
    pub net_succ: bool,
    /// The adversarial input is classified differently from the clean one.
    pub attack_succ: bool,
}

impl EvaluationRecord {
    pub const fn new(global_index: usize, label: usize, pred: usize, adv_pred: usize) -> Self {
        Self {
            global_index,
            label,
            pred,
            adv_pred,
            net_succ: pred == label,
            attack_succ: pred != adv_pred,
        }
    }

    pub const fn is_flipped(&self) -> bool {
        self.net_succ && self.attack_succ
    }

    /// # Errors
    /// `Consistency` if a success flag contradicts the labels.
    pub fn validate(&self) -> Result<()> {
        if self.net_succ && self.pred != self.label {
            return Err(NNIFError::consistency(format!(
                "global index {}: net_succ set but pred {} != label {}",
                self.global_index, self.pred, self.label
            )));
        }
        if self.attack_succ && self.pred == self.adv_pred {
            return Err(NNIFError::consistency(format!(
                "global index {}: attack_succ set but pred == adv pred == {}",
                self.global_index, self.pred
            )));
        }
        Ok(())
    }
}

/// Records keyed by local index, one map per evaluation split.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookkeeping {
    pub val: BTreeMap<usize, EvaluationRecord>,
    pub test: BTreeMap<usize, EvaluationRecord>,
}

impl Bookkeeping {
    /// # Errors
    /// If the inputs disagree in length.
    pub fn build_split(
        global_inds: &[usize],
        labels: ArrayView1<usize>,
        preds: ArrayView1<usize>,
        adv_preds: ArrayView1<usize>,
    ) -> Result<BTreeMap<usize, EvaluationRecord>> {
        let n = global_inds.len();
        if labels.len() != n || preds.len() != n || adv_preds.len() != n {
            return Err(NNIFError::consistency(format!(
                "{} global indices, {} labels, {} predictions and {} adversarial predictions",
                n,
                labels.len(),
                preds.len(),
                adv_preds.len()
            )));
        }
        Ok((0..n)
            .map(|i| {
                (
                    i,
                    EvaluationRecord::new(global_inds[i], labels[i], preds[i], adv_preds[i]),
                )
            })
            .collect())
    }

    pub const fn records(&self, set: SetKind) -> &BTreeMap<usize, EvaluationRecord> {
        match set {
            SetKind::Val => &self.val,
            SetKind::Test => &self.test,
        }
    }

    /// # Errors
    pub fn validate(&self) -> Result<()> {
        self.val
            .values()
            .chain(self.test.values())
            .try_for_each(EvaluationRecord::validate)
    }

    /// Fraction of correctly classified examples whose prediction the attack changed,
    /// `None` if the network got nothing right.
    pub fn attack_rate(&self, set: SetKind) -> Option<NNIFFloat> {
        let records = self.records(set);
        let net_succ = records.values().filter(|r| r.net_succ).count();
        if net_succ == 0 {
            return None;
        }
        let flipped = records.values().filter(|r| r.is_flipped()).count();
        Some(flipped as NNIFFloat / net_succ as NNIFFloat)
    }

    /// Local indices of the evaluation subset, in ascending order.
    pub fn selected(&self, set: SetKind, selection: Selection) -> Vec<usize> {
        self.records(set)
            .iter()
            .filter(|(_, r)| selection == Selection::All || r.is_flipped())
            .map(|(&i, _)| i)
            .collect()
    }

    /// # Errors
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Saves the record under `key`, or, if one is already there, checks that it is
    /// byte-identical to this one.
    ///
    /// # Errors
    /// `Consistency` if the stored record is invalid or differs from this one.
    pub fn persist_or_verify<S: ArtifactStore>(&self, store: &mut S, key: &ArtifactKey) -> Result<()> {
        self.validate()?;
        let bytes = self.to_bytes()?;
        if !store.exists(key) {
            info!("saving bookkeeping to {}", key);
            return store.save(key, &bytes);
        }
        info!("verifying bookkeeping against {}", key);
        let stored_bytes = store.load(key)?;
        let stored: Self = serde_json::from_slice(&stored_bytes)?;
        stored.validate()?;
        if stored_bytes != bytes {
            warn!("bookkeeping at {} differs from the recomputed record", key);
            return Err(NNIFError::consistency(format!(
                "stored bookkeeping {} does not match the recomputed record",
                key
            )));
        }
        Ok(())
    }
}
