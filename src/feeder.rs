//! Data boundary.
//!
//! A `Feeder` supplies the train/validation/test splits and the local to global index
//! maps. The pipeline only reads from it. Re-labelled views of an evaluation split
//! (labelled by the model's clean or adversarial predictions) are separate immutable
//! `ExampleSource` values built per case, never mutations of the feeder.
use crate::config::{Case, SetKind};
use crate::error::{NNIFError, Result};
use crate::NNIFFloat;
use itertools::Itertools;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::seq::{index, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::ops::Range;
use std::path::Path;

pub trait Feeder {
    fn num_classes(&self) -> usize;
    fn get_train_size(&self) -> usize;
    fn get_val_size(&self) -> usize;
    fn get_test_size(&self) -> usize;

    /// # Errors
    /// If the range exceeds the split.
    fn train_indices(&self, range: Range<usize>) -> Result<(Array2<NNIFFloat>, Array1<usize>)>;

    /// # Errors
    fn val_indices(&self, range: Range<usize>) -> Result<(Array2<NNIFFloat>, Array1<usize>)>;

    /// # Errors
    fn test_indices(&self, idx: usize) -> Result<(Array1<NNIFFloat>, usize)>;

    /// # Errors
    fn test_set(&self) -> Result<(Array2<NNIFFloat>, Array1<usize>)>;

    /// Local to global index maps.
    fn train_inds(&self) -> &[usize];
    fn val_inds(&self) -> &[usize];
    fn test_inds(&self) -> &[usize];

    /// Clears evaluation-specific overrides. Feeders here carry none.
    fn reset(&mut self) {}

    /// # Errors
    fn eval_split(&self, set: SetKind) -> Result<(Array2<NNIFFloat>, Array1<usize>)> {
        match set {
            SetKind::Val => self.val_indices(0..self.get_val_size()),
            SetKind::Test => self.test_set(),
        }
    }

    fn eval_inds(&self, set: SetKind) -> &[usize] {
        match set {
            SetKind::Val => self.val_inds(),
            SetKind::Test => self.test_inds(),
        }
    }

    /// # Errors
    fn training_set(&self) -> Result<TrainingSet> {
        let (inputs, labels) = self.train_indices(0..self.get_train_size())?;
        TrainingSet::new(inputs, labels, self.train_inds().to_vec())
    }
}

fn check_split(
    name: &str,
    inputs: &Array2<NNIFFloat>,
    labels: &Array1<usize>,
    inds: &[usize],
    num_classes: usize,
) -> Result<()> {
    if inputs.nrows() != labels.len() || labels.len() != inds.len() {
        return Err(NNIFError::config(format!(
            "{} split has {} inputs, {} labels and {} global indices",
            name,
            inputs.nrows(),
            labels.len(),
            inds.len()
        )));
    }
    if let Some(bad) = labels.iter().find(|&&y| y >= num_classes) {
        return Err(NNIFError::config(format!(
            "{} split contains label {} but there are {} classes",
            name, bad, num_classes
        )));
    }
    Ok(())
}

fn check_range(name: &str, range: &Range<usize>, len: usize) -> Result<()> {
    if range.start > range.end || range.end > len {
        return Err(NNIFError::config(format!(
            "range {:?} out of bounds for {} split of size {}",
            range, name, len
        )));
    }
    Ok(())
}

/// Feeder over arrays already in memory. Serialisable, so a prepared dataset can be
/// stored next to a checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InMemoryFeeder {
    num_classes: usize,
    train_x: Array2<NNIFFloat>,
    train_y: Array1<usize>,
    train_inds: Vec<usize>,
    val_x: Array2<NNIFFloat>,
    val_y: Array1<usize>,
    val_inds: Vec<usize>,
    test_x: Array2<NNIFFloat>,
    test_y: Array1<usize>,
    test_inds: Vec<usize>,
}

impl InMemoryFeeder {
    /// # Errors
    /// If any split is internally inconsistent.
    pub fn new(
        num_classes: usize,
        train: (Array2<NNIFFloat>, Array1<usize>, Vec<usize>),
        val: (Array2<NNIFFloat>, Array1<usize>, Vec<usize>),
        test: (Array2<NNIFFloat>, Array1<usize>, Vec<usize>),
    ) -> Result<Self> {
        let feeder = Self {
            num_classes,
            train_x: train.0,
            train_y: train.1,
            train_inds: train.2,
            val_x: val.0,
            val_y: val.1,
            val_inds: val.2,
            test_x: test.0,
            test_y: test.1,
            test_inds: test.2,
        };
        feeder.validate()?;
        Ok(feeder)
    }

    /// # Errors
    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(NNIFError::config("a classifier needs at least two classes"));
        }
        check_split("train", &self.train_x, &self.train_y, &self.train_inds, self.num_classes)?;
        check_split("val", &self.val_x, &self.val_y, &self.val_inds, self.num_classes)?;
        check_split("test", &self.test_x, &self.test_y, &self.test_inds, self.num_classes)?;
        if self.train_inds.iter().chain(self.val_inds.iter()).duplicates().next().is_some() {
            return Err(NNIFError::config(
                "train and val global indices must be disjoint and unique",
            ));
        }
        Ok(())
    }

    /// # Errors
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let feeder: Self = serde_json::from_reader(reader)?;
        feeder.validate()?;
        Ok(feeder)
    }

    /// Gaussian blobs around one random centre per class. Train and validation
    /// examples share one global index space with validation positions drawn at
    /// random; the test split is indexed on its own.
    ///
    /// # Errors
    pub fn synthetic<R: Rng>(
        num_classes: usize,
        input_dim: usize,
        sizes: (usize, usize, usize),
        spread: NNIFFloat,
        rng: &mut R,
    ) -> Result<Self> {
        let (num_train, num_val, num_test) = sizes;
        let centres = Array2::<NNIFFloat>::random_using((num_classes, input_dim), StandardNormal, rng)
            * spread;
        let draw = |n: usize, rng: &mut R| {
            let labels: Vec<usize> = (0..n).map(|_| rng.gen_range(0..num_classes)).collect();
            let noise = Array2::<NNIFFloat>::random_using((n, input_dim), StandardNormal, rng);
            let inputs = centres.select(Axis(0), &labels) + noise;
            (inputs, Array1::from_vec(labels))
        };
        let (train_x, train_y) = draw(num_train, rng);
        let (val_x, val_y) = draw(num_val, rng);
        let (test_x, test_y) = draw(num_test, rng);

        let mut pool: Vec<usize> = (0..num_train + num_val).collect();
        pool.shuffle(rng);
        let val_inds = pool[..num_val].iter().copied().sorted().collect();
        let train_inds = pool[num_val..].iter().copied().sorted().collect();
        Self::new(
            num_classes,
            (train_x, train_y, train_inds),
            (val_x, val_y, val_inds),
            (test_x, test_y, (0..num_test).collect()),
        )
    }
}

impl Feeder for InMemoryFeeder {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn get_train_size(&self) -> usize {
        self.train_y.len()
    }

    fn get_val_size(&self) -> usize {
        self.val_y.len()
    }

    fn get_test_size(&self) -> usize {
        self.test_y.len()
    }

    fn train_indices(&self, range: Range<usize>) -> Result<(Array2<NNIFFloat>, Array1<usize>)> {
        check_range("train", &range, self.get_train_size())?;
        Ok((
            self.train_x.slice(s![range.clone(), ..]).to_owned(),
            self.train_y.slice(s![range]).to_owned(),
        ))
    }

    fn val_indices(&self, range: Range<usize>) -> Result<(Array2<NNIFFloat>, Array1<usize>)> {
        check_range("val", &range, self.get_val_size())?;
        Ok((
            self.val_x.slice(s![range.clone(), ..]).to_owned(),
            self.val_y.slice(s![range]).to_owned(),
        ))
    }

    fn test_indices(&self, idx: usize) -> Result<(Array1<NNIFFloat>, usize)> {
        check_range("test", &(idx..idx + 1), self.get_test_size())?;
        Ok((self.test_x.row(idx).to_owned(), self.test_y[idx]))
    }

    fn test_set(&self) -> Result<(Array2<NNIFFloat>, Array1<usize>)> {
        Ok((self.test_x.clone(), self.test_y.clone()))
    }

    fn train_inds(&self) -> &[usize] {
        &self.train_inds
    }

    fn val_inds(&self) -> &[usize] {
        &self.val_inds
    }

    fn test_inds(&self) -> &[usize] {
        &self.test_inds
    }
}

/// The training examples influence is measured over: the full training split or a
/// fixed subset of it. Sampled by the influence recursion and scanned in batches when
/// scoring.
#[derive(Clone, Debug)]
pub struct TrainingSet {
    inputs: Array2<NNIFFloat>,
    labels: Array1<usize>,
    global_inds: Vec<usize>,
}

impl TrainingSet {
    /// # Errors
    pub fn new(
        inputs: Array2<NNIFFloat>,
        labels: Array1<usize>,
        global_inds: Vec<usize>,
    ) -> Result<Self> {
        if inputs.nrows() != labels.len() || labels.len() != global_inds.len() {
            return Err(NNIFError::config(format!(
                "training set has {} inputs, {} labels and {} global indices",
                inputs.nrows(),
                labels.len(),
                global_inds.len()
            )));
        }
        Ok(Self {
            inputs,
            labels,
            global_inds,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn inputs(&self) -> ArrayView2<NNIFFloat> {
        self.inputs.view()
    }

    pub fn labels(&self) -> ArrayView1<usize> {
        self.labels.view()
    }

    pub fn global_index(&self, local: usize) -> Option<usize> {
        self.global_inds.get(local).copied()
    }

    pub fn global_inds(&self) -> &[usize] {
        &self.global_inds
    }

    /// Gathers the given local indices into a batch.
    pub fn select(&self, indices: &[usize]) -> (Array2<NNIFFloat>, Array1<usize>) {
        (
            self.inputs.select(Axis(0), indices),
            self.labels.select(Axis(0), indices),
        )
    }

    /// Draws `size` distinct examples (all of them if `size >= len`) and returns their
    /// global indices in ascending order.
    pub fn sample_global_inds<R: Rng + ?Sized>(&self, size: usize, rng: &mut R) -> Vec<usize> {
        let size = size.min(self.len());
        index::sample(rng, self.len(), size)
            .into_iter()
            .map(|local| self.global_inds[local])
            .sorted()
            .collect()
    }

    /// The examples with the given global indices, in the given order.
    ///
    /// # Errors
    /// `Consistency` if an index is not part of this set or appears twice.
    pub fn subset(&self, global_inds: &[usize]) -> Result<Self> {
        if let Some(dup) = global_inds.iter().duplicates().next() {
            return Err(NNIFError::consistency(format!(
                "training subset lists global index {} twice",
                dup
            )));
        }
        let position: HashMap<usize, usize> = self
            .global_inds
            .iter()
            .enumerate()
            .map(|(local, &global)| (global, local))
            .collect();
        let locals = global_inds
            .iter()
            .map(|g| {
                position.get(g).copied().ok_or_else(|| {
                    NNIFError::consistency(format!("global index {} is not a training example", g))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let (inputs, labels) = self.select(&locals);
        Self::new(inputs, labels, global_inds.to_vec())
    }
}

/// An evaluation split labelled for one case: clean inputs with the model's clean
/// predictions, or adversarial inputs with the model's adversarial predictions.
#[derive(Clone, Debug)]
pub struct ExampleSource {
    case: Case,
    inputs: Array2<NNIFFloat>,
    labels: Array1<usize>,
    global_inds: Vec<usize>,
}

impl ExampleSource {
    /// # Errors
    pub fn predicted(
        inputs: Array2<NNIFFloat>,
        preds: Array1<usize>,
        global_inds: Vec<usize>,
    ) -> Result<Self> {
        Self::new(Case::Pred, inputs, preds, global_inds)
    }

    /// # Errors
    pub fn adversarial(
        adv_inputs: Array2<NNIFFloat>,
        adv_preds: Array1<usize>,
        global_inds: Vec<usize>,
    ) -> Result<Self> {
        Self::new(Case::Adv, adv_inputs, adv_preds, global_inds)
    }

    fn new(
        case: Case,
        inputs: Array2<NNIFFloat>,
        labels: Array1<usize>,
        global_inds: Vec<usize>,
    ) -> Result<Self> {
        if inputs.nrows() != labels.len() || labels.len() != global_inds.len() {
            return Err(NNIFError::consistency(format!(
                "{} source has {} inputs, {} labels and {} global indices",
                case,
                inputs.nrows(),
                labels.len(),
                global_inds.len()
            )));
        }
        Ok(Self {
            case,
            inputs,
            labels,
            global_inds,
        })
    }

    pub const fn case(&self) -> Case {
        self.case
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// # Errors
    /// If `local` is outside the split.
    pub fn example(&self, local: usize) -> Result<(ArrayView1<NNIFFloat>, usize)> {
        if local >= self.len() {
            return Err(NNIFError::consistency(format!(
                "local index {} outside {} source of size {}",
                local,
                self.case,
                self.len()
            )));
        }
        Ok((self.inputs.row(local), self.labels[local]))
    }

    pub fn global_index(&self, local: usize) -> Option<usize> {
        self.global_inds.get(local).copied()
    }
}
