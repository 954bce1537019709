#![allow(dead_code)]
use ndarray::{Array1, Array2, ArrayView2};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use nnif_rs::model::Dense;
use nnif_rs::{
    ApproxParams, Attack, AttackKind, AttackParams, Classifier, InMemoryFeeder, InfluenceParams, InputGradient,
    NNIFFloat, Result, RunConfig, SoftmaxClassifier,
};
use rand::SeedableRng;
use rand_pcg::Pcg64;

pub const NUM_CLASSES: usize = 10;
pub const DIM: usize = 10;
pub const NUM_TRAIN: usize = 100;
pub const NUM_VAL: usize = 20;
pub const NUM_TEST: usize = 10;
/// Validation rows the fake attack moves onto another class.
pub const FLIPPED_ROWS: [usize; 3] = [2, 7, 11];

pub fn centre(class: usize) -> Array1<NNIFFloat> {
    let mut c = Array1::ones(DIM);
    c[class] += 2.;
    c
}

fn blobs(labels: Vec<usize>, rng: &mut Pcg64) -> (Array2<NNIFFloat>, Array1<usize>) {
    let mut x = Array2::<NNIFFloat>::random_using((labels.len(), DIM), StandardNormal, rng) * 0.2;
    x.rows_mut()
        .into_iter()
        .zip(labels.iter())
        .for_each(|(mut row, &label)| row += &centre(label));
    (x, Array1::from_vec(labels))
}

/// Ten well separated blobs. Training points take the even global indices below
/// 200, validation points the odd ones below 40.
pub fn feeder(seed: u64) -> InMemoryFeeder {
    let mut rng = Pcg64::seed_from_u64(seed);
    let (train_x, train_y) = blobs((0..NUM_TRAIN).map(|i| i % NUM_CLASSES).collect(), &mut rng);
    let (val_x, val_y) = blobs((0..NUM_VAL).map(|i| i % NUM_CLASSES).collect(), &mut rng);
    let (test_x, test_y) = blobs((0..NUM_TEST).map(|i| (3 * i) % NUM_CLASSES).collect(), &mut rng);
    InMemoryFeeder::new(
        NUM_CLASSES,
        (train_x, train_y, (0..NUM_TRAIN).map(|i| 2 * i).collect()),
        (val_x, val_y, (0..NUM_VAL).map(|i| 2 * i + 1).collect()),
        (test_x, test_y, (0..NUM_TEST).collect()),
    )
    .unwrap()
}

/// Nearest-centroid classifier: identity features and `2 c . x - |c|^2` logits.
pub fn nearest_centroid() -> SoftmaxClassifier {
    let features = Dense::new(Array2::eye(DIM), Array1::zeros(DIM)).unwrap();
    let mut weights = Array2::zeros((NUM_CLASSES, DIM));
    let mut bias = Array1::zeros(NUM_CLASSES);
    for class in 0..NUM_CLASSES {
        let c = centre(class);
        weights.row_mut(class).assign(&(&c * 2.));
        bias[class] = -c.dot(&c);
    }
    SoftmaxClassifier::new(features, Dense::new(weights, bias).unwrap()).unwrap()
}

/// Untargeted stand-in attack: replaces the listed rows by the centre of the next
/// class and leaves every other row untouched.
pub struct Relocate {
    pub rows: Vec<usize>,
}

impl Attack for Relocate {
    fn generate(
        &self,
        model: &dyn InputGradient,
        x: ArrayView2<NNIFFloat>,
        _params: &AttackParams,
    ) -> Result<Array2<NNIFFloat>> {
        let preds = model.predict_class(x)?;
        let mut adv = x.to_owned();
        for &row in self.rows.iter().filter(|&&r| r < x.nrows()) {
            adv.row_mut(row).assign(&centre((preds[row] + 1) % NUM_CLASSES));
        }
        Ok(adv)
    }
}

pub fn relocate() -> Relocate {
    Relocate {
        rows: FLIPPED_ROWS.to_vec(),
    }
}

pub fn fast_influence() -> InfluenceParams {
    InfluenceParams {
        train_batch_size: 32,
        approx: ApproxParams {
            scale: 200.,
            damping: 0.01,
            num_repeats: 2,
            recursion_depth: 5,
            recursion_batch_size: 50,
        },
    }
}

pub fn config(attack: AttackKind) -> RunConfig {
    RunConfig::new("synthetic", attack)
        .with_batch_size(16)
        .with_influence(fast_influence())
        .with_test_influence(fast_influence())
}
