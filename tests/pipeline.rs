use more_asserts::{assert_ge, assert_le};
use ndarray::Array1;
use nnif_rs::{
    ArtifactKey, ArtifactStore, AttackKind, Bookkeeping, Case, FsStore, MemoryStore, NNIFError,
    NearPoint, Pipeline, Selection, SetKind,
};
use std::fs;

mod common;

fn scores_keys(store: &MemoryStore) -> Vec<ArtifactKey> {
    store
        .keys()
        .filter(|k| k.segments().last().map(String::as_str) == Some("scores.json"))
        .cloned()
        .collect()
}

#[test]
fn test_end_to_end_flipped_examples() {
    let feeder = common::feeder(0);
    let model = common::nearest_centroid();
    let attack = common::relocate();
    let config = common::config(AttackKind::DeepFool);

    let mut pipeline = Pipeline::new(&config, MemoryStore::new(), &model, &feeder, &attack).unwrap();
    let report = pipeline.run().unwrap();
    let store = pipeline.into_store();

    assert_eq!(report.accuracy.train, 1.);
    assert_eq!(report.accuracy.val, 1.);
    let info: Bookkeeping = store.load_json(&ArtifactKey::new("deepfool/info.json")).unwrap();
    let net_succ = info.val.values().filter(|r| r.net_succ).count();
    assert_eq!(net_succ, common::NUM_VAL);
    assert_eq!(report.attack_rate(), Some(3. / net_succ as f64));

    let flipped: Vec<usize> = common::FLIPPED_ROWS.iter().map(|&r| 2 * r + 1).collect();
    let scored: Vec<usize> = report.outcomes.iter().map(|o| o.global_index).collect();
    assert_eq!(
        scored,
        flipped.iter().flat_map(|&g| [g, g]).collect::<Vec<_>>()
    );
    assert_eq!(report.num_computed(), 6);
    assert_eq!(scores_keys(&store).len(), 6);
    assert!(!store.exists(&ArtifactKey::new("deepfool/y_val_targets.json")));

    for outcome in &report.outcomes {
        let summary = outcome.summary.as_ref().unwrap();
        assert_eq!(summary.k, 50);
        assert_eq!(summary.num_helpful, 50);
        for mean in [summary.helpful_rank_mean, summary.harmful_rank_mean] {
            assert_ge!(mean, 0.);
            assert_le!(mean, (common::NUM_TRAIN - 1) as f64);
        }

        let dir = config.sample_dir(outcome.global_index, outcome.case);
        let scores: Array1<f64> = store.load_json(&dir.join("scores.json")).unwrap();
        assert_eq!(scores.len(), common::NUM_TRAIN);
        assert!(scores.iter().all(|s| s.is_finite()));
        let ranks: Vec<usize> = store.load_json(&dir.join("helpful_ranks.json")).unwrap();
        assert_eq!(ranks.len(), common::NUM_TRAIN);
        assert!(ranks.iter().all(|&r| r < common::NUM_TRAIN));
        let summary_txt = String::from_utf8(store.load(&dir.join("summary.txt")).unwrap()).unwrap();
        assert!(summary_txt.starts_with(&format!("{}: ", outcome.case)));
    }

    // the adversarial case lives below the attack name
    let adv_dir = config.sample_dir(flipped[0], Case::Adv);
    assert_eq!(
        adv_dir,
        ArtifactKey::new(&format!("val/val_index_{}/adv/deepfool", flipped[0]))
    );
}

#[test]
fn test_second_run_changes_nothing() {
    let feeder = common::feeder(1);
    let model = common::nearest_centroid();
    let attack = common::relocate();
    let config = common::config(AttackKind::DeepFool);

    let mut pipeline = Pipeline::new(&config, MemoryStore::new(), &model, &feeder, &attack).unwrap();
    let first = pipeline.run().unwrap();
    let snapshot = pipeline.store().clone();

    let second = pipeline.run().unwrap();
    assert_eq!(second.num_skipped(), 6);
    assert_eq!(second.attack_rate(), first.attack_rate());
    assert!(second.outcomes.iter().all(|o| o.summary.is_none()));

    let store = pipeline.into_store();
    assert_eq!(store.num_writes(), snapshot.num_writes());
    assert_eq!(store.len(), snapshot.len());
    for key in snapshot.keys() {
        assert_eq!(store.get(key), snapshot.get(key), "{}", key);
    }
}

#[test]
fn test_resumes_missing_pair_only() {
    let feeder = common::feeder(2);
    let model = common::nearest_centroid();
    let attack = common::relocate();
    let config = common::config(AttackKind::DeepFool);

    let mut pipeline = Pipeline::new(&config, MemoryStore::new(), &model, &feeder, &attack).unwrap();
    pipeline.run().unwrap();
    let complete = pipeline.into_store();

    // an interrupted run: one pair lost its commit marker
    let dropped = config.sample_dir(2 * common::FLIPPED_ROWS[1] + 1, Case::Adv).join("scores.json");
    let mut partial = MemoryStore::new();
    for key in complete.keys().filter(|&k| k != &dropped) {
        partial.save(key, complete.get(key).unwrap()).unwrap();
    }
    let writes_before = partial.num_writes();

    let mut pipeline = Pipeline::new(&config, partial, &model, &feeder, &attack).unwrap();
    let report = pipeline.run().unwrap();
    assert_eq!(report.num_computed(), 1);
    let redone = report.outcomes.iter().find(|o| o.computed).unwrap();
    assert_eq!(redone.case, Case::Adv);
    assert_eq!(redone.global_index, 2 * common::FLIPPED_ROWS[1] + 1);

    let store = pipeline.into_store();
    // image, neighbors, helpful, harmful, four rank/distance lists, summary, scores
    assert_eq!(store.num_writes(), writes_before + 10);
    assert_eq!(store.get(&dropped), complete.get(&dropped));
}

#[test]
fn test_tampered_bookkeeping_is_fatal() {
    let feeder = common::feeder(3);
    let model = common::nearest_centroid();
    let attack = common::relocate();
    let config = common::config(AttackKind::DeepFool);

    let key = ArtifactKey::new("deepfool/info.json");
    let mut pipeline = Pipeline::new(&config, MemoryStore::new(), &model, &feeder, &attack).unwrap();
    pipeline.run().unwrap();
    let mut store = pipeline.into_store();

    let mut info: Bookkeeping = store.load_json(&key).unwrap();
    info.val.remove(&0);
    store.save(&key, &info.to_bytes().unwrap()).unwrap();

    let mut pipeline = Pipeline::new(&config, store, &model, &feeder, &attack).unwrap();
    assert!(matches!(pipeline.run(), Err(NNIFError::Consistency(_))));
}

#[test]
fn test_score_all_examples_of_test_set() {
    let feeder = common::feeder(4);
    let model = common::nearest_centroid();
    let attack = common::relocate();
    let config = common::config(AttackKind::DeepFool)
        .with_set(SetKind::Test)
        .with_selection(Selection::All);

    let mut pipeline = Pipeline::new(&config, MemoryStore::new(), &model, &feeder, &attack).unwrap();
    let report = pipeline.run().unwrap();
    assert_eq!(report.set, SetKind::Test);
    assert_eq!(report.outcomes.len(), 2 * common::NUM_TEST);
    let store = pipeline.into_store();
    assert_eq!(scores_keys(&store).len(), 2 * common::NUM_TEST);
    assert!(store.exists(&config.sample_dir(0, Case::Pred).join("scores.json")));
    // the default subset is capped at the size of the training split
    let subset: Vec<usize> = store.load_json(&ArtifactKey::new("train_mini_indices.json")).unwrap();
    assert_eq!(subset, (0..common::NUM_TRAIN).map(|i| 2 * i).collect::<Vec<_>>());
    assert!(store.exists(&ArtifactKey::new("x_train_mini_preds.json")));
}

#[test]
fn test_training_subset_is_drawn_once() {
    let feeder = common::feeder(7);
    let model = common::nearest_centroid();
    let attack = common::relocate();
    let config = common::config(AttackKind::DeepFool)
        .with_set(SetKind::Test)
        .with_selection(Selection::All)
        .with_test_train_subset(Some(40));
    let key = ArtifactKey::new("train_mini_indices.json");

    let mut pipeline = Pipeline::new(&config, MemoryStore::new(), &model, &feeder, &attack).unwrap();
    let first = pipeline.run().unwrap();
    let snapshot = pipeline.store().clone();

    let subset: Vec<usize> = snapshot.load_json(&key).unwrap();
    assert_eq!(subset.len(), 40);
    assert!(subset.windows(2).all(|w| w[0] < w[1]));
    assert!(subset.iter().all(|&g| g % 2 == 0 && g < 2 * common::NUM_TRAIN));
    assert!(snapshot.exists(&ArtifactKey::new("x_train_mini_preds.json")));
    assert!(snapshot.exists(&ArtifactKey::new("x_train_mini_features.json")));
    assert!(!snapshot.exists(&ArtifactKey::new("x_train_preds.json")));

    for outcome in &first.outcomes {
        let summary = outcome.summary.as_ref().unwrap();
        assert_eq!(summary.k, 40);
        let dir = config.sample_dir(outcome.global_index, outcome.case);
        let scores: Array1<f64> = snapshot.load_json(&dir.join("scores.json")).unwrap();
        assert_eq!(scores.len(), 40);
        let neighbors: Vec<NearPoint> = snapshot.load_json(&dir.join("nearest_neighbors.json")).unwrap();
        assert!(neighbors.iter().all(|p| subset.contains(&p.global_index)));
    }

    // a rerun reuses the stored subset and writes nothing
    let mut pipeline = Pipeline::new(&config, snapshot.clone(), &model, &feeder, &attack).unwrap();
    let second = pipeline.run().unwrap();
    assert_eq!(second.num_skipped(), 2 * common::NUM_TEST);
    let store = pipeline.into_store();
    assert_eq!(store.num_writes(), snapshot.num_writes());
    assert_eq!(store.get(&key), snapshot.get(&key));
}

#[test]
fn test_targeted_attack_caches_targets() {
    let feeder = common::feeder(5);
    let model = common::nearest_centroid();
    let attack = AttackKind::Fgsm.builtin().unwrap();
    let config = common::config(AttackKind::Fgsm);

    let mut pipeline = Pipeline::new(&config, MemoryStore::new(), &model, &feeder, &attack).unwrap();
    pipeline.run().unwrap();
    let store = pipeline.into_store();

    let targets: Array1<usize> = store
        .load_json(&ArtifactKey::new("fgsm_targeted/y_val_targets.json"))
        .unwrap();
    let info: Bookkeeping = store.load_json(&ArtifactKey::new("fgsm_targeted/info.json")).unwrap();
    assert_eq!(targets.len(), common::NUM_VAL);
    assert!(info
        .val
        .values()
        .zip(targets.iter())
        .all(|(r, &t)| t != r.label && t < common::NUM_CLASSES));
}

#[test]
fn test_filesystem_run_is_resumable() {
    let dir = tempfile::tempdir().unwrap();
    let feeder = common::feeder(6);
    let model = common::nearest_centroid();
    let attack = common::relocate();
    let config = common::config(AttackKind::DeepFool).with_checkpoint_dir(dir.path());

    let mut pipeline =
        Pipeline::new(&config, FsStore::new(config.model_dir()), &model, &feeder, &attack).unwrap();
    let first = pipeline.run().unwrap();
    assert_eq!(first.num_computed(), 6);

    let g = 2 * common::FLIPPED_ROWS[0] + 1;
    let sample = dir.path().join(format!("val/val_index_{}", g));
    for path in [
        sample.join("pred/scores.json"),
        sample.join("pred/summary.txt"),
        sample.join("adv/deepfool/nearest_neighbors.json"),
        dir.path().join("deepfool/X_val_adv.json"),
        dir.path().join("x_train_preds.json"),
    ] {
        assert!(path.exists(), "{}", path.display());
    }
    let info_before = fs::read(dir.path().join("deepfool/info.json")).unwrap();
    let summary_before = fs::read(sample.join("pred/summary.txt")).unwrap();

    let mut pipeline =
        Pipeline::new(&config, FsStore::new(config.model_dir()), &model, &feeder, &attack).unwrap();
    let second = pipeline.run().unwrap();
    assert_eq!(second.num_skipped(), 6);
    assert_eq!(fs::read(dir.path().join("deepfool/info.json")).unwrap(), info_before);
    assert_eq!(fs::read(sample.join("pred/summary.txt")).unwrap(), summary_before);
}
