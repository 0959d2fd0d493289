mod common;

use pl_role_discovery::PipelineError;
use pl_role_discovery::artifacts::{
    ASSIGNMENTS_XLSX, EMBEDDING_FILE, InferenceBundle, MANIFEST_FILE, ROLE_MODEL_FILE,
    SIMILAR_FILE,
};
use pl_role_discovery::dataset::build_cohort;
use pl_role_discovery::discovery::DistinctPrototypeReview;
use pl_role_discovery::pipeline;

use common::{PROFILES, jittered, player_id, row, test_config, three_profile_table};

#[test]
fn bundle_reproduces_population_assignments() {
    let output = pipeline::run(
        &test_config(),
        &three_profile_table(),
        &DistinctPrototypeReview::default(),
    )
    .expect("pipeline");
    let root = tempfile::tempdir().expect("tempdir");
    let dir = output.bundle.write(root.path()).expect("write bundle");
    assert!(dir.ends_with(&output.bundle.manifest.version));

    let loaded = InferenceBundle::load(&dir).expect("load bundle");
    assert_eq!(loaded.manifest.version, output.bundle.manifest.version);
    assert_eq!(loaded.role_model.k, output.bundle.role_model.k);

    let variance = &loaded.manifest.variance_table;
    assert_eq!(variance.len(), loaded.projector.explained_variance.len());
    let last = variance.last().expect("at least one component");
    assert!((last.cumulative_ratio - 1.0).abs() < 1e-9);
    assert!(variance[loaded.projector.retained - 1].cumulative_ratio >= 0.9 - 1e-9);

    for (rec, assigned) in output.cohort.records.iter().zip(&output.bundle.assignments) {
        assert_eq!(rec.player_id, assigned.player_id);
        let scored = loaded.infer(rec).expect("infer");
        assert_eq!(scored.cluster, assigned.cluster, "{}", rec.player);
        assert_eq!(scored.role_name, assigned.role_name);
        assert!((scored.confidence - assigned.confidence).abs() < 1e-6);
    }
    assert!(!loaded.representatives(0).is_empty());
}

#[test]
fn unseen_player_lands_in_matching_prototype() {
    let output = pipeline::run(
        &test_config(),
        &three_profile_table(),
        &DistinctPrototypeReview::default(),
    )
    .expect("pipeline");
    let root = tempfile::tempdir().expect("tempdir");
    let dir = output.bundle.write(root.path()).expect("write bundle");
    let loaded = InferenceBundle::load(&dir).expect("load bundle");

    let striker_cluster = output
        .bundle
        .assignments
        .iter()
        .find(|a| a.player_id == "striker_0")
        .expect("striker assigned")
        .cluster;

    let mut table = three_profile_table();
    table.rows.clear();
    table
        .rows
        .push(row("New Forward", "Club 9", "FW", 1900.0, &jittered(&PROFILES[2].2, 3)));
    let cohort = build_cohort(&table, 0.0).expect("cohort");
    let scored = loaded.infer(&cohort.records[0]).expect("infer");
    assert_eq!(scored.player_id, "new_forward");
    assert_eq!(scored.cluster, striker_cluster);
    assert_eq!(scored.projected.len(), loaded.projector.retained);
}

#[test]
fn zero_minute_player_is_a_divide_by_zero() {
    let output = pipeline::run(
        &test_config(),
        &three_profile_table(),
        &DistinctPrototypeReview::default(),
    )
    .expect("pipeline");
    let root = tempfile::tempdir().expect("tempdir");
    let dir = output.bundle.write(root.path()).expect("write bundle");
    let loaded = InferenceBundle::load(&dir).expect("load bundle");

    let mut table = three_profile_table();
    table.rows.clear();
    table
        .rows
        .push(row("Unused Sub", "Club 1", "MF", 0.0, &[0.0; 15]));
    let cohort = build_cohort(&table, 0.0).expect("cohort");
    let err = loaded.infer(&cohort.records[0]).expect_err("no minutes");
    assert!(matches!(err, PipelineError::DivideByZero { .. }));
}

#[test]
fn bundles_are_write_once() {
    let output = pipeline::run(
        &test_config(),
        &three_profile_table(),
        &DistinctPrototypeReview::default(),
    )
    .expect("pipeline");
    let root = tempfile::tempdir().expect("tempdir");
    let dir = output.bundle.write(root.path()).expect("first write");

    let err = output
        .bundle
        .write(root.path())
        .expect_err("second write must refuse");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ArtifactExists { .. })
    ));

    for file in &output.bundle.manifest.files {
        assert!(dir.join(file).is_file(), "missing {file}");
    }
    for file in [MANIFEST_FILE, ROLE_MODEL_FILE, ASSIGNMENTS_XLSX, EMBEDDING_FILE, SIMILAR_FILE] {
        assert!(output.bundle.manifest.files.iter().any(|f| f == file));
    }
}

#[test]
fn similar_players_stay_in_role_and_survive_reload() {
    let cfg = test_config();
    let output = pipeline::run(&cfg, &three_profile_table(), &DistinctPrototypeReview::default())
        .expect("pipeline");
    let root = tempfile::tempdir().expect("tempdir");
    let dir = output.bundle.write(root.path()).expect("write bundle");
    let loaded = InferenceBundle::load(&dir).expect("load bundle");

    let cluster_of = |id: &str| {
        output
            .bundle
            .assignments
            .iter()
            .find(|a| a.player_id == id)
            .map(|a| a.cluster)
    };
    assert_eq!(loaded.similar.len(), output.bundle.assignments.len());
    for (profile, _, _) in PROFILES {
        let id = player_id(profile, 0);
        let near = loaded.similar_to(&id);
        assert_eq!(near.len(), cfg.similar_players);
        assert!(near.iter().all(|s| s.player_id != id));
        assert!(near.iter().all(|s| cluster_of(&s.player_id) == cluster_of(&id)));
        assert!(near.windows(2).all(|w| w[0].distance <= w[1].distance));
        assert!(near.iter().all(|s| s.player_id.starts_with(&profile.to_ascii_lowercase())));
    }
    assert!(loaded.similar_to("not_in_population").is_empty());
}

#[test]
fn interrupted_write_leaves_no_partial_bundle() {
    let output = pipeline::run(
        &test_config(),
        &three_profile_table(),
        &DistinctPrototypeReview::default(),
    )
    .expect("pipeline");
    let root = tempfile::tempdir().expect("tempdir");
    let version = &output.bundle.manifest.version;

    // Staging left over from a crashed write.
    let staging = root.path().join(format!(".{version}.tmp"));
    std::fs::create_dir(&staging).expect("stale staging dir");
    std::fs::write(staging.join(MANIFEST_FILE), "{").expect("half-written manifest");

    let dir = output.bundle.write(root.path()).expect("write over stale staging");
    assert_eq!(dir, root.path().join(version));
    assert!(!staging.exists());
    InferenceBundle::load(&dir).expect("complete bundle loads");

    let entries: Vec<String> = std::fs::read_dir(root.path())
        .expect("read root")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec![version.clone()]);
}
