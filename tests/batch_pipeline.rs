use approx::assert_abs_diff_eq;
use phenosimplex::basis::SimplexWarning;
use phenosimplex::progress::NoopBatchProgress;
use phenosimplex::tables::{read_feature_matrix, read_reference_key, write_failures, write_report};
use phenosimplex::{
    Call, Deconvolver, ErrorKind, QuerySample, ReferenceSimplex, RunConfig, SimplexBuilder,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use tempfile::tempdir;

const CENTERS: [(&str, [f64; 3]); 3] = [
    ("Healthy", [0.0, 0.0, 0.0]),
    ("ARPC", [10.0, 0.0, 2.0]),
    ("NEPC", [0.0, 10.0, -2.0]),
];

/// Writes a reference matrix of noisy cohorts and a matching key.
fn write_reference(dir: &std::path::Path, rng: &mut StdRng) -> (std::path::PathBuf, std::path::PathBuf) {
    let mut matrix = String::from("sample\tf1\tf2\tf3\tunused\n");
    let mut key = String::from("sample\tphenotype\n");
    for (label, center) in CENTERS {
        for i in 0..7 {
            let id = format!("{label}_{i}");
            let noise: Vec<f64> = (0..3).map(|_| rng.gen_range(-0.2..0.2)).collect();
            writeln!(
                matrix,
                "{id}\t{}\t{}\t{}\t{}",
                center[0] + noise[0],
                center[1] + noise[1],
                center[2] + noise[2],
                rng.gen_range(0.0..1.0)
            )
            .unwrap();
            writeln!(key, "{id}\t{label}").unwrap();
        }
    }
    // An extreme outlier the median must ignore.
    writeln!(matrix, "ARPC_outlier\t500\t500\t500\t0").unwrap();
    writeln!(key, "ARPC_outlier\tARPC").unwrap();

    let matrix_path = dir.join("reference.tsv");
    let key_path = dir.join("key.tsv");
    fs::write(&matrix_path, matrix).unwrap();
    fs::write(&key_path, key).unwrap();
    (matrix_path, key_path)
}

fn features() -> Vec<String> {
    ["f1", "f2", "f3"].iter().map(|s| s.to_string()).collect()
}

#[test]
fn build_save_load_and_deconvolve_batch() {
    let dir = tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(42);
    let (matrix_path, key_path) = write_reference(dir.path(), &mut rng);

    let wanted = features();
    let reference = read_feature_matrix(&matrix_path, Some(wanted.as_slice())).unwrap();
    let key = read_reference_key(&key_path).unwrap();
    let cohorts = key.resolve(&reference, None).unwrap();
    assert_eq!(cohorts[1].len(), 8);

    let simplex = SimplexBuilder::default().build(&cohorts, &wanted).unwrap();
    assert!(simplex.check_degeneracy().unwrap().is_none());
    let arpc = simplex.vertex("ARPC").unwrap();
    assert_abs_diff_eq!(arpc.vector.values()[0], 10.0, epsilon = 0.25);

    let basis_path = dir.path().join("basis.toml");
    simplex.save(&basis_path).unwrap();
    let loaded = ReferenceSimplex::load(&basis_path).unwrap();
    assert_eq!(loaded, simplex);

    let mut config = RunConfig::default();
    config.classification.phenotype = Some("NEPC".into());
    config.classification.thresholds.whole_genome = 0.3;

    // Healthy plus 40% NEPC, observed at tumor fraction 0.5.
    let healthy = loaded.vertex("Healthy").unwrap().vector;
    let nepc = loaded.vertex("NEPC").unwrap().vector;
    let arpc = loaded.vertex("ARPC").unwrap().vector;
    let tumor = 0.4 * &nepc.values() + 0.6 * &arpc.values();
    let observed = 0.5 * &tumor + 0.5 * &healthy.values();
    let mixed = healthy.with_values(observed).unwrap();

    let samples = vec![
        QuerySample {
            id: "mixed".into(),
            vector: mixed.clone(),
            tumor_fraction: Some(0.5),
        },
        QuerySample {
            id: "no_fraction".into(),
            vector: mixed.clone(),
            tumor_fraction: None,
        },
        QuerySample {
            id: "faint".into(),
            vector: mixed,
            tumor_fraction: Some(0.005),
        },
    ];

    let deconvolver = Deconvolver::new(&loaded, &config).unwrap();
    let report = deconvolver.run_batch(&samples, &NoopBatchProgress);
    assert_eq!(report.successes.len(), 2);
    assert_eq!(
        report.failure("no_fraction").unwrap().kind,
        ErrorKind::UndefinedTumorFraction
    );

    let mixed = report.outcome("mixed").unwrap();
    assert_abs_diff_eq!(mixed.mixture.weight("NEPC").unwrap(), 0.4, epsilon = 1e-6);
    assert_abs_diff_eq!(mixed.mixture.weight("ARPC").unwrap(), 0.6, epsilon = 1e-6);
    assert_eq!(mixed.mixture.dominant(), "ARPC");
    assert_eq!(mixed.call.as_ref().unwrap().call, Call::Positive);
    // The uncorrected sample sits closer to the ARPC mixing line.
    let likelihood = mixed.likelihood.as_ref().unwrap();
    assert_eq!(likelihood.tumor_fraction, 0.5);
    assert_eq!(likelihood.prediction.as_deref(), Some("ARPC"));
    assert!(likelihood.weight("ARPC").unwrap() > likelihood.weight("NEPC").unwrap());

    let faint = report.outcome("faint").unwrap();
    assert!(faint.low_confidence);
    assert_eq!(faint.call.as_ref().unwrap().call, Call::Indeterminate);

    let report_path = dir.path().join("deconvolution.tsv");
    let failures_path = dir.path().join("failures.tsv");
    write_report(&report_path, &report, loaded.phenotypes(), "Healthy").unwrap();
    write_failures(&failures_path, &report.failures).unwrap();

    let written = fs::read_to_string(&report_path).unwrap();
    let mut lines = written.lines();
    assert_eq!(
        lines.next().unwrap(),
        "sample\ttumor_fraction\ttumor_fraction_source\tlow_confidence\tHealthy\tARPC\tNEPC\tresidual\tdominant\tphenotype_of_interest\tthreshold\tcondition\tcall\tlikelihood_tumor_fraction\tlikelihood_ARPC\tlikelihood_NEPC\tlikelihood_prediction"
    );
    let mixed_row = lines.next().unwrap();
    assert!(mixed_row.starts_with("mixed\t0.5\tprovided\tfalse\t"));
    assert!(mixed_row.ends_with("\tARPC"));
    let failures = fs::read_to_string(&failures_path).unwrap();
    assert!(failures.contains("no_fraction\tUndefinedTumorFraction\t"));
}

#[test]
fn query_rows_pick_up_tumor_fractions_by_id() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("query.tsv");
    fs::write(&path, "id\tf1\tf2\tf3\na\t1\t2\t3\nb\t4\t5\t6\n").unwrap();
    let matrix = read_feature_matrix(&path, None).unwrap();
    let fractions = HashMap::from([("b".to_string(), 0.3)]);
    let samples = QuerySample::from_matrix(&matrix, &fractions);
    assert_eq!(samples[0].tumor_fraction, None);
    assert_eq!(samples[1].tumor_fraction, Some(0.3));
    assert_eq!(samples[1].vector.get("f2"), Some(5.0));
}

#[test]
fn collinear_references_warn_but_still_project() {
    let dir = tempdir().unwrap();
    let matrix_path = dir.path().join("reference.tsv");
    let key_path = dir.path().join("key.tsv");
    fs::write(&matrix_path, "sample\tf1\tf2\nh\t0\t0\na\t1\t1\nb\t2\t2\n").unwrap();
    fs::write(&key_path, "sample\tphenotype\nh\tHealthy\na\tA\nb\tB\n").unwrap();

    let reference = read_feature_matrix(&matrix_path, None).unwrap();
    let cohorts = read_reference_key(&key_path)
        .unwrap()
        .resolve(&reference, None)
        .unwrap();
    let simplex = SimplexBuilder::default()
        .build(&cohorts, reference.features())
        .unwrap();
    assert!(matches!(
        simplex.check_degeneracy().unwrap(),
        Some(SimplexWarning::DegenerateSimplex { affine_rank: 1, expected_rank: 2, .. })
    ));

    let config = RunConfig::default();
    let deconvolver = Deconvolver::new(&simplex, &config).unwrap();
    let sample = QuerySample {
        id: "q".into(),
        vector: reference.vector(2).with_values(ndarray::array![1.5, 1.5]).unwrap(),
        tumor_fraction: Some(1.0),
    };
    let first = deconvolver.run_sample(&sample).unwrap();
    let second = deconvolver.run_sample(&sample).unwrap();
    assert_eq!(first, second);
    assert_abs_diff_eq!(first.mixture.residual, 0.0, epsilon = 1e-9);
}
