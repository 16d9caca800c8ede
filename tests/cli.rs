use std::fs;
use std::process::Command;

use tempfile::tempdir;

const REFERENCE: &str = "sample\tf1\tf2\n\
h1\t0.0\t0.1\n\
h2\t0.1\t0.0\n\
h3\t-0.1\t-0.1\n\
t1\t10.0\t0.1\n\
t2\t9.9\t0.0\n\
t3\t10.1\t-0.1\n";

const KEY: &str = "sample\tphenotype\n\
h1\tHealthy\n\
h2\tHealthy\n\
h3\tHealthy\n\
t1\tTumor\n\
t2\tTumor\n\
t3\tTumor\n";

#[test]
fn build_then_deconvolve_writes_report_and_failures() {
    let tmp = tempdir().expect("temporary directory");
    fs::write(tmp.path().join("reference.tsv"), REFERENCE).expect("write reference");
    fs::write(tmp.path().join("key.tsv"), KEY).expect("write key");
    fs::write(
        tmp.path().join("query.tsv"),
        "sample\tf1\tf2\nq1\t3.0\t0.0\nq2\t8.0\t0.0\nq3\t1.0\t0.0\n",
    )
    .expect("write query");
    fs::write(
        tmp.path().join("tfx.tsv"),
        "sample\ttumor_fraction\nq1\t0.5\nq2\t1.0\nq3\tNA\n",
    )
    .expect("write tumor fractions");

    let exe = env!("CARGO_BIN_EXE_phenosimplex");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args(["build", "--reference", "reference.tsv", "--key", "key.tsv"])
        .status()
        .expect("run phenosimplex build");
    assert!(status.success(), "build exited with status {status:?}");
    assert!(tmp.path().join("basis.toml").exists(), "basis.toml missing");

    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "deconvolve",
            "query.tsv",
            "--basis",
            "basis.toml",
            "--tumor-fractions",
            "tfx.tsv",
            "--phenotype",
            "Tumor",
            "--threshold",
            "0.5",
        ])
        .status()
        .expect("run phenosimplex deconvolve");
    assert!(status.success(), "deconvolve exited with status {status:?}");

    let report = fs::read_to_string(tmp.path().join("deconvolution.tsv")).expect("report");
    let rows: Vec<&str> = report.lines().collect();
    assert_eq!(rows.len(), 3, "header plus two successful samples");
    let header: Vec<&str> = rows[0].split('\t').collect();
    let q1: Vec<&str> = rows[1].split('\t').collect();
    assert_eq!(&q1[..3], ["q1", "0.5", "provided"]);
    let column = |name: &str| header.iter().position(|h| *h == name).expect(name);
    assert_eq!(q1[column("call")], "positive");
    assert_eq!(q1[column("likelihood_tumor_fraction")], "0.5");
    assert_eq!(q1[column("likelihood_Tumor")], "1");
    assert_eq!(q1[column("likelihood_prediction")], "Tumor");
    assert!(header.iter().all(|h| *h != "likelihood_Healthy"));
    assert!(rows[2].starts_with("q2\t1\tprovided\t"));

    let failures = fs::read_to_string(tmp.path().join("failures.tsv")).expect("failures");
    assert!(failures.contains("q3\tUndefinedTumorFraction"));
}

fn build_basis(dir: &std::path::Path) {
    fs::write(dir.join("reference.tsv"), REFERENCE).expect("write reference");
    fs::write(dir.join("key.tsv"), KEY).expect("write key");
    let status = Command::new(env!("CARGO_BIN_EXE_phenosimplex"))
        .current_dir(dir)
        .args(["build", "--reference", "reference.tsv", "--key", "key.tsv"])
        .status()
        .expect("run phenosimplex build");
    assert!(status.success(), "build exited with status {status:?}");
}

#[test]
fn unreadable_query_rows_fail_alone() {
    let tmp = tempdir().expect("temporary directory");
    build_basis(tmp.path());
    fs::write(
        tmp.path().join("query.tsv"),
        "sample\tf1\tf2\nq1\t3.0\t0.0\nq2\tNA\t0.0\nq3\t1.0\t0.0\nq4\t2.0\t0.0\n",
    )
    .expect("write query");
    fs::write(
        tmp.path().join("tfx.tsv"),
        "sample\ttumor_fraction\nq1\t0.5\nq2\t0.5\nq3\t0.5\nq4\tunknown\n",
    )
    .expect("write tumor fractions");

    let status = Command::new(env!("CARGO_BIN_EXE_phenosimplex"))
        .current_dir(tmp.path())
        .args(["deconvolve", "query.tsv", "--basis", "basis.toml"])
        .args(["--tumor-fractions", "tfx.tsv"])
        .status()
        .expect("run phenosimplex deconvolve");
    assert!(status.success(), "deconvolve exited with status {status:?}");

    let report = fs::read_to_string(tmp.path().join("deconvolution.tsv")).expect("report");
    let samples: Vec<&str> = report
        .lines()
        .skip(1)
        .filter_map(|line| line.split('\t').next())
        .collect();
    assert_eq!(samples, ["q1", "q3"]);

    let failures = fs::read_to_string(tmp.path().join("failures.tsv")).expect("failures");
    assert!(failures.contains("q2\tSchemaMismatch\t"), "{failures}");
    assert!(failures.contains("q4\tUndefinedTumorFraction\t"), "{failures}");
}

#[test]
fn failures_file_is_rewritten_when_all_samples_succeed() {
    let tmp = tempdir().expect("temporary directory");
    build_basis(tmp.path());
    fs::write(tmp.path().join("failures.tsv"), "sample\terror_kind\tmessage\nold\tX\tstale\n")
        .expect("write stale failures");
    fs::write(tmp.path().join("query.tsv"), "sample\tf1\tf2\nq1\t10.0\t0.0\n")
        .expect("write query");
    fs::write(tmp.path().join("tfx.tsv"), "sample\ttumor_fraction\nq1\t1.0\n")
        .expect("write tumor fractions");

    let status = Command::new(env!("CARGO_BIN_EXE_phenosimplex"))
        .current_dir(tmp.path())
        .args(["deconvolve", "query.tsv", "--basis", "basis.toml"])
        .args(["--tumor-fractions", "tfx.tsv"])
        .status()
        .expect("run phenosimplex deconvolve");
    assert!(status.success());

    let failures = fs::read_to_string(tmp.path().join("failures.tsv")).expect("failures");
    assert_eq!(failures, "sample\terror_kind\tmessage\n");
}

#[test]
fn missing_basis_file_exits_with_error() {
    let tmp = tempdir().expect("temporary directory");
    fs::write(tmp.path().join("query.tsv"), "sample\tf1\nq\t1\n").expect("write query");
    let output = Command::new(env!("CARGO_BIN_EXE_phenosimplex"))
        .current_dir(tmp.path())
        .args(["deconvolve", "query.tsv", "--basis", "absent.toml"])
        .output()
        .expect("run phenosimplex deconvolve");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}

#[test]
fn roc_reports_auc() {
    let tmp = tempdir().expect("temporary directory");
    fs::write(
        tmp.path().join("scores.tsv"),
        "sample\tTumor\ttruth\na\t0.9\t1\nb\t0.8\t1\nc\t0.2\t0\nd\t0.1\t0\n",
    )
    .expect("write scores");
    let output = Command::new(env!("CARGO_BIN_EXE_phenosimplex"))
        .current_dir(tmp.path())
        .args(["roc", "scores.tsv", "--score-column", "Tumor", "--num-thresholds", "100"])
        .output()
        .expect("run phenosimplex roc");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("AUC: 1.0000"));
}
