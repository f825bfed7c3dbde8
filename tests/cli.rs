mod common;

use common::simulate_cohort;
use std::fs;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn run_writes_tables_for_both_outcomes() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("cohort.tsv");
    simulate_cohort(200, 23).write_tsv(&input);

    let exe = env!("CARGO_BIN_EXE_rearrest");
    let output = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "run",
            input.to_str().expect("path str"),
            "--output-dir",
            "results",
            "--cache-dir",
            "cache",
            "--repetitions",
            "2",
        ])
        .output()
        .expect("run rearrest cli");

    assert!(
        output.status.success(),
        "CLI exited with status {:?}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    let results = tmp.path().join("results");
    for outcome in ["violent", "nonviolent"] {
        for table in ["km_overall.tsv", "cox.tsv", "error_cv.tsv", "auc.tsv", "summary.txt"] {
            let path = results.join(format!("{outcome}_{table}"));
            assert!(path.exists(), "{} missing", path.display());
        }
    }
    assert!(tmp.path().join("cache").join("violent_auc_2_seed20130325.toml").exists());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Loaded 200 subjects"));
    assert!(stdout.contains("Improvement in time-dependent AUC"));
}

#[test]
fn require_cache_fails_without_artifacts() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("cohort.tsv");
    simulate_cohort(120, 29).write_tsv(&input);

    let output = Command::new(env!("CARGO_BIN_EXE_rearrest"))
        .current_dir(tmp.path())
        .args([
            "auc",
            input.to_str().expect("path str"),
            "--outcome",
            "violent",
            "--require-cache",
        ])
        .output()
        .expect("run rearrest cli");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "stderr: {stderr}");
    assert!(stderr.contains("recomputation is disabled"));
}

#[test]
fn curves_reports_the_log_rank_test() {
    let tmp = tempdir().expect("temporary directory");
    let input = tmp.path().join("cohort.tsv");
    simulate_cohort(150, 31).write_tsv(&input);

    let output = Command::new(env!("CARGO_BIN_EXE_rearrest"))
        .current_dir(tmp.path())
        .args(["curves", input.to_str().expect("path str"), "--outcome", "violent"])
        .output()
        .expect("run rearrest cli");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Log-rank test"));
    let high = fs::read_to_string(tmp.path().join("results").join("violent_km_dacc_high.tsv"))
        .expect("high-dACC curve");
    assert!(high.starts_with("time\tsurvival\n0.0000000000\t1.0000000000"));
}

#[test]
fn version_names_the_binary() {
    let output = Command::new(env!("CARGO_BIN_EXE_rearrest"))
        .arg("version")
        .output()
        .expect("run rearrest cli");
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("rearrest "));
}
