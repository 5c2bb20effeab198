use std::path::PathBuf;
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_pscore"))
}

fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("pscore_cli_{}_{}_{}", std::process::id(), nanos, name));
    p
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn setup(name: &str) -> PathBuf {
    let dir = tmp_dir(name);
    std::fs::create_dir_all(&dir).unwrap();
    let csv = dir.join("data.csv");
    let out = run(&[
        "simulate",
        "--n",
        "300",
        "--groups",
        "3",
        "--clusters",
        "30",
        "--seed",
        "11",
        "-o",
        csv.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "simulate failed: {}", String::from_utf8_lossy(&out.stderr));
    dir
}

const FULL_SPEC: &str = "\
schema_version: pscore_analysis_spec_v0
input:
  path: data.csv
schema:
  treatment: t
  outcome: y
  covariates: [x1, x2, x3, {name: grp, kind: categorical}]
  cluster: cluster
diagnostics: {variant: koenker}
matching: {m: 2, estimands: [att]}
propensity:
  model: gbm
  gbm: {n_trees: 60, seed: 5}
  stop: {method: balance_mean_smd, estimand: ate, every: 10}
weighting: {estimand: ate, variance: cluster}
balance: {threshold: 0.1}
report:
  out_dir: report
  bins: 10
  grid: 41
";

#[test]
fn run_writes_full_report_directory() {
    let dir = setup("run_full");
    let spec = dir.join("analysis.yaml");
    std::fs::write(&spec, FULL_SPEC).unwrap();

    let out = run(&["run", "-c", spec.to_str().unwrap()]);
    assert!(
        out.status.success(),
        "run should succeed, stderr={}",
        String::from_utf8_lossy(&out.stderr)
    );
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["schema_version"].as_str(), Some("pscore_run_result_v0"));
    assert_eq!(v["frame"]["rows"].as_u64(), Some(300));
    assert_eq!(v["diagnostics"]["tests"].as_array().unwrap().len(), 4);
    assert_eq!(v["matching"]["rows"].as_array().unwrap().len(), 2);
    assert!(v["propensity"]["gbm"]["balance_path"].as_array().is_some());
    assert!(v["weighted_regression"]["treatment"]["std_error"].as_f64().unwrap() > 0.0);
    assert!(v["balance"]["after"].as_array().is_some());

    let report = dir.join("report");
    for name in [
        "result.json",
        "diagnostics_model.csv",
        "breusch_pagan.csv",
        "matching.csv",
        "scores.csv",
        "propensity_density.json",
        "propensity_boxplot.json",
        "weighted_regression.csv",
        "balance_smd.csv",
        "balance_regressions.csv",
        "love_plot.json",
    ] {
        assert!(report.join(name).exists(), "missing artifact {name}");
    }
    let listed: Vec<&str> =
        v["artifacts"].as_array().unwrap().iter().map(|a| a.as_str().unwrap()).collect();
    assert_eq!(listed.len(), 10);

    let scores = std::fs::read_to_string(report.join("scores.csv")).unwrap();
    assert!(scores.starts_with("row,treatment,propensity,weight\n"));

    let regs = std::fs::read_to_string(report.join("balance_regressions.csv")).unwrap();
    assert!(regs.starts_with("covariate,model,term,weighted,"));
    let weighted_rows = regs.lines().skip(1).filter(|l| l.split(',').nth(3) == Some("true")).count();
    let plain_rows = regs.lines().skip(1).filter(|l| l.split(',').nth(3) == Some("false")).count();
    assert!(weighted_rows > 0 && weighted_rows == plain_rows, "{regs}");

    // A second run into the same non-empty directory must refuse.
    let out = run(&["run", "-c", spec.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("not empty"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn run_is_deterministic_for_the_same_spec() {
    let dir = setup("run_det");
    let spec_text = "\
schema_version: pscore_analysis_spec_v0
input: {path: data.csv}
schema: {treatment: t, outcome: y, covariates: [x1, x2, x3]}
propensity: {gbm: {n_trees: 30, seed: 9}}
weighting: {estimand: att}
";
    let spec = dir.join("analysis.yaml");
    std::fs::write(&spec, spec_text).unwrap();
    let a = run(&["run", "-c", spec.to_str().unwrap()]);
    let b = run(&["run", "-c", spec.to_str().unwrap()]);
    assert!(a.status.success(), "stderr={}", String::from_utf8_lossy(&a.stderr));
    assert_eq!(a.stdout, b.stdout, "run output should be deterministic");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn run_rejects_unknown_schema_version() {
    let dir = setup("run_bad");
    let spec = dir.join("analysis.yaml");
    std::fs::write(
        &spec,
        "schema_version: pscore_analysis_spec_v9\ninput: {path: data.csv}\nschema: {treatment: t}\n",
    )
    .unwrap();
    let out = run(&["run", "-c", spec.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("schema_version"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn failed_run_leaves_no_report_files() {
    let dir = setup("run_partial");
    let spec = dir.join("analysis.yaml");
    std::fs::write(
        &spec,
        "\
schema_version: pscore_analysis_spec_v0
input: {path: data.csv}
schema: {treatment: t, outcome: y, covariates: [x1, x2, x3]}
diagnostics: {}
propensity: {model: logistic}
report: {out_dir: out, bins: 0}
",
    )
    .unwrap();
    let out = run(&["run", "-c", spec.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("bins"));
    assert!(!dir.join("out").exists(), "report directory should not be created");

    // A stage failure after diagnostics succeeded: nothing is written either.
    std::fs::write(
        &spec,
        "\
schema_version: pscore_analysis_spec_v0
input: {path: data.csv}
schema: {treatment: t, outcome: y, covariates: [x1, x2, x3]}
diagnostics: {}
matching: {bias_adjust_columns: [nope]}
report: {out_dir: out}
",
    )
    .unwrap();
    let out = run(&["run", "-c", spec.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("nope"));
    assert!(!dir.join("out").exists(), "report directory should not be created");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn run_matching_with_explicit_adjustment_columns() {
    let dir = setup("run_adjust");
    let spec = dir.join("analysis.yaml");
    std::fs::write(
        &spec,
        "\
schema_version: pscore_analysis_spec_v0
input: {path: data.csv}
schema:
  treatment: t
  outcome: y
  covariates: [x1, x2, x3, {name: grp, kind: categorical}]
matching: {estimands: [att], bias_adjust_columns: [x1, grp]}
",
    )
    .unwrap();
    let out = run(&["run", "-c", spec.to_str().unwrap()]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["matching"]["bias_adjusted"].as_bool(), Some(true));
    assert_eq!(v["matching"]["rows"].as_array().unwrap().len(), 2);

    let _ = std::fs::remove_dir_all(&dir);
}
