//! `pscore run` orchestration: execute the configured stages in order and write artifacts.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::path::{Path, PathBuf};

use ps_inference::MatchingResult;
use ps_viz::{LovePlotArtifact, PropensityBoxplotArtifact, PropensityDensityArtifact};

use crate::pipeline::{
    self, BalanceReport, DiagnosticsReport, FrameSummary, IpwReport, PropensityReport,
    WeightsReport,
};
use crate::spec::{AnalysisSpecV0, ReportSettings, read_spec};
use crate::tables;

const RUN_RESULT_V0: &str = "pscore_run_result_v0";

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub schema_version: String,
    pub input: String,
    pub frame: FrameSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<DiagnosticsReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matching: Option<MatchingResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propensity: Option<PropensityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<WeightsReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weighted_regression: Option<IpwReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<BalanceReport>,
    /// Files written into the report directory.
    pub artifacts: Vec<String>,
}

/// Refuse a non-empty report directory unless `overwrite` is set. Nothing is created.
fn check_out_dir(dir: &Path, overwrite: bool) -> Result<()> {
    if dir.exists() {
        let non_empty = std::fs::read_dir(dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .next()
            .is_some();
        if non_empty && !overwrite {
            bail!("report directory {} is not empty (set report.overwrite)", dir.display());
        }
    }
    Ok(())
}

pub fn execute(spec: &AnalysisSpecV0) -> Result<RunResult> {
    if let Some(r) = &spec.report {
        check_out_dir(&r.out_dir, r.overwrite)?;
    }

    let frame = pipeline::load_frame(&spec.input.path, &spec.input.csv_options()?, &spec.schema)?;
    let summary = pipeline::describe(&frame)?;

    let diagnostics =
        spec.diagnostics.map(|d| pipeline::diagnostics(&frame, d.variant)).transpose()?;
    let matching =
        spec.matching.as_ref().map(|m| pipeline::matching(&frame, m)).transpose()?;

    let (scores, propensity) = if spec.propensity.is_some() || spec.weighting.is_some() {
        let (s, p) = pipeline::scores_for(&frame, spec.propensity.as_ref())?;
        (Some(s), p)
    } else {
        (None, None)
    };

    let (weights, weighted_regression) = match (&spec.weighting, &scores) {
        (Some(ws), Some(scores)) => {
            let w = pipeline::weights(&frame, scores, ws.estimand)?;
            let reg = if frame.outcome.is_some() {
                Some(pipeline::weighted_regression(&frame, &w.weights, ws)?)
            } else {
                tracing::warn!("no outcome column; skipping weighted outcome regression");
                None
            };
            (Some(w), reg)
        }
        _ => (None, None),
    };

    let balance = spec
        .balance
        .as_ref()
        .map(|b| pipeline::balance(&frame, weights.as_ref().map(|w| w.weights.as_slice()), b))
        .transpose()?;

    let mut result = RunResult {
        schema_version: RUN_RESULT_V0.to_string(),
        input: spec.input.path.display().to_string(),
        frame: summary,
        diagnostics,
        matching,
        propensity,
        weights,
        weighted_regression,
        balance,
        artifacts: Vec::new(),
    };

    if let Some(r) = &spec.report {
        let artifacts = render_artifacts(r, &frame, &result, scores.as_deref())?;
        result.artifacts = artifacts.iter().map(|(name, _)| name.clone()).collect();
        let summary = serde_json::to_vec_pretty(&result)?;
        let mut files = artifacts;
        files.push(("result.json".to_string(), summary));
        write_report(&r.out_dir, &files)?;
        tracing::info!(dir = %r.out_dir.display(), files = files.len(), "report written");
    }
    Ok(result)
}

/// Every report file, rendered in memory before anything touches the disk.
fn render_artifacts(
    report: &ReportSettings,
    frame: &ps_translate::AnalysisFrame,
    result: &RunResult,
    scores: Option<&[f64]>,
) -> Result<Vec<(String, Vec<u8>)>> {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    let mut add = |name: &str, bytes: Vec<u8>| files.push((name.to_string(), bytes));

    if let Some(d) = &result.diagnostics {
        add("diagnostics_model.csv", tables::coefficients_csv(&d.model)?);
        add("breusch_pagan.csv", tables::breusch_pagan_csv(&d.tests)?);
    }
    if let Some(m) = &result.matching {
        add("matching.csv", tables::matching_csv(m)?);
    }
    if let Some(scores) = scores {
        let w = result.weights.as_ref().map(|w| w.weights.as_slice());
        add("scores.csv", tables::scores_csv(&frame.rows, &frame.treatment, scores, w)?);
        let density =
            PropensityDensityArtifact::build(scores, &frame.treatment, report.bins, report.grid)?;
        add("propensity_density.json", serde_json::to_vec_pretty(&density)?);
        let boxplot = PropensityBoxplotArtifact::build(scores, &frame.treatment)?;
        add("propensity_boxplot.json", serde_json::to_vec_pretty(&boxplot)?);
    }
    if let Some(ipw) = &result.weighted_regression {
        add("weighted_regression.csv", tables::coefficients_csv(&ipw.regression.coefficients)?);
    }
    if let Some(b) = &result.balance {
        add("balance_smd.csv", tables::smd_csv(&b.before, b.after.as_deref())?);
        add(
            "balance_regressions.csv",
            tables::balance_regressions_csv(&b.regressions, b.weighted_regressions.as_deref())?,
        );
        if let Some(after) = &b.after {
            let love = LovePlotArtifact::build(&b.before, after, b.threshold)?;
            add("love_plot.json", serde_json::to_vec_pretty(&love)?);
        }
    }
    Ok(files)
}

/// Write all files or none: a failed write removes the files already written, and the
/// directory when this call created it.
fn write_report(dir: &Path, files: &[(String, Vec<u8>)]) -> Result<()> {
    let created = !dir.exists();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report directory {}", dir.display()))?;
    let mut written: Vec<PathBuf> = Vec::with_capacity(files.len());
    for (name, bytes) in files {
        let path = dir.join(name);
        if let Err(e) = std::fs::write(&path, bytes) {
            for p in &written {
                let _ = std::fs::remove_file(p);
            }
            if created {
                let _ = std::fs::remove_dir(dir);
            }
            return Err(e).with_context(|| format!("failed to write {}", path.display()));
        }
        written.push(path);
    }
    Ok(())
}

pub fn cmd_run(config: &Path, output: Option<&PathBuf>) -> Result<()> {
    let spec = read_spec(config)?;
    let result = execute(&spec)?;
    crate::write_json(output, &result)
}
