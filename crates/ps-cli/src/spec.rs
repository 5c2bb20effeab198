//! Analysis spec v0 (YAML or JSON): one file drives load -> diagnose -> estimate -> report.
//!
//! Stage blocks are optional; a missing block skips the stage.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use ps_core::Estimand;
use ps_inference::{
    BiasAdjust, BpVariant, DistanceMetric, GbmConfig, LogisticConfig, MatchConfig, SmdConfig,
    SmdDenominator, StopMethod, VarianceMethod,
};
use ps_translate::{CsvOptions, TableSchema};

pub const SPEC_V0: &str = "pscore_analysis_spec_v0";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisSpecV0 {
    pub schema_version: String,
    pub input: InputSpec,
    pub schema: TableSchema,
    #[serde(default)]
    pub diagnostics: Option<DiagnosticsSettings>,
    #[serde(default)]
    pub matching: Option<MatchingSettings>,
    #[serde(default)]
    pub propensity: Option<PropensitySettings>,
    #[serde(default)]
    pub weighting: Option<WeightingSettings>,
    #[serde(default)]
    pub balance: Option<BalanceSettings>,
    #[serde(default)]
    pub report: Option<ReportSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputSpec {
    /// Data file, relative to the spec file.
    pub path: PathBuf,
    #[serde(default)]
    pub delimiter: Option<char>,
    #[serde(default)]
    pub na_tokens: Option<Vec<String>>,
}

impl InputSpec {
    pub fn csv_options(&self) -> Result<CsvOptions> {
        let mut opts = CsvOptions::for_path(&self.path);
        if let Some(d) = self.delimiter {
            opts.delimiter = delimiter_byte(d)?;
        }
        if let Some(na) = &self.na_tokens {
            opts.na_tokens = na.clone();
        }
        Ok(opts)
    }
}

pub fn delimiter_byte(d: char) -> Result<u8> {
    if !d.is_ascii() {
        bail!("delimiter must be a single ASCII character, got '{d}'");
    }
    Ok(d as u8)
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiagnosticsSettings {
    pub variant: BpVariant,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingSettings {
    pub m: usize,
    pub replace: bool,
    pub metric: DistanceMetric,
    pub ties: bool,
    pub bias_adjust: bool,
    /// Same-arm neighbours for the robust variance; `None` = homoskedastic.
    pub robust_matches: Option<usize>,
    /// Adjust on these covariates (or `name[level]` design columns) instead of all
    /// matching covariates. Non-empty implies bias adjustment.
    pub bias_adjust_columns: Vec<String>,
    pub estimands: Vec<Estimand>,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            m: 1,
            replace: true,
            metric: DistanceMetric::InverseVariance,
            ties: true,
            bias_adjust: false,
            robust_matches: None,
            bias_adjust_columns: Vec::new(),
            estimands: Estimand::ALL.to_vec(),
        }
    }
}

impl MatchingSettings {
    pub fn to_config(&self) -> MatchConfig {
        MatchConfig {
            m: self.m,
            replace: self.replace,
            metric: self.metric,
            ties: self.ties,
            bias_adjust: if self.bias_adjust { BiasAdjust::Covariates } else { BiasAdjust::Off },
            variance: match self.robust_matches {
                Some(matches) => VarianceMethod::Robust { matches },
                None => VarianceMethod::Homoskedastic,
            },
            estimands: self.estimands.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PropensityKind {
    #[default]
    Gbm,
    Logistic,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PropensitySettings {
    pub model: PropensityKind,
    pub gbm: GbmConfig,
    pub logistic: LogisticConfig,
    pub stop: StopMethod,
    pub shuffle: bool,
    /// Overlap summary counts units with scores outside `[trim, 1 - trim]`.
    pub trim: f64,
}

impl Default for PropensitySettings {
    fn default() -> Self {
        Self {
            model: PropensityKind::Gbm,
            gbm: GbmConfig::default(),
            logistic: LogisticConfig::default(),
            stop: StopMethod::AllTrees,
            shuffle: true,
            trim: 0.01,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VarianceChoice {
    /// HC1 sandwich.
    #[default]
    Robust,
    /// Cluster-robust over the schema's cluster column.
    Cluster,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WeightingSettings {
    pub estimand: Estimand,
    pub variance: VarianceChoice,
}

impl Default for WeightingSettings {
    fn default() -> Self {
        Self { estimand: Estimand::Ate, variance: VarianceChoice::Robust }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BalanceSettings {
    pub threshold: f64,
    pub denominator: SmdDenominator,
    pub probability_scale: bool,
}

impl Default for BalanceSettings {
    fn default() -> Self {
        let smd = SmdConfig::default();
        Self { threshold: smd.threshold, denominator: smd.denominator, probability_scale: false }
    }
}

impl BalanceSettings {
    pub fn smd_config(&self) -> SmdConfig {
        SmdConfig { denominator: self.denominator, threshold: self.threshold }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportSettings {
    /// Output directory, relative to the spec file.
    pub out_dir: PathBuf,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default = "default_bins")]
    pub bins: usize,
    #[serde(default = "default_grid")]
    pub grid: usize,
}

fn default_bins() -> usize {
    20
}

fn default_grid() -> usize {
    101
}

/// Read a spec and resolve its relative paths against the spec's directory.
pub fn read_spec(path: &Path) -> Result<AnalysisSpecV0> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read spec {}", path.display()))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    let mut spec: AnalysisSpecV0 = if ext == "json" {
        serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid analysis spec {}", path.display()))?
    } else {
        serde_yaml_ng::from_slice(&bytes)
            .with_context(|| format!("invalid analysis spec {}", path.display()))?
    };
    if spec.schema_version != SPEC_V0 {
        bail!("unsupported schema_version '{}' (expected '{}')", spec.schema_version, SPEC_V0);
    }

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    if spec.input.path.is_relative() {
        spec.input.path = base.join(&spec.input.path);
    }
    if let Some(r) = spec.report.as_mut() {
        if r.out_dir.is_relative() {
            r.out_dir = base.join(&r.out_dir);
        }
        if r.bins == 0 {
            bail!("report.bins must be >= 1");
        }
        if r.grid < 2 {
            bail!("report.grid must be >= 2, got {}", r.grid);
        }
    }
    if spec.weighting.is_some()
        && spec.propensity.is_none()
        && spec.schema.propensity.is_none()
    {
        bail!("weighting needs a propensity block or a schema.propensity column");
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(name: &str, text: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("pscore_spec_{}_{}", std::process::id(), name));
        std::fs::write(&p, text).unwrap();
        p
    }

    #[test]
    fn test_minimal_spec_defaults() {
        let p = write(
            "minimal.yaml",
            "schema_version: pscore_analysis_spec_v0\n\
             input:\n  path: data.csv\n\
             schema:\n  treatment: t\n  outcome: y\n  covariates: [x1, {name: grp, kind: categorical}]\n\
             matching: {}\n",
        );
        let spec = read_spec(&p).unwrap();
        assert!(spec.input.path.ends_with("data.csv"));
        assert_eq!(spec.schema.covariates.len(), 2);
        let m = spec.matching.unwrap().to_config();
        assert_eq!(m.m, 1);
        assert_eq!(m.estimands.len(), 3);
        assert!(spec.propensity.is_none());
    }

    #[test]
    fn test_stage_blocks_parse() {
        let p = write(
            "stages.yaml",
            "schema_version: pscore_analysis_spec_v0\n\
             input: {path: d.tsv}\n\
             schema: {treatment: t, outcome: y, covariates: [x1], cluster: fam}\n\
             propensity:\n  model: gbm\n  gbm: {n_trees: 50, shrinkage: 0.05}\n  stop: {method: balance_mean_smd, estimand: att, every: 5}\n\
             weighting: {estimand: att, variance: cluster}\n\
             balance: {threshold: 0.2, probability_scale: true}\n\
             report: {out_dir: out}\n",
        );
        let spec = read_spec(&p).unwrap();
        assert_eq!(spec.input.csv_options().unwrap().delimiter, b'\t');
        let ps = spec.propensity.unwrap();
        assert_eq!(ps.gbm.n_trees, 50);
        assert_eq!(ps.gbm.interaction_depth, 1);
        assert_eq!(ps.stop, StopMethod::BalanceMeanSmd { estimand: Estimand::Att, every: 5 });
        assert_eq!(spec.weighting.unwrap().variance, VarianceChoice::Cluster);
        assert!(spec.balance.unwrap().probability_scale);
        assert_eq!(spec.report.unwrap().bins, 20);
    }

    #[test]
    fn test_rejects_wrong_version_and_unknown_keys() {
        let p = write(
            "bad_version.yaml",
            "schema_version: v9\ninput: {path: d.csv}\nschema: {treatment: t}\n",
        );
        assert!(read_spec(&p).is_err());
        let p = write(
            "bad_key.yaml",
            "schema_version: pscore_analysis_spec_v0\ninput: {path: d.csv}\nschema: {treatment: t}\nmatchin: {}\n",
        );
        assert!(read_spec(&p).is_err());
        let p = write(
            "no_scores.yaml",
            "schema_version: pscore_analysis_spec_v0\ninput: {path: d.csv}\nschema: {treatment: t, outcome: y}\nweighting: {}\n",
        );
        assert!(read_spec(&p).is_err());
    }

    #[test]
    fn test_rejects_degenerate_report_grid() {
        let base = "schema_version: pscore_analysis_spec_v0\ninput: {path: d.csv}\nschema: {treatment: t}\n";
        let p = write("zero_bins.yaml", &format!("{base}report: {{out_dir: out, bins: 0}}\n"));
        let err = read_spec(&p).unwrap_err();
        assert!(err.to_string().contains("bins"), "{err}");
        let p = write("one_grid.yaml", &format!("{base}report: {{out_dir: out, grid: 1}}\n"));
        assert!(read_spec(&p).is_err());
        let p = write("ok_grid.yaml", &format!("{base}report: {{out_dir: out, bins: 1, grid: 2}}\n"));
        assert!(read_spec(&p).is_ok());
    }

    #[test]
    fn test_bias_adjust_columns_parse() {
        let p = write(
            "adjust_cols.yaml",
            "schema_version: pscore_analysis_spec_v0\n\
             input: {path: d.csv}\n\
             schema: {treatment: t, outcome: y, covariates: [x1, x2]}\n\
             matching: {bias_adjust_columns: [x2]}\n",
        );
        let m = read_spec(&p).unwrap().matching.unwrap();
        assert_eq!(m.bias_adjust_columns, vec!["x2".to_string()]);
        assert!(!m.bias_adjust);
    }
}
