//! pscore CLI

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};

use ps_core::Estimand;
use ps_inference::{
    BpVariant, DistanceMetric, GbmConfig, SimulationConfig, SmdDenominator, StopMethod,
    generate_dataset,
};
use ps_translate::{AnalysisFrame, CovariateSpec, CsvOptions, TableSchema};
use ps_viz::{LovePlotArtifact, PropensityBoxplotArtifact, PropensityDensityArtifact};

mod pipeline;
mod run;
mod spec;
mod tables;

use spec::{
    BalanceSettings, MatchingSettings, PropensityKind, PropensitySettings, VarianceChoice,
    WeightingSettings,
};

#[derive(Parser)]
#[command(name = "pscore")]
#[command(about = "pscore - propensity-score analysis of observational data")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

/// Input file and column roles.
#[derive(Args, Debug, Clone)]
struct DataArgs {
    /// Input data (CSV; `.tsv` / `.tab` are read tab-delimited)
    #[arg(short, long)]
    input: PathBuf,

    /// Treatment column (0/1)
    #[arg(long, default_value = "t")]
    treatment: String,

    /// Outcome column
    #[arg(long)]
    outcome: Option<String>,

    /// Continuous covariates (comma-separated)
    #[arg(long, value_delimiter = ',')]
    covariates: Vec<String>,

    /// Categorical covariates (comma-separated), expanded to indicator columns
    #[arg(long, value_delimiter = ',')]
    categorical: Vec<String>,

    /// Cluster id column
    #[arg(long)]
    cluster: Option<String>,

    /// Precomputed propensity score column
    #[arg(long)]
    propensity: Option<String>,

    /// Field delimiter (overrides the extension default)
    #[arg(long)]
    delimiter: Option<char>,

    /// Missing-value tokens (comma-separated; default: empty, ".", NA, NaN)
    #[arg(long = "na", value_delimiter = ',')]
    na_tokens: Vec<String>,
}

impl DataArgs {
    fn schema(&self) -> TableSchema {
        let mut s = TableSchema::new(&self.treatment);
        s.outcome = self.outcome.clone();
        s.cluster = self.cluster.clone();
        s.propensity = self.propensity.clone();
        for c in &self.covariates {
            s = s.with_covariate(CovariateSpec::continuous(c));
        }
        for c in &self.categorical {
            s = s.with_covariate(CovariateSpec::categorical(c));
        }
        s
    }

    fn csv_options(&self) -> Result<CsvOptions> {
        let mut opts = CsvOptions::for_path(&self.input);
        if let Some(d) = self.delimiter {
            opts.delimiter = spec::delimiter_byte(d)?;
        }
        if !self.na_tokens.is_empty() {
            opts.na_tokens = self.na_tokens.clone();
        }
        Ok(opts)
    }

    fn load(&self) -> Result<AnalysisFrame> {
        pipeline::load_frame(&self.input, &self.csv_options()?, &self.schema())
    }
}

/// Propensity model used when no `--propensity` column is given.
#[derive(Args, Debug, Clone)]
struct ScoreArgs {
    /// Propensity model
    #[arg(long, value_enum, default_value = "gbm")]
    model: PropensityKind,

    /// Boosting iterations
    #[arg(long, default_value = "100")]
    n_trees: usize,

    /// Seed for bagging and row shuffling
    #[arg(long, default_value = "0")]
    seed: u64,
}

impl ScoreArgs {
    fn settings(&self) -> PropensitySettings {
        PropensitySettings {
            model: self.model,
            gbm: GbmConfig { n_trees: self.n_trees, seed: self.seed, ..GbmConfig::default() },
            ..PropensitySettings::default()
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BpArg {
    Koenker,
    Original,
}

impl From<BpArg> for BpVariant {
    fn from(v: BpArg) -> Self {
        match v {
            BpArg::Koenker => BpVariant::Koenker,
            BpArg::Original => BpVariant::Original,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MetricArg {
    InverseVariance,
    Mahalanobis,
    Euclidean,
}

impl From<MetricArg> for DistanceMetric {
    fn from(v: MetricArg) -> Self {
        match v {
            MetricArg::InverseVariance => DistanceMetric::InverseVariance,
            MetricArg::Mahalanobis => DistanceMetric::Mahalanobis,
            MetricArg::Euclidean => DistanceMetric::Euclidean,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StopArg {
    AllTrees,
    Validation,
    Balance,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a seeded synthetic dataset (CSV)
    Simulate {
        /// Rows
        #[arg(long, default_value = "500")]
        n: usize,

        /// Continuous covariates x1..xk
        #[arg(long, default_value = "3")]
        covariates: usize,

        /// Constant treatment effect
        #[arg(long, default_value = "2.0")]
        effect: f64,

        /// Selection strength on the covariates
        #[arg(long, default_value = "0.8")]
        selection: f64,

        /// Levels of the categorical covariate `grp` (0 = none)
        #[arg(long, default_value = "0")]
        groups: usize,

        /// Clusters (0 = no cluster column)
        #[arg(long, default_value = "0")]
        clusters: usize,

        /// Log-variance slope of the noise in x1
        #[arg(long, default_value = "0.0")]
        heteroskedasticity: f64,

        #[arg(long, default_value = "42")]
        seed: u64,

        /// Output CSV. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Frame summary: kept/dropped rows, arm sizes, per-arm covariate statistics
    Describe {
        #[command(flatten)]
        data: DataArgs,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// OLS of outcome on treatment + covariates, Breusch-Pagan test per covariate
    Bptest {
        #[command(flatten)]
        data: DataArgs,

        #[arg(long, value_enum, default_value = "koenker")]
        variant: BpArg,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Nearest-neighbour matching estimators (ATE/ATT/ATC, sample and population variance)
    Match {
        #[command(flatten)]
        data: DataArgs,

        /// Matches per unit
        #[arg(short, long, default_value = "1")]
        m: usize,

        /// Match without replacement
        #[arg(long)]
        no_replace: bool,

        #[arg(long, value_enum, default_value = "inverse-variance")]
        metric: MetricArg,

        /// Drop units tied with the m-th match
        #[arg(long)]
        no_ties: bool,

        /// Regression bias adjustment on the matching covariates
        #[arg(long)]
        bias_adjust: bool,

        /// Bias-adjust on these covariates only (comma-separated; implies --bias-adjust)
        #[arg(long, value_delimiter = ',')]
        adjust_on: Vec<String>,

        /// Robust variance with this many same-arm neighbours
        #[arg(long)]
        robust: Option<usize>,

        /// Estimands (comma-separated)
        #[arg(long, value_delimiter = ',', default_values = ["ate", "att", "atc"])]
        estimand: Vec<Estimand>,

        /// Estimator table (CSV)
        #[arg(long)]
        table: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Fit a propensity model (boosted trees or logistic regression)
    Propensity {
        #[command(flatten)]
        data: DataArgs,

        #[arg(long, value_enum, default_value = "gbm")]
        model: PropensityKind,

        #[arg(long, default_value = "100")]
        n_trees: usize,

        /// Splits per tree
        #[arg(long, default_value = "1")]
        depth: usize,

        #[arg(long, default_value = "0.1")]
        shrinkage: f64,

        #[arg(long, default_value = "0.5")]
        bag_fraction: f64,

        #[arg(long, default_value = "1.0")]
        train_fraction: f64,

        #[arg(long, default_value = "10")]
        min_obs: usize,

        #[arg(long, default_value = "0")]
        seed: u64,

        /// Iteration selection
        #[arg(long, value_enum, default_value = "all-trees")]
        stop: StopArg,

        /// Estimand balanced by `--stop balance`
        #[arg(long, default_value = "att")]
        stop_estimand: Estimand,

        /// Evaluate balance every this many trees
        #[arg(long, default_value = "10")]
        every: usize,

        /// Keep the input row order (no shuffle)
        #[arg(long)]
        no_shuffle: bool,

        /// Overlap trimming threshold
        #[arg(long, default_value = "0.01")]
        trim: f64,

        /// Scores per row (CSV)
        #[arg(long)]
        scores: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Inverse-probability weights from propensity scores
    Weights {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        score: ScoreArgs,

        #[arg(long, default_value = "ate")]
        estimand: Estimand,

        /// Scores and weights per row (CSV)
        #[arg(long)]
        table: Option<PathBuf>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Weighted regression of outcome on treatment + covariates with IPW weights
    Ipw {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        score: ScoreArgs,

        #[arg(long, default_value = "ate")]
        estimand: Estimand,

        #[arg(long, value_enum, default_value = "robust")]
        variance: VarianceChoice,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Standardized differences and balance regressions, optionally after weighting
    Balance {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        score: ScoreArgs,

        /// Weight by this estimand before comparing (needs scores)
        #[arg(long)]
        estimand: Option<Estimand>,

        #[arg(long, default_value = "0.1")]
        threshold: f64,

        /// Use the treated-arm SD as the SMD denominator
        #[arg(long)]
        treated_sd: bool,

        /// Report factor balance on the probability scale
        #[arg(long)]
        probability_scale: bool,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Visualization artifacts
    Viz {
        #[command(subcommand)]
        command: VizCommands,
    },

    /// Run an analysis spec (YAML/JSON)
    Run {
        /// Analysis spec (`schema_version: pscore_analysis_spec_v0`)
        #[arg(short, long)]
        config: PathBuf,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version
    Version,
}

#[derive(Subcommand)]
enum VizCommands {
    /// Propensity-score histogram/KDE and boxplot per arm
    Propensity {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        score: ScoreArgs,

        #[arg(long, default_value = "20")]
        bins: usize,

        /// KDE grid points on [0, 1]
        #[arg(long, default_value = "101")]
        grid: usize,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Love plot: SMD per covariate before and after weighting
    Love {
        #[command(flatten)]
        data: DataArgs,

        #[command(flatten)]
        score: ScoreArgs,

        #[arg(long, default_value = "ate")]
        estimand: Estimand,

        #[arg(long, default_value = "0.1")]
        threshold: f64,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            n,
            covariates,
            effect,
            selection,
            groups,
            clusters,
            heteroskedasticity,
            seed,
            output,
        } => {
            let cfg = SimulationConfig {
                n,
                n_covariates: covariates,
                effect,
                selection,
                n_groups: groups,
                n_clusters: clusters,
                heteroskedasticity,
                seed,
            };
            cmd_simulate(&cfg, output.as_ref())
        }
        Commands::Describe { data, output } => {
            let frame = data.load()?;
            write_json(output.as_ref(), &pipeline::describe(&frame)?)
        }
        Commands::Bptest { data, variant, output } => {
            let frame = data.load()?;
            write_json(output.as_ref(), &pipeline::diagnostics(&frame, variant.into())?)
        }
        Commands::Match {
            data,
            m,
            no_replace,
            metric,
            no_ties,
            bias_adjust,
            adjust_on,
            robust,
            estimand,
            table,
            output,
        } => {
            let settings = MatchingSettings {
                m,
                replace: !no_replace,
                metric: metric.into(),
                ties: !no_ties,
                bias_adjust,
                robust_matches: robust,
                bias_adjust_columns: adjust_on,
                estimands: estimand,
            };
            let frame = data.load()?;
            let result = pipeline::matching(&frame, &settings)?;
            if let Some(path) = &table {
                write_file(path, &tables::matching_csv(&result)?)?;
            }
            write_json(output.as_ref(), &result)
        }
        Commands::Propensity {
            data,
            model,
            n_trees,
            depth,
            shrinkage,
            bag_fraction,
            train_fraction,
            min_obs,
            seed,
            stop,
            stop_estimand,
            every,
            no_shuffle,
            trim,
            scores,
            output,
        } => {
            let settings = PropensitySettings {
                model,
                gbm: GbmConfig {
                    n_trees,
                    interaction_depth: depth,
                    shrinkage,
                    bag_fraction,
                    train_fraction,
                    min_obs_in_node: min_obs,
                    seed,
                },
                stop: match stop {
                    StopArg::AllTrees => StopMethod::AllTrees,
                    StopArg::Validation => StopMethod::Validation,
                    StopArg::Balance => {
                        StopMethod::BalanceMeanSmd { estimand: stop_estimand, every }
                    }
                },
                shuffle: !no_shuffle,
                trim,
                ..PropensitySettings::default()
            };
            let frame = data.load()?;
            let report = pipeline::propensity(&frame, &settings)?;
            if let Some(path) = &scores {
                let csv = tables::scores_csv(&frame.rows, &frame.treatment, &report.scores, None)?;
                write_file(path, &csv)?;
            }
            write_json(output.as_ref(), &report)
        }
        Commands::Weights { data, score, estimand, table, output } => {
            let frame = data.load()?;
            let scores = frame_scores(&frame, &score)?;
            let report = pipeline::weights(&frame, &scores, estimand)?;
            if let Some(path) = &table {
                let csv = tables::scores_csv(
                    &frame.rows,
                    &frame.treatment,
                    &scores,
                    Some(report.weights.as_slice()),
                )?;
                write_file(path, &csv)?;
            }
            write_json(output.as_ref(), &report)
        }
        Commands::Ipw { data, score, estimand, variance, output } => {
            let frame = data.load()?;
            let scores = frame_scores(&frame, &score)?;
            let w = pipeline::weights(&frame, &scores, estimand)?;
            let settings = WeightingSettings { estimand, variance };
            write_json(
                output.as_ref(),
                &pipeline::weighted_regression(&frame, &w.weights, &settings)?,
            )
        }
        Commands::Balance {
            data,
            score,
            estimand,
            threshold,
            treated_sd,
            probability_scale,
            output,
        } => {
            let frame = data.load()?;
            let weights = match estimand {
                Some(e) => {
                    let scores = frame_scores(&frame, &score)?;
                    Some(pipeline::weights(&frame, &scores, e)?.weights)
                }
                None => None,
            };
            let settings = BalanceSettings {
                threshold,
                denominator: if treated_sd {
                    SmdDenominator::Treated
                } else {
                    SmdDenominator::Pooled
                },
                probability_scale,
            };
            let report = pipeline::balance(&frame, weights.as_deref(), &settings)?;
            write_json(output.as_ref(), &report)
        }
        Commands::Viz { command } => match command {
            VizCommands::Propensity { data, score, bins, grid, output } => {
                let frame = data.load()?;
                let scores = frame_scores(&frame, &score)?;
                let density =
                    PropensityDensityArtifact::build(&scores, &frame.treatment, bins, grid)?;
                let boxplot = PropensityBoxplotArtifact::build(&scores, &frame.treatment)?;
                write_json(
                    output.as_ref(),
                    &serde_json::json!({ "density": density, "boxplot": boxplot }),
                )
            }
            VizCommands::Love { data, score, estimand, threshold, output } => {
                let frame = data.load()?;
                let w = pipeline::weights(&frame, &frame_scores(&frame, &score)?, estimand)?;
                let settings = BalanceSettings { threshold, ..BalanceSettings::default() };
                let b = pipeline::balance(&frame, Some(w.weights.as_slice()), &settings)?;
                let Some(after) = &b.after else {
                    bail!("weighted balance table missing");
                };
                write_json(output.as_ref(), &LovePlotArtifact::build(&b.before, after, threshold)?)
            }
        },
        Commands::Run { config, output } => run::cmd_run(&config, output.as_ref()),
        Commands::Version => {
            println!("pscore {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Scores from the `--propensity` column, else from the requested model.
fn frame_scores(frame: &AnalysisFrame, score: &ScoreArgs) -> Result<Vec<f64>> {
    if frame.propensity.is_some() {
        return Ok(pipeline::scores_for(frame, None)?.0);
    }
    Ok(pipeline::scores_for(frame, Some(&score.settings()))?.0)
}

fn cmd_simulate(cfg: &SimulationConfig, output: Option<&PathBuf>) -> Result<()> {
    let table = generate_dataset(cfg)?;
    tracing::info!(rows = table.n_rows(), seed = cfg.seed, "simulated dataset");
    match output {
        Some(path) => tables::write_observation_table(std::fs::File::create(path)?, &table),
        None => tables::write_observation_table(std::io::stdout().lock(), &table),
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

pub(crate) fn write_json<T: Serialize>(output: Option<&PathBuf>, value: &T) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(value)?);
    }
    Ok(())
}
