//! Complete-case analysis frame extracted from a table through a schema.

use std::collections::HashMap;

use ps_core::{Error, Result};

use crate::schema::{CovariateKind, TableSchema};
use crate::table::{Column, ObservationTable};

/// Covariate values over the kept rows.
#[derive(Debug, Clone, PartialEq)]
pub enum CovariateValues {
    /// Numeric values.
    Continuous(Vec<f64>),
    /// Level codes into `levels`. Only levels present in the kept rows are listed.
    Categorical {
        /// Level index per row.
        codes: Vec<u32>,
        /// Level labels.
        levels: Vec<String>,
    },
}

/// One covariate of an [`AnalysisFrame`].
#[derive(Debug, Clone, PartialEq)]
pub struct Covariate {
    /// Column name.
    pub name: String,
    /// Values over the kept rows.
    pub values: CovariateValues,
}

impl Covariate {
    /// `true` for categorical covariates.
    pub fn is_categorical(&self) -> bool {
        matches!(self.values, CovariateValues::Categorical { .. })
    }

    /// Model-matrix columns: the values themselves for a continuous covariate,
    /// one 0/1 indicator per non-reference level (`name[level]`) for a factor.
    pub fn design_columns(&self) -> Vec<(String, Vec<f64>)> {
        match &self.values {
            CovariateValues::Continuous(v) => vec![(self.name.clone(), v.clone())],
            CovariateValues::Categorical { codes, levels } => levels
                .iter()
                .enumerate()
                .skip(1)
                .map(|(k, level)| {
                    let col = codes.iter().map(|&c| if c as usize == k { 1.0 } else { 0.0 }).collect();
                    (format!("{}[{}]", self.name, level), col)
                })
                .collect(),
        }
    }
}

/// Typed, complete-case view of the columns named by a [`TableSchema`].
#[derive(Debug, Clone)]
pub struct AnalysisFrame {
    /// Treatment indicator, each value 0 or 1.
    pub treatment: Vec<u8>,
    /// Outcome, when the schema names one.
    pub outcome: Option<Vec<f64>>,
    /// Covariates in schema order.
    pub covariates: Vec<Covariate>,
    /// Cluster identifiers, when the schema names a cluster column.
    pub cluster: Option<Vec<u64>>,
    /// Precomputed propensity scores, when the schema names one.
    pub propensity: Option<Vec<f64>>,
    /// Indices of kept rows in the source table.
    pub rows: Vec<usize>,
    /// Number of rows dropped for missing values.
    pub n_dropped: usize,
}

impl AnalysisFrame {
    /// Validate `schema` against `table` and extract the complete cases.
    ///
    /// Fails on missing columns, wrong kinds, a covariate missing in every row,
    /// non-binary treatment values, propensity scores outside (0, 1), and when
    /// either treatment arm ends up empty.
    pub fn from_table(table: &ObservationTable, schema: &TableSchema) -> Result<Self> {
        schema.validate(table)?;
        let n = table.n_rows();
        if n == 0 {
            return Err(Error::Validation("table has no rows".into()));
        }

        for cov in &schema.covariates {
            if table.column(&cov.name)?.n_missing() == n {
                return Err(Error::Validation(format!(
                    "covariate '{}' is missing in every row",
                    cov.name
                )));
            }
        }

        let used: Vec<&Column> =
            schema.columns().into_iter().map(|c| table.column(c)).collect::<Result<_>>()?;
        let rows: Vec<usize> = (0..n).filter(|&i| used.iter().all(|c| !c.is_missing(i))).collect();
        let n_dropped = n - rows.len();
        if n_dropped > 0 {
            log::warn!("dropped {} of {} rows with missing values in model columns", n_dropped, n);
        }
        if rows.is_empty() {
            return Err(Error::Validation("no complete rows left after dropping missing values".into()));
        }

        let treat_raw = numeric_rows(table.column(&schema.treatment)?, &rows);
        let mut treatment = Vec::with_capacity(rows.len());
        for (k, &v) in treat_raw.iter().enumerate() {
            let t = match v {
                x if x == 0.0 => 0u8,
                x if x == 1.0 => 1u8,
                other => {
                    return Err(Error::Validation(format!(
                        "treatment '{}' must be 0/1, found {} at row {}",
                        schema.treatment,
                        other,
                        rows[k] + 1
                    )));
                }
            };
            treatment.push(t);
        }
        let n_treated = treatment.iter().filter(|&&t| t == 1).count();
        if n_treated == 0 || n_treated == treatment.len() {
            return Err(Error::Validation(
                "need both treated and control observations".into(),
            ));
        }

        let outcome = match &schema.outcome {
            Some(y) => Some(numeric_rows(table.column(y)?, &rows)),
            None => None,
        };

        let propensity = match &schema.propensity {
            Some(name) => {
                let ps = numeric_rows(table.column(name)?, &rows);
                if let Some((k, e)) = ps.iter().enumerate().find(|(_, e)| !(**e > 0.0 && **e < 1.0)) {
                    return Err(Error::Validation(format!(
                        "propensity '{}' must lie in (0, 1), found {} at row {}",
                        name,
                        e,
                        rows[k] + 1
                    )));
                }
                Some(ps)
            }
            None => None,
        };

        let cluster = match &schema.cluster {
            Some(name) => Some(cluster_ids(table.column(name)?, &rows)),
            None => None,
        };

        let mut covariates = Vec::with_capacity(schema.covariates.len());
        for spec in &schema.covariates {
            let col = table.column(&spec.name)?;
            let values = match spec.kind {
                CovariateKind::Continuous => CovariateValues::Continuous(numeric_rows(col, &rows)),
                CovariateKind::Categorical => factor_rows(col, &rows),
            };
            covariates.push(Covariate { name: spec.name.clone(), values });
        }

        Ok(Self { treatment, outcome, covariates, cluster, propensity, rows, n_dropped })
    }

    /// Number of kept rows.
    pub fn n(&self) -> usize {
        self.treatment.len()
    }

    /// Number of treated rows.
    pub fn n_treated(&self) -> usize {
        self.treatment.iter().filter(|&&t| t == 1).count()
    }

    /// Number of control rows.
    pub fn n_control(&self) -> usize {
        self.n() - self.n_treated()
    }

    /// Outcome values, or an error if the schema has no outcome.
    pub fn outcome(&self) -> Result<&[f64]> {
        self.outcome
            .as_deref()
            .ok_or_else(|| Error::Validation("analysis requires an outcome column".into()))
    }

    /// Covariate by name.
    pub fn covariate(&self, name: &str) -> Result<&Covariate> {
        self.covariates
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::Validation(format!("covariate '{name}' not in schema")))
    }

    /// All model-matrix columns in covariate order.
    pub fn design_columns(&self) -> Vec<(String, Vec<f64>)> {
        self.covariates.iter().flat_map(|c| c.design_columns()).collect()
    }

    /// Row-major covariate design (no intercept) and its column names.
    pub fn design(&self) -> (Vec<Vec<f64>>, Vec<String>) {
        let cols = self.design_columns();
        let names = cols.iter().map(|(n, _)| n.clone()).collect();
        let rows = (0..self.n()).map(|i| cols.iter().map(|(_, c)| c[i]).collect()).collect();
        (rows, names)
    }
}

fn numeric_rows(col: &Column, rows: &[usize]) -> Vec<f64> {
    match col {
        Column::Numeric(v) => rows.iter().map(|&i| v[i].unwrap_or(f64::NAN)).collect(),
        Column::Categorical { codes, .. } => {
            rows.iter().map(|&i| codes[i].map_or(f64::NAN, |c| c as f64)).collect()
        }
    }
}

/// Re-code a column as a factor over the kept rows, keeping only observed levels.
fn factor_rows(col: &Column, rows: &[usize]) -> CovariateValues {
    let labels: Vec<String> = match col {
        Column::Numeric(v) => rows.iter().map(|&i| format_level(v[i].unwrap_or(f64::NAN))).collect(),
        Column::Categorical { codes, levels } => rows
            .iter()
            .map(|&i| codes[i].map(|c| levels[c as usize].clone()).unwrap_or_default())
            .collect(),
    };
    let mut levels: Vec<String> = labels.clone();
    match col {
        Column::Numeric(_) => {
            // Order numeric codes numerically, not lexically.
            levels.sort_by(|a, b| {
                let fa = a.parse::<f64>().unwrap_or(f64::NAN);
                let fb = b.parse::<f64>().unwrap_or(f64::NAN);
                fa.total_cmp(&fb)
            });
        }
        Column::Categorical { .. } => levels.sort(),
    }
    levels.dedup();
    let index: HashMap<&str, u32> =
        levels.iter().enumerate().map(|(k, l)| (l.as_str(), k as u32)).collect();
    let codes = labels.iter().map(|l| index[l.as_str()]).collect();
    CovariateValues::Categorical { codes, levels }
}

fn format_level(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 { format!("{}", v as i64) } else { format!("{}", v) }
}

/// Map cluster labels to dense ids in order of first appearance.
fn cluster_ids(col: &Column, rows: &[usize]) -> Vec<u64> {
    let mut map: HashMap<u64, u64> = HashMap::new();
    let mut out = Vec::with_capacity(rows.len());
    for &i in rows {
        let key = match col {
            Column::Numeric(v) => numeric_label(v[i].unwrap_or(f64::NAN)),
            Column::Categorical { codes, .. } => codes[i].unwrap_or(u32::MAX) as u64,
        };
        let next = map.len() as u64;
        out.push(*map.entry(key).or_insert(next));
    }
    out
}

/// Hash key of a numeric label. `-0.0` and `0.0` are one label, as are all NaNs.
fn numeric_label(v: f64) -> u64 {
    if v == 0.0 {
        0.0f64.to_bits()
    } else if v.is_nan() {
        f64::NAN.to_bits()
    } else {
        v.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CovariateSpec;

    fn table() -> ObservationTable {
        ObservationTable::from_columns(vec![
            ("t".into(), Column::Numeric(vec![Some(1.0), Some(0.0), Some(1.0), Some(0.0), Some(0.0)])),
            ("y".into(), Column::Numeric(vec![Some(5.0), Some(3.0), None, Some(2.0), Some(4.0)])),
            ("x".into(), Column::Numeric(vec![Some(0.1), Some(0.2), Some(0.3), Some(0.4), Some(0.5)])),
            ("edu".into(), Column::Numeric(vec![Some(12.0), Some(8.0), Some(16.0), Some(12.0), Some(8.0)])),
            ("fam".into(), Column::Numeric(vec![Some(7.0), Some(7.0), Some(9.0), Some(3.0), Some(9.0)])),
        ])
        .unwrap()
    }

    #[test]
    fn test_complete_cases_and_factor() {
        let schema = TableSchema::new("t")
            .with_outcome("y")
            .with_covariate(CovariateSpec::continuous("x"))
            .with_covariate(CovariateSpec::categorical("edu"))
            .with_cluster("fam");
        let f = AnalysisFrame::from_table(&table(), &schema).unwrap();
        assert_eq!(f.n(), 4);
        assert_eq!(f.n_dropped, 1);
        assert_eq!(f.rows, vec![0, 1, 3, 4]);
        assert_eq!(f.outcome().unwrap(), &[5.0, 3.0, 2.0, 4.0]);
        assert_eq!(f.cluster.as_deref(), Some(&[0, 0, 1, 2][..]));

        let (rows, names) = f.design();
        // edu levels after dropping row 2: 8, 12 => one dummy for 12
        assert_eq!(names, vec!["x", "edu[12]"]);
        assert_eq!(rows[0], vec![0.1, 1.0]);
        assert_eq!(rows[1], vec![0.2, 0.0]);
    }

    #[test]
    fn test_signed_zero_cluster_labels_coincide() {
        let t = ObservationTable::from_columns(vec![
            ("t".into(), Column::Numeric(vec![Some(1.0), Some(0.0), Some(1.0), Some(0.0)])),
            ("g".into(), Column::Numeric(vec![Some(0.0), Some(-0.0), Some(2.0), Some(-0.0)])),
        ])
        .unwrap();
        let f = AnalysisFrame::from_table(&t, &TableSchema::new("t").with_cluster("g")).unwrap();
        assert_eq!(f.cluster.as_deref(), Some(&[0, 0, 1, 0][..]));
    }

    #[test]
    fn test_non_binary_treatment_fails() {
        let t = ObservationTable::from_columns(vec![
            ("t".into(), Column::Numeric(vec![Some(1.0), Some(2.0), Some(0.0)])),
        ])
        .unwrap();
        let err = AnalysisFrame::from_table(&t, &TableSchema::new("t")).unwrap_err();
        assert!(err.to_string().contains("must be 0/1"), "{err}");
    }

    #[test]
    fn test_all_missing_covariate_fails() {
        let t = ObservationTable::from_columns(vec![
            ("t".into(), Column::Numeric(vec![Some(1.0), Some(0.0)])),
            ("x".into(), Column::Numeric(vec![None, None])),
        ])
        .unwrap();
        let schema = TableSchema::new("t").with_covariate(CovariateSpec::continuous("x"));
        let err = AnalysisFrame::from_table(&t, &schema).unwrap_err();
        assert!(err.to_string().contains("missing in every row"), "{err}");
    }

    #[test]
    fn test_single_arm_fails() {
        let t = ObservationTable::from_columns(vec![
            ("t".into(), Column::Numeric(vec![Some(1.0), Some(1.0)])),
        ])
        .unwrap();
        assert!(AnalysisFrame::from_table(&t, &TableSchema::new("t")).is_err());
    }

    #[test]
    fn test_propensity_range_checked() {
        let t = ObservationTable::from_columns(vec![
            ("t".into(), Column::Numeric(vec![Some(1.0), Some(0.0)])),
            ("ps".into(), Column::Numeric(vec![Some(0.4), Some(1.0)])),
        ])
        .unwrap();
        let schema = TableSchema::new("t").with_propensity("ps");
        assert!(AnalysisFrame::from_table(&t, &schema).is_err());
    }
}
