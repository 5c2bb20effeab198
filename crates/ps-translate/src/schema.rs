//! Fixed analysis schema: which columns play which role.
//!
//! Column presence and kinds must match exactly; there is no negotiation.

use std::collections::HashSet;

use ps_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::table::{Column, ObservationTable};

/// How a covariate enters the models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CovariateKind {
    /// Numeric covariate used as-is.
    #[default]
    Continuous,
    /// Factor, expanded into indicator columns (first level is the reference).
    Categorical,
}

/// A covariate column and its kind.
///
/// Deserializes from either a bare name (`x1`, continuous) or
/// `{ name: race, kind: categorical }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CovariateSpecRepr")]
pub struct CovariateSpec {
    /// Column name.
    pub name: String,
    /// Covariate kind.
    pub kind: CovariateKind,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CovariateSpecRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        kind: CovariateKind,
    },
}

impl From<CovariateSpecRepr> for CovariateSpec {
    fn from(r: CovariateSpecRepr) -> Self {
        match r {
            CovariateSpecRepr::Name(name) => CovariateSpec::continuous(name),
            CovariateSpecRepr::Full { name, kind } => CovariateSpec { name, kind },
        }
    }
}

impl CovariateSpec {
    /// Continuous covariate.
    pub fn continuous(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: CovariateKind::Continuous }
    }

    /// Categorical covariate.
    pub fn categorical(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: CovariateKind::Categorical }
    }
}

/// Column roles for one analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Binary (0/1) treatment indicator.
    pub treatment: String,
    /// Continuous outcome. Propensity-only analyses may omit it.
    #[serde(default)]
    pub outcome: Option<String>,
    /// Covariates in model order.
    #[serde(default)]
    pub covariates: Vec<CovariateSpec>,
    /// Cluster identifier (e.g. family id for siblings).
    #[serde(default)]
    pub cluster: Option<String>,
    /// Precomputed propensity score.
    #[serde(default)]
    pub propensity: Option<String>,
}

impl TableSchema {
    /// Schema with only a treatment column.
    pub fn new(treatment: impl Into<String>) -> Self {
        Self {
            treatment: treatment.into(),
            outcome: None,
            covariates: Vec::new(),
            cluster: None,
            propensity: None,
        }
    }

    /// Set the outcome column.
    pub fn with_outcome(mut self, name: impl Into<String>) -> Self {
        self.outcome = Some(name.into());
        self
    }

    /// Append a covariate.
    pub fn with_covariate(mut self, spec: CovariateSpec) -> Self {
        self.covariates.push(spec);
        self
    }

    /// Set the cluster column.
    pub fn with_cluster(mut self, name: impl Into<String>) -> Self {
        self.cluster = Some(name.into());
        self
    }

    /// Set the precomputed propensity column.
    pub fn with_propensity(mut self, name: impl Into<String>) -> Self {
        self.propensity = Some(name.into());
        self
    }

    /// Every column name referenced by the schema, in role order.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = vec![self.treatment.as_str()];
        out.extend(self.outcome.as_deref());
        out.extend(self.covariates.iter().map(|c| c.name.as_str()));
        out.extend(self.cluster.as_deref());
        out.extend(self.propensity.as_deref());
        out
    }

    /// Check that every column exists with the kind its role requires.
    pub fn validate(&self, table: &ObservationTable) -> Result<()> {
        let mut seen = HashSet::new();
        for name in self.columns() {
            if !seen.insert(name) {
                return Err(Error::Validation(format!(
                    "column '{name}' is assigned to more than one role"
                )));
            }
        }

        require_numeric(table, &self.treatment, "treatment")?;
        if let Some(y) = &self.outcome {
            require_numeric(table, y, "outcome")?;
        }
        if let Some(ps) = &self.propensity {
            require_numeric(table, ps, "propensity")?;
        }
        if let Some(c) = &self.cluster {
            table.column(c)?;
        }
        for cov in &self.covariates {
            let col = table.column(&cov.name)?;
            if cov.kind == CovariateKind::Continuous && !col.is_numeric() {
                return Err(Error::Validation(format!(
                    "covariate '{}' is declared continuous but contains non-numeric values",
                    cov.name
                )));
            }
        }
        Ok(())
    }
}

fn require_numeric(table: &ObservationTable, name: &str, role: &str) -> Result<()> {
    match table.column(name)? {
        Column::Numeric(_) => Ok(()),
        Column::Categorical { .. } => Err(Error::Validation(format!(
            "{role} column '{name}' must be numeric"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ObservationTable {
        ObservationTable::from_columns(vec![
            ("t".into(), Column::Numeric(vec![Some(1.0), Some(0.0)])),
            ("y".into(), Column::Numeric(vec![Some(2.0), Some(1.0)])),
            (
                "race".into(),
                Column::categorical_from_strings(&[Some("a".into()), Some("b".into())]),
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_validate_ok() {
        let s = TableSchema::new("t")
            .with_outcome("y")
            .with_covariate(CovariateSpec::categorical("race"));
        s.validate(&table()).unwrap();
    }

    #[test]
    fn test_validate_missing_and_kind() {
        let missing = TableSchema::new("t").with_outcome("income");
        assert!(missing.validate(&table()).is_err());

        let wrong_kind = TableSchema::new("t").with_covariate(CovariateSpec::continuous("race"));
        assert!(wrong_kind.validate(&table()).is_err());

        let text_treatment = TableSchema::new("race");
        assert!(text_treatment.validate(&table()).is_err());

        let reused = TableSchema::new("t").with_outcome("t");
        assert!(reused.validate(&table()).is_err());
    }

    #[test]
    fn test_covariate_spec_deserialize_forms() {
        let specs: Vec<CovariateSpec> =
            serde_json::from_str(r#"["x1", {"name": "race", "kind": "categorical"}]"#).unwrap();
        assert_eq!(specs[0], CovariateSpec::continuous("x1"));
        assert_eq!(specs[1], CovariateSpec::categorical("race"));
    }
}
