//! In-memory observation table (rows = subjects, named typed columns).

use std::collections::HashSet;

use ps_core::{Error, Result};

/// A single typed column. Missing cells are `None`.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    /// Numeric column (continuous values, 0/1 indicators, integer codes).
    Numeric(Vec<Option<f64>>),
    /// Text column stored as level codes into `levels` (sorted, unique).
    Categorical {
        /// Level index per row.
        codes: Vec<Option<u32>>,
        /// Level labels.
        levels: Vec<String>,
    },
}

impl Column {
    /// Number of cells.
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(v) => v.len(),
            Column::Categorical { codes, .. } => codes.len(),
        }
    }

    /// `true` when the column has no cells.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when cell `i` is missing.
    pub fn is_missing(&self, i: usize) -> bool {
        match self {
            Column::Numeric(v) => v[i].is_none(),
            Column::Categorical { codes, .. } => codes[i].is_none(),
        }
    }

    /// Count of missing cells.
    pub fn n_missing(&self) -> usize {
        (0..self.len()).filter(|&i| self.is_missing(i)).count()
    }

    /// `true` for [`Column::Numeric`].
    pub fn is_numeric(&self) -> bool {
        matches!(self, Column::Numeric(_))
    }

    /// Build a categorical column from string cells; levels are sorted.
    pub fn categorical_from_strings(cells: &[Option<String>]) -> Self {
        let mut levels: Vec<String> = cells.iter().flatten().cloned().collect();
        levels.sort();
        levels.dedup();
        let codes = cells
            .iter()
            .map(|c| {
                c.as_ref().map(|s| {
                    // `levels` is sorted and contains every non-missing cell.
                    levels.binary_search(s).unwrap_or_default() as u32
                })
            })
            .collect();
        Column::Categorical { codes, levels }
    }
}

/// Named columns of equal length.
#[derive(Debug, Clone, Default)]
pub struct ObservationTable {
    names: Vec<String>,
    columns: Vec<Column>,
    n_rows: usize,
}

impl ObservationTable {
    /// Build a table, checking that names are unique and all columns have the same length.
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self> {
        let n_rows = columns.first().map_or(0, |(_, c)| c.len());
        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(columns.len());
        let mut cols = Vec::with_capacity(columns.len());
        for (name, col) in columns {
            if !seen.insert(name.clone()) {
                return Err(Error::Validation(format!("duplicate column name '{name}'")));
            }
            if col.len() != n_rows {
                return Err(Error::Validation(format!(
                    "column '{}' has {} rows, expected {}",
                    name,
                    col.len(),
                    n_rows
                )));
            }
            names.push(name);
            cols.push(col);
        }
        Ok(Self { names, columns: cols, n_rows })
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns.
    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// Column names in file order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Result<&Column> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|j| &self.columns[j])
            .ok_or_else(|| Error::Validation(format!("column '{name}' not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorical_levels_sorted() {
        let cells = vec![Some("b".to_string()), None, Some("a".to_string()), Some("b".to_string())];
        let col = Column::categorical_from_strings(&cells);
        match col {
            Column::Categorical { codes, levels } => {
                assert_eq!(levels, vec!["a", "b"]);
                assert_eq!(codes, vec![Some(1), None, Some(0), Some(1)]);
            }
            _ => panic!("expected categorical"),
        }
    }

    #[test]
    fn test_from_columns_validation() {
        let ok = ObservationTable::from_columns(vec![
            ("x".into(), Column::Numeric(vec![Some(1.0), None])),
            ("y".into(), Column::Numeric(vec![Some(2.0), Some(3.0)])),
        ])
        .unwrap();
        assert_eq!(ok.n_rows(), 2);
        assert_eq!(ok.column("x").unwrap().n_missing(), 1);
        assert!(ok.column("z").is_err());

        let ragged = ObservationTable::from_columns(vec![
            ("x".into(), Column::Numeric(vec![Some(1.0)])),
            ("y".into(), Column::Numeric(vec![Some(2.0), Some(3.0)])),
        ]);
        assert!(ragged.is_err());

        let dup = ObservationTable::from_columns(vec![
            ("x".into(), Column::Numeric(vec![Some(1.0)])),
            ("x".into(), Column::Numeric(vec![Some(2.0)])),
        ]);
        assert!(dup.is_err());
    }
}
