//! CSV / TSV reader producing an [`ObservationTable`].
//!
//! Strategy: read all rows as trimmed strings, then type each column. Columns whose
//! non-missing cells all parse as `f64` (or `true`/`false`) become numeric; anything
//! else becomes categorical. Lines starting with the comment byte carry exporter
//! metadata (variable labels, display formats) and are skipped.

use std::io::Read;
use std::path::Path;

use ps_core::{Error, Result};

use crate::table::{Column, ObservationTable};

/// Options for delimited-text input.
#[derive(Debug, Clone)]
pub struct CsvOptions {
    /// Field delimiter.
    pub delimiter: u8,
    /// Metadata comment byte; `None` disables comment skipping.
    pub comment: Option<u8>,
    /// Cell values treated as missing (compared after trimming).
    pub na_tokens: Vec<String>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: b',',
            comment: Some(b'#'),
            na_tokens: vec!["".into(), ".".into(), "NA".into(), "NaN".into()],
        }
    }
}

impl CsvOptions {
    /// Defaults, with a tab delimiter for `.tsv` / `.tab` paths.
    pub fn for_path(path: &Path) -> Self {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase();
        let mut opts = Self::default();
        if ext == "tsv" || ext == "tab" {
            opts.delimiter = b'\t';
        }
        opts
    }

    fn is_na(&self, s: &str) -> bool {
        self.na_tokens.iter().any(|t| t == s)
    }
}

/// Read a delimited file from disk.
pub fn read_csv(path: &Path, opts: &CsvOptions) -> Result<ObservationTable> {
    let file = std::fs::File::open(path)?;
    let table = read_csv_from_reader(file, opts)
        .map_err(|e| match e {
            Error::Parse(msg) => Error::Parse(format!("{}: {}", path.display(), msg)),
            other => other,
        })?;
    log::debug!("read {} rows x {} columns from {}", table.n_rows(), table.n_cols(), path.display());
    Ok(table)
}

/// Read delimited text from any reader.
pub fn read_csv_from_reader<R: Read>(reader: R, opts: &CsvOptions) -> Result<ObservationTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(opts.delimiter)
        .comment(opts.comment)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| Error::Parse(format!("failed to read header: {e}")))?
        .iter()
        .map(|h| h.trim_matches('"').to_string())
        .collect();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(Error::Parse("file has no columns".into()));
    }
    if let Some(j) = headers.iter().position(|h| h.is_empty()) {
        return Err(Error::Parse(format!("column {} has an empty name", j + 1)));
    }

    let n_cols = headers.len();
    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); n_cols];
    for (row, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| Error::Parse(format!("row {}: {e}", row + 1)))?;
        for (j, field) in record.iter().enumerate() {
            let v = if opts.is_na(field) { None } else { Some(field.to_string()) };
            cells[j].push(v);
        }
    }

    let columns = headers.into_iter().zip(cells).map(|(h, c)| (h, type_column(c))).collect();
    ObservationTable::from_columns(columns)
}

fn parse_numeric(s: &str) -> Option<f64> {
    if s.eq_ignore_ascii_case("true") {
        return Some(1.0);
    }
    if s.eq_ignore_ascii_case("false") {
        return Some(0.0);
    }
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn type_column(cells: Vec<Option<String>>) -> Column {
    let parsed: Vec<Option<Option<f64>>> =
        cells.iter().map(|c| c.as_deref().map(parse_numeric)).collect();
    let all_numeric = parsed.iter().all(|p| !matches!(p, Some(None)));
    if all_numeric {
        Column::Numeric(parsed.into_iter().map(Option::flatten).collect())
    } else {
        Column::categorical_from_strings(&cells)
    }
}
