//! CSV renderings of observation tables and result tables.

use anyhow::Result;
use std::io::Write;

use ps_core::Estimate;
use ps_inference::balance::{BalanceRegression, SmdRow};
use ps_inference::{BreuschPaganResult, CoefficientTable, MatchingResult};
use ps_translate::{Column, ObservationTable};

/// Missing cells are written as `NA`.
pub fn write_observation_table<W: Write>(writer: W, table: &ObservationTable) -> Result<()> {
    let mut w = csv::Writer::from_writer(writer);
    w.write_record(table.names())?;
    let columns: Vec<&Column> =
        table.names().iter().map(|n| table.column(n)).collect::<ps_core::Result<_>>()?;
    for i in 0..table.n_rows() {
        let record: Vec<String> = columns
            .iter()
            .map(|c| match c {
                Column::Numeric(v) => v[i].map_or_else(|| "NA".to_string(), |x| x.to_string()),
                Column::Categorical { codes, levels } => codes[i]
                    .map_or_else(|| "NA".to_string(), |k| levels[k as usize].clone()),
            })
            .collect();
        w.write_record(&record)?;
    }
    w.flush()?;
    Ok(())
}

/// Render a header and rows as CSV bytes.
pub fn csv_bytes(header: &[&str], rows: &[Vec<String>]) -> Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(header)?;
    for r in rows {
        w.write_record(r)?;
    }
    Ok(w.into_inner().map_err(|e| e.into_error())?)
}

fn estimate_cells(e: &Estimate) -> [String; 4] {
    [
        e.estimate.to_string(),
        e.std_error.to_string(),
        e.statistic.to_string(),
        e.p_value.to_string(),
    ]
}

const ESTIMATE_HEADER: [&str; 4] = ["estimate", "std_error", "statistic", "p_value"];

fn with_estimate(lead: &[&'static str]) -> Vec<&'static str> {
    lead.iter().copied().chain(ESTIMATE_HEADER).collect()
}

pub fn coefficients_csv(table: &CoefficientTable) -> Result<Vec<u8>> {
    let rows: Vec<Vec<String>> = table
        .rows
        .iter()
        .map(|r| std::iter::once(r.term.clone()).chain(estimate_cells(&r.estimate)).collect())
        .collect();
    csv_bytes(&with_estimate(&["term"]), &rows)
}

pub fn breusch_pagan_csv(tests: &[BreuschPaganResult]) -> Result<Vec<u8>> {
    let rows: Vec<Vec<String>> = tests
        .iter()
        .map(|t| {
            vec![
                t.covariate.clone(),
                t.statistic.to_string(),
                t.df.to_string(),
                t.p_value.to_string(),
            ]
        })
        .collect();
    csv_bytes(&["covariate", "statistic", "df", "p_value"], &rows)
}

pub fn matching_csv(result: &MatchingResult) -> Result<Vec<u8>> {
    let rows: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|r| {
            let sample = match r.sample {
                ps_core::SampleKind::Sample => "sample",
                ps_core::SampleKind::Population => "population",
            };
            [r.estimand.label().to_string(), sample.to_string()]
                .into_iter()
                .chain(estimate_cells(&r.estimate))
                .collect()
        })
        .collect();
    csv_bytes(&with_estimate(&["estimand", "variance"]), &rows)
}

/// One row per kept frame row; `row` is the 1-based source row.
pub fn scores_csv(
    rows: &[usize],
    treat: &[u8],
    scores: &[f64],
    weights: Option<&[f64]>,
) -> Result<Vec<u8>> {
    let out: Vec<Vec<String>> = rows
        .iter()
        .zip(treat)
        .zip(scores)
        .enumerate()
        .map(|(k, ((&row, &t), &e))| {
            let mut r = vec![(row + 1).to_string(), t.to_string(), e.to_string()];
            if let Some(w) = weights {
                r.push(w[k].to_string());
            }
            r
        })
        .collect();
    let header: &[&str] = if weights.is_some() {
        &["row", "treatment", "propensity", "weight"]
    } else {
        &["row", "treatment", "propensity"]
    };
    csv_bytes(header, &out)
}

pub fn smd_csv(before: &[SmdRow], after: Option<&[SmdRow]>) -> Result<Vec<u8>> {
    let rows: Vec<Vec<String>> = before
        .iter()
        .map(|b| {
            let mut r = vec![
                b.covariate.clone(),
                b.mean_treated.to_string(),
                b.mean_control.to_string(),
                b.sd.to_string(),
                b.smd.to_string(),
            ];
            if let Some(a) = after.and_then(|a| a.iter().find(|a| a.covariate == b.covariate)) {
                r.push(a.mean_treated.to_string());
                r.push(a.mean_control.to_string());
                r.push(a.smd.to_string());
                r.push(a.balanced.to_string());
            }
            r
        })
        .collect();
    let mut header = vec!["covariate", "mean_treated", "mean_control", "sd", "smd"];
    if after.is_some() {
        header.extend(["mean_treated_adj", "mean_control_adj", "smd_adj", "balanced_adj"]);
    }
    csv_bytes(&header, &rows)
}

/// Unweighted rows first, then the weighted ones; the `weighted` column tells them apart.
pub fn balance_regressions_csv(
    unweighted: &[BalanceRegression],
    weighted: Option<&[BalanceRegression]>,
) -> Result<Vec<u8>> {
    let tagged = unweighted
        .iter()
        .map(|r| (false, r))
        .chain(weighted.unwrap_or_default().iter().map(|r| (true, r)));
    let rows: Vec<Vec<String>> = tagged
        .flat_map(|(is_weighted, r)| {
            r.terms.iter().map(move |t| {
                [
                    r.covariate.clone(),
                    format!("{:?}", r.model).to_lowercase(),
                    t.term.clone(),
                    is_weighted.to_string(),
                ]
                .into_iter()
                .chain(estimate_cells(&t.estimate))
                .chain(std::iter::once(t.odds_ratio.map_or_else(String::new, |o| o.to_string())))
                .collect()
            })
        })
        .collect();
    let mut header = with_estimate(&["covariate", "model", "term", "weighted"]);
    header.push("odds_ratio");
    csv_bytes(&header, &rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_table_round_trips_through_reader() {
        let table = ObservationTable::from_columns(vec![
            ("t".into(), Column::Numeric(vec![Some(1.0), Some(0.0), None])),
            (
                "g".into(),
                Column::categorical_from_strings(&[Some("b".into()), None, Some("a".into())]),
            ),
        ])
        .unwrap();
        let mut buf = Vec::new();
        write_observation_table(&mut buf, &table).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "t,g\n1,b\n0,NA\nNA,a\n");
        let back =
            ps_translate::read_csv_from_reader(text.as_bytes(), &Default::default()).unwrap();
        assert_eq!(back.column("t").unwrap(), table.column("t").unwrap());
    }

    #[test]
    fn test_balance_regressions_tag_weighted_rows() {
        use ps_inference::balance::{BalanceModel, BalanceTerm};
        let reg = |estimate: f64| BalanceRegression {
            covariate: "x1".into(),
            model: BalanceModel::Linear,
            terms: vec![BalanceTerm {
                term: "treatment".into(),
                estimate: Estimate::new(estimate, 0.5, 0.1).unwrap(),
                odds_ratio: None,
            }],
            probability_scale: false,
        };
        let before = [reg(2.0)];
        let after = [reg(0.5)];

        let text = String::from_utf8(balance_regressions_csv(&before, Some(&after)).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "covariate,model,term,weighted,estimate,std_error,statistic,p_value,odds_ratio"
        );
        assert_eq!(lines[1], "x1,linear,treatment,false,2,0.5,4,0.1,");
        assert_eq!(lines[2], "x1,linear,treatment,true,0.5,0.5,1,0.1,");

        let plain = String::from_utf8(balance_regressions_csv(&before, None).unwrap()).unwrap();
        assert_eq!(plain.lines().count(), 2);
    }
}
