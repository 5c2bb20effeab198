use ps_translate::{AnalysisFrame, CovariateSpec, CsvOptions, TableSchema, read_csv};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn tmp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let mut p = std::env::temp_dir();
    p.push(format!("pscore_translate_{}_{}_{}", std::process::id(), nanos, name));
    p
}

const EXPORT: &str = "\
# label treat: treated in 1976
# label re78: real earnings 1978
treat\tre78\tage\trace\tfam
1\t9930.0\t37\tblack\t1
0\t3595.9\t22\thispan\t1
1\tNA\t30\tblack\t2
0\t24909.5\t27\twhite\t3
1\t7506.1\t.\twhite\t2
0\t289.8\t33\tblack\t3
";

#[test]
fn tsv_export_loads_into_complete_case_frame() {
    let path = tmp_path("lalonde.tsv");
    std::fs::write(&path, EXPORT).unwrap();

    let opts = CsvOptions::for_path(&path);
    assert_eq!(opts.delimiter, b'\t');
    let table = read_csv(&path, &opts).unwrap();
    assert_eq!(table.n_rows(), 6);
    assert_eq!(table.names(), &["treat", "re78", "age", "race", "fam"]);
    assert!(table.column("age").unwrap().is_numeric());
    assert!(!table.column("race").unwrap().is_numeric());

    let schema = TableSchema::new("treat")
        .with_outcome("re78")
        .with_covariate(CovariateSpec::continuous("age"))
        .with_covariate(CovariateSpec::categorical("race"))
        .with_cluster("fam");
    let frame = AnalysisFrame::from_table(&table, &schema).unwrap();
    assert_eq!(frame.n(), 4);
    assert_eq!(frame.n_dropped, 2);
    assert_eq!(frame.rows, vec![0, 1, 3, 5]);
    assert_eq!(frame.n_treated(), 1);

    let (x, names) = frame.design();
    assert_eq!(names, vec!["age", "race[hispan]", "race[white]"]);
    assert_eq!(x[1], vec![22.0, 1.0, 0.0]);
    assert_eq!(x[2], vec![27.0, 0.0, 1.0]);
    assert_eq!(frame.cluster.as_deref(), Some(&[0, 0, 1, 1][..]));

    let _ = std::fs::remove_file(&path);
}

#[test]
fn missing_schema_column_is_reported_by_name() {
    let path = tmp_path("short.csv");
    std::fs::write(&path, "t,y\n1,2\n0,3\n").unwrap();
    let table = read_csv(&path, &CsvOptions::for_path(&path)).unwrap();
    let schema = TableSchema::new("t").with_covariate(CovariateSpec::continuous("age"));
    let err = AnalysisFrame::from_table(&table, &schema).unwrap_err();
    assert!(err.to_string().contains("age"), "{err}");

    let _ = std::fs::remove_file(&path);
}
