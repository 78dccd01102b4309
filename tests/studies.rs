use dro_dispatch::{run, InputArgs};
use std::fs;
use std::path::Path;

fn copy_case(case: &str, target: &Path) {
    let source = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("example")
        .join(case);
    for entry in fs::read_dir(source).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), target.join(entry.file_name())).unwrap();
    }
}

fn read_summary(path: &Path) -> Vec<csv::StringRecord> {
    let mut rdr = csv::Reader::from_path(path.join("summary.csv")).unwrap();
    let headers = rdr.headers().unwrap().clone();
    assert_eq!(&headers[0], "risk_index");
    rdr.records().map(|r| r.unwrap()).collect()
}

fn run_case(case: &str) -> (tempfile::TempDir, Vec<csv::StringRecord>) {
    let dir = tempfile::tempdir().unwrap();
    copy_case(case, dir.path());
    let args = vec![
        "dro-dispatch".to_string(),
        dir.path().to_str().unwrap().to_string(),
    ];
    run(&InputArgs::build(&args).unwrap()).unwrap();
    let rows = read_summary(dir.path());
    (dir, rows)
}

#[test]
fn distribution_study_archives_every_epoch() {
    let (dir, rows) = run_case("distribution");
    // 3 risk weights x 4 epochs
    assert_eq!(rows.len(), 12);
    assert!(rows.iter().all(|r| &r[4] == "Optimal"));
    // holdout verification ran on every epoch
    assert!(rows.iter().all(|r| &r[9] == "20"));
    for file in ["cvar.csv", "schedule.csv", "contingencies.csv"] {
        assert!(dir.path().join(file).exists());
    }
}

#[test]
fn transmission_study_sweeps_the_radius_grid() {
    let (dir, rows) = run_case("transmission");
    // 3 radii x 3 risk weights
    assert_eq!(rows.len(), 9);
    assert!(rows.iter().all(|r| &r[4] == "Optimal"));
    let mut rdr =
        csv::Reader::from_path(dir.path().join("contingencies.csv")).unwrap();
    // 2 loads, 2 generators and 4 lines per sweep point
    assert_eq!(rdr.records().count(), 9 * 8);
}

#[test]
fn missing_input_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let args = vec![
        "dro-dispatch".to_string(),
        dir.path().join("nowhere").to_str().unwrap().to_string(),
    ];
    assert!(run(&InputArgs::build(&args).unwrap()).is_err());
}
