use std::fs;

use camino::Utf8PathBuf;

use biobank_pipeline::error::PipelineError;
use biobank_pipeline::harmonize::Harmonizer;

fn inventory_dir(sheets: &[(&str, &str)]) -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    for (name, content) in sheets {
        fs::write(dir.join(name).as_std_path(), content).unwrap();
    }
    (temp, dir)
}

#[test]
fn sheets_merge_with_later_file_winning_duplicates() {
    let (_temp, dir) = inventory_dir(&[
        (
            "a_export.csv",
            "External Participant ID,Alternate Sample ID,Study Code,Sample Type\n\
             FLU017,BC-001,DU09-06,Serum\n",
        ),
        (
            "b_export.csv",
            "Subject ID,Barcode,Study Code,Sample Type\n\
             FLU017,BC-001,DU09-06,Plasma\n\
             FLU018,BC-002,DU09-06,Serum\n",
        ),
    ]);

    let inventory = Harmonizer::new().harmonize_dir(&dir).unwrap();
    assert_eq!(inventory.samples.len(), 2);
    let winner = inventory
        .samples
        .iter()
        .find(|sample| sample.barcode.as_str() == "BC-001")
        .unwrap();
    // Sheets are read in sorted order, so b_export's row wins.
    assert_eq!(winner.sample_type, "plasma");
    assert_eq!(winner.source_file, "b_export.csv");
    assert_eq!(inventory.duplicate_conflicts.len(), 1);
}

#[test]
fn malformed_sheet_skipped_rest_processed() {
    let (_temp, dir) = inventory_dir(&[
        (
            "good.csv",
            "External Participant ID,Alternate Sample ID,Study Code\n\
             FLU017,BC-001,DU09-06\n",
        ),
        ("no_mandatory.csv", "Sample Type,Storage Status\nSerum,In Circulation\n"),
    ]);

    let inventory = Harmonizer::new().harmonize_dir(&dir).unwrap();
    assert_eq!(inventory.samples.len(), 1);
    assert!(inventory
        .warnings
        .iter()
        .any(|warning| warning.sheet == "no_mandatory.csv"));
}

#[test]
fn missing_inventory_dir_is_hard_error() {
    let temp = tempfile::tempdir().unwrap();
    let dir = Utf8PathBuf::from_path_buf(temp.path().join("nope")).unwrap();
    let err = Harmonizer::new().harmonize_dir(&dir).unwrap_err();
    assert!(matches!(err, PipelineError::InputMissing(_)));
}

#[test]
fn summary_counts_match_rows() {
    let (_temp, dir) = inventory_dir(&[(
        "dee3.csv",
        "External Participant ID,Alternate Sample ID,Study Code,Sample Type,Storage Status\n\
         FLU017,BC-001,DU09-06,Serum,In Circulation\n\
         FLU017,BC-002,DU09-06,Plasma,3rd Party Transfer\n\
         FLU018,BC-003,DU09-06,Serum,In Circulation\n",
    )]);

    let inventory = Harmonizer::new().harmonize_dir(&dir).unwrap();
    let summary = inventory
        .summary_by_study
        .get(&"DU09-06".parse().unwrap())
        .unwrap();
    assert_eq!(summary.samples, 3);
    assert_eq!(summary.subjects, 2);
    assert_eq!(summary.sample_types, 2);
    assert_eq!(summary.available, 2);
    assert_eq!(summary.transferred, 1);
}
