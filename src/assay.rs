use std::collections::BTreeMap;
use std::fs;
use std::io::Read;

use camino::Utf8Path;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{Assay, StudyCode, normalize_sample_type};
use crate::error::PipelineError;

pub const SEQUENCED_SHEET: &str = "sequenced.csv";
pub const COUNTS_SHEET: &str = "counts.csv";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssayStudySummary {
    pub assays: u64,
    pub total_samples: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssayTable {
    pub assays: Vec<Assay>,
    /// Rows whose study label mapped to no known code. Kept out of the keyed
    /// table but surfaced in the run summary.
    pub unresolved_rows: u64,
    /// Per-study sample totals declared by the tracking workbook, used by the
    /// Validator's sum reconciliation.
    pub declared_totals: BTreeMap<StudyCode, u64>,
    pub warnings: Vec<String>,
    pub summary_by_study: BTreeMap<StudyCode, AssayStudySummary>,
}

impl AssayTable {
    pub fn rebuild_summary(&mut self) {
        let mut summary: BTreeMap<StudyCode, AssayStudySummary> = BTreeMap::new();
        for assay in &self.assays {
            if let Some(code) = &assay.study_code {
                let entry = summary.entry(code.clone()).or_default();
                entry.assays += 1;
                entry.total_samples += assay.sample_count;
            }
        }
        self.summary_by_study = summary;
    }
}

/// Maps tracking-workbook study labels ("Prometheus", "EXHALE") to biobank
/// codes. Labels already in canonical code form pass through unmapped.
pub struct StudyLabelMap {
    by_label: BTreeMap<String, StudyCode>,
    code_shape: Regex,
}

impl StudyLabelMap {
    pub fn new(labels: &BTreeMap<String, StudyCode>) -> Self {
        let by_label = labels
            .iter()
            .map(|(label, code)| (label.trim().to_lowercase(), code.clone()))
            .collect();
        Self {
            by_label,
            code_shape: Regex::new(r"^[A-Za-z]{2}\d{2}-\d{2}$").unwrap(),
        }
    }

    pub fn resolve(&self, label: &str) -> Option<StudyCode> {
        let trimmed = label.trim();
        if let Some(code) = self.by_label.get(&trimmed.to_lowercase()) {
            return Some(code.clone());
        }
        if self.code_shape.is_match(trimmed) {
            return trimmed.parse().ok();
        }
        None
    }
}

pub struct AssayExtractor {
    labels: StudyLabelMap,
}

impl AssayExtractor {
    pub fn new(labels: &BTreeMap<String, StudyCode>) -> Self {
        Self {
            labels: StudyLabelMap::new(labels),
        }
    }

    /// Reads the tracking workbook directory. The sequenced sheet is required;
    /// a missing counts sheet degrades to a warning and empty declared totals.
    pub fn extract_dir(&self, dir: &Utf8Path) -> Result<AssayTable, PipelineError> {
        if !dir.as_std_path().is_dir() {
            return Err(PipelineError::InputMissing(dir.to_path_buf()));
        }

        let sequenced_path = dir.join(SEQUENCED_SHEET);
        if !sequenced_path.as_std_path().is_file() {
            return Err(PipelineError::InputMissing(sequenced_path));
        }
        let sequenced = fs::File::open(sequenced_path.as_std_path()).map_err(|err| {
            PipelineError::InputRead {
                path: sequenced_path.clone(),
                message: err.to_string(),
            }
        })?;

        let mut table = AssayTable::default();
        self.extract_sequenced(sequenced, &mut table)
            .map_err(|err| PipelineError::CsvParse {
                path: sequenced_path,
                message: err.to_string(),
            })?;

        let counts_path = dir.join(COUNTS_SHEET);
        if counts_path.as_std_path().is_file() {
            let counts = fs::File::open(counts_path.as_std_path()).map_err(|err| {
                PipelineError::InputRead {
                    path: counts_path.clone(),
                    message: err.to_string(),
                }
            })?;
            self.extract_counts(counts, &mut table)
                .map_err(|err| PipelineError::CsvParse {
                    path: counts_path,
                    message: err.to_string(),
                })?;
        } else {
            warn!(path = %counts_path, "counts sheet missing, declared totals unavailable");
            table
                .warnings
                .push("counts sheet missing, declared totals unavailable".to_string());
        }

        table.rebuild_summary();
        info!(
            assays = table.assays.len(),
            unresolved = table.unresolved_rows,
            studies = table.summary_by_study.len(),
            "assay tracking extracted"
        );
        Ok(table)
    }

    pub fn extract_sequenced<R: Read>(
        &self,
        reader: R,
        table: &mut AssayTable,
    ) -> Result<(), csv::Error> {
        let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = csv_reader.headers()?.clone();

        let study_col = find_column(&headers, &["study", "study name", "project"]);
        let assay_col = find_column(&headers, &["assay", "assay name"]);
        let type_col = find_column(&headers, &["sample type", "specimen type"]);
        let count_col = find_column(
            &headers,
            &["# of samples", "number of samples", "sample count", "samples"],
        );

        for (offset, record) in csv_reader.records().enumerate() {
            let row = offset + 2;
            let record = record?;
            let cell = |col: Option<usize>| -> Option<&str> {
                col.and_then(|idx| record.get(idx))
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
            };

            let Some(label) = cell(study_col) else {
                table.unresolved_rows += 1;
                table
                    .warnings
                    .push(format!("{SEQUENCED_SHEET}:{row}: blank study label"));
                continue;
            };
            let study_code = self.labels.resolve(label);
            if study_code.is_none() {
                table.unresolved_rows += 1;
                table.warnings.push(format!(
                    "{SEQUENCED_SHEET}:{row}: unmapped study label \"{label}\""
                ));
            }

            let assay_name = cell(assay_col).unwrap_or("unspecified").to_string();
            let sample_type = cell(type_col)
                .map(normalize_sample_type)
                .unwrap_or_default();
            let sample_count = cell(count_col)
                .and_then(|value| value.replace(',', "").parse::<u64>().ok())
                .unwrap_or(0);

            table.assays.push(Assay {
                study_code,
                study_label: label.to_string(),
                assay_name,
                sample_type,
                sample_count,
            });
        }
        Ok(())
    }

    pub fn extract_counts<R: Read>(
        &self,
        reader: R,
        table: &mut AssayTable,
    ) -> Result<(), csv::Error> {
        let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
        let headers = csv_reader.headers()?.clone();

        let study_col = find_column(&headers, &["study code", "study", "study name"]);
        let count_col = find_column(&headers, &["sample count", "count", "total", "samples"]);

        for (offset, record) in csv_reader.records().enumerate() {
            let row = offset + 2;
            let record = record?;
            let label = study_col
                .and_then(|idx| record.get(idx))
                .map(str::trim)
                .unwrap_or_default();
            let count = count_col
                .and_then(|idx| record.get(idx))
                .and_then(|value| value.trim().replace(',', "").parse::<u64>().ok());

            match (self.labels.resolve(label), count) {
                (Some(code), Some(count)) => {
                    // A study repeated across count rows sums its totals.
                    *table.declared_totals.entry(code).or_insert(0) += count;
                }
                _ => {
                    table
                        .warnings
                        .push(format!("{COUNTS_SHEET}:{row}: unusable count row"));
                }
            }
        }
        Ok(())
    }
}

fn find_column(headers: &csv::StringRecord, accepted: &[&str]) -> Option<usize> {
    headers.iter().position(|header| {
        let normalized = header.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        accepted.contains(&normalized.as_str())
    })
}
