use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{
    Sample, SampleBarcode, StorageStatus, StudyCode, TimepointParser, normalize_sample_type,
};
use crate::error::PipelineError;

/// Canonical inventory fields. Raw sheets come from different export eras, so
/// each field carries the set of header spellings it is known under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CanonicalField {
    SubjectId,
    Barcode,
    StudyCode,
    StorageStatus,
    Timepoint,
    SampleType,
    StorageLocation,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 7] = [
        CanonicalField::SubjectId,
        CanonicalField::Barcode,
        CanonicalField::StudyCode,
        CanonicalField::StorageStatus,
        CanonicalField::Timepoint,
        CanonicalField::SampleType,
        CanonicalField::StorageLocation,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CanonicalField::SubjectId => "subject_id",
            CanonicalField::Barcode => "barcode",
            CanonicalField::StudyCode => "study_code",
            CanonicalField::StorageStatus => "storage_status",
            CanonicalField::Timepoint => "timepoint",
            CanonicalField::SampleType => "sample_type",
            CanonicalField::StorageLocation => "storage_location",
        }
    }

    pub fn accepted_headers(&self) -> &'static [&'static str] {
        match self {
            CanonicalField::SubjectId => &[
                "external participant id",
                "participant id",
                "subject id",
                "subject",
            ],
            CanonicalField::Barcode => &[
                "alternate sample id",
                "sample barcode id",
                "sample barcode",
                "barcode",
            ],
            CanonicalField::StudyCode => &["study code", "study"],
            CanonicalField::StorageStatus => &["storage status", "status"],
            CanonicalField::Timepoint => &[
                "visit / time point name on sample family table",
                "visit name",
                "time point",
                "timepoint",
            ],
            CanonicalField::SampleType => &["sample type", "specimen type"],
            CanonicalField::StorageLocation => &[
                "label path",
                "storage location path",
                "storage location",
            ],
        }
    }

    pub fn is_mandatory(&self) -> bool {
        matches!(
            self,
            CanonicalField::SubjectId | CanonicalField::Barcode | CanonicalField::StudyCode
        )
    }

    fn resolve(header: &str) -> Option<CanonicalField> {
        let normalized = normalize_header(header);
        CanonicalField::ALL.into_iter().find(|field| {
            field
                .accepted_headers()
                .iter()
                .any(|accepted| *accepted == normalized)
        })
    }
}

fn normalize_header(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarmonizeWarning {
    pub sheet: String,
    #[serde(default)]
    pub row: Option<u64>,
    pub message: String,
}

/// Two raw rows produced the same barcode with differing values. The later
/// row won; both sources are kept for the Validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicateConflict {
    pub barcode: SampleBarcode,
    pub kept_source: String,
    pub discarded_source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudySampleSummary {
    pub samples: u64,
    pub subjects: u64,
    pub sample_types: u64,
    pub available: u64,
    pub transferred: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarmonizedInventory {
    pub samples: Vec<Sample>,
    pub warnings: Vec<HarmonizeWarning>,
    /// Headers no synonym matched, per sheet. Logged once each, never fatal.
    pub coverage_gaps: BTreeMap<String, Vec<String>>,
    pub duplicate_conflicts: Vec<DuplicateConflict>,
    pub unparsed_timepoints: BTreeSet<String>,
    pub summary_by_study: BTreeMap<StudyCode, StudySampleSummary>,
}

impl HarmonizedInventory {
    pub fn rebuild_summary(&mut self) {
        let mut summary: BTreeMap<StudyCode, StudySampleSummary> = BTreeMap::new();
        let mut subjects: BTreeMap<StudyCode, BTreeSet<&str>> = BTreeMap::new();
        let mut types: BTreeMap<StudyCode, BTreeSet<&str>> = BTreeMap::new();

        for sample in &self.samples {
            let entry = summary.entry(sample.study_code.clone()).or_default();
            entry.samples += 1;
            match sample.storage_status {
                StorageStatus::InCirculation => entry.available += 1,
                StorageStatus::Transferred => entry.transferred += 1,
                StorageStatus::Unknown => {}
            }
            subjects
                .entry(sample.study_code.clone())
                .or_default()
                .insert(sample.subject_id.as_str());
            types
                .entry(sample.study_code.clone())
                .or_default()
                .insert(sample.sample_type.as_str());
        }

        for (code, entry) in summary.iter_mut() {
            entry.subjects = subjects.get(code).map(|set| set.len() as u64).unwrap_or(0);
            entry.sample_types = types.get(code).map(|set| set.len() as u64).unwrap_or(0);
        }

        self.summary_by_study = summary;
    }
}

pub struct Harmonizer {
    parser: TimepointParser,
}

impl Default for Harmonizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Harmonizer {
    pub fn new() -> Self {
        Self {
            parser: TimepointParser::new(),
        }
    }

    /// Harmonizes every sheet CSV in the inventory directory into one table.
    /// A malformed sheet is skipped with a warning; a missing directory is the
    /// only hard failure.
    pub fn harmonize_dir(&self, dir: &Utf8Path) -> Result<HarmonizedInventory, PipelineError> {
        if !dir.as_std_path().is_dir() {
            return Err(PipelineError::InputMissing(dir.to_path_buf()));
        }

        let mut sheets: Vec<Utf8PathBuf> = Vec::new();
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::Filesystem(err.to_string()))?;
            let path = Utf8PathBuf::from_path_buf(entry.path())
                .map_err(|_| PipelineError::Filesystem("non-utf8 path in inventory".to_string()))?;
            if path.extension() == Some("csv") {
                sheets.push(path);
            }
        }
        sheets.sort();

        let mut inventory = HarmonizedInventory::default();
        if sheets.is_empty() {
            warn!(dir = %dir, "no inventory sheets found");
            inventory.warnings.push(HarmonizeWarning {
                sheet: dir.to_string(),
                row: None,
                message: "no inventory sheets found".to_string(),
            });
            return Ok(inventory);
        }

        for sheet in &sheets {
            let name = sheet
                .file_name()
                .unwrap_or(sheet.as_str())
                .to_string();
            let file = fs::File::open(sheet.as_std_path()).map_err(|err| {
                PipelineError::InputRead {
                    path: sheet.clone(),
                    message: err.to_string(),
                }
            })?;
            self.harmonize_sheet(&name, file, &mut inventory);
        }

        inventory.rebuild_summary();
        info!(
            samples = inventory.samples.len(),
            studies = inventory.summary_by_study.len(),
            warnings = inventory.warnings.len(),
            "inventory harmonized"
        );
        Ok(inventory)
    }

    /// Harmonizes one sheet into the accumulating inventory. Bad sheets and
    /// bad rows degrade to warnings.
    pub fn harmonize_sheet<R: Read>(
        &self,
        sheet: &str,
        reader: R,
        inventory: &mut HarmonizedInventory,
    ) {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);

        let headers = match csv_reader.headers() {
            Ok(headers) => headers.clone(),
            Err(err) => {
                warn!(sheet, error = %err, "sheet skipped: unreadable header row");
                inventory.warnings.push(HarmonizeWarning {
                    sheet: sheet.to_string(),
                    row: None,
                    message: format!("sheet skipped: unreadable header row: {err}"),
                });
                return;
            }
        };

        let mut columns: BTreeMap<CanonicalField, usize> = BTreeMap::new();
        let mut gaps = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            match CanonicalField::resolve(header) {
                // First matching column wins; exports never repeat a field.
                Some(field) => {
                    columns.entry(field).or_insert(idx);
                }
                None => gaps.push(header.to_string()),
            }
        }
        if !gaps.is_empty() {
            inventory.coverage_gaps.insert(sheet.to_string(), gaps);
        }

        let missing: Vec<&str> = CanonicalField::ALL
            .iter()
            .filter(|field| field.is_mandatory() && !columns.contains_key(field))
            .map(|field| field.name())
            .collect();
        if !missing.is_empty() {
            warn!(sheet, missing = ?missing, "sheet skipped: mandatory columns missing");
            inventory.warnings.push(HarmonizeWarning {
                sheet: sheet.to_string(),
                row: None,
                message: format!("sheet skipped: missing mandatory columns: {}", missing.join(", ")),
            });
            return;
        }

        let cell = |record: &csv::StringRecord, field: CanonicalField| -> Option<String> {
            columns
                .get(&field)
                .and_then(|idx| record.get(*idx))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        for (offset, record) in csv_reader.records().enumerate() {
            // Header occupies line 1.
            let row = offset as u64 + 2;
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    inventory.warnings.push(HarmonizeWarning {
                        sheet: sheet.to_string(),
                        row: Some(row),
                        message: format!("row skipped: {err}"),
                    });
                    continue;
                }
            };

            let barcode = match cell(&record, CanonicalField::Barcode)
                .as_deref()
                .map(str::parse::<SampleBarcode>)
            {
                Some(Ok(barcode)) => barcode,
                _ => {
                    inventory.warnings.push(HarmonizeWarning {
                        sheet: sheet.to_string(),
                        row: Some(row),
                        message: "row skipped: missing sample barcode".to_string(),
                    });
                    continue;
                }
            };

            let study_code = match cell(&record, CanonicalField::StudyCode)
                .as_deref()
                .map(str::parse::<StudyCode>)
            {
                Some(Ok(code)) => code,
                _ => {
                    inventory.warnings.push(HarmonizeWarning {
                        sheet: sheet.to_string(),
                        row: Some(row),
                        message: format!("row skipped: missing study code (barcode {barcode})"),
                    });
                    continue;
                }
            };

            let subject_id = cell(&record, CanonicalField::SubjectId).unwrap_or_default();
            let sample_type = cell(&record, CanonicalField::SampleType)
                .map(|value| normalize_sample_type(&value))
                .unwrap_or_default();
            let raw_timepoint = cell(&record, CanonicalField::Timepoint);
            let timepoint = match raw_timepoint.as_deref() {
                Some(raw) => {
                    let parsed = self.parser.parse(raw);
                    if parsed.day.is_none() && parsed.phase.is_none() {
                        inventory.unparsed_timepoints.insert(raw.to_string());
                    }
                    parsed
                }
                None => crate::domain::Timepoint::unparsed(None),
            };
            let storage_status = cell(&record, CanonicalField::StorageStatus)
                .map(|value| StorageStatus::from_raw(&value))
                .unwrap_or(StorageStatus::Unknown);
            let storage_location = cell(&record, CanonicalField::StorageLocation);

            let sample = Sample {
                barcode,
                subject_id,
                study_code,
                sample_type,
                timepoint,
                storage_status,
                storage_location,
                source_file: sheet.to_string(),
                source_row: row,
            };

            push_sample(inventory, sample);
        }
    }
}

/// Later row wins on a barcode collision; materially different earlier rows
/// become recorded conflicts, identical ones are collapsed silently.
fn push_sample(inventory: &mut HarmonizedInventory, sample: Sample) {
    let existing = inventory
        .samples
        .iter()
        .position(|candidate| candidate.barcode == sample.barcode);

    match existing {
        Some(idx) => {
            let previous = &inventory.samples[idx];
            if materially_different(previous, &sample) {
                inventory.duplicate_conflicts.push(DuplicateConflict {
                    barcode: sample.barcode.clone(),
                    kept_source: sample.source_id(),
                    discarded_source: previous.source_id(),
                });
            }
            inventory.samples[idx] = sample;
        }
        None => inventory.samples.push(sample),
    }
}

fn materially_different(a: &Sample, b: &Sample) -> bool {
    a.subject_id != b.subject_id
        || a.study_code != b.study_code
        || a.sample_type != b.sample_type
        || a.timepoint.day != b.timepoint.day
        || a.storage_status != b.storage_status
        || a.storage_location != b.storage_location
}
