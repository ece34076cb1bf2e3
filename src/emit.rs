use std::collections::BTreeMap;
use std::fs;
use std::io::Write;

use camino::Utf8Path;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tempfile::NamedTempFile;
use tracing::info;

use crate::domain::{Assay, Publication, Sample, Study};
use crate::error::PipelineError;
use crate::linker::StudyCrossRef;

pub const STUDIES_FILE: &str = "studies.json";
pub const SAMPLES_PRIVATE_FILE: &str = "samples_private.json";
pub const SAMPLES_PUBLIC_FILE: &str = "samples_public.json";
pub const ASSAYS_FILE: &str = "assays.json";
pub const PUBLICATIONS_FILE: &str = "publications.json";
pub const SAMPLE_STATISTICS_FILE: &str = "sample_statistics.json";
pub const PUBLICATION_STATISTICS_FILE: &str = "publication_statistics.json";
pub const ASSAY_STATISTICS_FILE: &str = "assay_statistics.json";
pub const CONFIG_FILE: &str = "config.json";

/// Study entry as the dashboard consumes it: the registry record with the
/// cross-linked rollup alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyEntry {
    #[serde(flatten)]
    pub study: Study,
    pub metrics: StudyCrossRef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleStatistics {
    pub total_samples: u64,
    pub by_study: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicationStatistics {
    pub total_publications: u64,
    pub resolved_identifiers: u64,
    pub by_year: BTreeMap<String, u64>,
    pub by_study: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssayStatistics {
    pub total_assays: u64,
    pub total_assay_samples: u64,
    pub unresolved_rows: u64,
    pub rows_by_study: BTreeMap<String, u64>,
    pub samples_by_assay: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitSummary {
    pub output_dir: String,
    pub files_written: Vec<String>,
}

pub struct EmitInputs<'a> {
    pub studies: &'a [Study],
    pub cross_refs: &'a BTreeMap<crate::domain::StudyCode, StudyCrossRef>,
    pub samples: &'a [Sample],
    /// Scrubbed sample rows; the scrub audit stays in the processed dir.
    pub public_samples: &'a [Sample],
    pub assays: &'a [Assay],
    pub unresolved_assay_rows: u64,
    pub publications: &'a [Publication],
    pub dashboard: &'a Value,
}

pub struct Emitter;

impl Emitter {
    /// Writes the fixed dashboard file set. Every file is always written,
    /// empty collections included, each through a temp file renamed into
    /// place so readers never observe a partial JSON document.
    pub fn emit(dir: &Utf8Path, inputs: &EmitInputs) -> Result<EmitSummary, PipelineError> {
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;

        let mut studies: Vec<StudyEntry> = inputs
            .studies
            .iter()
            .map(|study| StudyEntry {
                metrics: inputs
                    .cross_refs
                    .get(&study.study_code)
                    .cloned()
                    .unwrap_or_default(),
                study: study.clone(),
            })
            .collect();
        studies.sort_by(|a, b| a.study.study_code.cmp(&b.study.study_code));

        let mut samples_private = inputs.samples.to_vec();
        samples_private.sort_by(|a, b| a.barcode.cmp(&b.barcode));
        let mut samples_public = inputs.public_samples.to_vec();
        samples_public.sort_by(|a, b| a.barcode.cmp(&b.barcode));

        let mut assays = inputs.assays.to_vec();
        assays.sort_by(|a, b| {
            (&a.study_label, &a.assay_name, &a.sample_type)
                .cmp(&(&b.study_label, &b.assay_name, &b.sample_type))
        });

        let mut publications = inputs.publications.to_vec();
        publications.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));

        let files: Vec<(&str, Value)> = vec![
            (STUDIES_FILE, to_value(STUDIES_FILE, &studies)?),
            (
                SAMPLES_PRIVATE_FILE,
                to_value(SAMPLES_PRIVATE_FILE, &samples_private)?,
            ),
            (
                SAMPLES_PUBLIC_FILE,
                to_value(SAMPLES_PUBLIC_FILE, &samples_public)?,
            ),
            (ASSAYS_FILE, to_value(ASSAYS_FILE, &assays)?),
            (
                PUBLICATIONS_FILE,
                to_value(PUBLICATIONS_FILE, &publications)?,
            ),
            (
                SAMPLE_STATISTICS_FILE,
                to_value(
                    SAMPLE_STATISTICS_FILE,
                    &Self::sample_statistics(&samples_private),
                )?,
            ),
            (
                PUBLICATION_STATISTICS_FILE,
                to_value(
                    PUBLICATION_STATISTICS_FILE,
                    &Self::publication_statistics(&publications),
                )?,
            ),
            (
                ASSAY_STATISTICS_FILE,
                to_value(
                    ASSAY_STATISTICS_FILE,
                    &Self::assay_statistics(&assays, inputs.unresolved_assay_rows),
                )?,
            ),
            (
                CONFIG_FILE,
                json!({
                    "dashboard": inputs.dashboard,
                    "generated_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                }),
            ),
        ];

        let mut written = Vec::new();
        for (name, value) in &files {
            write_json_atomic(dir, name, value)?;
            written.push(name.to_string());
        }

        info!(dir = %dir, files = written.len(), "dashboard data emitted");
        Ok(EmitSummary {
            output_dir: dir.to_string(),
            files_written: written,
        })
    }

    pub fn sample_statistics(samples: &[Sample]) -> SampleStatistics {
        let mut stats = SampleStatistics {
            total_samples: samples.len() as u64,
            ..Default::default()
        };
        for sample in samples {
            *stats
                .by_study
                .entry(sample.study_code.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_type
                .entry(sample.sample_type.clone())
                .or_insert(0) += 1;
            *stats
                .by_status
                .entry(sample.storage_status.to_string())
                .or_insert(0) += 1;
        }
        stats
    }

    pub fn publication_statistics(publications: &[Publication]) -> PublicationStatistics {
        let mut stats = PublicationStatistics {
            total_publications: publications.len() as u64,
            ..Default::default()
        };
        for publication in publications {
            if publication.identifier.is_some() {
                stats.resolved_identifiers += 1;
            }
            let year = publication
                .year
                .map(|year| year.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            *stats.by_year.entry(year).or_insert(0) += 1;
            for code in &publication.study_codes {
                *stats
                    .by_study
                    .entry(code.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }
        stats
    }

    pub fn assay_statistics(assays: &[Assay], unresolved_rows: u64) -> AssayStatistics {
        let mut stats = AssayStatistics {
            total_assays: assays.len() as u64,
            unresolved_rows,
            ..Default::default()
        };
        for assay in assays {
            stats.total_assay_samples += assay.sample_count;
            if let Some(code) = &assay.study_code {
                *stats
                    .rows_by_study
                    .entry(code.as_str().to_string())
                    .or_insert(0) += 1;
            }
            *stats
                .samples_by_assay
                .entry(assay.assay_name.clone())
                .or_insert(0) += assay.sample_count;
        }
        stats
    }
}

fn to_value<T: Serialize>(what: &str, value: &T) -> Result<Value, PipelineError> {
    serde_json::to_value(value).map_err(|err| PipelineError::Serialize {
        what: what.to_string(),
        message: err.to_string(),
    })
}

/// Pretty-prints into a temp file in the target directory, then renames over
/// the destination.
pub fn write_json_atomic(dir: &Utf8Path, name: &str, value: &Value) -> Result<(), PipelineError> {
    let rendered = serde_json::to_string_pretty(value).map_err(|err| PipelineError::Serialize {
        what: name.to_string(),
        message: err.to_string(),
    })?;

    let mut temp = NamedTempFile::new_in(dir.as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    temp.write_all(rendered.as_bytes())
        .and_then(|_| temp.write_all(b"\n"))
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    temp.persist(dir.join(name).as_std_path())
        .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;

    fn emit_empty(dir: &Utf8Path) -> EmitSummary {
        Emitter::emit(
            dir,
            &EmitInputs {
                studies: &[],
                cross_refs: &BTreeMap::new(),
                samples: &[],
                public_samples: &[],
                assays: &[],
                unresolved_assay_rows: 0,
                publications: &[],
                dashboard: &Value::Null,
            },
        )
        .unwrap()
    }

    #[test]
    fn empty_collections_still_write_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let summary = emit_empty(&dir);

        assert_eq!(summary.files_written.len(), 9);
        for name in &summary.files_written {
            assert!(dir.join(name).as_std_path().is_file(), "{name} missing");
        }
        let studies = fs::read_to_string(dir.join(STUDIES_FILE).as_std_path()).unwrap();
        assert_eq!(studies.trim(), "[]");
        let public = fs::read_to_string(dir.join(SAMPLES_PUBLIC_FILE).as_std_path()).unwrap();
        assert_eq!(public.trim(), "[]");
    }

    #[test]
    fn rerun_is_byte_identical_except_timestamped_files() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        for file in [SAMPLE_STATISTICS_FILE, SAMPLES_PUBLIC_FILE] {
            emit_empty(&dir);
            let first = fs::read_to_string(dir.join(file).as_std_path()).unwrap();
            emit_empty(&dir);
            let second = fs::read_to_string(dir.join(file).as_std_path()).unwrap();
            assert_eq!(first, second, "{file} changed between reruns");
        }
    }

    #[test]
    fn public_samples_file_is_a_bare_array() {
        let parser = crate::domain::TimepointParser::new();
        let sample = Sample {
            barcode: "BC-010".parse().unwrap(),
            subject_id: "FLU021".to_string(),
            study_code: "DU08-04".parse().unwrap(),
            sample_type: "serum".to_string(),
            timepoint: parser.parse("Day 0"),
            storage_status: crate::domain::StorageStatus::InCirculation,
            storage_location: None,
            source_file: "dee3.csv".to_string(),
            source_row: 2,
        };

        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        Emitter::emit(
            &dir,
            &EmitInputs {
                studies: &[],
                cross_refs: &BTreeMap::new(),
                samples: &[sample.clone()],
                public_samples: &[sample],
                assays: &[],
                unresolved_assay_rows: 0,
                publications: &[],
                dashboard: &Value::Null,
            },
        )
        .unwrap();

        let raw = fs::read_to_string(dir.join(SAMPLES_PUBLIC_FILE).as_std_path()).unwrap();
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        let rows = parsed.as_array().expect("array of sample objects");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["barcode"], "BC-010");
        assert!(rows[0].get("audit").is_none());
    }

    #[test]
    fn statistics_break_down_by_study_type_status() {
        let parser = crate::domain::TimepointParser::new();
        let samples = vec![
            Sample {
                barcode: "BC-001".parse().unwrap(),
                subject_id: "FLU017".to_string(),
                study_code: "DU08-04".parse().unwrap(),
                sample_type: "serum".to_string(),
                timepoint: parser.parse("Day 2"),
                storage_status: crate::domain::StorageStatus::InCirculation,
                storage_location: None,
                source_file: "dee3.csv".to_string(),
                source_row: 2,
            },
            Sample {
                barcode: "BC-002".parse().unwrap(),
                subject_id: "FLU018".to_string(),
                study_code: "DU08-04".parse().unwrap(),
                sample_type: "plasma".to_string(),
                timepoint: parser.parse("Day 5"),
                storage_status: crate::domain::StorageStatus::Transferred,
                storage_location: None,
                source_file: "dee3.csv".to_string(),
                source_row: 3,
            },
        ];
        let stats = Emitter::sample_statistics(&samples);
        assert_eq!(stats.total_samples, 2);
        assert_eq!(stats.by_study.get("DU08-04"), Some(&2));
        assert_eq!(stats.by_type.get("serum"), Some(&1));
        assert_eq!(stats.by_status.get("transferred"), Some(&1));
    }

    #[test]
    fn assay_statistics_count_rows_per_study_and_sum_samples_per_assay() {
        let assay = |assay_name: &str, sample_type: &str, sample_count: u64| Assay {
            study_code: Some("DU09-06".parse().unwrap()),
            study_label: "DEE3".to_string(),
            assay_name: assay_name.to_string(),
            sample_type: sample_type.to_string(),
            sample_count,
        };
        let assays = vec![
            assay("Luminex", "serum", 3864),
            assay("Luminex", "plasma", 120),
            assay("HAI", "serum", 1651),
        ];

        let stats = Emitter::assay_statistics(&assays, 2);
        assert_eq!(stats.total_assays, 3);
        assert_eq!(stats.total_assay_samples, 5635);
        assert_eq!(stats.unresolved_rows, 2);
        // Row tallies and sample tallies carry different units.
        assert_eq!(stats.rows_by_study.get("DU09-06"), Some(&3));
        assert_eq!(stats.samples_by_assay.get("Luminex"), Some(&3984));
        assert_eq!(stats.samples_by_assay.get("HAI"), Some(&1651));
    }
}
