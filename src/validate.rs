use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assay::AssayTable;
use crate::domain::{StorageStatus, Study, StudyCode};
use crate::harmonize::HarmonizedInventory;
use crate::linker::LinkageSet;
use crate::publications::PublicationSet;

/// Observed timepoint days outside this window are suspect transcriptions.
const TIMEPOINT_DAY_MIN: i32 = -30;
const TIMEPOINT_DAY_MAX: i32 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub entity: String,
    pub key: String,
    pub description: String,
}

impl Finding {
    fn error(entity: &str, key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            entity: entity.to_string(),
            key: key.into(),
            description: description.into(),
        }
    }

    fn warning(entity: &str, key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            entity: entity.to_string(),
            key: key.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub samples_total: u64,
    pub subject_id_complete_pct: f64,
    pub timepoint_parsed_pct: f64,
    pub storage_status_known_pct: f64,
    pub storage_location_present_pct: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub errors: u64,
    pub warnings: u64,
    pub findings: Vec<Finding>,
    pub metrics: QualityMetrics,
}

pub struct Validator;

impl Validator {
    /// Advisory only. Reads every table, mutates none, and always returns a
    /// report; `passed` is false when any Error-severity finding exists.
    pub fn validate(
        inventory: &HarmonizedInventory,
        assays: &AssayTable,
        publications: &PublicationSet,
        linkage: &LinkageSet,
        registry: &[Study],
    ) -> ValidationReport {
        let mut findings = Vec::new();

        Self::check_duplicate_keys(inventory, publications, registry, &mut findings);
        Self::check_dangling_refs(inventory, assays, publications, linkage, registry, &mut findings);
        Self::check_declared_totals(inventory, assays, &mut findings);
        Self::check_storage_and_timepoints(inventory, &mut findings);

        let metrics = Self::metrics(inventory);
        let errors = findings
            .iter()
            .filter(|finding| finding.severity == Severity::Error)
            .count() as u64;
        let warnings = findings.len() as u64 - errors;

        info!(errors, warnings, "validation finished");
        ValidationReport {
            passed: errors == 0,
            errors,
            warnings,
            findings,
            metrics,
        }
    }

    fn check_duplicate_keys(
        inventory: &HarmonizedInventory,
        publications: &PublicationSet,
        registry: &[Study],
        findings: &mut Vec<Finding>,
    ) {
        for conflict in &inventory.duplicate_conflicts {
            findings.push(Finding::error(
                "sample",
                conflict.barcode.as_str(),
                format!(
                    "duplicate barcode: kept {} over {}",
                    conflict.kept_source, conflict.discarded_source
                ),
            ));
        }

        let mut seen_codes = BTreeSet::new();
        for study in registry {
            if !seen_codes.insert(&study.study_code) {
                findings.push(Finding::error(
                    "study",
                    study.study_code.as_str(),
                    "duplicate study code in registry",
                ));
            }
        }

        let mut seen_ids = BTreeSet::new();
        for publication in &publications.publications {
            if !seen_ids.insert(&publication.canonical_id) {
                findings.push(Finding::error(
                    "publication",
                    publication.canonical_id.clone(),
                    "duplicate canonical publication id",
                ));
            }
        }
    }

    /// One finding per distinct dangling study code per entity, so a bad code
    /// on ten thousand samples reads as one problem, not ten thousand.
    fn check_dangling_refs(
        inventory: &HarmonizedInventory,
        assays: &AssayTable,
        publications: &PublicationSet,
        linkage: &LinkageSet,
        registry: &[Study],
        findings: &mut Vec<Finding>,
    ) {
        let known: BTreeSet<&StudyCode> =
            registry.iter().map(|study| &study.study_code).collect();

        let mut dangling_samples: BTreeMap<&StudyCode, u64> = BTreeMap::new();
        for sample in &inventory.samples {
            if !known.contains(&sample.study_code) {
                *dangling_samples.entry(&sample.study_code).or_insert(0) += 1;
            }
        }
        for (code, count) in dangling_samples {
            findings.push(Finding::error(
                "sample",
                code.as_str(),
                format!("{count} samples reference unregistered study {code}"),
            ));
        }

        let mut dangling_assays: BTreeSet<&StudyCode> = BTreeSet::new();
        for assay in &assays.assays {
            if let Some(code) = &assay.study_code {
                if !known.contains(code) {
                    dangling_assays.insert(code);
                }
            }
        }
        for code in dangling_assays {
            findings.push(Finding::error(
                "assay",
                code.as_str(),
                format!("assay rows reference unregistered study {code}"),
            ));
        }

        let mut dangling_publications: BTreeSet<&StudyCode> = BTreeSet::new();
        for publication in &publications.publications {
            for code in &publication.study_codes {
                if !known.contains(code) {
                    dangling_publications.insert(code);
                }
            }
        }
        for code in dangling_publications {
            findings.push(Finding::error(
                "publication",
                code.as_str(),
                format!("publications reference unregistered study {code}"),
            ));
        }

        let mut orphaned_link_codes: BTreeSet<&StudyCode> = BTreeSet::new();
        for link in &linkage.links {
            if link.orphaned {
                orphaned_link_codes.insert(&link.study_code);
            }
        }
        for code in orphaned_link_codes {
            findings.push(Finding::warning(
                "linkage",
                code.as_str(),
                format!("linkage rows carry unregistered study {code}"),
            ));
        }
    }

    fn check_declared_totals(
        inventory: &HarmonizedInventory,
        assays: &AssayTable,
        findings: &mut Vec<Finding>,
    ) {
        for (code, declared) in &assays.declared_totals {
            let observed = inventory
                .summary_by_study
                .get(code)
                .map(|summary| summary.samples)
                .unwrap_or(0);
            if observed != *declared {
                findings.push(Finding::warning(
                    "study",
                    code.as_str(),
                    format!(
                        "declared total {declared} does not match {observed} harmonized samples"
                    ),
                ));
            }
        }
    }

    fn check_storage_and_timepoints(
        inventory: &HarmonizedInventory,
        findings: &mut Vec<Finding>,
    ) {
        let mut unknown_status: BTreeMap<&StudyCode, u64> = BTreeMap::new();
        for sample in &inventory.samples {
            if sample.storage_status == StorageStatus::Unknown {
                *unknown_status.entry(&sample.study_code).or_insert(0) += 1;
            }
            if let Some(day) = sample.timepoint.day {
                if !(TIMEPOINT_DAY_MIN..=TIMEPOINT_DAY_MAX).contains(&day) {
                    findings.push(Finding::warning(
                        "sample",
                        sample.barcode.as_str(),
                        format!("timepoint day {day} outside plausible challenge window"),
                    ));
                }
            }
        }
        for (code, count) in unknown_status {
            findings.push(Finding::warning(
                "study",
                code.as_str(),
                format!("{count} samples with unrecognized storage status"),
            ));
        }
    }

    fn metrics(inventory: &HarmonizedInventory) -> QualityMetrics {
        let total = inventory.samples.len() as u64;
        let pct = |count: u64| -> f64 {
            if total == 0 {
                100.0
            } else {
                (count as f64 / total as f64 * 1000.0).round() / 10.0
            }
        };

        let subject_complete = inventory
            .samples
            .iter()
            .filter(|sample| !sample.subject_id.is_empty())
            .count() as u64;
        let timepoint_parsed = inventory
            .samples
            .iter()
            .filter(|sample| sample.timepoint.day.is_some() || sample.timepoint.phase.is_some())
            .count() as u64;
        let status_known = inventory
            .samples
            .iter()
            .filter(|sample| sample.storage_status != StorageStatus::Unknown)
            .count() as u64;
        let location_present = inventory
            .samples
            .iter()
            .filter(|sample| sample.storage_location.is_some())
            .count() as u64;

        QualityMetrics {
            samples_total: total,
            subject_id_complete_pct: pct(subject_complete),
            timepoint_parsed_pct: pct(timepoint_parsed),
            storage_status_known_pct: pct(status_known),
            storage_location_present_pct: pct(location_present),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Sample, StorageStatus, Timepoint, TimepointParser};

    fn sample(barcode: &str, code: &str, label: Option<&str>) -> Sample {
        Sample {
            barcode: barcode.parse().unwrap(),
            subject_id: "FLU017".to_string(),
            study_code: code.parse().unwrap(),
            sample_type: "serum".to_string(),
            timepoint: match label {
                Some(label) => TimepointParser::new().parse(label),
                None => Timepoint::unparsed(None),
            },
            storage_status: StorageStatus::InCirculation,
            storage_location: Some("F1".to_string()),
            source_file: "dee3.csv".to_string(),
            source_row: 2,
        }
    }

    fn study(code: &str) -> Study {
        Study {
            study_code: code.parse().unwrap(),
            title: format!("Study {code}"),
            strain: None,
            study_type: None,
            subject_count: None,
            timepoint_count: None,
        }
    }

    fn inventory(samples: Vec<Sample>) -> HarmonizedInventory {
        let mut inventory = HarmonizedInventory {
            samples,
            ..Default::default()
        };
        inventory.rebuild_summary();
        inventory
    }

    #[test]
    fn dangling_sample_ref_is_one_finding_per_code() {
        let report = Validator::validate(
            &inventory(vec![
                sample("BC-001", "DU99-99", None),
                sample("BC-002", "DU99-99", None),
            ]),
            &AssayTable::default(),
            &PublicationSet::default(),
            &LinkageSet::default(),
            &[study("DU08-04")],
        );
        assert!(!report.passed);
        let dangling: Vec<&Finding> = report
            .findings
            .iter()
            .filter(|f| f.entity == "sample" && f.severity == Severity::Error)
            .collect();
        assert_eq!(dangling.len(), 1);
        assert!(dangling[0].description.contains("2 samples"));
    }

    #[test]
    fn declared_total_mismatch_is_warning() {
        let mut assays = AssayTable::default();
        assays
            .declared_totals
            .insert("DU08-04".parse().unwrap(), 5515);
        let report = Validator::validate(
            &inventory(vec![sample("BC-001", "DU08-04", None)]),
            &assays,
            &PublicationSet::default(),
            &LinkageSet::default(),
            &[study("DU08-04")],
        );
        assert!(report.passed);
        assert!(report
            .findings
            .iter()
            .any(|f| f.severity == Severity::Warning && f.description.contains("5515")));
    }

    #[test]
    fn implausible_timepoint_day_flagged() {
        let report = Validator::validate(
            &inventory(vec![sample("BC-001", "DU08-04", Some("Day 999"))]),
            &AssayTable::default(),
            &PublicationSet::default(),
            &LinkageSet::default(),
            &[study("DU08-04")],
        );
        assert!(report
            .findings
            .iter()
            .any(|f| f.key == "BC-001" && f.description.contains("999")));
    }

    #[test]
    fn clean_tables_pass_with_full_metrics() {
        let report = Validator::validate(
            &inventory(vec![sample("BC-001", "DU08-04", Some("Day 2"))]),
            &AssayTable::default(),
            &PublicationSet::default(),
            &LinkageSet::default(),
            &[study("DU08-04")],
        );
        assert!(report.passed);
        assert_eq!(report.errors, 0);
        assert_eq!(report.metrics.samples_total, 1);
        assert_eq!(report.metrics.timepoint_parsed_pct, 100.0);
        assert_eq!(report.metrics.storage_status_known_pct, 100.0);
    }

    #[test]
    fn unknown_status_share_reported_per_study() {
        let mut bad = sample("BC-001", "DU08-04", None);
        bad.storage_status = StorageStatus::Unknown;
        let report = Validator::validate(
            &inventory(vec![bad]),
            &AssayTable::default(),
            &PublicationSet::default(),
            &LinkageSet::default(),
            &[study("DU08-04")],
        );
        assert!(report.passed);
        assert!(report
            .findings
            .iter()
            .any(|f| f.entity == "study" && f.description.contains("unrecognized storage status")));
    }
}
