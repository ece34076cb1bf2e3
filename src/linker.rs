use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::assay::AssayTable;
use crate::domain::{
    LinkageKind, LinkageRecord, Publication, Sample, SampleBarcode, Study, StudyCode,
};
use crate::error::PipelineError;
use crate::harmonize::HarmonizedInventory;
use crate::publications::PublicationSet;

pub fn load_studies(path: &Utf8Path) -> Result<Vec<Study>, PipelineError> {
    if !path.as_std_path().is_file() {
        return Err(PipelineError::InputMissing(path.to_path_buf()));
    }
    let content =
        fs::read_to_string(path.as_std_path()).map_err(|err| PipelineError::InputRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    serde_json::from_str(&content).map_err(|err| PipelineError::JsonParse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Per-study rollup across all four tables, the dashboard's headline numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyCrossRef {
    pub total_samples: u64,
    pub subjects: u64,
    pub sample_types: u64,
    pub assays_performed: u64,
    pub total_assay_samples: u64,
    pub publications: u64,
    pub samples_available: u64,
    pub samples_transferred: u64,
}

/// Samples of a study cited by more than one publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiUseGroup {
    pub publication_ids: Vec<String>,
    pub sample_barcodes: Vec<SampleBarcode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkageSet {
    pub links: Vec<LinkageRecord>,
    pub cross_refs: BTreeMap<StudyCode, StudyCrossRef>,
    pub multi_use: BTreeMap<StudyCode, MultiUseGroup>,
    /// Registry studies with counts enriched from observed inventory.
    pub studies: Vec<Study>,
    pub orphaned_links: u64,
}

pub struct CrossLinker;

impl CrossLinker {
    /// Key-equality joins only. Dangling study references are kept and
    /// flagged orphaned so the Validator can report them; nothing is dropped.
    pub fn link(
        inventory: &HarmonizedInventory,
        assays: &AssayTable,
        publications: &PublicationSet,
        registry: &[Study],
    ) -> LinkageSet {
        let known_codes: BTreeSet<&StudyCode> =
            registry.iter().map(|study| &study.study_code).collect();

        let mut set = LinkageSet::default();

        let mut samples_by_study: BTreeMap<&StudyCode, Vec<&Sample>> = BTreeMap::new();
        for sample in &inventory.samples {
            samples_by_study
                .entry(&sample.study_code)
                .or_default()
                .push(sample);
        }

        for publication in &publications.publications {
            for code in &publication.study_codes {
                let orphaned = !known_codes.contains(code);
                if orphaned {
                    set.orphaned_links += 1;
                }
                set.links.push(LinkageRecord {
                    kind: LinkageKind::PublicationStudy,
                    study_code: code.clone(),
                    sample_barcode: None,
                    publication_id: Some(publication.canonical_id.clone()),
                    assay_name: None,
                    orphaned,
                    provenance: BTreeMap::from([(
                        "study_code".to_string(),
                        format!("publications:{}", publication.canonical_id),
                    )]),
                });
            }
        }

        for assay in &assays.assays {
            let Some(code) = &assay.study_code else {
                continue;
            };
            let orphaned = !known_codes.contains(code);
            if orphaned {
                set.orphaned_links += 1;
            }
            set.links.push(LinkageRecord {
                kind: LinkageKind::AssayStudy,
                study_code: code.clone(),
                sample_barcode: None,
                publication_id: None,
                assay_name: Some(assay.assay_name.clone()),
                orphaned,
                provenance: BTreeMap::from([(
                    "study_code".to_string(),
                    format!("tracking:{}", assay.study_label),
                )]),
            });
        }

        let mut publications_by_study: BTreeMap<&StudyCode, Vec<&Publication>> = BTreeMap::new();
        for publication in &publications.publications {
            for code in &publication.study_codes {
                publications_by_study
                    .entry(code)
                    .or_default()
                    .push(publication);
            }
        }

        for (code, cited) in &publications_by_study {
            let Some(samples) = samples_by_study.get(*code) else {
                continue;
            };
            for sample in samples {
                for publication in cited {
                    set.links.push(LinkageRecord {
                        kind: LinkageKind::SamplePublication,
                        study_code: (*code).clone(),
                        sample_barcode: Some(sample.barcode.clone()),
                        publication_id: Some(publication.canonical_id.clone()),
                        assay_name: None,
                        orphaned: false,
                        provenance: BTreeMap::from([
                            ("sample_barcode".to_string(), sample.source_id()),
                            (
                                "publication_id".to_string(),
                                format!("publications:{}", publication.canonical_id),
                            ),
                        ]),
                    });
                }
            }
            if cited.len() > 1 {
                set.multi_use.insert(
                    (*code).clone(),
                    MultiUseGroup {
                        publication_ids: cited
                            .iter()
                            .map(|publication| publication.canonical_id.clone())
                            .collect(),
                        sample_barcodes: samples
                            .iter()
                            .map(|sample| sample.barcode.clone())
                            .collect(),
                    },
                );
            }
        }

        set.cross_refs = Self::cross_refs(inventory, assays, &publications_by_study);
        set.studies = Self::enrich_studies(registry, inventory);

        info!(
            links = set.links.len(),
            orphaned = set.orphaned_links,
            studies = set.cross_refs.len(),
            "tables cross-linked"
        );
        set
    }

    fn cross_refs(
        inventory: &HarmonizedInventory,
        assays: &AssayTable,
        publications_by_study: &BTreeMap<&StudyCode, Vec<&Publication>>,
    ) -> BTreeMap<StudyCode, StudyCrossRef> {
        let mut refs: BTreeMap<StudyCode, StudyCrossRef> = BTreeMap::new();

        for (code, summary) in &inventory.summary_by_study {
            let entry = refs.entry(code.clone()).or_default();
            entry.total_samples = summary.samples;
            entry.subjects = summary.subjects;
            entry.sample_types = summary.sample_types;
            entry.samples_available = summary.available;
            entry.samples_transferred = summary.transferred;
        }

        for (code, summary) in &assays.summary_by_study {
            let entry = refs.entry(code.clone()).or_default();
            entry.assays_performed = summary.assays;
            entry.total_assay_samples = summary.total_samples;
        }

        for (code, cited) in publications_by_study {
            let entry = refs.entry((*code).clone()).or_default();
            entry.publications = cited.len() as u64;
        }

        refs
    }

    /// Fills subject/timepoint counts the registry left unset from observed
    /// inventory. Registry-provided counts are never overwritten.
    fn enrich_studies(registry: &[Study], inventory: &HarmonizedInventory) -> Vec<Study> {
        let mut subjects: BTreeMap<&StudyCode, BTreeSet<&str>> = BTreeMap::new();
        let mut days: BTreeMap<&StudyCode, BTreeSet<i32>> = BTreeMap::new();
        for sample in &inventory.samples {
            subjects
                .entry(&sample.study_code)
                .or_default()
                .insert(sample.subject_id.as_str());
            if let Some(day) = sample.timepoint.day {
                days.entry(&sample.study_code).or_default().insert(day);
            }
        }

        registry
            .iter()
            .map(|study| {
                let mut study = study.clone();
                if study.subject_count.is_none() {
                    study.subject_count = subjects
                        .get(&study.study_code)
                        .map(|set| set.len() as u32);
                }
                if study.timepoint_count.is_none() {
                    study.timepoint_count =
                        days.get(&study.study_code).map(|set| set.len() as u32);
                }
                study
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StorageStatus, Timepoint};

    fn sample(barcode: &str, subject: &str, code: &str, day: Option<i32>) -> Sample {
        Sample {
            barcode: barcode.parse().unwrap(),
            subject_id: subject.to_string(),
            study_code: code.parse().unwrap(),
            sample_type: "serum".to_string(),
            timepoint: match day {
                Some(day) => crate::domain::TimepointParser::new().parse(&format!("Day {day}")),
                None => Timepoint::unparsed(None),
            },
            storage_status: StorageStatus::InCirculation,
            storage_location: Some("F1.S2.R3".to_string()),
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

    fn publication(id: &str, codes: &[&str]) -> Publication {
        Publication {
            canonical_id: id.to_string(),
            title: id.to_string(),
            first_author: None,
            year: None,
            journal: None,
            identifier: Some(id.to_string()),
            study_codes: codes.iter().map(|code| code.parse().unwrap()).collect(),
            abstract_text: None,
            summary: None,
            url: None,
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
    fn orphaned_publication_link_kept_and_flagged() {
        let publications = PublicationSet {
            publications: vec![publication("1", &["DU99-99"])],
            ..Default::default()
        };
        let set = CrossLinker::link(
            &inventory(vec![]),
            &AssayTable::default(),
            &publications,
            &[study("DU08-04")],
        );
        assert_eq!(set.links.len(), 1);
        assert!(set.links[0].orphaned);
        assert_eq!(set.orphaned_links, 1);
    }

    #[test]
    fn sample_publication_links_carry_provenance() {
        let publications = PublicationSet {
            publications: vec![publication("1", &["DU08-04"])],
            ..Default::default()
        };
        let set = CrossLinker::link(
            &inventory(vec![sample("BC-001", "FLU017", "DU08-04", Some(2))]),
            &AssayTable::default(),
            &publications,
            &[study("DU08-04")],
        );
        let link = set
            .links
            .iter()
            .find(|link| link.kind == LinkageKind::SamplePublication)
            .unwrap();
        assert_eq!(
            link.provenance.get("sample_barcode").map(String::as_str),
            Some("dee3.csv:2")
        );
        assert!(!link.orphaned);
    }

    #[test]
    fn multi_use_samples_detected() {
        let publications = PublicationSet {
            publications: vec![publication("1", &["DU08-04"]), publication("2", &["DU08-04"])],
            ..Default::default()
        };
        let set = CrossLinker::link(
            &inventory(vec![sample("BC-001", "FLU017", "DU08-04", Some(2))]),
            &AssayTable::default(),
            &publications,
            &[study("DU08-04")],
        );
        let group = set.multi_use.get(&"DU08-04".parse().unwrap()).unwrap();
        assert_eq!(group.publication_ids, vec!["1", "2"]);
        assert_eq!(group.sample_barcodes.len(), 1);
    }

    #[test]
    fn cross_ref_rolls_up_all_tables() {
        let mut assays = AssayTable::default();
        assays.assays.push(crate::domain::Assay {
            study_code: Some("DU08-04".parse().unwrap()),
            study_label: "Prometheus".to_string(),
            assay_name: "RNA-seq".to_string(),
            sample_type: "pbmc".to_string(),
            sample_count: 120,
        });
        assays.rebuild_summary();
        let publications = PublicationSet {
            publications: vec![publication("1", &["DU08-04"])],
            ..Default::default()
        };
        let set = CrossLinker::link(
            &inventory(vec![
                sample("BC-001", "FLU017", "DU08-04", Some(2)),
                sample("BC-002", "FLU018", "DU08-04", Some(5)),
            ]),
            &assays,
            &publications,
            &[study("DU08-04")],
        );
        let cross = set.cross_refs.get(&"DU08-04".parse().unwrap()).unwrap();
        assert_eq!(cross.total_samples, 2);
        assert_eq!(cross.subjects, 2);
        assert_eq!(cross.assays_performed, 1);
        assert_eq!(cross.total_assay_samples, 120);
        assert_eq!(cross.publications, 1);
        assert_eq!(cross.samples_available, 2);
    }

    #[test]
    fn enrichment_fills_unset_counts_only() {
        let mut registered = study("DU08-04");
        registered.subject_count = Some(31);
        let set = CrossLinker::link(
            &inventory(vec![
                sample("BC-001", "FLU017", "DU08-04", Some(2)),
                sample("BC-002", "FLU017", "DU08-04", Some(5)),
            ]),
            &AssayTable::default(),
            &PublicationSet::default(),
            &[registered],
        );
        assert_eq!(set.studies[0].subject_count, Some(31));
        assert_eq!(set.studies[0].timepoint_count, Some(2));
    }
}
