use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Biobank study protocol code, e.g. "DU08-04". Legacy registries contain
/// free-form codes, so anything non-empty without whitespace is accepted and
/// uppercased; the canonical `XXNN-NN` form is what new codes look like.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudyCode(String);

impl StudyCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StudyCode {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        if normalized.is_empty() || normalized.chars().any(|ch| ch.is_whitespace()) {
            return Err(PipelineError::InvalidStudyCode(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleBarcode(String);

impl SampleBarcode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SampleBarcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SampleBarcode {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidBarcode(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStatus {
    InCirculation,
    Transferred,
    Unknown,
}

impl StorageStatus {
    /// Raw status text uses "In Circulation" and "3rd Party Transfer" with
    /// assorted casing; anything else is kept as Unknown for the Validator.
    pub fn from_raw(raw: &str) -> Self {
        let lower = raw.trim().to_lowercase();
        if lower.contains("in circulation") {
            StorageStatus::InCirculation
        } else if lower.contains("transfer") {
            StorageStatus::Transferred
        } else {
            StorageStatus::Unknown
        }
    }
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageStatus::InCirculation => write!(f, "in_circulation"),
            StorageStatus::Transferred => write!(f, "transferred"),
            StorageStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengePhase {
    Screening,
    PreChallenge,
    Inoculation,
    PostChallenge,
}

/// Timepoint relative to inoculation (day 0). Day is None when the raw label
/// could not be parsed; the Harmonizer counts those as coverage gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timepoint {
    #[serde(rename = "timepoint_day")]
    pub day: Option<i32>,
    #[serde(rename = "timepoint_hour")]
    pub hour: Option<f64>,
    #[serde(rename = "timepoint_label")]
    pub label: Option<String>,
    pub phase: Option<ChallengePhase>,
}

impl Timepoint {
    pub fn unparsed(raw: Option<&str>) -> Self {
        Self {
            day: None,
            hour: None,
            label: raw.map(|value| value.trim().to_string()),
            phase: None,
        }
    }

    fn from_day_hour(day: i32, hour: Option<f64>, raw: &str) -> Self {
        let phase = if day < 0 {
            ChallengePhase::PreChallenge
        } else if day == 0 {
            ChallengePhase::Inoculation
        } else {
            ChallengePhase::PostChallenge
        };
        Self {
            day: Some(day),
            hour,
            label: Some(raw.trim().to_string()),
            phase: Some(phase),
        }
    }
}

/// Parses the visit/timepoint labels found in raw inventory sheets. The label
/// formats vary per study era, so every known shape gets its own pattern.
#[derive(Debug, Clone)]
pub struct TimepointParser {
    re_hours_day: Regex,
    re_baseline_hours_day: Regex,
    re_hrs_day: Regex,
    re_baseline_day: Regex,
    re_day: Regex,
    re_baseline: Regex,
    re_screening: Regex,
}

impl Default for TimepointParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TimepointParser {
    pub fn new() -> Self {
        Self {
            re_hours_day: Regex::new(r"(?i)(\d+\.?\d*)\s*hours?\s*\(Day\s*(-?\d+)\)").unwrap(),
            re_baseline_hours_day: Regex::new(
                r"(?i)Baseline\s*(-?\d+)\s*hours?\s*\(Day\s*(-?\d+)\)",
            )
            .unwrap(),
            re_hrs_day: Regex::new(r"(?i)(-?\d+)\s*hrs?\s*\(Day\s*(-?\d+)\)").unwrap(),
            re_baseline_day: Regex::new(r"(?i)Baseline.*\(Day\s*(-?\d+)\)").unwrap(),
            re_day: Regex::new(r"(?i)Day\s*(-?\d+)").unwrap(),
            re_baseline: Regex::new(r"(?i)^Baseline$").unwrap(),
            re_screening: Regex::new(r"(?i)Screening").unwrap(),
        }
    }

    pub fn parse(&self, raw: &str) -> Timepoint {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Timepoint::unparsed(None);
        }

        if let Some(caps) = self.re_baseline_hours_day.captures(trimmed) {
            let hour = caps[1].parse::<f64>().ok();
            if let Ok(day) = caps[2].parse::<i32>() {
                return Timepoint::from_day_hour(day, hour, trimmed);
            }
        }

        if let Some(caps) = self.re_hours_day.captures(trimmed) {
            let hour = caps[1].parse::<f64>().ok();
            if let Ok(day) = caps[2].parse::<i32>() {
                return Timepoint::from_day_hour(day, hour, trimmed);
            }
        }

        if let Some(caps) = self.re_hrs_day.captures(trimmed) {
            let hour = caps[1].parse::<f64>().ok();
            if let Ok(day) = caps[2].parse::<i32>() {
                return Timepoint::from_day_hour(day, hour, trimmed);
            }
        }

        if let Some(caps) = self.re_baseline_day.captures(trimmed) {
            if let Ok(day) = caps[1].parse::<i32>() {
                return Timepoint::from_day_hour(day, Some(0.0), trimmed);
            }
        }

        if let Some(caps) = self.re_day.captures(trimmed) {
            if let Ok(day) = caps[1].parse::<i32>() {
                return Timepoint::from_day_hour(day, None, trimmed);
            }
        }

        // Bare "Baseline" with no day reference means the day before challenge.
        if self.re_baseline.is_match(trimmed) {
            return Timepoint::from_day_hour(-1, Some(0.0), trimmed);
        }

        if self.re_screening.is_match(trimmed) {
            return Timepoint {
                day: None,
                hour: None,
                label: Some(trimmed.to_string()),
                phase: Some(ChallengePhase::Screening),
            };
        }

        Timepoint::unparsed(Some(trimmed))
    }
}

/// Lowercases and collapses internal whitespace runs so sample types differing
/// only in case/spacing become one join key.
pub fn normalize_sample_type(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Dedup key for publication titles: lowercase, punctuation stripped,
/// whitespace collapsed.
pub fn normalize_title(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch.is_whitespace() {
                ch
            } else {
                ' '
            }
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub barcode: SampleBarcode,
    pub subject_id: String,
    pub study_code: StudyCode,
    pub sample_type: String,
    #[serde(flatten)]
    pub timepoint: Timepoint,
    pub storage_status: StorageStatus,
    pub storage_location: Option<String>,
    pub source_file: String,
    pub source_row: u64,
}

impl Sample {
    /// Identifies the raw row this sample came from, for provenance records.
    pub fn source_id(&self) -> String {
        format!("{}:{}", self.source_file, self.source_row)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Study {
    pub study_code: StudyCode,
    pub title: String,
    #[serde(default)]
    pub strain: Option<String>,
    #[serde(default)]
    pub study_type: Option<String>,
    #[serde(default)]
    pub subject_count: Option<u32>,
    #[serde(default)]
    pub timepoint_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assay {
    pub study_code: Option<StudyCode>,
    pub study_label: String,
    pub assay_name: String,
    pub sample_type: String,
    pub sample_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub canonical_id: String,
    pub title: String,
    #[serde(default)]
    pub first_author: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub journal: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub study_codes: BTreeSet<StudyCode>,
    #[serde(default)]
    pub abstract_text: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Publication {
    /// Identifier when resolved, else a normalized-title key. Stable across
    /// reruns so dashboard links survive regeneration.
    pub fn canonical_id_for(identifier: Option<&str>, title: &str) -> String {
        match identifier {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => format!("title:{}", normalize_title(title)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkageKind {
    PublicationStudy,
    AssayStudy,
    SamplePublication,
}

/// Derived join row. Carries provenance mapping each output field to the
/// source row or table key it was taken from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkageRecord {
    pub kind: LinkageKind,
    pub study_code: StudyCode,
    #[serde(default)]
    pub sample_barcode: Option<SampleBarcode>,
    #[serde(default)]
    pub publication_id: Option<String>,
    #[serde(default)]
    pub assay_name: Option<String>,
    pub orphaned: bool,
    pub provenance: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_study_code_valid() {
        let code: StudyCode = " du08-04 ".parse().unwrap();
        assert_eq!(code.as_str(), "DU08-04");
    }

    #[test]
    fn parse_study_code_invalid() {
        let err = "  ".parse::<StudyCode>().unwrap_err();
        assert_matches!(err, PipelineError::InvalidStudyCode(_));
        let err = "DU08 04".parse::<StudyCode>().unwrap_err();
        assert_matches!(err, PipelineError::InvalidStudyCode(_));
    }

    #[test]
    fn storage_status_from_raw() {
        assert_eq!(
            StorageStatus::from_raw("In Circulation"),
            StorageStatus::InCirculation
        );
        assert_eq!(
            StorageStatus::from_raw("3rd Party Transfer"),
            StorageStatus::Transferred
        );
        assert_eq!(StorageStatus::from_raw("Depleted"), StorageStatus::Unknown);
    }

    #[test]
    fn timepoint_hours_with_day() {
        let parser = TimepointParser::new();
        let tp = parser.parse("48 hours (Day 2)");
        assert_eq!(tp.day, Some(2));
        assert_eq!(tp.hour, Some(48.0));
        assert_eq!(tp.phase, Some(ChallengePhase::PostChallenge));
    }

    #[test]
    fn timepoint_baseline_variants() {
        let parser = TimepointParser::new();

        let tp = parser.parse("Baseline -24 hours (Day -1)");
        assert_eq!(tp.day, Some(-1));
        assert_eq!(tp.hour, Some(-24.0));
        assert_eq!(tp.phase, Some(ChallengePhase::PreChallenge));

        let tp = parser.parse("Pre-Challenge Baseline (Day -1)");
        assert_eq!(tp.day, Some(-1));
        assert_eq!(tp.hour, Some(0.0));

        let tp = parser.parse("Baseline");
        assert_eq!(tp.day, Some(-1));
    }

    #[test]
    fn timepoint_day_only_and_inoculation() {
        let parser = TimepointParser::new();
        let tp = parser.parse("Day 0");
        assert_eq!(tp.day, Some(0));
        assert_eq!(tp.hour, None);
        assert_eq!(tp.phase, Some(ChallengePhase::Inoculation));
    }

    #[test]
    fn timepoint_screening_has_no_day() {
        let parser = TimepointParser::new();
        let tp = parser.parse("Screening Visit");
        assert_eq!(tp.day, None);
        assert_eq!(tp.phase, Some(ChallengePhase::Screening));
    }

    #[test]
    fn timepoint_unparseable() {
        let parser = TimepointParser::new();
        let tp = parser.parse("Visit 7");
        assert_eq!(tp.day, None);
        assert_eq!(tp.phase, None);
        assert_eq!(tp.label.as_deref(), Some("Visit 7"));
    }

    #[test]
    fn sample_type_canonicalization() {
        assert_eq!(normalize_sample_type("  Nasal   Lavage "), "nasal lavage");
        assert_eq!(
            normalize_sample_type("NASAL LAVAGE"),
            normalize_sample_type("nasal\tlavage")
        );
    }

    #[test]
    fn title_normalization_strips_punctuation() {
        assert_eq!(
            normalize_title("Gene Expression Signatures: Diagnose Influenza!"),
            "gene expression signatures diagnose influenza"
        );
        assert_eq!(
            normalize_title("A, B; C"),
            normalize_title("a b   c")
        );
    }

    #[test]
    fn canonical_id_prefers_identifier() {
        assert_eq!(
            Publication::canonical_id_for(Some("19664979"), "Some Title"),
            "19664979"
        );
        assert_eq!(
            Publication::canonical_id_for(None, "Some Title"),
            "title:some title"
        );
        assert_eq!(
            Publication::canonical_id_for(Some("  "), "Some Title"),
            "title:some title"
        );
    }
}
