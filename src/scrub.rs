use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::Sample;

/// What the scrub removed and when. Written next to the public table so the
/// removal is auditable without diffing the private one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubAudit {
    pub record_count_scrubbed: u64,
    pub locations_removed: u64,
    pub fields_removed: Vec<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrubbedSamples {
    pub samples: Vec<Sample>,
    pub audit: ScrubAudit,
}

pub struct Scrubber;

impl Scrubber {
    /// Copies the sample table with storage locations blanked. Nothing else
    /// changes; the input is left untouched.
    pub fn scrub(samples: &[Sample]) -> ScrubbedSamples {
        let mut locations_removed = 0u64;
        let scrubbed: Vec<Sample> = samples
            .iter()
            .map(|sample| {
                let mut sample = sample.clone();
                if sample.storage_location.take().is_some() {
                    locations_removed += 1;
                }
                sample
            })
            .collect();

        info!(
            records = scrubbed.len(),
            locations_removed, "sample table scrubbed for public release"
        );
        ScrubbedSamples {
            audit: ScrubAudit {
                record_count_scrubbed: scrubbed.len() as u64,
                locations_removed,
                fields_removed: vec!["storage_location".to_string()],
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            },
            samples: scrubbed,
        }
    }
}
