use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use regex::Regex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::LookupOptions;
use crate::domain::{Publication, StudyCode, normalize_title};
use crate::error::PipelineError;

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const PUBMED_URL_BASE: &str = "https://pubmed.ncbi.nlm.nih.gov";

/// Curated citation stub, one entry of the citations input file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationStub {
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub journal: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub study_codes: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
}

pub fn load_stubs(path: &Utf8Path) -> Result<Vec<CitationStub>, PipelineError> {
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

pub trait BibliographicClient: Send + Sync {
    /// Looks up a publication identifier by title, first author and year.
    /// `Ok(None)` means no confident match.
    fn search(
        &self,
        title: &str,
        first_author: Option<&str>,
        year: Option<i32>,
    ) -> Result<Option<String>, PipelineError>;

    /// Fetches the abstract text for a resolved identifier, if the index has
    /// one on record.
    fn fetch_abstract(&self, identifier: &str) -> Result<Option<String>, PipelineError>;
}

/// No-op client for `--offline` runs and tests. Every lookup misses.
#[derive(Debug, Default, Clone)]
pub struct OfflineClient;

impl BibliographicClient for OfflineClient {
    fn search(
        &self,
        _title: &str,
        _first_author: Option<&str>,
        _year: Option<i32>,
    ) -> Result<Option<String>, PipelineError> {
        Ok(None)
    }

    fn fetch_abstract(&self, _identifier: &str) -> Result<Option<String>, PipelineError> {
        Ok(None)
    }
}

pub struct EntrezClient {
    client: Client,
    cooldown: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl EntrezClient {
    pub fn new(options: &LookupOptions) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_secs))
            .user_agent(format!("biobank-pipeline/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| PipelineError::BibliographicHttp(err.to_string()))?;
        Ok(Self {
            client,
            cooldown: Duration::from_millis(options.cooldown_ms),
            last_call: Mutex::new(None),
        })
    }

    /// The index rejects bursty clients, so each call waits out the cooldown
    /// from the previous one. A poisoned lock still holds a usable timestamp,
    /// so pacing continues rather than being skipped.
    fn pace(&self) {
        let mut last = self
            .last_call
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.cooldown {
                thread::sleep(self.cooldown - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, PipelineError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            self.pace();
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && (err.is_timeout() || err.is_connect()) {
                        thread::sleep(Duration::from_millis(BASE_DELAY_MS * (attempt as u64 + 1)));
                        attempt += 1;
                        continue;
                    }
                    return Err(PipelineError::BibliographicHttp(err.to_string()));
                }
            }
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

impl BibliographicClient for EntrezClient {
    fn search(
        &self,
        title: &str,
        first_author: Option<&str>,
        year: Option<i32>,
    ) -> Result<Option<String>, PipelineError> {
        let mut term = format!("{}[Title]", title);
        if let Some(author) = first_author {
            term.push_str(&format!(" AND {}[Author]", author));
        }
        if let Some(year) = year {
            term.push_str(&format!(" AND {}[pdat]", year));
        }

        let url = format!("{EUTILS_BASE}/esearch.fcgi");
        let response = self.send_with_retries(|| {
            self.client.get(&url).query(&[
                ("db", "pubmed"),
                ("term", term.as_str()),
                ("retmode", "json"),
                ("retmax", "1"),
            ])
        })?;
        if !response.status().is_success() {
            return Err(PipelineError::BibliographicStatus {
                status: response.status().as_u16(),
                message: response
                    .text()
                    .unwrap_or_else(|_| "search request failed".to_string()),
            });
        }
        let payload: Value = response
            .json()
            .map_err(|err| PipelineError::BibliographicHttp(err.to_string()))?;
        let id = payload["esearchresult"]["idlist"]
            .as_array()
            .and_then(|list| list.first())
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());
        Ok(id)
    }

    fn fetch_abstract(&self, identifier: &str) -> Result<Option<String>, PipelineError> {
        let url = format!("{EUTILS_BASE}/efetch.fcgi");
        let response = self.send_with_retries(|| {
            self.client.get(&url).query(&[
                ("db", "pubmed"),
                ("id", identifier),
                ("rettype", "abstract"),
                ("retmode", "text"),
            ])
        })?;
        if !response.status().is_success() {
            return Err(PipelineError::BibliographicStatus {
                status: response.status().as_u16(),
                message: response
                    .text()
                    .unwrap_or_else(|_| "abstract request failed".to_string()),
            });
        }
        let text = response
            .text()
            .map_err(|err| PipelineError::BibliographicHttp(err.to_string()))?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicationSet {
    pub publications: Vec<Publication>,
    /// Stubs the index could not resolve. Kept in the table with
    /// `identifier = None`; listed here for the run summary.
    pub unresolved_lookups: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct PublicationResolver<'a, C: BibliographicClient> {
    client: &'a C,
}

impl<'a, C: BibliographicClient> PublicationResolver<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }

    /// Resolves every stub, then dedups by normalized title. Lookup failures
    /// degrade to unresolved stubs, never abort the run.
    pub fn resolve(&self, stubs: &[CitationStub]) -> Result<PublicationSet, PipelineError> {
        let mut set = PublicationSet::default();

        for stub in stubs {
            let first_author = stub.authors.first().map(String::as_str);

            let identifier = match &stub.identifier {
                Some(id) if !id.trim().is_empty() => Some(id.trim().to_string()),
                _ => match self.client.search(&stub.title, first_author, stub.year) {
                    Ok(Some(id)) => Some(id),
                    Ok(None) => {
                        set.unresolved_lookups.push(stub.title.clone());
                        None
                    }
                    Err(err) => {
                        warn!(title = %stub.title, error = %err, "lookup failed, keeping stub unresolved");
                        set.warnings
                            .push(format!("lookup failed for \"{}\": {err}", stub.title));
                        set.unresolved_lookups.push(stub.title.clone());
                        None
                    }
                },
            };

            let abstract_text = match &identifier {
                Some(id) => match self.client.fetch_abstract(id) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(identifier = %id, error = %err, "abstract fetch failed");
                        set.warnings
                            .push(format!("abstract fetch failed for {id}: {err}"));
                        None
                    }
                },
                None => None,
            };
            let summary = abstract_text.as_deref().and_then(summarize_abstract);

            let mut study_codes = std::collections::BTreeSet::new();
            for raw in &stub.study_codes {
                match raw.parse::<StudyCode>() {
                    Ok(code) => {
                        study_codes.insert(code);
                    }
                    Err(_) => {
                        set.warnings.push(format!(
                            "citation \"{}\": unusable study code \"{raw}\"",
                            stub.title
                        ));
                    }
                }
            }

            let url = stub.url.clone().or_else(|| {
                identifier
                    .as_ref()
                    .map(|id| format!("{PUBMED_URL_BASE}/{id}/"))
            });

            set.publications.push(Publication {
                canonical_id: Publication::canonical_id_for(identifier.as_deref(), &stub.title),
                title: stub.title.trim().to_string(),
                first_author: first_author.map(|value| value.to_string()),
                year: stub.year,
                journal: stub.journal.clone(),
                identifier,
                study_codes,
                abstract_text,
                summary,
                url,
            });
        }

        set.publications = dedupe(set.publications);
        info!(
            publications = set.publications.len(),
            unresolved = set.unresolved_lookups.len(),
            "publications resolved"
        );
        Ok(set)
    }
}

/// Collapses publications sharing a normalized title into one record. The
/// representative is the most complete record; study code sets are unioned.
/// Applying this twice changes nothing.
pub fn dedupe(publications: Vec<Publication>) -> Vec<Publication> {
    let mut groups: BTreeMap<String, Publication> = BTreeMap::new();

    for publication in publications {
        let key = normalize_title(&publication.title);
        match groups.get_mut(&key) {
            Some(kept) => {
                let merged_codes: std::collections::BTreeSet<StudyCode> = kept
                    .study_codes
                    .union(&publication.study_codes)
                    .cloned()
                    .collect();
                if completeness(&publication) > completeness(kept) {
                    *kept = publication;
                }
                kept.study_codes = merged_codes;
            }
            None => {
                groups.insert(key, publication);
            }
        }
    }

    let mut output: Vec<Publication> = groups.into_values().collect();
    output.sort_by(|a, b| a.canonical_id.cmp(&b.canonical_id));
    output
}

/// Record completeness ranking: identifier beats abstract beats title length.
fn completeness(publication: &Publication) -> (bool, bool, usize) {
    (
        publication.identifier.is_some(),
        publication.abstract_text.is_some(),
        publication.title.len(),
    )
}

/// Derives a short summary from a structured abstract by taking the first
/// complete sentence of each labelled Methods/Results/Conclusions section.
/// Abstracts without those labels yield no summary at all rather than a
/// truncated fragment.
pub fn summarize_abstract(abstract_text: &str) -> Option<String> {
    let section_re = Regex::new(r"(?mi)^\s*(METHODS|RESULTS|CONCLUSIONS?)\s*:\s*").unwrap();

    let mut sections: Vec<(usize, usize)> = Vec::new();
    for caps in section_re.captures_iter(abstract_text) {
        let whole = caps.get(0)?;
        sections.push((whole.end(), whole.start()));
    }
    if sections.is_empty() {
        return None;
    }

    let mut sentences = Vec::new();
    for (idx, (body_start, _)) in sections.iter().enumerate() {
        let body_end = sections
            .get(idx + 1)
            .map(|(_, next_label)| *next_label)
            .unwrap_or(abstract_text.len());
        let body = &abstract_text[*body_start..body_end];
        if let Some(sentence) = first_sentence(body) {
            sentences.push(sentence);
        }
    }

    if sentences.is_empty() {
        None
    } else {
        Some(sentences.join(" "))
    }
}

fn first_sentence(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let end = trimmed.char_indices().find_map(|(idx, ch)| {
        if ch != '.' {
            return None;
        }
        let rest = &trimmed[idx + 1..];
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            Some(idx)
        } else {
            None
        }
    })?;
    let sentence = trimmed[..=end].split_whitespace().collect::<Vec<_>>().join(" ");
    Some(sentence)
}
