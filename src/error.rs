use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PipelineError {
    #[error("invalid study code: {0}")]
    InvalidStudyCode(String),

    #[error("invalid sample barcode: {0}")]
    InvalidBarcode(String),

    #[error("missing config file biobank-pipeline.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(Utf8PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("required input not found: {0}")]
    InputMissing(Utf8PathBuf),

    #[error("failed to read {path}: {message}")]
    InputRead { path: Utf8PathBuf, message: String },

    #[error("malformed CSV in {path}: {message}")]
    CsvParse { path: Utf8PathBuf, message: String },

    #[error("failed to parse JSON in {path}: {message}")]
    JsonParse { path: Utf8PathBuf, message: String },

    #[error("stage output not found: {0} (run the earlier pipeline stages first)")]
    StageOutputMissing(Utf8PathBuf),

    #[error("bibliographic index request failed: {0}")]
    BibliographicHttp(String),

    #[error("bibliographic index returned status {status}: {message}")]
    BibliographicStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to serialize {what}: {message}")]
    Serialize { what: String, message: String },
}
