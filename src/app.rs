use std::fs;

use camino::Utf8PathBuf;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::assay::{AssayExtractor, AssayTable};
use crate::config::ResolvedConfig;
use crate::emit::{EmitInputs, EmitSummary, Emitter, write_json_atomic};
use crate::error::PipelineError;
use crate::harmonize::{HarmonizedInventory, Harmonizer};
use crate::linker::{CrossLinker, LinkageSet, load_studies};
use crate::publications::{BibliographicClient, PublicationResolver, PublicationSet, load_stubs};
use crate::scrub::{ScrubbedSamples, Scrubber};
use crate::validate::{ValidationReport, Validator};

pub const INVENTORY_STAGE: &str = "inventory.json";
pub const ASSAYS_STAGE: &str = "assay_tracking.json";
pub const PUBLICATIONS_STAGE: &str = "publications.json";
pub const LINKAGE_STAGE: &str = "linkage.json";
pub const VALIDATION_STAGE: &str = "validation.json";
pub const SCRUBBED_STAGE: &str = "scrubbed.json";

/// Summary a single CLI stage prints on completion.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub records: u64,
    pub warnings: u64,
    pub output: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub samples: u64,
    pub duplicate_conflicts: u64,
    pub assays: u64,
    pub unresolved_assay_rows: u64,
    pub publications: u64,
    pub unresolved_lookups: u64,
    pub links: u64,
    pub orphaned_links: u64,
    pub validation_passed: bool,
    pub validation_errors: u64,
    pub validation_warnings: u64,
    pub samples_scrubbed: u64,
    pub files_written: Vec<String>,
}

/// Orchestrates the pipeline. Each stage persists its table to the processed
/// directory so stages remain independently invocable; `run` threads the
/// tables in memory and persists the same files along the way.
pub struct Pipeline<C: BibliographicClient> {
    config: ResolvedConfig,
    client: C,
}

impl<C: BibliographicClient> Pipeline<C> {
    pub fn new(config: ResolvedConfig, client: C) -> Self {
        Self { config, client }
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn harmonize(&self) -> Result<StageReport, PipelineError> {
        let inventory = self.harmonize_table()?;
        Ok(self.stage_report(
            "harmonize",
            inventory.samples.len() as u64,
            inventory.warnings.len() as u64,
            INVENTORY_STAGE,
        ))
    }

    pub fn assays(&self) -> Result<StageReport, PipelineError> {
        let table = self.assay_table()?;
        Ok(self.stage_report(
            "assays",
            table.assays.len() as u64,
            table.warnings.len() as u64,
            ASSAYS_STAGE,
        ))
    }

    pub fn publications(&self) -> Result<StageReport, PipelineError> {
        let set = self.publication_set()?;
        Ok(self.stage_report(
            "publications",
            set.publications.len() as u64,
            set.warnings.len() as u64,
            PUBLICATIONS_STAGE,
        ))
    }

    pub fn link(&self) -> Result<StageReport, PipelineError> {
        let inventory: HarmonizedInventory = self.load_stage(INVENTORY_STAGE)?;
        let assays: AssayTable = self.load_stage(ASSAYS_STAGE)?;
        let publications: PublicationSet = self.load_stage(PUBLICATIONS_STAGE)?;
        let registry = load_studies(&self.config.studies_file)?;

        let linkage = CrossLinker::link(&inventory, &assays, &publications, &registry);
        self.save_stage(LINKAGE_STAGE, &linkage)?;
        Ok(self.stage_report(
            "link",
            linkage.links.len() as u64,
            linkage.orphaned_links,
            LINKAGE_STAGE,
        ))
    }

    pub fn validate(&self) -> Result<ValidationReport, PipelineError> {
        let inventory: HarmonizedInventory = self.load_stage(INVENTORY_STAGE)?;
        let assays: AssayTable = self.load_stage(ASSAYS_STAGE)?;
        let publications: PublicationSet = self.load_stage(PUBLICATIONS_STAGE)?;
        let linkage: LinkageSet = self.load_stage(LINKAGE_STAGE)?;
        let registry = load_studies(&self.config.studies_file)?;

        let report = Validator::validate(&inventory, &assays, &publications, &linkage, &registry);
        self.save_stage(VALIDATION_STAGE, &report)?;
        Ok(report)
    }

    pub fn scrub(&self) -> Result<StageReport, PipelineError> {
        let inventory: HarmonizedInventory = self.load_stage(INVENTORY_STAGE)?;
        let scrubbed = Scrubber::scrub(&inventory.samples);
        self.save_stage(SCRUBBED_STAGE, &scrubbed)?;
        Ok(self.stage_report(
            "scrub",
            scrubbed.audit.record_count_scrubbed,
            0,
            SCRUBBED_STAGE,
        ))
    }

    pub fn emit(&self) -> Result<EmitSummary, PipelineError> {
        let inventory: HarmonizedInventory = self.load_stage(INVENTORY_STAGE)?;
        let assays: AssayTable = self.load_stage(ASSAYS_STAGE)?;
        let publications: PublicationSet = self.load_stage(PUBLICATIONS_STAGE)?;
        let linkage: LinkageSet = self.load_stage(LINKAGE_STAGE)?;
        let scrubbed: ScrubbedSamples = self.load_stage(SCRUBBED_STAGE)?;

        self.emit_tables(&inventory, &assays, &publications, &linkage, &scrubbed)
    }

    /// All stages in order, tables threaded through memory.
    pub fn run(&self) -> Result<RunReport, PipelineError> {
        let inventory = self.harmonize_table()?;
        let assays = self.assay_table()?;
        let publications = self.publication_set()?;
        let registry = load_studies(&self.config.studies_file)?;

        let linkage = CrossLinker::link(&inventory, &assays, &publications, &registry);
        self.save_stage(LINKAGE_STAGE, &linkage)?;

        let validation =
            Validator::validate(&inventory, &assays, &publications, &linkage, &registry);
        self.save_stage(VALIDATION_STAGE, &validation)?;

        let scrubbed = Scrubber::scrub(&inventory.samples);
        self.save_stage(SCRUBBED_STAGE, &scrubbed)?;

        let emitted = self.emit_tables(&inventory, &assays, &publications, &linkage, &scrubbed)?;

        info!(
            samples = inventory.samples.len(),
            publications = publications.publications.len(),
            files = emitted.files_written.len(),
            "pipeline run complete"
        );
        Ok(RunReport {
            samples: inventory.samples.len() as u64,
            duplicate_conflicts: inventory.duplicate_conflicts.len() as u64,
            assays: assays.assays.len() as u64,
            unresolved_assay_rows: assays.unresolved_rows,
            publications: publications.publications.len() as u64,
            unresolved_lookups: publications.unresolved_lookups.len() as u64,
            links: linkage.links.len() as u64,
            orphaned_links: linkage.orphaned_links,
            validation_passed: validation.passed,
            validation_errors: validation.errors,
            validation_warnings: validation.warnings,
            samples_scrubbed: scrubbed.audit.record_count_scrubbed,
            files_written: emitted.files_written,
        })
    }

    fn harmonize_table(&self) -> Result<HarmonizedInventory, PipelineError> {
        let inventory = Harmonizer::new().harmonize_dir(&self.config.inventory_dir)?;
        self.save_stage(INVENTORY_STAGE, &inventory)?;
        Ok(inventory)
    }

    fn assay_table(&self) -> Result<AssayTable, PipelineError> {
        let extractor = AssayExtractor::new(&self.config.study_labels);
        let table = extractor.extract_dir(&self.config.tracking_dir)?;
        self.save_stage(ASSAYS_STAGE, &table)?;
        Ok(table)
    }

    fn publication_set(&self) -> Result<PublicationSet, PipelineError> {
        let stubs = load_stubs(&self.config.citations_file)?;
        let set = PublicationResolver::new(&self.client).resolve(&stubs)?;
        self.save_stage(PUBLICATIONS_STAGE, &set)?;
        Ok(set)
    }

    fn emit_tables(
        &self,
        inventory: &HarmonizedInventory,
        assays: &AssayTable,
        publications: &PublicationSet,
        linkage: &LinkageSet,
        scrubbed: &ScrubbedSamples,
    ) -> Result<EmitSummary, PipelineError> {
        Emitter::emit(
            &self.config.output_dir,
            &EmitInputs {
                studies: &linkage.studies,
                cross_refs: &linkage.cross_refs,
                samples: &inventory.samples,
                public_samples: &scrubbed.samples,
                assays: &assays.assays,
                unresolved_assay_rows: assays.unresolved_rows,
                publications: &publications.publications,
                dashboard: &self.config.dashboard,
            },
        )
    }

    fn stage_path(&self, name: &str) -> Utf8PathBuf {
        self.config.processed_dir.join(name)
    }

    fn stage_report(&self, stage: &str, records: u64, warnings: u64, name: &str) -> StageReport {
        StageReport {
            stage: stage.to_string(),
            records,
            warnings,
            output: self.stage_path(name).to_string(),
        }
    }

    fn save_stage<T: Serialize>(&self, name: &str, value: &T) -> Result<(), PipelineError> {
        fs::create_dir_all(self.config.processed_dir.as_std_path())
            .map_err(|err| PipelineError::Filesystem(err.to_string()))?;
        let value = serde_json::to_value(value).map_err(|err| PipelineError::Serialize {
            what: name.to_string(),
            message: err.to_string(),
        })?;
        write_json_atomic(&self.config.processed_dir, name, &value)
    }

    fn load_stage<T: DeserializeOwned>(&self, name: &str) -> Result<T, PipelineError> {
        let path = self.stage_path(name);
        if !path.as_std_path().is_file() {
            return Err(PipelineError::StageOutputMissing(path));
        }
        let content =
            fs::read_to_string(path.as_std_path()).map_err(|err| PipelineError::InputRead {
                path: path.clone(),
                message: err.to_string(),
            })?;
        serde_json::from_str(&content).map_err(|err| PipelineError::JsonParse {
            path,
            message: err.to_string(),
        })
    }
}
