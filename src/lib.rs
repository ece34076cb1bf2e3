pub mod app;
pub mod assay;
pub mod config;
pub mod domain;
pub mod emit;
pub mod error;
pub mod harmonize;
pub mod linker;
pub mod output;
pub mod publications;
pub mod scrub;
pub mod validate;
