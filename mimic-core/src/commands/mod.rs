// src/commands/mod.rs
pub mod init;
mod api;

pub use api::{
    collect_identities, CookieReport, PersonaBatch, PersonaSelection, Pipeline, PipelineError,
    RunReport,
};

pub use init::{default_root, ensure_initialized, InitReport};
