pub mod commands;
pub mod config;
pub mod services;
pub mod utils;

pub use commands::{Pipeline, PipelineError};
pub use config::CoreConfig;
