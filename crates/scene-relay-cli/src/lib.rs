//! scene-relay command line: config resolution, environment checks and the
//! interactive REPL.

pub mod config;
pub mod doctor;
pub mod repl;

pub use config::{load_config, resolve_config_path, LoadedConfig, Overrides};
