mod config;
mod diagnostics;
mod partial;

pub use config::*;
pub use diagnostics::{format_diagnostics, ConfigError, Diagnostic, LoadError, Warning};
