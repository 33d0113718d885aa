//! Error taxonomy for simtest.
//!
//! Each layer has its own enum so callers can decide what is fatal: a
//! [`ConfigError`] or [`LoadError`] only takes down the subtree that needed
//! it, a [`SystemError`] degrades to "no throttling".

use std::path::PathBuf;

/// Errors produced while discovering or parsing `simtest.yaml` files.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}{}: {message}", location_suffix(.line, .column))]
    Schema {
        path: PathBuf,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },
}

impl ConfigError {
    /// Path of the offending file.
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Schema { path, .. } => path,
        }
    }
}

/// Errors produced while resolving a handler reference.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("malformed handler reference '{0}' (expected module::handler)")]
    MalformedReference(String),

    #[error("module '{module}' not found in search order ({searched} entries)")]
    ModuleNotFound { module: String, searched: usize },

    #[error("handler '{handler}' not defined by module '{module}'")]
    HandlerNotFound { module: String, handler: String },

    #[error("unknown builtin handler '{0}'")]
    UnknownBuiltin(String),

    #[error("invalid handler module {path}{}: {message}", location_suffix(.line, .column))]
    InvalidModule {
        path: PathBuf,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    #[error("invalid parameters for handler '{handler}': {message}")]
    InvalidParams { handler: String, message: String },
}

/// Errors produced while building a testset from a definition file.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("unable to open test definition file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid test definition {path}{}: {message}", location_suffix(.line, .column))]
    Syntax {
        path: PathBuf,
        line: Option<usize>,
        column: Option<usize>,
        message: String,
    },

    #[error("configuration for {definition}: {source}")]
    Config {
        definition: PathBuf,
        #[source]
        source: ConfigError,
    },

    #[error("{definition}: {source}")]
    Resolve {
        definition: PathBuf,
        #[source]
        source: ResolveError,
    },

    #[error("{definition}: invalid benchmark pattern '{pattern}': {source}")]
    BenchPattern {
        definition: PathBuf,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{definition}: build failed: {message}")]
    Build { definition: PathBuf, message: String },
}

/// Failures of host sensors (load average, process table).
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("load average unavailable on this platform")]
    LoadUnavailable,

    #[error("system sensor failed: {0}")]
    Sensor(String),
}

/// Result type for definition loading.
pub type Result<T> = std::result::Result<T, LoadError>;

fn location_suffix(line: &Option<usize>, column: &Option<usize>) -> String {
    match (line, column) {
        (Some(line), Some(column)) => format!(":{line}:{column}"),
        (Some(line), None) => format!(":{line}"),
        _ => String::new(),
    }
}
