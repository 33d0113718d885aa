//! Hierarchical `simtest.yaml` discovery.
//!
//! Starting from the directory holding a definition file, every ancestor up
//! to the filesystem root is checked for a config file. Fragments are
//! merged root first, leaf last, by plain concatenation: duplicates are kept
//! so that precedence is decided by search order alone.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Fixed name of the per-directory configuration file.
pub const CONFIG_FILENAME: &str = "simtest.yaml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default, alias = "search_paths")]
    python_paths: Option<Vec<String>>,
}

/// The parsed contents of one config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFragment {
    /// Location of the file the fragment was read from.
    pub file: PathBuf,

    /// Paths exactly as written, in file order.
    pub paths: Vec<String>,
}

impl ConfigFragment {
    /// Parse config text read from `file`.
    pub fn parse(text: &str, file: &Path) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(text).map_err(|e| schema_error(file, &e))?;

        if value.is_null() {
            debug!(file = %file.display(), "config file is empty");
            return Ok(Self {
                file: file.to_path_buf(),
                paths: Vec::new(),
            });
        }

        if !value.is_mapping() {
            return Err(ConfigError::Schema {
                path: file.to_path_buf(),
                line: None,
                column: None,
                message: "expected a mapping at top level".to_string(),
            });
        }

        let raw: RawConfig = serde_yaml::from_str(text).map_err(|e| schema_error(file, &e))?;

        Ok(Self {
            file: file.to_path_buf(),
            paths: raw.python_paths.unwrap_or_default(),
        })
    }

    /// Read and parse a config file from disk.
    pub fn load(file: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(file).map_err(|source| ConfigError::Read {
            path: file.to_path_buf(),
            source,
        })?;
        Self::parse(&text, file)
    }

    /// Directory the fragment's relative paths are anchored to.
    pub fn base_dir(&self) -> &Path {
        self.file.parent().unwrap_or_else(|| Path::new("/"))
    }

    /// Absolute directories, in file order. Missing or non-directory
    /// entries are kept and reported as warnings.
    pub fn resolved_paths(&self) -> Vec<PathBuf> {
        let base = self.base_dir();
        self.paths
            .iter()
            .map(|raw| {
                let candidate = Path::new(raw);
                let resolved = if candidate.is_absolute() {
                    candidate.to_path_buf()
                } else {
                    normalize(&base.join(candidate))
                };

                if !resolved.exists() {
                    warn!(
                        config = %self.file.display(),
                        path = %resolved.display(),
                        "search path does not exist"
                    );
                } else if !resolved.is_dir() {
                    warn!(
                        config = %self.file.display(),
                        path = %resolved.display(),
                        "search path is not a directory"
                    );
                }

                resolved
            })
            .collect()
    }
}

/// Ordered absolute directories merged from every fragment above a
/// definition file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSearchPath {
    dirs: Vec<PathBuf>,
    sources: Vec<PathBuf>,
}

impl ResolvedSearchPath {
    /// Build directly from directories (no config files involved).
    pub fn from_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            sources: Vec::new(),
        }
    }

    /// Directories in search order, root-most config first.
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Config files that contributed, root first.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Number of search directories.
    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

/// Walks the directory tree and merges config fragments.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    filename: String,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self {
            filename: CONFIG_FILENAME.to_string(),
        }
    }
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different config file name (tests, embedding).
    pub fn with_filename(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
        }
    }

    /// Config files from `start_dir` up to the root, returned root first.
    pub fn discover(&self, start_dir: &Path) -> Vec<PathBuf> {
        let start = absolute_dir(start_dir);
        debug!(start = %start.display(), "starting config discovery");

        let mut found: Vec<PathBuf> = start
            .ancestors()
            .map(|dir| dir.join(&self.filename))
            .filter(|candidate| candidate.is_file())
            .collect();

        found.reverse();
        debug!(count = found.len(), "discovered config files");
        found
    }

    /// Merge all fragments above `start_dir` into one search path.
    pub fn resolve(&self, start_dir: &Path) -> Result<ResolvedSearchPath, ConfigError> {
        let files = self.discover(start_dir);
        let mut merged = ResolvedSearchPath::default();

        for file in files {
            let fragment = ConfigFragment::load(&file)?;
            let paths = fragment.resolved_paths();
            debug!(config = %file.display(), added = paths.len(), "merged config fragment");
            merged.dirs.extend(paths);
            merged.sources.push(file);
        }

        Ok(merged)
    }
}

fn schema_error(file: &Path, err: &serde_yaml::Error) -> ConfigError {
    let location = err.location();
    ConfigError::Schema {
        path: file.to_path_buf(),
        line: location.as_ref().map(|l| l.line()),
        column: location.as_ref().map(|l| l.column()),
        message: err.to_string(),
    }
}

fn absolute_dir(dir: &Path) -> PathBuf {
    if let Ok(canonical) = dir.canonicalize() {
        return canonical;
    }
    if dir.is_absolute() {
        normalize(dir)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        normalize(&cwd.join(dir))
    }
}

/// Lexically collapse `.` and `..` without touching the filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
