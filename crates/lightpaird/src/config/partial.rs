use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use toml::Spanned;

use super::diagnostics::{
    Diagnostic, Error, LoadError, MergeConflictLocation, MergeError, SourceInfo, Warning,
};
use super::LogLevel;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialConfig {
    #[serde(default)]
    pub imports: Vec<String>,

    pub logging: Option<PartialLoggingConfig>,
    pub api: Option<PartialApiConfig>,
    pub mqtt: Option<PartialMqttConfig>,
    pub reachability: Option<PartialReachabilityConfig>,
    pub pairings: Option<HashMap<String, PartialPairing>>,

    /// Source information for error reporting (not serialized)
    #[serde(skip)]
    pub source: Option<SourceInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialLoggingConfig {
    pub level: Option<Spanned<LogLevel>>,
    pub overrides: Option<HashMap<String, Spanned<LogLevel>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialApiConfig {
    pub listen: Option<Spanned<String>>,
    pub port: Option<Spanned<u16>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialMqttConfig {
    pub broker: Option<Spanned<String>>,
    pub port: Option<Spanned<u16>>,
    pub client_id: Option<Spanned<String>>,
    pub discovery_prefix: Option<Spanned<String>>,
    pub keep_alive_s: Option<Spanned<u64>>,
    pub username: Option<Spanned<String>>,
    pub password: Option<Spanned<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialReachabilityConfig {
    pub poll_interval_ms: Option<Spanned<u64>>,
    pub max_poll_interval_ms: Option<Spanned<u64>>,
    pub backoff: Option<Spanned<f64>>,
    pub timeout_s: Option<Spanned<u64>>,
}

/// A pairing as written in a config file; every field is checked later.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialPairing {
    pub name: Option<String>,
    pub physical_device: Option<String>,
    pub smart_device: Option<String>,
    pub brightness_on_switch: Option<i64>,
    pub turn_off_physical_on_off: Option<bool>,
}

/// First-wins bookkeeping for one merge run.
///
/// Remembers where each field was first defined so that a second definition
/// can be reported with both locations.
#[derive(Default)]
struct Merger {
    seen: HashMap<String, MergeConflictLocation>,
    diagnostics: Vec<Diagnostic>,
}

impl Merger {
    /// Merge one spanned scalar into `slot`.
    fn field<T>(
        &mut self,
        field_path: &str,
        slot: &mut Option<Spanned<T>>,
        value: Option<Spanned<T>>,
        source: &SourceInfo,
    ) {
        let Some(value) = value else {
            return;
        };
        let location = MergeConflictLocation {
            file_path: source.file_path.clone(),
            span: value.span(),
            content: source.content.clone(),
        };
        if self.check(field_path, location) {
            *slot = Some(value);
        }
    }

    /// Record a definition of `field_path`. Returns true when it is the first.
    fn check(&mut self, field_path: &str, location: MergeConflictLocation) -> bool {
        if let Some(prev_loc) = self.seen.get(field_path) {
            // Conflict: keep first value, record error
            self.diagnostics
                .push(Diagnostic::Error(Error::Merge(MergeError {
                    field_path: field_path.to_string(),
                    message: format!("'{}' defined in multiple config files", field_path),
                    conflicts: vec![prev_loc.clone(), location],
                })));
            false
        } else {
            self.seen.insert(field_path.to_string(), location);
            true
        }
    }
}

impl PartialConfig {
    /// Load a single config file without processing imports
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            error: e,
        })?;

        let mut config: PartialConfig = toml::from_str(&content).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            error: e,
        })?;

        config.source = Some(SourceInfo {
            file_path: path.to_path_buf(),
            content,
        });

        Ok(config)
    }

    /// Load config files with import resolution
    ///
    /// Each config file is loaded, then its imports are recursively processed.
    /// Cycle detection prevents infinite loops.
    ///
    /// Returns a Vec of all loaded configs in order (imports first, then parent)
    pub fn load_with_imports(paths: &[PathBuf]) -> Result<Vec<Self>, LoadError> {
        let mut visited = HashSet::new();
        let mut all_configs = Vec::new();

        for path in paths {
            Self::load_recursive(path, &mut visited, &mut all_configs)?;
        }

        Ok(all_configs)
    }

    /// Recursively load a config file and its imports
    fn load_recursive(
        path: &Path,
        visited: &mut HashSet<PathBuf>,
        configs: &mut Vec<Self>,
    ) -> Result<(), LoadError> {
        // Canonicalize the path to detect cycles reliably
        let canonical_path = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());

        if visited.contains(&canonical_path) {
            return Err(LoadError::ImportCycle {
                path: canonical_path.clone(),
                cycle: visited.iter().cloned().collect(),
            });
        }

        visited.insert(canonical_path.clone());

        let config = Self::from_file(path)?;

        // Process imports first (depth-first)
        for import_path in &config.imports {
            let import_path_buf = PathBuf::from(import_path);

            // Resolve relative imports from the parent file's directory
            let resolved_path = if import_path_buf.is_absolute() {
                import_path_buf
            } else {
                let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
                parent_dir.join(import_path_buf)
            };

            Self::load_recursive(&resolved_path, visited, configs)?;
        }

        // Add this config after its imports
        configs.push(config);

        // Remove from visited set to allow imports from sibling branches
        visited.remove(&canonical_path);

        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.logging.is_none()
            && self.api.is_none()
            && self.mqtt.is_none()
            && self.reachability.is_none()
            && self.pairings.is_none()
            && self.imports.is_empty()
    }

    /// Merge multiple partial configs together
    ///
    /// Uses first-wins semantics: the first occurrence of a field is kept.
    /// Conflicts (same field defined in multiple configs) are collected as errors
    /// but merging continues to find all conflicts at once (compiler-style error collection).
    ///
    /// Returns (merged, diagnostics) where diagnostics may contain warnings and errors
    pub fn merge<I>(configs: I) -> (Self, Vec<Diagnostic>)
    where
        I: IntoIterator<Item = Self>,
    {
        let mut result = PartialConfig::default();
        let mut merger = Merger::default();
        let mut imports = Vec::new();

        for config in configs {
            imports.extend(config.imports.clone());

            let source_info = config.source.as_ref().cloned().unwrap_or_else(|| SourceInfo {
                file_path: PathBuf::from("<unknown>"),
                content: String::new(),
            });

            if config.is_empty() {
                merger
                    .diagnostics
                    .push(Diagnostic::Warning(Warning::EmptyConfig {
                        file_path: source_info.file_path.clone(),
                    }));
            }

            if let Some(logging) = config.logging {
                let result_logging = result.logging.get_or_insert_with(Default::default);
                merger.field(
                    "logging.level",
                    &mut result_logging.level,
                    logging.level,
                    &source_info,
                );

                // First-wins per key
                if let Some(overrides) = logging.overrides {
                    let result_overrides = result_logging.overrides.get_or_insert_with(HashMap::new);
                    let mut keys: Vec<_> = overrides.into_iter().collect();
                    keys.sort_by(|a, b| a.0.cmp(&b.0));
                    for (key, value) in keys {
                        let mut slot = None;
                        merger.field(
                            &format!("logging.overrides.{}", key),
                            &mut slot,
                            Some(value),
                            &source_info,
                        );
                        if let Some(value) = slot {
                            result_overrides.insert(key, value);
                        }
                    }
                }
            }

            if let Some(api) = config.api {
                let result_api = result.api.get_or_insert_with(Default::default);
                merger.field("api.listen", &mut result_api.listen, api.listen, &source_info);
                merger.field("api.port", &mut result_api.port, api.port, &source_info);
            }

            if let Some(mqtt) = config.mqtt {
                let m = result.mqtt.get_or_insert_with(Default::default);
                merger.field("mqtt.broker", &mut m.broker, mqtt.broker, &source_info);
                merger.field("mqtt.port", &mut m.port, mqtt.port, &source_info);
                merger.field("mqtt.client_id", &mut m.client_id, mqtt.client_id, &source_info);
                merger.field(
                    "mqtt.discovery_prefix",
                    &mut m.discovery_prefix,
                    mqtt.discovery_prefix,
                    &source_info,
                );
                merger.field(
                    "mqtt.keep_alive_s",
                    &mut m.keep_alive_s,
                    mqtt.keep_alive_s,
                    &source_info,
                );
                merger.field("mqtt.username", &mut m.username, mqtt.username, &source_info);
                merger.field("mqtt.password", &mut m.password, mqtt.password, &source_info);
            }

            if let Some(reachability) = config.reachability {
                let r = result.reachability.get_or_insert_with(Default::default);
                merger.field(
                    "reachability.poll_interval_ms",
                    &mut r.poll_interval_ms,
                    reachability.poll_interval_ms,
                    &source_info,
                );
                merger.field(
                    "reachability.max_poll_interval_ms",
                    &mut r.max_poll_interval_ms,
                    reachability.max_poll_interval_ms,
                    &source_info,
                );
                merger.field(
                    "reachability.backoff",
                    &mut r.backoff,
                    reachability.backoff,
                    &source_info,
                );
                merger.field(
                    "reachability.timeout_s",
                    &mut r.timeout_s,
                    reachability.timeout_s,
                    &source_info,
                );
            }

            // Pairings merge as whole tables (first-wins per pairing)
            if let Some(pairings) = config.pairings {
                let result_pairings = result.pairings.get_or_insert_with(HashMap::new);
                let mut keys: Vec<_> = pairings.into_iter().collect();
                keys.sort_by(|a, b| a.0.cmp(&b.0));
                for (key, value) in keys {
                    // Find the span of the pairing definition in the source
                    let header = format!("[pairings.{}]", key);
                    let span = source_info
                        .content
                        .find(&header)
                        .map(|start| start..(start + header.len()))
                        .unwrap_or(0..0);

                    let location = MergeConflictLocation {
                        file_path: source_info.file_path.clone(),
                        span,
                        content: source_info.content.clone(),
                    };

                    if merger.check(&format!("pairings.{}", key), location) {
                        result_pairings.insert(key, value);
                    }
                }
            }
        }

        result.imports = imports;

        (result, merger.diagnostics)
    }
}
