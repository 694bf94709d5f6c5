use std::ops::Range;
use std::path::PathBuf;

/// Source information for where a diagnostic came from
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub file_path: PathBuf,
    pub content: String,
}

/// A diagnostic message that can be either a warning or an error
#[derive(Debug, Clone)]
pub enum Diagnostic {
    Warning(Warning),
    Error(Error),
}

/// Warning messages that don't prevent config loading
#[derive(Debug, Clone)]
pub enum Warning {
    EmptyConfig { file_path: PathBuf },
    /// A device appears in more than one pairing
    SharedDevice {
        device: String,
        pairings: Vec<String>,
    },
}

/// Error messages that indicate problems with the config
#[derive(Debug, Clone)]
pub enum Error {
    Merge(MergeError),
    Validation(ValidationError),
}

/// Error type for merge conflicts
#[derive(Debug, Clone)]
pub struct MergeError {
    pub field_path: String,
    pub message: String,
    pub conflicts: Vec<MergeConflictLocation>,
}

#[derive(Debug, Clone)]
pub struct MergeConflictLocation {
    pub file_path: PathBuf,
    pub span: Range<usize>,
    pub content: String,
}

/// Error type for validation failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            message: message.into(),
        }
    }
}

/// Error type for config loading failures (parse errors, IO errors, etc.)
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Failed to read '{}': {error}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to parse '{}': {error}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        error: toml::de::Error,
    },

    #[error("Import cycle detected at '{}': involves {} file(s)", path.display(), cycle.len())]
    ImportCycle { path: PathBuf, cycle: Vec<PathBuf> },
}

/// Top-level config failure
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Merge or validation errors; the message is the formatted report.
    #[error("{report}")]
    Invalid {
        report: String,
        diagnostics: Vec<Diagnostic>,
    },
}

impl Diagnostic {
    /// Returns true if this diagnostic is an error
    pub fn is_error(&self) -> bool {
        matches!(self, Diagnostic::Error(_))
    }

    /// Returns true if this diagnostic is a warning
    pub fn is_warning(&self) -> bool {
        matches!(self, Diagnostic::Warning(_))
    }
}

/// Format all diagnostics for display using Ariadne
pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    use ariadne::{Color, Label, Report, ReportKind, Source};

    let mut output = Vec::new();

    for diagnostic in diagnostics {
        match diagnostic {
            Diagnostic::Warning(warning) => {
                let warning_msg = match warning {
                    Warning::EmptyConfig { file_path } => format!(
                        "Warning: Config file '{}' is empty and has no effect\n",
                        file_path.display()
                    ),
                    Warning::SharedDevice { device, pairings } => format!(
                        "Warning: Device '{}' is used by several pairings: {}\n",
                        device,
                        pairings.join(", ")
                    ),
                };
                output.extend_from_slice(warning_msg.as_bytes());
            }
            Diagnostic::Error(error) => match error {
                Error::Merge(merge_error) => {
                    let Some(first_conflict) = merge_error.conflicts.first() else {
                        let error_msg = format!(
                            "Merge conflict in field '{}': {}\n",
                            merge_error.field_path, merge_error.message
                        );
                        output.extend_from_slice(error_msg.as_bytes());
                        continue;
                    };

                    // Build a report with the first conflict's span
                    let mut report = Report::build(
                        ReportKind::Error,
                        (
                            first_conflict.file_path.to_string_lossy().to_string(),
                            first_conflict.span.clone(),
                        ),
                    )
                    .with_message(format!("Merge conflict in field '{}'", merge_error.field_path))
                    .with_note(&merge_error.message);

                    // Add labels for each conflict location
                    for (idx, conflict) in merge_error.conflicts.iter().enumerate() {
                        let label_msg = if idx == 0 {
                            "first definition here"
                        } else {
                            "conflicts with this definition"
                        };

                        report = report.with_label(
                            Label::new((
                                conflict.file_path.to_string_lossy().to_string(),
                                conflict.span.clone(),
                            ))
                            .with_message(label_msg)
                            .with_color(if idx == 0 { Color::Red } else { Color::Yellow }),
                        );
                    }

                    let finished_report = report.finish();

                    // Write to each unique source file
                    let mut written_files = std::collections::HashSet::new();
                    for conflict in &merge_error.conflicts {
                        let file_id = conflict.file_path.to_string_lossy().to_string();
                        if written_files.insert(file_id.clone()) {
                            let source = Source::from(&conflict.content);
                            finished_report
                                .write((file_id, source), &mut output)
                                .ok();
                        }
                    }
                }
                Error::Validation(validation_error) => {
                    let error_msg = format!(
                        "Validation error in '{}': {}\n",
                        validation_error.field_path, validation_error.message
                    );
                    output.extend_from_slice(error_msg.as_bytes());
                }
            },
        }
    }

    String::from_utf8_lossy(&output).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_validation_and_warnings() {
        let diagnostics = vec![
            Diagnostic::Warning(Warning::EmptyConfig {
                file_path: PathBuf::from("/etc/lightpaird/empty.toml"),
            }),
            Diagnostic::Error(Error::Validation(ValidationError::new(
                "pairings.hall.brightness_on_switch",
                "150 is outside 0..=100",
            ))),
            Diagnostic::Warning(Warning::SharedDevice {
                device: "light.hall".to_string(),
                pairings: vec!["hall".to_string(), "stairs".to_string()],
            }),
        ];

        insta::assert_snapshot!(format_diagnostics(&diagnostics), @r"
        Warning: Config file '/etc/lightpaird/empty.toml' is empty and has no effect
        Validation error in 'pairings.hall.brightness_on_switch': 150 is outside 0..=100
        Warning: Device 'light.hall' is used by several pairings: hall, stairs
        ");
    }

    #[test]
    fn test_merge_error_mentions_field() {
        let content = "[logging]\nlevel = \"info\"\n".to_string();
        let location = |name: &str| MergeConflictLocation {
            file_path: PathBuf::from(name),
            span: 18..24,
            content: content.clone(),
        };
        let diagnostics = vec![Diagnostic::Error(Error::Merge(MergeError {
            field_path: "logging.level".to_string(),
            message: "Logging level defined in multiple config files".to_string(),
            conflicts: vec![location("a.toml"), location("b.toml")],
        }))];

        let output = format_diagnostics(&diagnostics);
        assert!(output.contains("Merge conflict in field"));
        assert!(output.contains("logging.level"));
        assert!(output.contains("a.toml"));
        assert!(output.contains("b.toml"));
    }
}
