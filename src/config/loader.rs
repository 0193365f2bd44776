use super::{expand_env_in_string, ProcessSpec};
use crate::error::{OverseerError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Keys that hold the process list in a config file
const LIST_KEYS: [&str; 2] = ["processes", "apps"];

/// A loaded configuration file.
///
/// Every declaration is validated on its own: invalid ones land in `rejected`
/// and do not prevent the others from being accepted.
#[derive(Debug, Default)]
pub struct ConfigFile {
    /// Profile applied when the caller does not select one
    pub profile: Option<String>,
    /// Default directory for log files
    pub log_dir: Option<PathBuf>,
    /// Valid declarations, in file order
    pub specs: Vec<ProcessSpec>,
    /// One `Validation` error per rejected declaration
    pub rejected: Vec<OverseerError>,
}

/// A declaration as it came out of the parser, before validation
struct Declaration {
    label: String,
    parsed: std::result::Result<ProcessSpec, String>,
}

impl ConfigFile {
    /// Load process declarations from a file (supports TOML and JSON)
    pub fn load(path: &Path) -> Result<ConfigFile> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OverseerError::InvalidConfig(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        match extension {
            "toml" => Self::parse_toml(&contents),
            "json" => Self::parse_json(&contents),
            _ => Err(OverseerError::InvalidConfig(format!(
                "Unsupported file format: {}. Use .toml or .json",
                extension
            ))),
        }
    }

    /// Parse a TOML document: `[[processes]]` tables or a single top-level process
    pub fn parse_toml(contents: &str) -> Result<ConfigFile> {
        let mut table: toml::Table = toml::from_str(contents)
            .map_err(|e| OverseerError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

        let profile = take_string(table.remove("profile"));
        let log_dir = take_string(table.remove("log_dir")).map(PathBuf::from);

        let list = LIST_KEYS.iter().find_map(|key| table.remove(*key));
        let values: Vec<toml::Value> = match list {
            Some(toml::Value::Array(items)) => items,
            Some(_) => {
                return Err(OverseerError::InvalidConfig(
                    "process list must be an array of tables".to_string(),
                ))
            }
            None if table.is_empty() => Vec::new(),
            None => vec![toml::Value::Table(table)],
        };

        let declarations = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| Declaration {
                label: value
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{}", index)),
                parsed: value.try_into::<ProcessSpec>().map_err(|e| e.to_string()),
            })
            .collect();

        Self::accept(profile, log_dir, declarations)
    }

    /// Parse a JSON document: `{"processes": [...]}`, a bare array, or a single object
    pub fn parse_json(contents: &str) -> Result<ConfigFile> {
        let document: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| OverseerError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;

        let (profile, log_dir, values) = match document {
            serde_json::Value::Array(items) => (None, None, items),
            serde_json::Value::Object(mut object) => {
                let profile = object
                    .remove("profile")
                    .and_then(|v| v.as_str().map(str::to_string));
                let log_dir = object
                    .remove("log_dir")
                    .and_then(|v| v.as_str().map(PathBuf::from));

                match LIST_KEYS.iter().find_map(|key| object.remove(*key)) {
                    Some(serde_json::Value::Array(items)) => (profile, log_dir, items),
                    Some(_) => {
                        return Err(OverseerError::InvalidConfig(
                            "process list must be an array of objects".to_string(),
                        ))
                    }
                    None if object.is_empty() => (profile, log_dir, Vec::new()),
                    None => (profile, log_dir, vec![serde_json::Value::Object(object)]),
                }
            }
            _ => {
                return Err(OverseerError::InvalidConfig(
                    "config must be an object or an array".to_string(),
                ))
            }
        };

        let declarations = values
            .into_iter()
            .enumerate()
            .map(|(index, value)| Declaration {
                label: value
                    .get("name")
                    .and_then(|n| n.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{}", index)),
                parsed: serde_json::from_value::<ProcessSpec>(value).map_err(|e| e.to_string()),
            })
            .collect();

        Self::accept(profile, log_dir, declarations)
    }

    fn accept(
        profile: Option<String>,
        log_dir: Option<PathBuf>,
        declarations: Vec<Declaration>,
    ) -> Result<ConfigFile> {
        if declarations.is_empty() {
            return Err(OverseerError::InvalidConfig(
                "No process configuration found in file".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut specs = Vec::new();
        let mut rejected = Vec::new();

        for declaration in declarations {
            let mut spec = match declaration.parsed {
                Ok(spec) => spec,
                Err(reason) => {
                    rejected.push(OverseerError::validation(declaration.label, reason));
                    continue;
                }
            };

            spec.expand_env_vars();

            let checked = spec
                .validate()
                .and_then(|_| spec.validate_profile(profile.as_deref()));
            if let Err(e) = checked {
                rejected.push(e);
                continue;
            }

            if !seen.insert(spec.name.clone()) {
                rejected.push(OverseerError::validation(
                    &spec.name,
                    "name is declared more than once",
                ));
                continue;
            }

            specs.push(spec);
        }

        Ok(ConfigFile {
            profile,
            log_dir: log_dir.map(|dir| PathBuf::from(expand_env_in_string(&dir.to_string_lossy()))),
            specs,
            rejected,
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.specs.iter().map(|s| s.name.as_str()).collect()
    }
}

fn take_string(value: Option<toml::Value>) -> Option<String> {
    match value {
        Some(toml::Value::String(s)) => Some(s),
        _ => None,
    }
}
