use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;

use crate::error::{PublishError, Result};

/// Option key holding the backend engine identifier.
pub const ENGINE_OPTION: &str = "ENGINE";

/// A named publish destination: one engine plus its flat option set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishTarget {
    pub name: String,
    pub options: BTreeMap<String, String>,
}

impl PublishTarget {
    pub fn new(name: impl Into<String>, options: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }

    /// Build a target from `(key, value)` pairs.
    pub fn from_pairs<'a>(
        name: impl Into<String>,
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let options = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self::new(name, options)
    }

    /// The engine identifier, or a configuration error when absent.
    pub fn engine(&self) -> Result<&str> {
        self.require(ENGINE_OPTION)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Get a non-empty option or fail naming the key.
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| PublishError::missing_option(key))
    }

    /// Check all required keys, failing on the first one missing.
    pub fn require_all(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.require(key)?;
        }
        Ok(())
    }

    /// Parse an optional boolean option (`true/false`, `yes/no`, `1/0`).
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "0" | "off" => Ok(Some(false)),
                other => Err(PublishError::InvalidTarget(format!(
                    "option {} of target {} is not a boolean: {}",
                    key, self.name, other
                ))),
            },
        }
    }

    /// Parse an optional unsigned integer option.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        self.get(key)
            .map(|v| {
                v.parse::<u64>().map_err(|_| {
                    PublishError::InvalidTarget(format!(
                        "option {} of target {} is not a number: {}",
                        key, self.name, v
                    ))
                })
            })
            .transpose()
    }
}

/// All publish targets from a configuration file, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    targets: BTreeMap<String, PublishTarget>,
}

impl TargetSet {
    /// Parse `{"name": {"ENGINE": "...", ...}, ...}`.
    ///
    /// Scalar values are stored as strings; nested values are rejected.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, BTreeMap<String, Value>> = serde_json::from_str(json)
            .map_err(|e| PublishError::InvalidTarget(format!("invalid targets file: {}", e)))?;

        let mut targets = BTreeMap::new();
        for (name, raw_options) in raw {
            let mut options = BTreeMap::new();
            for (key, value) in raw_options {
                let value = match value {
                    Value::String(s) => s,
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Null => String::new(),
                    Value::Array(_) | Value::Object(_) => {
                        return Err(PublishError::InvalidTarget(format!(
                            "option {} of target {} must be a scalar value",
                            key, name
                        )))
                    }
                };
                options.insert(key, value);
            }
            targets.insert(name.clone(), PublishTarget::new(name, options));
        }

        Ok(Self { targets })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            PublishError::Io(format!(
                "failed to read targets file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&json)
    }

    /// Look up a target; it must exist and declare an engine.
    pub fn get(&self, name: &str) -> Result<&PublishTarget> {
        let target = self.targets.get(name).ok_or_else(|| {
            PublishError::InvalidTarget(format!(
                "invalid publish target name: \"{}\", check your targets file",
                name
            ))
        })?;
        target.engine()?;
        Ok(target)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }
}
