//! Flat key/value parameters used to define pools, resources and images.
//!
//! Parameters follow the test-framework convention where a key suffixed with
//! `_<object>` overrides the plain key for that object, e.g. `image_size_sn`
//! overrides `image_size` when looking at the `sn` image.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// A flat parameter dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    /// Create an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a parameter.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Get a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Get a parameter, falling back to `default`.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Interpret a parameter as a boolean (`yes`, `true`, `on`, `1`).
    pub fn get_boolean(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("yes" | "true" | "on" | "1")
        )
    }

    /// Split a whitespace separated parameter into its items.
    pub fn objects(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Parameters as seen by one object: `<key>_<name>` overrides `<key>`.
    pub fn object_params(&self, name: &str) -> Params {
        let suffix = format!("_{}", name);
        let mut out = self.clone();
        for (key, value) in &self.0 {
            if let Some(base) = key.strip_suffix(&suffix) {
                if !base.is_empty() {
                    out.0.insert(base.to_string(), value.clone());
                }
            }
        }
        out
    }

    /// Whether the parameter set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Normalize a human size such as `10G`, `512M`, `1.5GiB` or `4096` to bytes.
///
/// Units are binary (K = 1024).
pub fn normalize_size(value: &str) -> Result<u64> {
    let trimmed = value.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| EngineError::InvalidRequest(format!("Invalid size: {}", value)))?;

    let unit = unit.trim().to_ascii_uppercase();
    let unit = unit.trim_end_matches("IB").trim_end_matches('B');
    let multiplier: u64 = match unit {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => {
            return Err(EngineError::InvalidRequest(format!(
                "Invalid size unit: {}",
                value
            )))
        }
    };

    Ok((number * multiplier as f64).round() as u64)
}
