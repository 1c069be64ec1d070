//! Resolved parameter sets and the provider contract used to build them.
//!
//! A [`ParamProvider`] layers a base set, a dictionary of overrides and a
//! line-oriented override string. Later layers always win.

use crate::SchedulerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const ONLY_KEY: &str = "only";
pub const NO_KEY: &str = "no";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    values: BTreeMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Overlays `other` on top of `self`, last write wins.
    pub fn merge(&mut self, other: &Params) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Whitespace-separated list stored under `key`.
    pub fn objects(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|value| value.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// View of the parameters specialised for one object: `<key>_<object>`
    /// overrides `<key>`.
    pub fn object_params(&self, object: &str) -> Params {
        let suffix = format!("_{object}");
        let mut scoped = self.clone();
        for (key, value) in &self.values {
            if let Some(base) = key.strip_suffix(&suffix) {
                if !base.is_empty() {
                    scoped.values.insert(base.to_string(), value.clone());
                }
            }
        }
        scoped
    }

    pub fn shortname(&self) -> &str {
        self.get_or("shortname", "")
    }

    pub fn name(&self) -> &str {
        self.get_or("name", "")
    }

    /// Renders the set as `key = value` override lines.
    pub fn to_override_str(&self) -> String {
        let mut output = String::new();
        for (key, value) in &self.values {
            output.push_str(key);
            output.push_str(" = ");
            output.push_str(value);
            output.push('\n');
        }
        output
    }
}

impl<K, V> FromIterator<(K, V)> for Params
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Params
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OverrideDirective {
    Assign { key: String, value: String },
    Restrict { key: String, value: String },
}

/// Parses a line-oriented override string.
///
/// `key = value` assigns. `only <v>`, `no <v>`, `only_<object> <v>` and
/// `no_<object> <v>` are restriction directives. Blank lines and `#` comments
/// are skipped.
pub fn parse_override_str(source: &str) -> Result<Vec<OverrideDirective>, SchedulerError> {
    let mut directives = Vec::new();
    for (index, raw_line) in source.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() || key.chars().any(char::is_whitespace) {
                return Err(SchedulerError::validation(format!(
                    "override line {} has an invalid key: '{}'",
                    index + 1,
                    line
                )));
            }
            directives.push(OverrideDirective::Assign {
                key: key.to_string(),
                value: value.trim().to_string(),
            });
            continue;
        }

        let (keyword, value) = line
            .split_once(char::is_whitespace)
            .map(|(keyword, value)| (keyword, value.trim()))
            .unwrap_or((line, ""));
        if !is_restriction_keyword(keyword) || value.is_empty() {
            return Err(SchedulerError::validation(format!(
                "override line {} is neither an assignment nor a restriction: '{}'",
                index + 1,
                line
            )));
        }
        directives.push(OverrideDirective::Restrict {
            key: keyword.to_string(),
            value: value.to_string(),
        });
    }
    Ok(directives)
}

fn is_restriction_keyword(keyword: &str) -> bool {
    keyword == ONLY_KEY
        || keyword == NO_KEY
        || (keyword.len() > 5 && keyword.starts_with("only_"))
        || (keyword.len() > 3 && keyword.starts_with("no_"))
}

/// Restriction on a variant followed by a block of parameter overrides.
pub fn restriction_str(variant: &str, param_str: &str) -> String {
    format!("{ONLY_KEY} {variant}\n{param_str}")
}

pub trait ParamProvider: Send + Sync {
    fn resolve(
        &self,
        base: &Params,
        overrides: Option<&Params>,
        override_str: Option<&str>,
    ) -> Result<Params, SchedulerError>;
}

pub type SharedParamProvider = Arc<dyn ParamProvider>;

/// Provider applying the documented layering without any variant grammar.
///
/// Restriction directives accumulate, in order and space separated, under
/// their keyword so executors can see which variant was requested.
#[derive(Clone, Copy, Debug, Default)]
pub struct LayeredParamProvider;

impl ParamProvider for LayeredParamProvider {
    fn resolve(
        &self,
        base: &Params,
        overrides: Option<&Params>,
        override_str: Option<&str>,
    ) -> Result<Params, SchedulerError> {
        let mut resolved = base.clone();
        if let Some(overrides) = overrides {
            resolved.merge(overrides);
        }
        let Some(override_str) = override_str else {
            return Ok(resolved);
        };

        for directive in parse_override_str(override_str)? {
            match directive {
                OverrideDirective::Assign { key, value } => {
                    resolved.insert(key, value);
                }
                OverrideDirective::Restrict { key, value } => {
                    let combined = match resolved.get(&key) {
                        Some(existing) if !existing.is_empty() => format!("{existing} {value}"),
                        _ => value,
                    };
                    resolved.insert(key, combined);
                }
            }
        }
        Ok(resolved)
    }
}
