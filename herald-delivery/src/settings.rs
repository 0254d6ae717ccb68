use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Free-form provider or sink settings, validated when the component is built.
///
/// ```ron
/// provider: (
///     name: "smtp",
///     settings: { "host": "mail.example.com", "from": "noreply@example.com" },
/// )
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, String>);

impl Settings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// # Errors
    /// [`ConfigurationError::MissingSetting`] when the key is absent or blank.
    pub fn require(&self, component: &str, key: &str) -> Result<&str, ConfigurationError> {
        self.get(key)
            .ok_or_else(|| ConfigurationError::MissingSetting {
                component: component.to_string(),
                key: key.to_string(),
            })
    }

    /// Parse an optional setting, falling back to `default` when absent.
    ///
    /// # Errors
    /// [`ConfigurationError::InvalidSetting`] when present but unparseable.
    pub fn parse_or<T>(&self, component: &str, key: &str, default: T) -> Result<T, ConfigurationError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key).map_or(Ok(default), |value| {
            value
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigurationError::InvalidSetting {
                    component: component.to_string(),
                    key: key.to_string(),
                    reason: e.to_string(),
                })
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Settings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
