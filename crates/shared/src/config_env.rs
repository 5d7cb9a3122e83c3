use std::env;

use url::Url;

use crate::config::ConfigError;

/// Reads configuration values by key. Production code reads the process
/// environment; tests pass a fixed map.
pub(crate) struct EnvSource<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> EnvSource<'a> {
    pub(crate) fn new(lookup: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { lookup }
    }

    pub(crate) fn optional_trimmed(&self, key: &str) -> Option<String> {
        (self.lookup)(key).and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub(crate) fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.optional_trimmed(key)
            .ok_or_else(|| ConfigError::MissingVar(key.to_string()))
    }

    pub(crate) fn string_or(&self, key: &str, default: &str) -> String {
        self.optional_trimmed(key)
            .unwrap_or_else(|| default.to_string())
    }

    pub(crate) fn parse_u32(&self, key: &str, default: u32) -> Result<u32, ConfigError> {
        match self.optional_trimmed(key) {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| ConfigError::ParseInt(key.to_string())),
            None => Ok(default),
        }
    }

    pub(crate) fn parse_u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.optional_trimmed(key) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| ConfigError::ParseInt(key.to_string())),
            None => Ok(default),
        }
    }

    pub(crate) fn parse_usize(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.optional_trimmed(key) {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| ConfigError::ParseInt(key.to_string())),
            None => Ok(default),
        }
    }

    pub(crate) fn parse_f32(&self, key: &str, default: f32) -> Result<f32, ConfigError> {
        match self.optional_trimmed(key) {
            Some(raw) => raw
                .parse::<f32>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| ConfigError::ParseFloat(key.to_string())),
            None => Ok(default),
        }
    }

    pub(crate) fn parse_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional_trimmed(key) {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::ParseBool(key.to_string())),
            },
            None => Ok(default),
        }
    }

    pub(crate) fn http_url_or(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        let raw = self.string_or(key, default);
        let parsed = Url::parse(&raw).map_err(|_| {
            ConfigError::InvalidConfiguration(format!("{key} must be a valid URL"))
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ConfigError::InvalidConfiguration(format!(
                "{key} must start with http:// or https://"
            )));
        }
        Ok(raw)
    }
}

pub(crate) fn process_env(key: &str) -> Option<String> {
    env::var(key).ok()
}
