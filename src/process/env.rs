//! Environment surface handed to plugin processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use url::Url;

use crate::types::{Error, Result};

pub const ENV_DATABASE_URL: &str = "RELAY_LOOP_DATABASE_URL";
pub const ENV_PROMETHEUS_PORT: &str = "RELAY_LOOP_PROMETHEUS_PORT";
pub const ENV_TRACING_ENABLED: &str = "RELAY_LOOP_TRACING_ENABLED";
pub const ENV_TRACING_COLLECTOR_TARGET: &str = "RELAY_LOOP_TRACING_COLLECTOR_TARGET";
pub const ENV_TRACING_SAMPLING_RATIO: &str = "RELAY_LOOP_TRACING_SAMPLING_RATIO";
pub const ENV_TRACING_ATTRIBUTE_PREFIX: &str = "RELAY_LOOP_TRACING_ATTRIBUTE_";
pub const ENV_TRACING_TLS_CERT_PATH: &str = "RELAY_LOOP_TRACING_TLS_CERT_PATH";
/// Serve this many calls, then close the connection (and exit).
pub const ENV_CALL_LIMIT: &str = "RELAY_LOOP_CALL_LIMIT";

/// Tracing export settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TracingEnv {
    pub enabled: bool,
    pub collector_target: Option<Url>,
    pub sampling_ratio: f64,
    /// Extra resource attributes, keyed by the lowercased variable suffix.
    pub attributes: BTreeMap<String, String>,
    pub tls_cert_path: Option<PathBuf>,
}

/// Everything a plugin process reads from its environment. All optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvConfig {
    pub database_url: Option<String>,
    pub prometheus_port: Option<u16>,
    pub tracing: TracingEnv,
    pub call_limit: Option<u64>,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Parse from `(name, value)` pairs. Unknown names are ignored.
    ///
    /// With tracing enabled the collector target is required and must be a URL.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut cfg = EnvConfig::default();
        let mut collector_target: Option<String> = None;

        for (key, value) in vars {
            let key = key.as_ref();
            let value: String = value.into();
            match key {
                ENV_DATABASE_URL => cfg.database_url = Some(value),
                ENV_PROMETHEUS_PORT => {
                    cfg.prometheus_port = Some(value.parse().map_err(|_| {
                        Error::validation(format!("{}: invalid port {:?}", key, value))
                    })?)
                }
                ENV_TRACING_ENABLED => {
                    cfg.tracing.enabled = value.parse().map_err(|_| {
                        Error::validation(format!("{}: expected true or false, got {:?}", key, value))
                    })?
                }
                ENV_TRACING_COLLECTOR_TARGET => collector_target = Some(value),
                ENV_TRACING_SAMPLING_RATIO => {
                    let ratio: f64 = value.parse().map_err(|_| {
                        Error::validation(format!("{}: invalid ratio {:?}", key, value))
                    })?;
                    if !(0.0..=1.0).contains(&ratio) {
                        return Err(Error::validation(format!(
                            "{}: ratio {} outside [0, 1]",
                            key, ratio
                        )));
                    }
                    cfg.tracing.sampling_ratio = ratio;
                }
                ENV_TRACING_TLS_CERT_PATH => cfg.tracing.tls_cert_path = Some(PathBuf::from(value)),
                ENV_CALL_LIMIT => {
                    cfg.call_limit = Some(value.parse().map_err(|_| {
                        Error::validation(format!("{}: invalid call limit {:?}", key, value))
                    })?)
                }
                _ => {
                    if let Some(attr) = key.strip_prefix(ENV_TRACING_ATTRIBUTE_PREFIX) {
                        if !attr.is_empty() {
                            cfg.tracing.attributes.insert(attr.to_ascii_lowercase(), value);
                        }
                    }
                }
            }
        }

        if cfg.tracing.enabled {
            let target = collector_target.ok_or_else(|| {
                Error::validation(format!(
                    "{} is required when tracing is enabled",
                    ENV_TRACING_COLLECTOR_TARGET
                ))
            })?;
            let url = Url::parse(&target).map_err(|e| {
                Error::validation(format!(
                    "{}: {:?} is not a valid URL: {}",
                    ENV_TRACING_COLLECTOR_TARGET, target, e
                ))
            })?;
            cfg.tracing.collector_target = Some(url);
        } else if let Some(target) = collector_target {
            cfg.tracing.collector_target = Url::parse(&target).ok();
        }

        Ok(cfg)
    }

    /// Render as environment entries for a child process.
    pub fn as_cmd_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(url) = &self.database_url {
            env.push((ENV_DATABASE_URL.to_string(), url.clone()));
        }
        if let Some(port) = self.prometheus_port {
            env.push((ENV_PROMETHEUS_PORT.to_string(), port.to_string()));
        }
        if self.tracing.enabled {
            env.push((ENV_TRACING_ENABLED.to_string(), "true".to_string()));
            env.push((
                ENV_TRACING_SAMPLING_RATIO.to_string(),
                self.tracing.sampling_ratio.to_string(),
            ));
        }
        if let Some(target) = &self.tracing.collector_target {
            env.push((ENV_TRACING_COLLECTOR_TARGET.to_string(), target.to_string()));
        }
        for (name, value) in &self.tracing.attributes {
            env.push((
                format!("{}{}", ENV_TRACING_ATTRIBUTE_PREFIX, name.to_ascii_uppercase()),
                value.clone(),
            ));
        }
        if let Some(path) = &self.tracing.tls_cert_path {
            env.push((
                ENV_TRACING_TLS_CERT_PATH.to_string(),
                path.to_string_lossy().into_owned(),
            ));
        }
        if let Some(limit) = self.call_limit {
            env.push((ENV_CALL_LIMIT.to_string(), limit.to_string()));
        }
        env
    }
}
