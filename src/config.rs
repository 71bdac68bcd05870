use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::privatizer::{PrivatizerKind, PrivatizerParams};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    pub node: NodeSection,
    pub lookup: LookupSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub privatizer: PrivatizerSection,
    #[serde(default)]
    pub retention: RetentionSection,
}

/// Identity of this node. `id` and `api-token` are written by the operator
/// after a first registration; when both are present the node skips the
/// registration call and goes straight to delegation sync.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct NodeSection {
    /// Address under which this node is reachable, announced on registration.
    pub host: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct LookupSection {
    /// Host (and optional port) of the trixel lookup service.
    pub host: String,
    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_sync_interval_s")]
    pub sync_interval_s: u64,
    #[serde(default = "default_register_backoff_ms")]
    pub register_backoff_ms: u64,
    #[serde(default = "default_register_backoff_cap_ms")]
    pub register_backoff_cap_ms: u64,
    #[serde(default = "default_max_register_attempts")]
    pub max_register_attempts: u32,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineSection {
    /// Evaluation tick period.
    pub trixel_update_frequency_s: u64,
    /// Ingestion rejects trixels deeper than this.
    pub max_trixel_level: u8,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct PrivatizerSection {
    pub privatizer: PrivatizerKind,
    /// Minimum distinct contributing stations before anything is published.
    pub min_contributors: u32,
    /// Minimum estimate quality before anything is published.
    pub quality_threshold: f64,
    /// Readings older than this at evaluation time are ignored.
    pub max_reading_age_s: u64,
    pub smoothing_alpha: f64,
    /// Kalman process noise Q.
    pub process_noise: f64,
    /// Kalman measurement noise R.
    pub measurement_noise: f64,
    /// Per-station impulse-noise rejection for the incremental strategies.
    /// Absent means no filtering.
    pub spike_threshold: Option<f64>,
    pub spike_smoothing: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetentionSection {
    pub purge_interval_s: u64,
    pub keep_interval_s: u64,
}

const fn default_use_ssl() -> bool {
    true
}

const fn default_request_timeout_ms() -> u64 {
    5_000
}

const fn default_sync_interval_s() -> u64 {
    60
}

const fn default_register_backoff_ms() -> u64 {
    500
}

const fn default_register_backoff_cap_ms() -> u64 {
    30_000
}

const fn default_max_register_attempts() -> u32 {
    10
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            trixel_update_frequency_s: 60,
            max_trixel_level: 20,
        }
    }
}

impl Default for PrivatizerSection {
    fn default() -> Self {
        Self {
            privatizer: PrivatizerKind::NaiveAverage,
            min_contributors: 3,
            quality_threshold: 0.0,
            max_reading_age_s: 300,
            smoothing_alpha: 0.5,
            process_noise: 0.01,
            measurement_noise: 1.0,
            spike_threshold: None,
            spike_smoothing: 0.1,
        }
    }
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            purge_interval_s: 3_600,
            // Two weeks.
            keep_interval_s: 14 * 24 * 3_600,
        }
    }
}

impl LookupSection {
    /// Versioned API root of the lookup service.
    pub fn base_url(&self) -> String {
        let scheme = if self.use_ssl { "https" } else { "http" };
        format!("{scheme}://{}/v1", self.host)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_s)
    }
}

impl EngineSection {
    pub fn update_frequency(&self) -> Duration {
        Duration::from_secs(self.trixel_update_frequency_s)
    }
}

impl PrivatizerSection {
    pub fn max_reading_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_reading_age_s as i64)
    }

    pub fn params(&self) -> PrivatizerParams {
        PrivatizerParams {
            smoothing_alpha: self.smoothing_alpha,
            process_noise: self.process_noise,
            measurement_noise: self.measurement_noise,
            spike_threshold: self.spike_threshold,
            spike_smoothing: self.spike_smoothing,
        }
    }
}

impl RetentionSection {
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_s)
    }

    pub fn keep_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.keep_interval_s as i64)
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.host.is_empty() {
            return Err(ConfigError::Validation("node host must not be empty".into()));
        }
        if self.node.id.is_some() != self.node.api_token.is_some() {
            return Err(ConfigError::Validation(
                "node id and api-token must be provided together".into(),
            ));
        }
        if Url::parse(&self.lookup.base_url()).is_err() {
            return Err(ConfigError::Validation(format!(
                "lookup host {:?} does not form a valid URL",
                self.lookup.host
            )));
        }
        if self.lookup.max_register_attempts == 0 {
            return Err(ConfigError::Validation(
                "max-register-attempts must be greater than zero".into(),
            ));
        }
        if self.engine.trixel_update_frequency_s == 0 {
            return Err(ConfigError::Validation(
                "trixel-update-frequency-s must be greater than zero".into(),
            ));
        }
        if self.privatizer.min_contributors == 0 {
            return Err(ConfigError::Validation(
                "min-contributors must be greater than zero".into(),
            ));
        }
        if !(self.privatizer.quality_threshold.is_finite()
            && self.privatizer.quality_threshold >= 0.0)
        {
            return Err(ConfigError::Validation(
                "quality-threshold must be finite and non-negative".into(),
            ));
        }
        for (name, alpha) in [
            ("smoothing-alpha", self.privatizer.smoothing_alpha),
            ("spike-smoothing", self.privatizer.spike_smoothing),
        ] {
            if !(alpha.is_finite() && alpha > 0.0 && alpha <= 1.0) {
                return Err(ConfigError::Validation(format!(
                    "{name} must lie in (0, 1]"
                )));
            }
        }
        for (name, noise) in [
            ("process-noise", self.privatizer.process_noise),
            ("measurement-noise", self.privatizer.measurement_noise),
        ] {
            if !(noise.is_finite() && noise > 0.0) {
                return Err(ConfigError::Validation(format!(
                    "{name} must be finite and positive"
                )));
            }
        }
        if let Some(threshold) = self.privatizer.spike_threshold {
            if !(threshold.is_finite() && threshold > 0.0) {
                return Err(ConfigError::Validation(
                    "spike-threshold must be finite and positive".into(),
                ));
            }
        }
        if self.retention.purge_interval_s == 0 || self.retention.keep_interval_s == 0 {
            return Err(ConfigError::Validation(
                "retention intervals must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn sample() -> Self {
        Self {
            node: NodeSection {
                host: "tms.example.org".into(),
                id: None,
                api_token: None,
            },
            lookup: LookupSection {
                host: "lookup.example.org".into(),
                use_ssl: default_use_ssl(),
                request_timeout_ms: default_request_timeout_ms(),
                sync_interval_s: default_sync_interval_s(),
                register_backoff_ms: default_register_backoff_ms(),
                register_backoff_cap_ms: default_register_backoff_cap_ms(),
                max_register_attempts: default_max_register_attempts(),
            },
            engine: EngineSection::default(),
            privatizer: PrivatizerSection::default(),
            retention: RetentionSection::default(),
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let format = resolve_format(path, format);
    let config: Config = match format {
        ConfigFormat::Toml => toml::from_str(&contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Yaml => serde_yaml::from_str(&contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
        ConfigFormat::Auto => unreachable!("auto variant resolved earlier"),
    }?;
    config.validate()?;
    Ok(config)
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => ConfigFormat::Toml,
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_validates() {
        Config::sample().validate().unwrap();
    }

    #[test]
    fn detects_zero_contributor_minimum() {
        let mut config = Config::sample();
        config.privatizer.min_contributors = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn detects_half_seeded_identity() {
        let mut config = Config::sample();
        config.node.id = Some(7);
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn detects_out_of_range_alpha() {
        let mut config = Config::sample();
        config.privatizer.smoothing_alpha = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn parses_toml_config() {
        let contents = r#"
            [node]
            host = "tms-a.example.org"

            [lookup]
            host = "lookup.example.org:4000"
            use-ssl = false
            sync-interval-s = 30

            [privatizer]
            privatizer = "kalman"
            min-contributors = 5
            process-noise = 0.05
        "#;

        let config: Config = toml::from_str(contents).unwrap();
        config.validate().unwrap();
        assert_eq!(config.privatizer.privatizer, PrivatizerKind::Kalman);
        assert_eq!(config.privatizer.min_contributors, 5);
        assert_eq!(config.lookup.base_url(), "http://lookup.example.org:4000/v1");
        assert_eq!(config.retention.purge_interval_s, 3_600);
    }

    #[test]
    fn parses_yaml_config() {
        let contents = r#"
            node:
              host: tms-b.example.org
              id: 12
              api-token: "abcd"
            lookup:
              host: lookup.example.org
            privatizer:
              privatizer: smoothing_average
              smoothing-alpha: 0.25
        "#;
        let config: Config = serde_yaml::from_str(contents).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node.id, Some(12));
        assert_eq!(
            config.privatizer.privatizer,
            PrivatizerKind::SmoothingAverage
        );
    }
}
