use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_FILE: &str = "pubmed_ingest";
const ENV_PREFIX: &str = "PUBMED";

pub const MAX_CONCURRENCY: usize = 1024;
pub const MAX_BATCH_SIZE: usize = 100_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Run settings: defaults, then an optional TOML file, then `PUBMED_*`
/// environment variables. CLI flags are layered on last by the binary.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_path: PathBuf,
    pub input_path: PathBuf,
    pub limit: usize,
    pub concurrency: usize,
    pub batch_size: usize,
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: PathBuf::from("data/pubmed.sqlite"),
            input_path: PathBuf::from("data/PMID_cluster_relation_202401.csv"),
            limit: 500,
            concurrency: 5,
            batch_size: 100,
            base_url: "https://pubmed.ncbi.nlm.nih.gov".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            backoff_ms: 2000,
            user_agent: concat!("pubmed_ingest/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Settings {
    /// Load settings. `file` is required to exist when given explicitly.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let d = Settings::default();
        let mut builder = config::Config::builder()
            .set_default("database_path", d.database_path.to_string_lossy().as_ref())?
            .set_default("input_path", d.input_path.to_string_lossy().as_ref())?
            .set_default("limit", d.limit as i64)?
            .set_default("concurrency", d.concurrency as i64)?
            .set_default("batch_size", d.batch_size as i64)?
            .set_default("base_url", d.base_url.as_str())?
            .set_default("timeout_secs", d.timeout_secs as i64)?
            .set_default("max_retries", d.max_retries as i64)?
            .set_default("backoff_ms", d.backoff_ms as i64)?
            .set_default("user_agent", d.user_agent.as_str())?;

        builder = match file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_FILE).required(false)),
        };

        let settings: Settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("limit", self.limit as u64),
            ("concurrency", self.concurrency as u64),
            ("batch_size", self.batch_size as u64),
            ("timeout_secs", self.timeout_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        let bounded = [
            ("concurrency", self.concurrency, MAX_CONCURRENCY),
            ("batch_size", self.batch_size, MAX_BATCH_SIZE),
        ];
        for (key, value, max) in bounded {
            if value > max {
                return Err(ConfigError::Invalid {
                    key,
                    reason: format!("{} exceeds the maximum of {}", value, max),
                });
            }
        }
        if !self.base_url.starts_with("http") {
            return Err(ConfigError::Invalid {
                key: "base_url",
                reason: format!("not an http(s) url: {}", self.base_url),
            });
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn zero_batch_size_rejected() {
        let s = Settings { batch_size: 0, ..Settings::default() };
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn oversized_pool_and_batch_rejected() {
        let s = Settings { concurrency: MAX_CONCURRENCY + 1, ..Settings::default() };
        assert!(s.validate().unwrap_err().to_string().contains("concurrency"));

        let s = Settings { batch_size: 1_000_000_000, ..Settings::default() };
        assert!(s.validate().unwrap_err().to_string().contains("batch_size"));

        let s = Settings {
            concurrency: MAX_CONCURRENCY,
            batch_size: MAX_BATCH_SIZE,
            ..Settings::default()
        };
        s.validate().unwrap();
    }

    #[test]
    fn file_values_override_defaults() {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(f, "concurrency = 8\nbatch_size = 25\nbase_url = \"http://localhost:9\"").unwrap();

        let s = Settings::load(Some(f.path())).unwrap();
        assert_eq!(s.concurrency, 8);
        assert_eq!(s.batch_size, 25);
        assert_eq!(s.base_url, "http://localhost:9");
        assert_eq!(s.limit, 500);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/pubmed.toml"))).is_err());
    }
}
