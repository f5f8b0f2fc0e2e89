use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use reqwest::Method;
use serde::{Deserialize, Serialize};

use crate::archive::OccurrenceColumns;
use crate::error::KiraError;
use crate::http::RetryPolicy;

pub const DEFAULT_TERM: &str = "chloroplast[Filter] AND plants[Filter] AND complete[Properties] \
     NOT unverified[Title] AND (120000[SLEN] : 160000[SLEN])";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub entrez: EntrezSection,
    #[serde(default)]
    pub gbif: GbifSection,
    #[serde(default)]
    pub classify: ClassifySection,
    #[serde(default)]
    pub retry: RetrySection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EntrezSection {
    pub base_url: Option<String>,
    pub term: Option<String>,
    pub api_key: Option<String>,
    pub page_size: Option<usize>,
    pub requests_per_second: Option<u32>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GbifSection {
    pub base_url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub creator: Option<String>,
    pub kingdom: Option<String>,
    pub chunk_size: Option<usize>,
    pub poll_interval_secs: Option<u64>,
    pub poll_max_attempts: Option<u32>,
    pub tolerate_failed_jobs: Option<bool>,
    pub timeout_secs: Option<u64>,
    pub download_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClassifySection {
    pub raster_path: Option<String>,
    pub coord_uncertainty_limit: Option<f64>,
    pub zone_offset: Option<i32>,
    pub nodata: Option<i32>,
    pub columns: Option<OccurrenceColumns>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySection {
    pub default: Option<RetryEntry>,
    pub submission: Option<RetryEntry>,
}

/// `max_attempts: 0` means retry without limit.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryEntry {
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_cap_secs: Option<u64>,
    pub statuses: Option<Vec<u16>>,
    pub methods: Option<Vec<String>>,
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct EntrezSettings {
    pub base_url: String,
    pub term: String,
    pub api_key: Option<String>,
    pub page_size: usize,
    pub requests_per_second: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GbifSettings {
    pub base_url: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub creator: String,
    pub kingdom: String,
    pub chunk_size: usize,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub tolerate_failed_jobs: bool,
    pub timeout: Duration,
    pub download_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ClassifySettings {
    pub raster_path: Utf8PathBuf,
    pub coord_uncertainty_limit: f64,
    pub zone_offset: i32,
    pub nodata: i32,
    pub columns: OccurrenceColumns,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub default: RetryPolicy,
    pub submission: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub data_dir: Utf8PathBuf,
    pub entrez: EntrezSettings,
    pub gbif: GbifSettings,
    pub classify: ClassifySettings,
    pub retry: RetrySettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("kira-bg.json"),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    /// Like [`ConfigLoader::resolve`], but a missing default file yields the built-in defaults.
    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        match Self::resolve(path) {
            Err(KiraError::MissingConfig) => Self::resolve_config(Config::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let data_dir = Utf8PathBuf::from(config.data_dir.unwrap_or_else(|| "data".to_string()));

        let entrez = EntrezSettings {
            base_url: config
                .entrez
                .base_url
                .unwrap_or_else(|| "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string()),
            term: config.entrez.term.unwrap_or_else(|| DEFAULT_TERM.to_string()),
            api_key: config.entrez.api_key.or_else(|| env_value("NCBI_API_KEY")),
            page_size: positive(config.entrez.page_size.unwrap_or(50), "entrez.page_size")?,
            requests_per_second: positive(
                config.entrez.requests_per_second.unwrap_or(10),
                "entrez.requests_per_second",
            )?,
            timeout: Duration::from_secs(config.entrez.timeout_secs.unwrap_or(30)),
        };

        // Downloads are only accepted when the creator is the authenticated user.
        let gbif_user = config.gbif.user.or_else(|| env_value("GBIF_USER"));
        let gbif = GbifSettings {
            base_url: config
                .gbif
                .base_url
                .unwrap_or_else(|| "https://api.gbif.org/v1".to_string()),
            creator: config
                .gbif
                .creator
                .or_else(|| gbif_user.clone())
                .unwrap_or_else(|| "kira-bg".to_string()),
            user: gbif_user,
            password: config.gbif.password.or_else(|| env_value("GBIF_PASSWORD")),
            kingdom: config.gbif.kingdom.unwrap_or_else(|| "plantae".to_string()),
            chunk_size: positive(config.gbif.chunk_size.unwrap_or(300), "gbif.chunk_size")?,
            poll_interval: Duration::from_secs(config.gbif.poll_interval_secs.unwrap_or(30)),
            poll_max_attempts: positive(
                config.gbif.poll_max_attempts.unwrap_or(250),
                "gbif.poll_max_attempts",
            )?,
            tolerate_failed_jobs: config.gbif.tolerate_failed_jobs.unwrap_or(false),
            timeout: Duration::from_secs(config.gbif.timeout_secs.unwrap_or(30)),
            download_timeout: Duration::from_secs(
                config.gbif.download_timeout_secs.unwrap_or(120),
            ),
        };

        let classify = ClassifySettings {
            raster_path: config
                .classify
                .raster_path
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| data_dir.join("k2classes.asc")),
            coord_uncertainty_limit: config.classify.coord_uncertainty_limit.unwrap_or(4500.0),
            zone_offset: config.classify.zone_offset.unwrap_or(10),
            nodata: config.classify.nodata.unwrap_or(0),
            columns: config.classify.columns.unwrap_or_default(),
        };

        let retry = RetrySettings {
            default: resolve_retry(config.retry.default, RetryPolicy::idempotent())?,
            submission: resolve_retry(config.retry.submission, RetryPolicy::submission())?,
        };

        Ok(ResolvedConfig {
            schema_version,
            data_dir,
            entrez,
            gbif,
            classify,
            retry,
        })
    }
}

fn resolve_retry(entry: Option<RetryEntry>, base: RetryPolicy) -> Result<RetryPolicy, KiraError> {
    let Some(entry) = entry else {
        return Ok(base);
    };
    let methods = match entry.methods {
        Some(values) => values
            .iter()
            .map(|value| {
                Method::from_bytes(value.trim().to_uppercase().as_bytes())
                    .map_err(|_| KiraError::ConfigParse(format!("invalid HTTP method: {value}")))
            })
            .collect::<Result<Vec<_>, KiraError>>()?,
        None => base.retryable_methods,
    };
    Ok(RetryPolicy {
        max_attempts: match entry.max_attempts {
            Some(0) => None,
            Some(value) => Some(value),
            None => base.max_attempts,
        },
        backoff_base: entry
            .backoff_base_ms
            .map(Duration::from_millis)
            .unwrap_or(base.backoff_base),
        backoff_cap: entry
            .backoff_cap_secs
            .map(Duration::from_secs)
            .unwrap_or(base.backoff_cap),
        retryable_statuses: entry.statuses.unwrap_or(base.retryable_statuses),
        retryable_methods: methods,
        connect_timeout: entry
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(base.connect_timeout),
    })
}

fn positive<T: PartialOrd + Default>(value: T, field: &str) -> Result<T, KiraError> {
    if value <= T::default() {
        return Err(KiraError::ConfigParse(format!("{field} must be positive")));
    }
    Ok(value)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
