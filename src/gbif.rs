use std::io::Read;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::GbifSettings;
use crate::domain::SpeciesMatch;
use crate::error::KiraError;
use crate::http::{ResilientClient, RetryPolicy};
use crate::poll::JobStatus;

/// Occurrence-store operations: name matching, download jobs and their archives.
pub trait GbifClient: Send + Sync {
    /// `Ok(None)` when the service rejects the lookup for this one name.
    fn match_species(&self, name: &str) -> Result<Option<SpeciesMatch>, KiraError>;
    fn submit_download(&self, species_keys: &[String]) -> Result<String, KiraError>;
    fn download_status(&self, job_id: &str) -> Result<DownloadStatus, KiraError>;
    fn fetch_archive(&self, link: &str) -> Result<Vec<u8>, KiraError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DownloadStatus {
    pub status: JobStatus,
    #[serde(rename = "downloadLink", default)]
    pub download_link: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
}

#[derive(Clone)]
pub struct GbifHttpClient {
    http: ResilientClient,
    submission: ResilientClient,
    downloads: ResilientClient,
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    creator: String,
    kingdom: String,
}

impl GbifHttpClient {
    pub fn new(
        settings: &GbifSettings,
        policy: RetryPolicy,
        submission_policy: RetryPolicy,
    ) -> Result<Self, KiraError> {
        let http = ResilientClient::new("gbif", policy.clone(), settings.timeout)?;
        let downloads = ResilientClient::new("gbif", policy, settings.download_timeout)?;
        Ok(Self::with_clients(http, downloads, submission_policy, settings))
    }

    /// `http` serves API calls and, under `submission_policy`, download requests;
    /// `downloads` fetches archives.
    pub fn with_clients(
        http: ResilientClient,
        downloads: ResilientClient,
        submission_policy: RetryPolicy,
        settings: &GbifSettings,
    ) -> Self {
        let submission = http.with_policy(submission_policy);
        Self {
            http,
            submission,
            downloads,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            user: settings.user.clone(),
            password: settings.password.clone(),
            creator: settings.creator.clone(),
            kingdom: settings.kingdom.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

impl GbifClient for GbifHttpClient {
    fn match_species(&self, name: &str) -> Result<Option<SpeciesMatch>, KiraError> {
        let url = self.url("species/match");
        let response = self.http.execute(|client| {
            client.get(&url).query(&[
                ("name", name),
                ("kingdom", self.kingdom.as_str()),
                ("strict", "true"),
            ])
        })?;
        if !response.status().is_success() {
            tracing::warn!(name, status = response.status().as_u16(), "species match rejected");
            return Ok(None);
        }
        let matched = response
            .json()
            .map_err(|err| self.http.invalid(err.to_string()))?;
        Ok(Some(matched))
    }

    fn submit_download(&self, species_keys: &[String]) -> Result<String, KiraError> {
        let (Some(user), Some(password)) = (&self.user, &self.password) else {
            return Err(KiraError::MissingCredentials(
                "gbif.user and gbif.password (or GBIF_USER/GBIF_PASSWORD) are required to request downloads"
                    .to_string(),
            ));
        };
        let url = self.url("occurrence/download/request");
        let predicate = download_predicate(&self.creator, species_keys);
        let response = self.submission.execute(|client| {
            client
                .post(&url)
                .basic_auth(user, Some(password))
                .json(&predicate)
        })?;
        if response.status().as_u16() != 201 {
            let response = self.submission.ensure_success(response)?;
            return Err(self.submission.invalid(format!(
                "download request answered {} instead of 201",
                response.status().as_u16()
            )));
        }
        let job_id = response
            .text()
            .map_err(|err| self.submission.invalid(err.to_string()))?;
        let job_id = job_id.trim().to_string();
        if job_id.is_empty() {
            return Err(self.submission.invalid("empty download id"));
        }
        Ok(job_id)
    }

    fn download_status(&self, job_id: &str) -> Result<DownloadStatus, KiraError> {
        let url = self.url(&format!("occurrence/download/{job_id}"));
        let response = self.http.execute_ok(|client| client.get(&url))?;
        response
            .json()
            .map_err(|err| self.http.invalid(err.to_string()))
    }

    fn fetch_archive(&self, link: &str) -> Result<Vec<u8>, KiraError> {
        let mut response = self.downloads.execute_ok(|client| client.get(link))?;
        let mut bytes = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
        response
            .read_to_end(&mut bytes)
            .map_err(|err| KiraError::RemoteUnavailable {
                service: self.downloads.service().to_string(),
                attempts: 1,
                reason: err.to_string(),
            })?;
        Ok(bytes)
    }
}

/// Download request body: the given species, with coordinates, without
/// geospatial issues, excluding fossils.
pub fn download_predicate(creator: &str, species_keys: &[String]) -> Value {
    json!({
        "creator": creator,
        "format": "SIMPLE_CSV",
        "predicate": {
            "type": "and",
            "predicates": [
                {"type": "in", "key": "SPECIES_KEY", "values": species_keys},
                {"type": "equals", "key": "HAS_GEOSPATIAL_ISSUE", "value": "false"},
                {"type": "equals", "key": "HAS_COORDINATE", "value": "true"},
                {
                    "type": "not",
                    "predicate": {"type": "equals", "key": "BASIS_OF_RECORD", "value": "FOSSIL_SPECIMEN"}
                }
            ]
        }
    })
}

/// Splits keys into consecutive chunks of at most `size`.
pub fn chunk_keys(keys: &[String], size: usize) -> Vec<&[String]> {
    keys.chunks(size.max(1)).collect()
}
