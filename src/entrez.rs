use regex::Regex;
use reqwest::header::{ACCEPT_ENCODING, HeaderValue};
use serde_json::Value;

use crate::config::EntrezSettings;
use crate::domain::{Record, SessionHandle};
use crate::error::KiraError;
use crate::http::{ResilientClient, RetryPolicy};
use crate::paginate::PageSource;

pub const NUCCORE_DB: &str = "nuccore";
pub const TAXONOMY_DB: &str = "taxonomy";

/// Sequence-database history-server operations used by the pipeline.
pub trait EntrezClient: Send + Sync {
    fn search(&self, db: &str, term: &str) -> Result<SessionHandle, KiraError>;
    fn summary_page(
        &self,
        db: &str,
        session: &SessionHandle,
        offset: usize,
        page_size: usize,
    ) -> Result<Value, KiraError>;
    fn post_ids(&self, db: &str, ids: &[String]) -> Result<SessionHandle, KiraError>;
}

#[derive(Clone)]
pub struct EntrezHttpClient {
    http: ResilientClient,
    base_url: String,
    api_key: Option<String>,
}

impl EntrezHttpClient {
    pub fn new(settings: &EntrezSettings, policy: RetryPolicy) -> Result<Self, KiraError> {
        let http = ResilientClient::new("entrez", policy, settings.timeout)?;
        Ok(Self::with_client(http, settings))
    }

    pub fn with_client(http: ResilientClient, settings: &EntrezSettings) -> Self {
        Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        }
    }

    fn url(&self, utility: &str) -> String {
        format!("{}/{utility}", self.base_url)
    }
}

impl EntrezClient for EntrezHttpClient {
    fn search(&self, db: &str, term: &str) -> Result<SessionHandle, KiraError> {
        let url = self.url("esearch.fcgi");
        let response = self.http.execute_ok(|client| {
            let mut request = client.get(&url).query(&[
                ("db", db),
                ("retmode", "json"),
                ("usehistory", "y"),
                ("term", term),
            ]);
            if let Some(key) = &self.api_key {
                request = request.query(&[("api_key", key.as_str())]);
            }
            request
        })?;
        let payload: Value = response
            .json()
            .map_err(|err| self.http.invalid(err.to_string()))?;
        parse_search_result(&payload).ok_or_else(|| {
            self.http
                .invalid("esearch response lacks querykey, webenv or count")
        })
    }

    fn summary_page(
        &self,
        db: &str,
        session: &SessionHandle,
        offset: usize,
        page_size: usize,
    ) -> Result<Value, KiraError> {
        let url = self.url("esummary.fcgi");
        let retstart = offset.to_string();
        let retmax = page_size.to_string();
        let response = self.http.execute_ok(|client| {
            let mut request = client
                .get(&url)
                // chunked gzip bodies from esummary truncate under load
                .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"))
                .query(&[
                    ("query_key", session.query_key.as_str()),
                    ("webenv", session.webenv.as_str()),
                    ("version", "2.0"),
                    ("retmode", "json"),
                    ("retstart", retstart.as_str()),
                    ("retmax", retmax.as_str()),
                    ("db", db),
                ]);
            if let Some(key) = &self.api_key {
                request = request.query(&[("api_key", key.as_str())]);
            }
            request
        })?;
        response
            .json()
            .map_err(|err| self.http.invalid(err.to_string()))
    }

    fn post_ids(&self, db: &str, ids: &[String]) -> Result<SessionHandle, KiraError> {
        let url = self.url("epost.fcgi");
        let joined = ids.join(",");
        let response = self.http.execute_ok(|client| {
            let mut form = vec![("db", db), ("id", joined.as_str())];
            if let Some(key) = &self.api_key {
                form.push(("api_key", key.as_str()));
            }
            client.post(&url).form(&form)
        })?;
        let body = response
            .text()
            .map_err(|err| self.http.invalid(err.to_string()))?;
        parse_post_result(&body, ids.len())
            .ok_or_else(|| self.http.invalid("epost response lacks QueryKey or WebEnv"))
    }
}

/// Adapts one database's summary endpoint to the paginator.
pub struct SummarySource<'a, E: EntrezClient + ?Sized> {
    client: &'a E,
    db: &'a str,
}

impl<'a, E: EntrezClient + ?Sized> SummarySource<'a, E> {
    pub fn new(client: &'a E, db: &'a str) -> Self {
        Self { client, db }
    }
}

impl<E: EntrezClient + ?Sized> PageSource for SummarySource<'_, E> {
    fn fetch_page(
        &self,
        session: &SessionHandle,
        offset: usize,
        page_size: usize,
    ) -> Result<Value, KiraError> {
        self.client.summary_page(self.db, session, offset, page_size)
    }
}

pub fn parse_search_result(payload: &Value) -> Option<SessionHandle> {
    let result = &payload["esearchresult"];
    let query_key = scalar(&result["querykey"])?;
    let webenv = scalar(&result["webenv"])?;
    let count = scalar(&result["count"])?.parse().ok()?;
    Some(SessionHandle {
        query_key,
        webenv,
        count,
    })
}

/// Reads the XML `ePostResult`; the number of posted ids stands in for the count.
pub fn parse_post_result(body: &str, posted: usize) -> Option<SessionHandle> {
    let query_key = xml_text(body, "QueryKey")?;
    let webenv = xml_text(body, "WebEnv")?;
    Some(SessionHandle {
        query_key,
        webenv,
        count: posted,
    })
}

/// Summary page → one record per document carrying every field in `fields`.
///
/// The `uids` pseudo-entry is skipped, as is any document missing a field.
pub fn parse_summaries(page: &Value, fields: &[&str]) -> Vec<Record> {
    let Some(result) = page["result"].as_object() else {
        return Vec::new();
    };
    let mut records = Vec::new();
    for (key, doc) in result {
        if key == "uids" {
            continue;
        }
        let values = fields
            .iter()
            .map(|field| scalar(&doc[*field]))
            .collect::<Option<Vec<_>>>();
        match values {
            Some(values) => records.push(Record::new(values)),
            None => tracing::debug!(uid = %key, "skipping summary without required fields"),
        }
    }
    records
}

fn scalar(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn xml_text(body: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"<{tag}>\s*([^<]+?)\s*</{tag}>");
    let re = Regex::new(&pattern).ok()?;
    re.captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_search_payload() {
        let payload = json!({
            "esearchresult": {"count": "120", "querykey": "1", "webenv": "MCID_abc"}
        });
        let session = parse_search_result(&payload).unwrap();
        assert_eq!(session.count, 120);
        assert_eq!(session.query_key, "1");
        assert_eq!(session.webenv, "MCID_abc");
    }

    #[test]
    fn parse_epost_xml() {
        let body = r#"<?xml version="1.0" encoding="UTF-8" ?>
<!DOCTYPE ePostResult PUBLIC "-//NLM//DTD epost 20090401//EN" "https://eutils.ncbi.nlm.nih.gov/eutils/dtd/20090401/epost.dtd">
<ePostResult>
	<QueryKey>1</QueryKey>
	<WebEnv>MCID_5cf</WebEnv>
</ePostResult>"#;
        let session = parse_post_result(body, 7).unwrap();
        assert_eq!(session.query_key, "1");
        assert_eq!(session.webenv, "MCID_5cf");
        assert_eq!(session.count, 7);
        assert!(parse_post_result("<ERROR>bad</ERROR>", 1).is_none());
    }

    #[test]
    fn summaries_skip_uid_list_and_incomplete_docs() {
        let page = json!({
            "result": {
                "uids": ["11", "12", "13"],
                "11": {"uid": "11", "taxid": 3702},
                "12": {"uid": "12"},
                "13": {"uid": "13", "taxid": 4081}
            }
        });
        let records = parse_summaries(&page, &["uid", "taxid"]);
        let lines: Vec<String> = records.iter().map(|r| r.to_string()).collect();
        assert_eq!(lines, vec!["11,3702", "13,4081"]);
    }
}
