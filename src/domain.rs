use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Server-side history handle for a search or bulk post.
///
/// Only valid for the remote retention window; expiry surfaces as an ordinary
/// HTTP failure on the next fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub query_key: String,
    pub webenv: String,
    pub count: usize,
}

/// One flat row of named-by-position fields, persisted as a comma-joined line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record(Vec<String>);

impl Record {
    pub fn new(fields: Vec<String>) -> Self {
        Self(fields)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// A `key,value` artifact line. The value keeps any further commas, which
/// scientific names can contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl FromStr for KeyValue {
    type Err = KiraError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (key, value) = line
            .split_once(',')
            .ok_or_else(|| KiraError::ArtifactFormat(line.to_string()))?;
        Ok(Self {
            key: key.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.key, self.value)
    }
}

/// Parses every line of a two-column artifact.
pub fn parse_pairs(lines: &[String]) -> Result<Vec<KeyValue>, KiraError> {
    lines.iter().map(|line| line.parse()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeciesMatch {
    #[serde(rename = "matchType")]
    pub match_type: String,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(rename = "speciesKey", default)]
    pub species_key: Option<u64>,
}

pub const ACCEPTED_RANKS: [&str; 8] = [
    "SPECIES",
    "SUBSPECIES",
    "VARIETY",
    "SUBVARIETY",
    "FORM",
    "SUBFORM",
    "CULTIVAR_GROUP",
    "CULTIVAR",
];

impl SpeciesMatch {
    /// Species key when the match is usable: some match, and a species or infraspecific rank.
    pub fn accepted_key(&self) -> Option<u64> {
        if self.match_type == "NONE" {
            return None;
        }
        let rank = self.rank.as_deref()?;
        if !ACCEPTED_RANKS.contains(&rank) {
            return None;
        }
        self.species_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_keeps_commas_in_value() {
        let pair: KeyValue = "3702,Arabidopsis thaliana, Col-0".parse().unwrap();
        assert_eq!(pair.key, "3702");
        assert_eq!(pair.value, "Arabidopsis thaliana, Col-0");
        assert_eq!(pair.to_string(), "3702,Arabidopsis thaliana, Col-0");
    }

    #[test]
    fn key_value_requires_separator() {
        assert!(matches!(
            "3702".parse::<KeyValue>(),
            Err(KiraError::ArtifactFormat(line)) if line == "3702"
        ));
    }

    #[test]
    fn species_match_filters_rank_and_match_type() {
        let exact = SpeciesMatch {
            match_type: "EXACT".to_string(),
            rank: Some("VARIETY".to_string()),
            species_key: Some(5),
        };
        assert_eq!(exact.accepted_key(), Some(5));

        let genus = SpeciesMatch {
            rank: Some("GENUS".to_string()),
            ..exact.clone()
        };
        assert_eq!(genus.accepted_key(), None);

        let none = SpeciesMatch {
            match_type: "NONE".to_string(),
            ..exact
        };
        assert_eq!(none.accepted_key(), None);
    }

    #[test]
    fn record_displays_as_csv_line() {
        let record = Record::new(vec!["1".to_string(), "2".to_string()]);
        assert_eq!(record.to_string(), "1,2");
    }
}
