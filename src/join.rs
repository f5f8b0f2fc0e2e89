use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::domain::KeyValue;

/// One row of the final sequence → zone mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinedRow {
    pub uid: String,
    pub taxid: String,
    pub species_key: String,
    pub zone: String,
}

impl fmt::Display for JoinedRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.uid, self.taxid, self.species_key, self.zone
        )
    }
}

/// Inner-joins sequences (uid → taxid) onto species matches (taxid → species key)
/// and then onto aggregated zones (species key → zone).
///
/// Rows without a match at either step are dropped. Output follows the order of
/// `sequences`, then the order of `species` for a taxid with several matches.
pub fn join(sequences: &[KeyValue], species: &[KeyValue], zones: &[KeyValue]) -> Vec<JoinedRow> {
    let mut by_taxid: HashMap<&str, Vec<&str>> = HashMap::new();
    for pair in species {
        by_taxid
            .entry(pair.key.as_str())
            .or_default()
            .push(pair.value.as_str());
    }
    let zone_of: HashMap<&str, &str> = zones
        .iter()
        .map(|pair| (pair.key.as_str(), pair.value.as_str()))
        .collect();

    let mut rows = Vec::new();
    for sequence in sequences {
        let Some(species_keys) = by_taxid.get(sequence.value.as_str()) else {
            continue;
        };
        for species_key in species_keys {
            if let Some(zone) = zone_of.get(species_key) {
                rows.push(JoinedRow {
                    uid: sequence.key.clone(),
                    taxid: sequence.value.clone(),
                    species_key: species_key.to_string(),
                    zone: zone.to_string(),
                });
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(raw: &[(&str, &str)]) -> Vec<KeyValue> {
        raw.iter()
            .map(|(key, value)| KeyValue {
                key: key.to_string(),
                value: value.to_string(),
            })
            .collect()
    }

    #[test]
    fn joins_through_both_tables() {
        let rows = join(
            &table(&[("U1", "T1")]),
            &table(&[("T1", "S1")]),
            &table(&[("S1", "2")]),
        );
        assert_eq!(
            rows,
            vec![JoinedRow {
                uid: "U1".to_string(),
                taxid: "T1".to_string(),
                species_key: "S1".to_string(),
                zone: "2".to_string(),
            }]
        );
        assert_eq!(rows[0].to_string(), "U1,T1,S1,2");
    }

    #[test]
    fn drops_rows_without_a_full_path() {
        let rows = join(
            &table(&[("U1", "T1"), ("U2", "T2"), ("U3", "T3")]),
            &table(&[("T1", "S1"), ("T2", "S2")]),
            &table(&[("S1", "4")]),
        );
        let uids: Vec<&str> = rows.iter().map(|row| row.uid.as_str()).collect();
        assert_eq!(uids, vec!["U1"]);
    }

    #[test]
    fn fans_out_on_repeated_taxid() {
        let rows = join(
            &table(&[("U1", "T1"), ("U2", "T1")]),
            &table(&[("T1", "S1"), ("T1", "S2")]),
            &table(&[("S1", "4"), ("S2", "5")]),
        );
        let lines: Vec<String> = rows.iter().map(ToString::to_string).collect();
        assert_eq!(
            lines,
            vec!["U1,T1,S1,4", "U1,T1,S2,5", "U2,T1,S1,4", "U2,T1,S2,5"]
        );
    }
}
