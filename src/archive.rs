use std::collections::HashSet;
use std::io::{self, BufRead, BufReader, Cursor, Read, Seek, Write};

use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::KiraError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub archives: usize,
    pub entries: Vec<String>,
    pub bytes_downloaded: u64,
}

/// Streams each downloaded single-entry archive into `output`.
///
/// Only one source archive is held in memory at a time. Any failed download
/// aborts the merge; the caller discards `output` in that case.
pub fn merge_archives<W, F>(
    links: &[String],
    mut fetch: F,
    output: W,
) -> Result<(W, MergeSummary), KiraError>
where
    W: Write + Seek,
    F: FnMut(&str) -> Result<Vec<u8>, KiraError>,
{
    let mut writer = ZipWriter::new(output);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);
    let mut summary = MergeSummary::default();
    let mut used = HashSet::new();

    for (idx, link) in links.iter().enumerate() {
        tracing::info!(link = %link, progress = %format!("{}/{}", idx + 1, links.len()), "downloading archive");
        let bytes = fetch(link)?;
        summary.bytes_downloaded += bytes.len() as u64;
        let mut source = ZipArchive::new(Cursor::new(bytes))
            .map_err(|err| KiraError::Archive(format!("{link}: {err}")))?;
        if source.is_empty() {
            return Err(KiraError::Archive(format!("{link}: archive has no entries")));
        }
        let mut entry = source
            .by_index(0)
            .map_err(|err| KiraError::Archive(format!("{link}: {err}")))?;
        let mut name = entry.name().to_string();
        if !used.insert(name.clone()) {
            name = format!("{idx}-{name}");
            used.insert(name.clone());
        }
        writer
            .start_file(name.as_str(), options)
            .map_err(|err| KiraError::Archive(err.to_string()))?;
        io::copy(&mut entry, &mut writer).map_err(|err| KiraError::Archive(err.to_string()))?;
        summary.entries.push(name);
        summary.archives += 1;
    }

    let output = writer
        .finish()
        .map_err(|err| KiraError::Archive(err.to_string()))?;
    Ok((output, summary))
}

/// Positional offsets into the tab-delimited occurrence export.
///
/// These are tied to the provider's column order; the header check in
/// [`for_each_occurrence`] only warns when the names drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccurrenceColumns {
    pub latitude: usize,
    pub longitude: usize,
    pub coordinate_uncertainty: usize,
    pub species_key: usize,
}

impl Default for OccurrenceColumns {
    fn default() -> Self {
        Self {
            latitude: 16,
            longitude: 17,
            coordinate_uncertainty: 18,
            species_key: 29,
        }
    }
}

impl OccurrenceColumns {
    fn max_index(&self) -> usize {
        self.latitude
            .max(self.longitude)
            .max(self.coordinate_uncertainty)
            .max(self.species_key)
    }

    /// Expected header names that differ from the actual header, as `(index, expected, found)`.
    pub fn header_drift(&self, header: &[&str]) -> Vec<(usize, &'static str, String)> {
        [
            (self.latitude, "decimalLatitude"),
            (self.longitude, "decimalLongitude"),
            (self.coordinate_uncertainty, "coordinateUncertaintyInMeters"),
            (self.species_key, "speciesKey"),
        ]
        .into_iter()
        .filter_map(|(idx, expected)| {
            let found = header.get(idx).map(|name| name.trim()).unwrap_or("");
            (found != expected).then(|| (idx, expected, found.to_string()))
        })
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence<'a> {
    pub species_key: &'a str,
    pub latitude: &'a str,
    pub longitude: &'a str,
    pub coordinate_uncertainty: &'a str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub entries: usize,
    pub rows: usize,
    pub short_rows: usize,
}

/// Calls `visit` for every data row of every entry in a consolidated archive.
/// Each entry's first line is its header. Rows too short to hold every column are skipped.
pub fn for_each_occurrence<R, F>(
    archive: R,
    columns: &OccurrenceColumns,
    mut visit: F,
) -> Result<ScanSummary, KiraError>
where
    R: Read + Seek,
    F: FnMut(Occurrence<'_>) -> Result<(), KiraError>,
{
    let mut archive =
        ZipArchive::new(archive).map_err(|err| KiraError::Archive(err.to_string()))?;
    let mut summary = ScanSummary::default();
    let required = columns.max_index();
    let total = archive.len();

    for idx in 0..total {
        let entry = archive
            .by_index(idx)
            .map_err(|err| KiraError::Archive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        tracing::info!(entry = %name, progress = %format!("{}/{total}", idx + 1), "classifying entry");
        summary.entries += 1;

        let mut reader = BufReader::new(entry);
        let mut buf = Vec::new();
        let mut header_seen = false;
        loop {
            buf.clear();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|err| KiraError::Archive(format!("{name}: {err}")))?;
            if read == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            let fields: Vec<&str> = line.split('\t').collect();
            if !header_seen {
                header_seen = true;
                for (col, expected, found) in columns.header_drift(&fields) {
                    tracing::warn!(entry = %name, column = col, expected, found = %found, "occurrence header drift");
                }
                continue;
            }
            if line.is_empty() {
                continue;
            }
            if fields.len() <= required {
                summary.short_rows += 1;
                continue;
            }
            summary.rows += 1;
            visit(Occurrence {
                species_key: fields[columns.species_key],
                latitude: fields[columns.latitude],
                longitude: fields[columns.longitude],
                coordinate_uncertainty: fields[columns.coordinate_uncertainty],
            })?;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_entry_zip(name: &str, content: &str) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn merge_keeps_entry_names() {
        let links = vec!["a".to_string(), "b".to_string()];
        let (output, summary) = merge_archives(
            &links,
            |link| Ok(single_entry_zip(&format!("{link}.csv"), "h\nrow\n")),
            Cursor::new(Vec::new()),
        )
        .unwrap();
        assert_eq!(summary.entries, vec!["a.csv", "b.csv"]);

        let mut merged = ZipArchive::new(Cursor::new(output.into_inner())).unwrap();
        assert_eq!(merged.len(), 2);
        let mut text = String::new();
        merged.by_name("b.csv").unwrap().read_to_string(&mut text).unwrap();
        assert_eq!(text, "h\nrow\n");
    }

    #[test]
    fn merge_fails_on_download_error() {
        let links = vec!["a".to_string(), "b".to_string()];
        let result = merge_archives(
            &links,
            |link| {
                if link == "b" {
                    Err(KiraError::RemoteUnavailable {
                        service: "gbif".to_string(),
                        attempts: 10,
                        reason: "timeout".to_string(),
                    })
                } else {
                    Ok(single_entry_zip("a.csv", "h\n"))
                }
            },
            Cursor::new(Vec::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn scan_skips_header_and_short_rows() {
        let columns = OccurrenceColumns {
            latitude: 0,
            longitude: 1,
            coordinate_uncertainty: 2,
            species_key: 3,
        };
        let content = "decimalLatitude\tdecimalLongitude\tcoordinateUncertaintyInMeters\tspeciesKey\n\
                       10.5\t20.5\t100\t42\n\
                       short\trow\n";
        let zip = single_entry_zip("0001.csv", content);
        let mut seen = Vec::new();
        let summary = for_each_occurrence(Cursor::new(zip), &columns, |occ| {
            seen.push((occ.species_key.to_string(), occ.latitude.to_string()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![("42".to_string(), "10.5".to_string())]);
        assert_eq!(summary.rows, 1);
        assert_eq!(summary.short_rows, 1);
    }

    #[test]
    fn header_drift_reports_mismatches() {
        let columns = OccurrenceColumns {
            latitude: 0,
            longitude: 1,
            coordinate_uncertainty: 2,
            species_key: 3,
        };
        let drift = columns.header_drift(&["decimalLongitude", "decimalLatitude", "coordinateUncertaintyInMeters", "speciesKey"]);
        assert_eq!(drift.len(), 2);
        assert_eq!(drift[0].1, "decimalLatitude");
    }
}
