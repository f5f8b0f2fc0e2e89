use std::sync::Arc;

use serde_json::Value;

use crate::aggregate::Aggregator;
use crate::archive::{for_each_occurrence, merge_archives};
use crate::classify::{ClassifyOptions, classify};
use crate::clock::{Clock, SystemClock};
use crate::config::{ClassifySettings, EntrezSettings, GbifSettings, ResolvedConfig};
use crate::domain::{SessionHandle, parse_pairs};
use crate::entrez::{
    EntrezClient, EntrezHttpClient, NUCCORE_DB, SummarySource, TAXONOMY_DB, parse_summaries,
};
use crate::error::KiraError;
use crate::gbif::{GbifClient, GbifHttpClient, chunk_keys};
use crate::join::join;
use crate::paginate::{Paginator, RateLimiter};
use crate::pipeline::{Pipeline, Stage, StageInputs};
use crate::poll::{JobSnapshot, PollSettings, poll_until_terminal};
use crate::raster::GridRaster;
use crate::store::{ArtifactStore, ArtifactWriter};

pub const SEARCH_NUCCORE: &str = "search_nuccore";
pub const NUCCORE_SUMMARIES: &str = "nuccore_summaries";
pub const UNIQUE_TAXIDS: &str = "unique_taxids";
pub const POST_TAXIDS: &str = "post_taxids";
pub const TAXONOMY_SUMMARIES: &str = "taxonomy_summaries";
pub const SPECIES_MATCH: &str = "species_match";
pub const UNIQUE_SPECIES_KEYS: &str = "unique_species_keys";
pub const REQUEST_DOWNLOADS: &str = "request_downloads";
pub const FETCH_DOIS: &str = "fetch_dois";
pub const DOWNLOAD_LINKS: &str = "download_links";
pub const DOWNLOAD_OCCURRENCES: &str = "download_occurrences";
pub const CLASSIFY_OCCURRENCES: &str = "classify_occurrences";
pub const AGGREGATE_CLASSIFICATIONS: &str = "aggregate_classifications";
pub const CLASSIFY_SEQUENCES: &str = "classify_sequences";

/// Sinks of the graph; running them runs everything.
pub const DEFAULT_TARGETS: [&str; 2] = [FETCH_DOIS, CLASSIFY_SEQUENCES];

pub fn default_targets() -> Vec<String> {
    DEFAULT_TARGETS.iter().map(|id| id.to_string()).collect()
}

/// The sequence → bioclimatic zone workflow, wired onto the pipeline engine.
pub struct Workflow<E, G> {
    entrez: E,
    gbif: G,
    entrez_settings: EntrezSettings,
    gbif_settings: GbifSettings,
    classify_settings: ClassifySettings,
    clock: Arc<dyn Clock>,
}

impl Workflow<EntrezHttpClient, GbifHttpClient> {
    pub fn from_config(config: &ResolvedConfig) -> Result<Self, KiraError> {
        let entrez = EntrezHttpClient::new(&config.entrez, config.retry.default.clone())?;
        let gbif = GbifHttpClient::new(
            &config.gbif,
            config.retry.default.clone(),
            config.retry.submission.clone(),
        )?;
        Ok(Self::new(config, entrez, gbif))
    }
}

impl<E, G> Workflow<E, G>
where
    E: EntrezClient + 'static,
    G: GbifClient + 'static,
{
    pub fn new(config: &ResolvedConfig, entrez: E, gbif: G) -> Self {
        Self {
            entrez,
            gbif,
            entrez_settings: config.entrez.clone(),
            gbif_settings: config.gbif.clone(),
            classify_settings: config.classify.clone(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used for request pacing and job polling.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn into_pipeline(self, store: ArtifactStore) -> Result<Pipeline, KiraError> {
        let workflow = Arc::new(self);
        let mut pipeline = Pipeline::new(store);
        let stages = [
            bind(&workflow, SEARCH_NUCCORE, "nuccore-esearch.json", Self::search_nuccore),
            bind(&workflow, NUCCORE_SUMMARIES, "nuccore-docsummaries.txt", Self::nuccore_summaries)
                .after(&[SEARCH_NUCCORE]),
            bind(&workflow, UNIQUE_TAXIDS, "unique-taxids.txt", Self::unique_taxids)
                .after(&[NUCCORE_SUMMARIES]),
            bind(&workflow, POST_TAXIDS, "taxonomy-epost.json", Self::post_taxids)
                .after(&[UNIQUE_TAXIDS]),
            bind(&workflow, TAXONOMY_SUMMARIES, "taxonomy-docsummaries.txt", Self::taxonomy_summaries)
                .after(&[POST_TAXIDS, UNIQUE_TAXIDS]),
            bind(&workflow, SPECIES_MATCH, "gbif-species-matches.txt", Self::species_match)
                .after(&[TAXONOMY_SUMMARIES]),
            bind(&workflow, UNIQUE_SPECIES_KEYS, "unique-species-keys.txt", Self::unique_species_keys)
                .after(&[SPECIES_MATCH]),
            bind(&workflow, REQUEST_DOWNLOADS, "download-ids.txt", Self::request_downloads)
                .after(&[UNIQUE_SPECIES_KEYS]),
            bind(&workflow, FETCH_DOIS, "dois.txt", Self::fetch_dois).after(&[REQUEST_DOWNLOADS]),
            bind(&workflow, DOWNLOAD_LINKS, "download-links.txt", Self::download_links)
                .after(&[REQUEST_DOWNLOADS]),
            bind(&workflow, DOWNLOAD_OCCURRENCES, "occurrences.zip", Self::download_occurrences)
                .after(&[DOWNLOAD_LINKS]),
            bind(&workflow, CLASSIFY_OCCURRENCES, "classifications.txt", Self::classify_occurrences)
                .after(&[DOWNLOAD_OCCURRENCES]),
            bind(
                &workflow,
                AGGREGATE_CLASSIFICATIONS,
                "agg-classifications.txt",
                Self::aggregate_classifications,
            )
            .after(&[CLASSIFY_OCCURRENCES]),
            bind(&workflow, CLASSIFY_SEQUENCES, "classified-sequences.txt", Self::classify_sequences)
                .after(&[NUCCORE_SUMMARIES, SPECIES_MATCH, AGGREGATE_CLASSIFICATIONS]),
        ];
        for stage in stages {
            pipeline.add_stage(stage)?;
        }
        pipeline.validate()?;
        Ok(pipeline)
    }

    fn search_nuccore(&self, _inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let session = self.entrez.search(NUCCORE_DB, &self.entrez_settings.term)?;
        tracing::info!(count = session.count, "nuccore search complete");
        out.write_json(&session)
    }

    fn nuccore_summaries(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let session: SessionHandle = inputs.json(SEARCH_NUCCORE)?;
        self.write_summaries(NUCCORE_DB, session, &["uid", "taxid"], out)
    }

    fn unique_taxids(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let pairs = parse_pairs(&inputs.lines(NUCCORE_SUMMARIES)?)?;
        write_unique(pairs.into_iter().map(|pair| pair.value), out)
    }

    fn post_taxids(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let ids = inputs.lines(UNIQUE_TAXIDS)?;
        let session = if ids.is_empty() {
            tracing::warn!("no taxonomy ids to post");
            SessionHandle {
                query_key: String::new(),
                webenv: String::new(),
                count: 0,
            }
        } else {
            self.entrez.post_ids(TAXONOMY_DB, &ids)?
        };
        out.write_json(&session)
    }

    fn taxonomy_summaries(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let mut session: SessionHandle = inputs.json(POST_TAXIDS)?;
        session.count = inputs.lines(UNIQUE_TAXIDS)?.len();
        self.write_summaries(TAXONOMY_DB, session, &["taxid", "scientificname"], out)
    }

    fn species_match(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let taxa = parse_pairs(&inputs.lines(TAXONOMY_SUMMARIES)?)?;
        let mut accepted = 0usize;
        for (idx, taxon) in taxa.iter().enumerate() {
            tracing::debug!(progress = %format!("{}/{}", idx + 1, taxa.len()), name = %taxon.value, "matching species");
            let Some(matched) = self.gbif.match_species(&taxon.value)? else {
                continue;
            };
            if let Some(key) = matched.accepted_key() {
                out.write_line(&format!("{},{key}", taxon.key))?;
                accepted += 1;
            }
        }
        tracing::info!(taxa = taxa.len(), accepted, "species matching complete");
        Ok(())
    }

    fn unique_species_keys(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let pairs = parse_pairs(&inputs.lines(SPECIES_MATCH)?)?;
        write_unique(pairs.into_iter().map(|pair| pair.value), out)
    }

    fn request_downloads(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let keys = inputs.lines(UNIQUE_SPECIES_KEYS)?;
        let chunks = chunk_keys(&keys, self.gbif_settings.chunk_size);
        for (idx, chunk) in chunks.iter().enumerate() {
            let job_id = self.gbif.submit_download(chunk)?;
            tracing::info!(job_id = %job_id, keys = chunk.len(), progress = %format!("{}/{}", idx + 1, chunks.len()), "download requested");
            out.write_line(&job_id)?;
        }
        Ok(())
    }

    fn fetch_dois(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        for job_id in inputs.lines(REQUEST_DOWNLOADS)? {
            match self.gbif.download_status(&job_id)?.doi {
                Some(doi) => out.write_line(&doi)?,
                None => tracing::warn!(job_id = %job_id, "download has no DOI yet"),
            }
        }
        Ok(())
    }

    fn download_links(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let settings = PollSettings {
            interval: self.gbif_settings.poll_interval,
            max_attempts: self.gbif_settings.poll_max_attempts,
        };
        let mut failed = Vec::new();
        for job_id in inputs.lines(REQUEST_DOWNLOADS)? {
            let status_fn = |id: &str| {
                self.gbif.download_status(id).map(|status| JobSnapshot {
                    status: status.status,
                    link: status.download_link,
                })
            };
            match poll_until_terminal(&job_id, status_fn, settings, self.clock.as_ref()) {
                Ok(link) => out.write_line(&link)?,
                Err(KiraError::JobFailed { job_id, status }) => {
                    tracing::warn!(job_id = %job_id, status = %status, "download job failed");
                    failed.push((job_id, status));
                }
                Err(err) => return Err(err),
            }
        }
        if failed.is_empty() {
            return Ok(());
        }
        if self.gbif_settings.tolerate_failed_jobs {
            tracing::warn!(failed = failed.len(), "continuing without failed download jobs");
            return Ok(());
        }
        Err(KiraError::JobsFailed(failed))
    }

    fn download_occurrences(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let links = inputs.lines(DOWNLOAD_LINKS)?;
        let (_, summary) = merge_archives(&links, |link| self.gbif.fetch_archive(link), out)?;
        tracing::info!(
            archives = summary.archives,
            bytes = summary.bytes_downloaded,
            "occurrence archives merged"
        );
        Ok(())
    }

    fn classify_occurrences(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let raster = GridRaster::open(&self.classify_settings.raster_path)?;
        let (rows, cols) = raster.shape();
        tracing::debug!(path = %self.classify_settings.raster_path, rows, cols, "raster loaded");
        let options = ClassifyOptions::from(&self.classify_settings);
        let mut kept = 0usize;
        let summary = for_each_occurrence(
            inputs.open(DOWNLOAD_OCCURRENCES)?,
            &self.classify_settings.columns,
            |occurrence| {
                if occurrence.species_key.trim().is_empty() {
                    return Ok(());
                }
                let zone = classify(
                    occurrence.coordinate_uncertainty,
                    occurrence.longitude,
                    occurrence.latitude,
                    &raster,
                    &options,
                );
                if let Some(zone) = zone {
                    out.write_line(&format!("{},{zone}", occurrence.species_key.trim()))?;
                    kept += 1;
                }
                Ok(())
            },
        )?;
        tracing::info!(
            entries = summary.entries,
            rows = summary.rows,
            short_rows = summary.short_rows,
            classified = kept,
            "occurrences classified"
        );
        Ok(())
    }

    fn aggregate_classifications(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let mut aggregator = Aggregator::default();
        inputs.for_each_line(CLASSIFY_OCCURRENCES, |line| {
            aggregator.add(line.parse()?);
            Ok(())
        })?;
        let zones = aggregator.finish();
        tracing::info!(species = zones.len(), "classifications aggregated");
        for pair in zones {
            out.write_line(&pair.to_string())?;
        }
        Ok(())
    }

    fn classify_sequences(&self, inputs: &StageInputs<'_>, out: &mut ArtifactWriter) -> Result<(), KiraError> {
        let sequences = parse_pairs(&inputs.lines(NUCCORE_SUMMARIES)?)?;
        let species = parse_pairs(&inputs.lines(SPECIES_MATCH)?)?;
        let zones = parse_pairs(&inputs.lines(AGGREGATE_CLASSIFICATIONS)?)?;
        let rows = join(&sequences, &species, &zones);
        tracing::info!(sequences = sequences.len(), classified = rows.len(), "sequences classified");
        for row in rows {
            out.write_line(&row.to_string())?;
        }
        Ok(())
    }

    fn write_summaries(
        &self,
        db: &str,
        session: SessionHandle,
        fields: &[&str],
        out: &mut ArtifactWriter,
    ) -> Result<(), KiraError> {
        let source = SummarySource::new(&self.entrez, db);
        let limiter = RateLimiter::per_second(self.entrez_settings.requests_per_second, self.clock.clone());
        let total = session.count;
        let mut pages = Paginator::new(
            &source,
            session,
            self.entrez_settings.page_size,
            limiter,
            |page: &Value| parse_summaries(page, fields),
        );
        let mut written = 0usize;
        let mut reported = 0usize;
        while let Some(record) = pages.next() {
            out.write_line(&record?.to_string())?;
            written += 1;
            if pages.requests() != reported {
                reported = pages.requests();
                tracing::info!(db, progress = %format!("{:.0}%", pages.progress() * 100.0), "summary page fetched");
            }
        }
        tracing::info!(db, total, written, requests = pages.requests(), "summaries fetched");
        Ok(())
    }
}

fn bind<E, G, F>(workflow: &Arc<Workflow<E, G>>, id: &str, artifact: &str, body: F) -> Stage
where
    E: 'static,
    G: 'static,
    F: Fn(&Workflow<E, G>, &StageInputs<'_>, &mut ArtifactWriter) -> Result<(), KiraError> + 'static,
{
    let workflow = Arc::clone(workflow);
    Stage::new(id, artifact, move |inputs, out| body(&workflow, inputs, out))
}

/// Sorted, de-duplicated values, one per line.
fn write_unique<I>(values: I, out: &mut ArtifactWriter) -> Result<(), KiraError>
where
    I: IntoIterator<Item = String>,
{
    let unique: std::collections::BTreeSet<String> = values.into_iter().collect();
    for value in &unique {
        out.write_line(value)?;
    }
    tracing::info!(unique = unique.len(), "values de-duplicated");
    Ok(())
}
