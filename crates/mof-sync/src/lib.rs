//! Dataset loader orchestration: year × source batches into the store, one
//! audited ingestion run per invocation.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::{Datelike, Utc};
use mof_core::{IngestionRun, LoadMode, RunOutcome, RunSummary};
use mof_datasets::{ColumnMap, Dataset, DatasetRegistry, MappedRow, Normalizer, PurgePolicy, SchemaError, SourceSpec};
use mof_storage::{
    decode_envelope, encode_envelope, Batch, Purge, QueryClient, QueryClientConfig, Record, RecordTable,
    ReqwestTransport, ResponseArchive, RetryPolicy, ServiceError, Store, StoreError, Transport,
};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mof-sync";

/// First calendar year covered by a full load unless overridden.
pub const DEFAULT_FULL_START_YEAR: i32 = 2000;

/// Rows per `datastore_search` page when a year's SQL query fails.
pub const FALLBACK_PAGE_SIZE: u32 = 32_000;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub courtesy_delay: Duration,
    pub courtesy_jitter: Duration,
    pub backoff_base_ms: u64,
    pub full_start_year: i32,
    /// Raw responses are archived only when set.
    pub artifacts_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = QueryClientConfig::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://mof.db".to_string()),
            api_base: std::env::var("MOF_API_BASE").unwrap_or(defaults.base_url),
            user_agent: std::env::var("MOF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("MOF_HTTP_TIMEOUT_SECS", defaults.timeout.as_secs()),
            courtesy_delay: Duration::try_from_secs_f64(env_parse(
                "MOF_COURTESY_DELAY_SECS",
                defaults.courtesy_delay.as_secs_f64(),
            ))
            .unwrap_or(defaults.courtesy_delay),
            courtesy_jitter: Duration::from_millis(env_parse(
                "MOF_COURTESY_JITTER_MS",
                defaults.courtesy_jitter.as_millis() as u64,
            )),
            backoff_base_ms: env_parse("MOF_BACKOFF_BASE_MS", defaults.retry.base_delay.as_millis() as u64),
            full_start_year: env_parse("MOF_FULL_START_YEAR", DEFAULT_FULL_START_YEAR),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            workspace_root: std::env::var("MOF_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn client_config(&self) -> QueryClientConfig {
        let defaults = QueryClientConfig::default();
        QueryClientConfig {
            base_url: self.api_base.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            courtesy_delay: self.courtesy_delay,
            courtesy_jitter: self.courtesy_jitter,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.backoff_base_ms),
                ..defaults.retry
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("{sql}; datastore_search fallback: {fallback}")]
    Fallback { sql: ServiceError, fallback: ServiceError },
    #[error("archive: {0:#}")]
    Archive(anyhow::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchStage {
    Fetch,
    Map,
    Write,
    Purge,
}

impl BatchStage {
    fn as_str(&self) -> &'static str {
        match self {
            BatchStage::Fetch => "fetch",
            BatchStage::Map => "map",
            BatchStage::Write => "write",
            BatchStage::Purge => "purge",
        }
    }
}

/// Where a run's rows come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Upstream,
    /// The newest archived body per source and year; nothing is fetched.
    Archive,
}

impl Origin {
    fn mode_label(&self, mode: LoadMode) -> String {
        match self {
            Origin::Upstream => mode.as_str().to_string(),
            Origin::Archive => format!("{}-replay", mode.as_str()),
        }
    }
}

/// Rows for one batch, and whether they cover the batch's whole year.
struct BatchRows {
    records: Vec<Record>,
    attempts: u32,
    complete: bool,
}

/// Loads declared datasets through a query client into the store.
///
/// Two loads of the same dataset must not run at once; nothing here guards
/// against it.
pub struct Loader<T = ReqwestTransport> {
    store: Store,
    client: QueryClient<T>,
    registry: DatasetRegistry,
    normalizer: Normalizer,
    archive: Option<ResponseArchive>,
    full_start_year: i32,
    current_year: Option<i32>,
}

impl Loader<ReqwestTransport> {
    /// Production wiring: SQLite store, reqwest transport, registry and alias
    /// overrides from the workspace root.
    pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let store = Store::connect(&config.database_url)
            .await
            .with_context(|| format!("opening store {}", config.database_url))?;
        let client = QueryClient::from_config(&config.client_config())?;
        let registry = DatasetRegistry::from_workspace_root(&config.workspace_root)?;
        let normalizer = Normalizer::from_workspace_root(&config.workspace_root)?;
        let mut loader = Self::new(store, client, registry, normalizer).with_full_start_year(config.full_start_year);
        if let Some(dir) = &config.artifacts_dir {
            loader = loader.with_archive(ResponseArchive::new(dir.clone()));
        }
        Ok(loader)
    }
}

impl<T: Transport> Loader<T> {
    pub fn new(store: Store, client: QueryClient<T>, registry: DatasetRegistry, normalizer: Normalizer) -> Self {
        Self {
            store,
            client,
            registry,
            normalizer,
            archive: None,
            full_start_year: DEFAULT_FULL_START_YEAR,
            current_year: None,
        }
    }

    pub fn with_archive(mut self, archive: ResponseArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_full_start_year(mut self, year: i32) -> Self {
        self.full_start_year = year;
        self
    }

    /// Pins "this year" for incremental and full modes.
    pub fn with_current_year(mut self, year: i32) -> Self {
        self.current_year = Some(year);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    fn current_year(&self) -> i32 {
        self.current_year.unwrap_or_else(|| Utc::now().year())
    }

    /// Runs one load. Batch failures end the run and come back inside the
    /// summary; `Err` means the run record itself could not be written.
    pub async fn load(&self, dataset_name: &str, mode: LoadMode) -> Result<RunSummary, LoadError> {
        self.run(dataset_name, mode, Origin::Upstream).await
    }

    /// Rebuilds a dataset from archived responses without touching upstream.
    /// Years with nothing archived are skipped, and a full replay then leaves
    /// existing rows in place.
    pub async fn replay(&self, dataset_name: &str, mode: LoadMode) -> Result<RunSummary, LoadError> {
        if self.archive.is_none() {
            return Err(LoadError::Config("replay needs an archive directory (ARTIFACTS_DIR)".to_string()));
        }
        self.run(dataset_name, mode, Origin::Archive).await
    }

    async fn run(&self, dataset_name: &str, mode: LoadMode, origin: Origin) -> Result<RunSummary, LoadError> {
        let dataset = self
            .registry
            .get(dataset_name)
            .ok_or_else(|| LoadError::Config(format!("unknown dataset {dataset_name}")))?;
        if dataset.sources.is_empty() {
            return Err(LoadError::Config(format!("dataset {dataset_name} declares no sources")));
        }

        let years = mode.years(self.current_year(), self.full_start_year);
        let run = self.store.begin_run_labelled(&dataset.name, &origin.mode_label(mode)).await?;
        info!(run_id = %run.run_id, dataset = %dataset.name, mode = mode.as_str(), ?origin, ?years, "load started");

        let mut rows_loaded = 0u64;
        let mut batches = 0usize;
        let mut complete = true;
        let mut outcome = RunOutcome::Succeeded;

        'years: for &year in &years {
            for source in &dataset.sources {
                let span = info_span!("ingest_batch", run_id = %run.run_id, source = %source.key, year);
                match self.load_batch(source, year, run.run_id, origin).instrument(span).await {
                    Ok((rows, covered)) => {
                        rows_loaded += rows;
                        batches += 1;
                        complete &= covered;
                        self.store.record_progress(run.run_id, rows_loaded).await?;
                    }
                    Err((stage, err)) => {
                        let step = format!("{}: {}", step_label(dataset, source, year), stage.as_str());
                        warn!(run_id = %run.run_id, %step, error = %err, "load aborted");
                        outcome = RunOutcome::Failed {
                            step,
                            error: err.to_string(),
                        };
                        break 'years;
                    }
                }
            }
        }

        if mode == LoadMode::Full && matches!(outcome, RunOutcome::Succeeded) {
            if complete {
                if let Some(failed) = self.purge_stale(dataset, run.run_id).await {
                    outcome = failed;
                }
            } else {
                warn!(run_id = %run.run_id, "years missing from the archive; stale rows kept");
            }
        }

        let finished_at = self.store.finish_run(run.run_id, rows_loaded, &outcome).await?;
        info!(run_id = %run.run_id, rows_loaded, batches, succeeded = matches!(outcome, RunOutcome::Succeeded), "load finished");
        Ok(RunSummary {
            run_id: run.run_id,
            dataset: dataset.name.clone(),
            mode,
            rows_loaded,
            batches,
            started_at: run.started_at,
            finished_at,
            outcome,
        })
    }

    /// Drops rows a successful full run did not rewrite, per purging source.
    /// Returns the failed outcome if a delete fails.
    async fn purge_stale(&self, dataset: &Dataset, run_id: Uuid) -> Option<RunOutcome> {
        for source in dataset.sources.iter().filter(|s| s.purge == PurgePolicy::BlockOnFull) {
            match self.store.purge_stale(purge_for(source), run_id).await {
                Ok(purged) => info!(%run_id, source = %source.key, purged, "stale rows purged"),
                Err(err) => {
                    let step = format!("{}/{}: {}", dataset.name, source.key, BatchStage::Purge.as_str());
                    warn!(%run_id, %step, error = %err, "stale purge failed");
                    return Some(RunOutcome::Failed {
                        step,
                        error: err.to_string(),
                    });
                }
            }
        }
        None
    }

    /// Loads every declared dataset in registry order, stopping at the first
    /// run that fails.
    pub async fn load_all(&self, mode: LoadMode) -> Result<Vec<RunSummary>, LoadError> {
        self.run_all(mode, Origin::Upstream).await
    }

    pub async fn replay_all(&self, mode: LoadMode) -> Result<Vec<RunSummary>, LoadError> {
        if self.archive.is_none() {
            return Err(LoadError::Config("replay needs an archive directory (ARTIFACTS_DIR)".to_string()));
        }
        self.run_all(mode, Origin::Archive).await
    }

    async fn run_all(&self, mode: LoadMode, origin: Origin) -> Result<Vec<RunSummary>, LoadError> {
        let mut summaries = Vec::new();
        for dataset in &self.registry.datasets {
            let summary = self.run(&dataset.name, mode, origin).await?;
            let failed = !summary.succeeded();
            summaries.push(summary);
            if failed {
                break;
            }
        }
        Ok(summaries)
    }

    async fn load_batch(
        &self,
        source: &SourceSpec,
        year: i32,
        run_id: Uuid,
        origin: Origin,
    ) -> Result<(u64, bool), (BatchStage, LoadError)> {
        let rows = match origin {
            Origin::Upstream => self.fetch_year(source, year).await,
            Origin::Archive => self.archived_year(source, year).await,
        }
        .map_err(|e| (BatchStage::Fetch, e))?;

        let mut batch = Batch {
            run_id: Some(run_id),
            ..Batch::default()
        };
        for record in &rows.records {
            match source
                .map_row(record, &self.normalizer)
                .map_err(|e| (BatchStage::Map, LoadError::from(e)))?
            {
                MappedRow::Permit(permit) => batch.permits.push(permit),
                MappedRow::Contract(contract) => batch.contracts.push(contract),
            }
        }

        let written = self
            .store
            .write_batch(&batch)
            .await
            .map_err(|e| (BatchStage::Write, LoadError::from(e)))?;
        info!(rows = written.upserted, attempts = rows.attempts, "batch committed");
        Ok((written.upserted, rows.complete))
    }

    /// One year from upstream: the SQL slice, or the paged resource filtered
    /// to the year when the source allows it. The body is archived either way.
    async fn fetch_year(&self, source: &SourceSpec, year: i32) -> Result<BatchRows, LoadError> {
        let sql = source.year_query(year);
        let policy = self.client.retry_policy().with_max_attempts(source.max_attempts);
        let (records, body, attempts) = match self.client.fetch(&sql, &policy).await {
            Ok(fetched) => (fetched.records, fetched.body, fetched.attempts),
            Err(err) if source.paginated_fallback => {
                warn!(error = %err, "sql query failed; paging datastore_search");
                let paged = self
                    .client
                    .fetch_all_pages(&source.resource_id, FALLBACK_PAGE_SIZE, &policy)
                    .await
                    .map_err(|fallback| LoadError::Fallback { sql: err, fallback })?;
                let scanned = paged.records.len();
                let records: Vec<Record> = paged.records.into_iter().filter(|r| source.row_in_year(r, year)).collect();
                info!(pages = paged.pages, scanned, kept = records.len(), "datastore_search fallback");
                let body = encode_envelope(&records);
                (records, body, paged.attempts)
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(archive) = &self.archive {
            if let Err(err) = archive.archive(&source.key, year, &body).await {
                warn!(error = %err, "raw response not archived");
            }
        }
        Ok(BatchRows {
            records,
            attempts,
            complete: true,
        })
    }

    async fn archived_year(&self, source: &SourceSpec, year: i32) -> Result<BatchRows, LoadError> {
        let archive = self
            .archive
            .as_ref()
            .ok_or_else(|| LoadError::Config("no archive directory configured".to_string()))?;
        match archive.latest(&source.key, year).await.map_err(LoadError::Archive)? {
            Some(body) => Ok(BatchRows {
                records: decode_envelope(&body)?,
                attempts: 0,
                complete: true,
            }),
            None => {
                warn!("nothing archived; batch skipped");
                Ok(BatchRows {
                    records: Vec::new(),
                    attempts: 0,
                    complete: false,
                })
            }
        }
    }
}

fn purge_for(source: &SourceSpec) -> Purge {
    let (start, end) = source.id_block();
    let table = match source.columns {
        ColumnMap::Permit(_) => RecordTable::Permits,
        ColumnMap::Contract(_) => RecordTable::Contracts,
    };
    Purge { table, start, end }
}

fn step_label(dataset: &Dataset, source: &SourceSpec, year: i32) -> String {
    if source.key == dataset.name {
        format!("{}/{year}", dataset.name)
    } else {
        format!("{}/{}/{year}", dataset.name, source.key)
    }
}

/// Markdown table of ingestion runs, newest first as given.
pub fn runs_report_markdown(runs: &[IngestionRun]) -> String {
    let mut out = String::from("# MOF ingestion runs\n\n");
    if runs.is_empty() {
        out.push_str("No runs recorded.\n");
        return out;
    }
    out.push_str("| run | dataset | mode | status | rows | started | finished | failed step |\n");
    out.push_str("|---|---|---|---|---|---|---|---|\n");
    for run in runs {
        out.push_str(&format!(
            "| `{}` | {} | {} | {} | {} | {} | {} | {} |\n",
            run.run_id,
            run.dataset,
            run.mode,
            run.status.as_str(),
            run.rows_loaded,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.finished_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            run.failed_step.as_deref().unwrap_or("-"),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mof_core::RunStatus;
    use mof_storage::{StatusCode, TransportError, TransportResponse};
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers SQL by resource id and year; anything unscripted is an empty
    /// page. `datastore_search` serves whole resources registered with
    /// `resource`, and 404s for the rest.
    struct FixtureTransport {
        pages: Vec<(String, i32, TransportResponse)>,
        resources: Vec<(String, Vec<serde_json::Value>)>,
        seen: Mutex<Vec<String>>,
    }

    impl FixtureTransport {
        fn new() -> Self {
            Self {
                pages: Vec::new(),
                resources: Vec::new(),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn resource(mut self, resource: &str, records: Vec<serde_json::Value>) -> Self {
            self.resources.push((resource.to_string(), records));
            self
        }

        fn page(mut self, resource: &str, year: i32, records: serde_json::Value) -> Self {
            let body = json!({ "success": true, "result": { "records": records } });
            self.pages.push((
                resource.to_string(),
                year,
                TransportResponse {
                    status: StatusCode::OK,
                    body: serde_json::to_vec(&body).unwrap(),
                },
            ));
            self
        }

        fn status(mut self, resource: &str, year: i32, code: u16) -> Self {
            self.pages.push((
                resource.to_string(),
                year,
                TransportResponse {
                    status: StatusCode::from_u16(code).unwrap(),
                    body: Vec::new(),
                },
            ));
            self
        }
    }

    #[async_trait]
    impl Transport for FixtureTransport {
        async fn get_sql(&self, sql: &str) -> Result<TransportResponse, TransportError> {
            self.seen.lock().unwrap().push(sql.to_string());
            for (resource, year, resp) in &self.pages {
                let year_match =
                    sql.contains(&format!("'{year}-01-01'")) || sql.contains(&format!("= {year} "));
                if sql.contains(&format!("\"{resource}\"")) && year_match {
                    return Ok(resp.clone());
                }
            }
            let empty = json!({ "success": true, "result": { "records": [] } });
            Ok(TransportResponse {
                status: StatusCode::OK,
                body: serde_json::to_vec(&empty).unwrap(),
            })
        }

        async fn get_page(
            &self,
            resource_id: &str,
            limit: u32,
            offset: u64,
        ) -> Result<TransportResponse, TransportError> {
            self.seen.lock().unwrap().push(format!("page {resource_id} {offset}"));
            let Some((_, records)) = self.resources.iter().find(|(r, _)| r == resource_id) else {
                return Ok(TransportResponse {
                    status: StatusCode::NOT_FOUND,
                    body: Vec::new(),
                });
            };
            let page: Vec<_> = records.iter().skip(offset as usize).take(limit as usize).collect();
            let body = json!({ "success": true, "result": { "records": page, "total": records.len() } });
            Ok(TransportResponse {
                status: StatusCode::OK,
                body: serde_json::to_vec(&body).unwrap(),
            })
        }
    }

    const PERMITS_RESOURCE: &str = "5232a72d-235a-48eb-ae20-bb9d501300ad";

    fn stale_contract(id: i64, date: &str) -> mof_core::Contract {
        mof_core::Contract {
            id,
            source: "officials".into(),
            supplier_raw: "Stale".into(),
            supplier: "STALE".into(),
            approval_date: date.into(),
            department: None,
            description: None,
            amount: Some(1.0),
        }
    }

    async fn seed(loader: &Loader<FixtureTransport>, contract: mof_core::Contract) {
        loader
            .store()
            .write_batch(&Batch {
                contracts: vec![contract],
                ..Batch::default()
            })
            .await
            .unwrap();
    }

    async fn loader(transport: FixtureTransport) -> Loader<FixtureTransport> {
        let store = Store::open_in_memory().await.expect("store");
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let client = QueryClient::new(transport, retry, Duration::ZERO);
        Loader::new(store, client, DatasetRegistry::builtin(), Normalizer::builtin()).with_current_year(2024)
    }

    fn officials(id: i64, supplier: &str, date: &str, amount: &str) -> serde_json::Value {
        json!({ "_id": id, "NOM_FOURNISSEUR": supplier, "DATE_SIGNATURE": date, "SERVICE": "Voirie",
                "DESCRIPTION": "Travaux", "MONTANT": amount })
    }

    #[tokio::test]
    async fn contract_sources_land_in_their_offset_blocks() {
        let transport = FixtureTransport::new()
            .page("contrats-officials", 2024, json!([officials(7, "Acme inc.", "2024-02-01", "24 000,00 $")]))
            .page(
                "contrats-executive-committee",
                2024,
                json!([{ "_id": 7, "FOURNISSEUR": "Beta", "DATE": "2024-03-01", "SERVICE": "Parcs",
                         "OBJET": "Arbres", "MONTANT": 150000 }]),
            );
        let loader = loader(transport).await;

        let summary = loader.load("contracts", LoadMode::Year(2024)).await.expect("run");

        assert!(summary.succeeded());
        assert_eq!(summary.rows_loaded, 2);
        assert_eq!(summary.batches, 5);
        let official = loader.store().contract(1_000_007).await.unwrap().expect("officials row");
        assert_eq!(official.supplier, "ACME INC");
        assert_eq!(official.amount, Some(24_000.0));
        let committee = loader.store().contract(2_000_007).await.unwrap().expect("committee row");
        assert_eq!(committee.source, "executive-committee");
    }

    #[tokio::test]
    async fn sources_run_in_declared_order_within_ascending_years() {
        let loader = loader(FixtureTransport::new()).await;
        loader.load("contracts", LoadMode::Incremental).await.expect("run");

        let seen = loader.client.transport().seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 10);
        assert!(seen[0].contains("contrats-officials") && seen[0].contains("2023-01-01"));
        assert!(seen[4].contains("contrats-borough-councils") && seen[4].contains("2023-01-01"));
        assert!(seen[5].contains("contrats-officials") && seen[5].contains("2024-01-01"));
    }

    #[tokio::test]
    async fn forbidden_source_fails_the_run_and_keeps_earlier_batches() {
        let transport = FixtureTransport::new()
            .page("contrats-officials", 2024, json!([officials(1, "Acme", "2024-02-01", "1000")]))
            .status("contrats-executive-committee", 2024, 403);
        let loader = loader(transport).await;

        let summary = loader.load("contracts", LoadMode::Year(2024)).await.expect("run record");

        match &summary.outcome {
            RunOutcome::Failed { step, error } => {
                assert_eq!(step, "contracts/executive-committee/2024: fetch");
                assert!(error.contains("403"), "{error}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(summary.rows_loaded, 1);
        let run = loader.store().run(summary.run_id).await.unwrap().expect("run row");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.rows_loaded, 1);
        assert_eq!(run.failed_step.as_deref(), Some("contracts/executive-committee/2024: fetch"));
        assert!(loader.store().contract(1_000_001).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rows_missing_the_date_column_abort_the_batch() {
        let transport = FixtureTransport::new().page(
            "5232a72d-235a-48eb-ae20-bb9d501300ad",
            2024,
            json!([
                { "_id": 1, "date_debut": "2024-01-01", "date_emission": "2024-02-01", "arrondissement": "Verdun" },
                { "_id": 2, "arrondissement": "Verdun" }
            ]),
        );
        let loader = loader(transport).await;

        let summary = loader.load("permits", LoadMode::Year(2024)).await.expect("run record");

        match &summary.outcome {
            RunOutcome::Failed { step, error } => {
                assert_eq!(step, "permits/2024: map");
                assert!(error.contains("date_debut"), "{error}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(loader.store().count_rows(RecordTable::Permits).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn successful_full_load_drops_rows_it_did_not_rewrite() {
        let transport = FixtureTransport::new()
            .page("contrats-officials", 2023, json!([officials(1, "Acme", "2023-05-01", "1000")]))
            .page("contrats-officials", 2024, json!([officials(2, "Acme", "2024-05-01", "2000")]));
        let loader = loader(transport).await.with_full_start_year(2023);
        seed(&loader, stale_contract(1_999_999, "2019-01-01")).await;
        seed(&loader, stale_contract(2_000_009, "2019-01-01")).await;

        let summary = loader.load("contracts", LoadMode::Full).await.expect("run");

        assert!(summary.succeeded());
        assert!(loader.store().contract(1_999_999).await.unwrap().is_none());
        assert!(loader.store().contract(2_000_009).await.unwrap().is_none());
        assert!(loader.store().contract(1_000_001).await.unwrap().is_some());
        assert!(loader.store().contract(1_000_002).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_full_load_keeps_rows_from_years_it_never_reached() {
        let transport = FixtureTransport::new()
            .page("contrats-officials", 2022, json!([officials(1, "Acme", "2022-05-01", "1000")]))
            .status("contrats-officials", 2023, 403);
        let loader = loader(transport).await.with_full_start_year(2022);
        seed(&loader, stale_contract(1_000_050, "2024-06-01")).await;

        let summary = loader.load("contracts", LoadMode::Full).await.expect("run record");

        match &summary.outcome {
            RunOutcome::Failed { step, .. } => assert_eq!(step, "contracts/officials/2023: fetch"),
            other => panic!("expected failure, got {other:?}"),
        }
        let kept = loader.store().contract(1_000_050).await.unwrap().expect("2024 row survives");
        assert_eq!(kept.approval_date, "2024-06-01");
        assert!(loader.store().contract(1_000_001).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rejected_permit_sql_falls_back_to_paging_the_resource() {
        let dir = tempfile::tempdir().expect("tempdir");
        let permit = |id: i64, date: &str| json!({ "_id": id, "date_debut": date, "arrondissement": "Verdun" });
        let transport = FixtureTransport::new().status(PERMITS_RESOURCE, 2024, 409).resource(
            PERMITS_RESOURCE,
            vec![
                permit(1, "2024-01-05T00:00:00"),
                permit(2, "2023-11-30T00:00:00"),
                permit(3, "2024-07-01T00:00:00"),
            ],
        );
        let loader = loader(transport).await.with_archive(ResponseArchive::new(dir.path()));

        let summary = loader.load("permits", LoadMode::Year(2024)).await.expect("run");

        assert!(summary.succeeded(), "{:?}", summary.outcome);
        assert_eq!(summary.rows_loaded, 2);
        assert!(loader.store().permit(1).await.unwrap().is_some());
        assert!(loader.store().permit(2).await.unwrap().is_none());
        assert!(loader.store().permit(3).await.unwrap().is_some());
        let seen = loader.client.transport().seen.lock().unwrap().clone();
        assert_eq!(seen.last().map(String::as_str), Some(format!("page {PERMITS_RESOURCE} 0").as_str()));

        let archived = ResponseArchive::new(dir.path()).latest("permits", 2024).await.unwrap().expect("archived");
        assert_eq!(decode_envelope(&archived).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_fallback_reports_both_errors() {
        let transport = FixtureTransport::new().status(PERMITS_RESOURCE, 2024, 403);
        let loader = loader(transport).await;

        let summary = loader.load("permits", LoadMode::Year(2024)).await.expect("run record");

        match &summary.outcome {
            RunOutcome::Failed { step, error } => {
                assert_eq!(step, "permits/2024: fetch");
                assert!(error.contains("403") && error.contains("datastore_search fallback"), "{error}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replay_rebuilds_from_the_archive_without_fetching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = FixtureTransport::new()
            .page("contrats-officials", 2024, json!([officials(1, "Acme", "2024-02-01", "1000")]));
        let first = loader(transport).await.with_archive(ResponseArchive::new(dir.path()));
        first.load("contracts", LoadMode::Year(2024)).await.expect("run");

        let replayer = loader(FixtureTransport::new()).await.with_archive(ResponseArchive::new(dir.path()));
        let summary = replayer.replay("contracts", LoadMode::Year(2024)).await.expect("replay");

        assert!(summary.succeeded());
        assert_eq!(summary.rows_loaded, 1);
        assert!(replayer.store().contract(1_000_001).await.unwrap().is_some());
        assert!(replayer.client.transport().seen.lock().unwrap().is_empty());
        let run = replayer.store().run(summary.run_id).await.unwrap().expect("run row");
        assert_eq!(run.mode, "year-replay");
    }

    #[tokio::test]
    async fn full_replay_with_missing_years_keeps_existing_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = FixtureTransport::new()
            .page("contrats-officials", 2024, json!([officials(1, "Acme", "2024-02-01", "1000")]));
        let first = loader(transport).await.with_archive(ResponseArchive::new(dir.path()));
        first.load("contracts", LoadMode::Year(2024)).await.expect("run");

        let replayer = loader(FixtureTransport::new())
            .await
            .with_archive(ResponseArchive::new(dir.path()))
            .with_full_start_year(2023);
        seed(&replayer, stale_contract(1_000_050, "2023-06-01")).await;
        let summary = replayer.replay("contracts", LoadMode::Full).await.expect("replay");

        assert!(summary.succeeded());
        assert!(replayer.store().contract(1_000_050).await.unwrap().is_some());
        assert!(replayer.store().contract(1_000_001).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn replay_without_an_archive_is_a_config_error() {
        let loader = loader(FixtureTransport::new()).await;
        assert!(matches!(
            loader.replay("contracts", LoadMode::Incremental).await,
            Err(LoadError::Config(_))
        ));
    }

    #[tokio::test]
    async fn unknown_dataset_is_a_config_error() {
        let loader = loader(FixtureTransport::new()).await;
        assert!(matches!(
            loader.load("parking-tickets", LoadMode::Incremental).await,
            Err(LoadError::Config(_))
        ));
        assert!(loader.store().recent_runs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archived_bodies_are_written_per_source_and_year() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = FixtureTransport::new()
            .page("contrats-officials", 2024, json!([officials(1, "Acme", "2024-02-01", "1000")]));
        let loader = loader(transport).await.with_archive(ResponseArchive::new(dir.path()));

        loader.load("contracts", LoadMode::Year(2024)).await.expect("run");

        let archive = ResponseArchive::new(dir.path());
        assert_eq!(archive.list("officials", 2024).await.unwrap().len(), 1);
        assert_eq!(archive.list("city-council", 2024).await.unwrap().len(), 1);
    }

    #[test]
    fn report_lists_runs_and_failures() {
        let run = IngestionRun {
            run_id: uuid::Uuid::nil(),
            dataset: "permits".into(),
            mode: "full".into(),
            rows_loaded: 12,
            status: RunStatus::Failed,
            failed_step: Some("permits/2003: fetch".into()),
            error: Some("boom".into()),
            started_at: Utc::now(),
            finished_at: None,
        };
        let md = runs_report_markdown(&[run]);
        assert!(md.contains("| permits | full | failed | 12 |"));
        assert!(md.contains("permits/2003: fetch"));
        assert!(runs_report_markdown(&[]).contains("No runs recorded."));
    }
}
