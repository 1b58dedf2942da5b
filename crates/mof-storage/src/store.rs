//! Relational store over SQLite: permits, contracts, ingestion runs and the
//! area hierarchy.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use mof_core::{Contract, DateRange, IngestionRun, LoadMode, Permit, RunOutcome, RunStatus};
use mof_datasets::areas::{
    AREAS, BOROUGH_ALIASES, BOROUGH_POPULATION_2016, POPULATION_ATTRIBUTE, POPULATION_EFFECTIVE_DATE,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("ingestion run {0} not found")]
    UnknownRun(Uuid),
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS permits (
    id INTEGER PRIMARY KEY,
    external_id TEXT,
    borough_raw TEXT NOT NULL DEFAULT '',
    borough TEXT NOT NULL DEFAULT '',
    application_date TEXT,
    issue_date TEXT,
    processing_days INTEGER CHECK (processing_days IS NULL OR processing_days >= 0),
    type_code TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS contracts (
    id INTEGER PRIMARY KEY,
    source TEXT NOT NULL,
    supplier_raw TEXT NOT NULL DEFAULT '',
    supplier TEXT NOT NULL DEFAULT '',
    approval_date TEXT NOT NULL DEFAULT '',
    department TEXT,
    description TEXT,
    amount REAL
);

CREATE TABLE IF NOT EXISTS ingestion_runs (
    run_id TEXT PRIMARY KEY,
    dataset TEXT NOT NULL,
    mode TEXT NOT NULL,
    rows_loaded INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    failed_step TEXT,
    error TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS areas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    name_fr TEXT NOT NULL,
    name_en TEXT NOT NULL,
    parent_id INTEGER REFERENCES areas(id)
);

CREATE TABLE IF NOT EXISTS area_attributes (
    area_id INTEGER NOT NULL REFERENCES areas(id),
    attribute TEXT NOT NULL,
    value REAL NOT NULL,
    effective_date TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (area_id, attribute, effective_date)
);

CREATE TABLE IF NOT EXISTS area_aliases (
    raw_name TEXT PRIMARY KEY,
    area_id INTEGER NOT NULL REFERENCES areas(id)
);
"#;

const INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_permits_application_date ON permits(application_date);
CREATE INDEX IF NOT EXISTS idx_permits_borough ON permits(borough);
CREATE INDEX IF NOT EXISTS idx_contracts_approval_date ON contracts(approval_date);
CREATE INDEX IF NOT EXISTS idx_contracts_supplier ON contracts(supplier);
CREATE INDEX IF NOT EXISTS idx_contracts_source ON contracts(source);
CREATE INDEX IF NOT EXISTS idx_ingestion_runs_started ON ingestion_runs(dataset, started_at);
"#;

/// Columns added after the first schema; applied with a guarded ALTER TABLE.
const ADDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("permits", "permit_number", "TEXT"),
    ("permits", "type_description", "TEXT"),
    ("permits", "building_type", "TEXT"),
    ("permits", "building_category", "TEXT"),
    ("permits", "work_nature", "TEXT"),
    ("permits", "address", "TEXT"),
    ("permits", "housing_units", "INTEGER"),
    ("permits", "latitude", "REAL"),
    ("permits", "longitude", "REAL"),
    ("permits", "updated_at", "TEXT"),
    ("contracts", "updated_at", "TEXT"),
    ("permits", "loaded_by", "TEXT"),
    ("contracts", "loaded_by", "TEXT"),
];

/// Approval dates usable by queries: exact `YYYY-MM-DD` naming a real day.
const VALID_APPROVAL_DATE: &str =
    "approval_date GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]' AND date(approval_date) = approval_date";

const PERMIT_SELECT: &str = "SELECT id, external_id, permit_number, borough_raw, borough, application_date, \
     issue_date, processing_days, type_code, type_description, building_type, building_category, \
     work_nature, address, housing_units, latitude, longitude FROM permits";

const CONTRACT_SELECT: &str =
    "SELECT id, source, supplier_raw, supplier, approval_date, department, description, amount FROM contracts";

const RUN_SELECT: &str = "SELECT run_id, dataset, mode, rows_loaded, status, failed_step, error, started_at, \
     finished_at FROM ingestion_runs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordTable {
    Permits,
    Contracts,
}

impl RecordTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordTable::Permits => "permits",
            RecordTable::Contracts => "contracts",
        }
    }
}

/// The identifier block `start..=end` of `table` owned by one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Purge {
    pub table: RecordTable,
    pub start: i64,
    pub end: i64,
}

/// One transactional unit of loader output. Rows are stamped with `run_id`
/// so a completed full load can drop whatever it did not rewrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub run_id: Option<Uuid>,
    pub permits: Vec<Permit>,
    pub contracts: Vec<Contract>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.permits.len() + self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWrite {
    pub upserted: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSort {
    #[default]
    DateDesc,
    DateAsc,
    AmountDesc,
    AmountAsc,
}

impl SearchSort {
    fn order_by(&self) -> &'static str {
        match self {
            SearchSort::DateDesc => " ORDER BY approval_date DESC, id DESC",
            SearchSort::DateAsc => " ORDER BY approval_date ASC, id ASC",
            SearchSort::AmountDesc => " ORDER BY amount IS NULL, amount DESC, id DESC",
            SearchSort::AmountAsc => " ORDER BY amount IS NULL, amount ASC, id ASC",
        }
    }
}

impl FromStr for SearchSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "date_desc" => Ok(SearchSort::DateDesc),
            "date_asc" => Ok(SearchSort::DateAsc),
            "amount_desc" => Ok(SearchSort::AmountDesc),
            "amount_asc" => Ok(SearchSort::AmountAsc),
            other => Err(format!("unknown sort {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AmountBound {
    pub value: f64,
    pub inclusive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AmountBounds {
    pub min: Option<AmountBound>,
    pub max: Option<AmountBound>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContractFilter {
    All,
    /// Every word must appear in supplier, description or department.
    Keywords(Vec<String>),
    Amount(AmountBounds),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractPage {
    pub total: i64,
    pub contracts: Vec<Contract>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AreaAttribute {
    pub slug: String,
    pub attribute: String,
    pub value: f64,
    pub effective_date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) a database at `url` and applies migrations.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(opts).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database; one pinned connection keeps it alive.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent: safe to run on every start.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        for (table, column, decl) in ADDED_COLUMNS {
            if self.ensure_column(table, column, decl).await? {
                info!(table, column, "added missing column");
            }
        }
        sqlx::query(INDEX_SQL).execute(&self.pool).await?;
        self.seed_areas().await?;
        Ok(())
    }

    /// Adds `column` to `table` unless it already exists. Returns whether it was added.
    async fn ensure_column(&self, table: &str, column: &str, decl: &str) -> StoreResult<bool> {
        let columns: Vec<(i32, String, String, i32, Option<String>, i32)> =
            sqlx::query_as(&format!("PRAGMA table_info({table})"))
                .fetch_all(&self.pool)
                .await?;
        let existing: HashSet<&str> = columns.iter().map(|(_, name, _, _, _, _)| name.as_str()).collect();
        if existing.contains(column) {
            return Ok(false);
        }
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
            .execute(&self.pool)
            .await?;
        Ok(true)
    }

    async fn seed_areas(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for area in AREAS {
            sqlx::query(
                "INSERT OR IGNORE INTO areas (slug, kind, name_fr, name_en, parent_id) \
                 VALUES (?, ?, ?, ?, (SELECT id FROM areas WHERE slug = ?))",
            )
            .bind(area.slug)
            .bind(area.kind.as_str())
            .bind(area.name_fr)
            .bind(area.name_en)
            .bind(area.parent)
            .execute(&mut *tx)
            .await?;
        }

        let recorded_at = Utc::now();
        for (slug, population) in BOROUGH_POPULATION_2016 {
            sqlx::query(
                "INSERT OR IGNORE INTO area_attributes (area_id, attribute, value, effective_date, recorded_at) \
                 SELECT id, ?, ?, ?, ? FROM areas WHERE slug = ?",
            )
            .bind(POPULATION_ATTRIBUTE)
            .bind(*population as f64)
            .bind(POPULATION_EFFECTIVE_DATE)
            .bind(recorded_at)
            .bind(*slug)
            .execute(&mut *tx)
            .await?;
        }

        for (raw, canonical) in BOROUGH_ALIASES {
            sqlx::query(
                "INSERT OR IGNORE INTO area_aliases (raw_name, area_id) SELECT ?, id FROM areas WHERE name_fr = ?",
            )
            .bind(*raw)
            .bind(*canonical)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Writes one batch atomically: every upsert commits or none does.
    pub async fn write_batch(&self, batch: &Batch) -> StoreResult<BatchWrite> {
        let now = Utc::now();
        let loaded_by = batch.run_id.map(|id| id.to_string());
        let mut tx = self.pool.begin().await?;
        let mut result = BatchWrite::default();

        for p in &batch.permits {
            sqlx::query(
                "INSERT INTO permits (id, external_id, permit_number, borough_raw, borough, application_date, \
                 issue_date, processing_days, type_code, type_description, building_type, building_category, \
                 work_nature, address, housing_units, latitude, longitude, updated_at, loaded_by) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 external_id = excluded.external_id, permit_number = excluded.permit_number, \
                 borough_raw = excluded.borough_raw, borough = excluded.borough, \
                 application_date = excluded.application_date, issue_date = excluded.issue_date, \
                 processing_days = excluded.processing_days, type_code = excluded.type_code, \
                 type_description = excluded.type_description, building_type = excluded.building_type, \
                 building_category = excluded.building_category, work_nature = excluded.work_nature, \
                 address = excluded.address, housing_units = excluded.housing_units, \
                 latitude = excluded.latitude, longitude = excluded.longitude, updated_at = excluded.updated_at, \
                 loaded_by = excluded.loaded_by",
            )
            .bind(p.id)
            .bind(p.external_id.as_deref())
            .bind(p.permit_number.as_deref())
            .bind(p.borough_raw.as_str())
            .bind(p.borough.as_str())
            .bind(p.application_date)
            .bind(p.issue_date)
            .bind(p.processing_days)
            .bind(p.type_code.as_str())
            .bind(p.type_description.as_deref())
            .bind(p.building_type.as_deref())
            .bind(p.building_category.as_deref())
            .bind(p.work_nature.as_deref())
            .bind(p.address.as_deref())
            .bind(p.housing_units)
            .bind(p.latitude)
            .bind(p.longitude)
            .bind(now)
            .bind(loaded_by.as_deref())
            .execute(&mut *tx)
            .await?;
            result.upserted += 1;
        }

        for c in &batch.contracts {
            sqlx::query(
                "INSERT INTO contracts (id, source, supplier_raw, supplier, approval_date, department, \
                 description, amount, updated_at, loaded_by) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET \
                 source = excluded.source, supplier_raw = excluded.supplier_raw, supplier = excluded.supplier, \
                 approval_date = excluded.approval_date, department = excluded.department, \
                 description = excluded.description, amount = excluded.amount, updated_at = excluded.updated_at, \
                 loaded_by = excluded.loaded_by",
            )
            .bind(c.id)
            .bind(c.source.as_str())
            .bind(c.supplier_raw.as_str())
            .bind(c.supplier.as_str())
            .bind(c.approval_date.as_str())
            .bind(c.department.as_deref())
            .bind(c.description.as_deref())
            .bind(c.amount)
            .bind(now)
            .bind(loaded_by.as_deref())
            .execute(&mut *tx)
            .await?;
            result.upserted += 1;
        }

        tx.commit().await?;
        Ok(result)
    }

    /// Deletes rows of `block` that `run_id` did not write. Called once a full
    /// load has rewritten every year, so a failed run never reaches it.
    pub async fn purge_stale(&self, block: Purge, run_id: Uuid) -> StoreResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE id BETWEEN ? AND ? AND (loaded_by IS NULL OR loaded_by <> ?)",
            block.table.as_str()
        );
        let purged = sqlx::query(&sql)
            .bind(block.start)
            .bind(block.end)
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        debug!(
            table = block.table.as_str(),
            start = block.start,
            end = block.end,
            rows = purged,
            "purged stale rows"
        );
        Ok(purged)
    }

    pub async fn count_rows(&self, table: RecordTable) -> StoreResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.as_str());
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    /// Permits whose application falls within `year`.
    pub async fn permits_for_year(&self, year: i32) -> StoreResult<Vec<Permit>> {
        let sql = format!("{PERMIT_SELECT} WHERE application_date >= ? AND application_date <= ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(format!("{year:04}-01-01"))
            .bind(format!("{year:04}-12-31"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(permit_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn permit(&self, id: i64) -> StoreResult<Option<Permit>> {
        let sql = format!("{PERMIT_SELECT} WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(permit_from_row).transpose()?)
    }

    pub async fn contract(&self, id: i64) -> StoreResult<Option<Contract>> {
        let sql = format!("{CONTRACT_SELECT} WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(contract_from_row).transpose()?)
    }

    /// Contracts with a valid approval date inside `range`, oldest first.
    pub async fn contracts_in_range(&self, range: &DateRange) -> StoreResult<Vec<Contract>> {
        let sql = format!(
            "{CONTRACT_SELECT} WHERE {VALID_APPROVAL_DATE} AND approval_date BETWEEN ? AND ? \
             ORDER BY approval_date, id"
        );
        let rows = sqlx::query(&sql)
            .bind(range.from)
            .bind(range.to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(contract_from_row).collect::<Result<_, _>>()?)
    }

    /// Rows stored with an approval date no query will ever see.
    pub async fn count_undated_contracts(&self) -> StoreResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM contracts WHERE NOT ({VALID_APPROVAL_DATE})");
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    pub async fn search_contracts(
        &self,
        range: &DateRange,
        filter: &ContractFilter,
        sort: SearchSort,
        limit: i64,
        offset: i64,
    ) -> StoreResult<ContractPage> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM contracts");
        push_search_filter(&mut count, range, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Sqlite>::new(CONTRACT_SELECT);
        push_search_filter(&mut select, range, filter);
        select.push(sort.order_by());
        select.push(" LIMIT ").push_bind(limit.max(0));
        select.push(" OFFSET ").push_bind(offset.max(0));
        let rows = select.build().fetch_all(&self.pool).await?;
        let contracts = rows.iter().map(contract_from_row).collect::<Result<_, _>>()?;
        Ok(ContractPage { total, contracts })
    }

    pub async fn begin_run(&self, dataset: &str, mode: LoadMode) -> StoreResult<IngestionRun> {
        self.begin_run_labelled(dataset, mode.as_str()).await
    }

    /// Opens a run whose mode column reads `mode_label`, e.g. `full-replay`.
    pub async fn begin_run_labelled(&self, dataset: &str, mode_label: &str) -> StoreResult<IngestionRun> {
        let run = IngestionRun {
            run_id: Uuid::new_v4(),
            dataset: dataset.to_string(),
            mode: mode_label.to_string(),
            rows_loaded: 0,
            status: RunStatus::Running,
            failed_step: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        sqlx::query(
            "INSERT INTO ingestion_runs (run_id, dataset, mode, rows_loaded, status, started_at) \
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(run.run_id.to_string())
        .bind(run.dataset.as_str())
        .bind(run.mode.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;
        Ok(run)
    }

    /// Persists the running total after each committed batch.
    pub async fn record_progress(&self, run_id: Uuid, rows_loaded: u64) -> StoreResult<()> {
        let done = sqlx::query("UPDATE ingestion_runs SET rows_loaded = ? WHERE run_id = ?")
            .bind(rows_loaded as i64)
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::UnknownRun(run_id));
        }
        Ok(())
    }

    pub async fn finish_run(
        &self,
        run_id: Uuid,
        rows_loaded: u64,
        outcome: &RunOutcome,
    ) -> StoreResult<DateTime<Utc>> {
        let finished_at = Utc::now();
        let (status, step, error) = match outcome {
            RunOutcome::Succeeded => (RunStatus::Succeeded, None, None),
            RunOutcome::Failed { step, error } => (RunStatus::Failed, Some(step.as_str()), Some(error.as_str())),
        };
        let done = sqlx::query(
            "UPDATE ingestion_runs SET rows_loaded = ?, status = ?, failed_step = ?, error = ?, finished_at = ? \
             WHERE run_id = ?",
        )
        .bind(rows_loaded as i64)
        .bind(status.as_str())
        .bind(step)
        .bind(error)
        .bind(finished_at)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::UnknownRun(run_id));
        }
        Ok(finished_at)
    }

    pub async fn run(&self, run_id: Uuid) -> StoreResult<Option<IngestionRun>> {
        let sql = format!("{RUN_SELECT} WHERE run_id = ?");
        let row = sqlx::query(&sql)
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(run_from_row).transpose()?)
    }

    /// Most recent runs first, optionally for one dataset.
    pub async fn recent_runs(&self, dataset: Option<&str>, limit: i64) -> StoreResult<Vec<IngestionRun>> {
        let mut qb = QueryBuilder::<Sqlite>::new(RUN_SELECT);
        if let Some(dataset) = dataset {
            qb.push(" WHERE dataset = ").push_bind(dataset.to_string());
        }
        qb.push(" ORDER BY started_at DESC, rowid DESC LIMIT ").push_bind(limit.max(0));
        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(run_from_row).collect::<Result<_, _>>()?)
    }

    /// Area slug registered for a raw spelling, if any.
    pub async fn resolve_area_alias(&self, raw: &str) -> StoreResult<Option<String>> {
        Ok(sqlx::query_scalar(
            "SELECT a.slug FROM area_aliases al JOIN areas a ON a.id = al.area_id WHERE al.raw_name = ?",
        )
        .bind(raw)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Appends an attribute observation. Returns false when the same
    /// (area, attribute, effective date) is already recorded.
    pub async fn record_area_attribute(
        &self,
        slug: &str,
        attribute: &str,
        value: f64,
        effective_date: NaiveDate,
    ) -> StoreResult<bool> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO area_attributes (area_id, attribute, value, effective_date, recorded_at) \
             SELECT id, ?, ?, ?, ? FROM areas WHERE slug = ?",
        )
        .bind(attribute)
        .bind(value)
        .bind(effective_date)
        .bind(Utc::now())
        .bind(slug)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Latest value of `attribute` effective on or before `as_of`.
    pub async fn area_attribute(
        &self,
        slug: &str,
        attribute: &str,
        as_of: NaiveDate,
    ) -> StoreResult<Option<AreaAttribute>> {
        let row = sqlx::query(
            "SELECT a.slug, aa.attribute, aa.value, aa.effective_date FROM area_attributes aa \
             JOIN areas a ON a.id = aa.area_id \
             WHERE a.slug = ? AND aa.attribute = ? AND aa.effective_date <= ? \
             ORDER BY aa.effective_date DESC LIMIT 1",
        )
        .bind(slug)
        .bind(attribute)
        .bind(as_of)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(AreaAttribute {
            slug: row.try_get("slug")?,
            attribute: row.try_get("attribute")?,
            value: row.try_get("value")?,
            effective_date: row.try_get("effective_date")?,
        }))
    }

    pub async fn area_population(&self, slug: &str, as_of: NaiveDate) -> StoreResult<Option<AreaAttribute>> {
        self.area_attribute(slug, POPULATION_ATTRIBUTE, as_of).await
    }
}

fn push_search_filter(qb: &mut QueryBuilder<'_, Sqlite>, range: &DateRange, filter: &ContractFilter) {
    qb.push(" WHERE ");
    qb.push(VALID_APPROVAL_DATE);
    qb.push(" AND approval_date BETWEEN ")
        .push_bind(range.from)
        .push(" AND ")
        .push_bind(range.to);
    match filter {
        ContractFilter::All => {}
        ContractFilter::Keywords(words) => {
            for word in words {
                let pattern = format!("%{}%", escape_like(word));
                qb.push(" AND (supplier LIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\' OR supplier_raw LIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\' OR description LIKE ")
                    .push_bind(pattern.clone())
                    .push(" ESCAPE '\\' OR department LIKE ")
                    .push_bind(pattern)
                    .push(" ESCAPE '\\')");
            }
        }
        ContractFilter::Amount(bounds) => {
            if let Some(min) = bounds.min {
                qb.push(if min.inclusive { " AND amount >= " } else { " AND amount > " })
                    .push_bind(min.value);
            }
            if let Some(max) = bounds.max {
                qb.push(if max.inclusive { " AND amount <= " } else { " AND amount < " })
                    .push_bind(max.value);
            }
        }
    }
}

fn escape_like(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    for ch in word.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn permit_from_row(row: &SqliteRow) -> Result<Permit, sqlx::Error> {
    Ok(Permit {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        permit_number: row.try_get("permit_number")?,
        borough_raw: row.try_get("borough_raw")?,
        borough: row.try_get("borough")?,
        application_date: row.try_get("application_date")?,
        issue_date: row.try_get("issue_date")?,
        processing_days: row.try_get("processing_days")?,
        type_code: row.try_get("type_code")?,
        type_description: row.try_get("type_description")?,
        building_type: row.try_get("building_type")?,
        building_category: row.try_get("building_category")?,
        work_nature: row.try_get("work_nature")?,
        address: row.try_get("address")?,
        housing_units: row.try_get("housing_units")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
    })
}

fn contract_from_row(row: &SqliteRow) -> Result<Contract, sqlx::Error> {
    Ok(Contract {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        supplier_raw: row.try_get("supplier_raw")?,
        supplier: row.try_get("supplier")?,
        approval_date: row.try_get("approval_date")?,
        department: row.try_get("department")?,
        description: row.try_get("description")?,
        amount: row.try_get("amount")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<IngestionRun, sqlx::Error> {
    let run_id: String = row.try_get("run_id")?;
    let status: String = row.try_get("status")?;
    Ok(IngestionRun {
        run_id: Uuid::parse_str(&run_id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        dataset: row.try_get("dataset")?,
        mode: row.try_get("mode")?,
        rows_loaded: row.try_get("rows_loaded")?,
        status: status.parse::<RunStatus>().map_err(|e| sqlx::Error::Decode(e.into()))?,
        failed_step: row.try_get("failed_step")?,
        error: row.try_get("error")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}
