use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use mof_core::stats::{borough_stats, scorecards, Grade, DEFAULT_TARGET_DAYS};
use mof_core::LoadMode;
use mof_datasets::{DatasetRegistry, Normalizer};
use mof_storage::{
    QueryClient, RecordTable, RetryPolicy, StatusCode, Store, Transport, TransportError, TransportResponse,
};
use mof_sync::Loader;
use serde_json::json;

const PERMITS_PER_YEAR: i64 = 50;

/// Serves 50 permits per requested year, each issued exactly 90 days after
/// application, under the em-dash spelling of the borough.
struct PermitYears;

#[async_trait]
impl Transport for PermitYears {
    async fn get_sql(&self, sql: &str) -> Result<TransportResponse, TransportError> {
        let year: i32 = sql
            .split("= ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|y| y.parse().ok())
            .ok_or_else(|| TransportError::Permanent(format!("no year in {sql}")))?;

        let start = NaiveDate::from_ymd_opt(year, 1, 1).unwrap();
        let records: Vec<_> = (0..PERMITS_PER_YEAR)
            .map(|i| {
                let applied = start + chrono::Duration::days(i * 3);
                let issued = applied + chrono::Duration::days(90);
                json!({
                    "_id": (year as i64 - 2000) * 1_000 + i,
                    "no_demande": format!("{year}-{i:04}"),
                    "arrondissement": "Côte-des-Neiges—Notre-Dame-de-Grâce",
                    "date_debut": format!("{applied}T00:00:00"),
                    "date_emission": format!("{issued}T00:00:00"),
                    "code_type_base_demande": "CO",
                    "nb_logements": "2",
                })
            })
            .collect();
        let body = json!({ "success": true, "result": { "records": records } });
        Ok(TransportResponse {
            status: StatusCode::OK,
            body: serde_json::to_vec(&body).unwrap(),
        })
    }
}

async fn loader() -> Loader<PermitYears> {
    let store = Store::open_in_memory().await.expect("store");
    let retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    let client = QueryClient::new(PermitYears, retry, Duration::ZERO);
    Loader::new(store, client, DatasetRegistry::builtin(), Normalizer::builtin()).with_current_year(2024)
}

#[tokio::test]
async fn two_steady_years_at_target_grade_a() {
    let loader = loader().await;

    let summary = loader.load("permits", LoadMode::Incremental).await.expect("run");
    assert!(summary.succeeded(), "{:?}", summary.outcome);
    assert_eq!(summary.rows_loaded, 100);
    assert_eq!(summary.batches, 2);

    let current = loader.store().permits_for_year(2024).await.unwrap();
    let previous = loader.store().permits_for_year(2023).await.unwrap();
    assert_eq!(current.len(), 50);
    assert_eq!(previous.len(), 50);

    let current_stats = borough_stats(&current, 2024, DEFAULT_TARGET_DAYS);
    let previous_stats = borough_stats(&previous, 2023, DEFAULT_TARGET_DAYS);
    assert_eq!(current_stats.len(), 1);
    assert_eq!(current_stats[0].borough, "Côte-des-Neiges-Notre-Dame-de-Grâce");
    assert_eq!(current_stats[0].median_processing_days, 90.0);
    assert_eq!(current_stats[0].pct_within_90_days, 100.0);

    let cards = scorecards(current_stats, &previous_stats, DEFAULT_TARGET_DAYS);
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].previous_median_days, Some(90.0));
    assert_eq!(cards[0].breakdown.trend_component, 50.0);
    assert_eq!(cards[0].breakdown.score, 90.0);
    assert_eq!(cards[0].breakdown.grade, Grade::A);
}

#[tokio::test]
async fn reloading_the_same_years_is_idempotent() {
    let loader = loader().await;

    loader.load("permits", LoadMode::Incremental).await.expect("first run");
    let before = loader.store().permits_for_year(2024).await.unwrap();
    let second = loader.load("permits", LoadMode::Incremental).await.expect("second run");

    assert!(second.succeeded());
    assert_eq!(loader.store().count_rows(RecordTable::Permits).await.unwrap(), 100);
    assert_eq!(loader.store().permits_for_year(2024).await.unwrap(), before);

    let runs = loader.store().recent_runs(Some("permits"), 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.rows_loaded == 100));
}
