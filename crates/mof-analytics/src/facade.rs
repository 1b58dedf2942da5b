//! Read-side entry point shared by the web routes and the CLI.
//!
//! [`QueryService`] lives for the whole process and owns the cross-request
//! search cache. Each request opens a [`RequestScope`] that memoizes store
//! reads so a handler asking for the same year or range twice hits the store
//! once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use mof_core::stats::{borough_stats, scorecards, BoroughScorecard, BoroughStats, DEFAULT_TARGET_DAYS};
use mof_core::{Contract, DateRange, IngestionRun};
use mof_datasets::areas::borough_slug;
use mof_datasets::{parse_amount_text, Normalizer};
use mof_storage::{
    AmountBound, AmountBounds, AreaAttribute, ContractFilter, SearchSort, Store, StoreResult,
};
use serde::Serialize;
use tracing::debug;

use crate::cache::{CacheStats, Clock, SystemClock, TtlCache};
use crate::forensics::{
    self, ContractStats, RoundNumberCluster, SplitCluster, SupplierGrowth, ThresholdCluster,
};

pub const SEARCH_CACHE_CAPACITY: usize = 200;
pub const SEARCH_CACHE_TTL: Duration = Duration::from_secs(300);
pub const PAGE_SIZE: i64 = 25;
/// Half-width of the window a bare amount matches.
pub const AMOUNT_TOLERANCE: f64 = 0.05;

/// Parsed form of the free-text search box. Keywords and amount patterns are
/// mutually exclusive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SearchQuery {
    All,
    Keywords(Vec<String>),
    Amount(AmountBounds),
}

impl SearchQuery {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return SearchQuery::All;
        }
        parse_amount_pattern(trimmed)
            .map(SearchQuery::Amount)
            .unwrap_or_else(|| {
                SearchQuery::Keywords(trimmed.split_whitespace().map(str::to_string).collect())
            })
    }

    fn filter(&self) -> ContractFilter {
        match self {
            SearchQuery::All => ContractFilter::All,
            SearchQuery::Keywords(words) => ContractFilter::Keywords(words.clone()),
            SearchQuery::Amount(bounds) => ContractFilter::Amount(*bounds),
        }
    }
}

fn bound(value: f64, inclusive: bool) -> Option<AmountBound> {
    Some(AmountBound { value, inclusive })
}

fn parse_amount_pattern(raw: &str) -> Option<AmountBounds> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    for (prefix, lower, inclusive) in [(">=", true, true), ("<=", false, true), (">", true, false), ("<", false, false)] {
        if let Some(rest) = compact.strip_prefix(prefix) {
            let value = parse_amount_text(rest)?;
            return Some(if lower {
                AmountBounds { min: bound(value, inclusive), max: None }
            } else {
                AmountBounds { min: None, max: bound(value, inclusive) }
            });
        }
    }

    if let Some((low, high)) = compact.split_once('-') {
        let (a, b) = (parse_amount_text(low)?, parse_amount_text(high)?);
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        return Some(AmountBounds { min: bound(low, true), max: bound(high, true) });
    }

    let value = parse_amount_text(&compact)?;
    Some(AmountBounds {
        min: bound(value * (1.0 - AMOUNT_TOLERANCE), true),
        max: bound(value * (1.0 + AMOUNT_TOLERANCE), true),
    })
}

/// Cache key. The query is kept as normalized text since parsed amount
/// bounds are floats.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchKey {
    pub range: DateRange,
    pub query: String,
    pub page: u32,
    pub sort: SearchSort,
}

impl SearchKey {
    pub fn new(range: DateRange, raw_query: &str, page: u32, sort: SearchSort) -> Self {
        Self {
            range,
            query: raw_query.split_whitespace().collect::<Vec<_>>().join(" "),
            page: page.max(1),
            sort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub total: i64,
    pub page: u32,
    pub page_size: i64,
    pub query: SearchQuery,
    pub sort: SearchSort,
    pub contracts: Vec<Contract>,
}

impl SearchPage {
    pub fn page_count(&self) -> i64 {
        (self.total + self.page_size - 1) / self.page_size
    }
}

pub struct QueryService {
    store: Store,
    search_cache: TtlCache<SearchKey, SearchPage>,
    target_days: f64,
    normalizer: Normalizer,
}

impl QueryService {
    pub fn new(store: Store) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            search_cache: TtlCache::new(SEARCH_CACHE_CAPACITY, SEARCH_CACHE_TTL, clock),
            target_days: DEFAULT_TARGET_DAYS,
            normalizer: Normalizer::builtin(),
        }
    }

    /// Alias tables used to resolve raw area spellings.
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_target_days(mut self, target_days: f64) -> Self {
        self.target_days = target_days;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn target_days(&self) -> f64 {
        self.target_days
    }

    pub fn search_cache_stats(&self) -> CacheStats {
        self.search_cache.stats()
    }

    /// Call after a load so searches see fresh rows before their TTL runs out.
    pub fn invalidate_search_cache(&self) {
        self.search_cache.clear();
    }

    pub fn request(&self) -> RequestScope<'_> {
        RequestScope {
            service: self,
            borough_stats: HashMap::new(),
            contracts: HashMap::new(),
            contract_stats: HashMap::new(),
            store_reads: 0,
        }
    }
}

/// Per-request memo over the store. Not shared between requests.
pub struct RequestScope<'a> {
    service: &'a QueryService,
    borough_stats: HashMap<i32, Arc<Vec<BoroughStats>>>,
    contracts: HashMap<DateRange, Arc<Vec<Contract>>>,
    contract_stats: HashMap<DateRange, Arc<ContractStats>>,
    store_reads: usize,
}

impl RequestScope<'_> {
    /// Number of store round trips this scope has made.
    pub fn store_reads(&self) -> usize {
        self.store_reads
    }

    async fn stats_for_year(&mut self, year: i32) -> StoreResult<Arc<Vec<BoroughStats>>> {
        if let Some(hit) = self.borough_stats.get(&year) {
            return Ok(hit.clone());
        }
        self.store_reads += 1;
        let permits = self.service.store.permits_for_year(year).await?;
        let stats = Arc::new(borough_stats(&permits, year, self.service.target_days));
        self.borough_stats.insert(year, stats.clone());
        Ok(stats)
    }

    async fn contracts(&mut self, range: &DateRange) -> StoreResult<Arc<Vec<Contract>>> {
        if let Some(hit) = self.contracts.get(range) {
            return Ok(hit.clone());
        }
        self.store_reads += 1;
        let contracts = Arc::new(self.service.store.contracts_in_range(range).await?);
        debug!(%range, rows = contracts.len(), "loaded contracts");
        self.contracts.insert(*range, contracts.clone());
        Ok(contracts)
    }

    pub async fn borough_stats(&mut self, year: i32) -> StoreResult<Vec<BoroughStats>> {
        Ok(self.stats_for_year(year).await?.as_ref().clone())
    }

    /// Scorecards for `year`, trended against `year - 1`.
    pub async fn borough_scorecards(&mut self, year: i32) -> StoreResult<Vec<BoroughScorecard>> {
        let current = self.stats_for_year(year).await?;
        let previous = self.stats_for_year(year - 1).await?;
        Ok(scorecards(current.as_ref().clone(), &previous, self.service.target_days))
    }

    pub async fn contract_stats(&mut self, range: &DateRange) -> StoreResult<ContractStats> {
        if let Some(hit) = self.contract_stats.get(range) {
            return Ok(hit.as_ref().clone());
        }
        let contracts = self.contracts(range).await?;
        let stats = Arc::new(forensics::contract_stats(range, &contracts));
        self.contract_stats.insert(*range, stats.clone());
        Ok(stats.as_ref().clone())
    }

    /// One page of contracts. Pages are 1-based and shared across requests
    /// through the service's TTL cache.
    pub async fn search(
        &mut self,
        range: &DateRange,
        raw_query: &str,
        page: u32,
        sort: SearchSort,
    ) -> StoreResult<SearchPage> {
        let key = SearchKey::new(*range, raw_query, page, sort);
        if let Some(hit) = self.service.search_cache.get(&key) {
            return Ok(hit);
        }

        let query = SearchQuery::parse(&key.query);
        let offset = i64::from(key.page - 1) * PAGE_SIZE;
        self.store_reads += 1;
        let found = self
            .service
            .store
            .search_contracts(range, &query.filter(), sort, PAGE_SIZE, offset)
            .await?;
        let page = SearchPage {
            total: found.total,
            page: key.page,
            page_size: PAGE_SIZE,
            query,
            sort,
            contracts: found.contracts,
        };
        self.service.search_cache.insert(key, page.clone());
        Ok(page)
    }

    pub async fn threshold_clustering(&mut self, range: &DateRange) -> StoreResult<Vec<ThresholdCluster>> {
        let contracts = self.contracts(range).await?;
        Ok(forensics::threshold_clustering(range, &contracts))
    }

    pub async fn split_detection(&mut self, range: &DateRange, top_n: usize) -> StoreResult<Vec<SplitCluster>> {
        let contracts = self.contracts(range).await?;
        Ok(forensics::split_detection(range, &contracts, top_n))
    }

    pub async fn round_numbers(&mut self, range: &DateRange) -> StoreResult<Vec<RoundNumberCluster>> {
        let contracts = self.contracts(range).await?;
        Ok(forensics::round_numbers(range, &contracts))
    }

    pub async fn growth(&mut self, range: &DateRange, top_n: usize) -> StoreResult<Vec<SupplierGrowth>> {
        let contracts = self.contracts(range).await?;
        Ok(forensics::growth(range, &contracts, top_n))
    }

    pub async fn recent_runs(&mut self, limit: i64) -> StoreResult<Vec<IngestionRun>> {
        self.store_reads += 1;
        self.service.store.recent_runs(None, limit).await
    }

    /// Population in effect on `as_of`. Unknown slugs are treated as raw
    /// spellings: normalized like dataset borough names, then matched to a
    /// borough or looked up in the alias table.
    pub async fn area_population(&mut self, slug: &str, as_of: NaiveDate) -> StoreResult<Option<AreaAttribute>> {
        self.store_reads += 1;
        if let Some(found) = self.service.store.area_population(slug, as_of).await? {
            return Ok(Some(found));
        }
        let canonical = self.service.normalizer.normalize_area(slug);
        let resolved = match borough_slug(&canonical) {
            Some(found) => Some(found.to_string()),
            None => {
                self.store_reads += 1;
                self.service.store.resolve_area_alias(&canonical).await?
            }
        };
        match resolved {
            Some(resolved) if resolved != slug => {
                self.store_reads += 1;
                self.service.store.area_population(&resolved, as_of).await
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use chrono::NaiveDate;
    use mof_core::Permit;
    use mof_storage::Batch;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn year(y: i32) -> DateRange {
        DateRange::calendar_year(y).unwrap()
    }

    fn permit(id: i64, borough: &str, applied: &str, days: i64) -> Permit {
        let applied = date(applied);
        Permit {
            id,
            external_id: None,
            permit_number: None,
            borough_raw: borough.to_string(),
            borough: borough.to_string(),
            application_date: Some(applied),
            issue_date: Some(applied + chrono::Duration::days(days)),
            processing_days: Some(days),
            type_code: "CO".to_string(),
            type_description: None,
            building_type: None,
            building_category: None,
            work_nature: None,
            address: None,
            housing_units: None,
            latitude: None,
            longitude: None,
        }
    }

    fn contract(id: i64, supplier: &str, approved: &str, amount: f64) -> Contract {
        Contract {
            id,
            source: "executive-committee".to_string(),
            supplier_raw: supplier.to_string(),
            supplier: supplier.to_uppercase(),
            approval_date: approved.to_string(),
            department: Some("Service de l'eau".to_string()),
            description: Some("Réfection de conduites".to_string()),
            amount: Some(amount),
        }
    }

    async fn seeded(clock: Arc<dyn Clock>) -> QueryService {
        let store = Store::open_in_memory().await.unwrap();
        store
            .write_batch(&Batch {
                run_id: None,
                permits: vec![
                    permit(1, "Verdun", "2023-02-01", 80),
                    permit(2, "Verdun", "2024-02-01", 60),
                    permit(3, "Verdun", "2024-03-01", 70),
                ],
                contracts: vec![
                    contract(10, "Pavages ABC", "2024-01-10", 24_000.0),
                    contract(11, "Pavages ABC", "2024-01-20", 23_500.0),
                    contract(12, "Pavages ABC", "2024-01-30", 22_000.0),
                    contract(13, "Béton Sud", "2024-05-02", 150_000.0),
                ],
            })
            .await
            .unwrap();
        QueryService::with_clock(store, clock)
    }

    #[test]
    fn search_text_parses_into_exclusive_forms() {
        assert_eq!(SearchQuery::parse("  "), SearchQuery::All);
        assert_eq!(
            SearchQuery::parse("pavage  asphalte"),
            SearchQuery::Keywords(vec!["pavage".into(), "asphalte".into()])
        );
        assert_eq!(
            SearchQuery::parse("Hydro-Québec"),
            SearchQuery::Keywords(vec!["Hydro-Québec".into()])
        );
        assert_eq!(
            SearchQuery::parse(">25000"),
            SearchQuery::Amount(AmountBounds { min: bound(25_000.0, false), max: None })
        );
        assert_eq!(
            SearchQuery::parse("<= 10 000"),
            SearchQuery::Amount(AmountBounds { min: None, max: bound(10_000.0, true) })
        );
        assert_eq!(
            SearchQuery::parse("20000-10000"),
            SearchQuery::Amount(AmountBounds { min: bound(10_000.0, true), max: bound(20_000.0, true) })
        );

        let SearchQuery::Amount(around) = SearchQuery::parse("25000") else {
            panic!("bare number should be an amount");
        };
        assert!((around.min.unwrap().value - 23_750.0).abs() < 1e-6);
        assert!((around.max.unwrap().value - 26_250.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn request_scope_memoizes_store_reads() {
        let service = seeded(Arc::new(SystemClock)).await;
        let mut scope = service.request();

        let first = scope.borough_stats(2024).await.unwrap();
        let again = scope.borough_stats(2024).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(scope.store_reads(), 1);

        let cards = scope.borough_scorecards(2024).await.unwrap();
        assert_eq!(scope.store_reads(), 2);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].previous_median_days, Some(80.0));

        let range = year(2024);
        scope.contract_stats(&range).await.unwrap();
        scope.threshold_clustering(&range).await.unwrap();
        scope.split_detection(&range, 50).await.unwrap();
        scope.round_numbers(&range).await.unwrap();
        scope.growth(&range, 50).await.unwrap();
        assert_eq!(scope.store_reads(), 3);

        let mut fresh = service.request();
        fresh.borough_stats(2024).await.unwrap();
        assert_eq!(fresh.store_reads(), 1);
    }

    #[tokio::test]
    async fn search_cache_hits_within_ttl_and_misses_after() {
        let clock = Arc::new(ManualClock::default());
        let service = seeded(clock.clone()).await;
        let range = year(2024);

        let page = service
            .request()
            .search(&range, "pavages", 1, SearchSort::DateAsc)
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.contracts[0].id, 10);

        clock.advance(Duration::from_secs(4 * 60));
        let mut scope = service.request();
        scope.search(&range, " pavages ", 1, SearchSort::DateAsc).await.unwrap();
        assert_eq!(scope.store_reads(), 0);
        assert_eq!(service.search_cache_stats().hits, 1);

        clock.advance(Duration::from_secs(2 * 60));
        let mut scope = service.request();
        scope.search(&range, "pavages", 1, SearchSort::DateAsc).await.unwrap();
        assert_eq!(scope.store_reads(), 1);
        assert_eq!(service.search_cache_stats().expired, 1);
    }

    #[tokio::test]
    async fn amount_search_uses_the_tolerance_window() {
        let service = seeded(Arc::new(SystemClock)).await;
        let page = service
            .request()
            .search(&year(2024), "24000", 1, SearchSort::AmountDesc)
            .await
            .unwrap();
        let ids: Vec<i64> = page.contracts.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![10, 11]);
        assert_eq!(page.page_count(), 1);
    }

    #[tokio::test]
    async fn area_population_resolves_aliases() {
        let service = seeded(Arc::new(SystemClock)).await;
        let mut scope = service.request();
        let direct = scope.area_population("verdun", date("2024-01-01")).await.unwrap();
        assert!(direct.is_some());
        assert_eq!(scope.area_population("nowhere", date("2024-01-01")).await.unwrap(), None);
        let alias = scope.area_population("CDN-NDG", date("2024-01-01")).await.unwrap().expect("alias");
        assert_eq!(alias.slug, "cote-des-neiges-notre-dame-de-grace");
    }

    #[tokio::test]
    async fn area_population_folds_case_accents_and_dashes() {
        let service = seeded(Arc::new(SystemClock)).await;
        let mut scope = service.request();
        let as_of = date("2024-01-01");

        let upper = scope.area_population("VERDUN", as_of).await.unwrap().expect("upper case");
        assert_eq!(upper.slug, "verdun");
        assert_eq!(upper.value, 69_229.0);

        let folded = scope
            .area_population("cote-des-neiges\u{2014}notre-dame-de-grace", as_of)
            .await
            .unwrap()
            .expect("em dash, no accents");
        assert_eq!(folded.slug, "cote-des-neiges-notre-dame-de-grace");

        let spaced = scope.area_population("  Le  Plateau-Mont-Royal ", as_of).await.unwrap();
        assert_eq!(spaced.map(|a| a.slug).as_deref(), Some("le-plateau-mont-royal"));
    }
}
