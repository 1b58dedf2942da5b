//! Procurement anomaly detectors.
//!
//! Every detector is a pure function of a caller date range and a contract
//! slice. Contracts outside the range, or without a valid approval date or a
//! finite amount, are ignored.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use mof_core::stats::{mean, median, sorted_finite};
use mof_core::{Contract, DateRange};
use serde::Serialize;

/// Contracts under this amount need no formal tender process.
pub const FLOOR_THRESHOLD: f64 = 25_000.0;
pub const FLOOR_BAND: f64 = 5_000.0;
pub const ERA_BAND: f64 = 10_000.0;

/// Flag when just-below holds at least this many contracts...
pub const MIN_BELOW_COUNT: usize = 3;
/// ...and at least this multiple of the just-above count.
pub const BELOW_ABOVE_RATIO: f64 = 1.5;

pub const SPLIT_BAND_LOW: f64 = 15_000.0;
pub const SPLIT_MAX_GAP_DAYS: i64 = 90;
pub const SPLIT_PAIR_SPAN_DAYS: i64 = 60;
pub const SPLIT_MIN_CLUSTER: usize = 3;

pub const GROWTH_MATERIALITY: f64 = 100_000.0;

pub const DEFAULT_TOP_N: usize = 50;

/// Distance under a threshold of the amounts treated as suspiciously round.
pub const ROUND_OFFSETS: &[f64] = &[1.0, 10.0, 50.0, 100.0, 500.0, 1_000.0];

/// A period during which one mandatory-tender threshold applied. `to` is
/// exclusive; `None` means still in force.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdEra {
    pub from: NaiveDate,
    pub to: Option<NaiveDate>,
    pub threshold: f64,
    pub band: f64,
}

impl ThresholdEra {
    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && self.to.map_or(true, |to| date < to)
    }

    fn overlaps(&self, range: &DateRange) -> bool {
        self.from <= range.to && self.to.map_or(true, |to| to > range.from)
    }
}

/// `(from, to, threshold)` with `to` exclusive, oldest first.
const ERA_TABLE: &[((i32, u32, u32), Option<(i32, u32, u32)>, f64)] = &[
    ((2000, 1, 1), Some((2018, 4, 19)), 100_000.0),
    ((2018, 4, 19), Some((2021, 1, 1)), 101_100.0),
    ((2021, 1, 1), Some((2024, 1, 1)), 105_700.0),
    ((2024, 1, 1), None, 121_200.0),
];

static THRESHOLD_ERAS: LazyLock<Vec<ThresholdEra>> = LazyLock::new(|| {
    let date = |(y, m, d): (i32, u32, u32)| NaiveDate::from_ymd_opt(y, m, d);
    ERA_TABLE
        .iter()
        .filter_map(|&(from, to, threshold)| {
            Some(ThresholdEra {
                from: date(from)?,
                to: match to {
                    Some(to) => Some(date(to)?),
                    None => None,
                },
                threshold,
                band: ERA_BAND,
            })
        })
        .collect()
});

/// Quebec municipal tender thresholds, oldest first.
pub fn threshold_eras() -> &'static [ThresholdEra] {
    &THRESHOLD_ERAS
}

pub fn era_for(date: NaiveDate) -> Option<&'static ThresholdEra> {
    threshold_eras().iter().find(|era| era.contains(date))
}

fn dated_in_range<'a>(range: &'a DateRange, contracts: &'a [Contract]) -> impl Iterator<Item = (&'a Contract, NaiveDate, f64)> {
    contracts.iter().filter_map(move |c| {
        let (date, amount) = c.dated_amount()?;
        range.contains(date).then_some((c, date, amount))
    })
}

fn is_flagged(below: usize, above: usize) -> bool {
    below >= MIN_BELOW_COUNT && below as f64 >= BELOW_ABOVE_RATIO * above as f64
}

fn ratio(below: usize, above: usize) -> Option<f64> {
    (above > 0).then(|| below as f64 / above as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdCluster {
    pub label: String,
    pub threshold: f64,
    pub band: f64,
    pub era_from: Option<NaiveDate>,
    pub era_to: Option<NaiveDate>,
    pub below_count: usize,
    pub below_total: f64,
    pub above_count: usize,
    pub above_total: f64,
    pub below_above_ratio: Option<f64>,
    pub flagged: bool,
}

/// The floor threshold over the whole range, then each era overlapping it
/// over only the contracts dated inside that era.
pub fn threshold_clustering(range: &DateRange, contracts: &[Contract]) -> Vec<ThresholdCluster> {
    let dated: Vec<(NaiveDate, f64)> = dated_in_range(range, contracts).map(|(_, d, a)| (d, a)).collect();

    let window = |label: String, threshold: f64, band: f64, era: Option<&ThresholdEra>| {
        let in_era = |date: NaiveDate| era.map_or(true, |e| e.contains(date));
        let (mut below_count, mut below_total, mut above_count, mut above_total) = (0, 0.0, 0, 0.0);
        for &(_, amount) in dated.iter().filter(|(date, _)| in_era(*date)) {
            if amount >= threshold - band && amount < threshold {
                below_count += 1;
                below_total += amount;
            } else if amount >= threshold && amount < threshold + band {
                above_count += 1;
                above_total += amount;
            }
        }
        ThresholdCluster {
            label,
            threshold,
            band,
            era_from: era.map(|e| e.from),
            era_to: era.and_then(|e| e.to),
            below_count,
            below_total,
            above_count,
            above_total,
            below_above_ratio: ratio(below_count, above_count),
            flagged: is_flagged(below_count, above_count),
        }
    };

    let mut out = vec![window("floor".to_string(), FLOOR_THRESHOLD, FLOOR_BAND, None)];
    for era in threshold_eras().iter().filter(|era| era.overlaps(range)) {
        out.push(window(format!("era-{}", era.from), era.threshold, era.band, Some(era)));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusteredContract {
    pub id: i64,
    pub date: NaiveDate,
    pub amount: f64,
    pub department: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitCluster {
    pub supplier: String,
    pub contract_count: usize,
    pub total: f64,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub span_days: i64,
    pub contracts: Vec<ClusteredContract>,
}

/// Groups sub-floor contracts per supplier into runs with gaps of at most
/// [`SPLIT_MAX_GAP_DAYS`], keeping runs that look like one divided contract.
pub fn split_detection(range: &DateRange, contracts: &[Contract], top_n: usize) -> Vec<SplitCluster> {
    let mut by_supplier: BTreeMap<&str, Vec<ClusteredContract>> = BTreeMap::new();
    for (c, date, amount) in dated_in_range(range, contracts) {
        if c.supplier.is_empty() || !(SPLIT_BAND_LOW..FLOOR_THRESHOLD).contains(&amount) {
            continue;
        }
        by_supplier.entry(c.supplier.as_str()).or_default().push(ClusteredContract {
            id: c.id,
            date,
            amount,
            department: c.department.clone(),
            description: c.description.clone(),
        });
    }

    let mut flagged = Vec::new();
    for (supplier, mut rows) in by_supplier {
        rows.sort_by(|a, b| a.date.cmp(&b.date).then(a.id.cmp(&b.id)));
        let mut current: Vec<ClusteredContract> = Vec::new();
        for row in rows {
            let breaks = current
                .last()
                .is_some_and(|last| (row.date - last.date).num_days() > SPLIT_MAX_GAP_DAYS);
            if breaks {
                flagged.extend(finish_cluster(supplier, std::mem::take(&mut current)));
            }
            current.push(row);
        }
        flagged.extend(finish_cluster(supplier, current));
    }

    flagged.sort_by(|a, b| b.total.total_cmp(&a.total).then_with(|| a.supplier.cmp(&b.supplier)));
    flagged.truncate(top_n);
    flagged
}

fn finish_cluster(supplier: &str, contracts: Vec<ClusteredContract>) -> Option<SplitCluster> {
    let first_date = contracts.first()?.date;
    let last_date = contracts.last()?.date;
    let span_days = (last_date - first_date).num_days();
    let total: f64 = contracts.iter().map(|c| c.amount).sum();
    let count = contracts.len();
    let suspicious = count >= SPLIT_MIN_CLUSTER
        || (count >= 2 && total > FLOOR_THRESHOLD && span_days <= SPLIT_PAIR_SPAN_DAYS);
    suspicious.then(|| SplitCluster {
        supplier: supplier.to_string(),
        contract_count: count,
        total,
        first_date,
        last_date,
        span_days,
        contracts,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundAmountCount {
    pub amount: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundNumberCluster {
    pub label: String,
    pub threshold: f64,
    pub band: f64,
    /// Exact hits on each curated amount under the threshold.
    pub below: Vec<RoundAmountCount>,
    pub below_count: usize,
    /// Every contract in `[threshold, threshold + band)`.
    pub above_count: usize,
    pub flagged: bool,
}

/// Exact hits on round amounts just under each threshold against the whole
/// just-above band. A fair market spreads over the band; steering piles up on
/// a few round figures under the line.
pub fn round_numbers(range: &DateRange, contracts: &[Contract]) -> Vec<RoundNumberCluster> {
    let dated: Vec<(NaiveDate, f64)> = dated_in_range(range, contracts).map(|(_, d, a)| (d, a)).collect();

    let cluster = |label: String, threshold: f64, band: f64, era: Option<&ThresholdEra>| {
        let amounts: Vec<f64> = dated
            .iter()
            .filter(|(date, _)| era.map_or(true, |e| e.contains(*date)))
            .map(|(_, amount)| *amount)
            .collect();
        let below: Vec<RoundAmountCount> = ROUND_OFFSETS
            .iter()
            .map(|o| {
                let target = threshold - o;
                RoundAmountCount {
                    amount: target,
                    count: amounts.iter().filter(|a| (**a - target).abs() < 0.005).count(),
                }
            })
            .collect();
        let below_count = below.iter().map(|r| r.count).sum();
        let above_count = amounts
            .iter()
            .filter(|a| **a >= threshold && **a < threshold + band)
            .count();
        RoundNumberCluster {
            label,
            threshold,
            band,
            below,
            below_count,
            above_count,
            flagged: is_flagged(below_count, above_count),
        }
    };

    let mut out = vec![cluster("floor".to_string(), FLOOR_THRESHOLD, FLOOR_BAND, None)];
    for era in threshold_eras().iter().filter(|era| era.overlaps(range)) {
        out.push(cluster(format!("era-{}", era.from), era.threshold, era.band, Some(era)));
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplierGrowth {
    pub supplier: String,
    pub early_total: f64,
    pub late_total: f64,
    pub early_count: usize,
    pub late_count: usize,
    pub growth_pct: f64,
}

/// Splits the range at its midpoint; suppliers material in both halves,
/// fastest growing first.
pub fn growth(range: &DateRange, contracts: &[Contract], top_n: usize) -> Vec<SupplierGrowth> {
    let midpoint = range.midpoint();
    let mut totals: BTreeMap<&str, (f64, usize, f64, usize)> = BTreeMap::new();
    for (c, date, amount) in dated_in_range(range, contracts) {
        if c.supplier.is_empty() {
            continue;
        }
        let entry = totals.entry(c.supplier.as_str()).or_default();
        if date < midpoint {
            entry.0 += amount;
            entry.1 += 1;
        } else {
            entry.2 += amount;
            entry.3 += 1;
        }
    }

    let mut out: Vec<SupplierGrowth> = totals
        .into_iter()
        .filter(|(_, (early, _, late, _))| *early > GROWTH_MATERIALITY && *late > GROWTH_MATERIALITY)
        .map(|(supplier, (early_total, early_count, late_total, late_count))| SupplierGrowth {
            supplier: supplier.to_string(),
            early_total,
            late_total,
            early_count,
            late_count,
            growth_pct: (late_total - early_total) / early_total * 100.0,
        })
        .collect();
    out.sort_by(|a, b| b.growth_pct.total_cmp(&a.growth_pct).then_with(|| a.supplier.cmp(&b.supplier)));
    out.truncate(top_n);
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceTotal {
    pub source: String,
    pub contract_count: usize,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplierTotal {
    pub supplier: String,
    pub contract_count: usize,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractStats {
    pub range: DateRange,
    pub contract_count: usize,
    /// Contracts in range whose amount could not be read.
    pub unpriced_count: usize,
    pub total_value: f64,
    pub median_amount: f64,
    pub avg_amount: f64,
    pub by_source: Vec<SourceTotal>,
    pub top_suppliers: Vec<SupplierTotal>,
}

pub const TOP_SUPPLIERS: usize = 10;

pub fn contract_stats(range: &DateRange, contracts: &[Contract]) -> ContractStats {
    let in_range: Vec<&Contract> = contracts
        .iter()
        .filter(|c| c.approval_date().is_some_and(|d| range.contains(d)))
        .collect();
    let priced: Vec<(&Contract, f64)> = in_range
        .iter()
        .filter_map(|c| c.amount.filter(|a| a.is_finite()).map(|a| (*c, a)))
        .collect();
    let amounts = sorted_finite(priced.iter().map(|(_, a)| *a).collect());

    let mut sources: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
    let mut suppliers: BTreeMap<&str, (usize, f64)> = BTreeMap::new();
    for (c, amount) in &priced {
        let s = sources.entry(c.source.as_str()).or_default();
        s.0 += 1;
        s.1 += amount;
        if !c.supplier.is_empty() {
            let s = suppliers.entry(c.supplier.as_str()).or_default();
            s.0 += 1;
            s.1 += amount;
        }
    }

    let mut top_suppliers: Vec<SupplierTotal> = suppliers
        .into_iter()
        .map(|(supplier, (contract_count, total))| SupplierTotal {
            supplier: supplier.to_string(),
            contract_count,
            total,
        })
        .collect();
    top_suppliers.sort_by(|a, b| b.total.total_cmp(&a.total).then_with(|| a.supplier.cmp(&b.supplier)));
    top_suppliers.truncate(TOP_SUPPLIERS);

    ContractStats {
        range: *range,
        contract_count: in_range.len(),
        unpriced_count: in_range.len() - priced.len(),
        total_value: amounts.iter().sum(),
        median_amount: median(&amounts),
        avg_amount: mean(&amounts),
        by_source: sources
            .into_iter()
            .map(|(source, (contract_count, total))| SourceTotal {
                source: source.to_string(),
                contract_count,
                total,
            })
            .collect(),
        top_suppliers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn contract(id: i64, supplier: &str, date: NaiveDate, amount: f64) -> Contract {
        Contract {
            id,
            source: "officials".to_string(),
            supplier_raw: supplier.to_string(),
            supplier: supplier.to_string(),
            approval_date: date.format("%Y-%m-%d").to_string(),
            department: None,
            description: None,
            amount: Some(amount),
        }
    }

    fn range(from: NaiveDate, to: NaiveDate) -> DateRange {
        DateRange::new(from, to)
    }

    #[test]
    fn three_contracts_ten_days_apart_form_one_cluster() {
        let start = d(2024, 3, 1);
        let contracts: Vec<Contract> = [0, 10, 20]
            .iter()
            .enumerate()
            .map(|(i, days)| contract(i as i64, "ACME", start + chrono::Duration::days(*days), 20_000.0))
            .collect();

        let clusters = split_detection(&range(d(2024, 1, 1), d(2024, 12, 31)), &contracts, DEFAULT_TOP_N);

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].contract_count, 3);
        assert_eq!(clusters[0].total, 60_000.0);
        assert_eq!(clusters[0].span_days, 20);
    }

    #[test]
    fn distant_pair_is_not_a_cluster() {
        let start = d(2024, 1, 1);
        let contracts = vec![
            contract(1, "ACME", start, 20_000.0),
            contract(2, "ACME", start + chrono::Duration::days(200), 20_000.0),
        ];
        assert!(split_detection(&range(d(2024, 1, 1), d(2024, 12, 31)), &contracts, DEFAULT_TOP_N).is_empty());
    }

    #[test]
    fn close_pair_over_the_floor_is_flagged_but_cheap_pair_is_not() {
        let start = d(2024, 5, 1);
        let contracts = vec![
            contract(1, "ACME", start, 15_000.0),
            contract(2, "ACME", start + chrono::Duration::days(30), 15_000.0),
            contract(3, "BETA", start, 7_000.0),
            contract(4, "BETA", start, 16_000.0),
            contract(5, "GAMMA", start, 20_000.0),
            contract(6, "GAMMA", start + chrono::Duration::days(75), 20_000.0),
        ];
        let clusters = split_detection(&range(d(2024, 1, 1), d(2024, 12, 31)), &contracts, DEFAULT_TOP_N);
        let suppliers: Vec<&str> = clusters.iter().map(|c| c.supplier.as_str()).collect();
        assert_eq!(suppliers, vec!["ACME"]);
    }

    #[test]
    fn split_results_rank_by_total_and_cap() {
        let start = d(2024, 2, 1);
        let mut contracts = Vec::new();
        for (n, supplier) in ["A", "B", "C"].iter().enumerate() {
            for i in 0..3 {
                contracts.push(contract(
                    (n * 10 + i) as i64,
                    supplier,
                    start + chrono::Duration::days(i as i64),
                    16_000.0 + n as f64 * 1_000.0,
                ));
            }
        }
        let clusters = split_detection(&range(d(2024, 1, 1), d(2024, 12, 31)), &contracts, 2);
        let suppliers: Vec<&str> = clusters.iter().map(|c| c.supplier.as_str()).collect();
        assert_eq!(suppliers, vec!["C", "B"]);
    }

    #[test]
    fn era_boundary_date_belongs_to_the_next_era() {
        let boundary = d(2018, 4, 19);
        assert_eq!(era_for(boundary).unwrap().threshold, 101_100.0);
        assert_eq!(era_for(d(2018, 4, 18)).unwrap().threshold, 100_000.0);
        assert_eq!(era_for(d(2030, 1, 1)).unwrap().threshold, 121_200.0);

        let contracts = vec![contract(1, "ACME", boundary, 95_000.0)];
        let clusters = threshold_clustering(&range(d(2018, 1, 1), d(2018, 12, 31)), &contracts);
        let closing = clusters.iter().find(|c| c.threshold == 100_000.0).unwrap();
        let next = clusters.iter().find(|c| c.threshold == 101_100.0).unwrap();
        assert_eq!(closing.below_count, 0);
        assert_eq!(next.below_count, 1);
    }

    #[test]
    fn floor_is_always_evaluated_and_flags_bunching() {
        let day = d(2022, 6, 1);
        let mut contracts: Vec<Contract> = (0..4).map(|i| contract(i, "ACME", day, 24_500.0)).collect();
        contracts.push(contract(10, "BETA", day, 26_000.0));
        contracts.push(contract(11, "BETA", day, 31_000.0));

        let clusters = threshold_clustering(&range(d(2022, 1, 1), d(2022, 12, 31)), &contracts);

        assert_eq!(clusters.len(), 2);
        let floor = &clusters[0];
        assert_eq!(floor.label, "floor");
        assert_eq!(floor.below_count, 4);
        assert_eq!(floor.above_count, 1);
        assert_eq!(floor.below_total, 98_000.0);
        assert!(floor.flagged);
        assert_eq!(clusters[1].threshold, 105_700.0);
        assert!(!clusters[1].flagged);
    }

    #[test]
    fn unparseable_dates_and_amounts_are_skipped() {
        let mut bad_date = contract(1, "ACME", d(2022, 1, 1), 24_000.0);
        bad_date.approval_date = "2022/01/01".into();
        let mut no_amount = contract(2, "ACME", d(2022, 1, 1), 0.0);
        no_amount.amount = None;
        let stats = contract_stats(&range(d(2022, 1, 1), d(2022, 12, 31)), &[bad_date.clone(), no_amount.clone()]);
        assert_eq!(stats.contract_count, 1);
        assert_eq!(stats.unpriced_count, 1);
        assert_eq!(stats.total_value, 0.0);
        let floor = &threshold_clustering(&range(d(2022, 1, 1), d(2022, 12, 31)), &[bad_date, no_amount])[0];
        assert_eq!(floor.below_count, 0);
    }

    #[test]
    fn round_amounts_compare_against_the_band_above() {
        let day = d(2023, 3, 1);
        let contracts = vec![
            contract(1, "A", day, 24_999.0),
            contract(2, "B", day, 24_999.0),
            contract(3, "C", day, 24_900.0),
            contract(4, "D", day, 25_100.0),
            contract(5, "E", day, 24_998.0),
        ];
        let clusters = round_numbers(&range(d(2023, 1, 1), d(2023, 12, 31)), &contracts);
        let floor = &clusters[0];
        assert_eq!(floor.below_count, 3);
        assert_eq!(floor.above_count, 1);
        assert_eq!(floor.below[0], RoundAmountCount { amount: 24_999.0, count: 2 });
        assert!(floor.flagged);
    }

    #[test]
    fn round_amounts_are_not_flagged_when_the_band_above_is_busy() {
        let day = d(2023, 3, 1);
        let amounts = [24_999.0, 24_990.0, 24_900.0, 25_000.0, 25_200.0, 25_500.0, 26_000.0];
        let contracts: Vec<Contract> = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| contract(i as i64 + 1, "S", day, *amount))
            .collect();
        let clusters = round_numbers(&range(d(2023, 1, 1), d(2023, 12, 31)), &contracts);
        let floor = &clusters[0];
        assert_eq!(floor.band, FLOOR_BAND);
        assert_eq!(floor.below_count, 3);
        assert_eq!(floor.above_count, 4);
        assert!(!floor.flagged);
    }

    #[test]
    fn growth_requires_material_halves() {
        let r = range(d(2023, 1, 1), d(2024, 12, 31));
        let contracts = vec![
            contract(1, "STEADY", d(2023, 3, 1), 200_000.0),
            contract(2, "STEADY", d(2024, 3, 1), 300_000.0),
            contract(3, "ROCKET", d(2023, 3, 1), 150_000.0),
            contract(4, "ROCKET", d(2024, 6, 1), 600_000.0),
            contract(5, "NEWCOMER", d(2024, 6, 1), 900_000.0),
        ];
        let out = growth(&r, &contracts, DEFAULT_TOP_N);
        let names: Vec<&str> = out.iter().map(|g| g.supplier.as_str()).collect();
        assert_eq!(names, vec!["ROCKET", "STEADY"]);
        assert_eq!(out[0].growth_pct, 300.0);
        assert_eq!(out[1].growth_pct, 50.0);
    }

    #[test]
    fn contract_stats_summarise_sources_and_suppliers() {
        let day = d(2024, 1, 5);
        let mut council = contract(3, "BETA", day, 50_000.0);
        council.source = "city-council".into();
        let stats = contract_stats(
            &range(d(2024, 1, 1), d(2024, 1, 31)),
            &[contract(1, "ACME", day, 10_000.0), contract(2, "ACME", day, 20_000.0), council],
        );
        assert_eq!(stats.contract_count, 3);
        assert_eq!(stats.total_value, 80_000.0);
        assert_eq!(stats.median_amount, 20_000.0);
        assert_eq!(stats.top_suppliers[0].supplier, "BETA");
        assert_eq!(stats.by_source.len(), 2);
    }
}
