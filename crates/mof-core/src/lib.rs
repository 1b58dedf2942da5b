//! Core domain model for MOF: permits, contracts, ingestion runs and date ranges.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod stats;

pub const CRATE_NAME: &str = "mof-core";

/// Inclusive calendar date range supplied by callers of the read APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    /// Builds a range, swapping the bounds when they arrive reversed.
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        if from <= to {
            Self { from, to }
        } else {
            Self { from: to, to: from }
        }
    }

    pub fn calendar_year(year: i32) -> Option<Self> {
        Some(Self {
            from: NaiveDate::from_ymd_opt(year, 1, 1)?,
            to: NaiveDate::from_ymd_opt(year, 12, 31)?,
        })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.from && date <= self.to
    }

    pub fn span_days(&self) -> i64 {
        (self.to - self.from).num_days()
    }

    /// First day of the late half when the range is split in two.
    pub fn midpoint(&self) -> NaiveDate {
        self.from + chrono::Duration::days((self.span_days() + 1) / 2)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.from, self.to)
    }
}

/// Parses the leading `YYYY-MM-DD` of an upstream date or timestamp string.
pub fn parse_iso_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.trim().get(..10)?;
    let bytes = head.as_bytes();
    let shape_ok = bytes.iter().enumerate().all(|(i, b)| match i {
        4 | 7 => *b == b'-',
        _ => b.is_ascii_digit(),
    });
    if !shape_ok {
        return None;
    }
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Days between application and issuance; `None` when either is missing or the
/// difference is negative.
pub fn processing_days(application: Option<NaiveDate>, issued: Option<NaiveDate>) -> Option<i64> {
    let days = (issued? - application?).num_days();
    (days >= 0).then_some(days)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permit {
    pub id: i64,
    pub external_id: Option<String>,
    pub permit_number: Option<String>,
    pub borough_raw: String,
    pub borough: String,
    pub application_date: Option<NaiveDate>,
    pub issue_date: Option<NaiveDate>,
    pub processing_days: Option<i64>,
    pub type_code: String,
    pub type_description: Option<String>,
    pub building_type: Option<String>,
    pub building_category: Option<String>,
    pub work_nature: Option<String>,
    pub address: Option<String>,
    pub housing_units: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Permit {
    pub fn application_year(&self) -> Option<i32> {
        self.application_date.map(|d| d.year())
    }
}

/// Contract as persisted. `approval_date` keeps the upstream text so malformed
/// legacy rows stay visible to audits while every query filters them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: i64,
    pub source: String,
    pub supplier_raw: String,
    pub supplier: String,
    pub approval_date: String,
    pub department: Option<String>,
    pub description: Option<String>,
    pub amount: Option<f64>,
}

impl Contract {
    pub fn approval_date(&self) -> Option<NaiveDate> {
        parse_iso_date(&self.approval_date)
    }

    /// Date and amount when both validate; detectors skip everything else.
    pub fn dated_amount(&self) -> Option<(NaiveDate, f64)> {
        let amount = self.amount.filter(|a| a.is_finite())?;
        Some((self.approval_date()?, amount))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Incremental,
    Full,
    Year(i32),
}

impl LoadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadMode::Incremental => "incremental",
            LoadMode::Full => "full",
            LoadMode::Year(_) => "year",
        }
    }

    /// Years covered by the mode, ascending.
    pub fn years(&self, current_year: i32, full_start_year: i32) -> Vec<i32> {
        match *self {
            LoadMode::Incremental => vec![current_year - 1, current_year],
            LoadMode::Full => (full_start_year.min(current_year)..=current_year).collect(),
            LoadMode::Year(year) => vec![year],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status {other}")),
        }
    }
}

/// Row of the append-only `ingestion_runs` audit table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub run_id: Uuid,
    pub dataset: String,
    pub mode: String,
    pub rows_loaded: i64,
    pub status: RunStatus,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed { step: String, error: String },
}

/// What a loader invocation hands back to the orchestration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub dataset: String,
    pub mode: LoadMode,
    pub rows_loaded: u64,
    pub batches: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
}

impl RunSummary {
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Succeeded)
    }
}
