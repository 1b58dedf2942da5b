//! Declarative dataset configurations and row mapping into the MOF schema.
//!
//! Every upstream resource is described by a [`SourceSpec`]: where it lives,
//! which raw columns carry which field, and which identifier block it owns.
//! One generic loader consumes these records; there is no per-dataset code.

use std::path::Path;

use anyhow::{Context, Result};
use mof_core::{parse_iso_date, processing_days, Contract, Permit};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub mod areas;
pub mod normalize;

pub use normalize::{normalize_area, normalize_supplier, Normalizer};

pub const CRATE_NAME: &str = "mof-datasets";

pub const PERMITS_DATASET: &str = "permits";
pub const CONTRACTS_DATASET: &str = "contracts";

/// CKAN row identifier present in every datastore record.
pub const CKAN_ID_COLUMN: &str = "_id";

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("{source_key}: column `{column}` missing from upstream row")]
    MissingColumn { source_key: String, column: String },
    #[error("{source_key}: column `{column}` has unusable value {value}")]
    InvalidValue {
        source_key: String,
        column: String,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgePolicy {
    #[default]
    None,
    /// After a full load succeeds, delete rows of the source's identifier
    /// block that the load did not rewrite.
    BlockOnFull,
}

/// How the per-year filter is expressed against the date column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YearFilter {
    /// `EXTRACT(YEAR FROM col) = y` for timestamp-typed columns.
    #[default]
    Extract,
    /// Lexicographic range for text-typed ISO dates.
    TextRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermitColumns {
    pub external_id: String,
    pub permit_number: String,
    pub borough: String,
    pub application_date: String,
    pub issue_date: String,
    pub type_code: String,
    pub type_description: String,
    pub building_type: String,
    pub building_category: String,
    pub work_nature: String,
    pub address: String,
    pub housing_units: String,
    pub latitude: String,
    pub longitude: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractColumns {
    pub supplier: String,
    pub approval_date: String,
    pub department: String,
    pub description: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnMap {
    Permit(PermitColumns),
    Contract(ContractColumns),
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub key: String,
    pub display_name: String,
    pub resource_id: String,
    pub date_column: String,
    #[serde(default)]
    pub year_filter: YearFilter,
    pub id_offset: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub purge: PurgePolicy,
    /// Page the whole resource through `datastore_search` when the year's SQL
    /// query fails, keeping only rows dated in that year.
    #[serde(default)]
    pub paginated_fallback: bool,
    pub columns: ColumnMap,
}

/// Width of each source's identifier block.
pub const ID_BLOCK_SIZE: i64 = 1_000_000;

impl SourceSpec {
    /// Upstream SQL selecting one calendar year of this source.
    pub fn year_query(&self, year: i32) -> String {
        let resource = escape_identifier(&self.resource_id);
        let column = escape_identifier(&self.date_column);
        let filter = match self.year_filter {
            YearFilter::Extract => format!("EXTRACT(YEAR FROM \"{column}\") = {year}"),
            YearFilter::TextRange => format!(
                "\"{column}\" >= '{year}-01-01' AND \"{column}\" < '{next}-01-01'",
                next = year + 1
            ),
        };
        format!("SELECT * FROM \"{resource}\" WHERE {filter} ORDER BY \"{CKAN_ID_COLUMN}\"")
    }

    pub fn namespaced_id(&self, raw_id: i64) -> i64 {
        self.id_offset + raw_id
    }

    /// Whether sibling sources write to the same table, so raw ids must fit
    /// under `ID_BLOCK_SIZE`.
    pub fn shares_table(&self) -> bool {
        matches!(self.columns, ColumnMap::Contract(_))
    }

    /// Inclusive identifier bounds owned by this source. A source alone in its
    /// table owns everything from its offset up.
    pub fn id_block(&self) -> (i64, i64) {
        if self.shares_table() {
            (self.id_offset, self.id_offset + ID_BLOCK_SIZE - 1)
        } else {
            (self.id_offset, i64::MAX)
        }
    }

    /// Whether the row's date column falls in `year`, read from its leading
    /// `YYYY`.
    pub fn row_in_year(&self, row: &Map<String, JsonValue>, year: i32) -> bool {
        text(row, &self.date_column).is_some_and(|value| value.get(..4) == Some(year.to_string().as_str()))
    }

    pub fn map_row(&self, row: &Map<String, JsonValue>, normalizer: &Normalizer) -> Result<MappedRow, SchemaError> {
        let raw_id = self.required_i64(row, CKAN_ID_COLUMN)?;
        if raw_id < 0 || (self.shares_table() && raw_id >= ID_BLOCK_SIZE) {
            return Err(SchemaError::InvalidValue {
                source_key: self.key.clone(),
                column: CKAN_ID_COLUMN.to_string(),
                value: raw_id.to_string(),
            });
        }
        self.require_column(row, &self.date_column)?;
        let id = self.namespaced_id(raw_id);

        match &self.columns {
            ColumnMap::Permit(cols) => {
                let borough_raw = text(row, &cols.borough).unwrap_or_default();
                let application_date = text(row, &cols.application_date).and_then(|s| parse_iso_date(&s));
                let issue_date = text(row, &cols.issue_date).and_then(|s| parse_iso_date(&s));
                Ok(MappedRow::Permit(Permit {
                    id,
                    external_id: text(row, &cols.external_id),
                    permit_number: text(row, &cols.permit_number),
                    borough: normalizer.normalize_area(&borough_raw),
                    borough_raw,
                    application_date,
                    issue_date,
                    processing_days: processing_days(application_date, issue_date),
                    type_code: text(row, &cols.type_code).unwrap_or_default(),
                    type_description: text(row, &cols.type_description),
                    building_type: text(row, &cols.building_type),
                    building_category: text(row, &cols.building_category),
                    work_nature: text(row, &cols.work_nature),
                    address: text(row, &cols.address),
                    housing_units: row.get(&cols.housing_units).and_then(json_i64),
                    latitude: row.get(&cols.latitude).and_then(json_f64),
                    longitude: row.get(&cols.longitude).and_then(json_f64),
                }))
            }
            ColumnMap::Contract(cols) => {
                self.require_column(row, &cols.supplier)?;
                let supplier_raw = text(row, &cols.supplier).unwrap_or_default();
                Ok(MappedRow::Contract(Contract {
                    id,
                    source: self.key.clone(),
                    supplier: normalizer.normalize_supplier(&supplier_raw),
                    supplier_raw,
                    approval_date: contract_date_text(row.get(&cols.approval_date)),
                    department: text(row, &cols.department),
                    description: text(row, &cols.description),
                    amount: row.get(&cols.amount).and_then(parse_amount),
                }))
            }
        }
    }

    fn require_column(&self, row: &Map<String, JsonValue>, column: &str) -> Result<(), SchemaError> {
        if row.contains_key(column) {
            Ok(())
        } else {
            Err(SchemaError::MissingColumn {
                source_key: self.key.clone(),
                column: column.to_string(),
            })
        }
    }

    fn required_i64(&self, row: &Map<String, JsonValue>, column: &str) -> Result<i64, SchemaError> {
        let value = row.get(column).ok_or_else(|| SchemaError::MissingColumn {
            source_key: self.key.clone(),
            column: column.to_string(),
        })?;
        json_i64(value).ok_or_else(|| SchemaError::InvalidValue {
            source_key: self.key.clone(),
            column: column.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappedRow {
    Permit(Permit),
    Contract(Contract),
}

/// A logical dataset: one or more upstream sources loaded together, in the
/// declared order, by a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<Dataset>,
}

impl DatasetRegistry {
    pub fn builtin() -> Self {
        Self {
            datasets: vec![
                Dataset {
                    name: PERMITS_DATASET.to_string(),
                    sources: vec![permits_source()],
                },
                Dataset {
                    name: CONTRACTS_DATASET.to_string(),
                    sources: contract_sources(),
                },
            ],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing dataset registry")?;
        registry.validate()?;
        Ok(registry)
    }

    /// `datasets.yaml` under `root` when present, otherwise the built-in registry.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("datasets.yaml");
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceSpec> {
        self.datasets.iter().flat_map(|d| d.sources.iter())
    }

    /// Rejects registries whose identifier blocks overlap or whose source keys repeat.
    pub fn validate(&self) -> Result<()> {
        let sources: Vec<&SourceSpec> = self.sources().collect();
        for (i, a) in sources.iter().enumerate() {
            if a.id_offset < 0 || a.id_offset % ID_BLOCK_SIZE != 0 {
                anyhow::bail!("source {} has misaligned id_offset {}", a.key, a.id_offset);
            }
            if a.max_attempts == 0 {
                anyhow::bail!("source {} must allow at least one attempt", a.key);
            }
            for b in &sources[i + 1..] {
                if a.key == b.key {
                    anyhow::bail!("duplicate source key {}", a.key);
                }
                let same_table = matches!(
                    (&a.columns, &b.columns),
                    (ColumnMap::Permit(_), ColumnMap::Permit(_)) | (ColumnMap::Contract(_), ColumnMap::Contract(_))
                );
                if same_table && a.id_offset == b.id_offset {
                    anyhow::bail!("sources {} and {} share id block {}", a.key, b.key, a.id_offset);
                }
            }
        }
        Ok(())
    }
}

/// Montreal construction permits (`permis-construction`).
pub fn permits_source() -> SourceSpec {
    SourceSpec {
        key: "permits".to_string(),
        display_name: "Permis de construction".to_string(),
        resource_id: "5232a72d-235a-48eb-ae20-bb9d501300ad".to_string(),
        date_column: "date_debut".to_string(),
        year_filter: YearFilter::Extract,
        id_offset: 0,
        max_attempts: 5,
        purge: PurgePolicy::None,
        paginated_fallback: true,
        columns: ColumnMap::Permit(PermitColumns {
            external_id: "no_demande".to_string(),
            permit_number: "id_permis".to_string(),
            borough: "arrondissement".to_string(),
            application_date: "date_debut".to_string(),
            issue_date: "date_emission".to_string(),
            type_code: "code_type_base_demande".to_string(),
            type_description: "description_type_demande".to_string(),
            building_type: "description_type_batiment".to_string(),
            building_category: "description_categorie_batiment".to_string(),
            work_nature: "nature_travaux".to_string(),
            address: "emplacement".to_string(),
            housing_units: "nb_logements".to_string(),
            latitude: "latitude".to_string(),
            longitude: "longitude".to_string(),
        }),
    }
}

fn contract_source(
    key: &str,
    display_name: &str,
    offset_block: i64,
    max_attempts: u32,
    columns: [&str; 5],
) -> SourceSpec {
    let [supplier, approval_date, department, description, amount] = columns;
    SourceSpec {
        key: key.to_string(),
        display_name: display_name.to_string(),
        resource_id: format!("contrats-{key}"),
        date_column: approval_date.to_string(),
        year_filter: YearFilter::TextRange,
        id_offset: offset_block * ID_BLOCK_SIZE,
        max_attempts,
        purge: PurgePolicy::BlockOnFull,
        paginated_fallback: false,
        columns: ColumnMap::Contract(ContractColumns {
            supplier: supplier.to_string(),
            approval_date: approval_date.to_string(),
            department: department.to_string(),
            description: description.to_string(),
            amount: amount.to_string(),
        }),
    }
}

/// The five approval-body contract datasets, in load order. Resource ids are
/// placeholders overridden by `datasets.yaml` in deployments.
pub fn contract_sources() -> Vec<SourceSpec> {
    vec![
        contract_source(
            "officials",
            "Contrats octroyés par les fonctionnaires",
            1,
            5,
            ["NOM_FOURNISSEUR", "DATE_SIGNATURE", "SERVICE", "DESCRIPTION", "MONTANT"],
        ),
        contract_source(
            "executive-committee",
            "Contrats du comité exécutif",
            2,
            3,
            ["FOURNISSEUR", "DATE", "SERVICE", "OBJET", "MONTANT"],
        ),
        contract_source(
            "city-council",
            "Contrats du conseil municipal",
            3,
            3,
            ["FOURNISSEUR", "DATE", "SERVICE", "OBJET", "MONTANT"],
        ),
        contract_source(
            "agglomeration-council",
            "Contrats du conseil d'agglomération",
            4,
            3,
            ["FOURNISSEUR", "DATE", "SERVICE", "OBJET", "MONTANT"],
        ),
        contract_source(
            "borough-councils",
            "Contrats des conseils d'arrondissement",
            5,
            4,
            ["FOURNISSEUR", "DATE SIGNATURE", "ARRONDISSEMENT", "OBJET", "MONTANT"],
        ),
    ]
}

fn escape_identifier(raw: &str) -> String {
    raw.replace('"', "\"\"")
}

fn text(row: &Map<String, JsonValue>, column: &str) -> Option<String> {
    match row.get(column)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Keeps the first ten characters of ISO timestamps and any other text as-is
/// so malformed legacy values remain auditable.
fn contract_date_text(value: Option<&JsonValue>) -> String {
    let raw = match value {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    match parse_iso_date(&raw) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => raw,
    }
}

fn json_i64(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &JsonValue) -> Option<f64> {
    let parsed: Option<f64> = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// Dollar amounts as published: plain numbers, `"24 999,00 $"`,
/// `"24,999.00"` or `"$25000"`.
pub fn parse_amount(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        JsonValue::String(s) => parse_amount_text(s),
        _ => None,
    }
}

pub fn parse_amount_text(raw: &str) -> Option<f64> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '$' | '\u{a0}' | '\u{202f}'))
        .collect();
    if compact.is_empty() {
        return None;
    }
    let normalized = match (compact.contains(','), compact.contains('.')) {
        (true, true) => compact.replace(',', ""),
        (true, false) => {
            let decimals = compact.rsplit(',').next().map(str::len).unwrap_or(0);
            if compact.matches(',').count() == 1 && decimals <= 2 {
                compact.replace(',', ".")
            } else {
                compact.replace(',', "")
            }
        }
        _ => compact,
    };
    normalized.parse::<f64>().ok().filter(|f| f.is_finite())
}
