//! Aggregate query model and its translation to SQL over the `events` table.
//!
//! Queries group on field references. A field reference is a JSON path into
//! the stored entry (`QH`, `Result.IsFiltered`) or a derived value computed
//! from one:
//!
//! - `base_domain(QH)`: registrable domain of a host name, so
//!   `api.example.co.uk` groups under `example.co.uk`
//! - `client_name(IP)`: hostname learned from DHCP leases for an address

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::traits::StorageError;

pub const DEFAULT_PAGE_SIZE: usize = 500;
pub const MAX_PAGE_SIZE: usize = 10_000;

/// Characters of the timestamp that make up its calendar day
const DAY_PREFIX_CHARS: usize = 10;

/// Public suffixes made of two labels; a domain under one of these keeps three
/// labels as its base domain
pub const MULTI_PART_TLDS: &[&str] = &[
    "co.uk", "org.uk", "me.uk", "ac.uk", "gov.uk", "co.jp", "ne.jp", "or.jp", "ac.jp", "com.au",
    "net.au", "org.au", "edu.au", "co.nz", "net.nz", "org.nz", "co.za", "org.za", "net.za",
    "com.br", "net.br", "org.br", "com.mx", "org.mx", "net.mx", "co.in", "net.in", "org.in",
    "com.cn", "net.cn", "org.cn", "co.kr", "or.kr", "ne.kr",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateQuery {
    pub destination: String,
    /// Field references to group by, e.g. `QH`, `Result.IsFiltered` or `base_domain(QH)`
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    /// Inclusive lower bound on the entry timestamp
    #[serde(default)]
    pub from: Option<String>,
    /// Inclusive upper bound, compared against the timestamp prefix of the same
    /// length, so `2025-12-03` covers the whole day
    #[serde(default)]
    pub to: Option<String>,
    /// Numeric JSON field to SUM per group
    #[serde(default)]
    pub sum_field: Option<String>,
    #[serde(default)]
    pub min_count: Option<i64>,
    #[serde(default)]
    pub max_count: Option<i64>,
    /// Bounds on the busiest single day of a group
    #[serde(default)]
    pub min_peak_daily_count: Option<i64>,
    #[serde(default)]
    pub max_peak_daily_count: Option<i64>,
    /// `count`, `sum`, `peak_daily_count`, `first_seen`, `last_seen`, or one of
    /// the group_by fields
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_asc: bool,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl AggregateQuery {
    pub fn new(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            group_by: Vec::new(),
            filters: Vec::new(),
            from: None,
            to: None,
            sum_field: None,
            min_count: None,
            max_count: None,
            min_peak_daily_count: None,
            max_peak_daily_count: None,
            sort_by: None,
            sort_asc: false,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Field reference, same syntax as `group_by`
    pub field: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    /// Case-insensitive equality
    Eq,
    /// Case-insensitive substring match; `%` and `_` match literally
    Contains,
    Gte,
    Lte,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateRow {
    pub keys: BTreeMap<String, Option<String>>,
    pub count: i64,
    pub sum: Option<f64>,
    /// Entries on the busiest calendar day of the group
    pub peak_daily_count: i64,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatePage {
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub rows: Vec<AggregateRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamStats {
    pub destination: String,
    pub events: i64,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
}

/// IP address to hostname mapping learned from DHCP leases
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientName {
    pub ip: String,
    pub hostname: String,
}

/// A parsed field reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRef {
    Path(String),
    BaseDomain(String),
    ClientName(String),
}

impl FieldRef {
    pub fn parse(text: &str) -> Result<Self, StorageError> {
        let field = if let Some(path) = call_argument(text, "base_domain") {
            FieldRef::BaseDomain(path.to_string())
        } else if let Some(path) = call_argument(text, "client_name") {
            FieldRef::ClientName(path.to_string())
        } else {
            FieldRef::Path(text.to_string())
        };

        if !field_path_regex().is_match(field.path()) {
            return Err(StorageError::InvalidQuery(format!(
                "invalid field '{}'",
                text
            )));
        }
        Ok(field)
    }

    /// The JSON path the reference reads
    pub fn path(&self) -> &str {
        match self {
            FieldRef::Path(path) | FieldRef::BaseDomain(path) | FieldRef::ClientName(path) => path,
        }
    }
}

fn call_argument<'a>(text: &'a str, function: &str) -> Option<&'a str> {
    text.strip_prefix(function)?
        .strip_prefix('(')?
        .strip_suffix(')')
        .map(str::trim)
}

fn field_path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
            .expect("field path pattern is valid")
    })
}

/// `json_extract_string` expression for a validated path.
///
/// Paths are spliced into the SQL text, which is why [`FieldRef::parse`]
/// rejects anything outside the identifier grammar.
fn path_expr(path: &str) -> String {
    format!("json_extract_string(payload, '$.{}')", path)
}

/// SQL macros behind the derived field references, created with the schema
pub(crate) fn derived_field_macros() -> Vec<String> {
    let tlds = MULTI_PART_TLDS
        .iter()
        .map(|tld| format!("'{}'", tld))
        .collect::<Vec<_>>()
        .join(", ");

    vec![
        "CREATE OR REPLACE MACRO domain_labels(d) AS string_split(rtrim(lower(d), '.'), '.')"
            .to_string(),
        "CREATE OR REPLACE MACRO domain_label(d, k) AS domain_labels(d)[len(domain_labels(d)) - k + 1]"
            .to_string(),
        format!(
            "CREATE OR REPLACE MACRO base_domain(d) AS CASE \
                WHEN d IS NULL THEN NULL \
                WHEN len(domain_labels(d)) <= 2 THEN rtrim(lower(d), '.') \
                WHEN list_contains([{}], domain_label(d, 2) || '.' || domain_label(d, 1)) \
                    THEN domain_label(d, 3) || '.' || domain_label(d, 2) || '.' || domain_label(d, 1) \
                ELSE domain_label(d, 2) || '.' || domain_label(d, 1) \
            END",
            tlds
        ),
    ]
}

/// Turns field references into SQL, collecting the joins they need
#[derive(Default)]
struct FieldCompiler {
    client_joins: Vec<String>,
}

impl FieldCompiler {
    fn expr(&mut self, text: &str) -> Result<String, StorageError> {
        Ok(match FieldRef::parse(text)? {
            FieldRef::Path(path) => path_expr(&path),
            FieldRef::BaseDomain(path) => format!("base_domain({})", path_expr(&path)),
            FieldRef::ClientName(path) => {
                let index = match self.client_joins.iter().position(|p| *p == path) {
                    Some(index) => index,
                    None => {
                        self.client_joins.push(path);
                        self.client_joins.len() - 1
                    }
                };
                format!("c{}.hostname", index)
            }
        })
    }

    fn joins(&self) -> String {
        self.client_joins
            .iter()
            .enumerate()
            .map(|(i, path)| {
                format!(
                    " LEFT JOIN client_names AS c{i} ON c{i}.ip = {}",
                    path_expr(path)
                )
            })
            .collect()
    }
}

/// Escape `%`, `_` and the escape character itself for `LIKE ... ESCAPE '\'`
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// SQL for an aggregate query, ready to be wrapped for counting and paging
#[derive(Debug)]
pub(crate) struct AggregateSql {
    pub base: String,
    pub order_by: String,
    pub params: Vec<duckdb::types::Value>,
    pub page: usize,
    pub page_size: usize,
}

impl AggregateSql {
    pub fn offset(&self) -> usize {
        (self.page - 1) * self.page_size
    }
}

/// Builds a two-level aggregate: per group and calendar day, then per group,
/// so each row can report its busiest day.
pub(crate) fn build_aggregate_sql(query: &AggregateQuery) -> Result<AggregateSql, StorageError> {
    use duckdb::types::Value;

    if query.page == 0 {
        return Err(StorageError::InvalidQuery("page starts at 1".to_string()));
    }
    if query.page_size == 0 || query.page_size > MAX_PAGE_SIZE {
        return Err(StorageError::InvalidQuery(format!(
            "page_size must be between 1 and {}",
            MAX_PAGE_SIZE
        )));
    }

    let mut fields = FieldCompiler::default();
    let mut params = vec![Value::Text(query.destination.clone())];
    let mut conditions = vec!["destination = ?".to_string()];

    for filter in &query.filters {
        let expr = fields.expr(&filter.field)?;
        match filter.op {
            FilterOp::Eq => {
                conditions.push(format!("LOWER({}) = LOWER(?)", expr));
                params.push(Value::Text(filter.value.clone()));
            }
            FilterOp::Contains => {
                conditions.push(format!("LOWER({}) LIKE LOWER(?) ESCAPE '\\'", expr));
                params.push(Value::Text(format!("%{}%", escape_like(&filter.value))));
            }
            FilterOp::Gte => {
                conditions.push(format!("{} >= ?", expr));
                params.push(Value::Text(filter.value.clone()));
            }
            FilterOp::Lte => {
                conditions.push(format!("{} <= ?", expr));
                params.push(Value::Text(filter.value.clone()));
            }
        }
    }

    if let Some(from) = &query.from {
        conditions.push("timestamp >= ?".to_string());
        params.push(Value::Text(from.clone()));
    }
    if let Some(to) = &query.to {
        conditions.push(format!("substr(timestamp, 1, {}) <= ?", to.chars().count()));
        params.push(Value::Text(to.clone()));
    }

    let mut daily_select = Vec::new();
    let mut group_columns = Vec::new();
    for (i, field) in query.group_by.iter().enumerate() {
        daily_select.push(format!("{} AS k{}", fields.expr(field)?, i));
        group_columns.push(format!("k{}", i));
    }
    daily_select.push(format!("substr(timestamp, 1, {}) AS day", DAY_PREFIX_CHARS));
    daily_select.push("COUNT(*) AS day_cnt".to_string());
    daily_select.push(match &query.sum_field {
        Some(field) => match FieldRef::parse(field)? {
            FieldRef::Path(path) => format!("SUM(TRY_CAST({} AS DOUBLE)) AS day_total", path_expr(&path)),
            _ => {
                return Err(StorageError::InvalidQuery(format!(
                    "sum_field must be a plain field path, got '{}'",
                    field
                )))
            }
        },
        None => "CAST(NULL AS DOUBLE) AS day_total".to_string(),
    });
    daily_select.push("MIN(timestamp) AS day_first".to_string());
    daily_select.push("MAX(timestamp) AS day_last".to_string());

    let mut daily_group = group_columns.clone();
    daily_group.push("day".to_string());

    let daily = format!(
        "SELECT {} FROM events{} WHERE {} GROUP BY {}",
        daily_select.join(", "),
        fields.joins(),
        conditions.join(" AND "),
        daily_group.join(", ")
    );

    let mut select = group_columns.clone();
    select.push("COALESCE(CAST(SUM(day_cnt) AS BIGINT), 0) AS cnt".to_string());
    select.push("SUM(day_total) AS total".to_string());
    select.push("COALESCE(MAX(day_cnt), 0) AS peak".to_string());
    select.push("MIN(day_first) AS first_seen".to_string());
    select.push("MAX(day_last) AS last_seen".to_string());

    let mut having = Vec::new();
    let bounds = [
        ("SUM(day_cnt) >= ?", query.min_count),
        ("SUM(day_cnt) <= ?", query.max_count),
        ("MAX(day_cnt) >= ?", query.min_peak_daily_count),
        ("MAX(day_cnt) <= ?", query.max_peak_daily_count),
    ];
    for (clause, bound) in bounds {
        if let Some(bound) = bound {
            having.push(clause.to_string());
            params.push(Value::BigInt(bound));
        }
    }

    let mut base = format!("SELECT {} FROM ({}) AS daily", select.join(", "), daily);
    if !group_columns.is_empty() {
        base.push_str(&format!(" GROUP BY {}", group_columns.join(", ")));
    }
    if !having.is_empty() {
        base.push_str(&format!(" HAVING {}", having.join(" AND ")));
    }

    let sort_col = match query.sort_by.as_deref() {
        None | Some("count") => "cnt".to_string(),
        Some("sum") => "total".to_string(),
        Some("peak_daily_count") => "peak".to_string(),
        Some("first_seen") => "first_seen".to_string(),
        Some("last_seen") => "last_seen".to_string(),
        Some(field) => match query.group_by.iter().position(|g| g == field) {
            Some(i) => format!("k{}", i),
            None => {
                return Err(StorageError::InvalidQuery(format!(
                    "cannot sort by '{}': not a group_by field",
                    field
                )))
            }
        },
    };
    let direction = if query.sort_asc { "ASC" } else { "DESC" };
    let mut order = vec![format!("{} {} NULLS LAST", sort_col, direction)];
    order.extend(group_columns.iter().cloned());

    Ok(AggregateSql {
        base,
        order_by: order.join(", "),
        params,
        page: query.page,
        page_size: query.page_size,
    })
}

pub(crate) fn total_pages(total: usize, page_size: usize) -> usize {
    std::cmp::max(1, total.div_ceil(page_size))
}
