//! Data model (spec.md §3): datasources, the transform DSL, query/pivot/
//! distinct/period-total requests, and sync entities.
//!
//! Everything here is a plain value type, `serde`-round-trippable, read or
//! written by ID — never shared as a live mutable reference (spec.md §9,
//! "cyclic/shared references").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The five SQL dialects this engine compiles for, plus the HTTP-ingest
/// pseudo-dialect which never receives compiled SQL directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Dialect {
    EmbeddedColumnar,
    Postgres,
    Mysql,
    Mssql,
    Sqlite,
}

/// Datasource kind (spec.md §3). `HttpApi` carries no SQL dialect; sync tasks
/// against it are driven by the API ingest module (C14) instead of C9/C10.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatasourceKind {
    EmbeddedColumnar,
    PostgresFamily,
    MysqlFamily,
    MssqlFamily,
    Sqlite,
    HttpApi,
}

impl DatasourceKind {
    /// The SQL dialect used to compile queries against this datasource, or
    /// `None` for HTTP-API datasources (no SQL compilation applies).
    pub fn dialect(self) -> Option<Dialect> {
        match self {
            DatasourceKind::EmbeddedColumnar => Some(Dialect::EmbeddedColumnar),
            DatasourceKind::PostgresFamily => Some(Dialect::Postgres),
            DatasourceKind::MysqlFamily => Some(Dialect::Mysql),
            DatasourceKind::MssqlFamily => Some(Dialect::Mssql),
            DatasourceKind::Sqlite => Some(Dialect::Sqlite),
            DatasourceKind::HttpApi => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datasource {
    pub id: String,
    pub kind: DatasourceKind,
    /// Encrypted at rest by an external collaborator; this crate never
    /// decrypts it, only forwards the opaque blob to the relevant connector.
    pub connection_string: Option<String>,
    /// Options blob, including the transform DSL under `transforms`.
    pub options: DatasourceOptions,
    pub owner: String,
    pub active: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasourceOptions {
    #[serde(default)]
    pub transforms: Vec<TransformItem>,
    #[serde(default)]
    pub custom_columns: Vec<CustomColumn>,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    #[serde(default)]
    pub defaults: TransformDefaults,
    #[serde(default)]
    pub blackout_windows: Vec<BlackoutWindow>,
    /// Concurrent in-flight sync runs permitted against this datasource
    /// (spec.md §4.13 step 2). `0` means unbounded.
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: u32,
    /// How to call the endpoint, for `HttpApi`-kind datasources. Unused by
    /// every other kind.
    #[serde(default)]
    pub api_ingest: Option<ApiIngestConfig>,
}

fn default_max_concurrent_syncs() -> u32 {
    1
}

/// A time-of-day range (minutes since midnight, local to the datasource)
/// during which sync runs are rejected. Ranges may wrap midnight
/// (`start > end` means "until end, after midnight").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlackoutWindow {
    pub start_minute: u16,
    pub end_minute: u16,
}

impl BlackoutWindow {
    pub fn contains(&self, minute_of_day: u16) -> bool {
        if self.start_minute <= self.end_minute {
            minute_of_day >= self.start_minute && minute_of_day < self.end_minute
        } else {
            minute_of_day >= self.start_minute || minute_of_day < self.end_minute
        }
    }
}

// ---------------------------------------------------------------------------
// Transform DSL (spec.md §3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformScope {
    Datasource,
    Table { name: String },
    Widget { id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomColumn {
    pub name: String,
    pub expr: String,
    #[serde(default)]
    pub r#type: Option<CustomColumnType>,
    #[serde(default = "TransformScope_datasource")]
    pub scope: TransformScope,
}

#[allow(non_snake_case)]
fn TransformScope_datasource() -> TransformScope {
    TransformScope::Datasource
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomColumnType {
    String,
    Number,
    Date,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseWhen {
    pub op: CompareOp,
    pub left: String,
    pub right: String,
    pub then: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullHandlingMode {
    Coalesce,
    Isnull,
    Ifnull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum TransformVariant {
    Computed {
        name: String,
        expr: String,
    },
    Case {
        target: String,
        cases: Vec<CaseWhen>,
        r#else: Option<String>,
    },
    Replace {
        target: String,
        search: Vec<String>,
        replace: Vec<String>,
    },
    Translate {
        target: String,
        search: String,
        replace: String,
    },
    NullHandling {
        target: String,
        mode: NullHandlingMode,
        value: String,
    },
    Unpivot {
        source_columns: Vec<String>,
        key_column: String,
        value_column: String,
        #[serde(default)]
        omit_zero_null: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformItem {
    pub scope: TransformScope,
    pub variant: TransformVariant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    Left,
    Inner,
    Right,
    Lateral,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAggregate {
    pub fn_name: String,
    pub column: String,
    pub alias: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LateralCorrelation {
    pub source_col: String,
    pub op: CompareOp,
    pub target_col: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LateralFilter {
    #[serde(default)]
    pub correlations: Vec<LateralCorrelation>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSpec {
    pub scope: TransformScope,
    pub join_type: JoinType,
    pub target_table: String,
    pub source_key: String,
    pub target_key: String,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub aggregate: Option<JoinAggregate>,
    #[serde(default)]
    pub filter: Option<LateralFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortDefault {
    pub by: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopNDefault {
    pub n: u64,
    pub by: u32,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformDefaults {
    #[serde(default)]
    pub sort: Option<SortDefault>,
    #[serde(default)]
    pub limit_top_n: Option<TopNDefault>,
}

// ---------------------------------------------------------------------------
// Filter DSL (spec.md §4.6)
// ---------------------------------------------------------------------------

/// A filter value: scalar or array (arrays compile to `IN (...)` / AND-of-`<>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Array(Vec<FilterValue>),
}

/// A where-clause map keyed by `field` or `field__op` (spec.md §4.6).
pub type WhereMap = HashMap<String, FilterValue>;

// ---------------------------------------------------------------------------
// Query spec (spec.md §3, §4.5.1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agg {
    Count,
    Distinct,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    None,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekStart {
    Mon,
    Sun,
}

impl Default for WeekStart {
    fn default() -> Self {
        WeekStart::Mon
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Legend {
    Single(String),
    Multi(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesSpec {
    pub name: String,
    pub y: Option<String>,
    pub agg: Agg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderByField {
    X,
    Value,
    Legend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySpec {
    pub source: String,
    #[serde(default)]
    pub select: Option<Vec<String>>,
    #[serde(default)]
    pub r#where: WhereMap,
    #[serde(default)]
    pub x: Option<String>,
    #[serde(default)]
    pub y: Option<String>,
    #[serde(default)]
    pub legend: Option<Legend>,
    #[serde(default)]
    pub measure: Option<String>,
    #[serde(default = "default_agg")]
    pub agg: Agg,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default)]
    pub week_start: WeekStart,
    #[serde(default)]
    pub series: Vec<SeriesSpec>,
    #[serde(default)]
    pub order_by: Option<OrderByField>,
    #[serde(default)]
    pub order: Option<OrderDirection>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

fn default_agg() -> Agg {
    Agg::Count
}

impl Default for Agg {
    fn default() -> Self {
        Agg::Count
    }
}

impl Default for GroupBy {
    fn default() -> Self {
        GroupBy::None
    }
}

// ---------------------------------------------------------------------------
// Pivot / distinct / period-totals requests (spec.md §3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Distinct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PivotRequest {
    pub source: String,
    pub rows: Vec<String>,
    pub cols: Vec<String>,
    #[serde(default)]
    pub value_field: Option<String>,
    pub aggregator: Aggregator,
    #[serde(default)]
    pub r#where: WhereMap,
    #[serde(default)]
    pub group_by: GroupBy,
    #[serde(default)]
    pub week_start: WeekStart,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistinctRequest {
    pub source: String,
    pub field: String,
    #[serde(default)]
    pub r#where: WhereMap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodTotalsRequest {
    pub source: String,
    #[serde(default)]
    pub y: Option<String>,
    #[serde(default)]
    pub measure: Option<String>,
    pub agg: Agg,
    pub date_field: String,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub prev_start: Option<String>,
    #[serde(default)]
    pub prev_end: Option<String>,
    #[serde(default)]
    pub r#where: WhereMap,
    #[serde(default)]
    pub legend: Option<String>,
    #[serde(default)]
    pub week_start: WeekStart,
}

// ---------------------------------------------------------------------------
// Sync entities (spec.md §3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Sequence,
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub id: String,
    pub datasource_id: String,
    #[serde(default)]
    pub source_schema: Option<String>,
    pub source_table: String,
    pub dest_table: String,
    pub mode: SyncMode,
    pub pk_columns: Vec<String>,
    #[serde(default)]
    pub select_columns: Vec<String>,
    #[serde(default)]
    pub sequence_column: Option<String>,
    pub batch_size: u64,
    #[serde(default)]
    pub schedule_cron: Option<String>,
    pub enabled: bool,
    pub group_key: String,
    #[serde(default)]
    pub custom_query: Option<String>,
}

impl SyncTask {
    /// `groupKey = hash(datasourceId, sourceSchema, sourceTable, destTable)`
    /// (spec.md §3 invariant).
    pub fn compute_group_key(
        datasource_id: &str,
        source_schema: Option<&str>,
        source_table: &str,
        dest_table: &str,
    ) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        datasource_id.hash(&mut hasher);
        source_schema.unwrap_or("").hash(&mut hasher);
        source_table.hash(&mut hasher);
        dest_table.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Fetch,
    Insert,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncState {
    pub task_id: String,
    #[serde(default)]
    pub last_sequence_value: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub last_row_count: Option<u64>,
    pub in_progress: bool,
    pub cancel_requested: bool,
    pub progress_current: u64,
    pub progress_total: u64,
    #[serde(default)]
    pub progress_phase: Option<ProgressPhase>,
    #[serde(default)]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub last_embedded_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: String,
    pub task_id: String,
    pub datasource_id: String,
    pub mode: SyncMode,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLock {
    pub group_key: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// API ingest configuration (spec.md §4.14; detail recovered from
// original_source/backend/app/api_ingest.py, which spec.md distills).
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaceholderKind {
    Static,
    Date,
}

/// A named substitution value for `{name}` tokens in the endpoint URL,
/// headers, query params, and body template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Placeholder {
    pub name: String,
    pub kind: PlaceholderKind,
    #[serde(default)]
    pub value: Option<String>,
    /// `YYYY`/`MM`/`DD`/`HH`/`mm`/`ss` tokens (or raw strftime `%` tokens).
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpHeader {
    pub key: String,
    pub value: String,
}

/// Authentication flow applied on top of placeholder-resolved headers/params
/// (spec.md §4.14 "Auth flows").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    None,
    Bearer {
        token: String,
    },
    ApiKeyHeader {
        header: String,
        value: String,
    },
    ApiKeyQuery {
        param: String,
        value: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Oauth2ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        #[serde(default)]
        scope: Option<String>,
    },
}

/// Pagination strategy (spec.md §4.14 "Pagination").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PaginationConfig {
    None,
    Page {
        #[serde(default = "default_page_param")]
        page_param: String,
        #[serde(default = "default_page_size_param")]
        page_size_param: String,
        #[serde(default = "default_page_size")]
        page_size: u32,
        #[serde(default = "default_page_start")]
        page_start: u32,
        #[serde(default = "default_max_pages")]
        max_pages: u32,
    },
    Cursor {
        #[serde(default = "default_cursor_param")]
        cursor_param: String,
        next_cursor_path: String,
        #[serde(default = "default_max_pages")]
        max_pages: u32,
    },
}

fn default_page_param() -> String {
    "page".to_string()
}
fn default_page_size_param() -> String {
    "limit".to_string()
}
fn default_page_size() -> u32 {
    100
}
fn default_page_start() -> u32 {
    1
}
fn default_max_pages() -> u32 {
    10
}
fn default_cursor_param() -> String {
    "cursor".to_string()
}

/// Date-range sequencing window (spec.md §4.14 "Sequencing").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceConfig {
    pub enabled: bool,
    pub date_field: String,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    #[serde(default)]
    pub start_param: Option<String>,
    #[serde(default)]
    pub end_param: Option<String>,
}

fn default_window_days() -> u32 {
    7
}

fn default_method() -> String {
    "GET".to_string()
}

/// Forward-fill gap-fill post-step (spec.md §4.14 "Gap fill").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapFillConfig {
    pub enabled: bool,
    pub date_field: String,
    pub key_fields: Vec<String>,
}

/// The full configuration of one HTTP-API sync endpoint (an `HttpApi`
/// datasource's `options.apiIngest`, or a `SyncTask.customQuery` override).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiIngestConfig {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<HttpHeader>,
    #[serde(default)]
    pub query: Vec<HttpHeader>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub placeholders: Vec<Placeholder>,
    #[serde(default)]
    pub json_root: Option<String>,
    #[serde(default)]
    pub parse: Option<String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub pagination: Option<PaginationConfig>,
    #[serde(default)]
    pub sequence: Option<SequenceConfig>,
    #[serde(default)]
    pub gap_fill: Option<GapFillConfig>,
    #[serde(default)]
    pub write_mode: Option<String>,
}

// ---------------------------------------------------------------------------
// RPC surface request/response shapes (spec.md §6)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawQueryRequest {
    pub sql: String,
    #[serde(default)]
    pub datasource_id: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub include_total: bool,
    #[serde(default)]
    pub params: WhereMap,
    #[serde(default)]
    pub prefer_local_duck: bool,
    #[serde(default)]
    pub prefer_local_table: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySpecRequest {
    pub spec: QuerySpec,
    #[serde(default)]
    pub datasource_id: Option<String>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
    #[serde(default)]
    pub include_total: bool,
    #[serde(default)]
    pub widget_id: Option<String>,
    #[serde(default)]
    pub prefer_local_duck: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PivotQueryRequest {
    #[serde(flatten)]
    pub pivot: PivotRequest,
    #[serde(default)]
    pub datasource_id: Option<String>,
    #[serde(default)]
    pub widget_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistinctQueryRequest {
    #[serde(flatten)]
    pub distinct: DistinctRequest,
    #[serde(default)]
    pub datasource_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodTotalsQueryRequest {
    #[serde(flatten)]
    pub period: PeriodTotalsRequest,
    #[serde(default)]
    pub datasource_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodTotalsBatchItem {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(flatten)]
    pub request: PeriodTotalsQueryRequest,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodTotalsBatchRequest {
    pub requests: Vec<PeriodTotalsBatchItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub total_rows: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlOnlyResult {
    pub sql: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistinctResult {
    pub values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodTotalsResult {
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub totals: Option<HashMap<String, f64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodTotalsCompareResult {
    pub cur: PeriodTotalsResult,
    pub prev: PeriodTotalsResult,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodTotalsBatchResult {
    pub results: HashMap<String, PeriodTotalsResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blackout_window_wraps_midnight() {
        let w = BlackoutWindow {
            start_minute: 22 * 60,
            end_minute: 6 * 60,
        };
        assert!(w.contains(23 * 60));
        assert!(w.contains(0));
        assert!(w.contains(5 * 60 + 59));
        assert!(!w.contains(12 * 60));
    }

    #[test]
    fn blackout_window_non_wrapping() {
        let w = BlackoutWindow {
            start_minute: 60,
            end_minute: 120,
        };
        assert!(w.contains(90));
        assert!(!w.contains(30));
        assert!(!w.contains(150));
    }

    #[test]
    fn group_key_is_deterministic_and_order_sensitive() {
        let a = SyncTask::compute_group_key("ds1", Some("public"), "orders", "orders_copy");
        let b = SyncTask::compute_group_key("ds1", Some("public"), "orders", "orders_copy");
        let c = SyncTask::compute_group_key("ds1", None, "orders", "orders_copy");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
