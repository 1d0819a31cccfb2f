//! Query Engine facade (spec.md §6).
//!
//! `QueryEngine` is the transport-neutral entry point a thin HTTP layer
//! wraps: one async method per RPC, each running the same pipeline —
//! throttle, resolve datasource, compose/compile, cache, route, execute,
//! cache-write. It owns the C7–C11 plumbing; the sync plane (C12–C14) is
//! reached through `SyncCoordinator` separately, since it has its own
//! locking semantics that don't fit this request/response shape.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::exec::cache::{CachedResult, ResultCache, COUNT_PREFIX, DATA_PREFIX};
use crate::exec::embedded::EmbeddedHandle;
use crate::exec::pool::{EnginePool, RemoteEngine};
use crate::exec::router::{self, ExecTarget};
use crate::exec::throttle::Throttle;
use crate::model::{
    Datasource, DatasourceKind, Dialect, DistinctQueryRequest, DistinctResult, FilterValue,
    PeriodTotalsBatchRequest, PeriodTotalsBatchResult, PeriodTotalsCompareResult,
    PeriodTotalsQueryRequest, PeriodTotalsResult, PivotQueryRequest, QueryResult,
    QuerySpecRequest, RawQueryRequest, SqlOnlyResult, TransformScope,
};
use crate::sql::compiler::CompiledQuery;
use crate::sql::transform::{self, ComposeInput, TransformResult};
use crate::sql::where_planner::BoundParam;
use crate::store::MetadataStore;

/// Page size pivot results are concatenated in server-side when the caller
/// asks for an unlimited pivot (spec.md §6 `/query/pivot`).
const PIVOT_PAGE_SIZE: u64 = 50_000;

pub struct QueryEngine<S: MetadataStore> {
    config: EngineConfig,
    store: Arc<S>,
    cache: ResultCache,
    throttle: Throttle,
    pool: EnginePool,
    embedded: Arc<EmbeddedHandle>,
}

impl<S: MetadataStore> QueryEngine<S> {
    pub fn new(config: EngineConfig, store: Arc<S>, embedded: Arc<EmbeddedHandle>) -> Self {
        let cache = ResultCache::new(config.result_cache_ttl, config.shared_cache_prefix.clone());
        let throttle = Throttle::new(
            config.query_rate_per_sec,
            config.query_burst,
            config.heavy_query_concurrency,
            config.user_query_concurrency,
        );
        QueryEngine {
            config,
            store,
            cache,
            throttle,
            pool: EnginePool::new(),
            embedded,
        }
    }

    /// Absent `datasourceId` means "the embedded store" — it is the one
    /// datasource every deployment has, synced destinations and all.
    fn embedded_datasource() -> Datasource {
        Datasource {
            id: "embedded".to_string(),
            kind: DatasourceKind::EmbeddedColumnar,
            connection_string: None,
            options: Default::default(),
            owner: String::new(),
            active: true,
        }
    }

    async fn resolve_datasource(&self, id: Option<&str>) -> Result<Datasource> {
        match id {
            None => Ok(Self::embedded_datasource()),
            Some(id) => self
                .store
                .get_datasource(id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("datasource {id} not found"))),
        }
    }

    fn dialect_of(ds: &Datasource) -> Result<Dialect> {
        ds.kind
            .dialect()
            .ok_or_else(|| EngineError::BadRequest(format!("datasource {} has no SQL dialect", ds.id)))
    }

    /// Probe the live column set of `source`. Only the embedded store is
    /// probed directly (a `PRAGMA table_info` away); remote datasources
    /// fall back to unvalidated custom-column admission (spec.md §9
    /// "Probe-before-compile" degrades, it never fails the request).
    fn probe_columns(&self, ds: &Datasource, source: &str) -> Option<Vec<String>> {
        if ds.kind != DatasourceKind::EmbeddedColumnar {
            return None;
        }
        self.embedded
            .with_connection(|conn| {
                let mut stmt = conn.prepare(&format!("PRAGMA table_info('{source}')")).ok()?;
                let cols = stmt
                    .query_map([], |row| row.get::<_, String>(1))
                    .ok()?
                    .filter_map(|r| r.ok())
                    .collect::<Vec<_>>();
                if cols.is_empty() {
                    None
                } else {
                    Some(cols)
                }
            })
    }

    /// Build the composed `_base` for `source`, scoping transforms/custom
    /// columns/joins to the table (and, if given, the widget) per spec.md
    /// §4.4.
    fn compose_base(
        &self,
        ds: &Datasource,
        dialect: Dialect,
        source: &str,
        base_select: Option<&[String]>,
        widget_id: Option<&str>,
        limit: Option<u64>,
    ) -> TransformResult {
        let opts = &ds.options;
        let in_scope = |scope: &TransformScope| transform::in_scope(scope, source, widget_id);

        let custom_columns: Vec<_> = opts
            .custom_columns
            .iter()
            .filter(|c| in_scope(&c.scope))
            .cloned()
            .collect();
        let transforms: Vec<_> = opts
            .transforms
            .iter()
            .filter(|t| in_scope(&t.scope))
            .cloned()
            .collect();
        let joins: Vec<_> = opts.joins.iter().filter(|j| in_scope(&j.scope)).cloned().collect();

        let probed = self.probe_columns(ds, source);
        transform::compose(ComposeInput {
            dialect,
            source,
            base_select,
            probed_base_columns: probed.as_deref(),
            custom_columns: &custom_columns,
            transforms: &transforms,
            joins: &joins,
            defaults: &opts.defaults,
            limit,
        })
    }

    fn admitted(base: &TransformResult) -> HashSet<String> {
        base.admitted_aliases.clone()
    }

    /// Run `compiled` end to end: cache lookup, throttle, route, execute,
    /// cache write. Shared by every `/query*` RPC.
    async fn run(
        &self,
        ds: &Datasource,
        dialect: Dialect,
        actor: &str,
        heavy: bool,
        compiled: &CompiledQuery,
        prefer_local: bool,
        table_in_embedded: bool,
    ) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
        let cache_key = self.cache.key(DATA_PREFIX, &ds.id, &compiled.sql, &compiled.params);
        if let Some(hit) = self.cache.get(&cache_key).await? {
            return Ok((hit.columns, hit.rows));
        }

        self.throttle.try_acquire_token(actor)?;
        let _guard = self.throttle.acquire_concurrency(actor, heavy).await;

        let target = router::choose_target_for(ds, prefer_local, table_in_embedded);
        let timeout = self.config.data_query_timeout;
        let pool = &self.pool;
        let embedded = &self.embedded;
        let dsn = ds.connection_string.as_deref();

        let result = router::execute_with_retry(
            || async {
                execute_compiled(dialect, target, pool, embedded, dsn, compiled, timeout).await
            },
            || async {
                if target == ExecTarget::Remote {
                    if let Some(dsn) = dsn {
                        pool.dispose(dsn);
                    }
                }
            },
        )
        .await?;

        self.cache
            .put(
                &cache_key,
                CachedResult {
                    columns: result.0.clone(),
                    rows: result.1.clone(),
                },
            )
            .await?;
        Ok(result)
    }

    async fn count(
        &self,
        ds: &Datasource,
        dialect: Dialect,
        actor: &str,
        compiled: &CompiledQuery,
        prefer_local: bool,
        table_in_embedded: bool,
    ) -> Result<u64> {
        let inner = strip_trailing_limit_offset(&compiled.sql);
        let count_sql = router::wrap_count(&inner);
        let count_query = CompiledQuery {
            sql: count_sql,
            params: compiled.params.clone(),
            warnings: Vec::new(),
        };
        let cache_key = self.cache.key(COUNT_PREFIX, &ds.id, &count_query.sql, &count_query.params);
        if let Some(hit) = self.cache.get(&cache_key).await? {
            return Ok(extract_count(&hit));
        }

        let target = router::choose_target_for(ds, prefer_local, table_in_embedded);
        let timeout = self.config.count_query_timeout;
        let result = router::execute_with_retry(
            || async {
                execute_compiled(dialect, target, &self.pool, &self.embedded, ds.connection_string.as_deref(), &count_query, timeout)
                    .await
            },
            || async {
                if target == ExecTarget::Remote {
                    if let Some(dsn) = &ds.connection_string {
                        self.pool.dispose(dsn);
                    }
                }
            },
        )
        .await?;
        self.cache
            .put(
                &cache_key,
                CachedResult { columns: result.0.clone(), rows: result.1.clone() },
            )
            .await?;
        Ok(extract_count(&CachedResult { columns: result.0, rows: result.1 }))
    }

    // -----------------------------------------------------------------
    // RPC surface (spec.md §6)
    // -----------------------------------------------------------------

    #[instrument(skip(self, req))]
    pub async fn query(&self, req: RawQueryRequest, actor: &str) -> Result<QueryResult> {
        let started = Instant::now();
        let ds = self.resolve_datasource(req.datasource_id.as_deref()).await?;
        let dialect = Self::dialect_of(&ds)?;

        let limit = req.limit.unwrap_or(self.config.query_max_limit).min(self.config.query_max_limit);
        let offset = req.offset.unwrap_or(0);
        let paginated = router::wrap_pagination(dialect, &req.sql, limit, offset, self.config.query_max_limit);

        let params: Vec<BoundParam> = req
            .params
            .iter()
            .map(|(name, value)| BoundParam { name: name.clone(), value: value.clone() })
            .collect();
        let compiled = CompiledQuery { sql: paginated, params, warnings: Vec::new() };
        let heavy = crate::exec::throttle::is_heavy(Some(limit), req.include_total);

        let (columns, rows) = self
            .run(&ds, dialect, actor, heavy, &compiled, req.prefer_local_duck, req.prefer_local_table)
            .await?;

        let total_rows = if req.include_total {
            let raw_compiled = CompiledQuery { sql: req.sql.clone(), params: compiled.params.clone(), warnings: Vec::new() };
            Some(self.count(&ds, dialect, actor, &raw_compiled, req.prefer_local_duck, req.prefer_local_table).await?)
        } else {
            None
        };

        Ok(QueryResult { columns, rows, elapsed_ms: started.elapsed().as_millis() as u64, total_rows })
    }

    #[instrument(skip(self, req))]
    pub async fn query_spec(&self, req: QuerySpecRequest, actor: &str) -> Result<QueryResult> {
        let started = Instant::now();
        let ds = self.resolve_datasource(req.datasource_id.as_deref()).await?;
        let dialect = Self::dialect_of(&ds)?;

        let base = self.compose_base(
            &ds,
            dialect,
            &req.spec.source,
            req.spec.select.as_deref(),
            req.widget_id.as_deref(),
            req.spec.limit,
        );
        let admitted = Self::admitted(&base);
        let compiled = crate::sql::compiler::compile_multi_series(dialect, &base, &req.spec, &admitted);
        let limited = apply_page(&compiled, dialect, req.limit, req.offset, self.config.query_max_limit);

        let heavy = crate::exec::throttle::is_heavy(req.limit, req.include_total);
        let (columns, rows) = self.run(&ds, dialect, actor, heavy, &limited, req.prefer_local_duck, false).await?;

        let total_rows = if req.include_total {
            Some(self.count(&ds, dialect, actor, &compiled, req.prefer_local_duck, false).await?)
        } else {
            None
        };
        Ok(QueryResult { columns, rows, elapsed_ms: started.elapsed().as_millis() as u64, total_rows })
    }

    fn compile_pivot_query(&self, ds: &Datasource, dialect: Dialect, req: &PivotQueryRequest) -> CompiledQuery {
        let base = self.compose_base(ds, dialect, &req.pivot.source, None, req.widget_id.as_deref(), req.pivot.limit);
        let admitted = Self::admitted(&base);
        crate::sql::compiler::compile_pivot(dialect, &base, &req.pivot, &admitted)
    }

    #[instrument(skip(self, req))]
    pub async fn query_pivot(&self, req: PivotQueryRequest, actor: &str) -> Result<QueryResult> {
        let started = Instant::now();
        let ds = self.resolve_datasource(req.datasource_id.as_deref()).await?;
        let dialect = Self::dialect_of(&ds)?;
        let compiled = self.compile_pivot_query(&ds, dialect, &req);

        if req.pivot.limit.is_some() {
            let (columns, rows) = self.run(&ds, dialect, actor, false, &compiled, false, false).await?;
            return Ok(QueryResult { columns, rows, elapsed_ms: started.elapsed().as_millis() as u64, total_rows: None });
        }

        // Unlimited pivot: page in PIVOT_PAGE_SIZE chunks and concatenate
        // (spec.md §6 `/query/pivot`).
        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<serde_json::Value>> = Vec::new();
        let mut offset = 0u64;
        loop {
            let page_sql = router::wrap_pagination(dialect, &compiled.sql, PIVOT_PAGE_SIZE, offset, PIVOT_PAGE_SIZE);
            let page = CompiledQuery { sql: page_sql, params: compiled.params.clone(), warnings: compiled.warnings.clone() };
            let (page_cols, page_rows) = self.run(&ds, dialect, actor, true, &page, false, false).await?;
            if columns.is_empty() {
                columns = page_cols;
            }
            let page_len = page_rows.len();
            rows.extend(page_rows);
            if (page_len as u64) < PIVOT_PAGE_SIZE {
                break;
            }
            offset += PIVOT_PAGE_SIZE;
        }
        Ok(QueryResult { columns, rows, elapsed_ms: started.elapsed().as_millis() as u64, total_rows: None })
    }

    #[instrument(skip(self, req))]
    pub async fn query_pivot_sql(&self, req: PivotQueryRequest) -> Result<SqlOnlyResult> {
        let ds = self.resolve_datasource(req.datasource_id.as_deref()).await?;
        let dialect = Self::dialect_of(&ds)?;
        let compiled = self.compile_pivot_query(&ds, dialect, &req);
        Ok(SqlOnlyResult { sql: compiled.sql })
    }

    #[instrument(skip(self, req))]
    pub async fn query_distinct(&self, req: DistinctQueryRequest, actor: &str) -> Result<DistinctResult> {
        let ds = self.resolve_datasource(req.datasource_id.as_deref()).await?;
        let dialect = Self::dialect_of(&ds)?;
        let base = self.compose_base(&ds, dialect, &req.distinct.source, None, None, None);
        let admitted = Self::admitted(&base);
        let compiled = crate::sql::compiler::compile_distinct(dialect, &base, &req.distinct, &admitted);
        let (_, rows) = self.run(&ds, dialect, actor, false, &compiled, false, false).await?;
        let values = rows.into_iter().filter_map(|mut r| r.pop()).collect();
        Ok(DistinctResult { values })
    }

    fn compile_period_totals_query(
        &self,
        ds: &Datasource,
        dialect: Dialect,
        req: &PeriodTotalsQueryRequest,
    ) -> CompiledQuery {
        let base = self.compose_base(ds, dialect, &req.period.source, None, None, None);
        let admitted = Self::admitted(&base);
        crate::sql::compiler::compile_period_totals(
            dialect,
            &base,
            &req.period,
            &admitted,
            &req.period.start,
            &req.period.end,
        )
    }

    async fn run_period_totals(&self, ds: &Datasource, dialect: Dialect, actor: &str, compiled: &CompiledQuery, has_legend: bool) -> Result<PeriodTotalsResult> {
        let (columns, rows) = self.run(ds, dialect, actor, false, compiled, false, false).await?;
        if has_legend {
            let legend_idx = columns.iter().position(|c| c == "legend").unwrap_or(0);
            let total_idx = columns.iter().position(|c| c == "total").unwrap_or(columns.len().saturating_sub(1));
            let mut totals = std::collections::HashMap::new();
            for row in rows {
                let key = row.get(legend_idx).map(json_to_key).unwrap_or_default();
                let value = row.get(total_idx).and_then(|v| v.as_f64()).unwrap_or(0.0);
                totals.insert(key, value);
            }
            Ok(PeriodTotalsResult { total: None, totals: Some(totals) })
        } else {
            let total = rows.first().and_then(|r| r.first()).and_then(|v| v.as_f64());
            Ok(PeriodTotalsResult { total, totals: None })
        }
    }

    #[instrument(skip(self, req))]
    pub async fn query_period_totals(&self, req: PeriodTotalsQueryRequest, actor: &str) -> Result<PeriodTotalsResult> {
        let ds = self.resolve_datasource(req.datasource_id.as_deref()).await?;
        let dialect = Self::dialect_of(&ds)?;
        let compiled = self.compile_period_totals_query(&ds, dialect, &req);
        self.run_period_totals(&ds, dialect, actor, &compiled, req.period.legend.is_some()).await
    }

    #[instrument(skip(self, req))]
    pub async fn query_period_totals_compare(
        &self,
        req: PeriodTotalsQueryRequest,
        actor: &str,
    ) -> Result<PeriodTotalsCompareResult> {
        let ds = self.resolve_datasource(req.datasource_id.as_deref()).await?;
        let dialect = Self::dialect_of(&ds)?;
        let base = self.compose_base(&ds, dialect, &req.period.source, None, None, None);
        let admitted = Self::admitted(&base);
        let (cur_q, prev_q) =
            crate::sql::compiler::compile_period_totals_compare(dialect, &base, &req.period, &admitted)
                .ok_or_else(|| EngineError::BadRequest("prevStart/prevEnd required for compare".to_string()))?;
        let has_legend = req.period.legend.is_some();
        let cur = self.run_period_totals(&ds, dialect, actor, &cur_q, has_legend).await?;
        let prev = self.run_period_totals(&ds, dialect, actor, &prev_q, has_legend).await?;
        Ok(PeriodTotalsCompareResult { cur, prev })
    }

    #[instrument(skip(self, req))]
    pub async fn query_period_totals_batch(
        &self,
        req: PeriodTotalsBatchRequest,
        actor: &str,
    ) -> Result<PeriodTotalsBatchResult> {
        let mut results = std::collections::HashMap::new();
        for (idx, item) in req.requests.into_iter().enumerate() {
            let key = item.key.clone().unwrap_or_else(|| idx.to_string());
            let single = self.query_period_totals(item.request, actor).await?;
            results.insert(key, single);
        }
        Ok(PeriodTotalsBatchResult { results })
    }

    // -----------------------------------------------------------------
    // Administration (spec.md §6 "Administration")
    // -----------------------------------------------------------------

    pub fn dispose_engine(&self, dsn: &str) {
        self.pool.dispose(dsn);
    }

    pub fn dispose_all_engines(&self) {
        self.pool.dispose_all();
    }
}

fn json_to_key(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn extract_count(cached: &CachedResult) -> u64 {
    cached
        .rows
        .first()
        .and_then(|r| r.first())
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
        .unwrap_or(0)
}

fn strip_trailing_limit_offset(sql: &str) -> String {
    let upper = sql.to_ascii_uppercase();
    match upper.find(" LIMIT ") {
        Some(i) => sql[..i].to_string(),
        None => sql.to_string(),
    }
}

fn apply_page(compiled: &CompiledQuery, dialect: Dialect, limit: Option<u64>, offset: Option<u64>, max_limit: u64) -> CompiledQuery {
    match limit {
        None => compiled.clone(),
        Some(limit) => {
            let inner = strip_trailing_limit_offset(&compiled.sql);
            let sql = router::wrap_pagination(dialect, &inner, limit, offset.unwrap_or(0), max_limit);
            CompiledQuery { sql, params: compiled.params.clone(), warnings: compiled.warnings.clone() }
        }
    }
}

static PARAM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Rewrite `:name` placeholders into `dialect`'s native positional syntax,
/// returning the values in occurrence order for binding.
fn rewrite_placeholders<'a>(dialect: Dialect, sql: &str, params: &'a [BoundParam]) -> (String, Vec<&'a FilterValue>) {
    let by_name: std::collections::HashMap<&str, &FilterValue> =
        params.iter().map(|p| (p.name.as_str(), &p.value)).collect();
    let mut ordered_values = Vec::new();
    let mut counter = 0usize;
    let rewritten = PARAM_RE.replace_all(sql, |caps: &regex::Captures| {
        let name = &caps[1];
        match by_name.get(name) {
            Some(value) => {
                ordered_values.push(*value);
                counter += 1;
                match dialect {
                    Dialect::Postgres => format!("${counter}"),
                    Dialect::Mssql => format!("@p{counter}"),
                    Dialect::Mysql | Dialect::Sqlite | Dialect::EmbeddedColumnar => "?".to_string(),
                }
            }
            None => caps[0].to_string(),
        }
    });
    (rewritten.into_owned(), ordered_values)
}

fn filter_value_to_duck(value: &FilterValue) -> duckdb::types::Value {
    match value {
        FilterValue::Null => duckdb::types::Value::Null,
        FilterValue::Bool(b) => duckdb::types::Value::Boolean(*b),
        FilterValue::Number(n) => duckdb::types::Value::Double(*n),
        FilterValue::Text(s) => duckdb::types::Value::Text(s.clone()),
        FilterValue::Array(_) => duckdb::types::Value::Null,
    }
}

fn duck_value_to_json(value: duckdb::types::Value) -> serde_json::Value {
    use duckdb::types::Value as D;
    match value {
        D::Null => serde_json::Value::Null,
        D::Boolean(b) => serde_json::Value::Bool(b),
        D::TinyInt(n) => serde_json::json!(n),
        D::SmallInt(n) => serde_json::json!(n),
        D::Int(n) => serde_json::json!(n),
        D::BigInt(n) => serde_json::json!(n),
        D::HugeInt(n) => serde_json::Value::String(n.to_string()),
        D::UTinyInt(n) => serde_json::json!(n),
        D::USmallInt(n) => serde_json::json!(n),
        D::UInt(n) => serde_json::json!(n),
        D::UBigInt(n) => serde_json::json!(n),
        D::Float(n) => serde_json::json!(n),
        D::Double(n) => serde_json::json!(n),
        D::Text(s) => serde_json::Value::String(s),
        D::Blob(b) => serde_json::Value::String(format!("\\x{}", hex_encode(&b))),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn execute_compiled(
    dialect: Dialect,
    target: ExecTarget,
    pool: &EnginePool,
    embedded: &EmbeddedHandle,
    dsn: Option<&str>,
    compiled: &CompiledQuery,
    timeout: std::time::Duration,
) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
    if target == ExecTarget::Embedded {
        return execute_embedded(embedded, compiled);
    }

    let dsn = dsn.ok_or_else(|| EngineError::BadRequest("remote datasource missing connection string".to_string()))?;
    let engine = pool.get(dialect, dsn).await?;
    if let Some(timeout_sql) = router::statement_timeout_sql(dialect, timeout) {
        apply_session_timeout(&engine, &timeout_sql).await?;
    }
    execute_remote(dialect, &engine, compiled).await
}

async fn apply_session_timeout(engine: &RemoteEngine, sql: &str) -> Result<()> {
    match engine {
        RemoteEngine::Postgres(pool) => {
            sqlx::query(sql).execute(pool).await.map_err(|e| EngineError::BadGateway(e.to_string()))?;
        }
        RemoteEngine::Mysql(pool) => {
            sqlx::query(sql).execute(pool).await.map_err(|e| EngineError::BadGateway(e.to_string()))?;
        }
        RemoteEngine::Sqlite(_) => {}
        RemoteEngine::Mssql(client) => {
            let mut guard = client.lock().await;
            guard.simple_query(sql).await.map_err(|e| EngineError::BadGateway(e.to_string()))?;
        }
    }
    Ok(())
}

fn execute_embedded(embedded: &EmbeddedHandle, compiled: &CompiledQuery) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
    let (sql, values) = rewrite_placeholders(Dialect::EmbeddedColumnar, &compiled.sql, &compiled.params);
    let duck_params: Vec<duckdb::types::Value> = values.into_iter().map(filter_value_to_duck).collect();
    embedded.with_connection(|conn| {
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| EngineError::Internal(format!("failed to prepare query: {e}")))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(|c| c.to_string()).collect();
        let column_count = columns.len();
        let rows = stmt
            .query_map(duckdb::params_from_iter(duck_params), move |row| {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    let v: duckdb::types::Value = row.get(i)?;
                    values.push(duck_value_to_json(v));
                }
                Ok(values)
            })
            .map_err(|e| EngineError::Internal(format!("query failed: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Internal(format!("row decode failed: {e}")))?;
        Ok((columns, rows))
    })
}

async fn execute_remote(
    dialect: Dialect,
    engine: &RemoteEngine,
    compiled: &CompiledQuery,
) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
    let (sql, values) = rewrite_placeholders(dialect, &compiled.sql, &compiled.params);
    match engine {
        RemoteEngine::Postgres(pool) => execute_sqlx_postgres(pool, &sql, &values).await,
        RemoteEngine::Mysql(pool) => execute_sqlx_mysql(pool, &sql, &values).await,
        RemoteEngine::Sqlite(pool) => execute_sqlx_sqlite(pool, &sql, &values).await,
        RemoteEngine::Mssql(client) => execute_mssql(client, &sql, &values).await,
    }
}

async fn execute_sqlx_postgres(
    pool: &sqlx::PgPool,
    sql: &str,
    values: &[&FilterValue],
) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
    use sqlx::{Column, Row};
    let mut query = sqlx::query(sql);
    for value in values {
        query = match value {
            FilterValue::Null => query.bind(None::<String>),
            FilterValue::Bool(b) => query.bind(*b),
            FilterValue::Number(n) => query.bind(*n),
            FilterValue::Text(s) => query.bind(s.clone()),
            FilterValue::Array(_) => query.bind(None::<String>),
        };
    }
    let rows = query.fetch_all(pool).await.map_err(|e| EngineError::BadGateway(e.to_string()))?;
    let columns = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let out = rows
        .iter()
        .map(|row| {
            (0..row.columns().len())
                .map(|i| pg_value_to_json(row, i))
                .collect()
        })
        .collect();
    Ok((columns, out))
}

fn pg_value_to_json(row: &sqlx::postgres::PgRow, i: usize) -> serde_json::Value {
    use sqlx::Row;
    if let Ok(v) = row.try_get::<i64, _>(i) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<bool, _>(i) {
        return serde_json::Value::Bool(v);
    }
    if let Ok(v) = row.try_get::<String, _>(i) {
        return serde_json::Value::String(v);
    }
    if let Ok(v) = row.try_get::<chrono::NaiveDateTime, _>(i) {
        return serde_json::Value::String(v.to_string());
    }
    serde_json::Value::Null
}

async fn execute_sqlx_mysql(
    pool: &sqlx::MySqlPool,
    sql: &str,
    values: &[&FilterValue],
) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
    use sqlx::{Column, Row};
    let mut query = sqlx::query(sql);
    for value in values {
        query = match value {
            FilterValue::Null => query.bind(None::<String>),
            FilterValue::Bool(b) => query.bind(*b),
            FilterValue::Number(n) => query.bind(*n),
            FilterValue::Text(s) => query.bind(s.clone()),
            FilterValue::Array(_) => query.bind(None::<String>),
        };
    }
    let rows = query.fetch_all(pool).await.map_err(|e| EngineError::BadGateway(e.to_string()))?;
    let columns = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let out = rows
        .iter()
        .map(|row| (0..row.columns().len()).map(|i| mysql_value_to_json(row, i)).collect())
        .collect();
    Ok((columns, out))
}

fn mysql_value_to_json(row: &sqlx::mysql::MySqlRow, i: usize) -> serde_json::Value {
    use sqlx::Row;
    if let Ok(v) = row.try_get::<i64, _>(i) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<bool, _>(i) {
        return serde_json::Value::Bool(v);
    }
    if let Ok(v) = row.try_get::<String, _>(i) {
        return serde_json::Value::String(v);
    }
    serde_json::Value::Null
}

async fn execute_sqlx_sqlite(
    pool: &sqlx::SqlitePool,
    sql: &str,
    values: &[&FilterValue],
) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
    use sqlx::{Column, Row};
    let mut query = sqlx::query(sql);
    for value in values {
        query = match value {
            FilterValue::Null => query.bind(None::<String>),
            FilterValue::Bool(b) => query.bind(*b),
            FilterValue::Number(n) => query.bind(*n),
            FilterValue::Text(s) => query.bind(s.clone()),
            FilterValue::Array(_) => query.bind(None::<String>),
        };
    }
    let rows = query.fetch_all(pool).await.map_err(|e| EngineError::BadGateway(e.to_string()))?;
    let columns = rows
        .first()
        .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let out = rows
        .iter()
        .map(|row| (0..row.columns().len()).map(|i| sqlite_value_to_json(row, i)).collect())
        .collect();
    Ok((columns, out))
}

fn sqlite_value_to_json(row: &sqlx::sqlite::SqliteRow, i: usize) -> serde_json::Value {
    use sqlx::Row;
    if let Ok(v) = row.try_get::<i64, _>(i) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<f64, _>(i) {
        return serde_json::json!(v);
    }
    if let Ok(v) = row.try_get::<bool, _>(i) {
        return serde_json::Value::Bool(v);
    }
    if let Ok(v) = row.try_get::<String, _>(i) {
        return serde_json::Value::String(v);
    }
    serde_json::Value::Null
}

async fn execute_mssql(
    client: &tokio::sync::Mutex<tiberius::Client<tokio_util::compat::Compat<tokio::net::TcpStream>>>,
    sql: &str,
    values: &[&FilterValue],
) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>)> {
    let mut guard = client.lock().await;
    let mut query = tiberius::Query::new(sql);
    for value in values {
        match value {
            FilterValue::Null => query.bind(Option::<i32>::None),
            FilterValue::Bool(b) => query.bind(*b),
            FilterValue::Number(n) => query.bind(*n),
            FilterValue::Text(s) => query.bind(s.clone()),
            FilterValue::Array(_) => query.bind(Option::<i32>::None),
        }
    }
    let stream = query.query(&mut guard).await.map_err(|e| EngineError::BadGateway(e.to_string()))?;
    let result = stream.into_results().await.map_err(|e| EngineError::BadGateway(e.to_string()))?;
    let mut columns = Vec::new();
    let mut out = Vec::new();
    for batch in result {
        for row in batch {
            if columns.is_empty() {
                columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            let values: Vec<serde_json::Value> = (0..row.columns().len()).map(|i| mssql_value_to_json(&row, i)).collect();
            out.push(values);
        }
    }
    Ok((columns, out))
}

fn mssql_value_to_json(row: &tiberius::Row, i: usize) -> serde_json::Value {
    if let Ok(Some(v)) = row.try_get::<i64, _>(i) {
        return serde_json::json!(v);
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(i) {
        return serde_json::json!(v);
    }
    if let Ok(Some(v)) = row.try_get::<bool, _>(i) {
        return serde_json::Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(i) {
        return serde_json::Value::String(v.to_string());
    }
    serde_json::Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FilterValue;
    use crate::sql::where_planner::BoundParam;

    #[test]
    fn rewrite_placeholders_produces_positional_postgres_markers() {
        let params = vec![
            BoundParam { name: "w_a_0".to_string(), value: FilterValue::Number(1.0) },
            BoundParam { name: "w_b_1".to_string(), value: FilterValue::Text("x".to_string()) },
        ];
        let (sql, values) = rewrite_placeholders(Dialect::Postgres, "SELECT * FROM t WHERE a = :w_a_0 AND b = :w_b_1", &params);
        assert_eq!(sql, "SELECT * FROM t WHERE a = $1 AND b = $2");
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn rewrite_placeholders_uses_question_mark_for_mysql_and_duckdb() {
        let params = vec![BoundParam { name: "w_a_0".to_string(), value: FilterValue::Number(1.0) }];
        let (sql, _) = rewrite_placeholders(Dialect::Mysql, "SELECT * FROM t WHERE a = :w_a_0", &params);
        assert_eq!(sql, "SELECT * FROM t WHERE a = ?");
    }

    #[test]
    fn rewrite_placeholders_uses_named_params_for_mssql() {
        let params = vec![BoundParam { name: "w_a_0".to_string(), value: FilterValue::Number(1.0) }];
        let (sql, _) = rewrite_placeholders(Dialect::Mssql, "SELECT * FROM t WHERE a = :w_a_0", &params);
        assert_eq!(sql, "SELECT * FROM t WHERE a = @p1");
    }

    #[test]
    fn strip_trailing_limit_offset_removes_limit_clause() {
        let sql = strip_trailing_limit_offset("SELECT * FROM (SELECT * FROM t) AS _q LIMIT 50 OFFSET 0");
        assert_eq!(sql, "SELECT * FROM (SELECT * FROM t) AS _q");
    }
}
