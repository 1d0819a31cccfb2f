//! API Ingest (C14, spec.md §4.14).
//!
//! Drives HTTP-sourced syncs against an `HttpApi` datasource: resolves
//! placeholders and date macros, applies one of several auth flows, walks
//! page/cursor pagination, parses CSV or JSON, flattens nested records, and
//! writes the result into the embedded store with schema evolution. Grounded
//! directly on `original_source/backend/app/api_ingest.py`, which this
//! module reimplements in idiom rather than translates line-for-line.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::exec::embedded::EmbeddedHandle;
use crate::model::{
    ApiIngestConfig, AuthConfig, GapFillConfig, PaginationConfig, Placeholder, PlaceholderKind,
    SequenceConfig,
};

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub row_count: u64,
    pub window_start: Option<String>,
    pub window_end: Option<String>,
}

// ---------------------------------------------------------------------------
// Placeholders & date macros
// ---------------------------------------------------------------------------

fn offset_regex() -> Regex {
    Regex::new(r"^([+-])(\d+)([dhwmy])$").expect("static regex")
}

fn apply_offset(dt: DateTime<Utc>, offset: Option<&str>) -> DateTime<Utc> {
    let Some(offset) = offset else { return dt };
    let Some(caps) = offset_regex().captures(offset) else {
        return dt;
    };
    let sign = if &caps[1] == "-" { -1i64 } else { 1i64 };
    let num: i64 = caps[2].parse().unwrap_or(0);
    let num = sign * num;
    match &caps[3] {
        "d" => dt + chrono::Duration::days(num),
        "h" => dt + chrono::Duration::hours(num),
        "w" => dt + chrono::Duration::weeks(num),
        // Month/year offsets are approximated as 30/365 days, matching the
        // original implementation (original_source/api_ingest.py).
        "m" => dt + chrono::Duration::days(30 * num),
        "y" => dt + chrono::Duration::days(365 * num),
        _ => dt,
    }
}

fn start_of_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc()
}

fn start_of_week(dt: DateTime<Utc>) -> DateTime<Utc> {
    let days_since_monday = dt.weekday().num_days_from_monday() as i64;
    start_of_day(dt - chrono::Duration::days(days_since_monday))
}

fn date_macro_regex() -> Regex {
    Regex::new(
        r"(?i)^(today|yesterday|startOfDay|startOfWeek|startOfMonth|startOfQuarter|startOfYear|endOfDay|endOfMonth|endOfYear|eom|eoy)([+-]\d+[dhwmy])?$",
    )
    .expect("static regex")
}

/// Parse a stored watermark value, as `original_source/backend/app/
/// api_ingest.py:751-753` does via `datetime.fromisoformat(str(last))`:
/// try a plain ISO date first (the common case for a DATE-typed destination
/// column, which `max_date` reads back as `"2024-01-01"` with no time
/// component), then a full RFC3339 timestamp, then fall through to the
/// macro/offset grammar.
fn parse_watermark_date(val: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let trimmed = val.trim();
    if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return dt.with_timezone(&Utc);
    }
    parse_date_macro(trimmed, now)
}

/// Resolve a date macro/offset (spec.md §4.14 "Placeholders"). Falls back to
/// an ISO-8601 parse, then to `now`, exactly as the original implementation.
pub fn parse_date_macro(val: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let trimmed = val.trim();
    let Some(caps) = date_macro_regex().captures(trimmed) else {
        return DateTime::parse_from_rfc3339(trimmed)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(now);
    };
    let base = caps[1].to_ascii_lowercase();
    let offset = caps.get(2).map(|m| m.as_str());
    let dt = match base.as_str() {
        "today" => start_of_day(now),
        "yesterday" => start_of_day(now - chrono::Duration::days(1)),
        "startofday" => start_of_day(now),
        "startofweek" => start_of_week(now),
        "startofmonth" => start_of_day(now)
            .with_day(1)
            .unwrap(),
        "startofquarter" => {
            let month = ((now.month0() / 3) * 3) + 1;
            start_of_day(now).with_month(month).unwrap().with_day(1).unwrap()
        }
        "startofyear" => start_of_day(now).with_month(1).unwrap().with_day(1).unwrap(),
        "endofday" => start_of_day(now)
            .with_hour(23)
            .unwrap()
            .with_minute(59)
            .unwrap()
            .with_second(59)
            .unwrap(),
        "endofmonth" | "eom" => {
            let first_of_next = if now.month() == 12 {
                start_of_day(now).with_year(now.year() + 1).unwrap().with_month(1).unwrap()
            } else {
                start_of_day(now).with_month(now.month() + 1).unwrap()
            }
            .with_day(1)
            .unwrap();
            first_of_next - chrono::Duration::days(1)
        }
        "endofyear" | "eoy" => start_of_day(now).with_month(12).unwrap().with_day(31).unwrap(),
        _ => now,
    };
    apply_offset(dt, offset)
}

fn resolve_secret_refs(s: &str) -> String {
    let re = Regex::new(r"\{\{\s*secret:([^}]+)\}\}").expect("static regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(caps[1].trim()).unwrap_or_default()
    })
    .into_owned()
}

/// Convert friendly date tokens (`YYYY`, `MM`, `DD`, `HH`, `mm`, `ss`) to
/// `chrono::format::strftime` tokens; a format already containing `%` passes
/// through untouched (spec.md §4.14 "Format tokens").
fn normalize_format(fmt: &str) -> String {
    if fmt.contains('%') {
        return fmt.to_string();
    }
    let mut out = fmt.to_string();
    for (pat, rep) in [
        ("YYYY", "%Y"),
        ("YYY", "%Y"),
        ("YY", "%y"),
        ("MM", "%m"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("mm", "%M"),
        ("ss", "%S"),
    ] {
        out = out.replace(pat, rep);
    }
    out
}

fn format_value(kind: PlaceholderKind, value: Option<&str>, format: Option<&str>, now: DateTime<Utc>) -> String {
    match kind {
        PlaceholderKind::Date => {
            let dt = parse_date_macro(value.unwrap_or("today"), now);
            let fmt = format.map(normalize_format).unwrap_or_else(|| "%Y-%m-%d".to_string());
            dt.format(&fmt).to_string()
        }
        PlaceholderKind::Static => resolve_secret_refs(value.unwrap_or("")),
    }
}

fn token_replace(template: &str, ctx: &HashMap<String, String>) -> String {
    let mut s = template.to_string();
    for (k, v) in ctx {
        s = s.replace(&format!("{{{k}}}"), v);
    }
    resolve_secret_refs(&s)
}

// ---------------------------------------------------------------------------
// JSON / CSV parsing
// ---------------------------------------------------------------------------

/// Select the array of records at `root` (a dot path, optionally prefixed
/// `$.`), or apply the same fallback heuristics as the original
/// implementation when `root` is absent (spec.md §4.14 "Parsing").
fn get_json_root(doc: &Value, root: Option<&str>) -> Vec<Value> {
    let Some(root) = root.filter(|r| !r.is_empty()) else {
        return match doc {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map
                .values()
                .find(|v| v.is_array())
                .map(|v| v.as_array().unwrap().clone())
                .unwrap_or_else(|| vec![doc.clone()]),
            _ => Vec::new(),
        };
    };
    let path = root.strip_prefix("$.").unwrap_or(root);
    let mut cur = doc;
    for part in path.split('.') {
        match cur {
            Value::Object(map) => match map.get(part) {
                Some(v) => cur = v,
                None => return Vec::new(),
            },
            _ => return Vec::new(),
        }
    }
    match cur {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn is_csv_format(content_type: &str, parse_hint: Option<&str>, format_query_param: Option<&str>) -> bool {
    if parse_hint.map(|h| h.eq_ignore_ascii_case("csv")).unwrap_or(false) {
        return true;
    }
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("csv") {
        return true;
    }
    format_query_param.map(|f| f.eq_ignore_ascii_case("csv")).unwrap_or(false)
}

/// Parse CSV text into JSON objects: sniff the delimiter among `,;\t|`, strip
/// a BOM and `#`/`//` comment lines, synthesize `col1..colN` headers for
/// blank columns, and de-duplicate repeated headers with a numeric suffix
/// (spec.md §4.14 "Parsing").
fn parse_csv(text: &str) -> Vec<Value> {
    let cleaned = text.trim_start_matches('\u{feff}');
    let lines: Vec<&str> = cleaned
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            !(t.is_empty() || t.starts_with('#') || t.starts_with("//"))
        })
        .collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let sample = lines[0];
    let delimiter = [',', ';', '\t', '|']
        .iter()
        .copied()
        .max_by_key(|d| sample.matches(*d).count())
        .unwrap_or(',');

    let joined = lines.join("\n");
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(true)
        .flexible(true)
        .from_reader(joined.as_bytes());

    let raw_headers: Vec<String> = reader
        .headers()
        .map(|h| h.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default();
    let headers = dedupe_headers(&raw_headers);

    let mut out = Vec::new();
    for record in reader.records().flatten() {
        let mut obj = Map::new();
        for (i, field) in record.iter().enumerate() {
            let key = headers
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("col{}", i + 1));
            let value = if field.is_empty() {
                Value::Null
            } else {
                Value::String(field.to_string())
            };
            obj.insert(key, value);
        }
        out.push(Value::Object(obj));
    }
    out
}

fn dedupe_headers(raw: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, u32> = HashMap::new();
    raw.iter()
        .enumerate()
        .map(|(i, h)| {
            let base = if h.trim().is_empty() {
                format!("col{}", i + 1)
            } else {
                h.clone()
            };
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{base}_{count}")
            }
        })
        .collect()
}

/// Flatten nested objects into dot-compound keys joined with `_`
/// (`a.b.c → a_b_c`); arrays become JSON-serialized strings (spec.md §4.14
/// "Flatten").
fn flatten_record(rec: &Value, prefix: &str, out: &mut Map<String, Value>) {
    match rec {
        Value::Object(map) => {
            for (k, v) in map {
                let next_prefix = if prefix.is_empty() {
                    format!("{k}_")
                } else {
                    format!("{prefix}{k}_")
                };
                flatten_record(v, &next_prefix, out);
            }
        }
        Value::Array(_) => {
            let key = prefix.trim_end_matches('_').to_string();
            out.insert(key, Value::String(rec.to_string()));
        }
        other => {
            let key = prefix.trim_end_matches('_').to_string();
            out.insert(key, other.clone());
        }
    }
}

fn sanitize_col(name: &str) -> String {
    let re = Regex::new(r"[^A-Za-z0-9_]+").expect("static regex");
    let mut n = re.replace_all(name.trim(), "_").into_owned();
    if n.is_empty() {
        n = "col".to_string();
    }
    if n.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        n = format!("c_{n}");
    }
    n
}

fn infer_duck_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "VARCHAR",
        Value::Bool(_) => "BOOLEAN",
        Value::Number(n) if n.is_i64() || n.is_u64() => "BIGINT",
        Value::Number(_) => "DOUBLE",
        Value::String(s) => {
            if DateTime::parse_from_rfc3339(s).is_ok() {
                "TIMESTAMP"
            } else if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
                "DATE"
            } else {
                "VARCHAR"
            }
        }
        Value::Array(_) | Value::Object(_) => "VARCHAR",
    }
}

// ---------------------------------------------------------------------------
// Embedded-store writes
// ---------------------------------------------------------------------------

fn ensure_table_schema(handle: &EmbeddedHandle, table: &str, sample: &Map<String, Value>) -> Result<Vec<String>> {
    let cols: Vec<(String, &'static str)> = sample
        .iter()
        .map(|(k, v)| (sanitize_col(k), infer_duck_type(v)))
        .collect();
    handle.with_connection(|conn| -> Result<Vec<String>> {
        let mut existing = std::collections::HashSet::new();
        if let Ok(mut stmt) = conn.prepare(&format!("PRAGMA table_info('{table}')")) {
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            for r in rows.flatten() {
                existing.insert(r);
            }
        }
        if existing.is_empty() {
            let cols_sql = cols
                .iter()
                .map(|(c, t)| format!("\"{c}\" {t}"))
                .collect::<Vec<_>>()
                .join(", ");
            conn.execute_batch(&format!("CREATE TABLE IF NOT EXISTS \"{table}\" ({cols_sql})"))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        } else {
            for (c, t) in &cols {
                if !existing.contains(c) {
                    conn.execute_batch(&format!("ALTER TABLE \"{table}\" ADD COLUMN \"{c}\" {t}"))
                        .map_err(|e| EngineError::Internal(e.to_string()))?;
                }
            }
        }
        Ok(cols.into_iter().map(|(c, _)| c).collect())
    })
}

fn json_to_duck_param(value: &Value) -> duckdb::types::Value {
    match value {
        Value::Null => duckdb::types::Value::Null,
        Value::Bool(b) => duckdb::types::Value::Boolean(*b),
        Value::Number(n) if n.is_i64() => duckdb::types::Value::BigInt(n.as_i64().unwrap()),
        Value::Number(n) => duckdb::types::Value::Double(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => duckdb::types::Value::Text(s.clone()),
        other => duckdb::types::Value::Text(other.to_string()),
    }
}

fn insert_rows(handle: &EmbeddedHandle, table: &str, columns: &[String], rows: &[Map<String, Value>]) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let quoted_cols = columns.iter().map(|c| format!("\"{c}\"")).collect::<Vec<_>>().join(", ");
    let placeholders = columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!("INSERT INTO \"{table}\" ({quoted_cols}) VALUES ({placeholders})");
    handle.with_connection(|conn| -> Result<u64> {
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        for row in rows {
            let params: Vec<duckdb::types::Value> = columns
                .iter()
                .map(|c| row.get(c).map(json_to_duck_param).unwrap_or(duckdb::types::Value::Null))
                .collect();
            stmt.execute(duckdb::params_from_iter(params))
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }
        Ok(rows.len() as u64)
    })
}

fn delete_window(handle: &EmbeddedHandle, table: &str, date_field: &str, start: &str, end: &str) -> Result<()> {
    handle.with_connection(|conn| {
        conn.execute(
            &format!("DELETE FROM \"{table}\" WHERE \"{date_field}\" >= ? AND \"{date_field}\" <= ?"),
            duckdb::params![start, end],
        )
        .map_err(|e| EngineError::Internal(e.to_string()))
    })?;
    Ok(())
}

fn max_date(handle: &EmbeddedHandle, table: &str, date_field: &str) -> Option<String> {
    handle
        .with_connection(|conn| {
            conn.query_row(&format!("SELECT MAX(\"{date_field}\") FROM \"{table}\""), [], |row| {
                row.get::<_, Option<String>>(0)
            })
        })
        .ok()
        .flatten()
}

fn apply_gap_fill(handle: &EmbeddedHandle, table: &str, date_field: &str, key_fields: &[String]) -> Result<()> {
    if key_fields.is_empty() {
        return Ok(());
    }
    let keys = key_fields.iter().map(|k| format!("\"{k}\"")).collect::<Vec<_>>().join(", ");
    let filled = format!("{table}_filled");
    handle.with_connection(|conn| -> Result<()> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info('{table}')"))
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let cols: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| EngineError::Internal(e.to_string()))?
            .flatten()
            .collect();
        let non_keys: Vec<&String> = cols
            .iter()
            .filter(|c| !key_fields.contains(c) && *c != date_field)
            .collect();
        let select_cols = std::iter::once(keys.clone())
            .chain(std::iter::once(format!("\"{date_field}\"")))
            .chain(non_keys.iter().map(|c| {
                format!(
                    "last_value(\"{c}\" ignore nulls) over (partition by {keys} order by \"{date_field}\" rows between unbounded preceding and current row) as \"{c}\""
                )
            }))
            .collect::<Vec<_>>()
            .join(", ");
        let join_cond = key_fields
            .iter()
            .map(|k| format!("d.\"{k}\"=a.\"{k}\""))
            .chain(std::iter::once(format!("d.\"{date_field}\"=a.\"{date_field}\"")))
            .collect::<Vec<_>>()
            .join(" and ");
        let sql = format!(
            "create or replace table \"{filled}\" as \
            with d as (select * from \"{table}\"), \
            all_days as ( \
              select {keys}, g::date as \"{date_field}\" \
              from (select distinct {keys} from d), \
                   generate_series((select min(\"{date_field}\") from d), (select max(\"{date_field}\") from d), interval 1 day) as t(g) \
            ), \
            joined as ( \
              select a.* exclude ({keys}), d.* exclude ({keys}, \"{date_field}\") \
              from all_days a \
              left join d on {join_cond} \
            ) \
            select {select_cols} from joined"
        );
        conn.execute_batch(&sql).map_err(|e| EngineError::Internal(e.to_string()))
    })
}

fn truncate_table(handle: &EmbeddedHandle, table: &str) {
    let _ = handle.with_connection(|conn| conn.execute(&format!("DELETE FROM \"{table}\""), []));
}

// ---------------------------------------------------------------------------
// HTTP request + auth + pagination
// ---------------------------------------------------------------------------

async fn apply_auth(
    client: &reqwest::Client,
    auth: Option<&AuthConfig>,
    headers: &mut HashMap<String, String>,
    params: &mut HashMap<String, String>,
) {
    match auth {
        None | Some(AuthConfig::None) => {}
        Some(AuthConfig::Bearer { token }) => {
            headers.insert("Authorization".to_string(), format!("Bearer {}", resolve_secret_refs(token)));
        }
        Some(AuthConfig::ApiKeyHeader { header, value }) => {
            headers.insert(header.clone(), resolve_secret_refs(value));
        }
        Some(AuthConfig::ApiKeyQuery { param, value }) => {
            params.insert(param.clone(), resolve_secret_refs(value));
        }
        Some(AuthConfig::Basic { username, password }) => {
            let user = resolve_secret_refs(username);
            let pass = resolve_secret_refs(password);
            let token = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, format!("{user}:{pass}"));
            headers.insert("Authorization".to_string(), format!("Basic {token}"));
        }
        Some(AuthConfig::Oauth2ClientCredentials { token_url, client_id, client_secret, scope }) => {
            let id = resolve_secret_refs(client_id);
            let secret = resolve_secret_refs(client_secret);
            let mut form = vec![("grant_type", "client_credentials".to_string())];
            if let Some(scope) = scope {
                form.push(("scope", scope.clone()));
            }
            let resp = client
                .post(token_url)
                .basic_auth(id, Some(secret))
                .form(&form)
                .send()
                .await;
            if let Ok(resp) = resp {
                if let Ok(json) = resp.json::<Value>().await {
                    if let Some(token) = json.get("access_token").and_then(|v| v.as_str()) {
                        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                    }
                }
            }
        }
    }
}

struct HttpResponse {
    status: u16,
    content_type: String,
    body: String,
}

async fn do_request(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    headers: &HashMap<String, String>,
    params: &HashMap<String, String>,
    body: Option<&str>,
) -> Result<HttpResponse> {
    let method = reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut req = client.request(method.clone(), url).query(&params.iter().collect::<Vec<_>>());
    for (k, v) in headers {
        req = req.header(k, v);
    }
    if method != reqwest::Method::GET {
        if let Some(body) = body {
            req = req.body(body.to_string());
        }
    }
    let resp = req
        .send()
        .await
        .map_err(|e| EngineError::BadGateway(format!("http request failed: {e}")))?;
    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let body = resp
        .text()
        .await
        .map_err(|e| EngineError::BadGateway(format!("failed reading response body: {e}")))?;
    Ok(HttpResponse { status, content_type, body })
}

fn parse_response(resp: &HttpResponse, parse_hint: Option<&str>, json_root: Option<&str>) -> Vec<Value> {
    if is_csv_format(&resp.content_type, parse_hint, None) {
        parse_csv(&resp.body)
    } else {
        let doc: Value = serde_json::from_str(&resp.body).unwrap_or(Value::Null);
        get_json_root(&doc, json_root)
    }
}

/// Run one API sync for a single endpoint definition (spec.md §4.14).
/// `now` is supplied by the caller (date macros must be deterministic within
/// one run).
pub async fn run_api_sync(
    handle: &EmbeddedHandle,
    client: &reqwest::Client,
    cfg: &ApiIngestConfig,
    dest_table: &str,
    now: DateTime<Utc>,
) -> Result<IngestResult> {
    info!(dest_table, "api ingest run starting");

    let mut ctx: HashMap<String, String> = HashMap::new();
    for p in &cfg.placeholders {
        ctx.insert(
            p.name.clone(),
            format_value(p.kind, p.value.as_deref(), p.format.as_deref(), now),
        );
    }

    let mut window_start = None;
    let mut window_end = None;
    if let Some(seq) = &cfg.sequence {
        if seq.enabled {
            window_range(handle, dest_table, seq, now, &mut window_start, &mut window_end);
            if window_start.is_none() {
                return Ok(IngestResult { row_count: 0, window_start: None, window_end: None });
            }
            ctx.insert("start".to_string(), window_start.clone().unwrap());
            ctx.insert("end".to_string(), window_end.clone().unwrap());
        }
    }

    let url = token_replace(&cfg.endpoint, &ctx);
    let mut headers: HashMap<String, String> = cfg
        .headers
        .iter()
        .map(|h| (h.key.clone(), token_replace(&h.value, &ctx)))
        .collect();
    let mut params: HashMap<String, String> = cfg
        .query
        .iter()
        .map(|q| (q.key.clone(), token_replace(&q.value, &ctx)))
        .collect();
    apply_auth(client, cfg.auth.as_ref(), &mut headers, &mut params).await;

    if let (Some(seq), Some(start)) = (&cfg.sequence, &window_start) {
        if let Some(param) = &seq.start_param {
            params.insert(param.clone(), start.clone());
        }
    }
    if let (Some(seq), Some(end)) = (&cfg.sequence, &window_end) {
        if let Some(param) = &seq.end_param {
            params.insert(param.clone(), end.clone());
        }
    }
    let body = (cfg.method.to_ascii_uppercase() != "GET")
        .then(|| cfg.body.as_ref().map(|b| token_replace(b, &ctx)))
        .flatten();

    let items = fetch_all_pages(client, &cfg.method, &url, &headers, &mut params, body.as_deref(), cfg).await?;

    let mut flat: Vec<Map<String, Value>> = Vec::new();
    for item in &items {
        let mut out = Map::new();
        flatten_record(item, "", &mut out);
        flat.push(out);
    }

    let Some(sample) = flat.iter().find(|m| !m.is_empty()).cloned() else {
        info!(dest_table, "no rows parsed, nothing to insert");
        return Ok(IngestResult { row_count: 0, window_start, window_end });
    };

    let sanitized_sample: Map<String, Value> = sample
        .iter()
        .map(|(k, v)| (sanitize_col(k), v.clone()))
        .collect();
    let columns = ensure_table_schema(handle, dest_table, &sanitized_sample)?;

    let sanitized_rows: Vec<Map<String, Value>> = flat
        .into_iter()
        .map(|row| row.into_iter().map(|(k, v)| (sanitize_col(&k), v)).collect())
        .collect();

    if let (Some(seq), Some(start), Some(end)) = (&cfg.sequence, &window_start, &window_end) {
        delete_window(handle, dest_table, &seq.date_field, start, end)?;
    } else if matches!(cfg.write_mode.as_deref(), Some("replace") | Some("truncate_insert")) {
        truncate_table(handle, dest_table);
    }

    let row_count = insert_rows(handle, dest_table, &columns, &sanitized_rows)?;
    info!(dest_table, row_count, "api ingest inserted rows");

    if let Some(gap_fill) = &cfg.gap_fill {
        if gap_fill.enabled {
            apply_gap_fill(handle, dest_table, &gap_fill.date_field, &gap_fill.key_fields)?;
        }
    }

    Ok(IngestResult { row_count, window_start, window_end })
}

fn window_range(
    handle: &EmbeddedHandle,
    dest_table: &str,
    seq: &SequenceConfig,
    now: DateTime<Utc>,
    window_start: &mut Option<String>,
    window_end: &mut Option<String>,
) {
    let last = max_date(handle, dest_table, &seq.date_field);
    let last_dt = match last {
        Some(s) => parse_watermark_date(&s, now),
        None => start_of_day(now) - chrono::Duration::days(30),
    };
    let win_days = seq.window_days.max(1) as i64;
    let start_dt = start_of_day(last_dt + chrono::Duration::days(1));
    let end_dt = start_of_day(now);
    if start_dt > end_dt {
        return;
    }
    let cap_end = end_dt.min(start_dt + chrono::Duration::days(win_days - 1));
    *window_start = Some(start_dt.format("%Y-%m-%d").to_string());
    *window_end = Some(cap_end.format("%Y-%m-%d").to_string());
}

async fn fetch_all_pages(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    headers: &HashMap<String, String>,
    params: &mut HashMap<String, String>,
    body: Option<&str>,
    cfg: &ApiIngestConfig,
) -> Result<Vec<Value>> {
    match &cfg.pagination {
        None | Some(PaginationConfig::None) => {
            let resp = do_request(client, method, url, headers, params, body).await?;
            if resp.status >= 400 {
                return Err(EngineError::BadGateway(format!("HTTP {}: {}", resp.status, truncate(&resp.body, 200))));
            }
            Ok(parse_response(&resp, cfg.parse.as_deref(), cfg.json_root.as_deref()))
        }
        Some(PaginationConfig::Page { page_param, page_size_param, page_size, page_start, max_pages }) => {
            let mut items = Vec::new();
            for page in *page_start..(*page_start + *max_pages) {
                params.insert(page_param.clone(), page.to_string());
                params.insert(page_size_param.clone(), page_size.to_string());
                let resp = do_request(client, method, url, headers, params, body).await?;
                if resp.status >= 400 {
                    return Err(EngineError::BadGateway(format!("HTTP {}: {}", resp.status, truncate(&resp.body, 200))));
                }
                let part = parse_response(&resp, cfg.parse.as_deref(), cfg.json_root.as_deref());
                if part.is_empty() {
                    break;
                }
                let part_len = part.len();
                items.extend(part);
                if (part_len as u32) < *page_size {
                    break;
                }
            }
            Ok(items)
        }
        Some(PaginationConfig::Cursor { cursor_param, next_cursor_path, max_pages }) => {
            let mut items = Vec::new();
            let mut cur_params = params.clone();
            for _ in 0..*max_pages {
                let resp = do_request(client, method, url, headers, &cur_params, body).await?;
                if resp.status >= 400 {
                    return Err(EngineError::BadGateway(format!("HTTP {}: {}", resp.status, truncate(&resp.body, 200))));
                }
                if is_csv_format(&resp.content_type, cfg.parse.as_deref(), None) {
                    items.extend(parse_csv(&resp.body));
                    break;
                }
                let doc: Value = serde_json::from_str(&resp.body).unwrap_or(Value::Null);
                let part = get_json_root(&doc, cfg.json_root.as_deref());
                if part.is_empty() {
                    break;
                }
                items.extend(part);
                let next = next_cursor_path
                    .strip_prefix("$.")
                    .unwrap_or(next_cursor_path)
                    .split('.')
                    .try_fold(&doc, |cur, part| cur.get(part))
                    .and_then(|v| v.as_str());
                match next {
                    Some(cursor) if !cursor.is_empty() => {
                        cur_params.insert(cursor_param.clone(), cursor.to_string());
                    }
                    _ => break,
                }
            }
            Ok(items)
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        warn!(len = s.len(), max, "truncating error body for log");
        s[..max].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn date_macro_today_is_midnight() {
        let dt = parse_date_macro("today", now());
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-03-15 00:00:00");
    }

    #[test]
    fn date_macro_with_offset() {
        let dt = parse_date_macro("today-7d", now());
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2026-03-08");
    }

    #[test]
    fn date_macro_start_of_quarter() {
        let dt = parse_date_macro("startOfQuarter", now());
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2026-01-01");
    }

    #[test]
    fn date_macro_end_of_month() {
        let dt = parse_date_macro("endOfMonth", now());
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2026-03-31");
    }

    #[test]
    fn secret_ref_resolves_from_env() {
        std::env::set_var("QH_TEST_SECRET", "shh");
        assert_eq!(resolve_secret_refs("token={{secret:QH_TEST_SECRET}}"), "token=shh");
        std::env::remove_var("QH_TEST_SECRET");
    }

    #[test]
    fn normalize_format_converts_friendly_tokens() {
        assert_eq!(normalize_format("YYYY-MM-DD"), "%Y-%m-%d");
        assert_eq!(normalize_format("%Y/%m/%d"), "%Y/%m/%d");
    }

    #[test]
    fn json_root_picks_first_array_when_root_absent() {
        let doc: Value = serde_json::json!({"meta": {}, "items": [1, 2, 3]});
        let items = get_json_root(&doc, None);
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn json_root_follows_dollar_dot_path() {
        let doc: Value = serde_json::json!({"data": {"rows": [{"a": 1}]}});
        let items = get_json_root(&doc, Some("$.data.rows"));
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn csv_sniffs_semicolon_delimiter_and_strips_comments() {
        let text = "# a comment\nname;age\nalice;30\nbob;40\n";
        let rows = parse_csv(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], Value::String("alice".to_string()));
    }

    #[test]
    fn csv_synthesizes_headers_for_blank_columns() {
        let text = "name,,age\nalice,x,30\n";
        let rows = parse_csv(text);
        assert!(rows[0].as_object().unwrap().contains_key("col2"));
    }

    #[test]
    fn flatten_joins_nested_keys_with_underscore() {
        let rec: Value = serde_json::json!({"a": {"b": {"c": 1}}, "tags": ["x", "y"]});
        let mut out = Map::new();
        flatten_record(&rec, "", &mut out);
        assert_eq!(out["a_b_c"], Value::from(1));
        assert!(out["tags"].as_str().unwrap().contains("\"x\""));
    }

    #[test]
    fn sanitize_col_prefixes_leading_digit() {
        assert_eq!(sanitize_col("2024value"), "c_2024value");
        assert_eq!(sanitize_col("weird col!"), "weird_col_");
    }

    #[test]
    fn infer_duck_type_distinguishes_date_and_timestamp() {
        assert_eq!(infer_duck_type(&Value::String("2024-01-01".to_string())), "DATE");
        assert_eq!(infer_duck_type(&Value::from(5)), "BIGINT");
        assert_eq!(infer_duck_type(&Value::from(5.5)), "DOUBLE");
    }
}
