//! Query Compiler (C5, spec.md §4.5).
//!
//! Compiles the four request kinds — aggregation (chart), pivot, distinct,
//! period-totals — into SQL atop a composed `_base` subquery (C4). Shares
//! the date-part (C2), resolver (C3), and WHERE-planner (C6) helpers.

use crate::model::{
    Agg, Aggregator, DistinctRequest, GroupBy, Legend, PeriodTotalsRequest, PivotRequest,
    QuerySpec, WeekStart,
};
use crate::model::Dialect;
use crate::sql::dateparts::{date_part_expr, date_part_order_expr, DatePart, DatePartToken};
use crate::sql::quoter::{normalize_expr, quote_ident};
use crate::sql::transform::TransformResult;
use crate::sql::where_planner::{self, BoundParam};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<BoundParam>,
    pub warnings: Vec<String>,
}

fn base_from(base: &TransformResult) -> String {
    format!("({}) AS _base", base.sql)
}

fn agg_fn_sql(agg: Agg) -> &'static str {
    match agg {
        Agg::Sum => "SUM",
        Agg::Avg => "AVG",
        Agg::Min => "MIN",
        Agg::Max => "MAX",
        Agg::Count | Agg::Distinct => "COUNT",
    }
}

fn column_ref(dialect: Dialect, name: &str) -> String {
    quote_ident(dialect, name)
}

fn numericify_ref(dialect: Dialect, name: &str) -> String {
    normalize_expr(dialect, &format!("[{name}]"), true).unwrap_or_else(|_| column_ref(dialect, name))
}

/// Strip a trailing `AS alias` from a caller-supplied `measure` expression,
/// and leave an already-aggregated expression as-is (spec.md §4.5.1).
fn strip_as_alias(expr: &str) -> String {
    let trimmed = expr.trim();
    let upper = trimmed.to_ascii_uppercase();
    if let Some(pos) = upper.rfind(" AS ") {
        // Only strip when what follows `AS` looks like a single identifier,
        // not part of a CAST(... AS type) expression.
        let after = trimmed[pos + 4..].trim();
        if !after.is_empty() && after.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return trimmed[..pos].trim().to_string();
        }
    }
    trimmed.to_string()
}

fn is_already_aggregated(expr: &str) -> bool {
    let upper = expr.to_ascii_uppercase();
    ["COUNT(", "SUM(", "AVG(", "MIN(", "MAX("]
        .iter()
        .any(|f| upper.contains(f))
}

fn value_expr(dialect: Dialect, agg: Agg, y: Option<&str>, measure: Option<&str>) -> String {
    if let Some(m) = measure {
        let cleaned = strip_as_alias(m);
        if is_already_aggregated(&cleaned) {
            return normalize_expr(dialect, &cleaned, false).unwrap_or(cleaned);
        }
        return normalize_expr(dialect, &cleaned, false).unwrap_or(cleaned);
    }
    match (agg, y) {
        (Agg::Count, _) => "COUNT(*)".to_string(),
        (Agg::Distinct, Some(y)) => format!("COUNT(DISTINCT {})", column_ref(dialect, y)),
        (Agg::Distinct, None) => "COUNT(*)".to_string(),
        (_, Some(y)) => format!("{}({})", agg_fn_sql(agg), numericify_ref(dialect, y)),
        (_, None) => "COUNT(*)".to_string(),
    }
}

/// Truncate a timestamp column to a `GroupBy` bucket (spec.md §4.5.1 "X
/// expression"). Not part of C2 (which extracts parts, not buckets).
fn bucket_expr(dialect: Dialect, column: &str, group_by: GroupBy, week_start: WeekStart) -> String {
    let col = quote_ident(dialect, column);
    match dialect {
        Dialect::EmbeddedColumnar | Dialect::Postgres => match group_by {
            GroupBy::None | GroupBy::Day => format!("DATE_TRUNC('day', {col})"),
            GroupBy::Week => match week_start {
                WeekStart::Mon => format!("DATE_TRUNC('week', {col})"),
                WeekStart::Sun => format!("DATE_TRUNC('week', {col} + INTERVAL '1 day') - INTERVAL '1 day'"),
            },
            GroupBy::Month => format!("DATE_TRUNC('month', {col})"),
            GroupBy::Quarter => format!("DATE_TRUNC('quarter', {col})"),
            GroupBy::Year => format!("DATE_TRUNC('year', {col})"),
        },
        Dialect::Mysql => match group_by {
            GroupBy::None | GroupBy::Day => format!("DATE({col})"),
            GroupBy::Week => match week_start {
                WeekStart::Mon => format!("DATE_SUB(DATE({col}), INTERVAL WEEKDAY({col}) DAY)"),
                WeekStart::Sun => format!(
                    "DATE_SUB(DATE({col}), INTERVAL MOD(WEEKDAY({col}) + 1, 7) DAY)"
                ),
            },
            GroupBy::Month => format!("DATE_FORMAT({col}, '%Y-%m-01')"),
            GroupBy::Quarter => format!(
                "STR_TO_DATE(CONCAT(YEAR({col}), '-', LPAD((QUARTER({col}) - 1) * 3 + 1, 2, '0'), '-01'), '%Y-%m-%d')"
            ),
            GroupBy::Year => format!("DATE_FORMAT({col}, '%Y-01-01')"),
        },
        Dialect::Mssql => match group_by {
            GroupBy::None | GroupBy::Day => format!("CAST({col} AS DATE)"),
            GroupBy::Week => match week_start {
                WeekStart::Mon => format!(
                    "DATEADD(day, 1 - DATEPART(weekday, {col}), CAST({col} AS DATE))"
                ),
                WeekStart::Sun => format!("DATEADD(day, -DATEPART(weekday, {col}) + 1, CAST({col} AS DATE))"),
            },
            GroupBy::Month => format!(
                "DATEFROMPARTS(YEAR({col}), MONTH({col}), 1)"
            ),
            GroupBy::Quarter => format!(
                "DATEFROMPARTS(YEAR({col}), (DATEPART(quarter, {col}) - 1) * 3 + 1, 1)"
            ),
            GroupBy::Year => format!("DATEFROMPARTS(YEAR({col}), 1, 1)"),
        },
        Dialect::Sqlite => match group_by {
            GroupBy::None | GroupBy::Day => format!("date({col})"),
            GroupBy::Week => match week_start {
                WeekStart::Mon => format!("date({col}, 'weekday 1', '-7 days')"),
                WeekStart::Sun => format!("date({col}, 'weekday 0', '-7 days')"),
            },
            GroupBy::Month => format!("date({col}, 'start of month')"),
            GroupBy::Quarter => format!(
                "date({col}, 'start of month', printf('-%d months', (CAST(strftime('%m', {col}) AS INTEGER) - 1) % 3))"
            ),
            GroupBy::Year => format!("date({col}, 'start of year')"),
        },
    }
}

struct XPlan {
    expr: String,
    order_expr: Option<String>,
}

fn plan_x(dialect: Dialect, field: &str, group_by: GroupBy, week_start: WeekStart) -> XPlan {
    if let Some(token) = DatePartToken::parse(field) {
        let expr = date_part_expr(dialect, &token.base_column, token.part, week_start);
        let order_expr = date_part_order_expr(dialect, &token.base_column, token.part);
        XPlan { expr, order_expr }
    } else if !matches!(group_by, GroupBy::None) {
        XPlan {
            expr: bucket_expr(dialect, field, group_by, week_start),
            order_expr: None,
        }
    } else {
        XPlan {
            expr: column_ref(dialect, field),
            order_expr: None,
        }
    }
}

fn legend_field_expr(dialect: Dialect, field: &str) -> String {
    if let Some(token) = DatePartToken::parse(field) {
        date_part_expr(dialect, &token.base_column, token.part, WeekStart::Mon)
    } else {
        column_ref(dialect, field)
    }
}

fn legend_concat(dialect: Dialect, parts: &[String]) -> String {
    if parts.len() == 1 {
        return parts[0].clone();
    }
    match dialect {
        Dialect::Mysql => format!("CONCAT_WS(' - ', {})", parts.join(", ")),
        Dialect::Mssql => parts
            .iter()
            .map(|p| format!("CAST({p} AS NVARCHAR(MAX))"))
            .collect::<Vec<_>>()
            .join(" + ' - ' + "),
        Dialect::EmbeddedColumnar | Dialect::Postgres | Dialect::Sqlite => {
            parts.join(" || ' - ' || ")
        }
    }
}

fn legend_exprs(dialect: Dialect, legend: &Legend) -> Vec<String> {
    match legend {
        Legend::Single(f) => vec![legend_field_expr(dialect, f)],
        Legend::Multi(fs) => fs.iter().map(|f| legend_field_expr(dialect, f)).collect(),
    }
}

/// Compile a single chart aggregation (spec.md §4.5.1). `widget_filter`
/// overrides from `series[]` are handled by the caller via `compile_multi_series`.
pub fn compile_aggregation(
    dialect: Dialect,
    base: &TransformResult,
    spec: &QuerySpec,
    admitted_aliases: &HashSet<String>,
) -> CompiledQuery {
    compile_one_series(dialect, base, spec, spec.y.as_deref(), spec.agg, None, admitted_aliases)
}

fn compile_one_series(
    dialect: Dialect,
    base: &TransformResult,
    spec: &QuerySpec,
    y: Option<&str>,
    agg: Agg,
    series_name: Option<&str>,
    admitted_aliases: &HashSet<String>,
) -> CompiledQuery {
    let mut warnings = base.warnings.clone();
    let val_expr = value_expr(dialect, agg, y, spec.measure.as_deref());

    let mut select_cols: Vec<String> = Vec::new();
    let mut group_by_ordinals: Vec<usize> = Vec::new();
    let mut order_terms: Vec<String> = Vec::new();
    let mut x_ordinal: Option<usize> = None;
    let mut legend_ordinal: Option<usize> = None;

    let legend = spec.legend.clone();

    if let Some(x_field) = &spec.x {
        let plan = plan_x(dialect, x_field, spec.group_by, spec.week_start);
        select_cols.push(format!("{} AS \"x\"", plan.expr));
        x_ordinal = Some(select_cols.len());
        group_by_ordinals.push(select_cols.len());
        if let Some(order) = plan.order_expr {
            order_terms.push(order);
        } else {
            order_terms.push(plan.expr);
        }
    } else if legend.is_some() {
        // Spec.md §4.5.1 "Special row-zero case": x absent, legend present.
        select_cols.push("'Total' AS \"x\"".to_string());
        x_ordinal = Some(select_cols.len());
    }

    let mut legend_raw_expr: Option<String> = None;
    if let Some(legend) = &legend {
        let parts = legend_exprs(dialect, legend);
        let concat = legend_concat(dialect, &parts);
        let legend_expr = if let Some(name) = series_name {
            format!(
                "({concat}) || ' - ' || {}",
                crate::sql::quoter::quote_literal(name)
            )
        } else {
            concat.clone()
        };
        select_cols.push(format!("{legend_expr} AS \"legend\""));
        legend_ordinal = Some(select_cols.len());
        legend_raw_expr = Some(concat);
        group_by_ordinals.push(select_cols.len());
    } else if let Some(name) = series_name {
        select_cols.push(format!(
            "{} AS \"legend\"",
            crate::sql::quoter::quote_literal(name)
        ));
        legend_ordinal = Some(select_cols.len());
    }

    select_cols.push(format!("{val_expr} AS \"value\""));
    let value_ordinal = select_cols.len();

    let mut sql = format!(
        "SELECT {} FROM {}",
        select_cols.join(", "),
        base_from(base)
    );

    let admitted_for_where = admitted_aliases.clone();
    let mut date_part_tokens: HashMap<String, DatePart> = HashMap::new();
    if let Some(x) = &spec.x {
        if let Some(t) = DatePartToken::parse(x) {
            date_part_tokens.insert(x.clone(), t.part);
        }
    }

    let compiled_filters = where_planner::compile_filters(
        dialect,
        &spec.r#where,
        &admitted_for_where,
        &date_part_tokens,
        &HashSet::new(),
        None,
    );
    let mut where_clauses: Vec<String> = compiled_filters.iter().map(|f| f.sql.clone()).collect();
    // NULL legend rows are always excluded (spec.md §4.5.1). Filtered on the
    // raw expression, not the "legend" alias — aliases aren't visible to WHERE.
    if let Some(raw) = &legend_raw_expr {
        where_clauses.push(format!("{raw} IS NOT NULL"));
    }
    if !where_clauses.is_empty() {
        sql.push_str(&format!(" WHERE {}", where_clauses.join(" AND ")));
    }

    if !group_by_ordinals.is_empty() {
        let ordinals: Vec<String> = group_by_ordinals.iter().map(|i| i.to_string()).collect();
        sql.push_str(&format!(" GROUP BY {}", ordinals.join(", ")));
    }
    let order_by = match spec.order_by {
        Some(crate::model::OrderByField::X) => x_ordinal.map(|o| o.to_string()),
        Some(crate::model::OrderByField::Value) => Some(value_ordinal.to_string()),
        Some(crate::model::OrderByField::Legend) => legend_ordinal.map(|o| o.to_string()),
        None => {
            // Default: order by dimensions ascending. Prefer a date-part's
            // numeric companion expression over its label expression so
            // calendar order wins over alphabetical order.
            if !order_terms.is_empty() {
                Some(order_terms.join(", "))
            } else if !group_by_ordinals.is_empty() {
                Some(
                    group_by_ordinals
                        .iter()
                        .map(|i| i.to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                )
            } else {
                None
            }
        }
    };
    if let Some(order) = order_by {
        let dir = match spec.order {
            Some(crate::model::OrderDirection::Desc) => "DESC",
            _ => "ASC",
        };
        sql.push_str(&format!(" ORDER BY {order} {dir}"));
    }

    let limit = spec.limit.filter(|l| *l > 0);
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = spec.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }

    warnings.dedup();
    let params = compiled_filters.into_iter().flat_map(|f| f.params).collect();
    CompiledQuery { sql, params, warnings }
}

/// Multi-series aggregation: compile one query per series and UNION ALL,
/// stamping each with its series name as legend (spec.md §4.5.1 "Multi-series").
pub fn compile_multi_series(
    dialect: Dialect,
    base: &TransformResult,
    spec: &QuerySpec,
    admitted_aliases: &HashSet<String>,
) -> CompiledQuery {
    if spec.series.len() <= 1 {
        return compile_aggregation(dialect, base, spec, admitted_aliases);
    }
    let mut branches = Vec::new();
    let mut params = Vec::new();
    let mut warnings = Vec::new();
    for series in &spec.series {
        let compiled = compile_one_series(
            dialect,
            base,
            spec,
            series.y.as_deref(),
            series.agg,
            Some(&series.name),
            admitted_aliases,
        );
        branches.push(strip_order_and_limit(&compiled.sql));
        params.extend(compiled.params);
        warnings.extend(compiled.warnings);
    }
    let mut sql = branches.join(" UNION ALL ");
    let order_by = match spec.order_by {
        Some(crate::model::OrderByField::X) => Some("1".to_string()),
        Some(crate::model::OrderByField::Legend) => Some("2".to_string()),
        Some(crate::model::OrderByField::Value) => Some("3".to_string()),
        None => None,
    };
    if let Some(order) = order_by {
        let dir = match spec.order {
            Some(crate::model::OrderDirection::Desc) => "DESC",
            _ => "ASC",
        };
        sql = format!("SELECT * FROM ({sql}) AS _multi ORDER BY {order} {dir}");
    }
    if let Some(limit) = spec.limit.filter(|l| *l > 0) {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    warnings.dedup();
    CompiledQuery { sql, params, warnings }
}

fn strip_order_and_limit(sql: &str) -> String {
    let upper = sql.to_ascii_uppercase();
    let cut = upper.find(" ORDER BY ").or_else(|| upper.find(" LIMIT "));
    match cut {
        Some(i) => sql[..i].to_string(),
        None => sql.to_string(),
    }
}

/// Pivot (spec.md §4.5.2): one row per `(rows ∪ cols)` combination.
pub fn compile_pivot(
    dialect: Dialect,
    base: &TransformResult,
    req: &PivotRequest,
    admitted_aliases: &HashSet<String>,
) -> CompiledQuery {
    let mut warnings = base.warnings.clone();
    let dims: Vec<String> = req.rows.iter().chain(req.cols.iter()).cloned().collect();
    let dim_set: HashSet<String> = dims.iter().cloned().collect();

    let val_expr = match req.aggregator {
        Aggregator::Count => "COUNT(*)".to_string(),
        Aggregator::Distinct => format!(
            "COUNT(DISTINCT {})",
            req.value_field
                .as_deref()
                .map(|f| column_ref(dialect, f))
                .unwrap_or_else(|| "*".to_string())
        ),
        _ => {
            let agg_sql = match req.aggregator {
                Aggregator::Sum => "SUM",
                Aggregator::Avg => "AVG",
                Aggregator::Min => "MIN",
                Aggregator::Max => "MAX",
                _ => unreachable!(),
            };
            let field = req.value_field.as_deref().unwrap_or("value");
            format!("{agg_sql}({})", numericify_ref(dialect, field))
        }
    };

    let mut select_cols: Vec<String> = dims
        .iter()
        .map(|d| format!("{} AS {}", column_ref(dialect, d), quote_ident(dialect, d)))
        .collect();
    select_cols.push(format!("{val_expr} AS \"value\""));

    let canonical_sankey = req.rows.len() == 1 && req.cols.len() == 1;
    if canonical_sankey {
        select_cols = vec![
            format!("{} AS \"x\"", column_ref(dialect, &req.rows[0])),
            format!("{} AS \"legend\"", column_ref(dialect, &req.cols[0])),
            format!("{val_expr} AS \"value\""),
        ];
    }

    let filters = where_planner::compile_filters(
        dialect,
        &req.r#where,
        admitted_aliases,
        &HashMap::new(),
        &dim_set,
        None,
    );
    let (outer, inner) = where_planner::split_outer_inner(filters);

    let base_sql = if inner.is_empty() {
        base_from(base)
    } else {
        let clauses: Vec<String> = inner.iter().map(|f| f.sql.clone()).collect();
        format!(
            "(SELECT * FROM ({}) AS _base_inner WHERE {}) AS _base",
            base.sql,
            clauses.join(" AND ")
        )
    };

    let mut sql = format!("SELECT {} FROM {}", select_cols.join(", "), base_sql);
    if !outer.is_empty() {
        let clauses: Vec<String> = outer.iter().map(|f| f.sql.clone()).collect();
        sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
    }
    if !dims.is_empty() {
        let ordinals: Vec<String> = (1..=dims.len()).map(|i| i.to_string()).collect();
        sql.push_str(&format!(" GROUP BY {}", ordinals.join(", ")));
    }
    if let Some(limit) = req.limit.filter(|l| *l > 0) {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    warnings.dedup();
    let mut params: Vec<BoundParam> = Vec::new();
    params.extend(inner.into_iter().flat_map(|f| f.params));
    params.extend(outer.into_iter().flat_map(|f| f.params));
    CompiledQuery { sql, params, warnings }
}

/// Distinct (spec.md §4.5.3).
pub fn compile_distinct(
    dialect: Dialect,
    base: &TransformResult,
    req: &DistinctRequest,
    admitted_aliases: &HashSet<String>,
) -> CompiledQuery {
    let mut warnings = base.warnings.clone();
    let col_ref = where_planner::resolve_column_ref(&req.field, admitted_aliases);
    let col_sql = match col_ref {
        where_planner::ColumnRef::BaseColumn(c) => column_ref(dialect, c),
        where_planner::ColumnRef::AdmittedAlias(a) => column_ref(dialect, a),
    };

    let filters = where_planner::compile_filters(
        dialect,
        &req.r#where,
        admitted_aliases,
        &HashMap::new(),
        &HashSet::new(),
        Some(&req.field),
    );

    let mut sql = format!(
        "SELECT DISTINCT {col_sql} AS \"value\" FROM {}",
        base_from(base)
    );
    if !filters.is_empty() {
        let clauses: Vec<String> = filters.iter().map(|f| f.sql.clone()).collect();
        sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
    }
    sql.push_str(" ORDER BY 1");

    warnings.dedup();
    let params = filters.into_iter().flat_map(|f| f.params).collect();
    CompiledQuery { sql, params, warnings }
}

/// Period totals (spec.md §4.5.4). Returns one query for a single window;
/// the compare variant (caller-supplied previous window) is built by calling
/// this twice — see [`compile_period_totals_compare`].
pub fn compile_period_totals(
    dialect: Dialect,
    base: &TransformResult,
    req: &PeriodTotalsRequest,
    admitted_aliases: &HashSet<String>,
    start: &str,
    end: &str,
) -> CompiledQuery {
    let mut warnings = base.warnings.clone();
    let val_expr = value_expr(dialect, req.agg, req.y.as_deref(), req.measure.as_deref());
    let date_col = column_ref(dialect, &req.date_field);

    let mut select_cols = Vec::new();
    let mut group_by = false;
    if let Some(legend_field) = &req.legend {
        select_cols.push(format!("{} AS \"legend\"", legend_field_expr(dialect, legend_field)));
        group_by = true;
    }
    select_cols.push(format!("{val_expr} AS \"total\""));

    let mut sql = format!("SELECT {} FROM {}", select_cols.join(", "), base_from(base));

    let filters = where_planner::compile_filters(
        dialect,
        &req.r#where,
        admitted_aliases,
        &HashMap::new(),
        &HashSet::new(),
        None,
    );
    let start_name = "w_period_start";
    let end_name = "w_period_end";
    let mut params: Vec<BoundParam> = vec![
        BoundParam {
            name: start_name.to_string(),
            value: crate::model::FilterValue::Text(start.to_string()),
        },
        BoundParam {
            name: end_name.to_string(),
            value: crate::model::FilterValue::Text(end.to_string()),
        },
    ];
    let mut clauses = vec![format!(
        "{date_col} >= :{start_name} AND {date_col} < :{end_name}"
    )];
    clauses.extend(filters.iter().map(|f| f.sql.clone()));
    sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
    params.extend(filters.into_iter().flat_map(|f| f.params));

    if group_by {
        sql.push_str(" GROUP BY 1");
    }

    warnings.dedup();
    CompiledQuery { sql, params, warnings }
}

/// Compile both windows of a period-totals compare request (spec.md §4.5.4).
pub fn compile_period_totals_compare(
    dialect: Dialect,
    base: &TransformResult,
    req: &PeriodTotalsRequest,
    admitted_aliases: &HashSet<String>,
) -> Option<(CompiledQuery, CompiledQuery)> {
    let prev_start = req.prev_start.as_deref()?;
    let prev_end = req.prev_end.as_deref()?;
    let cur = compile_period_totals(dialect, base, req, admitted_aliases, &req.start, &req.end);
    let prev = compile_period_totals(dialect, base, req, admitted_aliases, prev_start, prev_end);
    Some((cur, prev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Agg, GroupBy, OrderByField, QuerySpec, WeekStart};
    use crate::sql::transform::TransformResult;

    fn plain_base(cols: &[&str]) -> TransformResult {
        TransformResult {
            sql: "SELECT * FROM \"orders\" AS s".to_string(),
            resolved_columns: cols.iter().map(|c| c.to_string()).collect(),
            warnings: Vec::new(),
            admitted_aliases: HashSet::new(),
        }
    }

    #[test]
    fn simple_count_aggregation() {
        let base = plain_base(&["id", "status"]);
        let spec = QuerySpec {
            source: "orders".to_string(),
            agg: Agg::Count,
            ..Default::default()
        };
        let compiled = compile_aggregation(Dialect::Postgres, &base, &spec, &HashSet::new());
        assert!(compiled.sql.contains("COUNT(*)"));
        assert!(compiled.sql.contains("_base"));
    }

    #[test]
    fn date_part_x_field_orders_by_numeric_companion() {
        let base = plain_base(&["order_date", "unit_price"]);
        let spec = QuerySpec {
            source: "orders".to_string(),
            x: Some("order_date (Month Short)".to_string()),
            y: Some("unit_price".to_string()),
            agg: Agg::Sum,
            group_by: GroupBy::None,
            ..Default::default()
        };
        let compiled = compile_aggregation(Dialect::Postgres, &base, &spec, &HashSet::new());
        assert!(compiled.sql.contains("to_char"));
        assert!(compiled.sql.contains("ORDER BY"));
    }

    #[test]
    fn legend_without_x_emits_total_row() {
        let base = plain_base(&["status"]);
        let spec = QuerySpec {
            source: "orders".to_string(),
            legend: Some(Legend::Single("status".to_string())),
            agg: Agg::Count,
            ..Default::default()
        };
        let compiled = compile_aggregation(Dialect::Postgres, &base, &spec, &HashSet::new());
        assert!(compiled.sql.contains("'Total' AS \"x\""));
        assert!(compiled.sql.contains("IS NOT NULL"));
    }

    #[test]
    fn order_by_value_maps_to_last_ordinal() {
        let base = plain_base(&["status"]);
        let spec = QuerySpec {
            source: "orders".to_string(),
            legend: Some(Legend::Single("status".to_string())),
            agg: Agg::Count,
            order_by: Some(OrderByField::Value),
            ..Default::default()
        };
        let compiled = compile_aggregation(Dialect::Postgres, &base, &spec, &HashSet::new());
        assert!(compiled.sql.contains("ORDER BY 3 ASC"));
    }

    #[test]
    fn multi_series_unions_and_stamps_legend() {
        let base = plain_base(&["order_date", "unit_price", "quantity"]);
        let spec = QuerySpec {
            source: "orders".to_string(),
            x: Some("order_date".to_string()),
            group_by: GroupBy::Day,
            week_start: WeekStart::Mon,
            series: vec![
                crate::model::SeriesSpec {
                    name: "revenue".to_string(),
                    y: Some("unit_price".to_string()),
                    agg: Agg::Sum,
                },
                crate::model::SeriesSpec {
                    name: "units".to_string(),
                    y: Some("quantity".to_string()),
                    agg: Agg::Sum,
                },
            ],
            ..Default::default()
        };
        let compiled = compile_multi_series(Dialect::Postgres, &base, &spec, &HashSet::new());
        assert_eq!(compiled.sql.matches("UNION ALL").count(), 1);
        assert!(compiled.sql.contains("'revenue'"));
        assert!(compiled.sql.contains("'units'"));
    }

    #[test]
    fn pivot_sankey_projection_for_single_row_and_col() {
        let base = plain_base(&["category", "status", "quantity"]);
        let req = PivotRequest {
            source: "orders".to_string(),
            rows: vec!["category".to_string()],
            cols: vec!["status".to_string()],
            value_field: Some("quantity".to_string()),
            aggregator: Aggregator::Sum,
            r#where: Default::default(),
            group_by: GroupBy::None,
            week_start: WeekStart::Mon,
            limit: None,
        };
        let compiled = compile_pivot(Dialect::Postgres, &base, &req, &HashSet::new());
        assert!(compiled.sql.contains("AS \"x\""));
        assert!(compiled.sql.contains("AS \"legend\""));
        assert!(compiled.sql.contains("SUM("));
    }

    #[test]
    fn pivot_filter_split_matches_dimension_set() {
        let base = plain_base(&["category", "status", "customer_id", "quantity"]);
        let mut wm = crate::model::WhereMap::new();
        wm.insert(
            "status".to_string(),
            crate::model::FilterValue::Array(vec![crate::model::FilterValue::Text("shipped".into())]),
        );
        wm.insert("customer_id".to_string(), crate::model::FilterValue::Number(1.0));
        let req = PivotRequest {
            source: "orders".to_string(),
            rows: vec!["category".to_string()],
            cols: vec!["status".to_string()],
            value_field: Some("quantity".to_string()),
            aggregator: Aggregator::Sum,
            r#where: wm,
            group_by: GroupBy::None,
            week_start: WeekStart::Mon,
            limit: None,
        };
        let compiled = compile_pivot(Dialect::Postgres, &base, &req, &HashSet::new());
        assert!(compiled.sql.contains("_base_inner"));
        let outer_idx = compiled.sql.find("GROUP BY").unwrap();
        let where_idx = compiled.sql[..outer_idx].rfind("WHERE").unwrap();
        assert!(compiled.sql[where_idx..].contains("status"));
    }

    #[test]
    fn distinct_excludes_queried_field_from_where() {
        let base = plain_base(&["status", "customer_id"]);
        let mut wm = crate::model::WhereMap::new();
        wm.insert("status".to_string(), crate::model::FilterValue::Text("shipped".into()));
        wm.insert("customer_id".to_string(), crate::model::FilterValue::Number(1.0));
        let req = DistinctRequest {
            source: "orders".to_string(),
            field: "status".to_string(),
            r#where: wm,
        };
        let compiled = compile_distinct(Dialect::Postgres, &base, &req, &HashSet::new());
        assert!(!compiled.sql.contains("\"status\" ="));
        assert!(compiled.sql.contains("customer_id"));
        assert!(compiled.sql.ends_with("ORDER BY 1"));
    }

    #[test]
    fn period_totals_without_legend_returns_scalar_total() {
        let base = plain_base(&["order_date", "unit_price"]);
        let req = PeriodTotalsRequest {
            source: "orders".to_string(),
            y: Some("unit_price".to_string()),
            measure: None,
            agg: Agg::Sum,
            date_field: "order_date".to_string(),
            start: "2025-01-01".to_string(),
            end: "2025-02-01".to_string(),
            prev_start: None,
            prev_end: None,
            r#where: Default::default(),
            legend: None,
            week_start: WeekStart::Mon,
        };
        let compiled = compile_period_totals(
            Dialect::Postgres,
            &base,
            &req,
            &HashSet::new(),
            &req.start.clone(),
            &req.end.clone(),
        );
        assert!(compiled.sql.contains("AS \"total\""));
        assert!(!compiled.sql.contains("GROUP BY"));
        assert_eq!(compiled.params.len(), 2);
    }

    #[test]
    fn period_totals_compare_builds_two_windows() {
        let base = plain_base(&["order_date", "unit_price"]);
        let req = PeriodTotalsRequest {
            source: "orders".to_string(),
            y: Some("unit_price".to_string()),
            measure: None,
            agg: Agg::Sum,
            date_field: "order_date".to_string(),
            start: "2025-02-01".to_string(),
            end: "2025-03-01".to_string(),
            prev_start: Some("2025-01-01".to_string()),
            prev_end: Some("2025-02-01".to_string()),
            r#where: Default::default(),
            legend: None,
            week_start: WeekStart::Mon,
        };
        let (cur, prev) = compile_period_totals_compare(Dialect::Postgres, &base, &req, &HashSet::new()).unwrap();
        assert!(cur.sql.contains("2025-02-01") == false); // bound via params, not inlined
        assert_eq!(prev.params[0].name, "w_period_start");
    }
}
