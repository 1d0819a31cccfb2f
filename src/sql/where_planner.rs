//! WHERE Planner (C6, spec.md §4.6).
//!
//! Translates the filter DSL (`field` / `field__op` -> value) into SQL
//! fragments plus bound parameters, and splits filters between the inner
//! `_base` subquery and the outer grouping query for pivot/transformed
//! sources (spec.md §4.6 "Split rule").

use crate::model::{Dialect, FilterValue, WhereMap};
use crate::sql::dateparts::{DatePart, DatePartToken};
use crate::sql::quoter::quote_ident;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Reserved keys that are not column filters (spec.md §4.6 table).
const RESERVED_KEYS: &[&str] = &["start", "end", "startDate", "endDate"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhereOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    NotContains,
}

#[derive(Debug, Clone)]
struct ParsedKey {
    field: String,
    op: WhereOp,
}

static SANITIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").unwrap());

fn sanitize_param_name(field: &str, index: usize) -> String {
    let cleaned = SANITIZE_RE.replace_all(field, "_");
    format!("w_{cleaned}_{index}")
}

fn parse_key(key: &str) -> ParsedKey {
    for (suffix, op) in [
        ("__ne", WhereOp::Ne),
        ("__gte", WhereOp::Gte),
        ("__gt", WhereOp::Gt),
        ("__lte", WhereOp::Lte),
        ("__lt", WhereOp::Lt),
        ("__notcontains", WhereOp::NotContains),
        ("__contains", WhereOp::Contains),
        ("__startswith", WhereOp::StartsWith),
        ("__endswith", WhereOp::EndsWith),
    ] {
        if let Some(field) = key.strip_suffix(suffix) {
            return ParsedKey {
                field: field.to_string(),
                op,
            };
        }
    }
    ParsedKey {
        field: key.to_string(),
        op: WhereOp::Eq,
    }
}

/// A single bound parameter produced by the planner.
#[derive(Debug, Clone)]
pub struct BoundParam {
    pub name: String,
    pub value: FilterValue,
}

/// A compiled filter: the SQL fragment (already quoted/referenced) plus the
/// parameters it binds, tagged with whether its column is a dimension.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    pub field: String,
    pub sql: String,
    pub params: Vec<BoundParam>,
    pub is_dimension: bool,
}

/// Column reference context the planner needs to know how to address a
/// field: either a quoted base column, or a quoted alias against `_base`.
pub enum ColumnRef<'a> {
    BaseColumn(&'a str),
    AdmittedAlias(&'a str),
}

/// Resolve how a field should be referenced in SQL: prefer an admitted
/// alias (date-part or custom-column output) over the raw base column.
pub fn resolve_column_ref<'a>(
    field: &'a str,
    admitted_aliases: &HashSet<String>,
) -> ColumnRef<'a> {
    if admitted_aliases.contains(field) {
        ColumnRef::AdmittedAlias(field)
    } else {
        ColumnRef::BaseColumn(field)
    }
}

/// Compile the filter DSL into per-field `CompiledFilter`s. `exclude_field`
/// (used by Distinct, spec.md §4.5.3) drops a filter entirely rather than
/// compiling it — the non-circularity invariant. `dimension_columns` decides
/// the outer-vs-inner split (spec.md §4.6, §8).
pub fn compile_filters(
    dialect: Dialect,
    where_map: &WhereMap,
    admitted_aliases: &HashSet<String>,
    date_part_tokens: &std::collections::HashMap<String, DatePart>,
    dimension_columns: &HashSet<String>,
    exclude_field: Option<&str>,
) -> Vec<CompiledFilter> {
    let mut out = Vec::new();
    let mut param_index = 0usize;

    for (key, value) in where_map {
        if RESERVED_KEYS.contains(&key.as_str()) {
            continue;
        }
        let parsed = parse_key(key);
        if let Some(excluded) = exclude_field {
            if parsed.field == excluded {
                continue;
            }
        }

        // Empty IN list: drop the filter rather than compile `IN ()`
        // (spec.md §8 boundary behavior).
        if let FilterValue::Array(items) = value {
            if items.is_empty() {
                continue;
            }
        }

        let column_ref = resolve_column_ref(&parsed.field, admitted_aliases);
        let column_sql = match column_ref {
            ColumnRef::BaseColumn(c) => quote_ident(dialect, c),
            ColumnRef::AdmittedAlias(a) => quote_ident(dialect, a),
        };

        let is_numeric_date_part = date_part_tokens
            .get(&parsed.field)
            .map(|p| p.is_numeric())
            .or_else(|| DatePartToken::parse(&parsed.field).map(|t| t.part.is_numeric()));

        let (sql, params) = compile_one(
            dialect,
            &column_sql,
            parsed.op,
            value,
            &parsed.field,
            &mut param_index,
            is_numeric_date_part,
        );

        let is_dimension = dimension_columns.contains(&parsed.field);
        out.push(CompiledFilter {
            field: parsed.field,
            sql,
            params,
            is_dimension,
        });
    }
    out
}

fn coerce_value(value: &FilterValue, is_numeric_date_part: Option<bool>) -> FilterValue {
    match (value, is_numeric_date_part) {
        (FilterValue::Text(s), Some(true)) => s
            .parse::<f64>()
            .map(FilterValue::Number)
            .unwrap_or_else(|_| value.clone()),
        (FilterValue::Number(n), Some(false)) => FilterValue::Text(format_number(*n)),
        _ => value.clone(),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn compile_one(
    dialect: Dialect,
    column_sql: &str,
    op: WhereOp,
    value: &FilterValue,
    field: &str,
    param_index: &mut usize,
    is_numeric_date_part: Option<bool>,
) -> (String, Vec<BoundParam>) {
    if matches!(value, FilterValue::Null) {
        let sql = match op {
            WhereOp::Ne => format!("{column_sql} IS NOT NULL"),
            _ => format!("{column_sql} IS NULL"),
        };
        return (sql, Vec::new());
    }

    match op {
        WhereOp::Eq | WhereOp::Ne => {
            if let FilterValue::Array(items) = value {
                let mut params = Vec::new();
                let mut names = Vec::new();
                for item in items {
                    let coerced = coerce_value(item, is_numeric_date_part);
                    let name = sanitize_param_name(field, *param_index);
                    *param_index += 1;
                    names.push(format!(":{name}"));
                    params.push(BoundParam { name, value: coerced });
                }
                let joined = names.join(", ");
                let sql = if matches!(op, WhereOp::Eq) {
                    let wrapped = maybe_lower(column_sql, items.first(), dialect);
                    format!("{wrapped} IN ({joined})")
                } else {
                    // array NE -> AND of per-value <>
                    let conds: Vec<String> = names
                        .iter()
                        .map(|n| {
                            let wrapped = maybe_lower(column_sql, items.first(), dialect);
                            format!("{wrapped} <> {}", lower_param(n, items.first()))
                        })
                        .collect();
                    conds.join(" AND ")
                };
                (sql, params)
            } else {
                let coerced = coerce_value(value, is_numeric_date_part);
                let name = sanitize_param_name(field, *param_index);
                *param_index += 1;
                let operator = if matches!(op, WhereOp::Eq) { "=" } else { "<>" };
                let sql = if matches!(coerced, FilterValue::Text(_)) {
                    format!("LOWER({column_sql}) {operator} LOWER(:{name})")
                } else {
                    format!("{column_sql} {operator} :{name}")
                };
                (sql, vec![BoundParam { name, value: coerced }])
            }
        }
        WhereOp::Gt | WhereOp::Gte | WhereOp::Lt | WhereOp::Lte => {
            let coerced = coerce_value(value, is_numeric_date_part);
            let name = sanitize_param_name(field, *param_index);
            *param_index += 1;
            let operator = match op {
                WhereOp::Gt => ">",
                WhereOp::Gte => ">=",
                WhereOp::Lt => "<",
                WhereOp::Lte => "<=",
                _ => unreachable!(),
            };
            (
                format!("{column_sql} {operator} :{name}"),
                vec![BoundParam { name, value: coerced }],
            )
        }
        WhereOp::Contains | WhereOp::NotContains | WhereOp::StartsWith | WhereOp::EndsWith => {
            let text = match value {
                FilterValue::Text(s) => s.clone(),
                other => format!("{other:?}"),
            };
            let pattern = match op {
                WhereOp::Contains | WhereOp::NotContains => format!("%{text}%"),
                WhereOp::StartsWith => format!("{text}%"),
                WhereOp::EndsWith => format!("%{text}"),
                _ => unreachable!(),
            };
            let name = sanitize_param_name(field, *param_index);
            *param_index += 1;
            let keyword = if matches!(op, WhereOp::NotContains) {
                "NOT LIKE"
            } else {
                "LIKE"
            };
            (
                format!("LOWER({column_sql}) {keyword} LOWER(:{name})"),
                vec![BoundParam {
                    name,
                    value: FilterValue::Text(pattern),
                }],
            )
        }
    }
}

fn maybe_lower(column_sql: &str, sample: Option<&FilterValue>, _dialect: Dialect) -> String {
    match sample {
        Some(FilterValue::Text(_)) => format!("LOWER({column_sql})"),
        _ => column_sql.to_string(),
    }
}

fn lower_param(placeholder: &str, sample: Option<&FilterValue>) -> String {
    match sample {
        Some(FilterValue::Text(_)) => format!("LOWER({placeholder})"),
        _ => placeholder.to_string(),
    }
}

/// Split compiled filters into (outer, inner) per spec.md §4.6's split rule:
/// a filter whose column is a dimension stays outer; everything else goes
/// inside `(...) AS _base`.
pub fn split_outer_inner(filters: Vec<CompiledFilter>) -> (Vec<CompiledFilter>, Vec<CompiledFilter>) {
    filters.into_iter().partition(|f| f.is_dimension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn empty_aliases() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn eq_scalar_compiles_case_insensitively_for_strings() {
        let mut wm = WhereMap::new();
        wm.insert("status".to_string(), FilterValue::Text("Shipped".to_string()));
        let filters = compile_filters(
            Dialect::Postgres,
            &wm,
            &empty_aliases(),
            &HashMap::new(),
            &HashSet::new(),
            None,
        );
        assert_eq!(filters.len(), 1);
        assert!(filters[0].sql.contains("LOWER"));
    }

    #[test]
    fn array_value_compiles_to_in_list() {
        let mut wm = WhereMap::new();
        wm.insert(
            "status".to_string(),
            FilterValue::Array(vec![
                FilterValue::Text("shipped".to_string()),
                FilterValue::Text("delivered".to_string()),
            ]),
        );
        let filters = compile_filters(
            Dialect::Postgres,
            &wm,
            &empty_aliases(),
            &HashMap::new(),
            &HashSet::new(),
            None,
        );
        assert_eq!(filters.len(), 1);
        assert!(filters[0].sql.contains("IN ("));
        assert_eq!(filters[0].params.len(), 2);
    }

    #[test]
    fn empty_in_list_is_dropped() {
        let mut wm = WhereMap::new();
        wm.insert("status".to_string(), FilterValue::Array(vec![]));
        let filters = compile_filters(
            Dialect::Postgres,
            &wm,
            &empty_aliases(),
            &HashMap::new(),
            &HashSet::new(),
            None,
        );
        assert!(filters.is_empty());
    }

    #[test]
    fn null_value_compiles_to_is_null() {
        let mut wm = WhereMap::new();
        wm.insert("deleted_at".to_string(), FilterValue::Null);
        let filters = compile_filters(
            Dialect::Postgres,
            &wm,
            &empty_aliases(),
            &HashMap::new(),
            &HashSet::new(),
            None,
        );
        assert!(filters[0].sql.ends_with("IS NULL"));
    }

    #[test]
    fn excluded_field_is_dropped_for_distinct_non_circularity() {
        let mut wm = WhereMap::new();
        wm.insert("status".to_string(), FilterValue::Text("shipped".to_string()));
        wm.insert("customer_id".to_string(), FilterValue::Number(1.0));
        let filters = compile_filters(
            Dialect::Postgres,
            &wm,
            &empty_aliases(),
            &HashMap::new(),
            &HashSet::new(),
            Some("status"),
        );
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].field, "customer_id");
    }

    #[test]
    fn reserved_keys_are_not_compiled_as_filters() {
        let mut wm = WhereMap::new();
        wm.insert("start".to_string(), FilterValue::Text("2025-01-01".to_string()));
        wm.insert("status".to_string(), FilterValue::Text("shipped".to_string()));
        let filters = compile_filters(
            Dialect::Postgres,
            &wm,
            &empty_aliases(),
            &HashMap::new(),
            &HashSet::new(),
            None,
        );
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].field, "status");
    }

    #[test]
    fn split_rule_separates_dimension_and_non_dimension_filters() {
        let mut wm = WhereMap::new();
        wm.insert(
            "status".to_string(),
            FilterValue::Array(vec![FilterValue::Text("shipped".into())]),
        );
        wm.insert("customer_id".to_string(), FilterValue::Number(1.0));
        let mut dims = HashSet::new();
        dims.insert("status".to_string());
        let filters = compile_filters(
            Dialect::Postgres,
            &wm,
            &empty_aliases(),
            &HashMap::new(),
            &dims,
            None,
        );
        let (outer, inner) = split_outer_inner(filters);
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0].field, "status");
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].field, "customer_id");
    }
}
