//! Transform Composer (C4, spec.md §4.4).
//!
//! Builds a base projection out of custom columns, CASE/replace/translate/
//! null-handling transforms, UNPIVOT, and JOIN specs, filtering out items
//! whose dependencies the probed (or assumed) base columns don't satisfy.
//! The returned SQL is meant to be wrapped as `(sql) AS _base` by the query
//! compiler (C5).

use crate::model::{
    CompareOp, CustomColumn, JoinSpec, JoinType, NullHandlingMode, SortDirection, TopNDefault,
    TransformDefaults, TransformItem, TransformScope, TransformVariant,
};
use crate::model::Dialect;
use crate::sql::quoter::{normalize_expr, quote_ident, quote_source};
use crate::sql::resolver::{self, Candidate};
use std::collections::HashSet;

const MAX_UNPIVOT_SOURCE_COLUMNS_INFERENCE_ITEMS: usize = 64;

#[derive(Debug, Clone, Default)]
pub struct TransformResult {
    /// SQL for the composed base, suitable for `(sql) AS _base`.
    pub sql: String,
    /// The exact column set the SQL evaluates to (spec.md §4.4 invariant).
    pub resolved_columns: Vec<String>,
    pub warnings: Vec<String>,
    /// Aliases admitted by the resolver — used by the query compiler and
    /// WHERE planner to know whether a field is a derived column.
    pub admitted_aliases: HashSet<String>,
}

/// Filter transform-scoped items down to those applicable in `scope`
/// (datasource-wide items always apply; table/widget items apply only when
/// their name/id matches).
pub fn in_scope(scope: &TransformScope, table_name: &str, widget_id: Option<&str>) -> bool {
    match scope {
        TransformScope::Datasource => true,
        TransformScope::Table { name } => name == table_name,
        TransformScope::Widget { id } => Some(id.as_str()) == widget_id,
    }
}

pub struct ComposeInput<'a> {
    pub dialect: Dialect,
    pub source: &'a str,
    /// `None` means "select *"; `Some(cols)` is the explicit projection
    /// request (columns and/or admitted aliases).
    pub base_select: Option<&'a [String]>,
    /// Probed base columns, or `None` if the probe was unavailable (in
    /// which case custom-column validation is skipped — spec.md §9
    /// "Probe-before-compile").
    pub probed_base_columns: Option<&'a [String]>,
    pub custom_columns: &'a [CustomColumn],
    pub transforms: &'a [TransformItem],
    pub joins: &'a [JoinSpec],
    pub defaults: &'a TransformDefaults,
    pub limit: Option<u64>,
}

pub fn compose(input: ComposeInput<'_>) -> TransformResult {
    let dialect = input.dialect;
    let mut warnings = Vec::new();

    let base_columns: Vec<String> = input
        .probed_base_columns
        .map(|c| c.to_vec())
        .unwrap_or_default();
    let probing_enabled = input.probed_base_columns.is_some();

    // Join-projected / join-aggregate columns are available to the resolver
    // immediately (joins are not subject to the 5-pass admission rule).
    let mut joined_columns: Vec<String> = Vec::new();
    for join in input.joins {
        if let Some(agg) = &join.aggregate {
            joined_columns.push(agg.alias.clone());
        }
        if let Some(cols) = &join.columns {
            joined_columns.extend(cols.clone());
        }
    }

    // Collect candidates: custom columns + `computed` transforms.
    let mut candidates: Vec<Candidate> = input
        .custom_columns
        .iter()
        .map(|c| Candidate {
            alias: c.name.clone(),
            expr: c.expr.clone(),
        })
        .collect();
    for t in input.transforms {
        if let TransformVariant::Computed { name, expr } = &t.variant {
            candidates.push(Candidate {
                alias: name.clone(),
                expr: expr.clone(),
            });
        }
    }

    let admitted_aliases: Vec<(String, String)>;
    if probing_enabled {
        let resolution = resolver::resolve(&base_columns, &joined_columns, candidates);
        warnings.extend(resolution.warnings);
        admitted_aliases = resolution.admitted;
    } else {
        // Probe unavailable: skip validation, admit everything and let the
        // engine surface an error if a reference doesn't actually exist.
        admitted_aliases = candidates.into_iter().map(|c| (c.alias, c.expr)).collect();
    }

    let admitted_names: HashSet<String> = admitted_aliases.iter().map(|(a, _)| a.clone()).collect();

    // Apply CASE/replace/translate/nullHandling to build final per-target
    // expressions, chaining in the order transforms appear.
    let mut target_exprs: std::collections::HashMap<String, String> = std::collections::HashMap::new();
    for t in input.transforms {
        match &t.variant {
            TransformVariant::Case { target, cases, r#else } => {
                let mut sql = String::from("CASE");
                for case in cases {
                    let op = compare_op_sql(case.op);
                    let left = normalize_expr(dialect, &case.left, false).unwrap_or(case.left.clone());
                    let right = normalize_expr(dialect, &case.right, false).unwrap_or(case.right.clone());
                    let then = normalize_expr(dialect, &case.then, false).unwrap_or(case.then.clone());
                    sql.push_str(&format!(" WHEN {left} {op} {right} THEN {then}"));
                }
                if let Some(e) = r#else {
                    let e = normalize_expr(dialect, e, false).unwrap_or(e.clone());
                    sql.push_str(&format!(" ELSE {e}"));
                }
                sql.push_str(" END");
                target_exprs.insert(target.clone(), sql);
            }
            TransformVariant::Replace { target, search, replace } => {
                let base = target_exprs
                    .get(target)
                    .cloned()
                    .unwrap_or_else(|| column_ref(dialect, target, &admitted_names));
                let mut expr = base;
                for (s, r) in search.iter().zip(replace.iter()) {
                    expr = format!(
                        "REPLACE({expr}, {s}, {r})",
                        s = crate::sql::quoter::quote_literal(s),
                        r = crate::sql::quoter::quote_literal(r)
                    );
                }
                target_exprs.insert(target.clone(), expr);
            }
            TransformVariant::Translate { target, search, replace } => {
                let base = target_exprs
                    .get(target)
                    .cloned()
                    .unwrap_or_else(|| column_ref(dialect, target, &admitted_names));
                let expr = translate_expr(dialect, &base, search, replace);
                target_exprs.insert(target.clone(), expr);
            }
            TransformVariant::NullHandling { target, mode, value } => {
                let base = target_exprs
                    .get(target)
                    .cloned()
                    .unwrap_or_else(|| column_ref(dialect, target, &admitted_names));
                let literal = crate::sql::quoter::quote_literal(value);
                let expr = match (mode, dialect) {
                    (NullHandlingMode::Isnull, Dialect::Mssql) => format!("ISNULL({base}, {literal})"),
                    (NullHandlingMode::Ifnull, Dialect::Mysql) | (NullHandlingMode::Ifnull, Dialect::Sqlite) => {
                        format!("IFNULL({base}, {literal})")
                    }
                    _ => format!("COALESCE({base}, {literal})"),
                };
                target_exprs.insert(target.clone(), expr);
            }
            TransformVariant::Computed { .. } | TransformVariant::Unpivot { .. } => {}
        }
    }

    // Unpivot: presence changes the FROM clause to a UNION ALL.
    let unpivots: Vec<&TransformItem> = input
        .transforms
        .iter()
        .filter(|t| matches!(t.variant, TransformVariant::Unpivot { .. }))
        .collect();

    let (from_clause, base_alias, unpivot_value_col) = if let Some(item) = unpivots.first() {
        if let TransformVariant::Unpivot {
            source_columns,
            key_column,
            value_column,
            omit_zero_null,
        } = &item.variant
        {
            let mut cols = source_columns.clone();
            if cols.is_empty() {
                cols = admitted_names
                    .iter()
                    .filter(|a| *a != key_column && *a != value_column)
                    .take(MAX_UNPIVOT_SOURCE_COLUMNS_INFERENCE_ITEMS)
                    .cloned()
                    .collect();
            }
            let quoted_source = quote_source(dialect, input.source);
            let key_q = quote_ident(dialect, key_column);
            let value_q = quote_ident(dialect, value_column);
            if cols.is_empty() {
                // No inferable columns: emit a typed NULL value column so
                // downstream aggregation stays valid (spec.md §8).
                let sql = format!(
                    "SELECT s.*, CAST(NULL AS VARCHAR) AS {key_q}, CAST(NULL AS DOUBLE) AS {value_q} FROM {quoted_source} AS s"
                );
                (sql, "u".to_string(), value_column.clone())
            } else {
                let branches: Vec<String> = cols
                    .iter()
                    .map(|c| {
                        let col_expr = column_ref(dialect, c, &admitted_names);
                        let label = crate::sql::quoter::quote_literal(c);
                        let mut stmt = format!(
                            "SELECT s.*, {label} AS {key_q}, {col_expr} AS {value_q} FROM {quoted_source} AS s"
                        );
                        if *omit_zero_null {
                            stmt.push_str(&format!(" WHERE {value_q} IS NOT NULL AND {value_q} <> 0"));
                        }
                        stmt
                    })
                    .collect();
                let sql = branches.join(" UNION ALL ");
                (sql, "u".to_string(), value_column.clone())
            }
        } else {
            unreachable!()
        }
    } else {
        (
            format!("SELECT * FROM {} AS s", quote_source(dialect, input.source)),
            "s".to_string(),
            String::new(),
        )
    };
    let _ = unpivot_value_col;

    // Build the projection list.
    let select_all = input
        .base_select
        .map(|cols| cols.iter().any(|c| c == "*"))
        .unwrap_or(true);

    let mut projection: Vec<String> = Vec::new();
    let mut seen_quoted: HashSet<String> = HashSet::new();

    if select_all {
        projection.push(format!("{base_alias}.*"));
    }

    let requested: HashSet<String> = input
        .base_select
        .map(|cols| cols.iter().filter(|c| *c != "*").cloned().collect())
        .unwrap_or_default();

    for (alias, _expr) in &admitted_aliases {
        if !select_all && !requested.contains(alias) {
            continue;
        }
        if base_columns.iter().any(|b| b == alias) {
            // Never re-project a base column colliding with an alias name.
            continue;
        }
        let expr_sql = target_exprs
            .get(alias)
            .cloned()
            .or_else(|| {
                admitted_aliases
                    .iter()
                    .find(|(a, _)| a == alias)
                    .map(|(_, e)| normalize_expr(dialect, e, false).unwrap_or_else(|_| e.clone()))
            })
            .unwrap_or_else(|| column_ref(dialect, alias, &admitted_names));
        let quoted_alias = quote_ident(dialect, alias);
        let projected = format!("{expr_sql} AS {quoted_alias}");
        if seen_quoted.insert(quoted_alias.clone()) {
            projection.push(projected);
        }
    }

    // Join-projected plain columns and aggregate aliases also need a
    // projection entry when not already covered by `s.*`/`u.*`.
    if !select_all {
        for join in input.joins {
            if let Some(agg) = &join.aggregate {
                if requested.contains(&agg.alias) {
                    let quoted = quote_ident(dialect, &agg.alias);
                    if seen_quoted.insert(quoted.clone()) {
                        projection.push(quoted);
                    }
                }
            }
        }
    }

    let mut sql = format!("SELECT {} FROM ({}) AS {}", projection.join(", "), from_clause, base_alias);

    // Join emission.
    let mut join_counter = 0usize;
    for join in input.joins {
        join_counter += 1;
        let target = quote_source(dialect, &join.target_table);
        let source_key = quote_ident(dialect, &join.source_key);
        let target_key = quote_ident(dialect, &join.target_key);
        let keyword = match join.join_type {
            JoinType::Left => "LEFT JOIN",
            JoinType::Inner => "INNER JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Lateral => "LEFT JOIN LATERAL",
        };

        if let Some(agg) = &join.aggregate {
            let alias = format!("j_{join_counter}");
            let agg_col = quote_ident(dialect, &agg.column);
            let agg_alias = quote_ident(dialect, &agg.alias);
            sql.push_str(&format!(
                " {keyword} (SELECT {target_key}, {fn_name}({agg_col}) AS {agg_alias} FROM {target} GROUP BY {target_key}) AS {alias} ON {base_alias}.{source_key} = {alias}.{target_key}",
                fn_name = agg.fn_name.to_uppercase()
            ));
        } else if matches!(join.join_type, JoinType::Lateral) {
            let alias = format!("j_{join_counter}");
            let mut inner = format!("SELECT * FROM {target}");
            if let Some(filter) = &join.filter {
                let mut conds: Vec<String> = filter
                    .correlations
                    .iter()
                    .map(|c| {
                        format!(
                            "{base_alias}.{} {} {alias}.{}",
                            quote_ident(dialect, &c.source_col),
                            compare_op_sql(c.op),
                            quote_ident(dialect, &c.target_col)
                        )
                    })
                    .collect();
                if conds.is_empty() {
                    conds.push(format!(
                        "{base_alias}.{source_key} = {alias}.{target_key}"
                    ));
                }
                inner.push_str(&format!(" WHERE {}", conds.join(" AND ")));
                if let Some(order) = &filter.order_by {
                    inner.push_str(&format!(" ORDER BY {}", quote_ident(dialect, order)));
                }
                if let Some(limit) = filter.limit {
                    inner.push_str(&format!(" LIMIT {limit}"));
                }
            }
            sql.push_str(&format!(" {keyword} ({inner}) AS {alias} ON TRUE"));
        } else {
            let alias = format!("j_{join_counter}");
            sql.push_str(&format!(
                " {keyword} {target} AS {alias} ON {base_alias}.{source_key} = {alias}.{target_key}"
            ));
        }
    }

    // Defaults: sort then limitTopN.
    if let Some(sort) = &input.defaults.sort {
        sql.push_str(&format!(
            " ORDER BY {} {}",
            quote_ident(dialect, &sort.by),
            sort_direction_sql(sort.direction)
        ));
    }
    if let Some(top_n) = &input.defaults.limit_top_n {
        apply_top_n(&mut sql, top_n);
    }
    if let Some(limit) = input.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut resolved_columns: Vec<String> = Vec::new();
    if select_all {
        resolved_columns.extend(base_columns.clone());
    }
    for (alias, _) in &admitted_aliases {
        if select_all || requested.contains(alias) {
            if !base_columns.iter().any(|b| b == alias) {
                resolved_columns.push(alias.clone());
            }
        }
    }

    TransformResult {
        sql,
        resolved_columns,
        warnings,
        admitted_aliases: admitted_names,
    }
}

fn apply_top_n(sql: &mut String, top_n: &TopNDefault) {
    sql.push_str(&format!(
        " ORDER BY {} {} LIMIT {}",
        top_n.by,
        sort_direction_sql(top_n.direction),
        top_n.n
    ));
}

fn sort_direction_sql(dir: SortDirection) -> &'static str {
    match dir {
        SortDirection::Asc => "ASC",
        SortDirection::Desc => "DESC",
    }
}

fn compare_op_sql(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "<>",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
    }
}

fn column_ref(dialect: Dialect, name: &str, _admitted: &HashSet<String>) -> String {
    quote_ident(dialect, name)
}

/// TRANSLATE emulation: on dialects without a native TRANSLATE, chain
/// per-character REPLACE calls (spec.md §3 "Transform variants").
fn translate_expr(dialect: Dialect, base: &str, search: &str, replace: &str) -> String {
    if matches!(dialect, Dialect::Postgres) {
        return format!(
            "TRANSLATE({base}, {s}, {r})",
            s = crate::sql::quoter::quote_literal(search),
            r = crate::sql::quoter::quote_literal(replace)
        );
    }
    let mut expr = base.to_string();
    for (from_ch, to_ch) in search.chars().zip(
        replace
            .chars()
            .chain(std::iter::repeat(' '))
            .take(search.chars().count()),
    ) {
        expr = format!(
            "REPLACE({expr}, {f}, {t})",
            f = crate::sql::quoter::quote_literal(&from_ch.to_string()),
            t = crate::sql::quoter::quote_literal(&to_ch.to_string())
        );
    }
    expr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;

    fn cc(name: &str, expr: &str) -> CustomColumn {
        CustomColumn {
            name: name.to_string(),
            expr: expr.to_string(),
            r#type: None,
            scope: TransformScope::Datasource,
        }
    }

    #[test]
    fn select_star_projects_base_alias() {
        let defaults = TransformDefaults::default();
        let result = compose(ComposeInput {
            dialect: Dialect::Postgres,
            source: "orders",
            base_select: None,
            probed_base_columns: Some(&["id".to_string(), "status".to_string()]),
            custom_columns: &[],
            transforms: &[],
            joins: &[],
            defaults: &defaults,
            limit: None,
        });
        assert!(result.sql.contains("s.*"));
        assert!(result.sql.contains("\"orders\""));
    }

    #[test]
    fn custom_column_referencing_missing_base_column_is_dropped() {
        let defaults = TransformDefaults::default();
        let result = compose(ComposeInput {
            dialect: Dialect::Postgres,
            source: "orders",
            base_select: None,
            probed_base_columns: Some(&["id".to_string()]),
            custom_columns: &[cc("bad", "nonexistent * 2")],
            transforms: &[],
            joins: &[],
            defaults: &defaults,
            limit: None,
        });
        assert!(!result.admitted_aliases.contains("bad"));
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn custom_column_chain_is_admitted_in_dependency_order() {
        let defaults = TransformDefaults::default();
        let result = compose(ComposeInput {
            dialect: Dialect::Postgres,
            source: "orders",
            base_select: None,
            probed_base_columns: Some(&["quantity".to_string(), "unit_price".to_string()]),
            custom_columns: &[
                cc("total", "quantity * unit_price"),
                cc("total_with_tax", "total * 1.1"),
            ],
            transforms: &[],
            joins: &[],
            defaults: &defaults,
            limit: None,
        });
        assert!(result.admitted_aliases.contains("total"));
        assert!(result.admitted_aliases.contains("total_with_tax"));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn unpivot_with_no_inferable_columns_emits_typed_null() {
        let defaults = TransformDefaults::default();
        let transforms = vec![TransformItem {
            scope: TransformScope::Datasource,
            variant: TransformVariant::Unpivot {
                source_columns: vec![],
                key_column: "metric".to_string(),
                value_column: "value".to_string(),
                omit_zero_null: false,
            },
        }];
        let result = compose(ComposeInput {
            dialect: Dialect::EmbeddedColumnar,
            source: "orders",
            base_select: None,
            probed_base_columns: Some(&["id".to_string()]),
            custom_columns: &[],
            transforms: &transforms,
            joins: &[],
            defaults: &defaults,
            limit: None,
        });
        assert!(result.sql.contains("CAST(NULL AS DOUBLE)"));
    }

    #[test]
    fn aggregate_join_emits_grouped_subquery() {
        let defaults = TransformDefaults::default();
        let joins = vec![JoinSpec {
            scope: TransformScope::Datasource,
            join_type: JoinType::Left,
            target_table: "order_items".to_string(),
            source_key: "id".to_string(),
            target_key: "order_id".to_string(),
            columns: None,
            aggregate: Some(JoinAggregate {
                fn_name: "sum".to_string(),
                column: "qty".to_string(),
                alias: "total_qty".to_string(),
            }),
            filter: None,
        }];
        let result = compose(ComposeInput {
            dialect: Dialect::Postgres,
            source: "orders",
            base_select: None,
            probed_base_columns: Some(&["id".to_string()]),
            custom_columns: &[],
            transforms: &[],
            joins: &joins,
            defaults: &defaults,
            limit: None,
        });
        assert!(result.sql.contains("GROUP BY"));
        assert!(result.sql.contains("SUM("));
    }

    #[test]
    fn top_n_maps_ordinal_to_order_by() {
        let defaults = TransformDefaults {
            sort: None,
            limit_top_n: Some(TopNDefault {
                n: 10,
                by: 2,
                direction: SortDirection::Desc,
            }),
        };
        let result = compose(ComposeInput {
            dialect: Dialect::Postgres,
            source: "orders",
            base_select: None,
            probed_base_columns: Some(&["id".to_string()]),
            custom_columns: &[],
            transforms: &[],
            joins: &[],
            defaults: &defaults,
            limit: None,
        });
        assert!(result.sql.contains("ORDER BY 2 DESC LIMIT 10"));
    }
}
