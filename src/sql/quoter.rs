//! Identifier Quoter (C1, spec.md §4.1).
//!
//! Dialect-aware identifier/literal quoting and bracket/quote normalization.
//! This is the only place a dialect's quote character is hard-coded; every
//! other module goes through here.

use crate::error::{EngineError, Result};
use crate::model::Dialect;

/// The quote character pair `(open, close)` for a dialect's identifiers.
fn quote_chars(dialect: Dialect) -> (char, char) {
    match dialect {
        Dialect::EmbeddedColumnar | Dialect::Postgres | Dialect::Sqlite => ('"', '"'),
        Dialect::Mysql => ('`', '`'),
        Dialect::Mssql => ('[', ']'),
    }
}

/// Quote a single identifier segment, doubling any embedded close-quote
/// (the SQL-standard escaping rule, which all five dialects honor for their
/// own quote character).
pub fn quote_ident(dialect: Dialect, name: &str) -> String {
    let (open, close) = quote_chars(dialect);
    let escaped = name.replace(close, &format!("{close}{close}"));
    format!("{open}{escaped}{close}")
}

/// Quote a dotted source name (`schema.table`), quoting each segment
/// independently and leaving already-quoted segments untouched.
pub fn quote_source(dialect: Dialect, dotted_name: &str) -> String {
    dotted_name
        .split('.')
        .map(|segment| {
            if is_already_quoted(segment) {
                segment.to_string()
            } else {
                quote_ident(dialect, segment)
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}

fn is_already_quoted(segment: &str) -> bool {
    let mut chars = segment.chars();
    match (chars.next(), segment.chars().last()) {
        (Some('"'), Some('"')) => segment.len() >= 2,
        (Some('`'), Some('`')) => segment.len() >= 2,
        (Some('['), Some(']')) => segment.len() >= 2,
        _ => false,
    }
}

/// Quote a literal scalar value for inline embedding. Prefer parameterized
/// values wherever the caller controls binding; this exists for the rare
/// cases (e.g. building a cache key, or DDL identifiers) where a literal
/// must be embedded directly.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Replace `[x]`, `` `x` ``, and double-quoted identifiers inside `expr`
/// with the target dialect's identifier quoting, leaving single-quoted
/// string literals untouched. When `numericify` is set, each identifier
/// found this way is additionally wrapped in a dialect-specific numeric
/// coercion chain (spec.md §4.1, glossary "Numericify").
///
/// Fails with `MalformedExpression` when brackets/quotes are unbalanced.
pub fn normalize_expr(dialect: Dialect, expr: &str, numericify: bool) -> Result<String> {
    check_balanced(expr)?;

    let mut out = String::with_capacity(expr.len());
    let mut rest = expr;
    loop {
        match next_token(rest) {
            None => {
                out.push_str(rest);
                break;
            }
            Some((prefix, kind, body, consumed)) => {
                out.push_str(prefix);
                match kind {
                    TokenKind::StringLiteral => {
                        out.push('\'');
                        out.push_str(body);
                        out.push('\'');
                    }
                    TokenKind::Identifier => {
                        let quoted = quote_ident(dialect, body);
                        if numericify {
                            out.push_str(&numericify_expr(dialect, &quoted));
                        } else {
                            out.push_str(&quoted);
                        }
                    }
                }
                rest = &rest[consumed..];
            }
        }
    }
    Ok(out)
}

enum TokenKind {
    StringLiteral,
    Identifier,
}

/// Find the next quoted run (string literal or bracketed/backtick/quoted
/// identifier) in `s`. Returns `(text_before, kind, inner_body, bytes_consumed)`.
fn next_token(s: &str) -> Option<(&str, TokenKind, &str, usize)> {
    let candidates = [
        s.find('\'').map(|i| (i, '\'')),
        s.find('[').map(|i| (i, '[')),
        s.find('`').map(|i| (i, '`')),
        s.find('"').map(|i| (i, '"')),
    ];
    let (start, delim) = candidates.into_iter().flatten().min_by_key(|(i, _)| *i)?;

    match delim {
        '\'' => {
            let body_start = start + 1;
            let end = find_unescaped_single_quote(&s[body_start..])?;
            let body = &s[body_start..body_start + end];
            let consumed = body_start + end + 1;
            Some((&s[..start], TokenKind::StringLiteral, body, consumed))
        }
        '[' => {
            let end_rel = s[start..].find(']')?;
            let body = &s[start + 1..start + end_rel];
            Some((&s[..start], TokenKind::Identifier, body, start + end_rel + 1))
        }
        '`' => {
            let end_rel = s[start + 1..].find('`')?;
            let body = &s[start + 1..start + 1 + end_rel];
            Some((
                &s[..start],
                TokenKind::Identifier,
                body,
                start + 1 + end_rel + 1,
            ))
        }
        '"' => {
            let end_rel = s[start + 1..].find('"')?;
            let body = &s[start + 1..start + 1 + end_rel];
            Some((
                &s[..start],
                TokenKind::Identifier,
                body,
                start + 1 + end_rel + 1,
            ))
        }
        _ => unreachable!(),
    }
}

/// Find the index (relative to `s`) of the next `'` that is not doubled
/// (`''` is an escaped quote inside a string literal).
fn find_unescaped_single_quote(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

fn check_balanced(expr: &str) -> Result<()> {
    let mut bracket_depth = 0i32;
    let mut in_single = false;
    for ch in expr.chars() {
        match ch {
            '\'' => in_single = !in_single,
            '[' if !in_single => bracket_depth += 1,
            ']' if !in_single => bracket_depth -= 1,
            _ => {}
        }
        if bracket_depth < 0 {
            return Err(EngineError::MalformedExpression(format!(
                "unbalanced brackets in expression: {expr}"
            )));
        }
    }
    if in_single {
        return Err(EngineError::MalformedExpression(format!(
            "unterminated string literal in expression: {expr}"
        )));
    }
    if bracket_depth != 0 {
        return Err(EngineError::MalformedExpression(format!(
            "unbalanced brackets in expression: {expr}"
        )));
    }
    let backticks = expr.chars().filter(|&c| c == '`').count();
    if backticks % 2 != 0 {
        return Err(EngineError::MalformedExpression(format!(
            "unbalanced backticks in expression: {expr}"
        )));
    }
    Ok(())
}

/// Wrap an already-quoted identifier in a dialect-appropriate numeric
/// coercion chain that tolerates string numerics with commas/trailing units
/// (glossary: "Numericify").
fn numericify_expr(dialect: Dialect, quoted_ident: &str) -> String {
    match dialect {
        Dialect::EmbeddedColumnar => format!(
            "COALESCE(try_cast(regexp_replace(CAST({i} AS VARCHAR), '[^0-9\\.-]', '', 'g') AS DOUBLE), try_cast({i} AS DOUBLE), 0.0)",
            i = quoted_ident
        ),
        Dialect::Postgres => format!(
            "COALESCE(NULLIF(regexp_replace({i}::text, '[^0-9\\.-]', '', 'g'), '')::double precision, {i}::double precision, 0.0)",
            i = quoted_ident
        ),
        Dialect::Mysql => format!(
            "COALESCE(CAST(NULLIF(REGEXP_REPLACE(CAST({i} AS CHAR), '[^0-9.-]', ''), '') AS DOUBLE), CAST({i} AS DOUBLE), 0.0)",
            i = quoted_ident
        ),
        Dialect::Mssql => format!(
            "COALESCE(TRY_CAST({i} AS FLOAT), 0.0)",
            i = quoted_ident
        ),
        Dialect::Sqlite => format!("COALESCE(CAST({i} AS REAL), 0.0)", i = quoted_ident),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_per_dialect() {
        assert_eq!(quote_ident(Dialect::Postgres, "order_date"), "\"order_date\"");
        assert_eq!(quote_ident(Dialect::Mysql, "order_date"), "`order_date`");
        assert_eq!(quote_ident(Dialect::Mssql, "order_date"), "[order_date]");
    }

    #[test]
    fn quote_ident_escapes_embedded_quote() {
        assert_eq!(quote_ident(Dialect::Postgres, "a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn quote_source_quotes_each_segment() {
        assert_eq!(
            quote_source(Dialect::Postgres, "public.orders"),
            "\"public\".\"orders\""
        );
    }

    #[test]
    fn quote_source_preserves_already_quoted_segments() {
        assert_eq!(
            quote_source(Dialect::Mysql, "`public`.orders"),
            "`public`.`orders`"
        );
    }

    #[test]
    fn round_trip_quote_unquote() {
        for dialect in [
            Dialect::EmbeddedColumnar,
            Dialect::Postgres,
            Dialect::Mysql,
            Dialect::Mssql,
            Dialect::Sqlite,
        ] {
            for name in ["orders", "order date", "weird\"name"] {
                let quoted = quote_ident(dialect, name);
                let (open, close) = quote_chars(dialect);
                let inner = &quoted[open.len_utf8()..quoted.len() - close.len_utf8()];
                let unquoted = inner.replace(&format!("{close}{close}"), &close.to_string());
                assert_eq!(unquoted, name);
            }
        }
    }

    #[test]
    fn normalize_expr_translates_brackets_to_dialect() {
        let out = normalize_expr(Dialect::Postgres, "[order_date] + 1", false).unwrap();
        assert_eq!(out, "\"order_date\" + 1");
    }

    #[test]
    fn normalize_expr_leaves_string_literals_untouched() {
        let out = normalize_expr(Dialect::Postgres, "[status] = 'shipped'", false).unwrap();
        assert_eq!(out, "\"status\" = 'shipped'");
    }

    #[test]
    fn normalize_expr_is_idempotent() {
        let once = normalize_expr(Dialect::Mysql, "[a].[b] = 'x'", false).unwrap();
        let twice = normalize_expr(Dialect::Mysql, &once, false).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_expr_rejects_unbalanced_brackets() {
        assert!(normalize_expr(Dialect::Postgres, "[order_date + 1", false).is_err());
    }

    #[test]
    fn normalize_expr_numericify_wraps_identifier() {
        let out = normalize_expr(Dialect::EmbeddedColumnar, "[unit_price]", true).unwrap();
        assert!(out.contains("try_cast"));
        assert!(out.contains("\"unit_price\""));
    }
}
