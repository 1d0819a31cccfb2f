//! Expression Resolver (C3, spec.md §4.3).
//!
//! Builds `alias -> expression` from scope-filtered custom columns, computed
//! transforms, join-projected columns, and join-aggregate aliases. Admission
//! is iterative (up to five passes): an item is admitted once every
//! identifier it references is in the current `available` set (base columns
//! ∪ previously-admitted aliases ∪ joined columns). Anything still
//! unresolvable after five passes is dropped with a warning.

use std::collections::{HashSet, LinkedList};

const MAX_RESOLUTION_PASSES: usize = 5;
/// The reserved alias for the base table in composed SQL (spec.md §4.3,
/// §4.4 step 4: `s.*`).
const BASE_ALIAS_TOKEN: &str = "s";

/// A candidate alias awaiting admission.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub alias: String,
    pub expr: String,
}

/// Outcome of resolving a set of candidates against a base column set.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Admitted aliases, in admission order (dependency-respecting).
    pub admitted: Vec<(String, String)>,
    /// Aliases dropped after exhausting the pass budget, with the reason.
    pub warnings: Vec<String>,
}

/// Scan `expr` lexer-style for referenced identifiers: strips `alias.ident`
/// prefixes, collects bracketed/backtick/quoted/bare identifiers, and
/// discards the reserved base alias token (`s`) and SQL keywords/literals.
pub fn extract_references(expr: &str) -> HashSet<String> {
    let mut refs = HashSet::new();
    let bytes = expr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '[' => {
                if let Some(end) = expr[i + 1..].find(']') {
                    refs.insert(expr[i + 1..i + 1 + end].to_string());
                    i += end + 2;
                    continue;
                }
            }
            '`' => {
                if let Some(end) = expr[i + 1..].find('`') {
                    refs.insert(expr[i + 1..i + 1 + end].to_string());
                    i += end + 2;
                    continue;
                }
            }
            '"' => {
                if let Some(end) = expr[i + 1..].find('"') {
                    refs.insert(expr[i + 1..i + 1 + end].to_string());
                    i += end + 2;
                    continue;
                }
            }
            '\'' => {
                // String literal: skip to the closing (unescaped) quote.
                let rest = &expr[i + 1..];
                let mut j = 0;
                let rb = rest.as_bytes();
                while j < rb.len() {
                    if rb[j] == b'\'' {
                        if j + 1 < rb.len() && rb[j + 1] == b'\'' {
                            j += 2;
                            continue;
                        }
                        break;
                    }
                    j += 1;
                }
                i += j + 2;
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while end < bytes.len() {
                    let ch = bytes[end] as char;
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        end += 1;
                    } else {
                        break;
                    }
                }
                let token = &expr[start..end];
                // `alias.ident` — strip the alias prefix, keep the ident part
                // (the dot is the next char if present).
                if end < bytes.len() && bytes[end] as char == '.' {
                    let after_dot = end + 1;
                    let mut ident_end = after_dot;
                    while ident_end < bytes.len() {
                        let ch = bytes[ident_end] as char;
                        if ch.is_ascii_alphanumeric() || ch == '_' {
                            ident_end += 1;
                        } else {
                            break;
                        }
                    }
                    let ident = &expr[after_dot..ident_end];
                    if !ident.is_empty() && !is_reserved(token) {
                        refs.insert(ident.to_string());
                    }
                    i = ident_end;
                    continue;
                }
                if !is_reserved(token) && !is_sql_keyword(token) {
                    refs.insert(token.to_string());
                }
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    refs
}

fn is_reserved(token: &str) -> bool {
    token == BASE_ALIAS_TOKEN
}

fn is_sql_keyword(token: &str) -> bool {
    matches!(
        token.to_ascii_uppercase().as_str(),
        "AND" | "OR" | "NOT" | "NULL" | "IS" | "IN" | "LIKE" | "CASE" | "WHEN" | "THEN" | "ELSE"
            | "END" | "AS" | "TRUE" | "FALSE" | "CAST" | "COALESCE" | "SUM" | "AVG" | "COUNT"
            | "MIN" | "MAX" | "DISTINCT"
    )
}

/// Resolve candidates iteratively against `base_columns` and `joined_columns`.
pub fn resolve(
    base_columns: &[String],
    joined_columns: &[String],
    candidates: Vec<Candidate>,
) -> Resolution {
    let mut available: HashSet<String> = base_columns.iter().cloned().collect();
    available.extend(joined_columns.iter().cloned());

    let mut pending: LinkedList<Candidate> = candidates.into_iter().collect();
    let mut admitted = Vec::new();

    for _pass in 0..MAX_RESOLUTION_PASSES {
        if pending.is_empty() {
            break;
        }
        let mut still_pending = LinkedList::new();
        let mut progressed = false;
        while let Some(candidate) = pending.pop_front() {
            let refs = extract_references(&candidate.expr);
            if refs.iter().all(|r| available.contains(r)) {
                available.insert(candidate.alias.clone());
                admitted.push((candidate.alias.clone(), candidate.expr.clone()));
                progressed = true;
            } else {
                still_pending.push_back(candidate);
            }
        }
        pending = still_pending;
        if !progressed {
            break;
        }
    }

    let warnings = pending
        .into_iter()
        .map(|c| {
            format!(
                "dropped alias '{}': unresolved references after {} passes",
                c.alias, MAX_RESOLUTION_PASSES
            )
        })
        .collect();

    Resolution { admitted, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bare_and_bracketed_identifiers() {
        let refs = extract_references("[unit_price] * quantity + s.tax");
        assert!(refs.contains("unit_price"));
        assert!(refs.contains("quantity"));
        assert!(refs.contains("tax"));
        assert!(!refs.contains("s"));
    }

    #[test]
    fn ignores_string_literals() {
        let refs = extract_references("status = 'shipped_or_delivered'");
        assert!(refs.contains("status"));
        assert!(!refs.contains("shipped_or_delivered"));
    }

    #[test]
    fn ignores_sql_keywords() {
        let refs = extract_references("CASE WHEN x > 0 THEN 1 ELSE 0 END");
        assert!(refs.contains("x"));
        assert!(!refs.contains("CASE"));
        assert!(!refs.contains("WHEN"));
    }

    #[test]
    fn resolves_derived_from_derived_chains() {
        let base = vec!["quantity".to_string(), "unit_price".to_string()];
        let candidates = vec![
            Candidate {
                alias: "total".to_string(),
                expr: "quantity * unit_price".to_string(),
            },
            Candidate {
                alias: "total_with_tax".to_string(),
                expr: "total * 1.1".to_string(),
            },
            Candidate {
                alias: "rounded_total".to_string(),
                expr: "ROUND(total_with_tax, 2)".to_string(),
            },
        ];
        let res = resolve(&base, &[], candidates);
        assert_eq!(res.admitted.len(), 3);
        assert!(res.warnings.is_empty());
        // dependency order respected
        let order: Vec<_> = res.admitted.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(order, ["total", "total_with_tax", "rounded_total"]);
    }

    #[test]
    fn drops_unresolvable_items_with_warning() {
        let base = vec!["a".to_string()];
        let candidates = vec![Candidate {
            alias: "bad".to_string(),
            expr: "a + nonexistent_column".to_string(),
        }];
        let res = resolve(&base, &[], candidates);
        assert!(res.admitted.is_empty());
        assert_eq!(res.warnings.len(), 1);
    }
}
