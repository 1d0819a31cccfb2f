//! Date-Part Library (C2, spec.md §4.2).
//!
//! Produces dialect-specific SQL for the nine date-part tokens. Numeric parts
//! (Year, Quarter, Month, Week, Day) must return integers; label parts
//! (Month Name, Month Short, Day Name, Day Short) return strings. Week
//! semantics default to ISO (Monday start); `weekStart=sun` shifts the
//! bucket boundary by a day.

use crate::model::{Dialect, WeekStart};
use crate::sql::quoter::quote_ident;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatePart {
    Year,
    Quarter,
    Month,
    MonthName,
    MonthShort,
    Week,
    Day,
    DayName,
    DayShort,
}

impl DatePart {
    /// Parse the `Part` token out of a `"<baseCol> (<Part>)"` derived field
    /// name (glossary: "Date-part token").
    pub fn from_label(label: &str) -> Option<DatePart> {
        Some(match label {
            "Year" => DatePart::Year,
            "Quarter" => DatePart::Quarter,
            "Month" => DatePart::Month,
            "Month Name" => DatePart::MonthName,
            "Month Short" => DatePart::MonthShort,
            "Week" => DatePart::Week,
            "Day" => DatePart::Day,
            "Day Name" => DatePart::DayName,
            "Day Short" => DatePart::DayShort,
            _ => return None,
        })
    }

    /// Whether this part returns an integer (true) or a string (false) —
    /// used by the WHERE planner to coerce filter values (spec.md §4.6,
    /// §8 "Date-part typing").
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            DatePart::Year | DatePart::Quarter | DatePart::Month | DatePart::Week | DatePart::Day
        )
    }
}

/// A parsed date-part token: the base column and which part to extract.
#[derive(Debug, Clone)]
pub struct DatePartToken {
    pub base_column: String,
    pub part: DatePart,
}

impl DatePartToken {
    /// Parse `"order_date (Month Short)"` into `{base_column: "order_date",
    /// part: MonthShort}`. Returns `None` if the field isn't shaped like a
    /// date-part token.
    pub fn parse(field: &str) -> Option<DatePartToken> {
        let open = field.rfind('(')?;
        let close = field.rfind(')')?;
        if close < open {
            return None;
        }
        let label = field[open + 1..close].trim();
        let part = DatePart::from_label(label)?;
        let base_column = field[..open].trim().to_string();
        if base_column.is_empty() {
            return None;
        }
        Some(DatePartToken { base_column, part })
    }
}

/// Build the SQL expression for `col (<part>)`. `week_start` only affects
/// `Week`. The returned expression is self-contained (already quotes the
/// base column via [`quote_ident`]).
pub fn date_part_expr(
    dialect: Dialect,
    column: &str,
    part: DatePart,
    week_start: WeekStart,
) -> String {
    let col = quote_ident(dialect, column);
    match dialect {
        Dialect::EmbeddedColumnar | Dialect::Postgres => embedded_or_postgres_expr(&col, part, week_start, dialect),
        Dialect::Mysql => mysql_expr(&col, part, week_start),
        Dialect::Mssql => mssql_expr(&col, part, week_start),
        Dialect::Sqlite => sqlite_expr(&col, part, week_start),
    }
}

/// Numeric ISO week, shifted by one day when `week_start=sun`
/// (DuckDB/Postgres share `date_part`/`extract` + `isodow`).
fn embedded_or_postgres_expr(
    col: &str,
    part: DatePart,
    week_start: WeekStart,
    dialect: Dialect,
) -> String {
    let shifted = shifted_date_expr(col, week_start);
    match part {
        DatePart::Year => format!("CAST(date_part('year', {col}) AS BIGINT)"),
        DatePart::Quarter => format!("CAST(date_part('quarter', {col}) AS BIGINT)"),
        DatePart::Month => format!("CAST(date_part('month', {col}) AS BIGINT)"),
        DatePart::Week => format!("CAST(date_part('week', {shifted}) AS BIGINT)"),
        DatePart::Day => format!("CAST(date_part('day', {col}) AS BIGINT)"),
        DatePart::MonthName => format!("trim(to_char({col}, 'Month'))"),
        DatePart::MonthShort => format!("to_char({col}, 'Mon')"),
        DatePart::DayName => format!("trim(to_char({col}, 'Day'))"),
        DatePart::DayShort => {
            if matches!(dialect, Dialect::EmbeddedColumnar) {
                format!("strftime({col}, '%a')")
            } else {
                format!("to_char({col}, 'Dy')")
            }
        }
    }
}

fn mysql_expr(col: &str, part: DatePart, week_start: WeekStart) -> String {
    // MySQL WEEK() mode 3 = ISO week starting Monday, mode 2 effectively
    // shifts the boundary for a Sunday-first bucket.
    let week_mode = match week_start {
        WeekStart::Mon => 3,
        WeekStart::Sun => 2,
    };
    match part {
        DatePart::Year => format!("CAST(YEAR({col}) AS SIGNED)"),
        DatePart::Quarter => format!("CAST(QUARTER({col}) AS SIGNED)"),
        DatePart::Month => format!("CAST(MONTH({col}) AS SIGNED)"),
        DatePart::Week => format!("CAST(WEEK({col}, {week_mode}) AS SIGNED)"),
        DatePart::Day => format!("CAST(DAY({col}) AS SIGNED)"),
        DatePart::MonthName => format!("MONTHNAME({col})"),
        DatePart::MonthShort => format!("DATE_FORMAT({col}, '%b')"),
        DatePart::DayName => format!("DAYNAME({col})"),
        DatePart::DayShort => format!("DATE_FORMAT({col}, '%a')"),
    }
}

fn mssql_expr(col: &str, part: DatePart, week_start: WeekStart) -> String {
    let datefirst_shift = match week_start {
        WeekStart::Mon => col.to_string(),
        WeekStart::Sun => format!("DATEADD(day, 1, {col})"),
    };
    match part {
        DatePart::Year => format!("CAST(DATEPART(year, {col}) AS BIGINT)"),
        DatePart::Quarter => format!("CAST(DATEPART(quarter, {col}) AS BIGINT)"),
        DatePart::Month => format!("CAST(DATEPART(month, {col}) AS BIGINT)"),
        DatePart::Week => format!("CAST(DATEPART(iso_week, {datefirst_shift}) AS BIGINT)"),
        DatePart::Day => format!("CAST(DATEPART(day, {col}) AS BIGINT)"),
        DatePart::MonthName => format!("DATENAME(month, {col})"),
        DatePart::MonthShort => format!("LEFT(DATENAME(month, {col}), 3)"),
        DatePart::DayName => format!("DATENAME(weekday, {col})"),
        DatePart::DayShort => format!("LEFT(DATENAME(weekday, {col}), 3)"),
    }
}

fn sqlite_expr(col: &str, part: DatePart, week_start: WeekStart) -> String {
    let shifted = shifted_date_expr(col, week_start);
    match part {
        DatePart::Year => format!("CAST(strftime('%Y', {col}) AS INTEGER)"),
        DatePart::Quarter => format!("((CAST(strftime('%m', {col}) AS INTEGER) - 1) / 3 + 1)"),
        DatePart::Month => format!("CAST(strftime('%m', {col}) AS INTEGER)"),
        DatePart::Week => format!("CAST(strftime('%W', {shifted}) AS INTEGER) + 1"),
        DatePart::Day => format!("CAST(strftime('%d', {col}) AS INTEGER)"),
        DatePart::MonthName => format!("CASE CAST(strftime('%m', {col}) AS INTEGER) WHEN 1 THEN 'January' WHEN 2 THEN 'February' WHEN 3 THEN 'March' WHEN 4 THEN 'April' WHEN 5 THEN 'May' WHEN 6 THEN 'June' WHEN 7 THEN 'July' WHEN 8 THEN 'August' WHEN 9 THEN 'September' WHEN 10 THEN 'October' WHEN 11 THEN 'November' ELSE 'December' END"),
        DatePart::MonthShort => format!("substr(CASE CAST(strftime('%m', {col}) AS INTEGER) WHEN 1 THEN 'January' WHEN 2 THEN 'February' WHEN 3 THEN 'March' WHEN 4 THEN 'April' WHEN 5 THEN 'May' WHEN 6 THEN 'June' WHEN 7 THEN 'July' WHEN 8 THEN 'August' WHEN 9 THEN 'September' WHEN 10 THEN 'October' WHEN 11 THEN 'November' ELSE 'December' END, 1, 3)"),
        DatePart::DayName => format!("CASE strftime('%w', {col}) WHEN '0' THEN 'Sunday' WHEN '1' THEN 'Monday' WHEN '2' THEN 'Tuesday' WHEN '3' THEN 'Wednesday' WHEN '4' THEN 'Thursday' WHEN '5' THEN 'Friday' ELSE 'Saturday' END"),
        DatePart::DayShort => format!("substr(CASE strftime('%w', {col}) WHEN '0' THEN 'Sunday' WHEN '1' THEN 'Monday' WHEN '2' THEN 'Tuesday' WHEN '3' THEN 'Wednesday' WHEN '4' THEN 'Thursday' WHEN '5' THEN 'Friday' ELSE 'Saturday' END, 1, 3)"),
    }
}

fn shifted_date_expr(col: &str, week_start: WeekStart) -> String {
    match week_start {
        WeekStart::Mon => col.to_string(),
        WeekStart::Sun => format!("({col} + INTERVAL '1 day')"),
    }
}

/// Ordering companion expression for a date-part column: sorting a label
/// (e.g. "Jan") alphabetically would be wrong, so grouped/labeled results
/// carry a numeric ordinal alongside the label (spec.md §4.5.1 "X expression").
pub fn date_part_order_expr(dialect: Dialect, column: &str, part: DatePart) -> Option<String> {
    match part {
        DatePart::MonthName | DatePart::MonthShort => Some(date_part_expr(
            dialect,
            column,
            DatePart::Month,
            WeekStart::Mon,
        )),
        DatePart::DayName | DatePart::DayShort => Some(match dialect {
            Dialect::EmbeddedColumnar | Dialect::Postgres => {
                format!("CAST(date_part('dow', {}) AS BIGINT)", quote_ident(dialect, column))
            }
            Dialect::Mysql => format!("DAYOFWEEK({})", quote_ident(dialect, column)),
            Dialect::Mssql => format!("DATEPART(weekday, {})", quote_ident(dialect, column)),
            Dialect::Sqlite => format!("CAST(strftime('%w', {}) AS INTEGER)", quote_ident(dialect, column)),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_part_token() {
        let t = DatePartToken::parse("order_date (Month Short)").unwrap();
        assert_eq!(t.base_column, "order_date");
        assert_eq!(t.part, DatePart::MonthShort);
    }

    #[test]
    fn non_token_fields_do_not_parse() {
        assert!(DatePartToken::parse("unit_price").is_none());
    }

    #[test]
    fn numeric_parts_are_flagged_numeric() {
        assert!(DatePart::Year.is_numeric());
        assert!(DatePart::Week.is_numeric());
        assert!(!DatePart::MonthName.is_numeric());
        assert!(!DatePart::DayShort.is_numeric());
    }

    #[test]
    fn all_dialects_produce_an_expression_for_every_part() {
        let parts = [
            DatePart::Year,
            DatePart::Quarter,
            DatePart::Month,
            DatePart::MonthName,
            DatePart::MonthShort,
            DatePart::Week,
            DatePart::Day,
            DatePart::DayName,
            DatePart::DayShort,
        ];
        for dialect in [
            Dialect::EmbeddedColumnar,
            Dialect::Postgres,
            Dialect::Mysql,
            Dialect::Mssql,
            Dialect::Sqlite,
        ] {
            for part in parts {
                let expr = date_part_expr(dialect, "order_date", part, WeekStart::Mon);
                assert!(!expr.is_empty());
            }
        }
    }

    #[test]
    fn week_start_sun_changes_week_expression() {
        let mon = date_part_expr(Dialect::Postgres, "d", DatePart::Week, WeekStart::Mon);
        let sun = date_part_expr(Dialect::Postgres, "d", DatePart::Week, WeekStart::Sun);
        assert_ne!(mon, sun);
    }
}
