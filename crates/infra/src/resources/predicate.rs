//! Upstream eligibility filters.
//!
//! A resource's `filter_upstream` returns a [`Predicate`]. The reconciler and
//! the Postgres stores render it to SQL; the in-memory store evaluates it
//! against row JSON. Both paths share one definition of scope.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PredicateError {
    #[error("invalid column name {0:?}")]
    InvalidColumn(String),
    #[error("empty {0} clause")]
    EmptyClause(&'static str),
}

/// Boolean filter over the columns of one upstream row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    IsNull { column: String },
    NotNull { column: String },
    Eq { column: String, value: JsonValue },
    In { column: String, values: Vec<JsonValue> },
    And { all: Vec<Predicate> },
    Or { any: Vec<Predicate> },
    Not { inner: Box<Predicate> },
}

impl Predicate {
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull { column: column.into() }
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Self::NotNull { column: column.into() }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn one_of(column: impl Into<String>, values: Vec<JsonValue>) -> Self {
        Self::In {
            column: column.into(),
            values,
        }
    }

    pub fn and(all: Vec<Predicate>) -> Self {
        Self::And { all }
    }

    pub fn or(any: Vec<Predicate>) -> Self {
        Self::Or { any }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Predicate) -> Self {
        Self::Not {
            inner: Box::new(inner),
        }
    }

    /// Render as a SQL boolean expression over `alias`.
    ///
    /// Comparison values are pushed to `params` and compared as text, so one
    /// predicate works whatever the column types are.
    pub fn to_sql(&self, alias: &str, params: &mut SqlParams) -> Result<String, PredicateError> {
        Ok(match self {
            Predicate::IsNull { column } => format!("{} IS NULL", qualified(alias, column)?),
            Predicate::NotNull { column } => format!("{} IS NOT NULL", qualified(alias, column)?),
            Predicate::Eq { column, value } => match text_of(value) {
                Some(text) => format!("{}::text = {}", qualified(alias, column)?, params.push(text)),
                None => format!("{} IS NULL", qualified(alias, column)?),
            },
            Predicate::In { column, values } => {
                let col = qualified(alias, column)?;
                if values.is_empty() {
                    return Ok("FALSE".to_string());
                }
                let placeholders: Vec<_> = values
                    .iter()
                    .filter_map(text_of)
                    .map(|text| params.push(text))
                    .collect();
                let has_null = values.iter().any(JsonValue::is_null);
                match (placeholders.is_empty(), has_null) {
                    (true, _) => format!("{col} IS NULL"),
                    (false, false) => format!("{col}::text IN ({})", placeholders.join(", ")),
                    (false, true) => {
                        format!("({col}::text IN ({}) OR {col} IS NULL)", placeholders.join(", "))
                    }
                }
            }
            Predicate::And { all } => join(all, " AND ", "and", alias, params)?,
            Predicate::Or { any } => join(any, " OR ", "or", alias, params)?,
            Predicate::Not { inner } => format!("NOT ({})", inner.to_sql(alias, params)?),
        })
    }

    /// Whether `row` (a JSON object keyed by column) is selected by the SQL
    /// rendering of this predicate.
    pub fn matches(&self, row: &JsonValue) -> bool {
        self.evaluate(row) == Some(true)
    }

    /// SQL three-valued evaluation: `None` is `NULL` (unknown).
    ///
    /// Comparing a missing or `NULL` column is unknown. `NOT` of unknown stays
    /// unknown.
    pub fn evaluate(&self, row: &JsonValue) -> Option<bool> {
        let column_text = |column: &str| row.get(column).and_then(text_of);
        match self {
            Predicate::IsNull { column } => Some(column_text(column).is_none()),
            Predicate::NotNull { column } => Some(column_text(column).is_some()),
            Predicate::Eq { column, value } => match text_of(value) {
                Some(expected) => column_text(column).map(|actual| actual == expected),
                None => Some(column_text(column).is_none()),
            },
            Predicate::In { column, values } => {
                if values.is_empty() {
                    return Some(false);
                }
                let listed: Vec<String> = values.iter().filter_map(text_of).collect();
                let has_null = listed.len() < values.len();
                match column_text(column) {
                    None if has_null => Some(true),
                    None => None,
                    Some(actual) => Some(listed.contains(&actual)),
                }
            }
            Predicate::And { all } => combine(all, row, false),
            Predicate::Or { any } => combine(any, row, true),
            Predicate::Not { inner } => inner.evaluate(row).map(|b| !b),
        }
    }
}

/// Positional text parameters collected while rendering SQL.
#[derive(Debug, Clone, Default)]
pub struct SqlParams {
    offset: usize,
    values: Vec<String>,
}

impl SqlParams {
    /// Start numbering after `offset` parameters already used by the query.
    pub fn starting_after(offset: usize) -> Self {
        Self {
            offset,
            values: Vec::new(),
        }
    }

    fn push(&mut self, value: String) -> String {
        self.values.push(value);
        format!("${}", self.offset + self.values.len())
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn into_values(self) -> Vec<String> {
        self.values
    }
}

fn join(
    parts: &[Predicate],
    sep: &str,
    name: &'static str,
    alias: &str,
    params: &mut SqlParams,
) -> Result<String, PredicateError> {
    if parts.is_empty() {
        return Err(PredicateError::EmptyClause(name));
    }
    let rendered = parts
        .iter()
        .map(|p| p.to_sql(alias, params).map(|sql| format!("({sql})")))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rendered.join(sep))
}

/// `AND` (`short_circuit = false`) or `OR` (`true`) over three-valued parts.
fn combine(parts: &[Predicate], row: &JsonValue, short_circuit: bool) -> Option<bool> {
    let mut unknown = false;
    for part in parts {
        match part.evaluate(row) {
            Some(b) if b == short_circuit => return Some(short_circuit),
            Some(_) => {}
            None => unknown = true,
        }
    }
    (!unknown).then_some(!short_circuit)
}

/// SQL-null → `None`; scalars compare by their text form.
fn text_of(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Checks an identifier is a plain SQL name.
pub fn validate_identifier(name: &str) -> Result<&str, PredicateError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(PredicateError::InvalidColumn(name.to_string()))
    }
}

fn qualified(alias: &str, column: &str) -> Result<String, PredicateError> {
    Ok(format!(
        "{}.\"{}\"",
        validate_identifier(alias)?,
        validate_identifier(column)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn not_deleted() -> Predicate {
        Predicate::is_null("deleted_at")
    }

    #[test]
    fn renders_nested_sql_with_numbered_params() {
        let p = Predicate::and(vec![
            not_deleted(),
            Predicate::eq("status", "final"),
            Predicate::one_of("kind", vec![json!("a"), json!(2)]),
        ]);

        let mut params = SqlParams::starting_after(2);
        let sql = p.to_sql("upstream", &mut params).unwrap();

        assert_eq!(
            sql,
            "(upstream.\"deleted_at\" IS NULL) AND (upstream.\"status\"::text = $3) \
             AND (upstream.\"kind\"::text IN ($4, $5))"
        );
        assert_eq!(params.values(), ["final", "a", "2"]);
    }

    #[test]
    fn rejects_injection_in_column_names() {
        let p = Predicate::eq("status; DROP TABLE x", "y");
        let err = p.to_sql("u", &mut SqlParams::default()).unwrap_err();
        assert!(matches!(err, PredicateError::InvalidColumn(_)));
    }

    #[test]
    fn empty_and_is_an_error() {
        let err = Predicate::and(vec![]).to_sql("u", &mut SqlParams::default());
        assert_eq!(err, Err(PredicateError::EmptyClause("and")));
    }

    #[test]
    fn in_memory_evaluation_matches_sql_semantics() {
        let live = json!({"id": "1", "deleted_at": null, "status": "final", "n": 3});
        let deleted = json!({"id": "2", "deleted_at": "2024-01-01", "status": "final"});

        assert!(not_deleted().matches(&live));
        assert!(!not_deleted().matches(&deleted));
        // A missing column reads as NULL.
        assert!(Predicate::is_null("nope").matches(&live));

        assert!(Predicate::eq("n", "3").matches(&live));
        assert!(Predicate::one_of("status", vec![json!("draft"), json!("final")]).matches(&live));
        assert!(Predicate::not(Predicate::eq("status", "draft")).matches(&live));
        assert!(Predicate::or(vec![Predicate::eq("status", "x"), not_deleted()]).matches(&live));
    }

    #[test]
    fn negated_comparison_on_null_column_is_unknown() {
        let cancelled = Predicate::not(Predicate::eq("status", "cancelled"));
        let null_status = json!({"status": null});
        let no_status = json!({});

        let mut params = SqlParams::default();
        assert_eq!(
            cancelled.to_sql("upstream", &mut params).unwrap(),
            "NOT (upstream.\"status\"::text = $1)"
        );
        assert_eq!(cancelled.evaluate(&null_status), None);
        assert!(!cancelled.matches(&null_status));
        assert!(!cancelled.matches(&no_status));
        assert!(cancelled.matches(&json!({"status": "final"})));

        let not_in = Predicate::not(Predicate::one_of("status", vec![json!("a"), json!("b")]));
        assert!(!not_in.matches(&null_status));

        // A NULL in the list makes the IN clause true for NULL columns.
        let in_or_null = Predicate::one_of("status", vec![json!("a"), JsonValue::Null]);
        assert!(in_or_null.matches(&null_status));
        assert!(!Predicate::not(in_or_null).matches(&null_status));
    }

    #[test]
    fn unknown_follows_sql_truth_tables() {
        let row = json!({"status": null, "kind": "x"});
        let unknown = Predicate::eq("status", "final");
        let yes = Predicate::eq("kind", "x");
        let no = Predicate::eq("kind", "y");

        assert_eq!(Predicate::and(vec![unknown.clone(), yes.clone()]).evaluate(&row), None);
        assert_eq!(Predicate::and(vec![unknown.clone(), no.clone()]).evaluate(&row), Some(false));
        assert_eq!(Predicate::or(vec![unknown.clone(), yes]).evaluate(&row), Some(true));
        assert_eq!(Predicate::or(vec![unknown.clone(), no]).evaluate(&row), None);
        assert_eq!(
            Predicate::not(Predicate::and(vec![unknown, Predicate::is_null("status")])).evaluate(&row),
            None
        );
    }

    #[test]
    fn serde_uses_op_tag() {
        let p: Predicate = serde_json::from_value(json!({
            "op": "and",
            "all": [
                {"op": "is_null", "column": "deleted_at"},
                {"op": "not", "inner": {"op": "eq", "column": "status", "value": "cancelled"}}
            ]
        }))
        .unwrap();

        assert_eq!(
            p,
            Predicate::and(vec![
                not_deleted(),
                Predicate::not(Predicate::eq("status", "cancelled")),
            ])
        );
    }
}
