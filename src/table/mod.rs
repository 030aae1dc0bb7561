//! Small row-and-column tables keyed by `article_id`.
//!
//! Unlabeled pools, labeled batches and the reconciled corpus are all
//! tables. Columns the typed records don't know about are carried through
//! untouched, so batches written by older sessions still merge cleanly.

mod codec;
mod csv;

pub use self::codec::*;
pub use self::csv::to_csv;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Column every table is keyed by.
pub const KEY_COLUMN: &str = "article_id";

pub type Row = Map<String, Value>;

/// Which row survives when several rows share an `article_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Earliest row in concatenation order wins.
    #[default]
    KeepFirst,
    /// Latest row in concatenation order wins.
    KeepLast,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "first" | "keep-first" => Ok(DuplicatePolicy::KeepFirst),
            "last" | "keep-last" => Ok(DuplicatePolicy::KeepLast),
            other => Err(format!("unknown duplicate policy '{}' (expected 'first' or 'last')", other)),
        }
    }
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::KeepFirst => write!(f, "first"),
            DuplicatePolicy::KeepLast => write!(f, "last"),
        }
    }
}

/// Normalizes an `article_id` cell into a lookup key.
///
/// Strings are used verbatim, integers (including integral floats, which
/// is how some exporters write nullable integer columns) in decimal.
pub fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive.
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(f))
                    .map(|f| format!("{}", f as i64))
            }
        }
        _ => None,
    }
}

pub fn row_key(row: &Row) -> Option<String> {
    row.get(KEY_COLUMN).and_then(key_of)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Table {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn from_rows(rows: impl IntoIterator<Item = Row>) -> Self {
        let mut table = Table::new();
        for row in rows {
            table.push_row(row);
        }
        table
    }

    /// Serializes typed records into rows, one per record.
    pub fn from_records<T: Serialize>(records: &[T]) -> Result<Self, serde_json::Error> {
        let mut table = Table::new();
        for record in records {
            match serde_json::to_value(record)? {
                Value::Object(row) => table.push_row(row),
                other => {
                    return Err(serde::ser::Error::custom(format!(
                        "record serialized to {} instead of an object",
                        other
                    )))
                }
            }
        }
        Ok(table)
    }

    pub fn to_records<T: DeserializeOwned>(&self) -> Result<Vec<T>, serde_json::Error> {
        self.rows
            .iter()
            .map(|row| serde_json::from_value(Value::Object(row.clone())))
            .collect()
    }

    pub fn push_row(&mut self, row: Row) {
        for column in row.keys() {
            if !self.columns.iter().any(|c| c == column) {
                self.columns.push(column.clone());
            }
        }
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends tables in order, unioning their columns.
    pub fn concat(tables: impl IntoIterator<Item = Table>) -> Table {
        let mut combined = Table::new();
        for table in tables {
            for column in table.columns {
                if !combined.columns.contains(&column) {
                    combined.columns.push(column);
                }
            }
            combined.rows.extend(table.rows);
        }
        combined
    }

    pub fn key_set(&self) -> HashSet<String> {
        self.rows.iter().filter_map(row_key).collect()
    }

    /// Collapses rows sharing an `article_id` down to one.
    ///
    /// Survivors keep their relative order. Rows with no usable key are
    /// dropped since they can never be matched against the pool.
    pub fn dedup_by_key(self, policy: DuplicatePolicy) -> Table {
        let Table { columns, rows } = self;
        let mut seen = HashSet::with_capacity(rows.len());

        let rows = match policy {
            DuplicatePolicy::KeepFirst => rows
                .into_iter()
                .filter(|row| row_key(row).is_some_and(|key| seen.insert(key)))
                .collect(),
            DuplicatePolicy::KeepLast => {
                let mut kept: Vec<Row> = rows
                    .into_iter()
                    .rev()
                    .filter(|row| row_key(row).is_some_and(|key| seen.insert(key)))
                    .collect();
                kept.reverse();
                kept
            }
        };

        Table { columns, rows }
    }

    /// Keeps only rows whose `article_id` is not in `keys`.
    pub fn without_keys(self, keys: &HashSet<String>) -> Table {
        let Table { columns, rows } = self;
        let rows = rows
            .into_iter()
            .filter(|row| row_key(row).map_or(true, |key| !keys.contains(&key)))
            .collect();
        Table { columns, rows }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("test rows must be objects"),
        }
    }

    fn ids(table: &Table) -> Vec<String> {
        table.rows().iter().filter_map(row_key).collect()
    }

    #[test]
    fn test_key_of_normalizes_numbers() {
        assert_eq!(key_of(&json!(12)), Some("12".to_string()));
        assert_eq!(key_of(&json!(12.0)), Some("12".to_string()));
        assert_eq!(key_of(&json!("a-12")), Some("a-12".to_string()));
        assert_eq!(key_of(&json!(12.5)), None);
        assert_eq!(key_of(&json!("  ")), None);
        assert_eq!(key_of(&Value::Null), None);
    }

    #[test]
    fn test_key_of_rejects_floats_outside_i64() {
        assert_eq!(key_of(&json!(-9.0e15)), Some("-9000000000000000".to_string()));
        assert_eq!(key_of(&json!(9.223372036854775807e18)), None);
        assert_eq!(key_of(&json!(1.0e19)), None);
        assert_eq!(key_of(&json!(1.0e300)), None);
        assert_eq!(key_of(&json!(-1.0e19)), None);
        assert_eq!(
            key_of(&json!(-9.223372036854775808e18)),
            Some(i64::MIN.to_string())
        );
    }

    #[test]
    fn test_columns_follow_first_appearance() {
        let table = Table::from_rows(vec![
            row(json!({"article_id": 1, "link": "a"})),
            row(json!({"article_id": 2, "country": "peru"})),
        ]);
        assert_eq!(table.columns(), &["article_id", "link", "country"]);
    }

    #[test]
    fn test_dedup_keep_first() {
        let table = Table::from_rows(vec![
            row(json!({"article_id": 1, "label": "A"})),
            row(json!({"article_id": 1, "label": "B"})),
            row(json!({"article_id": 2, "label": "C"})),
        ]);
        let deduped = table.dedup_by_key(DuplicatePolicy::KeepFirst);
        assert_eq!(ids(&deduped), vec!["1", "2"]);
        assert_eq!(deduped.rows()[0]["label"], "A");
    }

    #[test]
    fn test_dedup_keep_last() {
        let table = Table::from_rows(vec![
            row(json!({"article_id": 1, "label": "A"})),
            row(json!({"article_id": 2, "label": "C"})),
            row(json!({"article_id": "1", "label": "B"})),
        ]);
        let deduped = table.dedup_by_key(DuplicatePolicy::KeepLast);
        assert_eq!(ids(&deduped), vec!["2", "1"]);
        assert_eq!(deduped.rows()[1]["label"], "B");
    }

    #[test]
    fn test_dedup_drops_rows_without_key() {
        let table = Table::from_rows(vec![
            row(json!({"article_id": null, "label": "A"})),
            row(json!({"label": "B"})),
            row(json!({"article_id": 3, "label": "C"})),
        ]);
        assert_eq!(ids(&table.dedup_by_key(DuplicatePolicy::KeepFirst)), vec!["3"]);
    }

    #[test]
    fn test_without_keys_is_set_difference_in_source_order() {
        let pool = Table::from_rows(vec![
            row(json!({"article_id": 1})),
            row(json!({"article_id": 2})),
            row(json!({"article_id": 3})),
        ]);
        let labeled: HashSet<String> = ["2".to_string()].into_iter().collect();
        assert_eq!(ids(&pool.without_keys(&labeled)), vec!["1", "3"]);
    }

    #[test]
    fn test_concat_unions_columns() {
        let a = Table::from_rows(vec![row(json!({"article_id": 1, "sentiment": "Neutral"}))]);
        let b = Table::from_rows(vec![row(json!({"article_id": 2, "comments": "ok"}))]);
        let combined = Table::concat(vec![a, b]);
        assert_eq!(combined.len(), 2);
        assert_eq!(combined.columns(), &["article_id", "sentiment", "comments"]);
    }

    #[test]
    fn test_duplicate_policy_from_str() {
        assert_eq!("first".parse::<DuplicatePolicy>(), Ok(DuplicatePolicy::KeepFirst));
        assert_eq!("Keep-Last".parse::<DuplicatePolicy>(), Ok(DuplicatePolicy::KeepLast));
        assert!("newest".parse::<DuplicatePolicy>().is_err());
    }
}
