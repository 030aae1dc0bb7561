use arrow_array::{ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field, Schema};
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use parquet::file::reader::{FileReader, SerializedFileReader};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use super::{Row, Table};

static NULL: Value = Value::Null;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected table layout: {0}")]
    Shape(String),
}

/// Arrow type chosen for a column from the JSON values it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Boolean,
    Int64,
    Float64,
    Utf8,
}

impl ColumnKind {
    fn of<'a>(values: impl Iterator<Item = &'a Value>) -> ColumnKind {
        let mut kind = None;
        for value in values {
            let next = match value {
                Value::Null => continue,
                Value::Bool(_) => ColumnKind::Boolean,
                Value::Number(n) if n.is_i64() => ColumnKind::Int64,
                Value::Number(_) => ColumnKind::Float64,
                _ => return ColumnKind::Utf8,
            };
            kind = Some(match (kind, next) {
                (None, next) => next,
                (Some(current), next) if current == next => current,
                (Some(ColumnKind::Int64), ColumnKind::Float64)
                | (Some(ColumnKind::Float64), ColumnKind::Int64) => ColumnKind::Float64,
                _ => return ColumnKind::Utf8,
            });
        }
        // All-null columns are stored as nullable strings.
        kind.unwrap_or(ColumnKind::Utf8)
    }

    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Boolean => DataType::Boolean,
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Utf8 => DataType::Utf8,
        }
    }

    fn build<'a>(self, values: impl Iterator<Item = &'a Value>) -> ArrayRef {
        match self {
            ColumnKind::Boolean => {
                Arc::new(BooleanArray::from(values.map(Value::as_bool).collect::<Vec<_>>()))
            }
            ColumnKind::Int64 => {
                Arc::new(Int64Array::from(values.map(Value::as_i64).collect::<Vec<_>>()))
            }
            ColumnKind::Float64 => {
                Arc::new(Float64Array::from(values.map(Value::as_f64).collect::<Vec<_>>()))
            }
            ColumnKind::Utf8 => Arc::new(StringArray::from(
                values
                    .map(|value| match value {
                        Value::Null => None,
                        Value::String(s) => Some(s.clone()),
                        other => Some(other.to_string()),
                    })
                    .collect::<Vec<Option<String>>>(),
            )),
        }
    }
}

/// Encodes a table as a gzip-compressed Parquet file, the format of every
/// object in the stores.
///
/// Column types are inferred from the values: booleans, integers and floats
/// keep their type (integers mixed with floats widen to floats), anything
/// else is stored as a nullable string.
pub fn encode_parquet(table: &Table) -> Result<Vec<u8>, CodecError> {
    if table.columns().is_empty() {
        return Err(CodecError::Shape(
            "a table without columns cannot be stored".to_string(),
        ));
    }

    let mut fields = Vec::with_capacity(table.columns().len());
    let mut arrays = Vec::with_capacity(table.columns().len());
    for column in table.columns() {
        let cells = || {
            table
                .rows()
                .iter()
                .map(move |row| row.get(column).unwrap_or(&NULL))
        };
        let kind = ColumnKind::of(cells());
        fields.push(Field::new(column.as_str(), kind.data_type(), true));
        arrays.push(kind.build(cells()));
    }

    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;
    let properties = WriterProperties::builder()
        .set_compression(Compression::GZIP(GzipLevel::default()))
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(properties))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

/// Decodes a stored Parquet object, whatever compression it was written
/// with. Column order follows the file schema.
pub fn decode_parquet(bytes: Bytes) -> Result<Table, CodecError> {
    let reader = SerializedFileReader::new(bytes)?;
    let columns: Vec<String> = reader
        .metadata()
        .file_metadata()
        .schema_descr()
        .root_schema()
        .get_fields()
        .iter()
        .map(|field| field.name().to_string())
        .collect();

    let mut table = Table::with_columns(columns);
    for row in reader.get_row_iter(None)? {
        match row?.to_json_value() {
            Value::Object(row) => table.push_row(row),
            other => {
                return Err(CodecError::Shape(format!(
                    "parquet row decoded to {} instead of an object",
                    other
                )))
            }
        }
    }
    Ok(table)
}

/// Row-oriented transport encoding: a JSON array of row objects.
pub fn encode_rows(table: &Table) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(table.rows())?)
}

/// Parses a transported JSON table, either as an array of row objects or as
/// a dataframe-style column map (`{"col": {"0": v, "1": v}, ...}`).
///
/// An empty payload is an empty table.
pub fn decode_json_table(bytes: &[u8]) -> Result<Table, CodecError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Table::new());
    }

    match serde_json::from_slice::<Value>(bytes)? {
        Value::Array(items) => {
            let mut rows = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Object(row) => rows.push(row),
                    other => {
                        return Err(CodecError::Shape(format!(
                            "expected row objects, found {}",
                            other
                        )))
                    }
                }
            }
            Ok(Table::from_rows(rows))
        }
        Value::Object(map) => from_column_map(map),
        Value::Null => Ok(Table::new()),
        other => Err(CodecError::Shape(format!(
            "expected an array or object, found {}",
            other
        ))),
    }
}

/// Rebuilds rows from `{column: {index: value}}`, ordering rows by index.
fn from_column_map(map: Map<String, Value>) -> Result<Table, CodecError> {
    let mut indices: Vec<String> = Vec::new();
    let mut columns: Vec<(String, Map<String, Value>)> = Vec::with_capacity(map.len());

    for (column, cells) in map {
        let Value::Object(cells) = cells else {
            return Err(CodecError::Shape(format!(
                "column '{}' is not an index map",
                column
            )));
        };
        for index in cells.keys() {
            if !indices.contains(index) {
                indices.push(index.clone());
            }
        }
        columns.push((column, cells));
    }

    indices.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    });

    let mut table = Table::with_columns(columns.iter().map(|(column, _)| column.clone()));
    for index in &indices {
        let row: Row = columns
            .iter()
            .map(|(column, cells)| {
                (
                    column.clone(),
                    cells.get(index).cloned().unwrap_or(Value::Null),
                )
            })
            .collect();
        table.push_row(row);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::row_key;
    use serde_json::json;

    fn table(rows: Value) -> Table {
        let Value::Array(rows) = rows else {
            panic!("expected array");
        };
        Table::from_rows(rows.into_iter().map(|v| match v {
            Value::Object(row) => row,
            _ => unreachable!(),
        }))
    }

    fn sample() -> Table {
        table(json!([
            {"article_id": 1, "link": "https://a.example", "country": "peru", "score": 0.5},
            {"article_id": 2, "link": null, "country": "chile", "score": 2},
        ]))
    }

    #[test]
    fn test_parquet_file_is_gzip_compressed() {
        let bytes = encode_parquet(&sample()).unwrap();
        assert!(bytes.starts_with(b"PAR1"));
        assert!(bytes.ends_with(b"PAR1"));

        let reader = SerializedFileReader::new(Bytes::from(bytes)).unwrap();
        let column = reader.metadata().row_group(0).column(0);
        assert!(matches!(column.compression(), Compression::GZIP(_)));
    }

    #[test]
    fn test_parquet_keeps_column_order_types_and_nulls() {
        let decoded = decode_parquet(Bytes::from(encode_parquet(&sample()).unwrap())).unwrap();
        assert_eq!(decoded.columns(), ["article_id", "link", "country", "score"]);
        assert_eq!(decoded.rows()[0]["article_id"], json!(1));
        assert_eq!(decoded.rows()[1]["link"], Value::Null);
        // Integers mixed with floats widen to floats.
        assert_eq!(decoded.rows()[1]["score"], json!(2.0));
    }

    #[test]
    fn test_parquet_mixed_columns_fall_back_to_strings() {
        let mixed = table(json!([
            {"article_id": "a-1", "extra": 5},
            {"article_id": 7, "extra": {"nested": true}},
        ]));
        let decoded = decode_parquet(Bytes::from(encode_parquet(&mixed).unwrap())).unwrap();
        let ids: Vec<String> = decoded.rows().iter().filter_map(row_key).collect();
        assert_eq!(ids, vec!["a-1", "7"]);
        assert_eq!(decoded.rows()[1]["extra"], json!("{\"nested\":true}"));
    }

    #[test]
    fn test_parquet_empty_table_keeps_schema() {
        let empty = Table::with_columns(["article_id", "link"]);
        let decoded = decode_parquet(Bytes::from(encode_parquet(&empty).unwrap())).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.columns(), ["article_id", "link"]);
    }

    #[test]
    fn test_table_without_columns_is_rejected() {
        assert!(matches!(
            encode_parquet(&Table::new()),
            Err(CodecError::Shape(_))
        ));
    }

    #[test]
    fn test_non_parquet_bytes_are_rejected() {
        assert!(matches!(
            decode_parquet(Bytes::from_static(br#"[{"article_id": 1}]"#)),
            Err(CodecError::Parquet(_))
        ));
    }

    #[test]
    fn test_decode_dataframe_column_map_orders_by_index() {
        let body = br#"{"article_id": {"10": 30, "2": 20, "0": 10}, "title": {"0": "a", "2": "b", "10": "c"}}"#;
        let table = decode_json_table(body).unwrap();
        let ids: Vec<String> = table.rows().iter().filter_map(row_key).collect();
        assert_eq!(ids, vec!["10", "20", "30"]);
        assert_eq!(table.rows()[2]["title"], "c");
    }

    #[test]
    fn test_rows_transport_is_array_of_objects() {
        let transported = table(json!([
            {"article_id": 1, "link": "https://a.example"},
            {"article_id": 2, "link": null},
        ]));
        let bytes = encode_rows(&transported).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value[0]["link"], "https://a.example");
        assert_eq!(decode_json_table(&bytes).unwrap(), transported);
    }

    #[test]
    fn test_empty_payload_is_empty_table() {
        assert!(decode_json_table(b"").unwrap().is_empty());
        assert!(decode_json_table(b"  \n").unwrap().is_empty());
        assert!(decode_json_table(b"[]").unwrap().is_empty());
    }

    #[test]
    fn test_scalar_payload_is_rejected() {
        assert!(decode_json_table(b"42").is_err());
        assert!(decode_json_table(b"[1, 2]").is_err());
        assert!(decode_json_table(b"{not json").is_err());
    }
}
