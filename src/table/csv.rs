use serde_json::Value;

use super::Table;

/// Renders a table as comma-separated text with a header line.
///
/// Fields containing a delimiter, quote or line break are quoted with
/// embedded quotes doubled. Nulls become empty fields and nested values
/// are written as compact JSON.
pub fn to_csv(table: &Table) -> String {
    let mut out = String::new();
    push_line(&mut out, table.columns().iter().map(String::as_str));

    for row in table.rows() {
        let cells: Vec<String> = table
            .columns()
            .iter()
            .map(|column| cell_text(row.get(column)))
            .collect();
        push_line(&mut out, cells.iter().map(String::as_str));
    }
    out
}

fn push_line<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    for (i, field) in fields.enumerate() {
        if i > 0 {
            out.push(',');
        }
        if field.contains([',', '"', '\n', '\r']) {
            out.push('"');
            out.push_str(&field.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(field);
        }
    }
    out.push('\n');
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
