//! Decoding for bulk imports and encoding for exports.
//!
//! Two import forms are accepted: delimited text (first record is the
//! header and defines the column keys) and structured JSON (a `{"rows":
//! [...]}` wrapper or a bare list of objects). Export flattens rows to a
//! column order with missing keys rendered as empty cells.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TabularError {
    #[error("input is empty")]
    Empty,
    #[error("unterminated quoted field")]
    UnterminatedQuote,
    #[error("row {0} is not an object")]
    RowNotObject(usize),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decoded import payload: the observed column keys and the rows to create.
#[derive(Debug, Default)]
pub struct ImportData {
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
}

/// Decode structured JSON input: `{"rows": [...]}` or a bare list.
///
/// Rows are taken as-is; the column set is the sorted union of the row
/// keys. Input that carries no row list decodes to nothing rather than
/// failing, but a row that is not an object is an error.
pub fn decode_json(bytes: &[u8]) -> Result<ImportData, TabularError> {
    let value: Value = serde_json::from_slice(bytes)?;

    let items = match value {
        Value::Object(mut obj) => match obj.remove("rows") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        Value::Array(items) => items,
        _ => Vec::new(),
    };

    let mut rows = Vec::with_capacity(items.len());
    for (i, item) in items.into_iter().enumerate() {
        match item {
            Value::Object(map) => rows.push(map),
            _ => return Err(TabularError::RowNotObject(i)),
        }
    }

    let mut keys = BTreeSet::new();
    for row in &rows {
        keys.extend(row.keys().cloned());
    }

    Ok(ImportData {
        columns: keys.into_iter().collect(),
        rows,
    })
}

/// Decode delimited text: the first record is the header, each subsequent
/// record becomes one row keyed by the header. Records shorter than the
/// header are padded with empty strings; extra fields are dropped.
pub fn decode_delimited(text: &str) -> Result<ImportData, TabularError> {
    let mut records = parse_records(text)?;
    if records.is_empty() {
        return Err(TabularError::Empty);
    }

    let columns = records.remove(0);
    let rows = records
        .into_iter()
        .map(|record| {
            columns
                .iter()
                .enumerate()
                .map(|(i, key)| {
                    let value = record.get(i).cloned().unwrap_or_default();
                    (key.clone(), Value::String(value))
                })
                .collect()
        })
        .collect();

    Ok(ImportData { columns, rows })
}

/// Encode rows as CSV in the given column order. Missing keys render as
/// empty cells; the header is always written.
pub fn write_csv<'a>(
    columns: &[String],
    rows: impl IntoIterator<Item = &'a Map<String, Value>>,
) -> String {
    let mut out = String::new();
    write_record(&mut out, columns.iter().map(String::as_str));

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|key| row.get(key).map(cell_text).unwrap_or_default())
            .collect();
        write_record(&mut out, cells.iter().map(String::as_str));
    }

    out
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Schema-less payloads are scalar by convention, but render nested
        // values as JSON rather than losing them
        other => other.to_string(),
    }
}

fn write_record<'a>(out: &mut String, fields: impl Iterator<Item = &'a str>) {
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        }
        first = false;

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

/// Split delimited text into records of fields, honoring quoted fields
/// (embedded delimiters, quotes doubled, embedded newlines). Blank records
/// are skipped.
fn parse_records(text: &str) -> Result<Vec<Vec<String>>, TabularError> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut field_started = false;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() && !field_started => {
                in_quotes = true;
                field_started = true;
            }
            ',' => {
                record.push(std::mem::take(&mut field));
                field_started = false;
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                end_record(&mut records, &mut record, &mut field, &mut field_started);
            }
            '\n' => {
                end_record(&mut records, &mut record, &mut field, &mut field_started);
            }
            _ => {
                field.push(c);
                field_started = true;
            }
        }
    }

    if in_quotes {
        return Err(TabularError::UnterminatedQuote);
    }
    end_record(&mut records, &mut record, &mut field, &mut field_started);

    Ok(records)
}

fn end_record(
    records: &mut Vec<Vec<String>>,
    record: &mut Vec<String>,
    field: &mut String,
    field_started: &mut bool,
) {
    if record.is_empty() && field.is_empty() && !*field_started {
        // Blank line
        return;
    }
    record.push(std::mem::take(field));
    records.push(std::mem::take(record));
    *field_started = false;
}
