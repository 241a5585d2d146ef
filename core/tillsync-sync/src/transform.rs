//! Conversion between the local and remote row shapes.
//!
//! Local records use camelCase field names and parsed timestamps; the remote
//! store uses snake_case columns and text timestamps. Key conversion is deep:
//! nested objects and arrays of objects are converted as well. Per-table
//! renames and denylists come from the table's [`TableSpec`].

use crate::error::SyncResult;
use serde_json::{Map, Value};
use tillsync_model::{Record, TableSpec};

/// One row in remote (snake_case) form.
pub type RemoteRow = Map<String, Value>;

/// Converts a record to the row the remote store expects.
///
/// Denylisted fields are dropped; every other field passes through, renamed
/// or case-converted.
pub fn to_remote(spec: &TableSpec, record: &Record) -> RemoteRow {
    record
        .to_map()
        .into_iter()
        .filter(|(field, _)| !spec.is_denied(field))
        .map(|(field, value)| {
            let column = spec
                .remote_rename(&field)
                .map(str::to_string)
                .unwrap_or_else(|| camel_to_snake(&field));
            (column, convert_keys(value, camel_to_snake))
        })
        .collect()
}

/// Converts a remote row back into a local record. Date columns declared by
/// the table are parsed.
///
/// Fails only when the row has no usable id.
pub fn to_local(spec: &TableSpec, row: RemoteRow) -> SyncResult<Record> {
    let mut local = Map::with_capacity(row.len());
    for (column, value) in row {
        let field = spec
            .local_rename(&column)
            .map(str::to_string)
            .unwrap_or_else(|| snake_to_camel(&column));
        if spec.is_denied(&field) {
            continue;
        }
        local.insert(field, convert_keys(value, snake_to_camel));
    }
    Ok(Record::from_json(spec, Value::Object(local))?)
}

/// `categoryId` -> `category_id`. Runs of capitals are kept together
/// (`imageURL` -> `image_url`).
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut boundary = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if boundary {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            boundary = false;
        } else {
            out.push(ch);
            boundary = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// `category_id` -> `categoryId`. A leading underscore is preserved.
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '_' {
            if out.is_empty() {
                out.push('_');
            } else {
                upper_next = true;
            }
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn convert_keys(value: Value, convert: fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, inner)| (convert(&key), convert_keys(inner, convert)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|inner| convert_keys(inner, convert))
                .collect(),
        ),
        other => other,
    }
}
