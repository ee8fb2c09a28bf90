use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde_json::{Map, Value as JsonValue};

use crate::emitter::{EmittedQuery, OutputColumn};
use crate::error::AppResult;

pub fn sql_value_to_json(value: &SqlValue) -> JsonValue {
    match value {
        SqlValue::Null => JsonValue::Null,
        SqlValue::Integer(i) => JsonValue::from(*i),
        SqlValue::Real(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        SqlValue::Text(s) => JsonValue::String(s.clone()),
        SqlValue::Blob(b) => JsonValue::String(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b,
        )),
    }
}

/// Reassemble one flat LEFT JOIN result row into the nested shape its
/// `select=` embeds described. A row whose embedded columns are all NULL
/// (no matching related row) collapses to a JSON `null` for that relation
/// rather than an object of nulls.
pub fn shape_row(columns: &[OutputColumn], row: &[JsonValue]) -> JsonValue {
    let mut root = Map::new();
    for (col, value) in columns.iter().zip(row.iter()) {
        insert_at_path(&mut root, &col.path, &col.name, value.clone());
    }
    collapse_empty_relations(JsonValue::Object(root))
}

fn insert_at_path(root: &mut Map<String, JsonValue>, path: &[String], name: &str, value: JsonValue) {
    match path.split_first() {
        None => {
            root.insert(name.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = root
                .entry(head.clone())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            if let JsonValue::Object(map) = entry {
                insert_at_path(map, rest, name, value);
            }
        }
    }
}

fn collapse_empty_relations(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut out = Map::new();
            for (key, val) in map {
                let collapsed = collapse_empty_relations(val);
                out.insert(key, collapsed);
            }
            if !out.is_empty() && out.values().all(|v| v.is_null()) {
                // This only collapses nested relation objects; the caller
                // applies this to the whole row so top-level all-null rows
                // (impossible for a real row) are harmless here too.
                JsonValue::Null
            } else {
                JsonValue::Object(out)
            }
        }
        other => other,
    }
}

/// Run a compiled select and shape every result row in one pass. A plan with
/// no array-shaped embeds takes the cheap per-row path; one with has-many
/// embeds groups the flat LEFT JOIN rows first so each parent appears once
/// with its children collected into an array.
pub fn query_shaped(conn: &Connection, emitted: &EmittedQuery) -> AppResult<Vec<JsonValue>> {
    let mut stmt = conn.prepare(&emitted.sql)?;
    let mut rows = stmt.query(rusqlite::params_from_iter(emitted.params.iter()))?;
    let mut raw_rows = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(emitted.columns.len());
        for i in 0..emitted.columns.len() {
            let v: SqlValue = row.get(i)?;
            values.push(sql_value_to_json(&v));
        }
        raw_rows.push(values);
    }

    if emitted.array_paths.is_empty() {
        return Ok(raw_rows
            .iter()
            .map(|row| shape_row(&emitted.columns, row))
            .collect());
    }

    Ok(shape_rows(&emitted.columns, &emitted.array_paths, &raw_rows))
}

/// Group a set of flat LEFT JOIN rows into nested JSON, merging rows that
/// share the same values outside an array-shaped embed path into one parent
/// object with that relation collected as an array.
pub fn shape_rows(
    columns: &[OutputColumn],
    array_paths: &[Vec<String>],
    rows: &[Vec<JsonValue>],
) -> Vec<JsonValue> {
    let array_set: std::collections::HashSet<&Vec<String>> = array_paths.iter().collect();
    group_level(columns, rows, &[], &array_set)
}

fn group_level(
    columns: &[OutputColumn],
    rows: &[Vec<JsonValue>],
    prefix: &[String],
    array_paths: &std::collections::HashSet<&Vec<String>>,
) -> Vec<JsonValue> {
    let own_indices: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.path == prefix)
        .map(|(i, _)| i)
        .collect();

    let mut child_names = Vec::new();
    for c in columns {
        if c.path.len() > prefix.len() && c.path[..prefix.len()] == *prefix {
            let name = &c.path[prefix.len()];
            if !child_names.contains(name) {
                child_names.push(name.clone());
            }
        }
    }

    let mut groups: Vec<(Vec<JsonValue>, Vec<usize>)> = Vec::new();
    for (idx, row) in rows.iter().enumerate() {
        let key: Vec<JsonValue> = own_indices.iter().map(|&i| row[i].clone()).collect();
        match groups.iter_mut().find(|(k, _)| k == &key) {
            Some(group) => group.1.push(idx),
            None => groups.push((key, vec![idx])),
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (key, idxs) in groups {
        let mut obj = Map::new();
        for (slot, &oi) in own_indices.iter().enumerate() {
            obj.insert(columns[oi].name.clone(), key[slot].clone());
        }

        for child in &child_names {
            let mut child_prefix = prefix.to_vec();
            child_prefix.push(child.clone());
            let sub_rows: Vec<Vec<JsonValue>> = idxs.iter().map(|&i| rows[i].clone()).collect();
            let children = group_level(columns, &sub_rows, &child_prefix, array_paths);

            if array_paths.contains(&child_prefix) {
                let filtered: Vec<JsonValue> = children
                    .into_iter()
                    .filter(|v| !is_all_null(v))
                    .collect();
                obj.insert(child.clone(), JsonValue::Array(filtered));
            } else {
                let value = children.into_iter().next().unwrap_or(JsonValue::Null);
                obj.insert(child.clone(), collapse_empty_relations(value));
            }
        }

        out.push(JsonValue::Object(obj));
    }
    out
}

fn is_all_null(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::Object(map) => !map.is_empty() && map.values().all(is_all_null),
        _ => false,
    }
}

/// Run a mutation statement ending in `RETURNING *` and collect the affected
/// rows as flat JSON objects keyed by column name.
pub fn query_returning(conn: &Connection, sql: &str, params: &[SqlValue]) -> AppResult<Vec<JsonValue>> {
    let mut stmt = conn.prepare(sql)?;
    let column_names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut map = Map::new();
        for (idx, name) in column_names.iter().enumerate() {
            let v: SqlValue = row.get(idx)?;
            map.insert(name.clone(), sql_value_to_json(&v));
        }
        out.push(JsonValue::Object(map));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(alias: &str, name: &str, path: &[&str]) -> OutputColumn {
        OutputColumn {
            alias: alias.to_string(),
            name: name.to_string(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn flat_row_has_no_nesting() {
        let columns = vec![col("c0", "id", &[]), col("c1", "name", &[])];
        let row = vec![JsonValue::from(1), JsonValue::String("widget".to_string())];
        let shaped = shape_row(&columns, &row);
        assert_eq!(shaped["id"], JsonValue::from(1));
        assert_eq!(shaped["name"], "widget");
    }

    #[test]
    fn embedded_relation_nests_under_its_key() {
        let columns = vec![
            col("c0", "id", &[]),
            col("c1", "name", &["authors"]),
        ];
        let row = vec![JsonValue::from(1), JsonValue::String("Jane".to_string())];
        let shaped = shape_row(&columns, &row);
        assert_eq!(shaped["authors"]["name"], "Jane");
    }

    #[test]
    fn unmatched_left_join_collapses_to_null() {
        let columns = vec![col("c0", "id", &[]), col("c1", "name", &["authors"])];
        let row = vec![JsonValue::from(1), JsonValue::Null];
        let shaped = shape_row(&columns, &row);
        assert!(shaped["authors"].is_null());
    }

    #[test]
    fn has_many_embed_groups_rows_into_array() {
        let columns = vec![
            col("c0", "id", &[]),
            col("c1", "name", &[]),
            col("c2", "title", &["books"]),
        ];
        let rows = vec![
            vec![
                JsonValue::from(1),
                JsonValue::String("Jane".to_string()),
                JsonValue::String("Book A".to_string()),
            ],
            vec![
                JsonValue::from(1),
                JsonValue::String("Jane".to_string()),
                JsonValue::String("Book B".to_string()),
            ],
        ];
        let array_paths = vec![vec!["books".to_string()]];
        let shaped = shape_rows(&columns, &array_paths, &rows);
        assert_eq!(shaped.len(), 1);
        let books = shaped[0]["books"].as_array().unwrap();
        assert_eq!(books.len(), 2);
        assert_eq!(books[0]["title"], "Book A");
        assert_eq!(books[1]["title"], "Book B");
    }

    #[test]
    fn has_many_embed_with_no_children_is_empty_array() {
        let columns = vec![col("c0", "id", &[]), col("c1", "title", &["books"])];
        let rows = vec![vec![JsonValue::from(1), JsonValue::Null]];
        let array_paths = vec![vec!["books".to_string()]];
        let shaped = shape_rows(&columns, &array_paths, &rows);
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0]["books"], JsonValue::Array(vec![]));
    }
}
