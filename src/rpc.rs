use rusqlite::types::Value;
use serde_json::Value as JsonValue;

use crate::config::RpcConfig;
use crate::db::DbHandle;
use crate::error::{AppError, AppResult};
use crate::shape::sql_value_to_json;

/// A named, parameterized statement exposed under `/rpc/{name}`; the
/// allow-list lives entirely in configuration, so no caller-supplied SQL
/// ever reaches the database.
pub fn dispatch(handle: &DbHandle, procedures: &[RpcConfig], name: &str, body: &JsonValue) -> AppResult<Vec<JsonValue>> {
    let procedure = procedures
        .iter()
        .find(|p| p.name == name)
        .ok_or_else(|| AppError::not_found(format!("unknown procedure: {name}")))?;

    let mut params = Vec::with_capacity(procedure.params.len());
    for param in &procedure.params {
        let raw = body.get(&param.name).ok_or_else(|| {
            AppError::validation(format!("missing parameter: {}", param.name))
        })?;
        params.push(coerce_param(&param.kind, raw)?);
    }

    let is_write = !procedure
        .sql
        .trim_start()
        .to_ascii_uppercase()
        .starts_with("SELECT");

    let rows = if is_write {
        let conn = handle.write()?;
        conn.execute(&procedure.sql, rusqlite::params_from_iter(params.iter()))?;
        Vec::new()
    } else {
        let conn = handle.read()?;
        let mut stmt = conn.prepare(&procedure.sql)?;
        let column_count = stmt.column_count();
        let column_names: Vec<String> = (0..column_count)
            .map(|idx| stmt.column_name(idx).map(|s| s.to_string()))
            .collect::<rusqlite::Result<Vec<String>>>()?;
        let mut rows_out = Vec::new();
        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        while let Some(row) = rows.next()? {
            let mut obj = serde_json::Map::new();
            for idx in 0..column_count {
                let name = column_names[idx].clone();
                let value: Value = row.get(idx)?;
                obj.insert(name, sql_value_to_json(&value));
            }
            rows_out.push(JsonValue::Object(obj));
        }
        rows_out
    };

    Ok(rows)
}

fn coerce_param(kind: &str, value: &JsonValue) -> AppResult<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    match kind {
        "integer" => value
            .as_i64()
            .map(Value::Integer)
            .ok_or_else(|| AppError::validation("expected integer parameter")),
        "real" => value
            .as_f64()
            .map(Value::Real)
            .ok_or_else(|| AppError::validation("expected numeric parameter")),
        "boolean" => value
            .as_bool()
            .map(|b| Value::Integer(b as i64))
            .ok_or_else(|| AppError::validation("expected boolean parameter")),
        _ => value
            .as_str()
            .map(|s| Value::Text(s.to_string()))
            .ok_or_else(|| AppError::validation("expected text parameter")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, DbMode, PoolConfig, RpcParamConfig};
    use crate::db::PoolManager;
    use std::path::PathBuf;

    fn handle() -> std::sync::Arc<DbHandle> {
        let config = DatabaseConfig {
            name: "rpctest".to_string(),
            path: PathBuf::from(":memory:"),
            mode: DbMode::InMemory,
        };
        let pool = PoolManager::new(&[config], PoolConfig::default()).unwrap();
        let handle = pool.get(None).unwrap();
        {
            let conn = handle.write().unwrap();
            conn.execute_batch(
                "CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO widgets (name) VALUES ('a'), ('b');",
            )
            .unwrap();
        }
        handle
    }

    #[test]
    fn dispatches_select_procedure() {
        let handle = handle();
        let procedures = vec![RpcConfig {
            name: "count_widgets".to_string(),
            method: "POST".to_string(),
            sql: "SELECT count(*) AS total FROM widgets".to_string(),
            params: vec![],
            return_kind: "object".to_string(),
        }];
        let result = dispatch(&handle, &procedures, "count_widgets", &serde_json::json!({})).unwrap();
        assert_eq!(result[0]["total"], 2);
    }

    #[test]
    fn rejects_unknown_procedure() {
        let handle = handle();
        assert!(dispatch(&handle, &[], "missing", &serde_json::json!({})).is_err());
    }

    #[test]
    fn binds_named_parameters() {
        let handle = handle();
        let procedures = vec![RpcConfig {
            name: "find_by_name".to_string(),
            method: "POST".to_string(),
            sql: "SELECT id FROM widgets WHERE name = ?1".to_string(),
            params: vec![RpcParamConfig {
                name: "name".to_string(),
                kind: "text".to_string(),
            }],
            return_kind: "array".to_string(),
        }];
        let result = dispatch(&handle, &procedures, "find_by_name", &serde_json::json!({"name": "a"})).unwrap();
        assert_eq!(result.len(), 1);
    }
}
