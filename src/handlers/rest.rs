use actix_web::{web, HttpRequest, HttpResponse};
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value as JsonValue};

use crate::db::schema::{validate_identifier, TableSchema};
use crate::emitter::{emit_count, emit_delete, emit_insert, emit_select, emit_update};
use crate::error::{AppError, AppResult};
use crate::filter::parse_request;
use crate::handlers::AppState;
use crate::middleware::principal_from_request;
use crate::negotiate::{negotiate, render_explain, render_rows, MediaType};
use crate::plan::build_plan;
use crate::policy::PolicyAction;
use crate::shape::{query_returning, query_shaped};

pub async fn select_default(
    req: HttpRequest,
    state: web::Data<AppState>,
    table: web::Path<String>,
) -> AppResult<HttpResponse> {
    select(req, state, None, table.into_inner()).await
}

pub async fn select_named(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (db, table) = path.into_inner();
    select(req, state, Some(db), table).await
}

async fn select(
    req: HttpRequest,
    state: web::Data<AppState>,
    db: Option<String>,
    table: String,
) -> AppResult<HttpResponse> {
    let principal = principal_from_request(&req);
    let handle = state.pool.get(db.as_deref())?;

    let mut query = parse_request(req.query_string())?;
    state
        .policy
        .apply_read(&table, PolicyAction::Select, &principal, &mut query.filters)?;

    let plan = build_plan(&handle, &table, query)?;
    let emitted = emit_select(&plan)?;

    let media = negotiate(&req);
    if media == MediaType::ExplainPlan {
        return Ok(render_explain(&emitted.sql, &emitted.params));
    }

    let conn = handle.read()?;
    let rows = query_shaped(&conn, &emitted)?;
    let row_count = rows.len() as i64;
    let mut response = render_rows(media, rows)?;

    if let Some(limit) = plan.limit {
        let count_query = emit_count(&plan)?;
        let total: i64 = conn.query_row(
            &count_query.sql,
            rusqlite::params_from_iter(count_query.params.iter()),
            |row| row.get(0),
        )?;
        let offset = plan.offset.unwrap_or(0);
        let range = if limit == 0 {
            format!("*/{total}")
        } else {
            let end = offset + row_count - 1;
            format!("{offset}-{}/{total}", end.max(offset.saturating_sub(1)))
        };
        response.headers_mut().insert(
            actix_web::http::header::HeaderName::from_static("content-range"),
            actix_web::http::header::HeaderValue::from_str(&range)
                .map_err(|e| AppError::Database(format!("invalid content-range header: {e}")))?,
        );
    }

    Ok(response)
}

pub async fn insert_default(
    req: HttpRequest,
    state: web::Data<AppState>,
    table: web::Path<String>,
    body: web::Json<JsonValue>,
) -> AppResult<HttpResponse> {
    insert(req, state, None, table.into_inner(), body.into_inner()).await
}

pub async fn insert_named(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<JsonValue>,
) -> AppResult<HttpResponse> {
    let (db, table) = path.into_inner();
    insert(req, state, Some(db), table, body.into_inner()).await
}

async fn insert(
    req: HttpRequest,
    state: web::Data<AppState>,
    db: Option<String>,
    table: String,
    body: JsonValue,
) -> AppResult<HttpResponse> {
    validate_identifier(&table)?;
    let principal = principal_from_request(&req);
    let handle = state.pool.get(db.as_deref())?;

    let incoming_rows = match body {
        JsonValue::Array(items) => items,
        obj @ JsonValue::Object(_) => vec![obj],
        _ => return Err(AppError::validation("request body must be an object or array of objects")),
    };

    let schema = {
        let conn = handle.read()?;
        handle.schema.get(&conn, &table)?
    };

    let mut inserted = Vec::with_capacity(incoming_rows.len());
    let conn = handle.write()?;
    for item in incoming_rows {
        let row = match item {
            JsonValue::Object(map) => map,
            _ => return Err(AppError::validation("each row must be a JSON object")),
        };

        state.policy.check_insert_row(&table, &principal, &row)?;
        let (columns, values) = row_to_columns(&schema, &row)?;
        let mutation = emit_insert(&table, &columns, &values)?;
        let sql = format!("{} RETURNING *", mutation.sql);
        inserted.extend(query_returning(&conn, &sql, &mutation.params)?);
    }

    let mut response = HttpResponse::Created();
    if let (Some(pk), Some(JsonValue::Object(last))) =
        (schema.columns.iter().find(|c| c.primary_key), inserted.last())
    {
        if let Some(value) = last.get(&pk.name) {
            let location = format!("/{table}?{}=eq.{}", pk.name, json_location_value(value));
            response.insert_header((actix_web::http::header::LOCATION, location));
        }
    }

    Ok(response.json(inserted))
}

fn json_location_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub async fn update_default(
    req: HttpRequest,
    state: web::Data<AppState>,
    table: web::Path<String>,
    body: web::Json<JsonValue>,
) -> AppResult<HttpResponse> {
    update(req, state, None, table.into_inner(), body.into_inner()).await
}

pub async fn update_named(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<JsonValue>,
) -> AppResult<HttpResponse> {
    let (db, table) = path.into_inner();
    update(req, state, Some(db), table, body.into_inner()).await
}

async fn update(
    req: HttpRequest,
    state: web::Data<AppState>,
    db: Option<String>,
    table: String,
    body: JsonValue,
) -> AppResult<HttpResponse> {
    validate_identifier(&table)?;
    let principal = principal_from_request(&req);
    let handle = state.pool.get(db.as_deref())?;

    let row = match body {
        JsonValue::Object(map) => map,
        _ => return Err(AppError::validation("update body must be a JSON object")),
    };

    let schema = {
        let conn = handle.read()?;
        handle.schema.get(&conn, &table)?
    };

    let mut query = parse_request(req.query_string())?;
    for filter in &query.filters {
        validate_filter_against_schema(&schema, filter)?;
    }

    if let Some((sql, params)) = state
        .policy
        .check_write(&table, PolicyAction::Update, &principal)?
    {
        query.filters.push(crate::filter::FilterNode::Raw(sql, params));
    }

    let (columns, values) = row_to_columns(&schema, &row)?;
    let mutation = emit_update(&table, &columns, &values, &query.filters)?;
    let sql = format!("{} RETURNING *", mutation.sql);

    let conn = handle.write()?;
    let rows = query_returning(&conn, &sql, &mutation.params)?;
    render_rows(negotiate(&req), rows)
}

pub async fn delete_default(
    req: HttpRequest,
    state: web::Data<AppState>,
    table: web::Path<String>,
) -> AppResult<HttpResponse> {
    delete(req, state, None, table.into_inner()).await
}

pub async fn delete_named(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (db, table) = path.into_inner();
    delete(req, state, Some(db), table).await
}

async fn delete(
    req: HttpRequest,
    state: web::Data<AppState>,
    db: Option<String>,
    table: String,
) -> AppResult<HttpResponse> {
    validate_identifier(&table)?;
    let principal = principal_from_request(&req);
    let handle = state.pool.get(db.as_deref())?;

    let schema = {
        let conn = handle.read()?;
        handle.schema.get(&conn, &table)?
    };

    let mut query = parse_request(req.query_string())?;
    for filter in &query.filters {
        validate_filter_against_schema(&schema, filter)?;
    }

    if let Some((sql, params)) = state
        .policy
        .check_write(&table, PolicyAction::Delete, &principal)?
    {
        query.filters.push(crate::filter::FilterNode::Raw(sql, params));
    }

    let mutation = emit_delete(&table, &query.filters)?;
    let sql = format!("{} RETURNING *", mutation.sql);

    let conn = handle.write()?;
    let rows = query_returning(&conn, &sql, &mutation.params)?;
    render_rows(negotiate(&req), rows)
}

fn validate_filter_against_schema(schema: &TableSchema, node: &crate::filter::FilterNode) -> AppResult<()> {
    match node {
        crate::filter::FilterNode::Atom { column, .. } => {
            if !schema.has_column(column) {
                return Err(AppError::validation(format!("unknown column: {column}")));
            }
            Ok(())
        }
        crate::filter::FilterNode::And(nodes) | crate::filter::FilterNode::Or(nodes) => {
            for n in nodes {
                validate_filter_against_schema(schema, n)?;
            }
            Ok(())
        }
        crate::filter::FilterNode::Raw(..) => Ok(()),
    }
}

fn row_to_columns(
    schema: &TableSchema,
    row: &Map<String, JsonValue>,
) -> AppResult<(Vec<String>, Vec<SqlValue>)> {
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());
    for (key, value) in row {
        validate_identifier(key)?;
        if !schema.has_column(key) {
            return Err(AppError::validation(format!("unknown column: {key}")));
        }
        columns.push(key.clone());
        values.push(json_to_sql_value(value));
    }
    Ok((columns, values))
}

fn json_to_sql_value(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(*b as i64),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
