use std::path::PathBuf;
use std::sync::RwLock;
use std::time::SystemTime;

use actix_web::{web, HttpRequest, HttpResponse};

use crate::auth::AuthVerifier;
use crate::config::{AppConfig, DatabaseConfig, DbMode};
use crate::db::PoolManager;
use crate::error::{AppError, AppResult};
use crate::middleware::principal_from_request;
use crate::models::{
    AttachDatabaseRequest, AuthDescriptionResponse, ColumnDescription, DatabaseListResponse,
    HealthResponse, PolicyReloadResponse, SchemaCacheStatsResponse, SchemaDescriptionResponse,
    TableDescription,
};
use crate::policy::PolicyEngine;

pub struct AppState {
    pub pool: PoolManager,
    pub auth: AuthVerifier,
    pub policy: PolicyEngine,
    pub config: RwLock<AppConfig>,
    pub start_time: SystemTime,
}

fn require_admin(req: &HttpRequest) -> AppResult<()> {
    let principal = principal_from_request(req);
    if principal.role == "admin" {
        Ok(())
    } else {
        Err(AppError::permission("admin role required"))
    }
}

pub async fn health_check(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let uptime = state
        .start_time
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let response = HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: uptime,
        databases: state.pool.names()?,
    };

    Ok(HttpResponse::Ok().json(response))
}

/// `POST /_debug/databases` — admin-only attach of an additional database at
/// runtime, resolving the transport `spec.md` §4.2 leaves unspecified.
pub async fn attach_database(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<AttachDatabaseRequest>,
) -> AppResult<HttpResponse> {
    require_admin(&req)?;
    let body = body.into_inner();

    let mode = match body.mode.as_deref() {
        Some("read-only") => DbMode::ReadOnly,
        Some("in-memory") => DbMode::InMemory,
        _ => DbMode::ReadWrite,
    };

    state.pool.attach(DatabaseConfig {
        name: body.name.clone(),
        path: PathBuf::from(body.path),
        mode,
    })?;

    Ok(HttpResponse::Created().json(serde_json::json!({ "attached": body.name })))
}

/// `DELETE /_debug/databases/{name}` — admin-only detach.
pub async fn detach_database(
    req: HttpRequest,
    state: web::Data<AppState>,
    name: web::Path<String>,
) -> AppResult<HttpResponse> {
    require_admin(&req)?;
    state.pool.detach(&name)?;
    Ok(HttpResponse::NoContent().finish())
}

/// `POST /_debug/policies/reload` — admin-only policy reload; `spec.md` §4.7
/// names the trigger without a transport, this is that transport.
pub async fn reload_policies(req: HttpRequest, state: web::Data<AppState>) -> AppResult<HttpResponse> {
    require_admin(&req)?;
    let config = state
        .config
        .read()
        .map_err(|_| AppError::Database("config lock poisoned".to_string()))?;

    let count = match &config.policies.file {
        Some(path) => state.policy.load_from_file(path)?,
        None => 0,
    };

    Ok(HttpResponse::Ok().json(PolicyReloadResponse { policy_count: count }))
}

/// `GET /_debug/databases` — admin-only listing of every attached database.
pub async fn list_databases(req: HttpRequest, state: web::Data<AppState>) -> AppResult<HttpResponse> {
    require_admin(&req)?;
    Ok(HttpResponse::Ok().json(DatabaseListResponse {
        databases: state.pool.names()?,
    }))
}

/// `GET /_debug/schema` — admin-only dump of every table's columns in a
/// database, selected with `?db=name` (defaults to the implicit database).
pub async fn describe_schema(req: HttpRequest, state: web::Data<AppState>) -> AppResult<HttpResponse> {
    require_admin(&req)?;
    let db = url::form_urlencoded::parse(req.query_string().as_bytes())
        .find(|(key, _)| key == "db")
        .map(|(_, value)| value.into_owned());

    let handle = state.pool.get(db.as_deref())?;
    let conn = handle.read()?;
    let mut tables = Vec::new();
    for name in crate::db::schema::list_tables(&conn)? {
        let schema = handle.schema.get(&conn, &name)?;
        tables.push(TableDescription {
            name: schema.name.clone(),
            columns: schema
                .columns
                .iter()
                .map(|c| ColumnDescription {
                    name: c.name.clone(),
                    declared_type: c.declared_type.clone(),
                    not_null: c.not_null,
                    primary_key: c.primary_key,
                })
                .collect(),
        });
    }

    Ok(HttpResponse::Ok().json(SchemaDescriptionResponse {
        database: handle.name.clone(),
        tables,
    }))
}

/// `GET /_debug/auth` — echoes back how the caller's own request was
/// authenticated, without requiring the admin role (a caller inspecting
/// their own principal isn't a privileged operation).
pub async fn describe_auth(req: HttpRequest) -> AppResult<HttpResponse> {
    let principal = principal_from_request(&req);
    Ok(HttpResponse::Ok().json(AuthDescriptionResponse {
        authenticated: principal.authenticated,
        role: principal.role,
        user_id: principal.user_id,
        tenant_id: principal.tenant_id,
    }))
}

pub async fn schema_cache_stats(
    req: HttpRequest,
    state: web::Data<AppState>,
    db_name: web::Path<String>,
) -> AppResult<HttpResponse> {
    require_admin(&req)?;
    let handle = state.pool.get(Some(&db_name))?;
    let stats = handle.schema.stats()?;
    Ok(HttpResponse::Ok().json(SchemaCacheStatsResponse {
        database: handle.name.clone(),
        cached_tables: stats.count,
    }))
}
