use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub databases: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttachDatabaseRequest {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PolicyReloadResponse {
    pub policy_count: usize,
}

#[derive(Debug, Serialize)]
pub struct SchemaCacheStatsResponse {
    pub database: String,
    pub cached_tables: usize,
}

#[derive(Debug, Serialize)]
pub struct DatabaseListResponse {
    pub databases: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ColumnDescription {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[derive(Debug, Serialize)]
pub struct TableDescription {
    pub name: String,
    pub columns: Vec<ColumnDescription>,
}

#[derive(Debug, Serialize)]
pub struct SchemaDescriptionResponse {
    pub database: String,
    pub tables: Vec<TableDescription>,
}

#[derive(Debug, Serialize)]
pub struct AuthDescriptionResponse {
    pub authenticated: bool,
    pub role: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}
