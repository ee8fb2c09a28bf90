use config::{Config, File};
use serde::Deserialize;
use std::path::PathBuf;

use crate::error::AppResult;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub policies: PoliciesConfig,
    #[serde(default)]
    pub udf: Vec<UdfConfig>,
    #[serde(default)]
    pub rpc: Vec<RpcConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DbMode {
    ReadWrite,
    ReadOnly,
    InMemory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_mode")]
    pub mode: DbMode,
}

fn default_mode() -> DbMode {
    DbMode::ReadWrite
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_readers_per_db")]
    pub readers_per_db: u32,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_readers_per_db() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            readers_per_db: default_readers_per_db(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt: JwtConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JwtConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_algorithm_allow_list")]
    pub algorithm_allow_list: Vec<String>,
    pub secret: Option<String>,
    pub jwks_url: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    #[serde(default = "default_role_claim")]
    pub role_claim: String,
    #[serde(default = "default_jwks_refresh_secs")]
    pub jwks_refresh_interval_secs: u64,
}

fn default_algorithm_allow_list() -> Vec<String> {
    vec!["HS256".to_string()]
}

fn default_role_claim() -> String {
    "role".to_string()
}

fn default_jwks_refresh_secs() -> u64 {
    300
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm_allow_list: default_algorithm_allow_list(),
            secret: None,
            jwks_url: None,
            issuer: None,
            audience: None,
            role_claim: default_role_claim(),
            jwks_refresh_interval_secs: default_jwks_refresh_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    Allow,
    Deny,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoliciesConfig {
    #[serde(default = "default_policy_action")]
    pub default_action: DefaultAction,
    /// Path to a TOML file of `[[policy]]` entries. `spec.md` §4.7 specifies
    /// loading "at startup and on explicit reload" but not the storage
    /// format; this resolves that gap (see DESIGN.md).
    pub file: Option<PathBuf>,
}

fn default_policy_action() -> DefaultAction {
    DefaultAction::Deny
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            default_action: default_policy_action(),
            file: None,
        }
    }
}

/// A SQL scalar/table function declaration for the HTML-over-SQL page engine.
/// The gateway core never calls these; it only carries the config schema so a
/// single config file can describe both collaborators.
#[derive(Debug, Deserialize, Clone)]
pub struct UdfConfig {
    pub name: String,
    #[serde(default)]
    pub expose: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub deterministic: bool,
}

/// A named, parameterized SQL statement exposed under `/rpc/{name}`. `spec.md`
/// names `(method, parameters, return_kind)` for an RPC entry but leaves how a
/// procedure's body is supplied unspecified; this config section resolves
/// that gap (see DESIGN.md).
#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    pub name: String,
    #[serde(default = "default_rpc_method")]
    pub method: String,
    pub sql: String,
    #[serde(default)]
    pub params: Vec<RpcParamConfig>,
    #[serde(default = "default_return_kind")]
    pub return_kind: String,
}

fn default_rpc_method() -> String {
    "POST".to_string()
}

fn default_return_kind() -> String {
    "object".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcParamConfig {
    pub name: String,
    #[serde(default = "default_param_kind")]
    pub kind: String,
}

fn default_param_kind() -> String {
    "text".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            databases: vec![DatabaseConfig {
                name: "default".to_string(),
                path: PathBuf::from(":memory:"),
                mode: DbMode::InMemory,
            }],
            pool: PoolConfig::default(),
            auth: AuthConfig::default(),
            policies: PoliciesConfig::default(),
            udf: Vec::new(),
            rpc: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load() -> AppResult<Self> {
        let config_path = get_config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if !config_path.exists() {
            let default_config = r#"
[server]
host = "127.0.0.1"
port = 8080

[[databases]]
name = "default"
path = "~/.local/share/tablegate/main.db"
mode = "read-write"

[pool]
readers_per_db = 5
busy_timeout_ms = 5000

[auth.jwt]
enabled = false
algorithm_allow_list = ["HS256"]
role_claim = "role"

[policies]
default_action = "deny"
"#;
            std::fs::write(&config_path, default_config)?;
        }

        Self::load_from_file(&config_path)
    }

    pub fn load_from_file(path: &PathBuf) -> AppResult<Self> {
        let builder = Config::builder().add_source(File::from(path.clone())).build()?;

        let mut config: AppConfig = builder.try_deserialize()?;

        for db in &mut config.databases {
            expand_tilde(&mut db.path);
        }

        Ok(config)
    }
}

fn expand_tilde(path: &mut PathBuf) {
    if path.starts_with("~") {
        if let Some(home) = home::home_dir() {
            let path_str = path.to_string_lossy();
            let expanded = path_str.replacen('~', &home.to_string_lossy(), 1);
            *path = PathBuf::from(expanded);
        }
    }
}

fn get_config_path() -> PathBuf {
    if let Some(home) = home::home_dir() {
        home.join(".config/tablegate/config.toml")
    } else {
        PathBuf::from("tablegate.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_one_in_memory_database() {
        let config = AppConfig::default();
        assert_eq!(config.databases.len(), 1);
        assert_eq!(config.databases[0].mode, DbMode::InMemory);
        assert_eq!(config.policies.default_action, DefaultAction::Deny);
    }

    #[test]
    fn expand_tilde_replaces_home_prefix() {
        let mut path = PathBuf::from("~/data/main.db");
        expand_tilde(&mut path);
        if let Some(home) = home::home_dir() {
            assert!(path.starts_with(home));
        }
    }
}
