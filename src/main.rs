mod auth;
mod config;
mod db;
mod emitter;
mod error;
mod filter;
mod handlers;
mod middleware;
mod models;
mod negotiate;
mod plan;
mod policy;
mod routes;
mod rpc;
mod shape;

use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use actix_web::{middleware::Logger, App, HttpServer};
use clap::{Arg, Command};
use config::AppConfig;
use error::AppResult;
use handlers::AppState;

use crate::auth::AuthVerifier;
use crate::db::PoolManager;
use crate::policy::PolicyEngine;
use crate::routes::configure_routes;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[actix_web::main]
async fn main() -> AppResult<()> {
    let matches = Command::new("tablegate")
        .version("0.1.0")
        .about("SQLite-backed PostgREST-compatible REST gateway")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to configuration file")
                .value_name("FILE"),
        )
        .get_matches();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("tablegate=info".parse().unwrap()))
        .init();

    tracing::info!("Starting tablegate gateway");

    let config = if let Some(config_path) = matches.get_one::<String>("config") {
        let path = PathBuf::from(config_path);
        tracing::info!("Loading configuration from {}", path.display());
        AppConfig::load_from_file(&path)?
    } else {
        tracing::info!("Loading configuration from default location");
        AppConfig::load()?
    };

    let pool = PoolManager::new(&config.databases, config.pool.clone())?;
    tracing::info!(databases = config.databases.len(), "database pool ready");

    let auth = AuthVerifier::new(config.auth.jwt.clone());
    if config.auth.jwt.enabled {
        match auth.refresh_jwks().await {
            Ok(count) => tracing::info!(keys = count, "jwks refreshed"),
            Err(e) => tracing::warn!("initial jwks refresh failed: {e}"),
        }
    }

    let policy = PolicyEngine::new(config.policies.default_action);
    if let Some(path) = &config.policies.file {
        match policy.load_from_file(path) {
            Ok(count) => tracing::info!(policies = count, "policies loaded"),
            Err(e) => tracing::warn!("policy load failed: {e}"),
        }
    }

    let server_addr = format!("{}:{}", config.server.host, config.server.port);
    let refresh_interval = auth.refresh_interval();

    let app_state = actix_web::web::Data::new(AppState {
        pool,
        auth,
        policy,
        config: RwLock::new(config),
        start_time: SystemTime::now(),
    });

    let jwks_state = app_state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(refresh_interval.max(Duration::from_secs(5)));
        loop {
            ticker.tick().await;
            if let Err(e) = jwks_state.auth.refresh_jwks().await {
                tracing::warn!("jwks refresh failed: {e}");
            }
        }
    });

    tracing::info!("Starting HTTP server on {}", server_addr);
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(Logger::default())
            .configure(|cfg| configure_routes(cfg, true))
    })
    .bind(&server_addr)?
    .run()
    .await?;

    Ok(())
}
