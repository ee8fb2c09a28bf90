//! Centralized route configuration for the gateway's HTTP surface.
//!
//! Shared between the real server and integration tests so both exercise the
//! same routing table.

use actix_web::web;

use crate::handlers::{
    attach_database, call_rpc, delete_default, delete_named, describe_auth, describe_schema,
    detach_database, health_check, insert_default, insert_named, list_databases,
    reload_policies, schema_cache_stats, select_default, select_named, update_default,
    update_named,
};
use crate::middleware::AuthenticationMiddleware;

/// Configures all application routes for the given scope.
///
/// `with_auth` lets tests stand up a server without JWT enforcement while
/// exercising the same table/RPC routing.
pub fn configure_routes(cfg: &mut web::ServiceConfig, with_auth: bool) {
    let scope = web::scope("")
        .route("/health", web::get().to(health_check))
        .service(
            web::resource("/_debug/databases")
                .route(web::get().to(list_databases))
                .route(web::post().to(attach_database)),
        )
        .service(
            web::resource("/_debug/databases/{name}").route(web::delete().to(detach_database)),
        )
        .service(
            web::resource("/_debug/databases/{name}/schema-stats")
                .route(web::get().to(schema_cache_stats)),
        )
        .service(web::resource("/_debug/schema").route(web::get().to(describe_schema)))
        .service(web::resource("/_debug/auth").route(web::get().to(describe_auth)))
        .service(
            web::resource("/_debug/policies/reload").route(web::post().to(reload_policies)),
        )
        .service(
            web::resource("/rpc/{name}")
                .route(web::get().to(call_rpc))
                .route(web::post().to(call_rpc)),
        )
        .service(
            web::resource("/db/{db}/{table}")
                .route(web::get().to(select_named))
                .route(web::post().to(insert_named))
                .route(web::patch().to(update_named))
                .route(web::delete().to(delete_named)),
        )
        .service(
            web::resource("/{table}")
                .route(web::get().to(select_default))
                .route(web::post().to(insert_default))
                .route(web::patch().to(update_default))
                .route(web::delete().to(delete_default)),
        );

    if with_auth {
        cfg.service(scope.wrap(AuthenticationMiddleware));
    } else {
        cfg.service(scope);
    }
}
