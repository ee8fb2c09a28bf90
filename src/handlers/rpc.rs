use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult};
use crate::handlers::AppState;
use crate::negotiate::{negotiate, render_rows};
use crate::rpc::dispatch;

/// `{GET,POST} /rpc/{name}` — runs an allow-listed procedure against the
/// default database. `spec.md` names `(method, parameters, return_kind)` for
/// an RPC entry but not which database it targets; this always uses the
/// default one (see DESIGN.md). POST reads parameters from the JSON body,
/// GET from the query string, matching the pgrst-style split.
pub async fn call_rpc(
    req: HttpRequest,
    state: web::Data<AppState>,
    name: web::Path<String>,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    let config = state
        .config
        .read()
        .map_err(|_| AppError::Database("config lock poisoned".to_string()))?;

    let params = if req.method() == actix_web::http::Method::GET {
        let mut map = serde_json::Map::new();
        for (key, value) in url::form_urlencoded::parse(req.query_string().as_bytes()) {
            map.insert(key.into_owned(), JsonValue::String(value.into_owned()));
        }
        JsonValue::Object(map)
    } else if body.is_empty() {
        JsonValue::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice::<JsonValue>(&body)
            .map_err(|e| AppError::validation(format!("invalid JSON body: {e}")))?
    };

    let handle = state.pool.get(None)?;
    let rows = dispatch(&handle, &config.rpc, &name, &params)?;
    render_rows(negotiate(&req), rows)
}
