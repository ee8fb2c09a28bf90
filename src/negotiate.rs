use actix_web::{HttpRequest, HttpResponse};
use serde_json::Value as JsonValue;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Json,
    Csv,
    SingleObject,
    ExplainPlan,
}

const CSV_MEDIA_TYPE: &str = "text/csv";
const SINGLE_OBJECT_MEDIA_TYPE: &str = "application/vnd.pgrst.object";
const EXPLAIN_MEDIA_TYPE: &str = "application/vnd.pgrst.plan";

pub fn negotiate(req: &HttpRequest) -> MediaType {
    let accept = req
        .headers()
        .get(actix_web::http::header::ACCEPT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("*/*");

    if accept.contains(CSV_MEDIA_TYPE) {
        MediaType::Csv
    } else if accept.contains(SINGLE_OBJECT_MEDIA_TYPE) {
        MediaType::SingleObject
    } else if accept.contains(EXPLAIN_MEDIA_TYPE) {
        MediaType::ExplainPlan
    } else {
        MediaType::Json
    }
}

/// Render a row set in the caller-selected shape. `SingleObject` requires
/// exactly one row (the `vnd.pgrst.object` contract) and surfaces a
/// `406`-equivalent validation error otherwise, a 300-multiple response body
/// describing the ambiguity rather than picking one silently.
pub fn render_rows(media: MediaType, rows: Vec<JsonValue>) -> AppResult<HttpResponse> {
    match media {
        MediaType::Json => Ok(HttpResponse::Ok().json(rows)),
        MediaType::SingleObject => match rows.len() {
            1 => Ok(HttpResponse::Ok().json(rows.into_iter().next().unwrap())),
            0 => Err(AppError::not_found("no row matched the request")),
            n => Ok(HttpResponse::MultipleChoices().json(serde_json::json!({
                "code": "multiple_rows",
                "message": format!("{n} rows matched a single-object request"),
            }))),
        },
        MediaType::Csv => render_csv(rows),
        MediaType::ExplainPlan => Ok(HttpResponse::Ok().json(rows)),
    }
}

pub fn render_explain(sql: &str, params: &[rusqlite::types::Value]) -> HttpResponse {
    let args: Vec<JsonValue> = params
        .iter()
        .map(crate::shape::sql_value_to_json)
        .collect();
    HttpResponse::Ok().json(serde_json::json!({
        "plan": {
            "query": sql,
            "args": args,
        },
    }))
}

fn render_csv(rows: Vec<JsonValue>) -> AppResult<HttpResponse> {
    let mut header: Vec<String> = Vec::new();
    if let Some(JsonValue::Object(first)) = rows.first() {
        header = first.keys().cloned().collect();
    }

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    if !header.is_empty() {
        writer
            .write_record(&header)
            .map_err(|e| AppError::Database(format!("csv encode error: {e}")))?;
    }

    for row in &rows {
        if let JsonValue::Object(map) = row {
            let record: Vec<String> = header
                .iter()
                .map(|key| match map.get(key) {
                    Some(JsonValue::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                })
                .collect();
            writer
                .write_record(&record)
                .map_err(|e| AppError::Database(format!("csv encode error: {e}")))?;
        }
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::Database(format!("csv encode error: {e}")))?;

    Ok(HttpResponse::Ok().content_type(CSV_MEDIA_TYPE).body(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn defaults_to_json_without_accept_header() {
        let req = TestRequest::default().to_http_request();
        assert_eq!(negotiate(&req), MediaType::Json);
    }

    #[test]
    fn recognizes_csv_accept_header() {
        let req = TestRequest::default()
            .insert_header(("Accept", "text/csv"))
            .to_http_request();
        assert_eq!(negotiate(&req), MediaType::Csv);
    }

    #[test]
    fn single_object_rejects_empty_result() {
        let result = render_rows(MediaType::SingleObject, vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn single_object_accepts_exactly_one_row() {
        let rows = vec![serde_json::json!({"id": 1})];
        let response = render_rows(MediaType::SingleObject, rows).unwrap();
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);
    }
}
