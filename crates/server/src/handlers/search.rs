//! Metadata search: containment match, expression filter, projection.

use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{RequestContext, parse_json_body, validate_request};
use crate::state::AppState;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use jmespath::Expression;
use keyhole_access::Action;
use keyhole_core::location::{JsonMap, ObjectLocation, normalize_key_prefix};
use keyhole_core::page_token::{format_page_token, parse_page_token};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_BATCH_SIZE: i64 = 100;
const MAX_BATCH_SIZE: i64 = 1000;

/// POST /metasearch/{bucket} request body.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SearchRequest {
    pub key_prefix: String,
    #[serde(rename = "match")]
    pub match_query: Option<JsonMap>,
    pub filter: Option<String>,
    pub projection: Option<String>,
    pub batch_size: i64,
    pub page_token: String,
}

/// POST /metasearch/{bucket} response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
}

/// A single search result.
#[derive(Debug, Serialize)]
pub struct SearchResult {
    pub path: String,
    pub metadata: Value,
}

/// A validated search: compiled expressions, clamped batch size, resolved
/// paging bounds.
struct PreparedSearch {
    match_query: JsonMap,
    batch_size: usize,
    start_after: Option<ObjectLocation>,
    filter: Option<Expression<'static>>,
    projection: Option<Expression<'static>>,
}

/// POST /metasearch/{bucket} — search cleartext metadata.
pub async fn search_metadata(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<SearchResponse>> {
    let request: SearchRequest = if body.is_empty() {
        SearchRequest::default()
    } else {
        parse_json_body(&body)?
    };

    let mut ctx = validate_request(&state, &headers, &bucket, "").await?;
    let prepared = validate_search_request(&mut ctx, &request)?;

    ctx.authorizer
        .authorize(&ctx.encrypted_location, Action::Query)?;

    let response = execute_search(&state, &ctx, &prepared).await?;
    Ok(Json(response))
}

fn validate_search_request(
    ctx: &mut RequestContext,
    request: &SearchRequest,
) -> ApiResult<PreparedSearch> {
    let match_query = request.match_query.clone().unwrap_or_default();

    let batch_size = if request.batch_size < 1 || request.batch_size > MAX_BATCH_SIZE {
        DEFAULT_BATCH_SIZE
    } else {
        request.batch_size
    } as usize;

    let start_after = if request.page_token.is_empty() {
        None
    } else {
        Some(parse_page_token(&request.page_token).map_err(|e| ApiError::BadRequest(e.to_string()))?)
    };

    // A key prefix narrows the search to a subdirectory. Both forms of the
    // location carry it with a trailing slash.
    let key_prefix = normalize_key_prefix(&request.key_prefix);
    if !key_prefix.is_empty() {
        let encrypted_prefix = ctx
            .encryptor
            .encrypt_path(&ctx.location.bucket, key_prefix)
            .map_err(|_| {
                ApiError::Forbidden(format!(
                    "the access token does not have permission for path '{key_prefix}'"
                ))
            })?;
        ctx.location.object_key = format!("{key_prefix}/");
        ctx.encrypted_location.object_key = format!("{encrypted_prefix}/");
    }

    let filter = request
        .filter
        .as_deref()
        .filter(|f| !f.is_empty())
        .map(|f| compile_expression(f, "filter"))
        .transpose()?;
    let projection = request
        .projection
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| compile_expression(p, "projection"))
        .transpose()?;

    Ok(PreparedSearch {
        match_query,
        batch_size,
        start_after,
        filter,
        projection,
    })
}

async fn execute_search(
    state: &AppState,
    ctx: &RequestContext,
    prepared: &PreparedSearch,
) -> ApiResult<SearchResponse> {
    let objects = state
        .repo
        .query_metadata(
            &ctx.encrypted_location,
            &prepared.match_query,
            prepared.start_after.as_ref(),
            prepared.batch_size,
        )
        .await?;

    let mut results = Vec::new();
    for obj in &objects {
        // Path decryption is the capability gate: rows this request's grant
        // cannot see are skipped silently.
        let Ok(path) = ctx
            .encryptor
            .decrypt_path(&ctx.location.bucket, &obj.location.object_key)
        else {
            continue;
        };

        let metadata = obj
            .metadata
            .clear
            .clone()
            .map(Value::Object)
            .unwrap_or(Value::Null);

        if let Some(filter) = &prepared.filter {
            let result = search_expression(filter, &metadata)?;
            let include = match result.as_boolean() {
                Some(b) => b,
                None => !result.is_null(),
            };
            if !include {
                continue;
            }
        }

        let projected = match &prepared.projection {
            Some(projection) => {
                let result = search_expression(projection, &metadata)?;
                serde_json::to_value(result.as_ref())
                    .map_err(|e| ApiError::Internal(e.to_string()))?
            }
            None => metadata,
        };

        results.push(SearchResult {
            path: format!("sj://{}/{}", obj.location.bucket, path),
            metadata: projected,
        });
    }

    // A full batch means there may be more; emit a token even if the filter
    // emptied this page.
    let page_token = if objects.len() >= prepared.batch_size {
        objects
            .last()
            .map(|last| format_page_token(&last.location))
    } else {
        None
    };

    Ok(SearchResponse {
        results,
        page_token,
    })
}

fn compile_expression(expr: &str, what: &str) -> ApiResult<Expression<'static>> {
    jmespath::compile(expr)
        .map_err(|e| ApiError::BadRequest(format!("invalid {what} expression: {e}")))
}

fn search_expression(expr: &Expression<'static>, metadata: &Value) -> ApiResult<jmespath::Rcvar> {
    let data = jmespath::Variable::from_serializable(metadata)
        .map_err(|e| ApiError::Internal(format!("cannot evaluate metadata: {e}")))?;
    expr.search(data)
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}
