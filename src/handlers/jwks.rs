//! JWKS 发布端点

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::{
    error::{AppError, Result},
    middleware::AppState,
    models::key::{CacheTag, JwksSnapshot},
};

const CACHE_CONTROL: &str = "public, max-age=300, must-revalidate";

/// `GET /.well-known/jwks.json`
pub async fn jwks(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Response> {
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());

    let ctx = state.op_context();
    match state.keys.jwks(&ctx, if_none_match).await? {
        JwksSnapshot::Unchanged(tag) => {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            apply_cache_headers(response.headers_mut(), &tag)?;
            Ok(response)
        }
        JwksSnapshot::Changed(published) => {
            let mut response = (StatusCode::OK, published.body).into_response();
            let out = response.headers_mut();
            out.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            apply_cache_headers(out, &published.tag)?;
            Ok(response)
        }
    }
}

fn apply_cache_headers(out: &mut HeaderMap, tag: &CacheTag) -> Result<()> {
    let etag = HeaderValue::from_str(&tag.etag)
        .map_err(|e| AppError::Internal(format!("invalid etag header: {}", e)))?;
    let last_modified = HeaderValue::from_str(&http_date(tag))
        .map_err(|e| AppError::Internal(format!("invalid last-modified header: {}", e)))?;

    out.insert(header::ETAG, etag);
    out.insert(header::LAST_MODIFIED, last_modified);
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
    Ok(())
}

/// RFC 7231 IMF-fixdate
fn http_date(tag: &CacheTag) -> String {
    tag.last_modified
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
