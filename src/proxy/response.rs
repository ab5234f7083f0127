//! Response phase of an HTTP exchange
//!
//! Authorizes the source once more, gates on status and content type, then
//! rewrites the body and the `Location` header of the backend response.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use http::response::Parts;
use http::{HeaderMap, StatusCode};
use tracing::debug;

use super::exchange::ExchangeContext;
use super::handler::strip_hop_by_hop;
use super::request::{filter_body, FilteredBody};
use crate::dump::{MessageKind, Stage, REQUEST_ID_HEADER};
use crate::error::{Result, VillipError};
use crate::rewrite::{apply_headers, substitute, ReplaceMode};
use crate::rule::{HttpFilter, Rule};

/// Body of the response sent to sources outside the restriction list
pub const FORBIDDEN_BODY: &str = "Access forbidden from this IP";

fn forbid(parts: &mut Parts) -> Bytes {
    parts.status = StatusCode::FORBIDDEN;
    parts.headers = HeaderMap::new();
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    parts
        .headers
        .insert(CONTENT_LENGTH, HeaderValue::from(FORBIDDEN_BODY.len()));
    Bytes::from_static(FORBIDDEN_BODY.as_bytes())
}

fn echo_correlation(ctx: &ExchangeContext, headers: &mut HeaderMap) -> Result<()> {
    if let Some(id) = ctx.request_id() {
        let value = HeaderValue::from_str(id).map_err(|e| VillipError::Internal(e.to_string()))?;
        headers.insert(REQUEST_ID_HEADER, value);
    }
    Ok(())
}

/// Filter a backend response; returns the body to send to the client
pub fn rewrite_response(
    rule: &Rule,
    filter: &HttpFilter,
    ctx: &mut ExchangeContext,
    parts: &mut Parts,
    body: Bytes,
) -> Result<Bytes> {
    if !rule.is_authorized(ctx.source()) {
        debug!(source = %ctx.source(), url = ctx.path(), "forbidden from this IP");
        return Ok(forbid(parts));
    }

    strip_hop_by_hop(&mut parts.headers);
    echo_correlation(ctx, &mut parts.headers)?;

    if !filter.rewrites_response() {
        return Ok(body);
    }

    let status = parts.status.as_u16();
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if !filter.force && !filter.accepts_response(status, &content_type) {
        debug!(status, content_type = %content_type, url = ctx.url(), "... skipping");
        return Ok(body);
    }

    debug!(status, url = ctx.url(), "filtering");
    let original_headers = parts.headers.clone();
    let table = &filter.response.replace;

    let location = parts
        .headers
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(location) = location {
        let rewritten = substitute(ctx.url(), &location, table, ReplaceMode::Anywhere);
        if rewritten != location {
            debug!(location = %location, rewritten = %rewritten, "will rewrite location header");
            let value = HeaderValue::from_str(&rewritten)
                .map_err(|e| VillipError::Encode(format!("invalid location {}: {}", rewritten, e)))?;
            parts.headers.insert(LOCATION, value);
        }
    }

    let FilteredBody {
        original,
        filtered,
        body,
    } = filter_body(ctx.url(), &mut parts.headers, body, table)?;

    if filter.dump.captures(ctx.url()) {
        let request_id = ctx.correlation_for(&original_headers);
        filter.dump.write(
            Stage::Original,
            MessageKind::Response,
            &request_id,
            ctx.url(),
            &original_headers,
            &String::from_utf8_lossy(&original),
        )?;
        echo_correlation(ctx, &mut parts.headers)?;
        filter.dump.write(
            Stage::Filtered,
            MessageKind::Response,
            &request_id,
            ctx.url(),
            &parts.headers,
            &String::from_utf8_lossy(&filtered),
        )?;
    }

    // Injected headers are not part of the filtered dump
    apply_headers(&mut parts.headers, &filter.response.headers);

    Ok(body)
}
