//! Request phase of an HTTP exchange
//!
//! Retargets the client request to the rule's backend and applies the
//! request-side rewrites before it is forwarded.

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, HOST};
use http::request::Parts;
use http::{HeaderMap, Uri};
use tracing::debug;
use url::Url;

use super::exchange::ExchangeContext;
use super::handler::strip_hop_by_hop;
use crate::dump::{MessageKind, Stage, REQUEST_ID_HEADER};
use crate::error::{Result, VillipError};
use crate::rewrite::{apply_headers, substitute_bytes, ContentEncoding, Replacement};
use crate::rule::{HttpFilter, Rule};

/// Header recording the `Host` the client asked for
pub const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

/// Join two URL paths with exactly one slash between them
fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn authority(backend: &Url) -> Result<String> {
    let host = backend
        .host_str()
        .ok_or_else(|| VillipError::InvalidConfig(format!("{} has no host", backend)))?;
    Ok(match backend.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Build the backend URI for a client request
pub fn backend_uri(backend: &Url, url: &str, query: Option<&str>) -> Result<Uri> {
    let mut target = format!(
        "{}://{}{}",
        backend.scheme(),
        authority(backend)?,
        join_path(backend.path(), url)
    );
    if let Some(q) = query {
        target.push('?');
        target.push_str(q);
    }
    target
        .parse::<Uri>()
        .map_err(|e| VillipError::Http(format!("invalid backend uri {}: {}", target, e)))
}

/// Body of one message before and after substitution
pub(crate) struct FilteredBody {
    /// Plain original, as dumped
    pub original: Vec<u8>,
    /// Plain filtered form, as dumped
    pub filtered: Vec<u8>,
    /// Bytes to send on, encoded like the original
    pub body: Bytes,
}

/// Decode, substitute and re-encode a body, fixing `Content-Length`.
///
/// Empty bodies and encodings that cannot be decoded are left untouched along
/// with their `Content-Length`.
pub(crate) fn filter_body(
    url: &str,
    headers: &mut HeaderMap,
    body: Bytes,
    table: &[Replacement],
) -> Result<FilteredBody> {
    let encoding = ContentEncoding::from_headers(headers);
    if body.is_empty() || !encoding.is_supported() {
        if !body.is_empty() {
            debug!(encoding = ?encoding, "body left untouched");
        }
        let raw = body.to_vec();
        return Ok(FilteredBody {
            original: raw.clone(),
            filtered: raw,
            body,
        });
    }

    let original = encoding.decode(&body)?;
    let filtered = substitute_bytes(url, &original, table);
    let body = if filtered == original {
        body
    } else {
        Bytes::from(encoding.encode(&filtered)?)
    };
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    Ok(FilteredBody {
        original,
        filtered,
        body,
    })
}

/// Retarget and rewrite a request; returns the body to forward
pub fn rewrite_request(
    rule: &Rule,
    filter: &HttpFilter,
    ctx: &mut ExchangeContext,
    parts: &mut Parts,
    body: Bytes,
) -> Result<Bytes> {
    let original_host = parts
        .headers
        .get(HOST)
        .cloned()
        .or_else(|| {
            parts
                .uri
                .authority()
                .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
        });

    parts.uri = backend_uri(rule.backend(), ctx.url(), parts.uri.query())?;
    parts.headers.remove(HOST);
    strip_hop_by_hop(&mut parts.headers);
    if let Some(host) = original_host {
        parts.headers.insert(FORWARDED_HOST_HEADER, host);
    }

    if !filter.rewrites_request() {
        return Ok(body);
    }

    debug!(url = ctx.url(), uri = %parts.uri, "rewriting request");

    let FilteredBody {
        original,
        filtered,
        body,
    } = filter_body(ctx.url(), &mut parts.headers, body, &filter.request.replace)?;

    if filter.dump.captures(ctx.url()) {
        let request_id = ctx.start_correlation().to_string();
        filter.dump.write(
            Stage::Original,
            MessageKind::Request,
            &request_id,
            ctx.url(),
            &parts.headers,
            &String::from_utf8_lossy(&original),
        )?;
        let value =
            HeaderValue::from_str(&request_id).map_err(|e| VillipError::Internal(e.to_string()))?;
        parts.headers.insert(REQUEST_ID_HEADER, value);
        filter.dump.write(
            Stage::Filtered,
            MessageKind::Request,
            &request_id,
            ctx.url(),
            &parts.headers,
            &String::from_utf8_lossy(&filtered),
        )?;
    }

    apply_headers(&mut parts.headers, &filter.request.headers);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dump::DumpSettings;
    use crate::rewrite::{HeaderOp, HeaderRule, HeaderValueSource};
    use crate::rule::{Action, Restrictions};
    use http::header::{HeaderName, CONTENT_ENCODING, TRANSFER_ENCODING};
    use http::Request;

    fn rule_with(backend: &str, filter: HttpFilter) -> Rule {
        Rule::http(Url::parse(backend).unwrap(), 8080, 0, Restrictions::default(), filter)
    }

    fn parts(uri: &str, headers: &[(&'static str, &'static str)]) -> Parts {
        let mut builder = Request::builder().method("POST").uri(uri);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn run(
        rule: &Rule,
        uri: &str,
        headers: &[(&'static str, &'static str)],
        body: Bytes,
    ) -> (Parts, Bytes, ExchangeContext) {
        let mut p = parts(uri, headers);
        let path = p.uri.path().to_string();
        let url = rule.prefix_replace(&path);
        let mut ctx = ExchangeContext::new("127.0.0.1".parse().unwrap(), path, url);
        let filter = rule.http_filter().unwrap();
        let out = rewrite_request(rule, filter, &mut ctx, &mut p, body).unwrap();
        (p, out, ctx)
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "/a"), "/a");
        assert_eq!(join_path("/api", "/a"), "/api/a");
        assert_eq!(join_path("/api/", "a"), "/api/a");
        assert_eq!(join_path("/api", "a"), "/api/a");
    }

    #[test]
    fn test_backend_uri() {
        let backend = Url::parse("https://backend.example:8443/base").unwrap();
        let uri = backend_uri(&backend, "/users", Some("page=2")).unwrap();
        assert_eq!(uri.to_string(), "https://backend.example:8443/base/users?page=2");
    }

    #[test]
    fn test_retarget_without_rewrites() {
        let rule = rule_with("http://localhost:8081", HttpFilter::default());
        let (p, body, ctx) = run(
            &rule,
            "/youngster?x=1",
            &[("host", "villip.example"), ("connection", "keep-alive"), ("transfer-encoding", "chunked")],
            Bytes::from_static(b"take your book"),
        );

        assert_eq!(p.uri.to_string(), "http://localhost:8081/youngster?x=1");
        assert!(p.headers.get(HOST).is_none());
        assert!(p.headers.get("connection").is_none());
        assert!(p.headers.get(TRANSFER_ENCODING).is_none());
        assert_eq!(p.headers.get(FORWARDED_HOST_HEADER).unwrap(), "villip.example");
        assert_eq!(&body[..], b"take your book");
        assert!(ctx.request_id().is_none());
    }

    #[test]
    fn test_prefix_rewritten_path() {
        let filter = HttpFilter {
            prefix: vec![Replacement::new("/env", "/dev/env", vec![])],
            ..HttpFilter::default()
        };
        let rule = rule_with("http://localhost:8081", filter);
        let (p, _, _) = run(&rule, "/env/admin", &[], Bytes::new());
        assert_eq!(p.uri.path(), "/dev/env/admin");
    }

    #[test]
    fn test_body_substitution_and_headers() {
        let filter = HttpFilter {
            request: Action {
                replace: vec![Replacement::new("book", "smartphone", vec![])],
                headers: vec![HeaderRule::new(
                    HeaderName::from_static("x-env"),
                    HeaderValueSource::Static(HeaderValue::from_static("dev")),
                    HeaderOp::Force,
                )],
            },
            ..HttpFilter::default()
        };
        let rule = rule_with("http://localhost:8081", filter);
        let (p, body, _) = run(
            &rule,
            "/",
            &[("content-length", "14")],
            Bytes::from_static(b"take your book"),
        );

        assert_eq!(&body[..], b"take your smartphone");
        assert_eq!(p.headers.get(CONTENT_LENGTH).unwrap(), "20");
        assert_eq!(p.headers.get("x-env").unwrap(), "dev");
    }

    #[test]
    fn test_gzip_request_body() {
        let filter = HttpFilter {
            request: Action {
                replace: vec![Replacement::new("book", "tablet", vec![])],
                headers: vec![],
            },
            ..HttpFilter::default()
        };
        let rule = rule_with("http://localhost:8081", filter);
        let compressed = ContentEncoding::Gzip.encode(b"read a book").unwrap();

        let (p, body, _) = run(
            &rule,
            "/",
            &[("content-encoding", "gzip")],
            Bytes::from(compressed),
        );

        assert_eq!(p.headers.get(CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(p.headers.get(CONTENT_LENGTH).unwrap(), &body.len().to_string());
        assert_eq!(ContentEncoding::Gzip.decode(&body).unwrap(), b"read a tablet".to_vec());
    }

    #[test]
    fn test_dump_sets_correlation_header() {
        let dir = tempfile::tempdir().unwrap();
        let filter = HttpFilter {
            dump: DumpSettings::new(Some(dir.path().to_path_buf()), vec![]),
            ..HttpFilter::default()
        };
        let rule = rule_with("http://localhost:8081", filter);
        let (p, _, ctx) = run(&rule, "/youngster", &[], Bytes::from_static(b"hello"));

        let id = ctx.request_id().unwrap();
        assert_eq!(p.headers.get(REQUEST_ID_HEADER).unwrap(), id);
        assert!(dir.path().join(format!("{}.originalRequest", id)).exists());
        let filtered = std::fs::read_to_string(dir.path().join(format!("{}.filteredRequest", id))).unwrap();
        assert!(filtered.starts_with("URL: /youngster\n"));
        assert!(filtered.contains("X-Villip-Request-Id: "));
        assert!(filtered.ends_with("\n\nhello"));
    }

    #[test]
    fn test_dump_scope_excludes_url() {
        let filter = HttpFilter {
            dump: DumpSettings::new(None, vec![regex::Regex::new("^/youngster").unwrap()]),
            ..HttpFilter::default()
        };
        let rule = rule_with("http://localhost:8081", filter);
        let (p, _, ctx) = run(&rule, "/boomer", &[], Bytes::from_static(b"hello"));
        assert!(ctx.request_id().is_none());
        assert!(p.headers.get(REQUEST_ID_HEADER).is_none());
    }

    #[test]
    fn test_latin1_body_rewritten_and_dumped() {
        let dir = tempfile::tempdir().unwrap();
        let filter = HttpFilter {
            request: Action {
                replace: vec![Replacement::new("book", "tablet", vec![])],
                headers: vec![],
            },
            dump: DumpSettings::new(Some(dir.path().to_path_buf()), vec![]),
            ..HttpFilter::default()
        };
        let rule = rule_with("http://localhost:8081", filter);
        let (p, body, ctx) = run(
            &rule,
            "/",
            &[("content-type", "text/plain; charset=iso-8859-1")],
            Bytes::from_static(b"caf\xe9 book"),
        );

        assert_eq!(&body[..], b"caf\xe9 tablet");
        assert_eq!(p.headers.get(CONTENT_LENGTH).unwrap(), "11");
        let id = ctx.request_id().unwrap();
        assert_eq!(p.headers.get(REQUEST_ID_HEADER).unwrap(), id);
        let filtered = std::fs::read_to_string(dir.path().join(format!("{}.filteredRequest", id))).unwrap();
        assert!(filtered.ends_with(" tablet"));
    }

    #[test]
    fn test_empty_body_keeps_length_absent() {
        let filter = HttpFilter {
            request: Action {
                replace: vec![Replacement::new("book", "tablet", vec![])],
                headers: vec![],
            },
            ..HttpFilter::default()
        };
        let rule = rule_with("http://localhost:8081", filter);
        let (p, body, _) = run(&rule, "/", &[], Bytes::new());
        assert!(body.is_empty());
        assert!(p.headers.get(CONTENT_LENGTH).is_none());
    }
}
