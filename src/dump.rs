//! Dump and correlation
//!
//! Captures the original and the filtered form of requests and responses,
//! either as one file per message or as debug log events. Messages of one
//! exchange share a correlation id carried by the `X-Villip-Request-Id` header.

use std::path::{Path, PathBuf};

use http::HeaderMap;
use rand::RngCore;
use regex::Regex;
use tracing::debug;

use crate::error::{Result, VillipError};

/// Header carrying the correlation id from the request phase to the response phase
pub const REQUEST_ID_HEADER: &str = "x-villip-request-id";

/// Which side of the exchange is dumped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

/// Whether the message is dumped before or after the rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Original,
    Filtered,
}

impl Stage {
    /// Artifact suffix, e.g. `originalRequest`
    pub fn label(self, kind: MessageKind) -> &'static str {
        match (self, kind) {
            (Stage::Original, MessageKind::Request) => "originalRequest",
            (Stage::Filtered, MessageKind::Request) => "filteredRequest",
            (Stage::Original, MessageKind::Response) => "originalResponse",
            (Stage::Filtered, MessageKind::Response) => "filteredResponse",
        }
    }
}

/// Generate a correlation id: 12 random bytes, hex encoded
pub fn generate_request_id() -> String {
    let mut raw = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Capitalise a lowercase header name the way it is usually written
fn display_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Render headers as `Name: value` lines sorted by name
pub fn sorted_header_lines(headers: &HeaderMap) -> Vec<String> {
    let mut names: Vec<&str> = headers.keys().map(|k| k.as_str()).collect();
    names.sort_unstable();
    names.dedup();

    let mut lines = Vec::with_capacity(headers.len());
    for name in names {
        let display = display_name(name);
        for value in headers.get_all(name) {
            lines.push(format!("{}: {}\n", display, String::from_utf8_lossy(value.as_bytes())));
        }
    }
    lines
}

/// Dump configuration of a rule
#[derive(Debug, Clone, Default)]
pub struct DumpSettings {
    folder: Option<PathBuf>,
    urls: Vec<Regex>,
}

impl DumpSettings {
    pub fn new(folder: Option<PathBuf>, urls: Vec<Regex>) -> Self {
        Self { folder, urls }
    }

    /// Dumping is on once a folder or a URL filter is configured
    pub fn is_enabled(&self) -> bool {
        self.folder.is_some() || !self.urls.is_empty()
    }

    pub fn folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    /// Check whether messages for this URL are captured
    pub fn captures(&self, url: &str) -> bool {
        self.is_enabled() && (self.urls.is_empty() || self.urls.iter().any(|re| re.is_match(url)))
    }

    /// Write one message to the configured sink
    pub fn write(
        &self,
        stage: Stage,
        kind: MessageKind,
        request_id: &str,
        url: &str,
        headers: &HeaderMap,
        body: &str,
    ) -> Result<()> {
        let label = stage.label(kind);
        match &self.folder {
            Some(folder) => write_file(folder, label, request_id, url, headers, body),
            None => {
                write_log(label, request_id, url, headers, body);
                Ok(())
            }
        }
    }
}

fn write_file(
    folder: &Path,
    label: &str,
    request_id: &str,
    url: &str,
    headers: &HeaderMap,
    body: &str,
) -> Result<()> {
    let path = folder.join(format!("{}.{}", request_id, label));

    let mut content = format!("URL: {}\n", url);
    for line in sorted_header_lines(headers) {
        content.push_str(&line);
    }
    content.push('\n');
    content.push_str(body);

    std::fs::write(&path, content).map_err(|e| VillipError::Dump {
        request_id: request_id.to_string(),
        reason: format!("failed to write {}: {}", path.display(), e),
    })
}

fn write_log(label: &str, request_id: &str, url: &str, headers: &HeaderMap, body: &str) {
    for line in sorted_header_lines(headers) {
        debug!(kind = label, request_id, url, part = "header", "{}", line.trim_end());
    }
    debug!(kind = label, request_id, url, part = "body", "{}", body);
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_request_id_format() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_eq!(a.len(), 24);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_labels() {
        assert_eq!(Stage::Original.label(MessageKind::Request), "originalRequest");
        assert_eq!(Stage::Filtered.label(MessageKind::Response), "filteredResponse");
    }

    #[test]
    fn test_sorted_header_lines() {
        let mut headers = HeaderMap::new();
        headers.insert("x-env", HeaderValue::from_static("dev"));
        headers.append("x-authors", HeaderValue::from_static("alice"));
        headers.append("x-authors", HeaderValue::from_static("bob"));
        headers.insert("content-length", HeaderValue::from_static("40"));

        assert_eq!(
            sorted_header_lines(&headers),
            vec![
                "Content-Length: 40\n",
                "X-Authors: alice\n",
                "X-Authors: bob\n",
                "X-Env: dev\n",
            ]
        );
    }

    #[test]
    fn test_captures() {
        let off = DumpSettings::default();
        assert!(!off.is_enabled());
        assert!(!off.captures("/youngster"));

        let all = DumpSettings::new(Some(PathBuf::from("/tmp")), vec![]);
        assert!(all.captures("/anything"));

        let scoped = DumpSettings::new(None, vec![Regex::new("^/youngster").unwrap()]);
        assert!(scoped.is_enabled());
        assert!(scoped.captures("/youngster/1"));
        assert!(!scoped.captures("/boomer/1"));
    }

    #[test]
    fn test_write_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = DumpSettings::new(Some(dir.path().to_path_buf()), vec![]);

        let mut headers = HeaderMap::new();
        headers.insert("x-env", HeaderValue::from_static("dev"));
        headers.insert("server", HeaderValue::from_static("remote"));

        settings
            .write(
                Stage::Original,
                MessageKind::Response,
                "123456789012",
                "/youngster/1",
                &headers,
                "take your book",
            )
            .unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("123456789012.originalResponse")).unwrap();
        assert_eq!(
            content,
            "URL: /youngster/1\nServer: remote\nX-Env: dev\n\ntake your book"
        );
    }

    #[test]
    fn test_write_file_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let settings = DumpSettings::new(Some(missing), vec![]);

        let err = settings
            .write(
                Stage::Filtered,
                MessageKind::Request,
                "abc",
                "/",
                &HeaderMap::new(),
                "",
            )
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_log_mode() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        let settings = DumpSettings::new(None, vec![Regex::new("/").unwrap()]);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let result = tracing::subscriber::with_default(subscriber, || {
            settings.write(
                Stage::Filtered,
                MessageKind::Request,
                "abc",
                "/",
                &headers,
                "body",
            )
        });
        assert!(result.is_ok());

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert!(line.contains(r#""kind":"filteredRequest""#));
            assert!(line.contains(r#""request_id":"abc""#));
            assert!(line.contains(r#""url":"/""#));
        }
        assert!(lines[0].contains(r#""part":"header""#));
        assert!(lines[0].contains("Content-Type: text/plain"));
        assert!(lines[1].contains(r#""part":"body""#));
        assert!(lines[1].contains(r#""message":"body""#));
    }
}
