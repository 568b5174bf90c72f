//! Bridges inbound tunnel streams to the local HTTP backend.
//!
//! The initial `OpenStream` payload carries a serialized HTTP/1.1 request;
//! further body bytes arrive as `Data` frames on the same stream. The
//! forwarder replays the request against the configured local service and
//! streams the response back (status line, headers, blank line, body), one
//! `Data` frame per write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;

use crate::config::AgentConfig;
use crate::error::{ClientError, Result};
use crate::metrics::Metrics;
use crate::stream::Stream;

/// Maximum idle connections kept in the local HTTP client pool.
const POOL_MAX_IDLE: usize = 100;

/// Idle timeout for pooled connections.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// HTTP request parsed out of an `OpenStream` payload.
#[derive(Debug)]
struct ParsedRequest {
    method: String,
    path: String,
    query: Option<String>,
    /// Header pairs in arrival order; duplicates preserved.
    headers: Vec<(String, String)>,
    /// Body bytes that arrived in the same payload as the head.
    body: Bytes,
}

impl ParsedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub struct LocalForwarder {
    client: reqwest::Client,
    default_url: String,
    services: HashMap<String, String>,
    metrics: Arc<Metrics>,
}

impl LocalForwarder {
    pub fn new(config: &AgentConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_IDLE)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            default_url: config.local_url.clone(),
            services: config.services.clone(),
            metrics,
        })
    }

    pub fn default_url(&self) -> &str {
        &self.default_url
    }

    /// Replay one tunneled request against the local service and write the
    /// response back through the stream. The caller owns the terminating
    /// frame (`END_STREAM` on success, `ERROR` on failure) and the registry
    /// close.
    pub async fn forward(&self, stream: Arc<Stream>, initial_payload: Bytes) -> Result<()> {
        let started = Instant::now();
        self.metrics.inc_local_requests_total();
        self.metrics.inc_requests_total();

        match self.forward_inner(&stream, initial_payload).await {
            Ok(()) => {
                self.metrics.record_local_request_duration(started.elapsed());
                self.metrics.record_request_duration(started.elapsed());
                self.metrics.inc_requests_success();
                self.metrics.set_last_request_now();
                Ok(())
            }
            Err(err) => {
                self.metrics.inc_local_requests_error();
                self.metrics.inc_requests_failed();
                Err(err)
            }
        }
    }

    async fn forward_inner(&self, stream: &Arc<Stream>, initial_payload: Bytes) -> Result<()> {
        let parsed = parse_request(&initial_payload)?;

        let base = self.route(parsed.header("host"));
        let url = build_local_url(base, &parsed.path, parsed.query.as_deref());
        debug!(method = %parsed.method, url = %url, stream_id = stream.id(), "forwarding request");

        let method = reqwest::Method::from_bytes(parsed.method.as_bytes())
            .map_err(|_| ClientError::LocalService(format!("invalid method {:?}", parsed.method)))?;

        let mut request = self.client.request(method, &url);
        for (name, value) in &parsed.headers {
            // The local URL supplies the authority.
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }

        let has_streamed_body = parsed
            .header("content-length")
            .is_some_and(|value| value.trim() != "0")
            || parsed.header("transfer-encoding").is_some();

        if has_streamed_body {
            // Chain the bytes that arrived with the head to the chunks still
            // in flight on the stream.
            request = request.body(reqwest::Body::wrap_stream(body_stream(
                stream.clone(),
                parsed.body.clone(),
            )));
        } else if !parsed.body.is_empty() {
            request = request.body(parsed.body.clone());
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                ClientError::Timeout
            } else {
                ClientError::LocalService(format!("local service request failed: {err}"))
            }
        })?;

        stream.write(response_head(&response))?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| {
                if err.is_timeout() {
                    ClientError::Timeout
                } else {
                    ClientError::LocalService(format!("failed to stream response body: {err}"))
                }
            })?;
            if !chunk.is_empty() {
                stream.write(chunk)?;
            }
        }

        Ok(())
    }

    /// Pick the base URL for `host`: the longest matching subdomain mapping,
    /// or the default URL.
    fn route(&self, host: Option<&str>) -> &str {
        let Some(host) = host.filter(|h| !h.is_empty()) else {
            return &self.default_url;
        };

        let mut best: Option<(&str, &str)> = None;
        for (subdomain, url) in &self.services {
            if subdomain.is_empty() {
                continue;
            }
            let matches = host == subdomain
                || host
                    .strip_prefix(subdomain.as_str())
                    .is_some_and(|rest| rest.starts_with('.'));
            if matches && best.is_none_or(|(current, _)| subdomain.len() > current.len()) {
                best = Some((subdomain, url));
            }
        }

        match best {
            Some((subdomain, url)) => {
                debug!(host, subdomain, url, "matched local service");
                url
            }
            None => {
                debug!(host, default = %self.default_url, "no service mapping for host");
                &self.default_url
            }
        }
    }
}

/// Serialize the response status line and headers in wire form.
fn response_head(response: &reqwest::Response) -> Bytes {
    let version = match response.version() {
        reqwest::Version::HTTP_10 => "HTTP/1.0",
        reqwest::Version::HTTP_2 => "HTTP/2.0",
        _ => "HTTP/1.1",
    };

    let mut head = Vec::with_capacity(256);
    head.extend_from_slice(version.as_bytes());
    head.push(b' ');
    head.extend_from_slice(response.status().to_string().as_bytes());
    head.extend_from_slice(b"\r\n");
    for (name, value) in response.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    Bytes::from(head)
}

/// Request body source: the initial payload bytes followed by `Data` frame
/// chunks until the stream reaches end of stream.
fn body_stream(
    stream: Arc<Stream>,
    initial: Bytes,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static {
    let first = Some(initial).filter(|bytes| !bytes.is_empty());
    futures::stream::unfold((first, stream), |(first, stream)| async move {
        if let Some(chunk) = first {
            return Some((Ok(chunk), (None, stream)));
        }
        let chunk = stream.recv_chunk().await?;
        Some((Ok(chunk), (None, stream)))
    })
}

/// Parse `METHOD SP PATH[?QUERY] SP VERSION\r\n(HEADER\r\n)*\r\n[body]`.
fn parse_request(data: &[u8]) -> Result<ParsedRequest> {
    let (head, body) = match find_head_end(data) {
        Some(split) => (&data[..split], &data[split + 4..]),
        None => (data, &data[data.len()..]),
    };

    let head = std::str::from_utf8(head)
        .map_err(|_| ClientError::LocalService("request head is not valid UTF-8".into()))?;
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| ClientError::LocalService("invalid request format".into()))?;

    let mut parts = request_line.split(' ');
    let (method, target, _version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version))
            if !method.is_empty() && !target.is_empty() && !version.is_empty() =>
        {
            (method, target, version)
        }
        _ => {
            return Err(ClientError::LocalService(format!(
                "invalid request line {request_line:?}"
            )))
        }
    };

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Lines without a colon are skipped rather than failing the request.
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ParsedRequest {
        method: method.to_string(),
        path,
        query,
        headers,
        body: Bytes::copy_from_slice(body),
    })
}

/// Position of the first `\r\n\r\n`, if any.
fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Join the base URL, path and query into the outbound request URL.
fn build_local_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = String::with_capacity(base.len() + path.len() + 16);
    url.push_str(base.trim_end_matches('/'));
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_without_body() {
        let parsed =
            parse_request(b"GET /status HTTP/1.1\r\nHost: foo.example\r\nAccept: */*\r\n\r\n")
                .expect("parse");
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.path, "/status");
        assert!(parsed.query.is_none());
        assert_eq!(parsed.header("host"), Some("foo.example"));
        assert_eq!(parsed.header("accept"), Some("*/*"));
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn parses_query_and_initial_body() {
        let parsed = parse_request(
            b"POST /upload?kind=blob HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world",
        )
        .expect("parse");
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.path, "/upload");
        assert_eq!(parsed.query.as_deref(), Some("kind=blob"));
        assert_eq!(&parsed.body[..], b"hello world");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let parsed =
            parse_request(b"GET / HTTP/1.1\r\ncOnTeNt-LeNgTh: 5\r\n\r\n").expect("parse");
        assert_eq!(parsed.header("Content-Length"), Some("5"));
    }

    #[test]
    fn duplicate_headers_are_preserved() {
        let parsed = parse_request(b"GET / HTTP/1.1\r\nX-Tag: a\r\nX-Tag: b\r\n\r\n")
            .expect("parse");
        let tags: Vec<&str> = parsed
            .headers
            .iter()
            .filter(|(name, _)| name == "X-Tag")
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(tags, ["a", "b"]);
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        assert!(parse_request(b"GARBAGE\r\n\r\n").is_err());
        assert!(parse_request(b"").is_err());
        assert!(parse_request(b"GET /\r\n\r\n").is_err());
    }

    #[test]
    fn header_lines_without_colon_are_skipped() {
        let parsed = parse_request(b"GET / HTTP/1.1\r\nbogus line\r\nHost: x\r\n\r\n")
            .expect("parse");
        assert_eq!(parsed.header("host"), Some("x"));
        assert_eq!(parsed.headers.len(), 1);
    }

    #[test]
    fn build_url_joins_slashes() {
        assert_eq!(
            build_local_url("http://localhost:3003", "/status", None),
            "http://localhost:3003/status"
        );
        assert_eq!(
            build_local_url("http://localhost:3003/", "/status", None),
            "http://localhost:3003/status"
        );
        assert_eq!(
            build_local_url("http://localhost:3003", "status", None),
            "http://localhost:3003/status"
        );
        assert_eq!(
            build_local_url("http://localhost:3003", "/a", Some("q=1")),
            "http://localhost:3003/a?q=1"
        );
    }

    fn forwarder_with_services(services: &[(&str, &str)]) -> LocalForwarder {
        let mut config = AgentConfig::new("127.0.0.1:1", "token", "http://default.local");
        for (subdomain, url) in services {
            config
                .services
                .insert((*subdomain).to_string(), (*url).to_string());
        }
        LocalForwarder::new(&config, Arc::new(Metrics::default())).expect("forwarder")
    }

    #[test]
    fn routes_by_subdomain_prefix() {
        let forwarder = forwarder_with_services(&[
            ("api", "http://api.local"),
            ("api.v2", "http://api-v2.local"),
        ]);

        assert_eq!(forwarder.route(Some("api.example.com")), "http://api.local");
        assert_eq!(forwarder.route(Some("api")), "http://api.local");
        // Longest matching mapping wins.
        assert_eq!(
            forwarder.route(Some("api.v2.example.com")),
            "http://api-v2.local"
        );
        assert_eq!(forwarder.route(Some("web.example.com")), "http://default.local");
        assert_eq!(forwarder.route(None), "http://default.local");
        assert_eq!(forwarder.route(Some("")), "http://default.local");
        // A mapping must match a label boundary, not a bare prefix.
        assert_eq!(forwarder.route(Some("apiary.example.com")), "http://default.local");
    }
}
