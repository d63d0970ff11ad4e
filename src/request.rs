use crate::error::Result;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Request};
use std::net::SocketAddr;

/// A fully read incoming request, as seen by matching and recording.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    /// Percent-decoded path.
    pub path: String,
    /// Decoded query pairs in arrival order; keys may repeat.
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl IncomingRequest {
    pub fn new(method: Method, uri: &Uri) -> Self {
        Self {
            method,
            path: decode_path(uri.path()),
            query: uri.query().map(parse_query).unwrap_or_default(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    /// Reads the whole body off the connection.
    pub async fn from_hyper(req: Request<Incoming>, remote_addr: Option<SocketAddr>) -> Result<Self> {
        let (parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        let mut request = Self::new(parts.method, &parts.uri);
        request.headers = parts.headers;
        request.body = body;
        request.remote_addr = remote_addr;
        Ok(request)
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .append(HeaderName::from_static(name), HeaderValue::from_static(value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn query_values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.query
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Invalid UTF-8 after decoding is replaced, never rejected.
fn decode_path(raw: &str) -> String {
    match urlencoding::decode(raw) {
        Ok(path) => path.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(raw.as_bytes())).into_owned(),
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
