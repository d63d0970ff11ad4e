//! Turns response templates into concrete responses.
//!
//! Only configured headers are sent; content-length and friends are left to
//! the transport.

use crate::error::{CapError, Result};
use crate::model::{BodySource, ResponseCatalog, ResponseTemplate};
use bytes::Bytes;
use http::HeaderMap;
use http_body_util::Full;
use hyper::{Response, StatusCode};

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Resolves the body and headers of `template`.
///
/// File bodies are read on every call so fixtures can be edited while running.
pub async fn render(template: &ResponseTemplate) -> Result<RenderedResponse> {
    let body = match &template.body {
        BodySource::Inline(bytes) => bytes.clone(),
        BodySource::File(path) => tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|source| CapError::BodySource {
                path: path.clone(),
                source,
            })?,
    };

    let mut headers = HeaderMap::with_capacity(template.headers.len());
    for (name, value) in &template.headers {
        headers.append(name.clone(), value.clone());
    }

    Ok(RenderedResponse {
        status: template.status,
        headers,
        body,
    })
}

impl ResponseCatalog {
    pub async fn render(&self, id: &str) -> Result<RenderedResponse> {
        let template = self
            .get(id)
            .ok_or_else(|| CapError::ResponseResolution(id.to_string()))?;
        render(template).await
    }
}

impl RenderedResponse {
    /// Plain-text reply for a request that could not be served as configured.
    pub fn from_error(err: &CapError) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self {
            status: err.to_status_code(),
            headers,
            body: Bytes::from(err.to_string()),
        }
    }

    pub fn into_hyper(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
