use super::lookup_encoding;
use crate::config::{BodyConfig, RequestLogConfig, ResponseConfig};
use crate::error::{CapError, Result};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use hyper::StatusCode;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Where a response body comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum BodySource {
    Inline(Bytes),
    /// Read in full on every render.
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct ResponseTemplate {
    pub id: String,
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: BodySource,
    pub delay: Option<Duration>,
    /// Log settings that win over the server's ones for requests answered with this response.
    pub log_overrides: Option<RequestLogConfig>,
}

/// Every configured response, keyed by id.
#[derive(Debug, Default)]
pub struct ResponseCatalog {
    templates: HashMap<String, Arc<ResponseTemplate>>,
}

impl ResponseTemplate {
    pub fn from_config(id: &str, config: &ResponseConfig) -> Result<Self> {
        if !(100..=599).contains(&config.status) {
            return Err(CapError::config(format!(
                "Response '{}': status {} is not from range 100-599",
                id, config.status
            )));
        }
        let status = StatusCode::from_u16(config.status)
            .map_err(|e| CapError::config(format!("Response '{}': {}", id, e)))?;

        let mut headers = Vec::with_capacity(config.headers.len());
        for (name, value) in &config.headers {
            let (Some(name), Some(value)) = (yaml_scalar(name), yaml_scalar(value)) else {
                return Err(CapError::config(format!(
                    "Response '{}': header names and values must be scalars",
                    id
                )));
            };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                CapError::config(format!("Response '{}': invalid header name '{}'", id, name))
            })?;
            let header_value = HeaderValue::from_str(&value).map_err(|_| {
                CapError::config(format!(
                    "Response '{}': invalid value for header '{}'",
                    id, name
                ))
            })?;
            headers.push((header_name, header_value));
        }

        let delay = config
            .seconds_delay
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|e| {
                    CapError::config(format!(
                        "Response '{}': invalid seconds_delay {}: {}",
                        id, secs, e
                    ))
                })
            })
            .transpose()?;

        if let Some(label) = config
            .request_log_config
            .as_ref()
            .and_then(|overrides| overrides.body_encoding.as_deref())
        {
            lookup_encoding(
                label,
                &format!("responses.{}.request_log_config.body_encoding", id),
            )?;
        }

        Ok(Self {
            id: id.to_string(),
            status,
            headers,
            body: BodySource::from_config(&config.body, &format!("responses.{}.body", id))?,
            delay,
            log_overrides: config.request_log_config.clone(),
        })
    }
}

impl BodySource {
    fn from_config(config: &BodyConfig, field: &str) -> Result<Self> {
        match (&config.file, &config.data) {
            (Some(_), Some(_)) => Err(CapError::config(format!(
                "{}: only one of 'file' and 'data' may be set",
                field
            ))),
            (Some(path), None) => Ok(BodySource::File(path.clone())),
            (None, Some(data)) => Ok(BodySource::Inline(encode_data(
                data,
                config.data_encoding.as_deref(),
                field,
            )?)),
            (None, None) => Ok(BodySource::Inline(Bytes::new())),
        }
    }
}

/// Encodes configured text with `data_encoding`, UTF-8 when unset.
pub(crate) fn encode_data(data: &str, encoding: Option<&str>, field: &str) -> Result<Bytes> {
    let Some(label) = encoding else {
        return Ok(Bytes::copy_from_slice(data.as_bytes()));
    };
    let encoding = lookup_encoding(label, &format!("{}.data_encoding", field))?;
    let (encoded, _, had_errors) = encoding.encode(data);
    if had_errors {
        return Err(CapError::config(format!(
            "{}: data is not representable in '{}'",
            field,
            encoding.name()
        )));
    }
    Ok(Bytes::copy_from_slice(&encoded))
}

fn yaml_scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl ResponseCatalog {
    pub fn from_config(responses: &HashMap<String, ResponseConfig>) -> Result<Self> {
        let mut templates = HashMap::with_capacity(responses.len());
        for (id, config) in responses {
            templates.insert(id.clone(), Arc::new(ResponseTemplate::from_config(id, config)?));
        }
        Ok(Self { templates })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<ResponseTemplate>> {
        self.templates.get(id)
    }

    /// Resolves a configured reference, naming the referrer when it dangles.
    pub fn resolve(&self, id: &str, referrer: &str) -> Result<Arc<ResponseTemplate>> {
        self.get(id).cloned().ok_or_else(|| {
            CapError::config(format!("{}: not described response '{}'", referrer, id))
        })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
