//! Configuration document as written by the operator.
//!
//! These types mirror the YAML file one to one. Nothing here is validated;
//! [`crate::model::Blueprint::build`] turns a [`CapConfig`] into the typed,
//! cross-referenced form the servers run on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CapConfig {
    #[serde(default = "default_servers")]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub requests: HashMap<String, RequestConfig>,
    #[serde(default = "default_responses")]
    pub responses: HashMap<String, ResponseConfig>,
    #[serde(default)]
    pub request_log_config: RequestLogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub alias: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub ssl_config: Option<SslConfig>,
    /// Order is match precedence.
    #[serde(default)]
    pub requests_ids: Vec<String>,
    #[serde(default = "default_response_id")]
    pub default_response_id: String,
    pub request_log_config: Option<RequestLogConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SslConfig {
    pub keyfile: Option<PathBuf>,
    pub certfile: Option<PathBuf>,
    /// Accepted so the file parses; rejected when the blueprint is built.
    pub keyfile_password: Option<String>,
    pub ca_certs: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RequestConfig {
    #[serde(default = "default_mapping")]
    pub mapping: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, alias = "parameters")]
    pub query: Option<HashMap<String, String>>,
    pub body: Option<BodyConfig>,
    #[serde(default = "default_response_id")]
    pub response_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseConfig {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub headers: serde_yaml::Mapping,
    #[serde(default)]
    pub body: BodyConfig,
    pub seconds_delay: Option<f64>,
    /// Overrides the server's log settings for requests answered with this response.
    pub request_log_config: Option<RequestLogConfig>,
}

/// A body given either inline (`data`) or by file (`file`).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BodyConfig {
    pub file: Option<PathBuf>,
    pub data: Option<String>,
    pub data_encoding: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RequestLogConfig {
    pub headers_enabled: Option<bool>,
    pub body_enabled: Option<bool>,
    pub body_as_file: Option<bool>,
    pub body_files_folder: Option<PathBuf>,
    pub body_type: Option<BodyType>,
    pub body_encoding: Option<String>,
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    Text,
    Bytes,
    Auto,
}

impl RequestLogConfig {
    /// Fields set in `overrides` win over fields set in `self`.
    pub fn merged_with(&self, overrides: &RequestLogConfig) -> RequestLogConfig {
        RequestLogConfig {
            headers_enabled: overrides.headers_enabled.or(self.headers_enabled),
            body_enabled: overrides.body_enabled.or(self.body_enabled),
            body_as_file: overrides.body_as_file.or(self.body_as_file),
            body_files_folder: overrides
                .body_files_folder
                .clone()
                .or_else(|| self.body_files_folder.clone()),
            body_type: overrides.body_type.or(self.body_type),
            body_encoding: overrides
                .body_encoding
                .clone()
                .or_else(|| self.body_encoding.clone()),
            log_file: overrides.log_file.clone().or_else(|| self.log_file.clone()),
        }
    }
}

impl Default for CapConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            requests: HashMap::new(),
            responses: default_responses(),
            request_log_config: RequestLogConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            alias: None,
            base_url: default_base_url(),
            ssl_config: None,
            requests_ids: Vec::new(),
            default_response_id: default_response_id(),
            request_log_config: None,
        }
    }
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            status: default_status(),
            headers: serde_yaml::Mapping::new(),
            body: BodyConfig::default(),
            seconds_delay: None,
            request_log_config: None,
        }
    }
}

impl CapConfig {
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_yaml(&content)?)
    }
}

fn default_servers() -> Vec<ServerConfig> {
    vec![ServerConfig::default()]
}

fn default_responses() -> HashMap<String, ResponseConfig> {
    HashMap::from([(default_response_id(), ResponseConfig::default())])
}

fn default_base_url() -> String {
    "http://0.0.0.0:80/api".to_string()
}

fn default_response_id() -> String {
    "default".to_string()
}

fn default_mapping() -> String {
    "/".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_status() -> u16 {
    200
}
