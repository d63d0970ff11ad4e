//! Validated, immutable form of the configuration.
//!
//! Every id reference is resolved to an `Arc` handle here, once, so the
//! request path never looks anything up by name.

mod base_url;
mod catalog;
mod policy;
mod rules;

pub use base_url::{BaseUrl, Scheme};
pub use catalog::{BodySource, ResponseCatalog, ResponseTemplate};
pub use policy::{BodyOutput, BodyRendering, RequestLogPolicy};
pub use rules::{BodyMatcher, RequestRule, RequestRuleSet};

use crate::config::{CapConfig, ServerConfig};
use crate::error::{CapError, Result};
use encoding_rs::Encoding;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Everything one listener needs, with references already resolved.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub alias: Option<String>,
    pub base_url: BaseUrl,
    pub tls: Option<TlsPaths>,
    /// First matching rule wins.
    pub rules: Vec<Arc<RequestRule>>,
    pub default_response: Arc<ResponseTemplate>,
    pub log_policy: RequestLogPolicy,
    /// Policies of reachable responses that carry their own log settings, by response id.
    pub response_log_policies: HashMap<String, RequestLogPolicy>,
}

impl ServerSpec {
    /// Alias when configured, base url otherwise.
    pub fn name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| self.base_url.to_string())
    }
}

#[derive(Debug)]
pub struct Blueprint {
    pub responses: Arc<ResponseCatalog>,
    pub requests: Arc<RequestRuleSet>,
    pub servers: Vec<ServerSpec>,
}

impl Blueprint {
    pub fn build(config: &CapConfig) -> Result<Self> {
        if config.servers.is_empty() {
            return Err(CapError::config("At least one server must be configured"));
        }

        let responses = Arc::new(ResponseCatalog::from_config(&config.responses)?);
        let requests = Arc::new(RequestRuleSet::from_config(&config.requests, &responses)?);

        let mut listeners = HashSet::new();
        let mut servers = Vec::with_capacity(config.servers.len());
        for (index, server) in config.servers.iter().enumerate() {
            let spec = build_server(index, server, config, &requests, &responses)?;
            // Port 0 asks the OS for a free port, so it never collides.
            if spec.base_url.port != 0 && !listeners.insert(spec.base_url.authority()) {
                return Err(CapError::config(format!(
                    "servers[{}]: '{}' is already used by another server",
                    index,
                    spec.base_url.authority()
                )));
            }
            servers.push(spec);
        }

        Ok(Self {
            responses,
            requests,
            servers,
        })
    }
}

fn build_server(
    index: usize,
    server: &ServerConfig,
    config: &CapConfig,
    requests: &RequestRuleSet,
    responses: &ResponseCatalog,
) -> Result<ServerSpec> {
    let referrer = match &server.alias {
        Some(alias) => format!("servers[{}] ({})", index, alias),
        None => format!("servers[{}]", index),
    };

    let base_url = BaseUrl::parse(&server.base_url)
        .map_err(|e| CapError::config(format!("{}: {}", referrer, e)))?;

    if let Some(ssl) = &server.ssl_config {
        if ssl.keyfile_password.is_some() {
            return Err(CapError::config(format!(
                "{}: ssl_config.keyfile_password is not supported, use an unencrypted key",
                referrer
            )));
        }
        if ssl.ca_certs.is_some() {
            return Err(CapError::config(format!(
                "{}: ssl_config.ca_certs is not supported",
                referrer
            )));
        }
    }

    let tls = match &server.ssl_config {
        None if base_url.scheme == Scheme::Https => {
            return Err(CapError::config(format!(
                "{}: required SSL configuration for schema 'https'",
                referrer
            )))
        }
        None => None,
        Some(ssl) => match (&ssl.certfile, &ssl.keyfile) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => {
                return Err(CapError::config(format!(
                    "{}: ssl_config needs both certfile and keyfile",
                    referrer
                )))
            }
        },
    };

    let log_config = match &server.request_log_config {
        Some(overrides) => config.request_log_config.merged_with(overrides),
        None => config.request_log_config.clone(),
    };
    let log_policy = RequestLogPolicy::from_config(&log_config)
        .map_err(|e| CapError::config(format!("{}: {}", referrer, e)))?;

    let rules = requests.resolve_ordered(&server.requests_ids, &referrer)?;
    let default_response = responses.resolve(&server.default_response_id, &referrer)?;

    // Response settings win over server settings, which win over global ones.
    let mut response_log_policies = HashMap::new();
    let reachable = rules
        .iter()
        .map(|rule| &rule.response)
        .chain(std::iter::once(&default_response));
    for template in reachable {
        let Some(overrides) = &template.log_overrides else {
            continue;
        };
        if response_log_policies.contains_key(&template.id) {
            continue;
        }
        let policy = RequestLogPolicy::from_config(&log_config.merged_with(overrides))
            .map_err(|e| CapError::config(format!("{}, response '{}': {}", referrer, template.id, e)))?;
        response_log_policies.insert(template.id.clone(), policy);
    }

    Ok(ServerSpec {
        alias: server.alias.clone(),
        base_url,
        tls,
        rules,
        default_response,
        log_policy,
        response_log_policies,
    })
}

/// Looks up a text codec by its WHATWG label.
pub(crate) fn lookup_encoding(label: &str, field: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| CapError::config(format!("{}: unknown encoding type '{}'", field, label)))
}
