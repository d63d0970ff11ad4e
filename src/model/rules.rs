use super::catalog::{encode_data, ResponseCatalog, ResponseTemplate};
use super::lookup_encoding;
use crate::config::{BodyConfig, RequestConfig};
use crate::error::{CapError, Result};
use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use hyper::Method;
use std::collections::HashMap;
use std::sync::Arc;

const METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "HEAD", "TRACE", "CONNECT",
];

/// Constraint on the request body.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyMatcher {
    Any,
    /// Request body decoded with `encoding` must equal `text`.
    Text {
        text: String,
        encoding: &'static Encoding,
    },
    Bytes(Bytes),
}

#[derive(Debug, Clone)]
pub struct RequestRule {
    pub id: String,
    pub method: Method,
    pub mapping: String,
    pub query: Vec<(String, String)>,
    pub body: BodyMatcher,
    pub response: Arc<ResponseTemplate>,
}

/// Every configured request rule, keyed by id.
#[derive(Debug, Default)]
pub struct RequestRuleSet {
    rules: HashMap<String, Arc<RequestRule>>,
}

impl RequestRule {
    pub fn from_config(id: &str, config: &RequestConfig, catalog: &ResponseCatalog) -> Result<Self> {
        let method = parse_method(&config.method).ok_or_else(|| {
            CapError::config(format!(
                "Request '{}': unknown method '{}'. Allowed values: {}",
                id,
                config.method,
                METHODS.join(", ")
            ))
        })?;

        let mut query: Vec<(String, String)> = config
            .query
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        query.sort();

        let body = match &config.body {
            None => BodyMatcher::Any,
            Some(body) => BodyMatcher::from_config(body, &format!("requests.{}.body", id))?,
        };

        Ok(Self {
            id: id.to_string(),
            method,
            mapping: config.mapping.clone(),
            query,
            body,
            response: catalog.resolve(&config.response_id, &format!("requests.{}", id))?,
        })
    }
}

fn parse_method(raw: &str) -> Option<Method> {
    let upper = raw.to_ascii_uppercase();
    if !METHODS.contains(&upper.as_str()) {
        return None;
    }
    Method::from_bytes(upper.as_bytes()).ok()
}

impl BodyMatcher {
    fn from_config(config: &BodyConfig, field: &str) -> Result<Self> {
        match (&config.file, &config.data) {
            (Some(_), Some(_)) => Err(CapError::config(format!(
                "{}: only one of 'file' and 'data' may be set",
                field
            ))),
            // Fixture files for matching are read once, here.
            (Some(path), None) => std::fs::read(path)
                .map(|bytes| BodyMatcher::Bytes(bytes.into()))
                .map_err(|e| {
                    CapError::config(format!("{}: cannot read '{}': {}", field, path.display(), e))
                }),
            (None, Some(data)) => match &config.data_encoding {
                None => Ok(BodyMatcher::Text {
                    text: data.clone(),
                    encoding: UTF_8,
                }),
                Some(label) => {
                    let encoding = lookup_encoding(label, &format!("{}.data_encoding", field))?;
                    // Round-trip so unrepresentable text is rejected at load.
                    encode_data(data, Some(label), field)?;
                    Ok(BodyMatcher::Text {
                        text: data.clone(),
                        encoding,
                    })
                }
            },
            (None, None) => Ok(BodyMatcher::Any),
        }
    }
}

impl RequestRuleSet {
    pub fn from_config(
        requests: &HashMap<String, RequestConfig>,
        catalog: &ResponseCatalog,
    ) -> Result<Self> {
        let mut rules = HashMap::with_capacity(requests.len());
        for (id, config) in requests {
            rules.insert(id.clone(), Arc::new(RequestRule::from_config(id, config, catalog)?));
        }
        Ok(Self { rules })
    }

    pub fn get(&self, id: &str) -> Option<&Arc<RequestRule>> {
        self.rules.get(id)
    }

    /// Resolves a server's ordered id list, keeping its order.
    pub fn resolve_ordered(&self, ids: &[String], referrer: &str) -> Result<Vec<Arc<RequestRule>>> {
        let missing: Vec<&str> = ids
            .iter()
            .filter(|id| !self.rules.contains_key(id.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(CapError::config(format!(
                "{}: not described requests: {}",
                referrer,
                missing.join(", ")
            )));
        }
        Ok(ids.iter().map(|id| Arc::clone(&self.rules[id.as_str()])).collect())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseConfig;
    use std::io::Write;

    fn catalog() -> ResponseCatalog {
        ResponseCatalog::from_config(&HashMap::from([(
            "ok".to_string(),
            ResponseConfig::default(),
        )]))
        .unwrap()
    }

    fn request(yaml: &str) -> RequestConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_method_is_case_insensitive_in_config() {
        let rule =
            RequestRule::from_config("r", &request("method: post\nresponse_id: ok"), &catalog())
                .unwrap();
        assert_eq!(rule.method, Method::POST);

        let err = RequestRule::from_config("r", &request("method: FETCH\nresponse_id: ok"), &catalog())
            .unwrap_err();
        assert!(err.to_string().contains("FETCH"));
    }

    #[test]
    fn test_dangling_response_id() {
        let err = RequestRule::from_config("r", &request("response_id: nope"), &catalog())
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_body_matcher_variants() {
        let rule = RequestRule::from_config("r", &request("response_id: ok"), &catalog()).unwrap();
        assert_eq!(rule.body, BodyMatcher::Any);

        let rule = RequestRule::from_config(
            "r",
            &request("response_id: ok\nbody:\n  data: ping\n"),
            &catalog(),
        )
        .unwrap();
        assert_eq!(
            rule.body,
            BodyMatcher::Text {
                text: "ping".to_string(),
                encoding: UTF_8
            }
        );

        let mut fixture = tempfile::NamedTempFile::new().unwrap();
        fixture.write_all(&[0, 159, 146, 150]).unwrap();
        let yaml = format!(
            "response_id: ok\nbody:\n  file: {}\n",
            fixture.path().display()
        );
        let rule = RequestRule::from_config("r", &request(&yaml), &catalog()).unwrap();
        assert_eq!(rule.body, BodyMatcher::Bytes(Bytes::from_static(&[0, 159, 146, 150])));
    }

    #[test]
    fn test_missing_body_fixture_is_config_error() {
        let err = RequestRule::from_config(
            "r",
            &request("response_id: ok\nbody:\n  file: /nonexistent/fixture.bin\n"),
            &catalog(),
        )
        .unwrap_err();
        assert!(matches!(err, CapError::ConfigValidation(_)));
    }

    #[test]
    fn test_resolve_ordered_keeps_order_and_reports_missing() {
        let requests = HashMap::from([
            ("a".to_string(), request("response_id: ok")),
            ("b".to_string(), request("response_id: ok")),
        ]);
        let set = RequestRuleSet::from_config(&requests, &catalog()).unwrap();

        let ids = vec!["b".to_string(), "a".to_string()];
        let ordered = set.resolve_ordered(&ids, "servers[0]").unwrap();
        assert_eq!(ordered[0].id, "b");
        assert_eq!(ordered[1].id, "a");

        let ids = vec!["a".to_string(), "zzz".to_string()];
        let err = set.resolve_ordered(&ids, "servers[0]").unwrap_err();
        assert!(err.to_string().contains("zzz"));
    }
}
