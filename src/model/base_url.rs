use crate::error::{CapError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static BASE_URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((\w+)://)?([\w.]+)(:(\d{1,5}))?((/\w+)*)$").expect("valid base url pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// `[scheme://]host[:port][/base/path]` of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Empty, or `/segment(/segment)*` without a trailing slash.
    pub base_path: String,
}

impl BaseUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let captures = BASE_URL_PATTERN
            .captures(url)
            .ok_or_else(|| CapError::config(format!("Invalid server base url: '{}'", url)))?;

        let scheme = match captures.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
            None => Scheme::Http,
            Some(raw) if raw == "http" => Scheme::Http,
            Some(raw) if raw == "https" => Scheme::Https,
            Some(raw) => {
                return Err(CapError::config(format!(
                    "Invalid schema value '{}' in base url '{}'. Allowed values: 'http', 'https'",
                    raw, url
                )))
            }
        };

        let port = match captures.get(5) {
            None => scheme.default_port(),
            Some(raw) => raw.as_str().parse::<u16>().map_err(|_| {
                CapError::config(format!(
                    "Port value '{}' is not from range 0-65535",
                    raw.as_str()
                ))
            })?,
        };

        Ok(Self {
            scheme,
            host: captures[3].to_string(),
            port,
            base_path: captures.get(6).map(|m| m.as_str()).unwrap_or("").to_string(),
        })
    }

    /// `host:port`, the listener identity.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Path relative to the base path, or `None` when the request lies outside it.
    pub fn strip_base<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.base_path.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.base_path.as_str())?;
        if rest.is_empty() {
            Some("/")
        } else if rest.starts_with('/') {
            Some(rest)
        } else {
            None
        }
    }
}

impl fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}{}",
            self.scheme.as_str(),
            self.host,
            self.port,
            self.base_path
        )
    }
}
