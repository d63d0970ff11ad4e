use super::lookup_encoding;
use crate::config::{BodyType, RequestLogConfig};
use crate::error::{CapError, Result};
use encoding_rs::{Encoding, UTF_8};
use std::path::PathBuf;

/// What gets captured for each request of one server, and where it goes.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLogPolicy {
    pub headers_enabled: bool,
    pub body_enabled: bool,
    pub body_output: BodyOutput,
    /// Extra sink next to the console, which is always written.
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BodyOutput {
    Inline(BodyRendering),
    File { folder: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BodyRendering {
    Text(&'static Encoding),
    Bytes,
    /// Text when the payload looks textual, bytes otherwise.
    Auto(&'static Encoding),
}

impl Default for RequestLogPolicy {
    fn default() -> Self {
        Self {
            headers_enabled: true,
            body_enabled: true,
            body_output: BodyOutput::Inline(BodyRendering::Auto(UTF_8)),
            log_file: None,
        }
    }
}

impl RequestLogPolicy {
    /// Unset fields fall back to the built-in defaults.
    pub fn from_config(config: &RequestLogConfig) -> Result<Self> {
        let defaults = Self::default();
        let encoding = match &config.body_encoding {
            Some(label) => lookup_encoding(label, "request_log_config.body_encoding")?,
            None => UTF_8,
        };

        let body_output = if config.body_as_file.unwrap_or(false) {
            let folder = config.body_files_folder.clone().ok_or_else(|| {
                CapError::config(
                    "request_log_config.body_files_folder is required when body_as_file is enabled",
                )
            })?;
            BodyOutput::File { folder }
        } else {
            BodyOutput::Inline(match config.body_type.unwrap_or(BodyType::Auto) {
                BodyType::Text => BodyRendering::Text(encoding),
                BodyType::Bytes => BodyRendering::Bytes,
                BodyType::Auto => BodyRendering::Auto(encoding),
            })
        };

        Ok(Self {
            headers_enabled: config.headers_enabled.unwrap_or(defaults.headers_enabled),
            body_enabled: config.body_enabled.unwrap_or(defaults.body_enabled),
            body_output,
            log_file: config.log_file.clone(),
        })
    }

    pub fn body_files_folder(&self) -> Option<&PathBuf> {
        match &self.body_output {
            BodyOutput::File { folder } if self.body_enabled => Some(folder),
            _ => None,
        }
    }
}
