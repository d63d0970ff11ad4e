//! Request capture.
//!
//! Every served request becomes one YAML document written to the console and,
//! when configured, to a log file. Sinks are shared by all servers and each
//! one is guarded by its own lock, so a record is always written whole.
//! Recording problems are reported through `tracing` and never reach the
//! HTTP client.

use crate::error::{CapError, Result};
use crate::model::{BaseUrl, BodyOutput, BodyRendering, RequestLogPolicy};
use crate::request::IncomingRequest;
use chrono::Local;
use encoding_rs::Encoding;
use parking_lot::Mutex;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Output handles shared by every recorder in the process.
pub struct Sinks {
    console: Mutex<Box<dyn Write + Send>>,
    files: Mutex<HashMap<PathBuf, Arc<FileSink>>>,
    /// Suffix for body file names, unique for the process lifetime.
    sequence: AtomicU64,
}

/// An append-mode log file. Dropped to `None` after a write failure.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl Sinks {
    pub fn stdout() -> Arc<Self> {
        Self::with_console(io::stdout())
    }

    pub fn with_console(writer: impl Write + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            console: Mutex::new(Box::new(writer)),
            files: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        })
    }

    /// Opens `path` once; later callers share the same handle.
    pub fn file_sink(&self, path: &Path) -> Result<Arc<FileSink>> {
        let mut files = self.files.lock();
        if let Some(sink) = files.get(path) {
            return Ok(Arc::clone(sink));
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                CapError::recording(format!("cannot open log file '{}': {}", path.display(), e))
            })?;
        let sink = Arc::new(FileSink {
            path: path.to_path_buf(),
            file: Mutex::new(Some(file)),
        });
        files.insert(path.to_path_buf(), Arc::clone(&sink));
        Ok(sink)
    }

    fn write_console(&self, record: &str) {
        let mut console = self.console.lock();
        if let Err(e) = console
            .write_all(record.as_bytes())
            .and_then(|_| console.flush())
        {
            error!(error = %e, "Request logging error: console write failed");
        }
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub fn flush(&self) {
        if let Err(e) = self.console.lock().flush() {
            warn!(error = %e, "Console sink flush failed");
        }
        for sink in self.files.lock().values() {
            if let Some(file) = sink.file.lock().as_mut() {
                if let Err(e) = file.flush() {
                    warn!(path = %sink.path.display(), error = %e, "Log file flush failed");
                }
            }
        }
    }
}

impl FileSink {
    fn write(&self, record: &str) {
        let mut guard = self.file.lock();
        let Some(file) = guard.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(record.as_bytes()).and_then(|_| file.flush()) {
            error!(
                path = %self.path.display(),
                error = %e,
                "Request logging error: log file write failed, continuing on console only"
            );
            *guard = None;
        }
    }
}

/// A policy with the log file it writes to.
struct Route {
    policy: RequestLogPolicy,
    log_file: Option<Arc<FileSink>>,
}

impl Route {
    /// Prepares the body files folder and opens the log file.
    fn open(policy: RequestLogPolicy, sinks: &Sinks) -> Result<Self> {
        if let Some(folder) = policy.body_files_folder() {
            prepare_folder(folder)?;
        }

        let log_file = match &policy.log_file {
            None => None,
            Some(path) => match sinks.file_sink(path) {
                Ok(sink) => Some(sink),
                Err(e) => {
                    error!(error = %e, "Request log file disabled, logging to console only");
                    None
                }
            },
        };
        Ok(Self { policy, log_file })
    }
}

/// Captures requests of one server according to its [`RequestLogPolicy`],
/// or the policy of the response that answered them when it has one.
pub struct RequestRecorder {
    server_url: String,
    alias: Option<String>,
    default: Route,
    by_response: HashMap<String, Route>,
    sinks: Arc<Sinks>,
}

impl RequestRecorder {
    /// A folder that cannot be created or written is a [`CapError::Storage`];
    /// a log file that cannot be opened only degrades to console output.
    pub fn new(
        base_url: &BaseUrl,
        alias: Option<String>,
        policy: RequestLogPolicy,
        sinks: Arc<Sinks>,
    ) -> Result<Self> {
        Ok(Self {
            server_url: format!("{}://{}", base_url.scheme.as_str(), base_url.authority()),
            alias,
            default: Route::open(policy, &sinks)?,
            by_response: HashMap::new(),
            sinks,
        })
    }

    /// Uses `policy` for requests answered with `response_id`.
    pub fn with_response_policy(
        mut self,
        response_id: impl Into<String>,
        policy: RequestLogPolicy,
    ) -> Result<Self> {
        let route = Route::open(policy, &self.sinks)?;
        self.by_response.insert(response_id.into(), route);
        Ok(self)
    }

    fn route(&self, response_id: &str) -> &Route {
        self.by_response.get(response_id).unwrap_or(&self.default)
    }

    pub fn policy_for(&self, response_id: &str) -> &RequestLogPolicy {
        &self.route(response_id).policy
    }

    /// Writes one record for `request`; `rule` is the matched rule id, if any,
    /// and `response_id` the response sent back.
    pub fn record(&self, request: &IncomingRequest, rule: Option<&str>, response_id: &str) {
        let route = self.route(response_id);
        let record = match self.build_record(&route.policy, request, rule) {
            Ok(record) => record,
            Err(e) => {
                error!(server = %self.server_url, error = %e, "Request logging error");
                return;
            }
        };
        self.sinks.write_console(&record);
        if let Some(file) = &route.log_file {
            file.write(&record);
        }
    }

    fn build_record(
        &self,
        policy: &RequestLogPolicy,
        request: &IncomingRequest,
        rule: Option<&str>,
    ) -> Result<String> {
        let mut server = Mapping::new();
        server.insert("url".into(), self.server_url.clone().into());
        if let Some(alias) = &self.alias {
            server.insert("alias".into(), alias.clone().into());
        }

        let mut entry = Mapping::new();
        entry.insert("server".into(), Value::Mapping(server));
        if let Some(remote) = request.remote_addr {
            entry.insert("client".into(), remote.to_string().into());
        }
        entry.insert("method".into(), request.method.as_str().into());
        entry.insert("mapping".into(), request.path.clone().into());
        entry.insert(
            "parameters".into(),
            Value::Mapping(pairs_to_mapping(
                request.query.iter().map(|(k, v)| (k.clone(), v.clone())),
            )),
        );
        entry.insert(
            "rule".into(),
            rule.map(Value::from).unwrap_or(Value::Null),
        );

        if policy.headers_enabled {
            let headers = request.headers.iter().map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            });
            entry.insert("headers".into(), Value::Mapping(pairs_to_mapping(headers)));
        }

        if policy.body_enabled {
            match &policy.body_output {
                BodyOutput::File { folder } => match self.write_body_file(folder, &request.body) {
                    Ok(path) => {
                        entry.insert("body_file".into(), path.display().to_string().into());
                    }
                    Err(e) => {
                        error!(server = %self.server_url, error = %e, "Request logging error");
                        entry.insert("body_file".into(), Value::Null);
                    }
                },
                BodyOutput::Inline(rendering) => {
                    entry.insert(
                        "body".into(),
                        render_body(*rendering, request.content_type(), &request.body).into(),
                    );
                }
            }
        }

        let mut document = Mapping::new();
        document.insert(
            Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string().into(),
            Value::Mapping(entry),
        );
        let text = serde_yaml::to_string(&document)
            .map_err(|e| CapError::recording(format!("record formatting failed: {}", e)))?;
        Ok(format!("---\n{}", text))
    }

    /// One new file per request; `create_new` refuses to overwrite.
    fn write_body_file(&self, folder: &Path, body: &[u8]) -> Result<PathBuf> {
        let name = format!(
            "{}_{}.body",
            Local::now().format("%Y%m%dT%H%M%S%.6f"),
            self.sinks.next_sequence()
        );
        let path = folder.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| CapError::Storage {
                path: path.clone(),
                source,
            })?;
        file.write_all(body).map_err(|source| CapError::Storage {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// Creates `folder` and checks that a file can actually be created in it.
fn prepare_folder(folder: &Path) -> Result<()> {
    let storage_error = |source| CapError::Storage {
        path: folder.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(folder).map_err(storage_error)?;

    let check = folder.join(format!(".cap-write-check-{}", std::process::id()));
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&check)
        .map_err(storage_error)?;
    std::fs::remove_file(&check).map_err(storage_error)?;
    Ok(())
}

/// Repeated keys become sequences.
fn pairs_to_mapping(pairs: impl Iterator<Item = (String, String)>) -> Mapping {
    let mut mapping = Mapping::new();
    for (key, value) in pairs {
        let key = Value::from(key);
        match mapping.get_mut(&key) {
            None => {
                mapping.insert(key, value.into());
            }
            Some(Value::Sequence(values)) => values.push(value.into()),
            Some(existing) => {
                let first = std::mem::take(existing);
                *existing = Value::Sequence(vec![first, value.into()]);
            }
        }
    }
    mapping
}

fn render_body(rendering: BodyRendering, content_type: Option<&str>, body: &[u8]) -> String {
    match rendering {
        BodyRendering::Text(encoding) => decode_text(encoding, body),
        BodyRendering::Bytes => to_hex(body),
        BodyRendering::Auto(encoding) => {
            if is_textual(content_type, encoding, body) {
                decode_text(encoding, body)
            } else {
                to_hex(body)
            }
        }
    }
}

fn decode_text(encoding: &'static Encoding, body: &[u8]) -> String {
    match encoding.decode_without_bom_handling_and_without_replacement(body) {
        Some(text) => text.into_owned(),
        None => format!("<undecodable {} bytes as {}>", body.len(), encoding.name()),
    }
}

fn is_textual(content_type: Option<&str>, encoding: &'static Encoding, body: &[u8]) -> bool {
    match content_type.and_then(|ct| ct.parse::<mime::Mime>().ok()) {
        Some(media) => {
            media.type_() == mime::TEXT
                || media.subtype() == mime::JSON
                || media.suffix() == Some(mime::JSON)
                || media.subtype() == mime::XML
                || media.suffix() == Some(mime::XML)
                || media.subtype() == mime::WWW_FORM_URLENCODED
                || media.subtype() == mime::JAVASCRIPT
        }
        None => encoding
            .decode_without_bom_handling_and_without_replacement(body)
            .is_some(),
    }
}

fn to_hex(body: &[u8]) -> String {
    let mut out = String::with_capacity(body.len() * 2);
    for byte in body {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
