use crate::error::{CapError, Result};
use crate::matcher::match_request;
use crate::model::ServerSpec;
use crate::recorder::{RequestRecorder, Sinks};
use crate::renderer::{render, RenderedResponse};
use crate::request::IncomingRequest;
use crate::tls::create_tls_acceptor;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Lifecycle of one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Stopped | InstanceState::Failed(_))
    }

    /// Past the start attempt, successful or not.
    pub fn is_settled(&self) -> bool {
        !matches!(self, InstanceState::Created | InstanceState::Starting)
    }
}

/// A bound socket, ready to accept.
pub struct BoundListener {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    local_addr: SocketAddr,
}

impl BoundListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// One configured server: its rules, its default response and its recorder.
pub struct ServerInstance {
    spec: ServerSpec,
    name: String,
    recorder: Arc<RequestRecorder>,
    state: watch::Sender<InstanceState>,
    local_addr: OnceLock<SocketAddr>,
    /// Pending request records.
    records: TaskTracker,
}

impl ServerInstance {
    pub fn new(spec: ServerSpec, recorder: RequestRecorder) -> Arc<Self> {
        let (state, _) = watch::channel(InstanceState::Created);
        Arc::new(Self {
            name: spec.name(),
            spec,
            recorder: Arc::new(recorder),
            state,
            local_addr: OnceLock::new(),
            records: TaskTracker::new(),
        })
    }

    /// Builds the recorder from the server's log policy, then the instance.
    pub fn from_spec(spec: ServerSpec, sinks: Arc<Sinks>) -> Result<Arc<Self>> {
        let mut recorder = RequestRecorder::new(
            &spec.base_url,
            spec.alias.clone(),
            spec.log_policy.clone(),
            sinks,
        )?;
        for (response_id, policy) in &spec.response_log_policies {
            recorder = recorder.with_response_policy(response_id.clone(), policy.clone())?;
        }
        Ok(Self::new(spec, recorder))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    pub fn state(&self) -> InstanceState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<InstanceState> {
        self.state.subscribe()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Answers one request: match, record in the background, render.
    pub async fn handle(&self, request: IncomingRequest) -> RenderedResponse {
        let rule = self
            .spec
            .base_url
            .strip_base(&request.path)
            .and_then(|path| match_request(&request, path, &self.spec.rules));

        let template = match rule {
            Some(rule) => {
                debug!(server = %self.name, rule = %rule.id, path = %request.path, "Request matched");
                Arc::clone(&rule.response)
            }
            None => {
                debug!(
                    server = %self.name,
                    method = %request.method,
                    path = %request.path,
                    "Unknown request, using default response"
                );
                Arc::clone(&self.spec.default_response)
            }
        };
        let rule_id = rule.map(|rule| rule.id.clone());
        let response_id = template.id.clone();

        let recorder = Arc::clone(&self.recorder);
        self.records.spawn_blocking(move || {
            recorder.record(&request, rule_id.as_deref(), &response_id)
        });

        let response = match render(&template).await {
            Ok(response) => response,
            Err(e) => {
                error!(server = %self.name, response = %template.id, error = %e, "Response rendering failed");
                RenderedResponse::from_error(&e)
            }
        };

        if let Some(delay) = template.delay {
            tokio::time::sleep(delay).await;
        }
        response
    }

    /// Waits for records already handed to the recorder.
    pub async fn flush_records(&self) {
        self.records.close();
        self.records.wait().await;
        self.records.reopen();
    }

    /// Binds the socket and loads TLS material. A failure leaves the instance `Failed`.
    pub async fn bind(&self) -> Result<BoundListener> {
        self.state.send_replace(InstanceState::Starting);
        match self.try_bind().await {
            Ok(bound) => {
                let _ = self.local_addr.set(bound.local_addr);
                Ok(bound)
            }
            Err(e) => {
                error!(server = %self.name, error = %e, "Server starting error");
                self.state.send_replace(InstanceState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn try_bind(&self) -> Result<BoundListener> {
        let tls = match &self.spec.tls {
            Some(paths) => {
                Some(create_tls_acceptor(paths).map_err(|e| CapError::listener(&self.name, e))?)
            }
            None => None,
        };

        let base_url = &self.spec.base_url;
        let listener = TcpListener::bind((base_url.host.as_str(), base_url.port))
            .await
            .map_err(|e| {
                CapError::listener(
                    &self.name,
                    format!("cannot bind {}: {}", base_url.authority(), e),
                )
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CapError::listener(&self.name, e))?;

        Ok(BoundListener {
            listener,
            tls,
            local_addr,
        })
    }

    /// Accepts connections until `shutdown` fires, then drains for at most `drain_timeout`.
    pub async fn serve(
        self: Arc<Self>,
        bound: BoundListener,
        shutdown: CancellationToken,
        drain_timeout: Duration,
    ) {
        let BoundListener {
            listener,
            tls,
            local_addr,
        } = bound;
        self.state.send_replace(InstanceState::Running);
        info!(
            server = %self.name,
            address = %local_addr,
            tls = tls.is_some(),
            "Server running on {}",
            self.spec.base_url
        );

        let connections = TaskTracker::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let instance = Arc::clone(&self);
                        let tls = tls.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(instance.serve_connection(stream, remote, tls, shutdown));
                    }
                    Err(e) => {
                        warn!(server = %self.name, error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }

        self.state.send_replace(InstanceState::Stopping);
        info!(server = %self.name, "Stopping server");
        drop(listener);

        connections.close();
        if tokio::time::timeout(drain_timeout, connections.wait())
            .await
            .is_err()
        {
            warn!(server = %self.name, "In-flight requests did not finish before the drain timeout");
        }
        self.records.close();
        if tokio::time::timeout(drain_timeout, self.records.wait())
            .await
            .is_err()
        {
            warn!(server = %self.name, "Pending request records dropped at shutdown");
        }

        self.state.send_replace(InstanceState::Stopped);
        info!(server = %self.name, "Server stopped");
    }

    /// Binds then serves; the whole lifecycle of one instance.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, drain_timeout: Duration) {
        if let Ok(bound) = self.bind().await {
            self.serve(bound, shutdown, drain_timeout).await;
        }
    }

    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        remote: SocketAddr,
        tls: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) {
        match tls {
            None => self.drive(TokioIo::new(stream), remote, shutdown).await,
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(stream) => self.drive(TokioIo::new(stream), remote, shutdown).await,
                Err(e) => {
                    debug!(server = %self.name, remote = %remote, error = %e, "TLS handshake failed")
                }
            },
        }
    }

    async fn drive<I>(self: Arc<Self>, io: I, remote: SocketAddr, shutdown: CancellationToken)
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let instance = Arc::clone(&self);
        let service = service_fn(move |req: Request<Incoming>| {
            let instance = Arc::clone(&instance);
            async move { Ok::<_, Infallible>(instance.respond(req, remote).await) }
        });

        let conn = http1::Builder::new().serve_connection(io, service);
        tokio::pin!(conn);
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(err) = result {
                    debug!(server = %self.name, remote = %remote, error = %err, "Error serving connection");
                }
            }
            _ = shutdown.cancelled() => {
                conn.as_mut().graceful_shutdown();
                if let Err(err) = conn.as_mut().await {
                    debug!(server = %self.name, remote = %remote, error = %err, "Error closing connection");
                }
            }
        }
    }

    async fn respond(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<Full<Bytes>> {
        match IncomingRequest::from_hyper(req, Some(remote)).await {
            Ok(request) => self.handle(request).await.into_hyper(),
            Err(e) => {
                warn!(server = %self.name, remote = %remote, error = %e, "Malformed request");
                RenderedResponse::from_error(&e).into_hyper()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapConfig;
    use crate::model::Blueprint;
    use hyper::{Method, StatusCode};
    use std::io::Write;

    fn instance(yaml: &str) -> Arc<ServerInstance> {
        let blueprint = Blueprint::build(&CapConfig::from_yaml(yaml).unwrap()).unwrap();
        let spec = blueprint.servers.into_iter().next().unwrap();
        ServerInstance::from_spec(spec, Sinks::with_console(std::io::sink())).unwrap()
    }

    fn request(method: Method, uri: &str) -> IncomingRequest {
        IncomingRequest::new(method, &uri.parse().unwrap())
    }

    const HEALTH: &str = r#"
servers:
  - base_url: http://127.0.0.1:0/api
    requests_ids: [health]
    default_response_id: fallback
requests:
  health:
    method: GET
    mapping: /health
    response_id: ok
responses:
  ok:
    status: 200
    body:
      data: '{"status":"ok"}'
  fallback:
    status: 400
    body:
      data: unknown request
"#;

    #[tokio::test]
    async fn test_health_scenario() {
        let server = instance(HEALTH);

        let response = server.handle(request(Method::GET, "/api/health")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(br#"{"status":"ok"}"#));

        let response = server.handle(request(Method::GET, "/api/health?x=1")).await;
        assert_eq!(response.status, StatusCode::OK);

        let response = server.handle(request(Method::POST, "/api/health")).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.body, Bytes::from_static(b"unknown request"));

        server.flush_records().await;
    }

    #[tokio::test]
    async fn test_requests_outside_base_path_get_default() {
        let server = instance(HEALTH);
        let response = server.handle(request(Method::GET, "/health")).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        let response = server.handle(request(Method::GET, "/apihealth")).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_body_file_fails_only_that_request() {
        let dir = tempfile::tempdir().unwrap();
        let fixture = dir.path().join("fixture.json");
        let yaml = format!(
            r#"
servers:
  - base_url: 127.0.0.1:0
    requests_ids: [broken, fine]
requests:
  broken:
    mapping: /broken
    response_id: from_file
  fine:
    mapping: /fine
    response_id: default
responses:
  default:
    body:
      data: fine
  from_file:
    body:
      file: {}
"#,
            fixture.display()
        );
        let server = instance(&yaml);

        let response = server.handle(request(Method::GET, "/broken")).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

        let response = server.handle(request(Method::GET, "/fine")).await;
        assert_eq!(response.status, StatusCode::OK);

        std::fs::File::create(&fixture)
            .unwrap()
            .write_all(b"{}")
            .unwrap();
        let response = server.handle(request(Method::GET, "/broken")).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn test_response_delay() {
        let server = instance(
            "servers:\n  - base_url: 127.0.0.1:0\nresponses:\n  default:\n    seconds_delay: 0.05\n",
        );
        let started = std::time::Instant::now();
        server.handle(request(Method::GET, "/")).await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let server = instance(HEALTH);
        assert_eq!(server.state(), InstanceState::Created);

        let bound = server.bind().await.unwrap();
        assert_eq!(server.state(), InstanceState::Starting);
        assert_eq!(server.local_addr(), Some(bound.local_addr()));

        let shutdown = CancellationToken::new();
        let mut states = server.subscribe();
        let task = tokio::spawn(Arc::clone(&server).serve(
            bound,
            shutdown.clone(),
            Duration::from_secs(1),
        ));
        states
            .wait_for(|s| *s == InstanceState::Running)
            .await
            .unwrap();

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(server.state(), InstanceState::Stopped);
    }

    #[tokio::test]
    async fn test_bad_certificate_fails_start() {
        let server = instance(
            "servers:\n  - base_url: https://127.0.0.1:0\n    ssl_config:\n      certfile: /nonexistent/cert.pem\n      keyfile: /nonexistent/key.pem\n",
        );
        let err = server.bind().await.err().unwrap();
        assert!(matches!(err, CapError::ListenerStart { .. }));
        assert!(matches!(server.state(), InstanceState::Failed(_)));
    }

    #[tokio::test]
    async fn test_port_in_use_fails_start() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = instance(&format!("servers:\n  - base_url: 127.0.0.1:{}\n", port));
        assert!(server.bind().await.is_err());
        assert!(server.state().is_terminal());
    }
}
