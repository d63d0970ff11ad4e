use bytes::Bytes;
use cap::prelude::*;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

async fn send(addr: SocketAddr, method: Method, uri: &str, body: &'static str) -> (StatusCode, Bytes) {
    let stream = TcpStream::connect(addr).await.unwrap();
    exchange(stream, addr, method, uri, body).await
}

/// Connects over TLS trusting only the test CA.
async fn send_tls(addr: SocketAddr, uri: &str) -> (StatusCode, Bytes) {
    let mut roots = rustls::RootCertStore::empty();
    let ca = File::open(fixtures().join("ca.pem")).unwrap();
    for cert in rustls_pemfile::certs(&mut BufReader::new(ca)) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();

    let stream = TcpStream::connect(addr).await.unwrap();
    let stream = TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap();
    exchange(stream, addr, Method::GET, uri, "").await
}

async fn exchange<S>(
    stream: S,
    addr: SocketAddr,
    method: Method,
    uri: &str,
    body: &'static str,
) -> (StatusCode, Bytes)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", addr.to_string())
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

async fn start(yaml: &str) -> Supervisor {
    let config = CapConfig::from_yaml(yaml).unwrap();
    let blueprint = Blueprint::build(&config).unwrap();
    Supervisor::start(
        &blueprint,
        Sinks::with_console(std::io::sink()),
        Duration::from_secs(2),
    )
    .await
}

fn config(log_file: &Path) -> String {
    format!(
        r#"
servers:
  - alias: api
    base_url: http://127.0.0.1:0/api
    requests_ids: [health, create]
    default_response_id: fallback
  - alias: broken
    base_url: https://127.0.0.1:0
    default_response_id: fallback
    ssl_config:
      certfile: /nonexistent/cap/cert.pem
      keyfile: /nonexistent/cap/key.pem
requests:
  health:
    method: GET
    mapping: /health
    response_id: ok
  create:
    method: POST
    mapping: /items
    body:
      data: '{{"name":"a"}}'
    response_id: created
responses:
  ok:
    headers:
      Content-Type: application/json
    body:
      data: '{{"status":"ok"}}'
  created:
    status: 201
    body:
      file: /nonexistent/cap/created.json
  fallback:
    status: 404
    body:
      data: not mocked
request_log_config:
  log_file: {}
"#,
        log_file.display()
    )
}

#[tokio::test]
async fn test_serves_matches_and_records() {
    let dir = tempfile::tempdir().unwrap();
    let log_file = dir.path().join("requests.yml");
    let supervisor = start(&config(&log_file)).await;

    let states = supervisor.states();
    assert_eq!(states[0], ("api".to_string(), InstanceState::Running));
    assert!(matches!(states[1].1, InstanceState::Failed(_)));

    let addr = supervisor.local_addr("api").unwrap();

    let (status, body) = send(addr, Method::GET, "/api/health", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(br#"{"status":"ok"}"#));

    let (status, body) = send(addr, Method::GET, "/api/health?verbose=1", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(br#"{"status":"ok"}"#));

    let (status, body) = send(addr, Method::POST, "/api/health", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, Bytes::from_static(b"not mocked"));

    let (status, _) = send(addr, Method::GET, "/health", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Matched rule whose body file is missing.
    let (status, _) = send(addr, Method::POST, "/api/items", r#"{"name":"a"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    // Server keeps serving afterwards.
    let (status, _) = send(addr, Method::GET, "/api/health", "").await;
    assert_eq!(status, StatusCode::OK);

    supervisor.shutdown().await;

    let records = std::fs::read_to_string(&log_file).unwrap();
    let docs: Vec<&str> = records.split("---\n").filter(|d| !d.is_empty()).collect();
    assert_eq!(docs.len(), 6);
    assert!(docs.iter().any(|d| d.contains("mapping: /api/health") && d.contains("rule: health")));
    assert!(docs.iter().any(|d| d.contains("verbose: '1'")));
    assert!(docs.iter().any(|d| d.contains("method: POST") && d.contains("rule: null")));
    assert!(docs.iter().any(|d| d.contains("rule: create")));
}

#[tokio::test]
async fn test_shutdown_waits_for_delayed_response() {
    let supervisor = start(
        "servers:\n  - alias: slow\n    base_url: 127.0.0.1:0\nresponses:\n  default:\n    seconds_delay: 0.3\n    body:\n      data: late\n",
    )
    .await;
    let addr = supervisor.local_addr("slow").unwrap();
    let instance = supervisor.instance("slow").unwrap().clone();

    let pending = tokio::spawn(send(addr, Method::GET, "/", ""));
    tokio::time::sleep(Duration::from_millis(100)).await;
    supervisor.shutdown().await;

    let (status, body) = pending.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"late"));
    assert_eq!(instance.state(), InstanceState::Stopped);
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_tls_listener_serves_requests() {
    let fixtures = fixtures();
    let yaml = format!(
        r#"
servers:
  - alias: secure
    base_url: https://127.0.0.1:0/api
    requests_ids: [health]
    ssl_config:
      certfile: {}
      keyfile: {}
requests:
  health:
    mapping: /health
    response_id: ok
responses:
  default:
    status: 404
  ok:
    body:
      data: secure ok
"#,
        fixtures.join("cert.pem").display(),
        fixtures.join("key.pem").display()
    );
    let supervisor = start(&yaml).await;
    assert_eq!(
        supervisor.states()[0],
        ("secure".to_string(), InstanceState::Running)
    );
    let addr = supervisor.local_addr("secure").unwrap();

    let (status, body) = send_tls(addr, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"secure ok"));

    let (status, _) = send_tls(addr, "/api/other").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_percent_encoded_path_matches_rule() {
    let supervisor = start(
        "servers:\n  - alias: enc\n    base_url: 127.0.0.1:0\n    requests_ids: [spaced]\nrequests:\n  spaced:\n    mapping: /a b\n    response_id: ok\nresponses:\n  default:\n    status: 404\n  ok:\n    body:\n      data: found\n",
    )
    .await;
    let addr = supervisor.local_addr("enc").unwrap();

    let (status, body) = send(addr, Method::GET, "/a%20b", "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Bytes::from_static(b"found"));

    supervisor.shutdown().await;
}
