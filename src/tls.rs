//! TLS acceptor built from PEM certificate and key files.

use crate::model::TlsPaths;
use rustls::pki_types::CertificateDer;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Loads the certificate chain and private key named by `paths`.
///
/// Errors are plain strings; the caller wraps them into a listener start error.
pub fn create_tls_acceptor(paths: &TlsPaths) -> Result<TlsAcceptor, String> {
    let cert_file = File::open(&paths.cert).map_err(|e| {
        format!(
            "failed to open certificate file '{}': {}",
            paths.cert.display(),
            e
        )
    })?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| format!("failed to parse certificate file: {}", e))?;
    if certs.is_empty() {
        return Err(format!(
            "no certificates found in '{}'",
            paths.cert.display()
        ));
    }

    let key_file = File::open(&paths.key).map_err(|e| {
        format!(
            "failed to open private key file '{}': {}",
            paths.key.display(),
            e
        )
    })?;
    // PKCS8, RSA or SEC1
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| format!("failed to parse private key file: {}", e))?
        .ok_or_else(|| format!("no private key found in '{}'", paths.key.display()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("failed to select TLS versions: {}", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("failed to build TLS configuration: {}", e))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_cert_file() {
        let paths = TlsPaths {
            cert: PathBuf::from("/nonexistent/cap/cert.pem"),
            key: PathBuf::from("/nonexistent/cap/key.pem"),
        };
        let err = create_tls_acceptor(&paths).err().unwrap();
        assert!(err.contains("certificate file"));
    }

    #[test]
    fn test_acceptor_from_pem_fixtures() {
        let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures");
        let paths = TlsPaths {
            cert: fixtures.join("cert.pem"),
            key: fixtures.join("key.pem"),
        };
        assert!(create_tls_acceptor(&paths).is_ok());

        // A certificate without its key is refused.
        let mismatched = TlsPaths {
            cert: fixtures.join("cert.pem"),
            key: fixtures.join("ca.pem"),
        };
        assert!(create_tls_acceptor(&mismatched).is_err());
    }

    #[test]
    fn test_cert_file_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, "not a certificate\n").unwrap();
        let paths = TlsPaths {
            cert,
            key: dir.path().join("key.pem"),
        };
        let err = create_tls_acceptor(&paths).err().unwrap();
        assert!(err.contains("no certificates"));
    }
}
