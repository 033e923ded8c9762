//! TLS credential resolution.
//!
//! Certificates are read once, when the option is applied, and checked with
//! rustls so a bad pair fails construction instead of the first handshake.

use std::io::BufReader;
use std::sync::Arc;

use rustls::ServerConfig as RustlsConfig;
use tonic::transport::{Identity, ServerTlsConfig};

use crate::error::{ServerError, ServerResult};
use crate::option::ServerOption;

/// Resolve a certificate/key pair into server options.
///
/// - both paths empty: TLS not requested, no options
/// - exactly one path empty: configuration error
/// - otherwise: exactly one [`ServerOption::Tls`], or [`ServerError::Credential`]
pub fn resolve_credentials(cert_path: &str, key_path: &str) -> ServerResult<Vec<ServerOption>> {
    match (cert_path.is_empty(), key_path.is_empty()) {
        (true, true) => return Ok(Vec::new()),
        (false, false) => {}
        _ => {
            return Err(ServerError::Configuration(format!(
                "TLS needs both a certificate and a key (cert: {cert_path:?}, key: {key_path:?})"
            )));
        }
    }

    let credential_error = |reason: String| ServerError::Credential {
        cert_path: cert_path.to_string(),
        key_path: key_path.to_string(),
        reason,
    };

    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| credential_error(format!("failed to read certificate: {e}")))?;
    let key_pem =
        std::fs::read(key_path).map_err(|e| credential_error(format!("failed to read key: {e}")))?;

    validate_pair(&cert_pem, &key_pem).map_err(credential_error)?;

    let identity = Identity::from_pem(cert_pem, key_pem);
    Ok(vec![ServerOption::Tls(ServerTlsConfig::new().identity(identity))])
}

/// Parse the PEM pair and let rustls check the key against the chain.
fn validate_pair(cert_pem: &[u8], key_pem: &[u8]) -> Result<(), String> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse certificate chain: {e}"))?;
    if certs.is_empty() {
        return Err("no certificate found in PEM data".to_string());
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(|e| format!("failed to parse private key: {e}"))?
        .ok_or_else(|| "no private key found in PEM data".to_string())?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    RustlsConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("unsupported TLS configuration: {e}"))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("certificate and key rejected: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CERT: &[u8] = include_bytes!("../tests/fixtures/server.crt");
    const KEY: &[u8] = include_bytes!("../tests/fixtures/server.key");

    fn pem_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file
    }

    fn path(file: &tempfile::NamedTempFile) -> &str {
        file.path().to_str().unwrap()
    }

    #[test]
    fn test_no_paths_means_no_tls() {
        let opts = resolve_credentials("", "").unwrap();
        assert!(opts.is_empty());
    }

    #[test]
    fn test_one_path_is_a_configuration_error() {
        let err = resolve_credentials("server.crt", "").unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));

        let err = resolve_credentials("", "server.key").unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));
    }

    #[test]
    fn test_valid_pair_yields_one_option() {
        let cert = pem_file(CERT);
        let key = pem_file(KEY);

        let opts = resolve_credentials(path(&cert), path(&key)).unwrap();
        assert_eq!(opts.len(), 1);
        assert!(matches!(opts[0], ServerOption::Tls(_)));
    }

    #[test]
    fn test_missing_files_are_credential_errors() {
        let err = resolve_credentials("/nonexistent/server.crt", "/nonexistent/server.key")
            .unwrap_err();
        match err {
            ServerError::Credential { cert_path, reason, .. } => {
                assert_eq!(cert_path, "/nonexistent/server.crt");
                assert!(reason.contains("certificate"));
            }
            other => panic!("expected credential error, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_pem_is_a_credential_error() {
        let cert = pem_file(b"not a pem");
        let key = pem_file(b"also not a pem");

        let err = resolve_credentials(path(&cert), path(&key)).unwrap_err();
        assert!(matches!(err, ServerError::Credential { .. }));
    }

    #[test]
    fn test_key_in_place_of_cert_is_rejected() {
        let cert = pem_file(KEY);
        let key = pem_file(KEY);

        let err = resolve_credentials(path(&cert), path(&key)).unwrap_err();
        assert!(matches!(err, ServerError::Credential { .. }));
    }
}
