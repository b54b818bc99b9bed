//! TLS layer for host listeners
//!
//! Each TLS-enabled host gets one `TlsAcceptor` built at listener start from
//! its PEM certificate chain and private key. The accept pipeline wraps the
//! raw TCP stream through it before the greeting peek, so protocol
//! recognition always sees plaintext.

use tokio_rustls::rustls;

/// Build the acceptor for one TLS-enabled host
pub(crate) fn build_acceptor(
    host: &crate::HostOptions,
) -> Result<tokio_rustls::TlsAcceptor, crate::ServerError> {
    let certificate = host.certificate.as_deref().ok_or_else(|| {
        crate::ServerError::Certificate(format!("host :{} has no certificate path", host.port))
    })?;
    let key = host.certificate_key.as_deref().ok_or_else(|| {
        crate::ServerError::Certificate(format!("host :{} has no certificate key path", host.port))
    })?;

    let chain = load_certificates(certificate)?;
    let key = load_private_key(key)?;

    let builder = match protocol_versions(host.tls_version) {
        Some(versions) => rustls::ServerConfig::builder_with_protocol_versions(versions),
        None => rustls::ServerConfig::builder(),
    };

    let config = builder
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| crate::ServerError::Certificate(format!("invalid certificate: {e}")))?;

    Ok(tokio_rustls::TlsAcceptor::from(std::sync::Arc::new(config)))
}

/// Map the version selector onto rustls protocol versions
///
/// `None` means "whatever the backend supports". rustls dropped TLS 1.1, so
/// the `tls11` selector clamps to the 1.2 floor instead of failing startup.
static TLS12_VERSIONS: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_VERSIONS: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

fn protocol_versions(
    version: crate::TlsVersion,
) -> Option<&'static [&'static rustls::SupportedProtocolVersion]> {
    match version {
        crate::TlsVersion::Tls | crate::TlsVersion::None => None,
        crate::TlsVersion::Tls11 => {
            tracing::warn!("TLS 1.1 is not supported by rustls, clamping to TLS 1.2");
            Some(TLS12_VERSIONS)
        }
        crate::TlsVersion::Tls12 => Some(TLS12_VERSIONS),
        crate::TlsVersion::Tls13 => Some(TLS13_VERSIONS),
    }
}

fn load_certificates(
    path: &std::path::Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, crate::ServerError> {
    let file = std::fs::File::open(path).map_err(|e| {
        crate::ServerError::Certificate(format!("cannot open {}: {e}", path.display()))
    })?;
    let mut reader = std::io::BufReader::new(file);
    let chain: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| {
            crate::ServerError::Certificate(format!("invalid PEM in {}: {e}", path.display()))
        })?;
    if chain.is_empty() {
        return Err(crate::ServerError::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_private_key(
    path: &std::path::Path,
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, crate::ServerError> {
    let file = std::fs::File::open(path).map_err(|e| {
        crate::ServerError::Certificate(format!("cannot open {}: {e}", path.display()))
    })?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            crate::ServerError::Certificate(format!("invalid PEM in {}: {e}", path.display()))
        })?
        .ok_or_else(|| {
            crate::ServerError::Certificate(format!(
                "no private key found in {}",
                path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed_host(dir: &std::path::Path) -> crate::HostOptions {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        crate::HostOptions {
            port: 0,
            ssl_enabled: true,
            certificate: Some(cert_path),
            certificate_key: Some(key_path),
            ..crate::HostOptions::default()
        }
    }

    #[test]
    fn test_acceptor_from_self_signed_pem() {
        let dir = tempfile::tempdir().unwrap();
        let host = self_signed_host(dir.path());
        assert!(build_acceptor(&host).is_ok());
    }

    #[test]
    fn test_acceptor_honors_version_selector() {
        let dir = tempfile::tempdir().unwrap();
        let mut host = self_signed_host(dir.path());
        host.tls_version = crate::TlsVersion::Tls13;
        assert!(build_acceptor(&host).is_ok());

        // tls11 clamps instead of erroring
        host.tls_version = crate::TlsVersion::Tls11;
        assert!(build_acceptor(&host).is_ok());
    }

    #[test]
    fn test_missing_certificate_paths() {
        let host = crate::HostOptions {
            port: 0,
            ssl_enabled: true,
            ..crate::HostOptions::default()
        };
        assert!(matches!(
            build_acceptor(&host),
            Err(crate::ServerError::Certificate(_))
        ));
    }

    #[test]
    fn test_missing_certificate_file() {
        let host = crate::HostOptions {
            port: 0,
            ssl_enabled: true,
            certificate: Some("/nonexistent/cert.pem".into()),
            certificate_key: Some("/nonexistent/key.pem".into()),
            ..crate::HostOptions::default()
        };
        assert!(matches!(
            build_acceptor(&host),
            Err(crate::ServerError::Certificate(_))
        ));
    }
}
