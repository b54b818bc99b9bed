//! Server and host configuration records
//!
//! Plain serde records so options can come from anywhere: built in code,
//! deserialized from a JSON file, or embedded in a larger application config.
//! The server reads them once at `start()`; listeners never observe
//! mid-flight option changes.

use serde::{Deserialize, Serialize};

/// TLS version selector for a host listener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVersion {
    /// TLS disabled on this host even when a certificate is configured
    None,
    /// Negotiate any version the TLS backend supports
    #[default]
    Tls,
    /// TLS 1.1 (clamped up to the backend floor, see `tls` module)
    Tls11,
    Tls12,
    Tls13,
}

/// One listening endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostOptions {
    /// Bind address; `None` binds every interface
    pub host: Option<String>,
    pub port: u16,
    pub ssl_enabled: bool,
    /// PEM certificate chain path, required when `ssl_enabled`
    pub certificate: Option<std::path::PathBuf>,
    /// PEM private key path, required when `ssl_enabled`
    pub certificate_key: Option<std::path::PathBuf>,
    pub tls_version: TlsVersion,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            host: None,
            port: 0,
            ssl_enabled: false,
            certificate: None,
            certificate_key: None,
            tls_version: TlsVersion::default(),
        }
    }
}

impl HostOptions {
    /// Plain-TCP host on the given port, every interface
    pub fn plain(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Whether connections on this host go through the TLS layer
    pub fn tls_active(&self) -> bool {
        self.ssl_enabled && self.tls_version != TlsVersion::None
    }

    pub(crate) fn socket_addr(&self) -> Result<std::net::SocketAddr, crate::ServerError> {
        let host = self.host.as_deref().unwrap_or("0.0.0.0");
        let ip: std::net::IpAddr = host
            .parse()
            .map_err(|_| crate::ServerError::Options(format!("invalid bind address: {host}")))?;
        Ok(std::net::SocketAddr::new(ip, self.port))
    }
}

/// Server-wide options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    pub hosts: Vec<HostOptions>,

    /// Handshake deadline in seconds; a connection that has not completed a
    /// protocol handshake within this window is reaped
    pub request_timeout: u64,

    /// Heartbeat cadence in seconds; 0 disables the heartbeat manager
    pub ping_interval: u64,

    /// Set TCP_NODELAY on each accepted socket
    pub no_delay: bool,

    /// Platform low-latency ack hint on each accepted socket (Linux only,
    /// silently ignored elsewhere)
    pub quick_ack: bool,

    /// Listen backlog; 0 uses the system default
    pub maximum_pending_connections: u32,

    /// Accept any peer certificate during TLS authentication
    pub bypass_ssl_validation: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            request_timeout: 30,
            ping_interval: 0,
            no_delay: true,
            quick_ack: false,
            maximum_pending_connections: 0,
            bypass_ssl_validation: false,
        }
    }
}

impl ServerOptions {
    /// Options with a single plain-TCP host on the given port
    pub fn on_port(port: u16) -> Self {
        Self {
            hosts: vec![HostOptions::plain(port)],
            ..Self::default()
        }
    }

    /// Load options from a JSON file
    pub fn from_json_file(
        path: impl AsRef<std::path::Path>,
    ) -> Result<Self, crate::ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            crate::ServerError::Options(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    /// Parse options from a JSON string
    pub fn from_json(text: &str) -> Result<Self, crate::ServerError> {
        serde_json::from_str(text)
            .map_err(|e| crate::ServerError::Options(format!("invalid options: {e}")))
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout.max(1))
    }

    pub fn ping_interval(&self) -> Option<std::time::Duration> {
        (self.ping_interval > 0).then(|| std::time::Duration::from_secs(self.ping_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ServerOptions::default();
        assert!(options.hosts.is_empty());
        assert_eq!(options.request_timeout, 30);
        assert_eq!(options.ping_interval, 0);
        assert!(options.ping_interval().is_none());
        assert!(options.no_delay);
        assert!(!options.bypass_ssl_validation);
    }

    #[test]
    fn test_from_json() {
        let options = ServerOptions::from_json(
            r#"{
                "hosts": [
                    {"port": 2626},
                    {"port": 2627, "ssl_enabled": true, "tls_version": "tls12"}
                ],
                "request_timeout": 5,
                "ping_interval": 60,
                "quick_ack": true
            }"#,
        )
        .unwrap();

        assert_eq!(options.hosts.len(), 2);
        assert_eq!(options.hosts[0].port, 2626);
        assert!(!options.hosts[0].tls_active());
        assert_eq!(options.hosts[1].tls_version, TlsVersion::Tls12);
        assert!(options.hosts[1].tls_active());
        assert_eq!(options.request_timeout().as_secs(), 5);
        assert_eq!(options.ping_interval().unwrap().as_secs(), 60);
        assert!(options.quick_ack);
    }

    #[test]
    fn test_tls_version_none_disables() {
        let host = HostOptions {
            port: 2626,
            ssl_enabled: true,
            tls_version: TlsVersion::None,
            ..HostOptions::default()
        };
        assert!(!host.tls_active());
    }

    #[test]
    fn test_invalid_bind_address() {
        let host = HostOptions {
            host: Some("not-an-ip".to_string()),
            port: 2626,
            ..HostOptions::default()
        };
        assert!(host.socket_addr().is_err());
    }
}
