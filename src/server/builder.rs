use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use crate::server::socks::SocksAuthMethod;
use crate::server::tls::{CertAuthority, KeylogSink};
use crate::server::{MockProxy, PortConfig, RuntimeConfig, ServerState};

/// Configures and builds a [`MockProxy`]. Consolidates configuration
/// parameters, fallback mechanisms and defaults in one place; every setter
/// has an `*_option` twin for plumbing through optional CLI/config values.
pub struct MockProxyBuilder {
    port: Option<PortConfig>,
    expose: Option<bool>,
    http2: Option<bool>,
    max_body_size: Option<usize>,
    ca_cert: Option<String>,
    ca_key: Option<String>,
    ca_cert_path: Option<PathBuf>,
    ca_key_path: Option<PathBuf>,
    socks_auth: Option<Vec<SocksAuthMethod>>,
    keylog: Option<Arc<dyn KeylogSink>>,
}

impl MockProxyBuilder {
    pub fn new() -> Self {
        MockProxyBuilder {
            port: None,
            expose: None,
            http2: None,
            max_body_size: None,
            ca_cert: None,
            ca_key: None,
            ca_cert_path: None,
            ca_key_path: None,
            socks_auth: None,
            keylog: None,
        }
    }

    /// Listens on exactly this port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(PortConfig::Fixed(port));
        self
    }

    pub fn port_option(mut self, port: Option<u16>) -> Self {
        self.port = port.map(PortConfig::Fixed);
        self
    }

    /// Tries each port in the inclusive range, retrying on EADDRINUSE.
    pub fn port_range(mut self, start: u16, end: u16) -> Self {
        self.port = Some(PortConfig::Range(start, end));
        self
    }

    /// Listens on all interfaces instead of loopback only.
    pub fn expose(mut self, expose: bool) -> Self {
        self.expose = Some(expose);
        self
    }

    pub fn expose_option(mut self, expose: Option<bool>) -> Self {
        self.expose = expose;
        self
    }

    /// Offers `h2` via ALPN on intercepted TLS connections.
    pub fn http2(mut self, enabled: bool) -> Self {
        self.http2 = Some(enabled);
        self
    }

    pub fn http2_option(mut self, enabled: Option<bool>) -> Self {
        self.http2 = enabled;
        self
    }

    /// Caps decoded request body views; larger bodies only expose the raw
    /// view.
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = Some(bytes);
        self
    }

    pub fn max_body_size_option(mut self, bytes: Option<usize>) -> Self {
        self.max_body_size = bytes;
        self
    }

    /// CA certificate and private key (PEM) used to mint leaf certificates
    /// for intercepted hosts.
    pub fn ca_key_pair<IntoString: Into<String>>(
        mut self,
        cert: IntoString,
        private_key: IntoString,
    ) -> Self {
        self.ca_cert = Some(cert.into());
        self.ca_key = Some(private_key.into());
        self
    }

    pub fn ca_key_pair_option<IntoString: Into<String>>(
        mut self,
        cert: Option<IntoString>,
        private_key: Option<IntoString>,
    ) -> Self {
        self.ca_cert = cert.map(|c| c.into());
        self.ca_key = private_key.map(|k| k.into());
        self
    }

    /// Paths to the CA certificate and private key files.
    pub fn ca_key_pair_files<Path: Into<PathBuf>>(
        mut self,
        cert_path: Path,
        private_key_path: Path,
    ) -> Self {
        self.ca_cert_path = Some(cert_path.into());
        self.ca_key_path = Some(private_key_path.into());
        self
    }

    pub fn ca_key_pair_files_option<Path: Into<PathBuf>>(
        mut self,
        cert_path: Option<Path>,
        private_key_path: Option<Path>,
    ) -> Self {
        self.ca_cert_path = cert_path.map(|p| p.into());
        self.ca_key_path = private_key_path.map(|p| p.into());
        self
    }

    /// SOCKS5 authentication methods to advertise, in server preference
    /// order. An empty list disables the SOCKS front-end.
    pub fn socks_auth_methods(mut self, methods: Vec<SocksAuthMethod>) -> Self {
        self.socks_auth = Some(methods);
        self
    }

    /// Receives TLS key material for every intercepted connection, in NSS
    /// key-log format.
    pub fn keylog(mut self, sink: Arc<dyn KeylogSink>) -> Self {
        self.keylog = Some(sink);
        self
    }

    fn validate(&self) -> Result<(), Box<dyn Error>> {
        let has_inline = self.ca_cert.is_some() || self.ca_key.is_some();
        let has_paths = self.ca_cert_path.is_some() || self.ca_key_path.is_some();
        if has_inline && has_paths {
            return Err(
                "a CA key pair and CA key pair file paths were both configured; pick one".into(),
            );
        }
        if self.ca_cert.is_some() != self.ca_key.is_some() {
            return Err("a CA certificate needs its private key, and vice versa".into());
        }
        if self.ca_cert_path.is_some() != self.ca_key_path.is_some() {
            return Err("a CA certificate path needs its private key path, and vice versa".into());
        }
        Ok(())
    }

    pub fn build(self) -> Result<MockProxy, Box<dyn Error>> {
        self.validate()?;

        let cert_authority = match (
            self.ca_cert,
            self.ca_key,
            self.ca_cert_path,
            self.ca_key_path,
        ) {
            (Some(cert), Some(key), _, _) => CertAuthority::new(cert, key)?,
            (_, _, Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read_to_string(cert_path)?;
                let key = std::fs::read_to_string(key_path)?;
                CertAuthority::new(cert, key)?
            }
            // No CA configured: generate a throwaway one for this process.
            _ => {
                let (cert, key) = CertAuthority::generate_ca_pair()?;
                CertAuthority::new(cert, key)?
            }
        };

        let defaults = RuntimeConfig::default();
        let config = RuntimeConfig {
            port: self.port.unwrap_or(defaults.port),
            expose: self.expose.unwrap_or(defaults.expose),
            http2: self.http2.unwrap_or(defaults.http2),
            max_body_size: self.max_body_size.unwrap_or(defaults.max_body_size),
            socks_auth: self.socks_auth.unwrap_or(defaults.socks_auth),
            keylog: self.keylog,
        };

        Ok(MockProxy::from_state(std::sync::Arc::new(ServerState::new(
            std::sync::Arc::new(cert_authority),
            config,
        ))))
    }
}

impl Default for MockProxyBuilder {
    fn default() -> Self {
        MockProxyBuilder::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn build_without_ca_generates_one() {
        let proxy = MockProxyBuilder::new().build().unwrap();
        assert!(proxy.ca_cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn conflicting_ca_sources_are_rejected() {
        let (cert, key) = CertAuthority::generate_ca_pair().unwrap();
        let result = MockProxyBuilder::new()
            .ca_key_pair(cert.as_str(), key.as_str())
            .ca_key_pair_files("/tmp/ca.pem", "/tmp/ca.key")
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn half_a_ca_key_pair_is_rejected() {
        let (cert, _) = CertAuthority::generate_ca_pair().unwrap();
        let result = MockProxyBuilder::new()
            .ca_key_pair_option(Some(cert.as_str()), None)
            .build();
        assert!(result.is_err());
    }
}
