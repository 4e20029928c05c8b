use lru::LruCache;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SanType};
use rustls::{
    crypto::ring::sign::any_supported_type,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
    ServerConfig,
};
use std::{
    collections::HashMap,
    io::Cursor,
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};
use thiserror::Error;

use self::Error::{CaCertificateError, GenerateCertificateError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("CA certificate error: {0}")]
    CaCertificateError(String),
    #[error("cannot generate certificate: {0}")]
    GenerateCertificateError(String),
}

/// Process-wide cap on cached leaf certificates.
const LEAF_CACHE_CAPACITY: usize = 1000;

/// Receives TLS key material in NSS key-log format, one line per call.
pub trait KeylogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

struct RustlsKeylogAdapter {
    sink: Arc<dyn KeylogSink>,
}

impl rustls::KeyLog for RustlsKeylogAdapter {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        let mut line = String::with_capacity(label.len() + 2 * (client_random.len() + secret.len()) + 2);
        line.push_str(label);
        line.push(' ');
        for b in client_random {
            line.push_str(&format!("{:02x}", b));
        }
        line.push(' ');
        for b in secret {
            line.push_str(&format!("{:02x}", b));
        }
        self.sink.write_line(&line);
    }
}

impl std::fmt::Debug for RustlsKeylogAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RustlsKeylogAdapter")
    }
}

struct SharedState {
    certificates: Mutex<LruCache<String, Arc<CertifiedKey>>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    ca_cert_pem: String,
    ca_key_pem: String,
}

/// Mints leaf certificates for intercepted hosts, signed by the configured
/// CA. Generated leaves are cached per hostname across all connections of
/// the process.
pub struct CertAuthority {
    state: Arc<SharedState>,
}

impl CertAuthority {
    pub fn new<IntoString: Into<String>>(ca_cert: IntoString, ca_key: IntoString) -> Result<Self, Error> {
        let ca_cert_pem = ca_cert.into();
        let ca_key_pem = ca_key.into();

        // Validate the CA material up front so misconfiguration fails at
        // construction rather than on the first intercepted connection.
        KeyPair::from_pem(&ca_key_pem)
            .map_err(|err| CaCertificateError(format!("cannot parse CA private key: {:?}", err)))?;
        CertificateParams::from_ca_cert_pem(&ca_cert_pem)
            .map_err(|err| CaCertificateError(format!("cannot parse CA certificate: {:?}", err)))?;

        Ok(CertAuthority {
            state: Arc::new(SharedState {
                certificates: Mutex::new(LruCache::new(
                    NonZeroUsize::new(LEAF_CACHE_CAPACITY).unwrap(),
                )),
                locks: Mutex::new(HashMap::new()),
                ca_cert_pem,
                ca_key_pem,
            }),
        })
    }

    /// Generates a fresh self-signed CA usable for interception, returned as
    /// `(certificate_pem, private_key_pem)`.
    pub fn generate_ca_pair() -> Result<(String, String), Error> {
        let key = KeyPair::generate()
            .map_err(|err| CaCertificateError(format!("cannot generate CA key: {:?}", err)))?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, "mockproxy interception CA");
        params
            .distinguished_name
            .push(DnType::OrganizationName, "mockproxy");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let cert = params
            .self_signed(&key)
            .map_err(|err| CaCertificateError(format!("cannot self-sign CA: {:?}", err)))?;

        Ok((cert.pem(), key.serialize_pem()))
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.state.ca_cert_pem
    }

    /// Builds a rustls server config for one intercepted connection.
    /// `connect_authority` is the CONNECT target (or local address for direct
    /// TLS) used for certificate selection when the client sends no SNI, and
    /// added to the SAN list alongside the SNI name.
    pub fn server_config(
        &self,
        connect_authority: Option<String>,
        offer_h2: bool,
        keylog: Option<Arc<dyn KeylogSink>>,
    ) -> Arc<ServerConfig> {
        let resolver = Arc::new(GeneratingCertResolver {
            state: self.state.clone(),
            connect_authority,
        });

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);

        config.alpn_protocols = if offer_h2 {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };

        if let Some(sink) = keylog {
            config.key_log = Arc::new(RustlsKeylogAdapter { sink });
        }

        Arc::new(config)
    }
}

impl std::fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertAuthority")
            .field(
                "cached_hosts",
                &self.state.certificates.lock().unwrap().len(),
            )
            .finish()
    }
}

#[derive(Debug)]
struct GeneratingCertResolver {
    state: Arc<SharedState>,
    connect_authority: Option<String>,
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState").finish_non_exhaustive()
    }
}

impl GeneratingCertResolver {
    fn load_certificates(cert_pem: String) -> Result<Vec<CertificateDer<'static>>, Error> {
        let mut reader = Cursor::new(cert_pem.into_bytes());
        let mut certificates = Vec::new();
        for cert in rustls_pemfile::certs(&mut reader) {
            certificates.push(cert.map_err(|err| {
                GenerateCertificateError(format!("cannot read generated certificate: {:?}", err))
            })?);
        }
        Ok(certificates)
    }

    fn load_private_key(key_pem: String) -> Result<PrivateKeyDer<'static>, Error> {
        let mut reader = Cursor::new(key_pem.into_bytes());
        rustls_pemfile::private_key(&mut reader)
            .map_err(|err| {
                GenerateCertificateError(format!("cannot read generated private key: {:?}", err))
            })?
            .ok_or_else(|| GenerateCertificateError("empty generated private key".to_string()))
    }

    fn authority_host(&self) -> Option<String> {
        let authority = self.connect_authority.as_deref()?;
        let (host, _) = crate::common::util::split_host_port(authority);
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    fn add_san(sans: &mut Vec<SanType>, name: &str) {
        let san = if let Ok(ip) = name.parse::<std::net::IpAddr>() {
            if ip.is_unspecified() {
                return;
            }
            SanType::IpAddress(ip)
        } else {
            match <rcgen::Ia5String as TryFrom<&str>>::try_from(name) {
                Ok(dns) => SanType::DnsName(dns),
                Err(_) => return,
            }
        };
        let exists = sans.iter().any(|existing| match (existing, &san) {
            (SanType::DnsName(a), SanType::DnsName(b)) => a == b,
            (SanType::IpAddress(a), SanType::IpAddress(b)) => a == b,
            _ => false,
        });
        if !exists {
            sans.push(san);
        }
    }

    fn generate_host_certificate(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
        let ca_key = KeyPair::from_pem(&self.state.ca_key_pem).map_err(|err| {
            CaCertificateError(format!(
                "cannot parse CA key while minting for {}: {:?}",
                hostname, err
            ))
        })?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, hostname);
        Self::add_san(&mut params.subject_alt_names, hostname);
        // A client that CONNECTed to one name and then sent a different SNI
        // should still be able to verify either name against the leaf.
        if let Some(connect_host) = self.authority_host() {
            Self::add_san(&mut params.subject_alt_names, &connect_host);
        }

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot generate leaf key pair (host: {}): {:?}",
                hostname, err
            ))
        })?;

        let issuer_params =
            CertificateParams::from_ca_cert_pem(&self.state.ca_cert_pem).map_err(|err| {
                GenerateCertificateError(format!(
                    "cannot derive issuer parameters (host: {}): {:?}",
                    hostname, err
                ))
            })?;
        let ca_cert = issuer_params.self_signed(&ca_key).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot reconstruct CA certificate (host: {}): {:?}",
                hostname, err
            ))
        })?;

        let leaf_cert = params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .map_err(|err| {
                GenerateCertificateError(format!(
                    "cannot sign leaf certificate (host: {}): {:?}",
                    hostname, err
                ))
            })?;

        let private_key = Self::load_private_key(leaf_key.serialize_pem())?;
        let certificates = Self::load_certificates(leaf_cert.pem())?;
        let signing_key = any_supported_type(&private_key).map_err(|err| {
            GenerateCertificateError(format!(
                "cannot convert leaf key to signing key (host: {}): {:?}",
                hostname, err
            ))
        })?;

        Ok(Arc::new(CertifiedKey::new(certificates, signing_key)))
    }

    fn lock_for_hostname(&self, hostname: &str) -> Arc<Mutex<()>> {
        let mut locks = self.state.locks.lock().unwrap();
        locks
            .entry(hostname.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn lookup_or_generate(&self, hostname: &str) -> Result<Arc<CertifiedKey>, Error> {
        {
            let mut certs = self.state.certificates.lock().unwrap();
            if let Some(key) = certs.get(hostname) {
                return Ok(key.clone());
            }
        }

        // Serialize generation per host so concurrent handshakes for the
        // same name do not both mint.
        let lock = self.lock_for_hostname(hostname);
        let _guard = lock.lock().unwrap();
        {
            let mut certs = self.state.certificates.lock().unwrap();
            if let Some(key) = certs.get(hostname) {
                return Ok(key.clone());
            }
        }

        log::debug!("minting leaf certificate for {}", hostname);
        let key = self.generate_host_certificate(hostname)?;
        self.state
            .certificates
            .lock()
            .unwrap()
            .put(hostname.to_string(), key.clone());
        Ok(key)
    }
}

impl ResolvesServerCert for GeneratingCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let hostname = match client_hello.server_name() {
            Some(sni) => sni.to_string(),
            // RFC 6066 allows omitting SNI; assume the client connected by
            // address and fall back to the CONNECT target, or to a local
            // placeholder when there is none either.
            None => self
                .authority_host()
                .unwrap_or_else(|| "localhost".to_string()),
        };

        match self.lookup_or_generate(&hostname) {
            Ok(key) => Some(key),
            Err(err) => {
                log::error!("cannot mint certificate for {}: {}", hostname, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_ca_can_mint_leaves() {
        // Arrange
        let (ca_pem, key_pem) = CertAuthority::generate_ca_pair().unwrap();
        let authority = CertAuthority::new(ca_pem, key_pem).unwrap();
        let resolver = GeneratingCertResolver {
            state: authority.state.clone(),
            connect_authority: Some("example.test:443".to_string()),
        };

        // Act
        let key = resolver.lookup_or_generate("example.test").unwrap();

        // Assert
        assert!(!key.cert.is_empty());
    }

    #[test]
    fn leaves_are_cached_per_hostname() {
        let (ca_pem, key_pem) = CertAuthority::generate_ca_pair().unwrap();
        let authority = CertAuthority::new(ca_pem, key_pem).unwrap();
        let resolver = GeneratingCertResolver {
            state: authority.state.clone(),
            connect_authority: None,
        };

        let first = resolver.lookup_or_generate("cached.test").unwrap();
        let second = resolver.lookup_or_generate("cached.test").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn invalid_ca_material_fails_at_construction() {
        let result = CertAuthority::new("not a cert", "not a key");
        assert!(matches!(result, Err(Error::CaCertificateError(_))));
    }
}
