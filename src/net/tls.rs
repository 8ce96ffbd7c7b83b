//! TLS Setup
//!
//! One `rustls::ClientConfig` is built per cluster and shared by every
//! connection, blocking or not. The server name checked against the
//! certificate is the node's TLS name, falling back to the host name.

use crate::config::TlsConfig;
use crate::error::{Error, Result};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TlsContext {
    config: Arc<ClientConfig>,
}

impl TlsContext {
    pub fn new(tls: &TlsConfig) -> Result<Self> {
        let certs: Vec<CertificateDer<'static>> = match (&tls.ca_file, &tls.ca_pem) {
            (Some(path), _) => CertificateDer::pem_file_iter(path)
                .map_err(|e| Error::Tls(format!("cannot read {}: {}", path.display(), e)))?
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Tls(format!("invalid certificate in {}: {}", path.display(), e)))?,
            (None, Some(pem)) => CertificateDer::pem_slice_iter(pem)
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Tls(format!("invalid certificate: {}", e)))?,
            (None, None) => {
                return Err(Error::InvalidArgument(
                    "TLS enabled without trusted certificates".into(),
                ))
            }
        };

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(Error::Tls("no usable root certificates".into()));
        }
        debug!(added, ignored, "Loaded TLS root certificates");

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Starts a client session for `server_name`.
    pub fn connect(&self, server_name: &str) -> Result<ClientConnection> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name {:?}: {}", server_name, e)))?;
        Ok(ClientConnection::new(Arc::clone(&self.config), name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_roots_rejected() {
        let err = TlsContext::new(&TlsConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_pem_without_certificates_rejected() {
        let tls = TlsConfig {
            ca_pem: Some(b"not a pem".to_vec()),
            ..TlsConfig::default()
        };
        assert!(TlsContext::new(&tls).is_err());
    }
}
