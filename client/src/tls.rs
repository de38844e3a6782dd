//! TLS connector for frontends that terminate the tunnel over TLS.

use std::sync::Arc;

use anyhow::{Context, Result};
use pktunnel_shared::TlsConnector;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};

/// Builds a connector that verifies the frontend against the bundled
/// web PKI roots.
pub fn connector(server_name: &str) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = ServerName::try_from(server_name.to_string())
        .with_context(|| format!("Invalid TLS server name: {}", server_name))?;

    Ok(TlsConnector::new(
        tokio_rustls::TlsConnector::from(Arc::new(config)),
        name,
    ))
}
