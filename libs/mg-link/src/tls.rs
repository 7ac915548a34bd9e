//! TLS setup for gateway connections.

use crate::config::{TlsRootConfig, TransportSecurity};
use crate::error::LinkError;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};

/// OS root certificates, loaded once per process. Empty when none were found.
static NATIVE_ROOTS: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn native_roots() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS.get_or_init(|| {
        let loaded = rustls_native_certs::load_native_certs();
        for err in &loaded.errors {
            tracing::warn!(error = %err, "error loading native root certificate");
        }
        if loaded.certs.is_empty() {
            tracing::warn!("no native root CA certificates found");
        } else {
            tracing::debug!(count = loaded.certs.len(), "loaded native root certificates");
        }
        loaded.certs
    })
}

/// Globally installed crypto provider, or aws-lc-rs without installing it
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn native_client_config() -> Result<rustls::ClientConfig, LinkError> {
    let certs = native_roots();
    if certs.is_empty() {
        return Err(LinkError::Tls(
            "no native root CA certificates found in OS certificate store".into(),
        ));
    }

    let mut store = rustls::RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        return Err(LinkError::Tls(
            format!("none of the {} native root certificates could be parsed", certs.len()).into(),
        ));
    }

    Ok(rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| LinkError::Tls(Box::new(e)))?
        .with_root_certificates(store)
        .with_no_client_auth())
}

/// Connector for the gateway client, plain HTTP allowed only in
/// [`TransportSecurity::AllowInsecureHttp`].
///
/// # Errors
/// Returns [`LinkError::Tls`] if the selected roots cannot be loaded.
pub fn https_connector(
    roots: TlsRootConfig,
    transport: TransportSecurity,
) -> Result<HttpsConnector<HttpConnector>, LinkError> {
    let builder = match roots {
        TlsRootConfig::WebPki => HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(crypto_provider())
            .map_err(|e| LinkError::Tls(Box::new(e)))?,
        TlsRootConfig::Native => HttpsConnectorBuilder::new().with_tls_config(native_client_config()?),
    };

    let connector = match transport {
        TransportSecurity::AllowInsecureHttp => builder.https_or_http().enable_all_versions().build(),
        TransportSecurity::TlsOnly => builder.https_only().enable_all_versions().build(),
    };
    Ok(connector)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_native_roots_loaded_once() {
        let first = native_roots();
        let second = native_roots();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_webpki_connector_builds() {
        assert!(https_connector(TlsRootConfig::WebPki, TransportSecurity::TlsOnly).is_ok());
        assert!(https_connector(TlsRootConfig::WebPki, TransportSecurity::AllowInsecureHttp).is_ok());
    }

    #[test]
    fn test_native_connector_does_not_panic() {
        // Minimal containers have no OS roots; either outcome is fine
        match https_connector(TlsRootConfig::Native, TransportSecurity::TlsOnly) {
            Ok(_) => {}
            Err(err) => assert!(matches!(err, LinkError::Tls(_))),
        }
    }
}
