//! Shared TLS client configuration.
//!
//! One process-wide `rustls` config: system-independent `webpki` trust
//! roots, no client auth, TLS 1.2 minimum (the rustls default protocol
//! set), SNI and hostname verification always on. Both the async and the
//! blocking connection use it.

use std::sync::{Arc, OnceLock};

use crate::errors::{Error, ErrorKind, Result};

pub(crate) fn tls_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let roots = rustls::RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone()
}

/// SNI / verification name for `host` (brackets already stripped from
/// IPv6 literals by the caller).
pub(crate) fn server_name(host: &str) -> Result<rustls::pki_types::ServerName<'static>> {
    rustls::pki_types::ServerName::try_from(host.to_owned())
        .map_err(|e| Error::new(ErrorKind::Tls).with_source(e))
}
