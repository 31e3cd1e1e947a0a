//! TLS client setup for `pool_use_tls`. Not exercised unless a pool entry asks for it; kept
//! small and separate from `up_session` so the connect-race code doesn't have to know about
//! certificate verification at all.

use std::sync::Arc;

use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{Certificate, ClientConfig, Error as TlsError, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;

struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Builds a connector. `skip_verify` trusts any certificate the pool presents; otherwise the
/// platform's native root store is used.
pub fn connector(skip_verify: bool) -> TlsConnector {
    let config = if skip_verify {
        ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        if let Ok(native) = rustls_native_certs::load_native_certs() {
            for cert in native {
                let _ = roots.add(&Certificate(cert.0));
            }
        }
        ClientConfig::builder().with_safe_defaults().with_root_certificates(roots).with_no_client_auth()
    };
    TlsConnector::from(Arc::new(config))
}
