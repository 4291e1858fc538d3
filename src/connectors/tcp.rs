//! TCP connector with optional rustls TLS.
//!
//! `wss://` targets are wrapped in TLS using the Mozilla root store from
//! `webpki-roots` and the `ring` crypto provider, offering ALPN `http/1.1`.
//! A certificate or protocol rejection from rustls is reported as
//! [`WebSocketError::Tls`], which the connect loop does not retry.

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::rustls;

use crate::connector::{BoxedStream, Connector};
use crate::error::{Result, WebSocketError};
use crate::handshake::Target;

/// Connects over TCP, adding TLS for `wss://` targets.
#[derive(Clone)]
pub struct TcpConnector {
    #[cfg(feature = "tls")]
    tls: tokio_rustls::TlsConnector,
}

impl TcpConnector {
    /// Create a connector trusting the bundled web PKI roots.
    ///
    /// # Errors
    ///
    /// Returns [`WebSocketError::Tls`] if the TLS configuration cannot be built.
    pub fn new() -> Result<Self> {
        #[cfg(feature = "tls")]
        {
            Ok(Self::with_tls_config(Arc::new(default_tls_config()?)))
        }
        #[cfg(not(feature = "tls"))]
        {
            Ok(Self {})
        }
    }

    /// Create a connector using a caller-built rustls configuration
    /// (private roots, client certificates, a different provider).
    #[cfg(feature = "tls")]
    pub fn with_tls_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tls: tokio_rustls::TlsConnector::from(config),
        }
    }

    #[cfg(feature = "tls")]
    async fn wrap_tls(&self, target: &Target, tcp: TcpStream) -> Result<BoxedStream> {
        let domain = rustls::pki_types::ServerName::try_from(target.connect_host().to_string())
            .map_err(|_| WebSocketError::Tls(format!("invalid server name {:?}", target.host)))?;
        let stream = self
            .tls
            .connect(domain, tcp)
            .await
            .map_err(classify_tls_error)?;
        debug!(host = %target.host, "TLS session established");
        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "tls"))]
    #[allow(clippy::unused_async)]
    async fn wrap_tls(&self, _target: &Target, _tcp: TcpStream) -> Result<BoxedStream> {
        Err(WebSocketError::Tls("tls feature not enabled".to_string()))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, target: &Target) -> Result<BoxedStream> {
        debug!(host = %target.host, port = target.port, tls = target.tls, "opening TCP connection");
        let tcp = TcpStream::connect((target.connect_host(), target.port)).await?;
        tcp.set_nodelay(true)?;
        if target.tls {
            self.wrap_tls(target, tcp).await
        } else {
            Ok(Box::new(tcp))
        }
    }
}

impl std::fmt::Debug for TcpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnector")
            .field("tls", &cfg!(feature = "tls"))
            .finish()
    }
}

#[cfg(feature = "tls")]
fn default_tls_config() -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| WebSocketError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// tokio-rustls reports handshake rejections as `InvalidData` I/O errors
/// wrapping a `rustls::Error`; everything else is a plain socket failure.
#[cfg(feature = "tls")]
fn classify_tls_error(err: std::io::Error) -> WebSocketError {
    if err
        .get_ref()
        .is_some_and(|inner| inner.is::<rustls::Error>())
    {
        WebSocketError::Tls(err.to_string())
    } else {
        WebSocketError::Io(err)
    }
}

#[cfg(all(test, feature = "tls"))]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn default_config_builds_with_roots_and_alpn() {
        let config = default_tls_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert!(TcpConnector::new().is_ok());
    }

    #[test]
    fn rustls_rejections_are_fatal() {
        let rejected = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::General("certificate expired".into()),
        );
        let err = classify_tls_error(rejected);
        assert!(err.is_fatal());
    }

    #[test]
    fn socket_failures_stay_retryable() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let err = classify_tls_error(reset);
        assert!(matches!(err, WebSocketError::Io(_)));
        assert!(!err.is_fatal());
    }
}
