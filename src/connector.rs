//! Transport establishment.
//!
//! A [`Connector`] turns a [`Request`] into a live duplex byte stream. The
//! stream controller calls it once per `open()` and again on every reconnect;
//! it never sees a half-built connection, only a ready stream or an error.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::request::{Request, Transport};
use crate::retry::with_timeout;

/// Default bound on TCP connect, TLS negotiation, and handshake write.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Establishes a duplex byte stream for a [`Request`].
pub trait Connector: Send + Sync + 'static {
    /// The live connection handed to the read loop.
    type Io: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Connects to the request's endpoint and completes any session setup.
    fn connect(
        &self,
        request: &Request,
    ) -> impl Future<Output = Result<Self::Io, ConnectError>> + Send;
}

/// Errors produced while establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// TCP connect failed.
    #[error("connect to {endpoint} failed: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Host could not be used as a TLS server name.
    #[error("invalid tls server name: {0}")]
    InvalidServerName(String),

    /// TLS client configuration could not be built.
    #[error("tls configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),

    /// TLS negotiation with the endpoint failed.
    #[error("tls handshake failed: {0}")]
    TlsHandshake(#[source] io::Error),

    /// Writing the request handshake failed.
    #[error("request handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// The connect phase did not finish in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

impl ConnectError {
    /// Whether another attempt could succeed without changing the request or
    /// connector configuration.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectError::InvalidServerName(_) | ConnectError::TlsConfig(_)
        )
    }
}

/// TCP or TLS connector backed by tokio and rustls.
#[derive(Clone, Debug)]
pub struct NetConnector {
    connect_timeout: Duration,
    tls_config: Option<Arc<ClientConfig>>,
}

impl NetConnector {
    /// Creates a connector that trusts the platform's native root
    /// certificates. Roots are loaded on the first TLS connect.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls_config: None,
        }
    }

    /// Sets the connect-phase timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Uses an explicit TLS client configuration instead of native roots.
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Bound on the whole connect phase.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn tls_config(&self) -> Result<Arc<ClientConfig>, ConnectError> {
        if let Some(config) = &self.tls_config {
            return Ok(Arc::clone(config));
        }

        static NATIVE: OnceLock<Arc<ClientConfig>> = OnceLock::new();
        if let Some(config) = NATIVE.get() {
            return Ok(Arc::clone(config));
        }
        let config = native_client_config()?;
        Ok(Arc::clone(NATIVE.get_or_init(|| config)))
    }

    async fn establish(&self, request: &Request) -> Result<NetStream, ConnectError> {
        let tcp = TcpStream::connect((request.host(), request.port()))
            .await
            .map_err(|source| ConnectError::Io {
                endpoint: request.endpoint(),
                source,
            })?;
        if let Err(err) = tcp.set_nodelay(true) {
            debug!(event = "set_nodelay_failed", error = %err);
        }

        let mut stream = match request.transport() {
            Transport::Plain => NetStream::Plain(tcp),
            Transport::Tls => {
                let server_name = ServerName::try_from(request.host().to_string())
                    .map_err(|_| ConnectError::InvalidServerName(request.host().to_string()))?;
                let tls = TlsConnector::from(self.tls_config()?)
                    .connect(server_name, tcp)
                    .await
                    .map_err(ConnectError::TlsHandshake)?;
                NetStream::Tls(Box::new(tls))
            }
        };

        if let Some(handshake) = request.handshake() {
            stream
                .write_all(handshake.expose_secret().as_bytes())
                .await
                .map_err(ConnectError::Handshake)?;
            stream.flush().await.map_err(ConnectError::Handshake)?;
        }

        Ok(stream)
    }
}

impl Default for NetConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for NetConnector {
    type Io = NetStream;

    async fn connect(&self, request: &Request) -> Result<NetStream, ConnectError> {
        let timeout = self.connect_timeout;
        with_timeout(timeout, self.establish(request))
            .await
            .map_err(|_| ConnectError::Timeout(timeout))?
    }
}

fn native_client_config() -> Result<Arc<ClientConfig>, ConnectError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(event = "native_root_load_failed", error = %err);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!(event = "native_roots_loaded", added, ignored);

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Connection produced by [`NetConnector`].
#[derive(Debug)]
pub enum NetStream {
    /// Plain TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for NetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(tcp) => Pin::new(tcp).poll_read(cx, buf),
            NetStream::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetStream::Plain(tcp) => Pin::new(tcp).poll_write(cx, buf),
            NetStream::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(tcp) => Pin::new(tcp).poll_flush(cx),
            NetStream::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Plain(tcp) => Pin::new(tcp).poll_shutdown(cx),
            NetStream::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use super::{ConnectError, NetConnector, DEFAULT_CONNECT_TIMEOUT};

    #[test]
    fn connector_uses_default_timeout() {
        assert_eq!(NetConnector::new().connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        let connector = NetConnector::new().with_connect_timeout(Duration::from_millis(250));
        assert_eq!(connector.connect_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        assert!(!ConnectError::InvalidServerName("bad name".to_string()).is_retryable());
        assert!(ConnectError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ConnectError::Io {
            endpoint: "localhost:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        }
        .is_retryable());
    }
}
