//! Connection target and credentials for a stream.

use std::fmt;

use secrecy::SecretString;

/// Transport used to reach the endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Transport {
    /// TCP wrapped in a TLS session.
    #[default]
    Tls,
    /// Plain TCP. Intended for local development endpoints and test harnesses.
    Plain,
}

/// Endpoint address, transport, and authenticated handshake for a stream.
///
/// A `Request` is an already-validated value: the stream never inspects the
/// handshake, it only writes it after every successful connect.
#[derive(Clone)]
pub struct Request {
    host: String,
    port: u16,
    transport: Transport,
    handshake: Option<SecretString>,
}

impl Request {
    /// Creates a TLS request for `host:port` with no handshake.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into().trim().to_string(),
            port,
            transport: Transport::Tls,
            handshake: None,
        }
    }

    /// Selects the transport.
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Sets the authenticated preamble written on every connect.
    ///
    /// The preamble usually carries credentials, so it is kept secret and
    /// redacted from `Debug` output.
    pub fn with_handshake(mut self, handshake: SecretString) -> Self {
        self.handshake = Some(handshake);
        self
    }

    /// Host name, also used as the TLS server name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Selected transport.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Preamble written after every connect, if any.
    pub fn handshake(&self) -> Option<&SecretString> {
        self.handshake.as_ref()
    }

    /// `host:port` form used in logs.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("transport", &self.transport)
            .field("handshake", &self.handshake.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use secrecy::{ExposeSecret, SecretString};

    use super::{Request, Transport};

    #[test]
    fn request_defaults_to_tls_without_handshake() {
        let request = Request::new("stream.example.net", 443);
        assert_eq!(request.transport(), Transport::Tls);
        assert!(request.handshake().is_none());
        assert_eq!(request.endpoint(), "stream.example.net:443");
    }

    #[test]
    fn request_trims_host() {
        let request = Request::new("  localhost \n", 9000).with_transport(Transport::Plain);
        assert_eq!(request.host(), "localhost");
        assert_eq!(request.transport(), Transport::Plain);
    }

    #[test]
    fn debug_output_redacts_handshake() {
        let request = Request::new("localhost", 9000)
            .with_handshake(SecretString::new("AUTH super-secret\n".to_string()));
        let rendered = format!("{request:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("[REDACTED]"));
        assert_eq!(
            request.handshake().map(|h| h.expose_secret().as_str()),
            Some("AUTH super-secret\n")
        );
    }
}
