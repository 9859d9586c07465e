//! Agent-side connector.
//!
//! Dials a hub's uplink endpoint, presents the agent name, and wraps the
//! socket symmetrically to the hub: framed channel (binary, default
//! liveness) under a multiplexer session in the accept role. The resulting
//! [`MuxListener`] plugs straight into an RPC server's incoming-connection
//! stream; the hub opens one substream per proxied call.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::{debug, info};
use url::Url;
use uplink_mux::{MuxListener, MuxMode, MuxSession};
use uplink_ws::{socket_config, FramedConfig, FramedSocket};

/// Header carrying the agent name on an uplink request.
pub const META_NAME_HEADER: &str = "X-Hub-Meta-Name";

/// Connector errors.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("agent name is empty")]
    EmptyName,

    #[error("agent name is not a valid header value")]
    InvalidName,

    #[error("invalid hub url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported hub url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("websocket handshake failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// How to reach the hub.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Full uplink URL, including the `/ws` path,
    /// e.g. `ws://hub.example.com:8080/ws`.
    pub hub_url: String,
    /// Name this agent registers under. Must be unique per hub.
    pub agent_name: String,
    /// Skip TLS certificate verification (development only, insecure).
    pub insecure_skip_verify: bool,
}

/// An established uplink: the session handle plus the substream listener.
pub struct AgentUplink {
    session: MuxSession,
    listener: MuxListener,
}

impl AgentUplink {
    /// Dial the hub and stack the uplink layers.
    pub async fn connect(config: &ConnectorConfig) -> Result<Self, ConnectorError> {
        if config.agent_name.is_empty() {
            return Err(ConnectorError::EmptyName);
        }

        let url = Url::parse(&config.hub_url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConnectorError::UnsupportedScheme(other.to_string())),
        }

        let mut request = url.as_str().into_client_request()?;
        request.headers_mut().insert(
            META_NAME_HEADER,
            HeaderValue::from_str(&config.agent_name)
                .map_err(|_| ConnectorError::InvalidName)?,
        );

        let connector = config
            .insecure_skip_verify
            .then(|| Connector::Rustls(Arc::new(insecure_client_config())));

        debug!(url = %url, name = %config.agent_name, "dialing hub uplink");
        let (socket, _response) =
            connect_async_tls_with_config(request, Some(socket_config()), false, connector).await?;
        info!(name = %config.agent_name, "uplink connected");

        let framed = FramedSocket::new(socket, FramedConfig::default());
        let (session, listener) = MuxSession::new(framed, MuxMode::Accept);

        Ok(Self { session, listener })
    }

    /// Resolves when the uplink is lost; used by reconnect loops.
    pub async fn closed(&self) {
        self.session.closed().await;
    }

    /// Split into the session handle and the substream listener. The
    /// listener is what an RPC server consumes as incoming connections.
    pub fn into_parts(self) -> (MuxSession, MuxListener) {
        (self.session, self.listener)
    }
}

impl std::fmt::Debug for AgentUplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentUplink").finish()
    }
}

fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipVerification::new())
        .with_no_client_auth()
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
