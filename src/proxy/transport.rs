//! Outbound transport towards rule backends
//!
//! Two pooled HTTP/1.1 clients share the process: one verifying backend
//! certificates against the webpki roots, one for rules flagged `insecure`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tracing::{debug, warn};

use crate::error::{Result, VillipError};

/// Timeout for establishing a backend connection, TLS handshake included
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Pooled client used to reach backends
pub type BackendClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Certificate verifier accepting any backend certificate
#[derive(Debug)]
pub struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl NoVerifier {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            schemes: provider.signature_verification_algorithms.supported_schemes(),
        }
    }
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

fn http_connector() -> HttpConnector {
    let mut http = HttpConnector::new();
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http.enforce_http(false);
    http
}

fn build_client(connector: HttpsConnector<HttpConnector>) -> BackendClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(connector)
}

/// Backend clients shared by every HTTP listener
#[derive(Clone)]
pub struct BackendClients {
    verified: BackendClient,
    insecure: BackendClient,
}

impl BackendClients {
    pub fn new() -> Result<Self> {
        let provider = Arc::new(ring::default_provider());

        let verified = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(provider.clone())
            .map_err(|e| VillipError::Internal(format!("TLS setup failed: {}", e)))?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector());

        let tls = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| VillipError::Internal(format!("TLS setup failed: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier::new(&provider)))
            .with_no_client_auth();
        let insecure = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector());

        debug!(connect_timeout = ?CONNECT_TIMEOUT, "backend clients ready");
        Ok(Self {
            verified: build_client(verified),
            insecure: build_client(insecure),
        })
    }

    /// Client to use for a rule
    pub fn get(&self, insecure: bool) -> &BackendClient {
        if insecure {
            warn!("Not checking SSL certificates");
            &self.insecure
        } else {
            &self.verified
        }
    }
}
