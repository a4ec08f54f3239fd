use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;
use scc::HashMap;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

type UpstreamClient = Client<HttpsConnector<HttpConnector>, AxumBody>;

/// HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2 via ALPN).
///
/// The connect timeout is a property of the connector, so one pooled client
/// is kept per distinct timeout; routes sharing a timeout share connections.
pub struct HttpClientAdapter {
    tls_config: rustls::ClientConfig,
    clients: HashMap<Duration, UpstreamClient>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::debug!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        Ok(Self {
            tls_config,
            clients: HashMap::new(),
        })
    }

    fn build_client(&self, connect_timeout: Duration) -> UpstreamClient {
        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(connect_timeout));
        http_connector.set_nodelay(true);

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(self.tls_config.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        tracing::debug!(?connect_timeout, "Created upstream HTTP client");
        Client::builder(TokioExecutor::new()).build::<_, AxumBody>(https_connector)
    }

    fn client_for(&self, connect_timeout: Duration) -> UpstreamClient {
        if let Some(client) = self.clients.read(&connect_timeout, |_, c| c.clone()) {
            return client;
        }
        self.clients
            .entry(connect_timeout)
            .or_insert_with(|| self.build_client(connect_timeout))
            .get()
            .clone()
    }

    /// Set the Host header from the outgoing URI authority.
    fn set_host_header(req: &mut Request<AxumBody>) -> HttpClientResult<()> {
        let Some(authority) = req.uri().authority() else {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        };
        let value = HeaderValue::from_str(authority.as_str())
            .map_err(|e| HttpClientError::InvalidRequest(format!("invalid authority: {e}")))?;
        req.headers_mut().insert(header::HOST, value);
        Ok(())
    }
}

/// Whether any error in the source chain is an I/O timeout.
fn is_timeout(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = e.source();
    }
    false
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
        connect_timeout: Duration,
    ) -> HttpClientResult<Response<AxumBody>> {
        Self::set_host_header(&mut req)?;

        let client = self.client_for(connect_timeout);
        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        tracing::debug!("Outgoing request headers: {:?}", parts.headers);

        let outgoing_request = Request::from_parts(parts, body);
        let method = outgoing_request.method().clone();
        let uri = outgoing_request.uri().clone();

        match client.request(outgoing_request).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // Axum re-frames the streamed body downstream.
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::debug!("Upstream request {} {} failed: {:?}", method, uri, e);
                if e.is_connect() && is_timeout(&e) {
                    Err(HttpClientError::ConnectTimeout(connect_timeout))
                } else {
                    Err(HttpClientError::ConnectionError(format!(
                        "Request to {method} {uri} failed: {e}"
                    )))
                }
            }
        }
    }
}
