//! Outbound HTTPS client construction.
//!
//! Each pushkin owns one connection-pooled `reqwest::Client` built here, so
//! proxy and trust-anchor configuration is applied uniformly across
//! providers. APNs additionally runs HTTP/2 with prior knowledge.

use std::time::Duration;

use reqwest::{Certificate, Client, Identity, Proxy};

use crate::error::{Error, Result};

/// Per-request timeout applied to every outbound provider call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide options threaded into every pushkin's client.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Forward proxy URL for outbound traffic.
    pub proxy: Option<String>,

    /// Path to a PEM bundle of additional trust anchors.
    pub ca_file: Option<String>,
}

impl ClientOptions {
    /// Build options from the process configuration.
    #[must_use]
    pub fn new(proxy: Option<String>, ca_file: Option<String>) -> Self {
        Self { proxy, ca_file }
    }
}

/// Build an outbound client for one pushkin.
///
/// `http2_prior_knowledge` forces HTTP/2 without ALPN negotiation (APNs).
/// `identity_pem` installs a client TLS identity (APNs certificate auth).
pub async fn build_client(
    options: &ClientOptions,
    http2_prior_knowledge: bool,
    identity_pem: Option<&[u8]>,
) -> Result<Client> {
    let mut builder = Client::builder().timeout(REQUEST_TIMEOUT);

    if http2_prior_knowledge {
        builder = builder.http2_prior_knowledge();
    }

    if let Some(proxy_url) = &options.proxy {
        let proxy = Proxy::all(proxy_url)
            .map_err(|e| Error::Setup(format!("Invalid proxy URL '{proxy_url}': {e}")))?;
        builder = builder.proxy(proxy);
    }

    if let Some(ca_file) = &options.ca_file {
        let pem = tokio::fs::read(ca_file)
            .await
            .map_err(|e| Error::Setup(format!("Failed to read CA file '{ca_file}': {e}")))?;
        let certs = Certificate::from_pem_bundle(&pem)
            .map_err(|e| Error::Setup(format!("Failed to parse CA file '{ca_file}': {e}")))?;
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    if let Some(pem) = identity_pem {
        let identity = Identity::from_pem(pem)
            .map_err(|e| Error::Setup(format!("Failed to parse client certificate: {e}")))?;
        builder = builder.identity(identity);
    }

    Ok(builder.build()?)
}
