//! HTTP client construction for the signer.
//!
//! The signer is often reached by IP or by an internal name that differs
//! from the name on its certificate. When a TLS server name is configured,
//! requests are addressed to that name and the name is pinned to the socket
//! address of the configured address, so SNI and certificate verification
//! use the expected identity without relying on DNS for it.

use std::net::{IpAddr, SocketAddr};

use reqwest::{Certificate, Client, Url};
use tokio::net::lookup_host;
use tracing::debug;

use crate::config::CredentialAuthorityConfig;
use crate::files;

use super::CaError;

/// Base URL to send requests to, plus an optional name-to-address pin.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Endpoint {
    pub(crate) base_url: Url,
    pub(crate) pinned: Option<(String, SocketAddr)>,
}

fn address_error(authority: &CredentialAuthorityConfig, message: impl Into<String>) -> CaError {
    CaError::Address {
        addr: authority.addr.clone(),
        message: message.into(),
    }
}

/// Resolves where requests for `authority` go.
pub(crate) async fn endpoint(authority: &CredentialAuthorityConfig) -> Result<Endpoint, CaError> {
    let mut base_url =
        Url::parse(&authority.addr).map_err(|err| address_error(authority, err.to_string()))?;
    let host = base_url
        .host_str()
        .ok_or_else(|| address_error(authority, "address has no host"))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_owned();
    if host == authority.tls_server_name {
        return Ok(Endpoint {
            base_url,
            pinned: None,
        });
    }

    let port = base_url
        .port_or_known_default()
        .ok_or_else(|| address_error(authority, "address has no port"))?;
    let address = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => lookup_host((host.as_str(), port))
            .await
            .map_err(|err| address_error(authority, err.to_string()))?
            .next()
            .ok_or_else(|| address_error(authority, "address did not resolve"))?,
    };
    base_url
        .set_host(Some(&authority.tls_server_name))
        .map_err(|err| address_error(authority, err.to_string()))?;
    debug!(
        server_name = %authority.tls_server_name,
        %address,
        "pinning certificate authority address"
    );
    Ok(Endpoint {
        base_url,
        pinned: Some((authority.tls_server_name.clone(), address)),
    })
}

/// Builds the HTTP client for `endpoint`, trusting only the configured
/// anchor when one is set.
pub(crate) fn build_client(
    authority: &CredentialAuthorityConfig,
    endpoint: &Endpoint,
) -> Result<Client, CaError> {
    let mut builder = Client::builder().use_rustls_tls();
    if let Some(anchor) = &authority.tls_ca_cert {
        let pem = files::read(anchor).map_err(|err| CaError::Read {
            path: anchor.clone(),
            message: err.to_string(),
        })?;
        let certificate =
            Certificate::from_pem(&pem).map_err(|err| CaError::Tls(err.to_string()))?;
        builder = builder
            .tls_built_in_root_certs(false)
            .add_root_certificate(certificate);
    }
    if let Some((server_name, address)) = &endpoint.pinned {
        builder = builder.resolve(server_name, *address);
    }
    builder.build().map_err(|err| CaError::Tls(err.to_string()))
}
