//! Key-Exchange API
//!
//! The remote service that registers a device's new WireGuard public key.
//! The server only replaces a key when the submitted old key still matches
//! its registered one, so a stale caller (another device or session rotated
//! first) is rejected instead of silently taking over.

use crate::keys::PublicKey;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request, Uri};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Tunnel addresses the server assigned to the newly registered key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AssignedAddresses {
    pub ipv4_address: Ipv4Addr,
    pub ipv6_address: Ipv6Addr,
}

/// Key-exchange failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a server verdict (connect, TLS, I/O).
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The server refused the exchange (e.g. the old key is stale).
    #[error("Server rejected the key exchange (code {0})")]
    Rejected(u16),
}

/// Remote registration of a replacement public key.
pub trait KeyExchangeApi: Send + Sync {
    /// Ask the server to replace `old_public_key` with `new_public_key` for
    /// `account_token`, returning the addresses assigned to the new key.
    fn replace_key(
        &self,
        account_token: &str,
        old_public_key: &PublicKey,
        new_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = Result<AssignedAddresses, ApiError>> + Send;
}

#[derive(Serialize)]
struct ReplaceKeyRequest<'a> {
    account_token: &'a str,
    old_public_key: &'a PublicKey,
    new_public_key: &'a PublicKey,
}

/// JSON-over-HTTPS client for the key-exchange endpoint.
pub struct RestKeyExchange {
    base_url: String,
    user_agent: String,
}

impl RestKeyExchange {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            user_agent: concat!("wg-keyvault/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    async fn post_json(&self, path: &str, body: Vec<u8>) -> Result<(u16, Vec<u8>), ApiError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        let uri: Uri = url
            .parse()
            .map_err(|err: hyper::http::uri::InvalidUri| ApiError::Transport(err.to_string()))?;

        let host = uri
            .host()
            .ok_or_else(|| ApiError::Transport("no host in URL".to_string()))?
            .to_string();
        let is_https = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header(USER_AGENT, &self.user_agent)
            .header(CONTENT_TYPE, "application/json")
            .header("Host", host.as_str())
            .body(Full::new(Bytes::from(body)))
            .map_err(|err| ApiError::Transport(err.to_string()))?;

        let addr = format!("{host}:{port}");
        let stream = tokio::net::TcpStream::connect(&addr)
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;

        let response = if is_https {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| ApiError::Transport("invalid server name".to_string()))?;

            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|err| ApiError::Transport(err.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|err| ApiError::Transport(err.to_string()))?;

            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    warn!("key-exchange connection error: {err}");
                }
            });

            sender
                .send_request(request)
                .await
                .map_err(|err| ApiError::Transport(err.to_string()))?
        } else {
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|err| ApiError::Transport(err.to_string()))?;

            tokio::spawn(async move {
                if let Err(err) = conn.await {
                    warn!("key-exchange connection error: {err}");
                }
            });

            sender
                .send_request(request)
                .await
                .map_err(|err| ApiError::Transport(err.to_string()))?
        };

        let status = response.status().as_u16();
        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))?;

        Ok((status, collected.to_bytes().to_vec()))
    }
}

impl KeyExchangeApi for RestKeyExchange {
    async fn replace_key(
        &self,
        account_token: &str,
        old_public_key: &PublicKey,
        new_public_key: &PublicKey,
    ) -> Result<AssignedAddresses, ApiError> {
        let body = serde_json::to_vec(&ReplaceKeyRequest {
            account_token,
            old_public_key,
            new_public_key,
        })
        .map_err(|err| ApiError::Transport(err.to_string()))?;

        let (status, response_body) = self.post_json("/v1/replace-wireguard-key", body).await?;

        if !(200..300).contains(&status) {
            debug!(status, "key exchange rejected");
            return Err(ApiError::Rejected(status));
        }

        let addresses: AssignedAddresses = serde_json::from_slice(&response_body)
            .map_err(|err| ApiError::Transport(err.to_string()))?;

        debug!(
            ipv4 = %addresses.ipv4_address,
            ipv6 = %addresses.ipv6_address,
            "key exchange accepted"
        );
        Ok(addresses)
    }
}
