use crate::storage::{Accessor, AuthMetadata, PathList, TokenAuth, TokenTTL};
use async_trait::async_trait;
use base64::prelude::*;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Accessor that probes live TLS endpoints instead of reading a secret
/// store. Listing returns the configured hosts; `get` performs a handshake
/// and hands back the peer's leaf certificate re-encoded as PEM. There is
/// no token, so authentication reports an infinite TTL.
pub struct TlsClientAccessor {
    name: String,
    hosts: Vec<String>,
    timeout: Option<Duration>,
    connector: TlsConnector,
}

/// Expiry observation requires the certificate, not trust in it. Expired
/// and self-signed endpoints are exactly the ones worth watching, so
/// verification is disabled outright.
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

impl TlsClientAccessor {
    pub fn from_config(
        name: String,
        properties: &HashMap<String, serde_yaml::Value>,
    ) -> crate::Result<Self> {
        let hosts_config = properties
            .get("hosts")
            .and_then(|v| v.as_sequence())
            .ok_or_else(|| crate::DoomsdayError::config("TLS hosts list is required"))?;

        let mut hosts = Vec::new();
        for host in hosts_config {
            let host = host
                .as_str()
                .ok_or_else(|| crate::DoomsdayError::config("TLS hosts must be strings"))?;
            hosts.push(canonize_host(host));
        }

        if hosts.is_empty() {
            return Err(crate::DoomsdayError::config(
                "TLS hosts list must not be empty",
            ));
        }

        let timeout = properties
            .get("timeout")
            .and_then(|v| v.as_u64())
            .filter(|&seconds| seconds > 0)
            .map(Duration::from_secs);

        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();

        Ok(TlsClientAccessor {
            name,
            hosts,
            timeout,
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    async fn fetch_peer_cert(&self, target: &str) -> crate::Result<Option<Vec<u8>>> {
        let host = target.rsplit_once(':').map(|(h, _)| h).unwrap_or(target);
        let server_name = rustls::ServerName::try_from(host).map_err(|e| {
            crate::DoomsdayError::backend(format!("Invalid TLS server name {}: {}", host, e))
        })?;

        let stream = TcpStream::connect(target).await?;
        let tls_stream = self.connector.connect(server_name, stream).await?;

        let (_, session) = tls_stream.get_ref();
        Ok(session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec()))
    }
}

fn canonize_host(host: &str) -> String {
    let host = host
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_string();
    if host.contains(':') {
        host
    } else {
        format!("{}:443", host)
    }
}

fn pem_encode(der: &[u8]) -> String {
    let encoded = BASE64_STANDARD.encode(der);
    let wrapped = encoded
        .as_bytes()
        .chunks(64)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
        wrapped
    )
}

#[async_trait]
impl Accessor for TlsClientAccessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self, _last: &AuthMetadata) -> crate::Result<TokenAuth> {
        Ok(TokenAuth {
            ttl: TokenTTL::Infinite,
            metadata: AuthMetadata::None,
        })
    }

    async fn list(&self) -> crate::Result<PathList> {
        Ok(self.hosts.clone())
    }

    async fn get(&self, path: &str) -> crate::Result<HashMap<String, String>> {
        let fetch = self.fetch_peer_cert(path);
        let der = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fetch).await.map_err(|_| {
                crate::DoomsdayError::backend(format!(
                    "TLS probe `{}' timed out connecting to {}",
                    self.name, path
                ))
            })??,
            None => fetch.await?,
        };

        let mut ret = HashMap::new();
        if let Some(der) = der {
            ret.insert("cert".to_string(), pem_encode(&der));
        }
        Ok(ret)
    }
}
