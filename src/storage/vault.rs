use crate::storage::{Accessor, AuthMetadata, PathFilter, PathList, TokenAuth, TokenTTL};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Accessor for a HashiCorp Vault KV-v2 mount, authenticated with a
/// pre-issued token. Renewable tokens are kept alive with renew-self;
/// everything else is just re-inspected with lookup-self.
pub struct VaultAccessor {
    name: String,
    client: Client,
    address: Url,
    token: String,
    mount: String,
    base_path: String,
    only: PathFilter,
    except: PathFilter,
}

/// Whether the token was renewable the last time we looked, so the next
/// auth pass knows to renew instead of merely re-inspecting.
#[derive(Debug, Clone)]
pub struct VaultAuthMetadata {
    pub renewable: bool,
}

#[derive(Debug, Deserialize)]
struct LookupSelfResponse {
    data: LookupSelfData,
}

#[derive(Debug, Deserialize)]
struct LookupSelfData {
    ttl: u64,
    renewable: bool,
}

#[derive(Debug, Deserialize)]
struct RenewSelfResponse {
    auth: RenewSelfAuth,
}

#[derive(Debug, Deserialize)]
struct RenewSelfAuth {
    lease_duration: u64,
    renewable: bool,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Debug, Deserialize)]
struct ListData {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SecretResponse {
    data: SecretData,
}

#[derive(Debug, Deserialize)]
struct SecretData {
    data: HashMap<String, serde_json::Value>,
}

impl VaultAccessor {
    pub fn from_config(
        name: String,
        properties: &HashMap<String, serde_yaml::Value>,
    ) -> crate::Result<Self> {
        let address = properties
            .get("address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::DoomsdayError::config("Vault address is required"))?;
        let address = Url::parse(address)
            .map_err(|e| crate::DoomsdayError::config(format!("Invalid Vault address: {}", e)))?;

        let token = properties
            .get("token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| crate::DoomsdayError::config("Vault token is required"))?
            .to_string();

        let mount = properties
            .get("mount")
            .and_then(|v| v.as_str())
            .unwrap_or("secret")
            .trim_matches('/')
            .to_string();

        let base_path = properties
            .get("base_path")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim_matches('/')
            .to_string();

        let insecure = properties
            .get("insecure_skip_verify")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(VaultAccessor {
            name,
            client,
            address,
            token,
            mount,
            base_path,
            only: parse_filter(properties.get("only")),
            except: parse_filter(properties.get("except")),
        })
    }

    fn api_url(&self, segment: &str, path: &str) -> String {
        format!(
            "{}/v1/{}/{}/{}",
            self.address.as_str().trim_end_matches('/'),
            self.mount,
            segment,
            path.trim_start_matches('/')
        )
    }

    async fn lookup_self(&self) -> crate::Result<TokenAuth> {
        let url = format!(
            "{}/v1/auth/token/lookup-self",
            self.address.as_str().trim_end_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;

        if response.status() == StatusCode::FORBIDDEN {
            return Err(crate::DoomsdayError::auth(format!(
                "Vault `{}' rejected the configured token",
                self.name
            )));
        }
        if !response.status().is_success() {
            return Err(crate::DoomsdayError::backend(format!(
                "Vault `{}' token lookup returned {}",
                self.name,
                response.status()
            )));
        }

        let lookup: LookupSelfResponse = response.json().await?;
        Ok(TokenAuth {
            ttl: ttl_from_seconds(lookup.data.ttl),
            metadata: AuthMetadata::Vault(VaultAuthMetadata {
                renewable: lookup.data.renewable,
            }),
        })
    }

    async fn renew_self(&self) -> crate::Result<TokenAuth> {
        let url = format!(
            "{}/v1/auth/token/renew-self",
            self.address.as_str().trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(crate::DoomsdayError::auth(format!(
                "Vault `{}' token renewal returned {}",
                self.name,
                response.status()
            )));
        }

        let renewed: RenewSelfResponse = response.json().await?;
        Ok(TokenAuth {
            ttl: ttl_from_seconds(renewed.auth.lease_duration),
            metadata: AuthMetadata::Vault(VaultAuthMetadata {
                renewable: renewed.auth.renewable,
            }),
        })
    }
}

/// Vault reports a TTL of zero for tokens that never expire.
fn ttl_from_seconds(seconds: u64) -> TokenTTL {
    if seconds == 0 {
        TokenTTL::Infinite
    } else {
        TokenTTL::Expires(Duration::from_secs(seconds))
    }
}

fn parse_filter(value: Option<&serde_yaml::Value>) -> PathFilter {
    let mut filter = PathFilter::default();
    let Some(value) = value else {
        return filter;
    };

    let strings = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|v| v.as_sequence())
            .map(|seq| {
                seq.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    filter.under = strings("under");
    filter.matching = strings("matching");
    filter
}

#[async_trait]
impl Accessor for VaultAccessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self, last: &AuthMetadata) -> crate::Result<TokenAuth> {
        match last {
            AuthMetadata::Vault(meta) if meta.renewable => match self.renew_self().await {
                Ok(auth) => Ok(auth),
                Err(e) => {
                    tracing::warn!(
                        "Vault `{}': token renewal failed ({}), falling back to lookup",
                        self.name,
                        e
                    );
                    self.lookup_self().await
                }
            },
            _ => self.lookup_self().await,
        }
    }

    async fn list(&self) -> crate::Result<PathList> {
        let mut leaves = Vec::new();
        let mut to_process = vec![self.base_path.clone()];

        while let Some(current) = to_process.pop() {
            let url = self.api_url("metadata", &current);
            let response = self
                .client
                .get(&url)
                .header("X-Vault-Token", &self.token)
                .query(&[("list", "true")])
                .send()
                .await?;

            match response.status() {
                StatusCode::NOT_FOUND => continue,
                StatusCode::FORBIDDEN => {
                    return Err(crate::DoomsdayError::auth_expired(format!(
                        "Vault `{}' rejected the token while listing {}",
                        self.name, current
                    )))
                }
                status if !status.is_success() => {
                    return Err(crate::DoomsdayError::backend(format!(
                        "Vault `{}' list of {} returned {}",
                        self.name, current, status
                    )))
                }
                _ => {}
            }

            let listing: ListResponse = response.json().await?;
            for key in listing.data.keys {
                let full = if current.is_empty() {
                    key.clone()
                } else {
                    format!("{}/{}", current.trim_end_matches('/'), key)
                };

                if key.ends_with('/') {
                    to_process.push(full.trim_end_matches('/').to_string());
                } else {
                    leaves.push(full);
                }
            }
        }

        if !self.only.is_empty() {
            leaves = self.only.only(&leaves);
        }
        if !self.except.is_empty() {
            leaves = self.except.except(&leaves);
        }

        Ok(leaves)
    }

    async fn get(&self, path: &str) -> crate::Result<HashMap<String, String>> {
        let url = self.api_url("data", path);
        let response = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(HashMap::new()),
            StatusCode::FORBIDDEN => {
                return Err(crate::DoomsdayError::auth_expired(format!(
                    "Vault `{}' rejected the token while reading {}",
                    self.name, path
                )))
            }
            status if !status.is_success() => {
                return Err(crate::DoomsdayError::backend(format!(
                    "Vault `{}' read of {} returned {}",
                    self.name, path, status
                )))
            }
            _ => {}
        }

        let secret: SecretResponse = response.json().await?;
        Ok(secret
            .data
            .data
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect())
    }
}
