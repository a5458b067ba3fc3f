use crate::storage::{Accessor, AuthMetadata, PathList, TokenAuth, TokenTTL};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Accessor for a Pivotal Ops Manager. Authentication goes through the
/// colocated UAA with the resource-owner password grant; re-auth prefers
/// the refresh token round-tripped through the scheduler and falls back to
/// the password grant when that token has gone stale.
pub struct OmAccessor {
    name: String,
    client: Client,
    address: String,
    username: String,
    password: String,
    client_id: String,
    client_secret: String,
    access_token: RwLock<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct OmAuthMetadata {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct UaaTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct DeployedProduct {
    guid: String,
}

#[derive(Debug, Deserialize)]
struct CredentialReferences {
    credentials: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    credential: Credential,
}

#[derive(Debug, Deserialize)]
struct Credential {
    value: HashMap<String, serde_json::Value>,
}

impl OmAccessor {
    pub fn from_config(
        name: String,
        properties: &HashMap<String, serde_yaml::Value>,
    ) -> crate::Result<Self> {
        let get_str = |key: &str| -> Option<String> {
            properties
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let address = get_str("address")
            .ok_or_else(|| crate::DoomsdayError::config("Ops Manager address is required"))?
            .trim_end_matches('/')
            .to_string();
        let username = get_str("username")
            .ok_or_else(|| crate::DoomsdayError::config("Ops Manager username is required"))?;
        let password = get_str("password")
            .ok_or_else(|| crate::DoomsdayError::config("Ops Manager password is required"))?;
        let client_id = get_str("client_id").unwrap_or_else(|| "opsman".to_string());
        let client_secret = get_str("client_secret").unwrap_or_default();

        let insecure = properties
            .get("insecure_skip_verify")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(OmAccessor {
            name,
            client,
            address,
            username,
            password,
            client_id,
            client_secret,
            access_token: RwLock::new(None),
        })
    }

    async fn uaa_token(&self, form: &[(&str, &str)]) -> crate::Result<UaaTokenResponse> {
        let url = format!("{}/uaa/oauth/token", self.address);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(crate::DoomsdayError::auth(format!(
                "Ops Manager `{}' UAA returned {}",
                self.name,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    async fn password_grant(&self) -> crate::Result<UaaTokenResponse> {
        self.uaa_token(&[
            ("grant_type", "password"),
            ("username", &self.username),
            ("password", &self.password),
        ])
        .await
    }

    async fn refresh_grant(&self, refresh_token: &str) -> crate::Result<UaaTokenResponse> {
        self.uaa_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    fn bearer(&self) -> crate::Result<String> {
        self.access_token
            .read()
            .map_err(|_| crate::DoomsdayError::internal("Ops Manager token lock poisoned"))?
            .clone()
            .ok_or_else(|| {
                crate::DoomsdayError::auth(format!(
                    "Ops Manager `{}' has not authenticated yet",
                    self.name
                ))
            })
    }

    async fn api_get(&self, path: &str) -> crate::Result<reqwest::Response> {
        let token = self.bearer()?;
        let url = format!("{}{}", self.address, path);
        let response = self.client.get(&url).bearer_auth(&token).send().await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(crate::DoomsdayError::auth_expired(format!(
                "Ops Manager `{}' rejected the access token",
                self.name
            ))),
            status if !status.is_success() && status != StatusCode::NOT_FOUND => {
                Err(crate::DoomsdayError::backend(format!(
                    "Ops Manager `{}' request to {} returned {}",
                    self.name, path, status
                )))
            }
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl Accessor for OmAccessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self, last: &AuthMetadata) -> crate::Result<TokenAuth> {
        let token = match last {
            AuthMetadata::OpsManager(meta) => match self.refresh_grant(&meta.refresh_token).await {
                Ok(token) => token,
                Err(e) => {
                    tracing::warn!(
                        "Ops Manager `{}': refresh grant failed ({}), using password grant",
                        self.name,
                        e
                    );
                    self.password_grant().await?
                }
            },
            _ => self.password_grant().await?,
        };

        *self
            .access_token
            .write()
            .map_err(|_| crate::DoomsdayError::internal("Ops Manager token lock poisoned"))? =
            Some(token.access_token.clone());

        let metadata = match token.refresh_token {
            Some(refresh_token) => AuthMetadata::OpsManager(OmAuthMetadata { refresh_token }),
            None => AuthMetadata::None,
        };

        Ok(TokenAuth {
            ttl: TokenTTL::Expires(Duration::from_secs(token.expires_in)),
            metadata,
        })
    }

    async fn list(&self) -> crate::Result<PathList> {
        let response = self.api_get("/api/v0/deployed/products").await?;
        let deployments: Vec<DeployedProduct> = response.json().await?;

        let mut paths = Vec::new();
        for deployment in deployments {
            let credentials_path = format!(
                "/api/v0/deployed/products/{}/credentials",
                deployment.guid
            );
            let response = self.api_get(&credentials_path).await?;
            let references: CredentialReferences = response.json().await?;

            for credential in references.credentials {
                paths.push(format!("{}/{}", credentials_path, credential));
            }
        }

        Ok(paths)
    }

    async fn get(&self, path: &str) -> crate::Result<HashMap<String, String>> {
        let response = self.api_get(path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(HashMap::new());
        }

        let credential: CredentialResponse = response.json().await?;
        Ok(credential
            .credential
            .value
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) => Some((k, s)),
                _ => None,
            })
            .collect())
    }
}
