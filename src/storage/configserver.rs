use crate::storage::{Accessor, AuthMetadata, PathList, TokenAuth, TokenTTL};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Accessor for a CredHub-style config server. The UAA it trusts is
/// discovered from `/info`; authentication is the client-credentials grant
/// (or resource-owner password when a username is configured).
pub struct ConfigServerAccessor {
    name: String,
    client: Client,
    address: String,
    client_id: String,
    client_secret: String,
    username: Option<String>,
    password: Option<String>,
    auth_url: RwLock<Option<String>>,
    access_token: RwLock<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct UaaAuthMetadata {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    #[serde(rename = "auth-server")]
    auth_server: AuthServer,
}

#[derive(Debug, Deserialize)]
struct AuthServer {
    url: String,
}

#[derive(Debug, Deserialize)]
struct UaaTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct FindResponse {
    credentials: Vec<FoundCredential>,
}

#[derive(Debug, Deserialize)]
struct FoundCredential {
    name: String,
}

#[derive(Debug, Deserialize)]
struct DataResponse {
    data: Vec<CredentialVersion>,
}

#[derive(Debug, Deserialize)]
struct CredentialVersion {
    #[serde(rename = "type")]
    credential_type: String,
    value: serde_json::Value,
}

impl ConfigServerAccessor {
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
            .ok_or_else(|| crate::DoomsdayError::config("Config server address is required"))?
            .trim_end_matches('/')
            .to_string();
        let client_id = get_str("client_id")
            .ok_or_else(|| crate::DoomsdayError::config("Config server client_id is required"))?;
        let client_secret = get_str("client_secret").ok_or_else(|| {
            crate::DoomsdayError::config("Config server client_secret is required")
        })?;

        let insecure = properties
            .get("insecure_skip_verify")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(ConfigServerAccessor {
            name,
            client,
            address,
            client_id,
            client_secret,
            username: get_str("username"),
            password: get_str("password"),
            auth_url: RwLock::new(None),
            access_token: RwLock::new(None),
        })
    }

    async fn discover_auth_url(&self) -> crate::Result<String> {
        if let Some(url) = self
            .auth_url
            .read()
            .map_err(|_| crate::DoomsdayError::internal("Config server lock poisoned"))?
            .clone()
        {
            return Ok(url);
        }

        let url = format!("{}/info", self.address);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(crate::DoomsdayError::backend(format!(
                "Config server `{}' info returned {}",
                self.name,
                response.status()
            )));
        }

        let info: InfoResponse = response.json().await?;
        let discovered = info.auth_server.url.trim_end_matches('/').to_string();

        *self
            .auth_url
            .write()
            .map_err(|_| crate::DoomsdayError::internal("Config server lock poisoned"))? =
            Some(discovered.clone());
        Ok(discovered)
    }

    async fn uaa_token(&self, form: &[(&str, &str)]) -> crate::Result<UaaTokenResponse> {
        let auth_url = self.discover_auth_url().await?;
        let response = self
            .client
            .post(format!("{}/oauth/token", auth_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(crate::DoomsdayError::auth(format!(
                "Config server `{}' UAA returned {}",
                self.name,
                response.status()
            )));
        }

        Ok(response.json().await?)
    }

    fn bearer(&self) -> crate::Result<String> {
        self.access_token
            .read()
            .map_err(|_| crate::DoomsdayError::internal("Config server lock poisoned"))?
            .clone()
            .ok_or_else(|| {
                crate::DoomsdayError::auth(format!(
                    "Config server `{}' has not authenticated yet",
                    self.name
                ))
            })
    }

    async fn api_get(&self, path_and_query: &str) -> crate::Result<reqwest::Response> {
        let token = self.bearer()?;
        let url = format!("{}{}", self.address, path_and_query);
        let response = self.client.get(&url).bearer_auth(&token).send().await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(crate::DoomsdayError::auth_expired(format!(
                "Config server `{}' rejected the access token",
                self.name
            ))),
            status if !status.is_success() && status != StatusCode::NOT_FOUND => {
                Err(crate::DoomsdayError::backend(format!(
                    "Config server `{}' request returned {}",
                    self.name, status
                )))
            }
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl Accessor for ConfigServerAccessor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&self, last: &AuthMetadata) -> crate::Result<TokenAuth> {
        let refresh = match last {
            AuthMetadata::ConfigServer(meta) => meta.refresh_token.clone(),
            _ => None,
        };

        let token = match refresh {
            Some(refresh_token) => {
                match self
                    .uaa_token(&[
                        ("grant_type", "refresh_token"),
                        ("refresh_token", &refresh_token),
                    ])
                    .await
                {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(
                            "Config server `{}': refresh grant failed ({}), re-authenticating",
                            self.name,
                            e
                        );
                        self.fresh_grant().await?
                    }
                }
            }
            None => self.fresh_grant().await?,
        };

        *self
            .access_token
            .write()
            .map_err(|_| crate::DoomsdayError::internal("Config server lock poisoned"))? =
            Some(token.access_token.clone());

        Ok(TokenAuth {
            ttl: TokenTTL::Expires(Duration::from_secs(token.expires_in)),
            metadata: AuthMetadata::ConfigServer(UaaAuthMetadata {
                refresh_token: token.refresh_token,
            }),
        })
    }

    async fn list(&self) -> crate::Result<PathList> {
        let response = self.api_get("/api/v1/data?path=/").await?;
        let found: FindResponse = response.json().await?;
        Ok(found
            .credentials
            .into_iter()
            .map(|credential| credential.name)
            .collect())
    }

    async fn get(&self, path: &str) -> crate::Result<HashMap<String, String>> {
        let response = self
            .api_get(&format!("/api/v1/data?name={}&current=true", path))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(HashMap::new());
        }

        let data: DataResponse = response.json().await?;
        let Some(version) = data.data.into_iter().next() else {
            return Ok(HashMap::new());
        };

        let mut ret = HashMap::new();
        if version.credential_type == "certificate" {
            if let Some(cert) = version.value.get("certificate").and_then(|v| v.as_str()) {
                ret.insert("certificate".to_string(), cert.to_string());
            }
        }
        Ok(ret)
    }
}

impl ConfigServerAccessor {
    async fn fresh_grant(&self) -> crate::Result<UaaTokenResponse> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                self.uaa_token(&[
                    ("grant_type", "password"),
                    ("username", username),
                    ("password", password),
                ])
                .await
            }
            _ => {
                self.uaa_token(&[("grant_type", "client_credentials")])
                    .await
            }
        }
    }
}
