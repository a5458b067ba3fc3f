use crate::types::{
    AuthRequest, AuthResponse, CacheResponse, InfoResponse, SchedulerResponse,
};
use reqwest::{Client, Method, RequestBuilder};
use url::Url;

/// Thin client for the doomsday HTTP API, used by the CLI. The session
/// token rides in the X-Doomsday-Token header once `authenticate` has been
/// called (or a stored token was loaded from the target config).
pub struct DoomsdayClient {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl DoomsdayClient {
    pub fn new(address: &str, skip_verify: bool, token: Option<String>) -> crate::Result<Self> {
        let base = Url::parse(address).map_err(|e| {
            crate::DoomsdayError::invalid_input(format!("Invalid server address: {}", e))
        })?;

        let http = Client::builder()
            .danger_accept_invalid_certs(skip_verify)
            .build()?;

        Ok(DoomsdayClient { http, base, token })
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn request(&self, method: Method, path: &str) -> crate::Result<RequestBuilder> {
        let url = self.base.join(path).map_err(|e| {
            crate::DoomsdayError::invalid_input(format!("Invalid request path: {}", e))
        })?;

        let mut builder = self.http.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.header("X-Doomsday-Token", token);
        }
        Ok(builder)
    }

    async fn expect_success(response: reqwest::Response) -> crate::Result<reqwest::Response> {
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(crate::DoomsdayError::auth(
                "Not authenticated (try `doomsday login')",
            ));
        }
        if !status.is_success() {
            return Err(crate::DoomsdayError::backend(format!(
                "Server returned {}",
                status
            )));
        }
        Ok(response)
    }

    pub async fn info(&self) -> crate::Result<InfoResponse> {
        let response = self.request(Method::GET, "/v1/info")?.send().await?;
        Ok(Self::expect_success(response).await?.json().await?)
    }

    pub async fn authenticate(&mut self, username: &str, password: &str) -> crate::Result<String> {
        let response = self
            .request(Method::POST, "/v1/auth")?
            .json(&AuthRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(crate::DoomsdayError::auth("Invalid credentials"));
        }
        let auth: AuthResponse = Self::expect_success(response).await?.json().await?;
        self.token = Some(auth.token.clone());
        Ok(auth.token)
    }

    pub async fn cache(&self) -> crate::Result<CacheResponse> {
        let response = self.request(Method::GET, "/v1/cache")?.send().await?;
        Ok(Self::expect_success(response).await?.json().await?)
    }

    pub async fn refresh(&self) -> crate::Result<()> {
        let response = self
            .request(Method::POST, "/v1/cache/refresh")?
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    pub async fn scheduler(&self) -> crate::Result<SchedulerResponse> {
        let response = self.request(Method::GET, "/v1/scheduler")?.send().await?;
        Ok(Self::expect_success(response).await?.json().await?)
    }
}
