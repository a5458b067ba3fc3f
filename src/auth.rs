use crate::config::AuthConfig;
use crate::types::{AuthRequest, AuthResponse};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Authentication of the HTTP surface (not of the backends). Either nothing
/// at all, or username/password exchanged for a session token.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> crate::Result<AuthResponse>;
    async fn validate_token(&self, token: &str) -> bool;
    fn auth_type(&self) -> &'static str;
    fn requires_auth(&self) -> bool;
}

pub fn create_auth_provider(config: &AuthConfig) -> crate::Result<Arc<dyn AuthProvider>> {
    match config.auth_type.as_str() {
        "none" => Ok(Arc::new(NopAuthProvider)),
        "userpass" => Ok(Arc::new(UserPassAuthProvider::from_config(
            &config.properties,
        )?)),
        other => Err(crate::DoomsdayError::config(format!(
            "Unknown auth type: {}",
            other
        ))),
    }
}

pub struct NopAuthProvider;

#[async_trait]
impl AuthProvider for NopAuthProvider {
    async fn authenticate(&self, _request: &AuthRequest) -> crate::Result<AuthResponse> {
        Err(crate::DoomsdayError::auth("Authentication is not enabled"))
    }

    async fn validate_token(&self, _token: &str) -> bool {
        true
    }

    fn auth_type(&self) -> &'static str {
        "none"
    }

    fn requires_auth(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
struct Session {
    expires_at: DateTime<Utc>,
}

pub struct UserPassAuthProvider {
    // username -> bcrypt hash
    users: HashMap<String, String>,
    sessions: DashMap<String, Session>,
    session_timeout: Duration,
    refresh_on_use: bool,
}

impl UserPassAuthProvider {
    pub fn from_config(properties: &HashMap<String, serde_yaml::Value>) -> crate::Result<Self> {
        let users_config = properties
            .get("users")
            .and_then(|v| v.as_mapping())
            .ok_or_else(|| {
                crate::DoomsdayError::config("userpass auth requires a users mapping")
            })?;

        let mut users = HashMap::new();
        for (username, password) in users_config {
            let username = username
                .as_str()
                .ok_or_else(|| crate::DoomsdayError::config("Username must be a string"))?;
            let password = password
                .as_str()
                .ok_or_else(|| crate::DoomsdayError::config("Password must be a string"))?;

            let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
                .map_err(|e| crate::DoomsdayError::config(format!("Could not hash password: {}", e)))?;
            users.insert(username.to_string(), hash);
        }

        let session_timeout = properties
            .get("session_timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(30);

        let refresh_on_use = properties
            .get("refresh_on_use")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        Ok(UserPassAuthProvider {
            users,
            sessions: DashMap::new(),
            session_timeout: Duration::minutes(session_timeout as i64),
            refresh_on_use,
        })
    }

    fn cleanup_expired_sessions(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, session| session.expires_at >= now);
    }
}

#[async_trait]
impl AuthProvider for UserPassAuthProvider {
    async fn authenticate(&self, request: &AuthRequest) -> crate::Result<AuthResponse> {
        self.cleanup_expired_sessions();

        let hash = self
            .users
            .get(&request.username)
            .ok_or_else(|| crate::DoomsdayError::auth("Invalid credentials"))?;

        let valid = bcrypt::verify(&request.password, hash)
            .map_err(|e| crate::DoomsdayError::auth(format!("Password verification failed: {}", e)))?;
        if !valid {
            return Err(crate::DoomsdayError::auth("Invalid credentials"));
        }

        let token = Uuid::new_v4().to_string();
        self.sessions.insert(
            token.clone(),
            Session {
                expires_at: Utc::now() + self.session_timeout,
            },
        );

        Ok(AuthResponse { token })
    }

    async fn validate_token(&self, token: &str) -> bool {
        self.cleanup_expired_sessions();

        match self.sessions.get_mut(token) {
            Some(mut session) => {
                let now = Utc::now();
                if session.expires_at < now {
                    return false;
                }
                if self.refresh_on_use {
                    session.expires_at = now + self.session_timeout;
                }
                true
            }
            None => false,
        }
    }

    fn auth_type(&self) -> &'static str {
        "userpass"
    }

    fn requires_auth(&self) -> bool {
        true
    }
}
