use std::fmt;

pub type Result<T> = std::result::Result<T, DoomsdayError>;

#[derive(Debug, thiserror::Error)]
pub enum DoomsdayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DoomsdayError {
    pub fn auth<T: fmt::Display>(msg: T) -> Self {
        let error = Self::Auth(msg.to_string());
        tracing::warn!("Authentication error: {}", error);
        error
    }

    pub fn auth_expired<T: fmt::Display>(msg: T) -> Self {
        let error = Self::AuthExpired(msg.to_string());
        tracing::warn!("{}", error);
        error
    }

    pub fn backend<T: fmt::Display>(msg: T) -> Self {
        let error = Self::Backend(msg.to_string());
        tracing::error!("Backend error: {}", error);
        error
    }

    pub fn config<T: fmt::Display>(msg: T) -> Self {
        let error = Self::Config(msg.to_string());
        tracing::error!("Configuration error: {}", error);
        error
    }

    pub fn invalid_input<T: fmt::Display>(msg: T) -> Self {
        let error = Self::InvalidInput(msg.to_string());
        tracing::warn!("Invalid input: {}", error);
        error
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        let error = Self::Internal(msg.to_string());
        tracing::error!("Internal error: {}", error);
        error
    }

    /// True when a backend call failed because the token behind it is no
    /// longer valid, which is the cue for reactive re-authentication.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }
}
