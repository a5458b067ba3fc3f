use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    pub notifications: Option<NotificationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Defaults to the backend type when omitted.
    #[serde(default)]
    pub name: String,
    /// Minutes between refreshes of this backend.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default)]
    pub properties: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Empty or absent means stderr.
    #[serde(default)]
    pub logfile: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: default_port(),
            logfile: None,
            tls: None,
            auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM-encoded certificate chain.
    pub cert: String,
    /// PEM-encoded private key.
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(rename = "type", default = "default_auth_type")]
    pub auth_type: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_yaml::Value>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            auth_type: default_auth_type(),
            properties: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub doomsday_url: String,
    pub backend: NotificationBackendConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationBackendConfig {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(rename = "type")]
    pub schedule_type: String,
    #[serde(default)]
    pub properties: HashMap<String, serde_yaml::Value>,
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_port() -> u16 {
    8111
}

fn default_auth_type() -> String {
    "none".to_string()
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&content)?;
        config.finalize()?;
        Ok(config)
    }

    /// Fills in derived defaults and applies environment overrides. Called
    /// by `from_file`; exposed for configs built in code.
    pub fn finalize(&mut self) -> crate::Result<()> {
        for backend in &mut self.backends {
            if backend.name.is_empty() {
                backend.name = backend.backend_type.clone();
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port.parse().map_err(|_| {
                crate::DoomsdayError::config(format!("PORT env var is not a port: {}", port))
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.backends.is_empty() {
            return Err(crate::DoomsdayError::config(
                "At least one backend must be configured",
            ));
        }

        for backend in &self.backends {
            if backend.name.is_empty() {
                return Err(crate::DoomsdayError::config("Backend name cannot be empty"));
            }

            if backend.refresh_interval == 0 {
                return Err(crate::DoomsdayError::config(format!(
                    "refresh_interval for backend `{}' must be greater than zero",
                    backend.name
                )));
            }

            match backend.backend_type.to_lowercase().as_str() {
                "vault" | "credhub" | "configserver" | "opsmgr" | "tls" | "tlsclient" => {}
                other => {
                    return Err(crate::DoomsdayError::config(format!(
                        "Unknown backend type: {}",
                        other
                    )))
                }
            }
        }

        match self.server.auth.auth_type.as_str() {
            "none" | "userpass" => {}
            other => {
                return Err(crate::DoomsdayError::config(format!(
                    "Unknown auth type: {}",
                    other
                )))
            }
        }

        if let Some(notifications) = &self.notifications {
            match notifications.backend.backend_type.as_str() {
                "slack" | "shout" => {}
                other => {
                    return Err(crate::DoomsdayError::config(format!(
                        "Unknown notification backend: {}",
                        other
                    )))
                }
            }
            match notifications.schedule.schedule_type.as_str() {
                "constant" | "cron" => {}
                other => {
                    return Err(crate::DoomsdayError::config(format!(
                        "Unknown notification schedule: {}",
                        other
                    )))
                }
            }
        }

        Ok(())
    }
}

/// Target bookkeeping for the CLI, stored under the user's config
/// directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub targets: HashMap<String, ClientTarget>,
    pub current_target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTarget {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub skip_verify: bool,
    pub token: Option<String>,
}

impl ClientConfig {
    fn config_path() -> crate::Result<std::path::PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| crate::DoomsdayError::config("Could not find config directory"))?;
        Ok(config_dir.join("doomsday").join("config.yml"))
    }

    pub fn load() -> crate::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(ClientConfig::default())
        }
    }

    pub fn save(&self) -> crate::Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn current_target(&self) -> Option<&ClientTarget> {
        self.current_target
            .as_ref()
            .and_then(|name| self.targets.get(name))
    }
}
