use crate::config::BackendConfig;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod configserver;
pub mod opsmgr;
pub mod pathlist;
pub mod tlsclient;
pub mod vault;

pub use pathlist::{PathFilter, PathList};

/// How long the token from the most recent authentication is good for.
/// `Infinite` stops the scheduler from ever scheduling another auth for the
/// source; `Unknown` means the backend would not say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTTL {
    Infinite,
    Unknown,
    Expires(Duration),
}

/// Opaque state round-tripped through the scheduler between auth calls.
/// Only the accessor that produced a value ever interprets it; the variant
/// lets each backend decide between renewing an existing token and
/// authenticating from scratch without keeping its own timer.
#[derive(Debug, Clone)]
pub enum AuthMetadata {
    None,
    Vault(vault::VaultAuthMetadata),
    OpsManager(opsmgr::OmAuthMetadata),
    ConfigServer(configserver::UaaAuthMetadata),
}

#[derive(Debug, Clone)]
pub struct TokenAuth {
    pub ttl: TokenTTL,
    pub metadata: AuthMetadata,
}

/// One credential store. `authenticate` must be called at least once before
/// `list` or `get`; a call failing with an auth-expired error is the cue
/// for the scheduler to re-auth reactively.
#[async_trait]
pub trait Accessor: Send + Sync {
    fn name(&self) -> &str;

    /// Acquires or renews the backend token, reporting how long it lives
    /// and the metadata to hand back on the next call.
    async fn authenticate(&self, last: &AuthMetadata) -> crate::Result<TokenAuth>;

    /// Every path that may hold secrets. Order is not guaranteed.
    async fn list(&self) -> crate::Result<PathList>;

    /// The secret at one path as a subkey -> raw value map. A missing path
    /// is an empty map, not an error.
    async fn get(&self, path: &str) -> crate::Result<HashMap<String, String>>;
}

pub fn new_accessor(config: &BackendConfig) -> crate::Result<Arc<dyn Accessor>> {
    match config.backend_type.to_lowercase().as_str() {
        "vault" => Ok(Arc::new(vault::VaultAccessor::from_config(
            config.name.clone(),
            &config.properties,
        )?)),
        "opsmgr" => Ok(Arc::new(opsmgr::OmAccessor::from_config(
            config.name.clone(),
            &config.properties,
        )?)),
        "credhub" | "configserver" => Ok(Arc::new(configserver::ConfigServerAccessor::from_config(
            config.name.clone(),
            &config.properties,
        )?)),
        "tls" | "tlsclient" => Ok(Arc::new(tlsclient::TlsClientAccessor::from_config(
            config.name.clone(),
            &config.properties,
        )?)),
        other => Err(crate::DoomsdayError::config(format!(
            "Unknown backend type: {}",
            other
        ))),
    }
}
