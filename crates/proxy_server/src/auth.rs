//! Upstream session material.
//!
//! The authentication provider itself is an external collaborator; the
//! proxy only carries the configured material to the upstream connector.

use crate::config::ProxyConfig;
use serde_json::Value;

/// Credential bundle handed to the upstream connector when a session is
/// established.
#[derive(Debug, Clone, Default)]
pub struct SessionCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub access_token: Option<String>,
    pub client_token: Option<String>,
    pub session: Option<Value>,
    pub version: String,
}

impl SessionCredentials {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            access_token: config.access_token.clone(),
            client_token: config.client_token.clone(),
            session: config.session.clone(),
            version: config.version.clone(),
        }
    }
}
