//! Proxy configuration types and defaults.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

fn default_proxy_port() -> u16 {
    25565
}

fn default_server_port() -> u16 {
    25565
}

fn default_version() -> String {
    "1.16.1".to_string()
}

fn default_motd() -> String {
    "A Spyglass proxy".to_string()
}

fn default_command_prefix() -> String {
    "/p:".to_string()
}

/// Configuration for one proxy instance.
///
/// Authentication material (`username`, `password`, `access_token`,
/// `client_token`, `session`) is handed to the upstream connector verbatim;
/// the proxy itself never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Local listener port.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Upstream server host.
    pub server_address: String,

    /// Upstream server port.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Protocol version identifier advertised to both sides.
    #[serde(default = "default_version")]
    pub version: String,

    /// Message of the day advertised on status requests.
    #[serde(default = "default_motd")]
    pub motd: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub client_token: Option<String>,

    /// Opaque session material for the upstream authentication provider.
    #[serde(default)]
    pub session: Option<Value>,

    /// Directory scanned for module libraries to auto-import.
    #[serde(default)]
    pub modules_dir: Option<String>,

    /// Module names to load after import, in order.
    #[serde(default)]
    pub modules: Vec<String>,

    /// Per-module configuration blobs, surfaced as each module's `config`.
    #[serde(default)]
    pub module_config: HashMap<String, Value>,

    /// Chat prefix that marks proxy commands. Autocomplete integration is
    /// active only when it begins with `/`.
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            server_address: "127.0.0.1".to_string(),
            server_port: default_server_port(),
            version: default_version(),
            motd: default_motd(),
            username: None,
            password: None,
            access_token: None,
            client_token: None,
            session: None,
            modules_dir: None,
            modules: Vec::new(),
            module_config: HashMap::new(),
            command_prefix: default_command_prefix(),
        }
    }
}

impl ProxyConfig {
    /// Validates the configuration for obvious mistakes.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_address.is_empty() {
            return Err("server_address cannot be empty".to_string());
        }
        if self.proxy_port == 0 {
            return Err("proxy_port cannot be 0".to_string());
        }
        if self.server_port == 0 {
            return Err("server_port cannot be 0".to_string());
        }
        if self.command_prefix.is_empty() {
            return Err("command_prefix cannot be empty".to_string());
        }
        Ok(())
    }

    /// The module directory resolved to an absolute path, when configured.
    pub fn resolved_modules_dir(&self) -> Option<PathBuf> {
        let dir = PathBuf::from(self.modules_dir.as_ref()?);
        if dir.is_absolute() {
            Some(dir)
        } else {
            std::env::current_dir().ok().map(|cwd| cwd.join(dir))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy_port, 25565);
        assert_eq!(config.server_port, 25565);
        assert_eq!(config.version, "1.16.1");
        assert_eq!(config.command_prefix, "/p:");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: ProxyConfig =
            serde_json::from_value(json!({ "server_address": "mc.example.net" })).unwrap();
        assert_eq!(config.server_address, "mc.example.net");
        assert_eq!(config.proxy_port, 25565);
        assert!(config.modules.is_empty());
        assert!(config.module_config.is_empty());
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = ProxyConfig::default();
        config.server_address = String::new();
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.proxy_port = 0;
        assert!(config.validate().is_err());

        let mut config = ProxyConfig::default();
        config.command_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_modules_dir_becomes_absolute() {
        let mut config = ProxyConfig::default();
        config.modules_dir = Some("modules".to_string());
        let resolved = config.resolved_modules_dir().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("modules"));
    }

    #[test]
    fn module_config_lookup() {
        let config: ProxyConfig = serde_json::from_value(json!({
            "server_address": "localhost",
            "module_config": { "chat_logger": { "verbose": true } }
        }))
        .unwrap();
        assert_eq!(
            config.module_config.get("chat_logger"),
            Some(&json!({ "verbose": true }))
        );
    }
}
