use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::auth::{IpRange, PathAuthSpec};

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub rtmp: RtmpConfig,
    pub auth: AuthConfig,
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub paths: HashMap<String, PathConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub rtmp_port: u16,
    pub api_port: u16,
    /// Advertised RTSP address, exposed to external commands as RTSP_PORT.
    pub rtsp_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtmpConfig {
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    /// Ring-buffer capacity per reader connection.
    pub read_buffer_count: usize,
    #[serde(default)]
    pub run_on_connect: String,
    #[serde(default)]
    pub run_on_connect_restart: bool,
}

impl RtmpConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// External authentication endpoint. Empty disables the check.
    #[serde(default)]
    pub external_auth_url: String,
}

impl AuthConfig {
    pub fn external_auth_url(&self) -> Option<String> {
        if self.external_auth_url.is_empty() {
            None
        } else {
            Some(self.external_auth_url.clone())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
}

/// Per-path configuration. Paths without a `[paths.<name>]` section get
/// the default: open access, no external command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConf {
    pub read_user: String,
    pub read_pass: String,
    pub read_ips: Vec<IpRange>,
    pub publish_user: String,
    pub publish_pass: String,
    pub publish_ips: Vec<IpRange>,
    pub run_on_read: String,
    pub run_on_read_restart: bool,
}

impl PathConf {
    pub fn read_auth_spec(&self) -> PathAuthSpec {
        PathAuthSpec {
            ips: self.read_ips.clone(),
            user: self.read_user.clone(),
            pass: self.read_pass.clone(),
        }
    }

    pub fn publish_auth_spec(&self) -> PathAuthSpec {
        PathAuthSpec {
            ips: self.publish_ips.clone(),
            user: self.publish_user.clone(),
            pass: self.publish_pass.clone(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered overrides:
    /// 1. config/default.toml
    /// 2. config/{env}.toml (based on MEDIARELAY_ENV)
    /// 3. Environment variables (MEDIARELAY_* prefix)
    pub fn load() -> anyhow::Result<Self> {
        let default_path = Path::new("config/default.toml");
        let default_content = std::fs::read_to_string(default_path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {}", default_path.display(), e))?;

        let mut config: AppConfig = toml::from_str(&default_content)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", default_path.display(), e))?;

        let env_name =
            std::env::var("MEDIARELAY_ENV").unwrap_or_else(|_| "development".to_string());
        let env_path = format!("config/{}.toml", env_name);
        if let Ok(env_content) = std::fs::read_to_string(&env_path) {
            config = toml::from_str(&env_content)
                .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", env_path, e))?;
        }

        Self::apply_env_overrides(&mut config);

        Ok(config)
    }

    fn apply_env_overrides(config: &mut AppConfig) {
        if let Ok(v) = std::env::var("MEDIARELAY_SERVER_HOST") {
            config.server.host = v;
        }
        if let Ok(v) = std::env::var("MEDIARELAY_SERVER_RTMP_PORT") {
            if let Ok(port) = v.parse() {
                config.server.rtmp_port = port;
            }
        }
        if let Ok(v) = std::env::var("MEDIARELAY_SERVER_API_PORT") {
            if let Ok(port) = v.parse() {
                config.server.api_port = port;
            }
        }
        if let Ok(v) = std::env::var("MEDIARELAY_AUTH_EXTERNAL_AUTH_URL") {
            config.auth.external_auth_url = v;
        }
        if let Ok(v) = std::env::var("MEDIARELAY_OBSERVABILITY_LOG_LEVEL") {
            config.observability.log_level = v;
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                rtmp_port: 1935,
                api_port: 9997,
                rtsp_address: "0.0.0.0:8554".to_string(),
            },
            rtmp: RtmpConfig {
                read_timeout_secs: 10,
                write_timeout_secs: 10,
                read_buffer_count: 512,
                run_on_connect: String::new(),
                run_on_connect_restart: false,
            },
            auth: AuthConfig {
                external_auth_url: String::new(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                log_format: "text".to_string(),
                metrics_enabled: true,
            },
            paths: HashMap::new(),
        }
    }
}
