use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::connection::{
    ConnectionSettings, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_SEND_QUEUE_CAPACITY,
};
use crate::directory::DeviceRecord;

pub const ENV_LISTEN_ADDR: &str = "DEVICELINK_LISTEN_ADDR";
pub const ENV_JWT_SECRET: &str = "DEVICELINK_JWT_SECRET";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub jwt_secret: String,
    pub log_path: Option<PathBuf>,
    pub hub: HubConfig,
    pub ice: IceConfig,
    pub devices: Vec<DeviceRecord>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            jwt_secret: String::new(),
            log_path: None,
            hub: HubConfig::default(),
            ice: IceConfig::default(),
            devices: Vec::new(),
            config_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HubConfig {
    pub send_queue_capacity: usize,
    pub write_wait_secs: u64,
    pub pong_wait_secs: u64,
    pub max_message_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            write_wait_secs: 10,
            pong_wait_secs: 60,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl HubConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings::new(
            self.send_queue_capacity,
            Duration::from_secs(self.write_wait_secs),
            Duration::from_secs(self.pong_wait_secs),
            self.max_message_bytes,
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<String>,
    pub turn_username: String,
    pub turn_credential: String,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:openrelay.metered.ca:80".to_string(),
            ],
            turn_servers: vec![
                "turn:openrelay.metered.ca:80".to_string(),
                "turn:openrelay.metered.ca:443".to_string(),
                "turn:openrelay.metered.ca:443?transport=tcp".to_string(),
            ],
            turn_username: "openrelayproject".to_string(),
            turn_credential: "openrelayproject".to_string(),
        }
    }
}

/// Values that win over the config file: environment variables, then CLI
/// flags layered on top by the caller. Empty strings are ignored.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub listen_addr: Option<String>,
    pub jwt_secret: Option<String>,
}

impl ConfigOverrides {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env_nonempty(ENV_LISTEN_ADDR),
            jwt_secret: env_nonempty(ENV_JWT_SECRET),
        }
    }
}

impl Config {
    /// Loads `path` with the `DEVICELINK_*` environment overrides applied.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_overrides(path, ConfigOverrides::from_env())
    }

    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.finish(overrides)?;
        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self> {
        Self::with_overrides(ConfigOverrides::from_env())
    }

    pub fn with_overrides(overrides: ConfigOverrides) -> Result<Self> {
        let mut cfg = Config::default();
        cfg.finish(overrides)?;
        Ok(cfg)
    }

    fn finish(&mut self, overrides: ConfigOverrides) -> Result<()> {
        self.apply(overrides);
        self.normalize();
        self.validate()
    }

    fn apply(&mut self, overrides: ConfigOverrides) {
        let nonempty = |v: Option<String>| v.filter(|v| !v.trim().is_empty());
        if let Some(addr) = nonempty(overrides.listen_addr) {
            self.listen_addr = addr;
        }
        if let Some(secret) = nonempty(overrides.jwt_secret) {
            self.jwt_secret = secret;
        }
    }

    fn normalize(&mut self) {
        self.listen_addr = self.listen_addr.trim().to_string();
        for list in [&mut self.ice.stun_servers, &mut self.ice.turn_servers] {
            list.iter_mut().for_each(|s| *s = s.trim().to_string());
            list.retain(|s| !s.is_empty());
        }
    }

    fn validate(&self) -> Result<()> {
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("listen_addr {:?}", self.listen_addr))?;
        if self.jwt_secret.trim().is_empty() {
            anyhow::bail!("jwt_secret is empty (set it in the config or {ENV_JWT_SECRET})");
        }
        if self.hub.send_queue_capacity == 0 {
            anyhow::bail!("hub.send_queue_capacity must be positive");
        }
        if self.hub.pong_wait_secs == 0 || self.hub.write_wait_secs == 0 {
            anyhow::bail!("hub deadlines must be at least one second");
        }
        if self.hub.max_message_bytes == 0 {
            anyhow::bail!("hub.max_message_bytes must be positive");
        }
        for url in &self.ice.stun_servers {
            validate_ice_url(url, &["stun", "stuns"]).context("ice.stun_servers")?;
        }
        for url in &self.ice.turn_servers {
            validate_ice_url(url, &["turn", "turns"]).context("ice.turn_servers")?;
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn validate_ice_url(raw: &str, schemes: &[&str]) -> Result<()> {
    let url = Url::parse(raw).with_context(|| format!("invalid ice url {raw:?}"))?;
    if !schemes.contains(&url.scheme()) {
        anyhow::bail!("ice url {raw:?} must use one of {schemes:?}");
    }
    Ok(())
}
