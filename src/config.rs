use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const CONFIG_PATH_ENV: &str = "GAMESERVER_AGENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
    #[serde(default)]
    pub public_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            api_timeout_secs: default_api_timeout(),
            public_dir: None,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> u64 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GameKind {
    #[default]
    Palworld,
}

/// A stored managed-server definition. The runtime only ever reads a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub id: String,
    #[serde(default)]
    pub game: GameKind,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub folder_path: String,
    pub executable_path: String,
    #[serde(default)]
    pub ip_address: String,
    pub port: u16,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_port: Option<u16>,
    #[serde(default)]
    pub api_username: Option<String>,
    #[serde(default)]
    pub api_password: Option<String>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "default_true")]
    pub monitoring_enabled: bool,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated: DateTime<Utc>,
}

impl ServerDefinition {
    pub fn executable(&self) -> PathBuf {
        Path::new(&self.folder_path).join(&self.executable_path)
    }

    /// Base URL of the server's management API, if one is configured.
    pub fn api_url(&self) -> Option<String> {
        if let Some(url) = self.api_base_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Some(url.trim().to_string());
        }
        let port = self.api_port?;
        let host = if self.ip_address.trim().is_empty() {
            "127.0.0.1"
        } else {
            self.ip_address.trim()
        };
        Some(format!("http://{}:{}/v1/api", host, port))
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.api_username.as_deref(), self.api_password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub servers: Vec<ServerDefinition>,
}

impl Config {
    pub fn list(&self) -> &[ServerDefinition] {
        &self.servers
    }

    pub fn get(&self, id: &str) -> Option<&ServerDefinition> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Insert or replace a definition, stamping `created`/`updated`.
    /// Returns the stored copy.
    pub fn upsert(&mut self, mut def: ServerDefinition) -> ServerDefinition {
        let now = Utc::now();
        def.updated = now;
        match self.servers.iter_mut().find(|s| s.id == def.id) {
            Some(existing) => {
                def.created = existing.created;
                *existing = def.clone();
            }
            None => {
                def.created = now;
                self.servers.push(def.clone());
            }
        }
        def
    }

    pub fn remove(&mut self, id: &str) -> Option<ServerDefinition> {
        let idx = self.servers.iter().position(|s| s.id == id)?;
        Some(self.servers.remove(idx))
    }
}

pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub async fn load_config(path: &Path) -> anyhow::Result<Config> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let config: Config = serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Config file {} not found, using defaults", path.display());
            Ok(Config::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub async fn save_config(path: &Path, config: &Config) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
    write_atomic(path, json.as_bytes()).await
}

/// Write to `<path>.tmp`, fsync, then rename over `path`.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
    file.write_all(contents)
        .await
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    file.flush().await.context("Failed to flush temp file")?;
    file.sync_all().await.context("Failed to fsync temp file")?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("Failed to rename {} to {}", tmp_path.display(), path.display()))?;

    Ok(())
}

pub fn validate_definition(def: &ServerDefinition) -> Result<(), String> {
    if def.id.trim().is_empty() {
        return Err("id must not be empty".to_string());
    }
    if def.id.contains('/') || def.id.contains('\\') || def.id.contains("..") {
        return Err("id must not contain '/', '\\', or '..'".to_string());
    }
    if def.executable_path.contains("..") || Path::new(&def.executable_path).is_absolute() {
        return Err("executable_path must be relative and must not contain '..'".to_string());
    }
    if def.port == 0 {
        return Err("port must be between 1 and 65535".to_string());
    }
    if def.refresh_interval_secs == 0 {
        return Err("refresh_interval_secs must be at least 1".to_string());
    }
    if let Some(url) = def.api_base_url.as_deref().filter(|u| !u.trim().is_empty()) {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("api_base_url '{}' must start with http:// or https://", url));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_definition(id: &str) -> ServerDefinition {
    ServerDefinition {
        id: id.to_string(),
        game: GameKind::Palworld,
        display_name: "Test".to_string(),
        description: String::new(),
        folder_path: "/srv/pal".to_string(),
        executable_path: "PalServer.sh".to_string(),
        ip_address: String::new(),
        port: 8211,
        api_base_url: None,
        api_port: Some(8212),
        api_username: None,
        api_password: None,
        auto_restart: false,
        monitoring_enabled: true,
        refresh_interval_secs: 10,
        autostart: false,
        created: Utc::now(),
        updated: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_prefers_explicit_base_url() {
        let mut def = sample_definition("pal");
        assert_eq!(def.api_url().as_deref(), Some("http://127.0.0.1:8212/v1/api"));

        def.ip_address = "10.0.0.5".into();
        assert_eq!(def.api_url().as_deref(), Some("http://10.0.0.5:8212/v1/api"));

        def.api_base_url = Some("http://example.test/v1/api".into());
        assert_eq!(def.api_url().as_deref(), Some("http://example.test/v1/api"));

        def.api_base_url = None;
        def.api_port = None;
        assert_eq!(def.api_url(), None);
    }

    #[test]
    fn credentials_require_both_parts() {
        let mut def = sample_definition("pal");
        def.api_username = Some("admin".into());
        assert!(def.credentials().is_none());
        def.api_password = Some("secret".into());
        assert_eq!(def.credentials(), Some(("admin", "secret")));
    }

    #[test]
    fn validation_rejects_path_escapes() {
        let mut def = sample_definition("pal");
        assert!(validate_definition(&def).is_ok());

        def.id = "../evil".into();
        assert!(validate_definition(&def).is_err());

        def = sample_definition("pal");
        def.executable_path = "../../bin/sh".into();
        assert!(validate_definition(&def).is_err());

        def = sample_definition("pal");
        def.refresh_interval_secs = 0;
        assert!(validate_definition(&def).is_err());

        def = sample_definition("pal");
        def.api_base_url = Some("ftp://nope".into());
        assert!(validate_definition(&def).is_err());
    }

    #[test]
    fn upsert_keeps_created_and_bumps_updated() {
        let mut config = Config::default();
        let first = config.upsert(sample_definition("pal"));
        assert_eq!(config.list().len(), 1);

        let mut changed = sample_definition("pal");
        changed.display_name = "Renamed".into();
        let second = config.upsert(changed);
        assert_eq!(config.list().len(), 1);
        assert_eq!(second.created, first.created);
        assert!(second.updated >= first.updated);
        assert_eq!(config.get("pal").map(|d| d.display_name.as_str()), Some("Renamed"));

        assert!(config.remove("pal").is_some());
        assert!(config.remove("pal").is_none());
    }
}
