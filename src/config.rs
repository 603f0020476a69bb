use crate::types::{PortScanMode, PortScanRequest};
use crate::vendor::{DEFAULT_CACHE_FILE, DEFAULT_OUI_URL};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SETTINGS_FILE: &str = "lan-monitor-settings.json";

/// User settings persisted between runs as pretty-printed JSON.
/// Missing fields take their defaults, so older files keep loading.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AppSettings {
    pub port_scan_mode: PortScanMode,
    /// Delimiter separated list used in custom mode.
    pub custom_ports: String,
    /// Port-scan every reachable host once a sweep finishes.
    pub auto_port_scan: bool,
    pub oui_cache_path: PathBuf,
    pub oui_source_url: String,
    pub auto_refresh_vendors: bool,
    pub dns_duration_secs: u64,
    pub custom_resolvers: Vec<CustomResolver>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CustomResolver {
    pub address: String,
    #[serde(default)]
    pub name: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            port_scan_mode: PortScanMode::Common,
            custom_ports: String::new(),
            auto_port_scan: false,
            oui_cache_path: PathBuf::from(DEFAULT_CACHE_FILE),
            oui_source_url: DEFAULT_OUI_URL.to_string(),
            auto_refresh_vendors: true,
            dns_duration_secs: 10,
            custom_resolvers: Vec::new(),
        }
    }
}

impl AppSettings {
    /// Load settings from `path`. A missing or unreadable file yields the
    /// defaults; the reason is logged.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "using default settings");
                Self::default()
            }
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse settings: {}", path.display()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("failed to serialize settings")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
        Ok(())
    }

    /// The port scan request these settings describe.
    pub fn port_scan_request(&self) -> Result<PortScanRequest> {
        PortScanRequest::parse(self.port_scan_mode, &self.custom_ports)
            .context("invalid custom port list in settings")
    }
}
