//! Session configuration and its on-disk form.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use crate::rtp::MAX_PAYLOAD_TYPE;

/// Lowest port handed out by default.
pub const DEFAULT_PORT_RANGE_START: u16 = 1024;
/// Exclusive upper bound of the default port range.
pub const DEFAULT_PORT_RANGE_STOP: u16 = 65535;
/// Dynamic payload type used until the media engine picks one.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 127;

/// Settings a session is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bind an RTCP socket at RTP port + 1
    pub rtcp_enabled: bool,
    /// Local bind address; empty means any address of the selected family
    pub local_ip: String,
    pub ipv6: bool,
    pub port_range_start: u16,
    pub port_range_stop: u16,
    pub payload_type: u8,
    /// STUN server (`host:port`) for public address discovery
    pub stun_server: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rtcp_enabled: true,
            local_ip: String::new(),
            ipv6: false,
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_stop: DEFAULT_PORT_RANGE_STOP,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            stun_server: None,
        }
    }
}

impl SessionConfig {
    /// Get config file path
    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "rtp-manager", "rtp-manager")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from the platform config dir, defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Reject values a session would refuse.
    pub fn validate(&self) -> Result<()> {
        if self.payload_type > MAX_PAYLOAD_TYPE {
            anyhow::bail!("payload_type {} is above {}", self.payload_type, MAX_PAYLOAD_TYPE);
        }
        if self.port_range_start >= self.port_range_stop {
            anyhow::bail!(
                "empty port range [{}, {})",
                self.port_range_start,
                self.port_range_stop
            );
        }
        self.bind_ip()?;
        Ok(())
    }

    /// Save configuration to the platform config dir.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Parsed bind address. An empty `local_ip` maps to the unspecified
    /// address of the configured family.
    pub fn bind_ip(&self) -> Result<IpAddr> {
        if self.local_ip.is_empty() {
            return Ok(if self.ipv6 {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            });
        }
        let ip: IpAddr = self
            .local_ip
            .parse()
            .with_context(|| format!("Invalid local IP address: {}", self.local_ip))?;
        if ip.is_ipv6() != self.ipv6 {
            anyhow::bail!(
                "Local IP {} does not match the configured family ({})",
                ip,
                if self.ipv6 { "IPv6" } else { "IPv4" }
            );
        }
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("rtp-manager-test-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::default();
        assert!(cfg.rtcp_enabled);
        assert_eq!(cfg.port_range_start, 1024);
        assert_eq!(cfg.port_range_stop, 65535);
        assert_eq!(cfg.payload_type, 127);
        assert_eq!(cfg.bind_ip().unwrap(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: SessionConfig = toml::from_str("ipv6 = true\nport_range_start = 20000\n").unwrap();
        assert!(cfg.ipv6);
        assert_eq!(cfg.port_range_start, 20000);
        assert_eq!(cfg.port_range_stop, DEFAULT_PORT_RANGE_STOP);
        assert_eq!(cfg.bind_ip().unwrap(), IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn test_save_and_load_file() {
        let path = temp_path("save_and_load.toml");
        let cfg = SessionConfig {
            local_ip: "127.0.0.1".into(),
            stun_server: Some("stun.example.org:3478".into()),
            ..Default::default()
        };
        cfg.save_to(&path).unwrap();
        assert_eq!(SessionConfig::load_from(&path).unwrap(), cfg);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = temp_path("does-not-exist.toml");
        assert_eq!(SessionConfig::load_from(&path).unwrap(), SessionConfig::default());
    }

    #[test]
    fn test_out_of_range_values_rejected_on_load() {
        let path = temp_path("bad_payload_type.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "payload_type = 200\n").unwrap();
        assert!(SessionConfig::load_from(&path).is_err());

        fs::write(&path, "port_range_start = 5000\nport_range_stop = 5000\n").unwrap();
        assert!(SessionConfig::load_from(&path).is_err());
        let _ = fs::remove_file(&path);

        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bind_ip_family_mismatch() {
        let cfg = SessionConfig {
            local_ip: "::1".into(),
            ..Default::default()
        };
        assert!(cfg.bind_ip().is_err());
    }
}
