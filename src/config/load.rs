//! `ProxyConfig`: the concrete realization of spec.md §3's Configuration
//! and §6's "Configuration keys consumed".

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

impl LogLevel {
    /// The `tracing_subscriber::EnvFilter` string this level corresponds
    /// to (`fatal` has no tracing equivalent, so it maps to `error`).
    pub fn to_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Fatal => "error",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralSection {
    #[serde(default)]
    pub log_level: LogLevel,
}

impl Default for GeneralSection {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub bind_addr: Option<IpAddr>,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NetworkSection {
    pub bind_addr_ext: Option<IpAddr>,
    #[serde(default)]
    pub bind_addr_ext_add: Vec<IpAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    pub password: String,
    pub calls_allowed: Option<String>,
    pub calls_denied: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RegistrationSection {
    pub url: Option<String>,
    #[serde(default)]
    pub ident: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub general: GeneralSection,
    pub server: ServerSection,
    #[serde(default)]
    pub network: NetworkSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub registration: RegistrationSection,
}

impl ProxyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(ProxyError::Io)?;
        let cfg: ProxyConfig = toml::from_str(&text)?;
        Ok(cfg)
    }

    /// spec.md §3 invariant: if `bind_addr_ext_add` is non-empty,
    /// `bind_addr_ext` must be set and not the wildcard `0.0.0.0`.
    pub fn validate(&self) -> Result<()> {
        if !self.network.bind_addr_ext_add.is_empty() {
            let ext = self.network.bind_addr_ext;
            let is_wildcard = ext == Some(IpAddr::from([0, 0, 0, 0]));
            if ext.is_none() || is_wildcard {
                return Err(ProxyError::Config(
                    "network.bind_addr_ext_add requires network.bind_addr_ext to be set and not 0.0.0.0"
                        .into(),
                ));
            }
        }
        Ok(())
    }

    /// Number of proxy slots this configuration describes: `1 +
    /// len(bind_addr_ext_add)` (spec.md §3).
    pub fn slot_count(&self) -> usize {
        1 + self.network.bind_addr_ext_add.len()
    }

    /// Source address for slot `i` (0-indexed): slot 0 uses
    /// `bind_addr_ext` (or the wildcard if unset), slot `i>0` uses
    /// `bind_addr_ext_add[i-1]` (spec.md §4.4).
    pub fn source_addr_for_slot(&self, i: usize) -> IpAddr {
        if i == 0 {
            self.network
                .bind_addr_ext
                .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]))
        } else {
            self.network.bind_addr_ext_add[i - 1]
        }
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ProxyConfig {
        toml::from_str(s).expect("config should parse")
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = parse(
            r#"
            [server]
            port = 5300

            [auth]
            password = "TEST"
            calls_allowed = ""
            calls_denied = ""
            "#,
        );
        assert_eq!(cfg.slot_count(), 1);
        assert_eq!(cfg.general.log_level, LogLevel::Info);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn additional_addrs_without_external_fails_validation() {
        let cfg = parse(
            r#"
            [server]
            port = 5300

            [network]
            bind_addr_ext_add = ["10.0.0.2"]

            [auth]
            password = "TEST"
            "#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn additional_addrs_with_wildcard_external_fails_validation() {
        let cfg = parse(
            r#"
            [server]
            port = 5300

            [network]
            bind_addr_ext = "0.0.0.0"
            bind_addr_ext_add = ["10.0.0.2"]

            [auth]
            password = "TEST"
            "#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn additional_addrs_with_real_external_passes_and_sizes_slots() {
        let cfg = parse(
            r#"
            [server]
            port = 5300

            [network]
            bind_addr_ext = "203.0.113.5"
            bind_addr_ext_add = ["203.0.113.6", "203.0.113.7"]

            [auth]
            password = "TEST"
            "#,
        );
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.slot_count(), 3);
        assert_eq!(
            cfg.source_addr_for_slot(0),
            "203.0.113.5".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            cfg.source_addr_for_slot(2),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
    }
}
