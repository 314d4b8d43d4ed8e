//! Hot-reload: watches the config file and reloads it on SIGHUP (Unix)
//! or on a periodic timer (all platforms).
//!
//! # What can be reloaded without restart
//!
//! | Section | Field                          | Effect                       |
//! |---------|--------------------------------|-------------------------------|
//! | general | log_level                      | filter updated via log_rx     |
//! | auth    | calls_allowed / calls_denied   | effective on the next handshake |
//!
//! Fields that require re-binding sockets (`server.port`, `server.bind_addr`,
//! `network.bind_addr_ext*`) are **not** applied; a warning is emitted.
//!
//! Grounded on `examples/GrandMax-telemt-pannel/src/config/hot_reload.rs`:
//! same `watch::channel` publish/subscribe shape, same SIGHUP + periodic
//! reload loop, same "diff the hot fields, warn about the rest" structure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::load::{LogLevel, ProxyConfig};

/// Fields that are safe to swap without restarting the listener or slots.
#[derive(Debug, Clone, PartialEq)]
pub struct HotFields {
    pub log_level: LogLevel,
    pub calls_allowed: Option<String>,
    pub calls_denied: Option<String>,
}

impl HotFields {
    pub fn from_config(cfg: &ProxyConfig) -> Self {
        Self {
            log_level: cfg.general.log_level,
            calls_allowed: cfg.auth.calls_allowed.clone(),
            calls_denied: cfg.auth.calls_denied.clone(),
        }
    }
}

/// Warn if any non-hot field changed (i.e. requires a restart).
fn warn_non_hot_changes(old: &ProxyConfig, new: &ProxyConfig) {
    if old.server.port != new.server.port {
        warn!(
            "config reload: server.port changed ({} → {}); restart required",
            old.server.port, new.server.port
        );
    }
    if old.server.bind_addr != new.server.bind_addr {
        warn!("config reload: server.bind_addr changed; restart required");
    }
    if old.network.bind_addr_ext != new.network.bind_addr_ext
        || old.network.bind_addr_ext_add != new.network.bind_addr_ext_add
    {
        warn!("config reload: network.bind_addr_ext* changed; restart required");
    }
    if old.auth.password != new.auth.password {
        warn!("config reload: auth.password changed; restart required");
    }
}

/// Spawn the hot-reload watcher task.
///
/// Returns:
/// - `watch::Receiver<Arc<ProxyConfig>>` — the admission loop calls
///   `.borrow_and_update().clone()` once per accepted connection to pick up
///   a fresh allow/deny snapshot (spec.md §4.5).
/// - `watch::Receiver<LogLevel>` — a separate channel so the tracing
///   reload handle doesn't need to depend on `ProxyConfig`'s shape.
pub fn spawn_config_watcher(
    config_path: PathBuf,
    initial: Arc<ProxyConfig>,
    reload_interval: Duration,
) -> (watch::Receiver<Arc<ProxyConfig>>, watch::Receiver<LogLevel>) {
    let initial_level = initial.general.log_level;
    let (config_tx, config_rx) = watch::channel(initial);
    let (log_tx, log_rx) = watch::channel(initial_level);

    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sighup = {
            use tokio::signal::unix::{signal, SignalKind};
            signal(SignalKind::hangup()).expect("failed to register SIGHUP handler")
        };

        let mut interval = tokio::time::interval(reload_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = interval.tick() => {},
                _ = sighup.recv() => {
                    info!("SIGHUP received — reloading config from {:?}", config_path);
                }
            }
            #[cfg(not(unix))]
            interval.tick().await;

            let new_cfg = match ProxyConfig::load(&config_path) {
                Ok(c) => c,
                Err(e) => {
                    error!("config reload: failed to parse {:?}: {}", config_path, e);
                    continue;
                }
            };

            if let Err(e) = new_cfg.validate() {
                error!("config reload: validation failed: {}; keeping old config", e);
                continue;
            }

            let old_cfg = config_tx.borrow().clone();
            let old_hot = HotFields::from_config(&old_cfg);
            let new_hot = HotFields::from_config(&new_cfg);

            if old_hot == new_hot {
                continue;
            }

            warn_non_hot_changes(&old_cfg, &new_cfg);

            if old_hot.log_level != new_hot.log_level {
                info!(
                    "config reload: log_level: '{}' → '{}'",
                    old_hot.log_level, new_hot.log_level
                );
                log_tx.send(new_hot.log_level).ok();
            }

            if old_hot.calls_allowed != new_hot.calls_allowed {
                info!(
                    "config reload: calls_allowed: {:?} → {:?}",
                    old_hot.calls_allowed, new_hot.calls_allowed
                );
            }
            if old_hot.calls_denied != new_hot.calls_denied {
                info!(
                    "config reload: calls_denied: {:?} → {:?}",
                    old_hot.calls_denied, new_hot.calls_denied
                );
            }

            config_tx.send(Arc::new(new_cfg)).ok();
        }
    });

    (config_rx, log_rx)
}
