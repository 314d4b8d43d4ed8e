//! Process entrypoint: load configuration, open the proxy core, run its
//! lifecycle to completion, and shut down cleanly on `SIGINT`/`SIGTERM`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use echolink_proxy::config::{spawn_config_watcher, ProxyConfig};
use echolink_proxy::core::ProxyCore;
use echolink_proxy::logging;
use echolink_proxy::nonce::{NonceSource, OsNonceSource};
use echolink_proxy::registration::{HttpRegistrationSink, NullSink, RegistrationSink};

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("echolink.toml"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path();
    let config = ProxyConfig::load(&path)
        .with_context(|| format!("failed to load config from {:?}", path))?;
    config.validate().context("invalid configuration")?;

    let filter_handle = logging::init(config.general.log_level);
    info!(path = ?path, "loaded configuration");

    let config = Arc::new(config);

    let nonce_source: Arc<dyn NonceSource> = Arc::new(OsNonceSource);
    let registration: Arc<dyn RegistrationSink> = match config.registration.url.as_deref() {
        Some(url) if !url.is_empty() => Arc::new(HttpRegistrationSink::new(
            url.to_string(),
            config.registration.ident.clone(),
        )),
        _ => Arc::new(NullSink),
    };

    let core = Arc::new(
        ProxyCore::open(&config, nonce_source, registration)
            .await
            .context("failed to open proxy core")?,
    );
    core.start(&config).await;

    let (mut config_rx, mut log_rx) = spawn_config_watcher(path, config.clone(), config.reload_interval());

    let hot_reload_task = tokio::spawn({
        let core = core.clone();
        async move {
            loop {
                tokio::select! {
                    Ok(()) = log_rx.changed() => {
                        let level = *log_rx.borrow_and_update();
                        logging::apply_level(&filter_handle, level);
                    }
                    Ok(()) = config_rx.changed() => {
                        let new_cfg = config_rx.borrow_and_update().clone();
                        if let Err(e) = core
                            .apply_authorizer(
                                new_cfg.auth.calls_allowed.as_deref(),
                                new_cfg.auth.calls_denied.as_deref(),
                            )
                            .await
                        {
                            error!(error = %e, "failed to apply reloaded callsign patterns");
                        }
                    }
                    else => break,
                }
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    let mut terminate = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())?
    };

    tokio::select! {
        res = core.run() => {
            if let Err(e) = res {
                error!(error = %e, "proxy core run loop exited with an error");
            }
        }
        _ = ctrl_c => {
            info!("received SIGINT, shutting down");
        }
        #[cfg(unix)]
        _ = terminate.recv() => {
            info!("received SIGTERM, shutting down");
        }
    }

    core.close().await;
    hot_reload_task.abort();

    info!("echolink proxy stopped");
    Ok(())
}
