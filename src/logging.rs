//! Ambient realization of spec.md §6's `log.{init,open,close,vprintf,
//! select_medium,ident}` collaborator over `tracing`/`tracing-subscriber`.
//!
//! Grounded on `examples/GrandMax-telemt-pannel/src/config/hot_reload.rs`'s
//! doc-comment usage example (`filter_handle.reload(...)`): the filter is
//! installed once at process start and updated in place as the config's
//! `log_level` hot-reloads, instead of tearing down and reinstalling a
//! subscriber.

use tracing_subscriber::reload;
use tracing_subscriber::{EnvFilter, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogLevel;

pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Install a `tracing-subscriber` pipeline with a reloadable `EnvFilter`
/// seeded from `initial_level`, and identify the process the way
/// `proxy_ident`/`log_ident` do in the teacher's collaborator interface.
pub fn init(initial_level: LogLevel) -> FilterHandle {
    let filter = EnvFilter::try_new(initial_level.to_filter_str())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(pkg = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), "echolink proxy starting");

    handle
}

/// Apply a hot-reloaded log level to an already-installed filter.
pub fn apply_level(handle: &FilterHandle, level: LogLevel) {
    if let Err(e) = handle.reload(EnvFilter::new(level.to_filter_str())) {
        tracing::error!(error = %e, "failed to apply reloaded log level");
    }
}
