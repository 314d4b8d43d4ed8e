//! The registration collaborator (spec.md §6): informs an external
//! directory how many slots are free/used so clients can discover this
//! proxy. Out of scope per spec.md §1 beyond its interface; this module
//! supplies one concrete HTTP-based implementation plus test doubles.
//!
//! Grounded on `examples/original_source/src/proxy.c::proxy_update_registration`
//! for the relaxed-count / read-locked-total split this crate's
//! `crate::core::ProxyCore::push_registration` performs before calling in
//! here.

use tracing::{debug, warn};

use crate::config::ProxyConfig;

/// `registration.update/start/stop` (spec.md §6).
pub trait RegistrationSink: Send + Sync {
    /// Push a `(slots_used, slots_total)` snapshot. Best-effort: spec.md
    /// §9 notes consumers must tolerate brief transients, so failures here
    /// are logged, never propagated.
    fn update(&self, slots_used: usize, slots_total: usize);

    /// Called once from `ProxyCore::start`.
    fn start(&self, _config: &ProxyConfig) {}

    /// Called once from `ProxyCore::close` (via `proxy_close`'s
    /// `registration_service_stop`).
    fn stop(&self) {}
}

/// Discards every update. Used when no registration URL is configured.
pub struct NullSink;

impl RegistrationSink for NullSink {
    fn update(&self, _slots_used: usize, _slots_total: usize) {}
}

/// POSTs a form-encoded slot snapshot to a configured URL via `reqwest`.
/// The wire format of that POST is intentionally unspecified further here
/// (spec.md §1 scopes the directory registration service's protocol out);
/// the important contract is that `update` never blocks the caller for
/// long and never panics on a failed request.
pub struct HttpRegistrationSink {
    client: reqwest::Client,
    url: String,
    ident: String,
}

impl HttpRegistrationSink {
    pub fn new(url: String, ident: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            ident,
        }
    }
}

impl RegistrationSink for HttpRegistrationSink {
    fn update(&self, slots_used: usize, slots_total: usize) {
        let client = self.client.clone();
        let url = self.url.clone();
        let ident = self.ident.clone();
        tokio::spawn(async move {
            let form = [
                ("ident", ident.as_str()),
                ("used", &slots_used.to_string()),
                ("total", &slots_total.to_string()),
            ];
            match client.post(&url).form(&form).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(slots_used, slots_total, "registration update sent");
                }
                Ok(resp) => {
                    warn!(status = %resp.status(), "registration update rejected");
                }
                Err(e) => {
                    warn!(error = %e, "registration update failed");
                }
            }
        });
    }

    fn start(&self, _config: &ProxyConfig) {
        debug!(url = %self.url, "registration service starting");
    }

    fn stop(&self) {
        debug!("registration service stopped");
    }
}

/// Records every `update` call in-memory; used by core/worker tests to
/// assert `(slots_used, slots_total)` transitions without a network stack.
#[derive(Default)]
pub struct RecordingSink {
    pub calls: std::sync::Mutex<Vec<(usize, usize)>>,
}

impl RegistrationSink for RecordingSink {
    fn update(&self, slots_used: usize, slots_total: usize) {
        self.calls.lock().unwrap().push((slots_used, slots_total));
    }
}
