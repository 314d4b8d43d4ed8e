//! `ProxyCore` (spec.md §3/§4.6): the lifecycle supervisor. Owns the fixed
//! pools of [`crate::slot::ProxySlot`] and [`crate::worker::ClientWorker`],
//! the `usable_clients` gate, and the listener's admission loop (spec.md
//! §4.5).
//!
//! Grounded on `examples/original_source/src/proxy.c`'s `proxy_open`,
//! `proxy_start`, `proxy_process`, `proxy_shutdown`, `proxy_drop`, and
//! `proxy_close` for sequencing and unwind order (spec.md §4.6, SPEC_FULL.md
//! §B.3-4); the shutdown-without-deadlock pattern mirrors
//! [`crate::slot::ProxySlot`]'s sticky-flag-plus-`Notify` approach rather
//! than literally closing the listening socket, since `tokio::net::TcpListener`
//! has no portable "interrupt a pending accept" primitive.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::config::ProxyConfig;
use crate::connection::{listen, TcpConnection};
use crate::error::{ProxyError, Result};
use crate::nonce::NonceSource;
use crate::registration::RegistrationSink;
use crate::slot::ProxySlot;
use crate::worker::ClientWorker;

/// State shared between `ProxyCore`, every `ClientWorker` task, and every
/// `ProxySlot`. Workers and slots hold only a [`Weak`] reference to this
/// (spec.md §9 "Back-references"): the core outlives both by construction.
pub struct CoreShared {
    pub slots: Vec<Arc<ProxySlot>>,
    pub usable_clients: RwLock<usize>,
    pub registration: Arc<dyn RegistrationSink>,
    pub authorizer: RwLock<Arc<Authorizer>>,
    pub password: String,
    pub nonce_source: Arc<dyn NonceSource>,
}

impl CoreShared {
    /// Push a `(slots_used, slots_total)` snapshot to the registration
    /// collaborator (spec.md §2 "After every admission or release"). Never
    /// awaits: `slots_used` is a relaxed per-slot `in_use()` poll and
    /// `slots_total` a best-effort `try_read` of `usable_clients`, falling
    /// back to the fixed pool size under contention — the "relaxed-count /
    /// read-locked-total split" this crate's `proxy_update_registration`
    /// equivalent performs (spec.md §9 "Advisory counters").
    pub fn push_registration(&self) {
        let slots_used = self.slots.iter().filter(|s| s.in_use()).count();
        let slots_total = match self.usable_clients.try_read() {
            Ok(guard) => *guard,
            Err(_) => self.slots.len(),
        };
        self.registration.update(slots_used, slots_total);
    }
}

/// The lifecycle supervisor: `open -> start -> run* -> shutdown -> drop ->
/// close` (spec.md §3 "Lifecycle", §4.6).
pub struct ProxyCore {
    shared: Arc<CoreShared>,
    workers: Vec<Arc<ClientWorker>>,
    listener: TcpListener,
    worker_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
}

impl ProxyCore {
    /// `proxy_open` (spec.md §4.6 steps 1-8). On failure, nothing partially
    /// constructed escapes: `ProxyConfig::validate` is the only fallible
    /// step before allocation, and the listener bind is the last step, so
    /// there is no partial teardown to unwind in this crate's `Result`-based
    /// rendition (contrast spec.md §9's note about the source's ordered
    /// unwind, which exists because its allocation steps can themselves
    /// fail independently).
    pub async fn open(
        config: &ProxyConfig,
        nonce_source: Arc<dyn NonceSource>,
        registration: Arc<dyn RegistrationSink>,
    ) -> Result<Self> {
        config.validate()?;

        let authorizer = Authorizer::new(
            config.auth.calls_allowed.as_deref(),
            config.auth.calls_denied.as_deref(),
        )?;

        let slot_count = config.slot_count();
        let mut slots = Vec::with_capacity(slot_count);
        for i in 0..slot_count {
            let slot = Arc::new(ProxySlot::new(i, config.source_addr_for_slot(i)));
            slot.init()?;
            slots.push(slot);
        }

        let mut workers = Vec::with_capacity(slot_count);
        for i in 0..slot_count {
            workers.push(Arc::new(ClientWorker::new(i)));
        }

        let listener = listen(config.server.bind_addr, config.server.port).await?;

        debug!(
            slots = slot_count,
            bind_addr = ?config.server.bind_addr,
            port = config.server.port,
            "proxy core opened"
        );

        let shared = Arc::new(CoreShared {
            slots,
            usable_clients: RwLock::new(0),
            registration,
            authorizer: RwLock::new(Arc::new(authorizer)),
            password: config.auth.password.clone(),
            nonce_source,
        });

        Ok(Self {
            shared,
            workers,
            listener,
            worker_handles: std::sync::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    /// `proxy_start` (spec.md §4.6): spawn every slot's (already-running, so
    /// a no-op here beyond `start()`) and every worker's task, then open the
    /// gate and push the initial registration snapshot.
    pub async fn start(&self, config: &ProxyConfig) {
        for slot in &self.shared.slots {
            slot.start();
        }

        let mut handles = self.worker_handles.lock().unwrap();
        for worker in &self.workers {
            let worker = worker.clone();
            let core_weak: Weak<CoreShared> = Arc::downgrade(&self.shared);
            handles.push(tokio::spawn(async move { worker.run(core_weak).await }));
        }
        drop(handles);

        *self.shared.usable_clients.write().await = self.shared.slots.len();

        self.shared.push_registration();
        self.shared.registration.start(config);

        info!(slots = self.shared.slots.len(), "proxy core started");
    }

    /// The accept loop (spec.md §4.5). Runs until `shutdown()` is called
    /// from another task, at which point it returns `Ok(())` promptly
    /// (scenario 6: "subsequent `process()` call returns promptly").
    pub async fn run(&self) -> Result<()> {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::select! {
                _ = self.shutdown_notify.notified() => {
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    match accepted {
                        Ok((stream, remote)) => self.admit(stream, remote).await,
                        Err(e) => {
                            warn!(error = %e, "accept() failed; continuing");
                        }
                    }
                }
            }
        }
    }

    /// One admission (spec.md §4.5 steps 1-7).
    async fn admit(&self, stream: TcpStream, remote: SocketAddr) {
        let conn = match TcpConnection::from_stream(stream) {
            Ok(c) => c,
            Err(e) => {
                warn!(%remote, error = %e, "failed to wrap accepted connection");
                return;
            }
        };
        debug!(%remote, "accepted connection");

        let usable = *self.shared.usable_clients.read().await;

        let mut pending = Some(conn);
        for worker in self.workers.iter().take(usable) {
            let Some(c) = pending.take() else { break };
            match worker.accept(c) {
                Ok(()) => {
                    pending = None;
                    break;
                }
                Err((ProxyError::Busy, c)) => {
                    pending = Some(c);
                }
                Err((e, mut c)) => {
                    error!(%remote, error = %e, "worker rejected connection");
                    c.close();
                    return;
                }
            }
        }

        if let Some(mut c) = pending {
            info!(%remote, "Dropping client because there are no available slots.");
            c.close();
        }
    }

    /// `proxy_shutdown` (spec.md §4.6): close the gate, push a final
    /// registration snapshot, and unblock `run()`'s pending `accept`.
    pub async fn shutdown(&self) {
        *self.shared.usable_clients.write().await = 0;
        self.shared.push_registration();

        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();

        info!("proxy core shutdown: admissions closed");
    }

    /// `proxy_drop` (spec.md §4.6): terminate every in-flight slot session
    /// without waiting on `process()` to notice on its own.
    pub fn drop_sessions(&self) {
        for slot in &self.shared.slots {
            slot.drop_active();
        }
    }

    /// `proxy_close` (spec.md §4.6): `shutdown` + `drop`, then join every
    /// worker task and stop the registration collaborator. Idempotent with
    /// `shutdown` per spec.md §8's "`proxy_shutdown` followed by
    /// `proxy_shutdown` is safe".
    pub async fn close(&self) {
        self.shutdown().await;
        self.drop_sessions();

        let handles = std::mem::take(&mut *self.worker_handles.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked during close");
            }
        }

        self.shared.registration.stop();
        debug!("proxy core closed");
    }

    pub fn shared(&self) -> &Arc<CoreShared> {
        &self.shared
    }

    /// Recompile and swap in a new allow/deny pair (config hot-reload's
    /// `auth.calls_allowed`/`auth.calls_denied`, spec.md §9 "dynamic
    /// reconfiguration" is a Non-goal for the listener/slot layout but not
    /// for this filter, which the source's equivalent does allow to change
    /// live). Takes effect on the next handshake; in-flight handshakes keep
    /// the authorizer snapshot they already cloned.
    pub async fn apply_authorizer(&self, allowed: Option<&str>, denied: Option<&str>) -> Result<()> {
        let authorizer = Authorizer::new(allowed, denied)?;
        *self.shared.authorizer.write().await = Arc::new(authorizer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{hex32, password_response};
    use crate::nonce::FixedNonceSource;
    use crate::registration::RecordingSink;
    use std::net::IpAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(port: u16) -> ProxyConfig {
        use crate::config::{AuthSection, GeneralSection, NetworkSection, RegistrationSection, ServerSection};
        ProxyConfig {
            general: GeneralSection::default(),
            server: ServerSection {
                bind_addr: Some(IpAddr::from([127, 0, 0, 1])),
                port,
            },
            network: NetworkSection::default(),
            auth: AuthSection {
                password: "TEST".into(),
                calls_allowed: None,
                calls_denied: None,
            },
            registration: RegistrationSection::default(),
        }
    }

    #[tokio::test]
    async fn happy_path_admits_client_and_reports_registration() {
        let config = test_config(0);
        let nonce_source: Arc<dyn NonceSource> = Arc::new(FixedNonceSource(0x1234_5678));
        let registration = Arc::new(RecordingSink::default());
        let core = ProxyCore::open(&config, nonce_source, registration.clone())
            .await
            .unwrap();

        let addr = core.listener.local_addr().unwrap();
        core.start(&config).await;

        let core = Arc::new(core);
        let run_core = core.clone();
        let run_handle = tokio::spawn(async move { run_core.run().await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut nonce_bytes = [0u8; 8];
        client.read_exact(&mut nonce_bytes).await.unwrap();
        let nonce_str = std::str::from_utf8(&nonce_bytes).unwrap();
        let nonce = u32::from_str_radix(nonce_str, 16).unwrap();
        assert_eq!(hex32(nonce), nonce_bytes);

        let response = password_response(nonce, "TEST");
        let mut frame = Vec::new();
        frame.extend_from_slice(b"W1AW\n");
        frame.extend_from_slice(&response);
        client.write_all(&frame).await.unwrap();

        // Give the worker a moment to finish the hand-off and push
        // registration before asserting on it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let calls = registration.calls.lock().unwrap();
        assert!(calls.contains(&(1, 1)), "calls observed: {:?}", calls);
        drop(calls);

        core.shutdown().await;
        run_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_with_bad_password_frame() {
        let config = test_config(0);
        let nonce_source: Arc<dyn NonceSource> = Arc::new(FixedNonceSource(42));
        let registration = Arc::new(RecordingSink::default());
        let core = ProxyCore::open(&config, nonce_source, registration.clone())
            .await
            .unwrap();
        let addr = core.listener.local_addr().unwrap();
        core.start(&config).await;

        let core = Arc::new(core);
        let run_core = core.clone();
        let run_handle = tokio::spawn(async move { run_core.run().await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut nonce_bytes = [0u8; 8];
        client.read_exact(&mut nonce_bytes).await.unwrap();

        let mut frame = Vec::new();
        frame.extend_from_slice(b"W1AW\n");
        frame.extend_from_slice(&[0u8; 16]);
        client.write_all(&frame).await.unwrap();

        let mut reject = [0u8; 10];
        client.read_exact(&mut reject).await.unwrap();
        assert_eq!(
            reject,
            [0x07, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01]
        );

        core.shutdown().await;
        run_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_while_idle_unblocks_run_promptly() {
        let config = test_config(0);
        let nonce_source: Arc<dyn NonceSource> = Arc::new(FixedNonceSource(1));
        let registration = Arc::new(RecordingSink::default());
        let core = ProxyCore::open(&config, nonce_source, registration).await.unwrap();
        core.start(&config).await;
        assert_eq!(*core.shared.usable_clients.read().await, 1);

        let core = Arc::new(core);
        let run_core = core.clone();
        let run_handle = tokio::spawn(async move { run_core.run().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        core.shutdown().await;
        assert_eq!(*core.shared.usable_clients.read().await, 0);

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), run_handle)
            .await
            .expect("run() should return promptly after shutdown");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn overflow_closes_second_client_without_bytes() {
        let config = test_config(0);
        let nonce_source: Arc<dyn NonceSource> = Arc::new(FixedNonceSource(7));
        let registration = Arc::new(RecordingSink::default());
        let core = ProxyCore::open(&config, nonce_source, registration).await.unwrap();
        let addr = core.listener.local_addr().unwrap();
        core.start(&config).await;

        let core = Arc::new(core);
        let run_core = core.clone();
        let run_handle = tokio::spawn(async move { run_core.run().await });

        // First client occupies the single worker/slot and never completes
        // its handshake, keeping the worker permanently busy.
        let _first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = second.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "second client should see EOF, not the nonce frame");

        core.shutdown().await;
        run_handle.await.unwrap().unwrap();
    }
}
