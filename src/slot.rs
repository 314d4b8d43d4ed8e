//! `ProxySlot` (spec.md §4.4): one outbound source-address "slot"; owns its
//! UDP/TCP relay state after admission. This is the proxy-connection
//! engine spec.md §1 scopes to a protocol-state-machine-level description
//! of its inner packet routing.
//!
//! Grounded on spec.md §4.4 directly (the C source's `proxy_conn_*` calls
//! aren't in the retrieved pack beyond their names in `proxy.c`, so the
//! inner relay loop here is this crate's own state-machine-level design,
//! built the way `examples/GrandMax-telemt-pannel/src/transport/middle_proxy.rs`
//! structures an async relay: `tokio::select!` over multiple sockets plus
//! an idle deadline).

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{bind_udp_external, TcpConnection};
use crate::error::{ProxyError, Result};

/// How long a slot may sit with no traffic in either direction before its
/// relay loop treats the session as dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(180);

/// Largest single relay datagram this crate forwards; EchoLink's audio/RTP
/// packets are well under typical UDP MTU.
const RELAY_BUF_LEN: usize = 2048;

enum SlotState {
    Idle,
    Active(ActiveSession),
}

struct ActiveSession {
    client: TcpConnection,
    callsign: String,
    data_socket: UdpSocket,
    control_socket: UdpSocket,
    peer_addr: Option<SocketAddr>,
    last_activity: Instant,
}

pub struct ProxySlot {
    id: usize,
    source_addr: IpAddr,
    state: Mutex<SlotState>,
    /// Sticky flag checked at the top of every `process()` call, paired
    /// with `cancel` so a `drop_active()` that lands between two
    /// `process()` invocations (i.e. when nothing is currently awaiting
    /// `cancel.notified()`) is never missed.
    cancelled: AtomicBool,
    /// Signaled by `drop()` to unblock an in-progress `process()` without
    /// taking the state lock, so shutdown can never deadlock against a
    /// relay loop in flight (spec.md §4.4 `drop()`, §5 Cancellation).
    cancel: Notify,
}

impl ProxySlot {
    pub fn new(id: usize, source_addr: IpAddr) -> Self {
        Self {
            id,
            source_addr,
            state: Mutex::new(SlotState::Idle),
            cancelled: AtomicBool::new(false),
            cancel: Notify::new(),
        }
    }

    pub fn source_addr(&self) -> IpAddr {
        self.source_addr
    }

    /// `init()`/`start()` in spec.md §4.6 do no per-slot allocation beyond
    /// construction: this crate binds the relay sockets lazily in
    /// `accept`, once per session, matching `finish()`'s promise to close
    /// them again.
    pub fn init(&self) -> Result<()> {
        Ok(())
    }

    pub fn start(&self) {}

    /// Transition `Idle -> Active`. On success, ownership of `conn` has
    /// moved into the slot. On failure, `conn` and `callsign` are handed
    /// back unchanged so the caller can offer them to another slot.
    pub fn accept(
        &self,
        conn: TcpConnection,
        callsign: String,
    ) -> std::result::Result<(), (ProxyError, TcpConnection, String)> {
        let mut guard = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err((ProxyError::Busy, conn, callsign)),
        };

        if matches!(*guard, SlotState::Active(_)) {
            return Err((ProxyError::Busy, conn, callsign));
        }

        let data_socket = match bind_udp_external(self.source_addr) {
            Ok(s) => s,
            Err(e) => return Err((e, conn, callsign)),
        };
        let control_socket = match bind_udp_external(self.source_addr) {
            Ok(s) => s,
            Err(e) => return Err((e, conn, callsign)),
        };

        debug!(
            slot = self.id,
            %callsign,
            source_addr = %self.source_addr,
            data_port = data_socket.local_addr().map(|a| a.port()).unwrap_or(0),
            "slot admitted client"
        );

        self.cancelled.store(false, Ordering::SeqCst);

        *guard = SlotState::Active(ActiveSession {
            client: conn,
            callsign,
            data_socket,
            control_socket,
            peer_addr: None,
            last_activity: Instant::now(),
        });

        Ok(())
    }

    /// One iteration of the relay loop. `Ok(n)` (`n >= 0`) while the
    /// session is alive, `Err` on termination (EOF, I/O failure, idle
    /// timeout, or an explicit `drop()` request).
    pub async fn process(&self) -> Result<i64> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ProxyError::ConnLost(std::io::Error::new(
                std::io::ErrorKind::Other,
                "slot dropped",
            )));
        }

        let mut guard = self.state.lock().await;
        let session = match &mut *guard {
            SlotState::Active(s) => s,
            SlotState::Idle => return Err(ProxyError::InvalidData),
        };

        let mut client_buf = [0u8; RELAY_BUF_LEN];
        let mut data_buf = [0u8; RELAY_BUF_LEN];
        let mut control_buf = [0u8; RELAY_BUF_LEN];
        let deadline = session.last_activity + IDLE_TIMEOUT;

        tokio::select! {
            _ = self.cancel.notified() => {
                Err(ProxyError::ConnLost(std::io::Error::new(std::io::ErrorKind::Other, "slot dropped")))
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!(slot = self.id, callsign = %session.callsign, "idle timeout; closing session");
                Err(ProxyError::ConnLost(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle timeout")))
            }
            res = session.data_socket.recv_from(&mut data_buf) => {
                let (n, from) = res.map_err(ProxyError::Io)?;
                self.relay_inbound_datagram(session, from, &data_buf[..n]).await
            }
            res = session.control_socket.recv_from(&mut control_buf) => {
                let (n, from) = res.map_err(ProxyError::Io)?;
                self.relay_inbound_control(session, from, &control_buf[..n]).await
            }
            res = session.client.recv_exact(1) => {
                match res {
                    Ok(b) => self.relay_outbound_command(session, &b, &mut client_buf).await,
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn relay_inbound_datagram(
        &self,
        session: &mut ActiveSession,
        from: SocketAddr,
        payload: &[u8],
    ) -> Result<i64> {
        if session.peer_addr.is_none() {
            debug!(slot = self.id, peer = %from, "learned relay peer from first datagram");
            session.peer_addr = Some(from);
        }
        session.last_activity = Instant::now();
        session.client.send(payload).await?;
        Ok(payload.len() as i64)
    }

    async fn relay_inbound_control(
        &self,
        session: &mut ActiveSession,
        from: SocketAddr,
        payload: &[u8],
    ) -> Result<i64> {
        if session.peer_addr.is_none() {
            session.peer_addr = Some(from);
        }
        session.last_activity = Instant::now();
        session.client.send(payload).await?;
        Ok(payload.len() as i64)
    }

    /// A single byte read from the client TCP stream while idle on relay
    /// traffic doubles as a liveness probe: EchoLink clients periodically
    /// send short control bytes on the TCP channel even while audio flows
    /// over UDP, and an `UnexpectedEof` here is the normal "client hung
    /// up" signal this loop terminates on.
    async fn relay_outbound_command(
        &self,
        session: &mut ActiveSession,
        first_byte: &[u8],
        _scratch: &mut [u8],
    ) -> Result<i64> {
        session.last_activity = Instant::now();
        if let Some(peer) = session.peer_addr {
            session.control_socket.send_to(first_byte, peer).await?;
        }
        Ok(first_byte.len() as i64)
    }

    /// Tear down the active session and return to `Idle`. Idempotent.
    pub fn finish(&self) {
        let mut guard = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let SlotState::Active(mut session) = std::mem::replace(&mut *guard, SlotState::Idle) {
            session.client.close();
            debug!(slot = self.id, callsign = %session.callsign, "slot finished");
        }
    }

    /// Request early termination of any in-flight session. Never blocks on
    /// `process()`'s state lock: sets the sticky flag first (caught by the
    /// next `process()` call even if none is currently in flight), then
    /// wakes anything already parked on `cancel.notified()`.
    pub fn drop_active(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
    }

    /// Non-blocking, advisory (spec.md §4.4): a relaxed snapshot is
    /// acceptable since this is consumed only by the registration count.
    pub fn in_use(&self) -> bool {
        match self.state.try_lock() {
            Ok(guard) => matches!(*guard, SlotState::Active(_)),
            // Locked means a relay iteration is in flight, i.e. active.
            Err(_) => true,
        }
    }
}
