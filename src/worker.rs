//! `ClientWorker` (spec.md §4.3): owns one incoming TCP client, runs the
//! challenge-response handshake, and hands the authenticated connection off
//! to the first free [`crate::slot::ProxySlot`].
//!
//! Grounded line-for-line on `examples/original_source/src/proxy.c`'s
//! `proxy_worker_accept`, `proxy_worker_authorize`, and `proxy_worker_func`.

use std::sync::Weak;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::connection::TcpConnection;
use crate::core::CoreShared;
use crate::digest::{hex32, password_response, PROXY_PASS_RES_LEN};
use crate::error::{ProxyError, Result};
use crate::nonce::NonceSource;

/// Wrong-password rejection frame (spec.md §6). A distinct constant from
/// [`MSG_BAD_AUTH`] so the two reject frames can never drift into sharing a
/// `sizeof` the way the historical C source's two `conn_send` calls did
/// (spec.md §9's first Open Question).
const MSG_BAD_PASSWORD: [u8; 10] = [0x07, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];

/// Wrong-authorization rejection frame (spec.md §6).
const MSG_BAD_AUTH: [u8; 10] = [0x07, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02];

/// Run the challenge-response handshake to completion (spec.md §4.3.1).
/// Returns the authenticated callsign on success.
pub async fn run_handshake(
    conn: &mut TcpConnection,
    nonce_source: &dyn NonceSource,
    password: &str,
    authorizer: &Authorizer,
) -> Result<String> {
    let nonce = nonce_source.next_nonce()?;
    let nonce_hex = hex32(nonce);
    let expected = password_response(nonce, password);

    conn.send(&nonce_hex).await?;

    // The first 16-byte read intentionally overlaps the callsign's
    // terminator and part of the 16-byte response so the variable-length
    // callsign can be discovered without a second read until its length is
    // known (spec.md §4.3.1).
    let mut buf = conn.recv_exact(16).await?;

    let idx = buf[0..11]
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ProxyError::InvalidData)?;

    let callsign = String::from_utf8_lossy(&buf[0..idx]).into_owned();

    let rest = conn.recv_exact(idx + 1).await?;
    buf.extend_from_slice(&rest);

    let resp_start = idx + 1;
    let actual = &buf[resp_start..resp_start + PROXY_PASS_RES_LEN];

    if actual != expected {
        info!(%callsign, "Client supplied an incorrect password. Dropping...");
        conn.send(&MSG_BAD_PASSWORD).await?;
        return Err(ProxyError::AccessDenied);
    }

    if !authorizer.is_authorized(&callsign) {
        info!(%callsign, "Client is not authorized to use this proxy. Dropping...");
        conn.send(&MSG_BAD_AUTH).await?;
        return Err(ProxyError::AccessDenied);
    }

    Ok(callsign)
}

/// Owns one incoming TCP client connection and the task that drives its
/// authorization and slot hand-off.
///
/// `conn_client`'s `tokio::sync::Mutex` guard is held for the entire
/// duration a connection is being processed (handshake through slot
/// hand-off), not just around the pointer swap the way the C mutex is
/// used — an idiomatic adaptation that lets `accept`'s non-blocking
/// `try_lock` alone implement the "busy iff non-idle" contract spec.md
/// §4.3 requires, without a second flag.
pub struct ClientWorker {
    id: usize,
    conn_client: Mutex<Option<TcpConnection>>,
    wake: Notify,
}

impl ClientWorker {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            conn_client: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    /// Transfers ownership of `conn` into this worker if it is idle.
    /// Non-blocking: returns `Busy` immediately if the worker is currently
    /// processing another connection, handing `conn` back unchanged so the
    /// admission loop can offer it to the next worker (spec.md §4.5 step 4).
    pub fn accept(
        &self,
        conn: TcpConnection,
    ) -> std::result::Result<(), (ProxyError, TcpConnection)> {
        let mut guard = match self.conn_client.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err((ProxyError::Busy, conn)),
        };
        if guard.is_some() {
            return Err((ProxyError::Busy, conn));
        }
        *guard = Some(conn);
        drop(guard);
        self.wake.notify_one();
        Ok(())
    }

    /// The worker's task body: wait to be woken, then process the
    /// connection to completion before going idle again. Runs until the
    /// owning `ProxyCore` is dropped (its `Weak` upgrade starts failing).
    pub async fn run(&self, core: Weak<CoreShared>) {
        loop {
            self.wake.notified().await;

            let mut guard = self.conn_client.lock().await;
            if guard.is_none() {
                error!(worker = self.id, "spurious wake: no connection was given");
                continue;
            }

            let Some(core) = core.upgrade() else {
                *guard = None;
                return;
            };

            self.process(&mut guard, &core).await;
            *guard = None;
        }
    }

    async fn process(
        &self,
        guard: &mut tokio::sync::MutexGuard<'_, Option<TcpConnection>>,
        core: &CoreShared,
    ) {
        let conn = guard.as_mut().expect("checked Some by caller");
        let remote_addr = conn.remote_addr();

        debug!(worker = self.id, %remote_addr, "new connection - beginning authorization procedure");

        let authorizer = core.authorizer.read().await.clone();
        let callsign = match run_handshake(
            conn,
            core.nonce_source.as_ref(),
            &core.password,
            &authorizer,
        )
        .await
        {
            Ok(callsign) => callsign,
            Err(e) if e.is_conn_lost() => {
                warn!(worker = self.id, %remote_addr, "connection to client was lost before authorization could complete");
                conn.close();
                return;
            }
            Err(ProxyError::AccessDenied) => {
                conn.close();
                return;
            }
            Err(e) => {
                error!(worker = self.id, %remote_addr, error = %e, "authorization failed");
                conn.close();
                return;
            }
        };

        let mut pending = guard.take().map(|c| (c, callsign.clone()));
        let mut hand_off = None;
        {
            let usable = *core.usable_clients.read().await;
            for slot in core.slots.iter().take(usable) {
                let Some((conn, cs)) = pending.take() else {
                    break;
                };
                match slot.accept(conn, cs) {
                    Ok(()) => {
                        hand_off = Some(slot.clone());
                        break;
                    }
                    Err((ProxyError::Busy, conn, cs)) => {
                        pending = Some((conn, cs));
                    }
                    Err((_, conn, cs)) => {
                        pending = Some((conn, cs));
                        break;
                    }
                }
            }
        }

        let Some(slot) = hand_off else {
            error!(worker = self.id, %callsign, "state error: no available slots");
            if let Some((mut conn, _)) = pending {
                conn.close();
            }
            return;
        };

        // Push only now that the slot is Active, so the registration
        // collaborator observes the admission (spec.md §2; scenario 1
        // expects `(1, 1)` to be visible, not `(0, total)`).
        core.push_registration();

        loop {
            match slot.process().await {
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        info!(%callsign, "Disconnected from client");
        slot.finish();

        core.push_registration();

        debug!(worker = self.id, "client worker is returning cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::FixedNonceSource;
    use tokio::net::TcpListener;

    #[test]
    fn reject_frames_are_exactly_ten_bytes_and_distinct() {
        assert_eq!(MSG_BAD_PASSWORD.len(), 10);
        assert_eq!(MSG_BAD_AUTH.len(), 10);
        assert_ne!(MSG_BAD_PASSWORD, MSG_BAD_AUTH);
    }

    async fn make_conn_pair() -> (TcpConnection, TcpConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_fut = tokio::net::TcpStream::connect(addr);
        let (server, client) = tokio::join!(listener.accept(), client_fut);
        let server = TcpConnection::from_stream(server.unwrap().0).unwrap();
        let client = TcpConnection::from_stream(client.unwrap()).unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn handshake_succeeds_with_correct_response() {
        let (mut server, mut client) = make_conn_pair().await;
        let nonce_source = FixedNonceSource(0x1234_5678);
        let authorizer = Authorizer::empty();

        let server_fut =
            tokio::spawn(
                async move { run_handshake(&mut server, &nonce_source, "TEST", &authorizer).await },
            );

        let nonce_hex = client.recv_exact(8).await.unwrap();
        let nonce = u32::from_str_radix(std::str::from_utf8(&nonce_hex).unwrap(), 16).unwrap();
        let response = password_response(nonce, "TEST");

        let mut frame = b"W1AW\n".to_vec();
        frame.extend_from_slice(&response);
        client.send(&frame).await.unwrap();

        let callsign = server_fut.await.unwrap().unwrap();
        assert_eq!(callsign, "W1AW");
    }

    #[tokio::test]
    async fn handshake_is_case_insensitive_on_password() {
        let (mut server, mut client) = make_conn_pair().await;
        let nonce_source = FixedNonceSource(7);
        let authorizer = Authorizer::empty();

        let server_fut =
            tokio::spawn(
                async move { run_handshake(&mut server, &nonce_source, "test", &authorizer).await },
            );

        let nonce_hex = client.recv_exact(8).await.unwrap();
        let nonce = u32::from_str_radix(std::str::from_utf8(&nonce_hex).unwrap(), 16).unwrap();
        // Client always computes the response against the uppercased form;
        // scenario 2 (spec.md §8) asserts this is identical either way.
        let response = password_response(nonce, "TEST");

        let mut frame = b"K5XYZ\n".to_vec();
        frame.extend_from_slice(&response);
        client.send(&frame).await.unwrap();

        assert_eq!(server_fut.await.unwrap().unwrap(), "K5XYZ");
    }

    #[tokio::test]
    async fn wrong_password_sends_bad_password_frame_and_denies() {
        let (mut server, mut client) = make_conn_pair().await;
        let nonce_source = FixedNonceSource(42);
        let authorizer = Authorizer::empty();

        let server_fut =
            tokio::spawn(
                async move { run_handshake(&mut server, &nonce_source, "TEST", &authorizer).await },
            );

        client.recv_exact(8).await.unwrap();
        let mut frame = b"W1AW\n".to_vec();
        frame.extend_from_slice(&[0u8; PROXY_PASS_RES_LEN]);
        client.send(&frame).await.unwrap();

        let result = server_fut.await.unwrap();
        assert!(matches!(result, Err(ProxyError::AccessDenied)));

        let reject = client.recv_exact(10).await.unwrap();
        assert_eq!(reject, MSG_BAD_PASSWORD);
    }

    #[tokio::test]
    async fn denied_callsign_sends_bad_auth_frame() {
        let (mut server, mut client) = make_conn_pair().await;
        let nonce_source = FixedNonceSource(99);
        let authorizer = Authorizer::new(None, Some("^BAD.*")).unwrap();

        let server_fut =
            tokio::spawn(
                async move { run_handshake(&mut server, &nonce_source, "TEST", &authorizer).await },
            );

        let nonce_hex = client.recv_exact(8).await.unwrap();
        let nonce = u32::from_str_radix(std::str::from_utf8(&nonce_hex).unwrap(), 16).unwrap();
        let response = password_response(nonce, "TEST");

        let mut frame = b"BADCALL\n".to_vec();
        frame.extend_from_slice(&response);
        client.send(&frame).await.unwrap();

        let result = server_fut.await.unwrap();
        assert!(matches!(result, Err(ProxyError::AccessDenied)));

        let reject = client.recv_exact(10).await.unwrap();
        assert_eq!(reject, MSG_BAD_AUTH);
    }

    #[tokio::test]
    async fn empty_callsign_is_accepted_when_newline_is_first_byte() {
        let (mut server, mut client) = make_conn_pair().await;
        let nonce_source = FixedNonceSource(5);
        let authorizer = Authorizer::empty();

        let server_fut =
            tokio::spawn(
                async move { run_handshake(&mut server, &nonce_source, "TEST", &authorizer).await },
            );

        let nonce_hex = client.recv_exact(8).await.unwrap();
        let nonce = u32::from_str_radix(std::str::from_utf8(&nonce_hex).unwrap(), 16).unwrap();
        let response = password_response(nonce, "TEST");

        let mut frame = b"\n".to_vec();
        frame.extend_from_slice(&response);
        client.send(&frame).await.unwrap();

        assert_eq!(server_fut.await.unwrap().unwrap(), "");
    }

    #[tokio::test]
    async fn missing_newline_in_first_eleven_bytes_is_invalid_data() {
        let (mut server, mut client) = make_conn_pair().await;
        let nonce_source = FixedNonceSource(13);
        let authorizer = Authorizer::empty();

        let server_fut =
            tokio::spawn(
                async move { run_handshake(&mut server, &nonce_source, "TEST", &authorizer).await },
            );

        client.recv_exact(8).await.unwrap();
        // 16 bytes, no '\n' anywhere in the first 11.
        client.send(&[b'A'; 16]).await.unwrap();

        let result = server_fut.await.unwrap();
        assert!(matches!(result, Err(ProxyError::InvalidData)));
    }
}
