//! MD5 digest, nonce rendering, and the handshake password response.
//!
//! Grounded on `examples/original_source/src/digest.c` (`digest_get`,
//! `digest_to_str`) and `proxy.c::get_password_response`.

use md5::{Digest as _, Md5};

/// Length of an MD5 digest in bytes. This crate's handshake response is
/// always this long, which must equal the wire protocol's expected
/// response length (§4.1) — enforced at compile time just below.
pub const DIGEST_LEN: usize = 16;

/// The EchoLink wire protocol's expected password-response length.
pub const PROXY_PASS_RES_LEN: usize = 16;

const _: () = assert!(
    DIGEST_LEN == PROXY_PASS_RES_LEN,
    "password response length mismatch"
);

/// Standard MD5 over `data`.
pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Render `n` as 8 lowercase ASCII hex characters, most-significant nibble
/// first, zero-padded.
pub fn hex32(n: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (i, b) in out.iter_mut().enumerate() {
        let shift = 28 - i * 4;
        let nibble = (n >> shift) & 0xF;
        *b = match nibble {
            0..=9 => b'0' + nibble as u8,
            _ => b'a' + (nibble as u8 - 10),
        };
    }
    out
}

/// Inverse of [`hex32`]; used only in tests to check the round-trip
/// invariant (spec.md §8, property 2).
#[cfg(test)]
pub fn parse_hex32(s: &[u8; 8]) -> u32 {
    let mut n = 0u32;
    for &b in s {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => panic!("invalid hex digit"),
        };
        n = (n << 4) | nibble as u32;
    }
    n
}

/// Uppercase only the ASCII lowercase letters of `password` (codes 97..122);
/// every other byte, including non-ASCII, passes through unchanged. Mirrors
/// `get_password_response`'s byte-range check exactly rather than a
/// locale-aware `str::to_uppercase`.
fn uppercase_ascii(password: &[u8]) -> Vec<u8> {
    password
        .iter()
        .map(|&b| if (97..=122).contains(&b) { b - 32 } else { b })
        .collect()
}

/// `digest(UPPERCASE(password) ‖ hex32(nonce))`. Always 16 bytes.
pub fn password_response(nonce: u32, password: &str) -> [u8; DIGEST_LEN] {
    let mut buf = uppercase_ascii(password.as_bytes());
    buf.extend_from_slice(&hex32(nonce));
    digest(&buf)
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// spec.md §8 invariant 2: `hex32` is always 8 lowercase hex bytes
        /// and round-trips through `parse_hex32` for every `u32`.
        #[test]
        fn hex32_round_trips_for_any_u32(n in any::<u32>()) {
            let h = hex32(n);
            prop_assert_eq!(h.len(), 8);
            for &c in &h {
                prop_assert!(c.is_ascii_hexdigit());
                prop_assert!(!c.is_ascii_uppercase());
            }
            prop_assert_eq!(parse_hex32(&h), n);
        }

        /// spec.md §8 invariant 1: the response is always 16 bytes for any
        /// password/nonce pair.
        #[test]
        fn password_response_is_always_16_bytes(
            n in any::<u32>(),
            password in "[ -~]{0,32}",
        ) {
            prop_assert_eq!(password_response(n, &password).len(), DIGEST_LEN);
        }

        /// spec.md §8 invariant 1: the result depends only on
        /// `UPPERCASE(password) ‖ hex32(nonce)` — swapping in an
        /// already-uppercased password must not change the response.
        #[test]
        fn response_is_unaffected_by_input_casing(
            n in any::<u32>(),
            password in "[a-zA-Z0-9]{0,16}",
        ) {
            let upper = password.to_ascii_uppercase();
            prop_assert_eq!(password_response(n, &password), password_response(n, &upper));
        }

        /// A changed nonce must not collide with the unmodified one for a
        /// fixed password (sanity check that the digest actually mixes the
        /// nonce in, not a cryptographic collision-resistance claim).
        #[test]
        fn different_nonces_give_different_responses(
            n in any::<u32>(),
            password in "[ -~]{1,32}",
        ) {
            let other = n.wrapping_add(1);
            prop_assert_ne!(password_response(n, &password), password_response(other, &password));
        }
    }
}
