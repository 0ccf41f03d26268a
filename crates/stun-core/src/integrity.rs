// culvert-rs - The Culvert Telephony Core
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Long-term credential derivation and MESSAGE-INTEGRITY arithmetic.

use std::fmt::Write;

use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use smol_str::SmolStr;

type HmacSha1 = Hmac<Sha1>;

/// Derives the long-term credential HMAC key:
/// lowercase-hex `MD5(username ":" realm ":" password)`.
///
/// The key is computed once per session, when the first 401 challenge
/// supplies the realm, and replayed across that session's requests.
///
/// ```
/// use stun_core::long_term_key;
///
/// let key = long_term_key("user", "example.org", "secret");
/// assert_eq!(key.len(), 32);
/// assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
/// ```
pub fn long_term_key(username: &str, realm: &str, password: &str) -> SmolStr {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();

    let mut hex = String::with_capacity(32);
    for byte in digest {
        let _ = write!(hex, "{:02x}", byte);
    }
    SmolStr::new(hex)
}

/// HMAC-SHA1 of a message encoding under the given key.
pub fn message_hmac(raw: &[u8], key: &[u8]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(raw);
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of a received digest against the expected
/// HMAC of the raw encoding.
pub fn verify(raw: &[u8], key: &[u8], digest: &[u8; 20]) -> bool {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(raw);
    mac.verify_slice(digest).is_ok()
}
