//! # Identity Tokens
//!
//! Every component in this crate keys its state by an [`Identity`]: an
//! opaque 32-byte token derived deterministically from a client's raw
//! network address. The raw address never appears in stored state, so a
//! dump of the rate-limit tables or the suspicious-activity log cannot be
//! reversed into client addresses.
//!
//! ## Derivation
//!
//! `Identity = BLAKE3(domain_prefix || canonical_host)`
//!
//! - The domain prefix prevents cross-protocol hash reuse.
//! - The port is stripped when the input parses as a socket address, so
//!   reconnections from ephemeral ports map to the same identity.
//! - Empty or unparseable input still produces a well-defined token (the
//!   raw string is hashed as-is).
//!
//! ## Invariants
//!
//! - P1: equal canonical hosts always yield equal identities
//! - P2: `Identity::from_bytes(b).as_bytes() == b` (round-trip preservation)
//! - P3: collision probability is cryptographically negligible (BLAKE3)

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Domain separation prefix for identity hashing.
/// Prevents cross-protocol hash reuse.
const IDENTITY_HASH_DOMAIN: &[u8] = b"roomgate-identity-v1:";

/// Opaque hashed identity of a client address.
///
/// Used as the sole correlation key across rate limiting, escalation,
/// admission and liveness state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    /// Derive an identity from a raw network address.
    ///
    /// Deterministic and one-directional. The port is ignored for inputs
    /// that parse as `ip:port`, so `"10.0.0.1:40000"` and `"10.0.0.1:40001"`
    /// yield the same identity.
    pub fn from_addr(raw: &str) -> Self {
        let host = canonical_host(raw);
        let mut hasher = blake3::Hasher::new();
        hasher.update(IDENTITY_HASH_DOMAIN);
        hasher.update(host.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Extract the host portion of a raw address string.
///
/// Handles:
/// - IPv4 with port: `"192.168.1.1:8080"` → `"192.168.1.1"`
/// - IPv6 with port: `"[::1]:8080"` → `"::1"`
/// - Bare host: returned unchanged
/// - Anything unparseable: returned unchanged (hashed as-is)
fn canonical_host(raw: &str) -> &str {
    if raw.parse::<SocketAddr>().is_ok() {
        // Slice the host out of the original string rather than
        // re-formatting, keeping the function allocation-free.
        if let Some(bracket_end) = raw.find(']') {
            return &raw[1..bracket_end];
        }
        if let Some(colon) = raw.rfind(':') {
            return &raw[..colon];
        }
    }
    raw
}
