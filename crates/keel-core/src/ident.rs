// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier and hashing utilities.
//!
//! Every identity and chain element in Keel is a SHA3-256 digest of canonical
//! bytes. SHA-256 appears in exactly one place — pairwise Merkle interior
//! nodes over raw 32-byte leaves (see [`crate::receipt::merkle_root`]) — and
//! that split is part of the wire contract.
//!
//! On the wire, hashes are 64-char lowercase hex with an `h:` prefix and ids
//! carry an `id:` prefix. Ordering, wherever observable, is over raw bytes.

use sha3::{Digest, Sha3_256};
use thiserror::Error;

/// Canonical 256-bit hash used for state, action, receipt, contract-set,
/// matrix, policy, and kernel identities.
pub type Hash = [u8; 32];

/// Genesis previous-hash: 32 zero bytes, unless the policy bundle overrides.
pub const GENESIS_PREV_HASH: Hash = [0u8; 32];

/// Computes the SHA3-256 digest of `bytes`.
pub fn sha3_256(bytes: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Encodes a hash as its `h:`-tagged lowercase hex wire form.
pub fn hash_to_wire(hash: &Hash) -> String {
    format!("h:{}", hex::encode(hash))
}

/// Decodes an `h:`-tagged lowercase hex hash from the wire.
///
/// # Errors
/// Rejects a missing tag, wrong length, uppercase digits, and non-hex bytes.
pub fn hash_from_wire(s: &str) -> Result<Hash, IdentError> {
    let body = s.strip_prefix("h:").ok_or(IdentError::MissingHashTag)?;
    if body.len() != 64 {
        return Err(IdentError::BadHashLength(body.len()));
    }
    if body.bytes().any(|b| !matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(IdentError::NonCanonicalHex);
    }
    let raw = hex::decode(body).map_err(|_| IdentError::NonCanonicalHex)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&raw);
    Ok(out)
}

/// Errors produced while decoding identifiers from the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentError {
    /// Hash string did not carry the `h:` tag.
    #[error("missing h: tag on hash")]
    MissingHashTag,
    /// Hash hex body was not exactly 64 characters.
    #[error("hash hex body has length {0}, expected 64")]
    BadHashLength(usize),
    /// Hash body contained uppercase or non-hex characters.
    #[error("non-canonical hex")]
    NonCanonicalHex,
    /// Id string did not carry the `id:` tag.
    #[error("missing id: tag on identifier")]
    MissingIdTag,
    /// Id body was empty or contained control characters.
    #[error("malformed identifier body")]
    MalformedId,
    /// Field id was not 32 lowercase hex characters.
    #[error("malformed field id")]
    MalformedFieldId,
}

// =============================================================================
// Operation identifiers
// =============================================================================

/// Stable identifier for an operation in an execution plan.
///
/// `OpId`s are produced by the external lowering (derived from the module
/// digest, source path, and binder index) and are opaque here. The canonical
/// ordering everywhere in the scheduler is ascending raw UTF-8 bytes of the
/// id body — `Ord` on the inner `String` provides exactly that.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct OpId(String);

impl OpId {
    /// Builds an op id from its raw body (without the `id:` wire tag).
    ///
    /// # Errors
    /// Rejects empty bodies and bodies containing ASCII control characters.
    pub fn new(body: impl Into<String>) -> Result<Self, IdentError> {
        let body = body.into();
        if body.is_empty() || body.bytes().any(|b| b < 0x20 || b == 0x7f) {
            return Err(IdentError::MalformedId);
        }
        Ok(Self(body))
    }

    /// Decodes an `id:`-tagged identifier from the wire.
    pub fn from_wire(s: &str) -> Result<Self, IdentError> {
        let body = s.strip_prefix("id:").ok_or(IdentError::MissingIdTag)?;
        Self::new(body)
    }

    /// Returns the raw id body.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the raw UTF-8 bytes used for canonical ordering.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Encodes the `id:`-tagged wire form.
    #[must_use]
    pub fn to_wire(&self) -> String {
        format!("id:{}", self.0)
    }
}

// =============================================================================
// Field identifiers
// =============================================================================

/// Identifier for a state field: 16 raw bytes, written as 32 lowercase hex
/// characters on the wire.
///
/// Ordering is over the decoded raw bytes, which is what the canonical state
/// encoding sorts by. (For lowercase hex, byte order and string order agree,
/// but the decoded form is authoritative.)
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct FieldId(pub [u8; 16]);

impl FieldId {
    /// Decodes a field id from its 32-char lowercase hex wire form.
    pub fn from_hex(s: &str) -> Result<Self, IdentError> {
        if s.len() != 32 || s.bytes().any(|b| !matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(IdentError::MalformedFieldId);
        }
        let raw = hex::decode(s).map_err(|_| IdentError::MalformedFieldId)?;
        let mut out = [0u8; 16];
        out.copy_from_slice(&raw);
        Ok(Self(out))
    }

    /// Returns the canonical byte representation of this id.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Encodes the 32-char lowercase hex wire form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}
