// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

//! Content-addressed digests for the elaboration engine.
//!
//! A [`Digest`] is either a 20-byte SHA1 over a step's recipe-internal inputs, or a 40-byte
//! digest where the trailing 20 bytes are a SHA1 over host-fingerprint contributions. The two
//! widths are distinct enum variants rather than a `Vec<u8>` so that "never emit 40 bytes when
//! there is no host contribution" (a documented backward-compatibility requirement) is enforced
//! by the type rather than by caller discipline.

use std::fmt;

use sha1::{Digest as _, Sha1};

/// Length of one SHA1 output.
pub const HASH_LEN: usize = 20;

/// A Variant-Id or Result-Id: a recipe-internal digest, optionally extended with a host
/// fingerprint digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Digest {
    /// No host (fingerprint) contribution.
    Short([u8; HASH_LEN]),
    /// `recipe || host`.
    Long([u8; 2 * HASH_LEN]),
}

impl Digest {
    /// The recipe-internal 20 bytes, regardless of width.
    pub fn recipe_slice(&self) -> &[u8; HASH_LEN] {
        match self {
            Digest::Short(b) => b,
            Digest::Long(b) => b[..HASH_LEN].try_into().unwrap(),
        }
    }

    /// The host-fingerprint 20 bytes, if this digest carries one.
    pub fn host_slice(&self) -> Option<[u8; HASH_LEN]> {
        match self {
            Digest::Short(_) => None,
            Digest::Long(b) => Some(b[HASH_LEN..].try_into().unwrap()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Digest::Short(b) => b.as_slice(),
            Digest::Long(b) => b.as_slice(),
        }
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// SHA1 over an arbitrary byte slice, exposed for callers that need a plain content digest (e.g.
/// hashing included file contents, or a sandbox recipe slice for the host fingerprint).
pub fn sha1_bytes(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Accumulates the two halves of a [`Digest`]: `update` feeds the recipe-internal hash,
/// `fingerprint` feeds the host-contribution hash. Mirrors the `DigestHasher` of the original
/// elaboration engine, including the "only emit the host half if something was ever fed to it"
/// rule.
#[derive(Default)]
pub struct DigestHasher {
    recipe: Option<Sha1>,
    host: Option<Sha1>,
}

impl DigestHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the recipe-internal half.
    pub fn update(&mut self, bytes: &[u8]) {
        self.recipe.get_or_insert_with(Sha1::new).update(bytes);
    }

    /// Feed bytes into the host-fingerprint half.
    pub fn fingerprint(&mut self, bytes: &[u8]) {
        self.host.get_or_insert_with(Sha1::new).update(bytes);
    }

    /// A 32-bit little-endian length prefix followed by the raw bytes, fed to the recipe half.
    /// This is the framing used throughout the Variant-Id/Result-Id layout for variable-length
    /// fields.
    pub fn write_framed(&mut self, bytes: &[u8]) {
        self.update(&(bytes.len() as u32).to_le_bytes());
        self.update(bytes);
    }

    pub fn write_str_framed(&mut self, s: &str) {
        self.write_framed(s.as_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.update(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.update(&[v as u8]);
    }

    /// Consume the hasher, producing the final digest. Emits [`Digest::Short`] unless anything
    /// was ever fed to the host half, in which case [`Digest::Long`] is produced.
    pub fn finish(self) -> Digest {
        let recipe: [u8; HASH_LEN] = self
            .recipe
            .unwrap_or_else(Sha1::new)
            .finalize()
            .into();
        match self.host {
            Some(host) => {
                let host: [u8; HASH_LEN] = host.finalize().into();
                let mut both = [0u8; 2 * HASH_LEN];
                both[..HASH_LEN].copy_from_slice(&recipe);
                both[HASH_LEN..].copy_from_slice(&host);
                Digest::Long(both)
            }
            None => Digest::Short(recipe),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_digest_is_short() {
        let h = DigestHasher::new();
        let d = h.finish();
        assert!(matches!(d, Digest::Short(_)));
        assert_eq!(d.as_bytes().len(), 20);
    }

    #[test]
    fn fingerprint_widens_to_long() {
        let mut h = DigestHasher::new();
        h.update(b"recipe bytes");
        h.fingerprint(b"host bytes");
        let d = h.finish();
        assert!(matches!(d, Digest::Long(_)));
        assert_eq!(d.as_bytes().len(), 40);
        assert!(d.host_slice().is_some());
    }

    #[test]
    fn deterministic_across_runs() {
        let build = || {
            let mut h = DigestHasher::new();
            h.write_str_framed("hello");
            h.write_u32(42);
            h.finish()
        };
        assert_eq!(build().as_bytes(), build().as_bytes());
    }

    #[test]
    fn empty_script_digest_matches_known_sha1_of_empty_string() {
        let empty = sha1_bytes(b"");
        assert_eq!(hex::encode(empty), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn ordering_is_lexicographic_over_bytes() {
        let mut a = DigestHasher::new();
        a.update(b"a");
        let a = a.finish();
        let mut b = DigestHasher::new();
        b.update(b"b");
        let b = b.finish();
        assert!(a.as_bytes() < b.as_bytes());
    }
}
