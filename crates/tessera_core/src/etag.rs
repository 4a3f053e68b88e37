//! Ordered 128-bit version identifiers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::error::CoreError;

/// A 16-byte version identifier attached to every document, attachment
/// and index state.
///
/// The bytes hold `(base, counter)` in big-endian order, so comparing the
/// bytes compares the numbers: etags from a later session sort after all
/// etags of earlier sessions, and within a session after every earlier
/// write.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Etag([u8; 16]);

impl Etag {
    /// The all-zero etag, lower than any generated one.
    pub const EMPTY: Self = Self([0; 16]);

    /// Creates an etag from its numeric parts.
    #[must_use]
    pub fn new(base: u64, counter: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&base.to_be_bytes());
        bytes[8..].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    /// Creates an etag with no relation to any stored state.
    #[must_use]
    pub fn random() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    /// Creates an etag from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The session part.
    #[must_use]
    pub fn base(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(b)
    }

    /// The per-session counter.
    #[must_use]
    pub fn counter(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[8..]);
        u64::from_be_bytes(b)
    }

    /// Returns `true` for [`Etag::EMPTY`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_bytes(self.0), f)
    }
}

impl fmt::Debug for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Etag({self})")
    }
}

impl FromStr for Etag {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(|u| Self(*u.as_bytes()))
            .map_err(|e| CoreError::invalid_format(format!("invalid etag {s:?}: {e}")))
    }
}

impl Serialize for Etag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Etag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Lock-free source of increasing etags.
#[derive(Debug, Default)]
pub struct EtagGenerator {
    base: AtomicU64,
    counter: AtomicU64,
}

impl EtagGenerator {
    /// Creates a generator for the given session base.
    #[must_use]
    pub fn new(base: u64) -> Self {
        Self {
            base: AtomicU64::new(base),
            counter: AtomicU64::new(0),
        }
    }

    /// Starts a new session: later etags use `base` and restart counting.
    pub fn set_base(&self, base: u64) {
        self.base.store(base, Ordering::SeqCst);
        self.counter.store(0, Ordering::SeqCst);
    }

    /// Returns the current session base.
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base.load(Ordering::SeqCst)
    }

    /// Returns the next etag.
    pub fn next(&self) -> Etag {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Etag::new(self.base.load(Ordering::SeqCst), counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn display_round_trip() {
        let etag = Etag::new(3, 42);
        let text = etag.to_string();
        assert_eq!(text, "00000000-0000-0003-0000-00000000002a");
        assert_eq!(text.parse::<Etag>().unwrap(), etag);
        assert!("not-an-etag".parse::<Etag>().is_err());
    }

    #[test]
    fn later_session_sorts_after() {
        assert!(Etag::new(2, 0) > Etag::new(1, u64::MAX));
        assert!(Etag::EMPTY < Etag::new(0, 1));
        assert!(Etag::EMPTY.is_empty());
    }

    #[test]
    fn generator_is_monotonic_across_threads() {
        let gen = Arc::new(EtagGenerator::new(7));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = Arc::clone(&gen);
                std::thread::spawn(move || {
                    let mut prev = Etag::EMPTY;
                    let mut seen = Vec::new();
                    for _ in 0..1000 {
                        let e = gen.next();
                        assert!(e > prev);
                        prev = e;
                        seen.push(e);
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for e in h.join().unwrap() {
                assert_eq!(e.base(), 7);
                assert!(all.insert(e));
            }
        }
        assert_eq!(all.len(), 4000);
    }

    #[test]
    fn json_form_is_a_string() {
        let etag = Etag::new(1, 2);
        let json = serde_json::to_value(etag).unwrap();
        assert_eq!(json, serde_json::json!(etag.to_string()));
        let back: Etag = serde_json::from_value(json).unwrap();
        assert_eq!(back, etag);
    }

    proptest! {
        #[test]
        fn byte_order_matches_numeric_order(a in any::<(u64, u64)>(), b in any::<(u64, u64)>()) {
            let ea = Etag::new(a.0, a.1);
            let eb = Etag::new(b.0, b.1);
            prop_assert_eq!(ea.cmp(&eb), a.cmp(&b));
            prop_assert_eq!(ea.base(), a.0);
            prop_assert_eq!(ea.counter(), a.1);
        }
    }
}
