//! Node identity keys.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length of a serialized node public key (a compressed secp256k1 point).
pub const PUB_KEY_SIZE: usize = 33;

/// A node's public key. The primary, persistent identity of a node on the
/// overlay network.
///
/// Treated as an opaque byte string by everything except the identity layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubKey([u8; PUB_KEY_SIZE]);

impl PubKey {
    /// Create a key from raw bytes.
    pub fn new(bytes: [u8; PUB_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PUB_KEY_SIZE] {
        &self.0
    }

    /// Full-width lexicographic comparison. Examines every byte regardless
    /// of where the first difference occurs, so the duplicate-connection
    /// tie-break doesn't leak a timing signal about key contents.
    pub fn cmp_ct(&self, other: &PubKey) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        let mut ordering = Ordering::Equal;
        for (a, b) in self.0.iter().zip(other.0.iter()).rev() {
            match a.cmp(b) {
                Ordering::Equal => {}
                unequal => ordering = unequal,
            }
        }
        ordering
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self)
    }
}

/// An error parsing a public key from its hex form.
#[derive(Debug, thiserror::Error)]
pub enum ParsePubKeyError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid key length: expected {PUB_KEY_SIZE} bytes, got {0}")]
    Length(usize),
}

impl FromStr for PubKey {
    type Err = ParsePubKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::try_from(bytes.as_slice()).map_err(|_| ParsePubKeyError::Length(bytes.len()))
    }
}

impl TryFrom<&[u8]> for PubKey {
    type Error = ();

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; PUB_KEY_SIZE] = bytes.try_into().map_err(|_| ())?;
        Ok(Self(bytes))
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct PubKeyVisitor;

impl<'de> Visitor<'de> for PubKeyVisitor {
    type Value = PubKey;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} key bytes", PUB_KEY_SIZE)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        PubKey::try_from(v).map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bytes = Vec::with_capacity(PUB_KEY_SIZE);
        while let Some(b) = seq.next_element::<u8>()? {
            bytes.push(b);
        }
        PubKey::try_from(bytes.as_slice()).map_err(|_| de::Error::invalid_length(bytes.len(), &self))
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(PubKeyVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(fill: u8) -> PubKey {
        PubKey::new([fill; PUB_KEY_SIZE])
    }

    #[test]
    fn hex_round_trip() {
        let k = key(0xab);
        let parsed: PubKey = k.to_string().parse().unwrap();

        assert_eq!(parsed, k);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("aabb".parse::<PubKey>().is_err());
        assert!(PubKey::try_from(&[0u8; 32][..]).is_err());
    }

    #[test]
    fn cmp_ct_matches_ord() {
        let mut a = [0u8; PUB_KEY_SIZE];
        let mut b = [0u8; PUB_KEY_SIZE];
        a[0] = 0xaa;
        b[0] = 0xbb;
        a[32] = 0xff; // differs in the tail too

        let (a, b) = (PubKey::new(a), PubKey::new(b));

        assert_eq!(a.cmp_ct(&b), a.cmp(&b));
        assert_eq!(b.cmp_ct(&a), b.cmp(&a));
        assert_eq!(a.cmp_ct(&a), std::cmp::Ordering::Equal);
    }
}
