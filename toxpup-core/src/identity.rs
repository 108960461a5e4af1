//! Peer identities, transient session handles and the 38-byte Tox address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length of a peer public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Length of the anti-spam nonce in bytes.
pub const NOSPAM_SIZE: usize = 4;
/// Length of the address checksum in bytes.
pub const CHECKSUM_SIZE: usize = 2;
/// Full address: public key + nonce + checksum.
pub const ADDRESS_SIZE: usize = PUBLIC_KEY_SIZE + NOSPAM_SIZE + CHECKSUM_SIZE;

/// Long-lived public key of a peer. Rendered and parsed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity([u8; PUBLIC_KEY_SIZE]);

impl PeerIdentity {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        PeerIdentity(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerIdentity({})", self.to_hex())
    }
}

impl FromStr for PeerIdentity {
    type Err = IdentityError;

    /// Accepts upper or lower case hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_exact::<PUBLIC_KEY_SIZE>(s)?;
        Ok(PeerIdentity(bytes))
    }
}

/// Transport-assigned number for a peer, valid only for the current run.
/// Never persisted; see [`crate::directory::PeerDirectory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u32);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Transfer number assigned by the transport, unique per peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u32);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reachable address of an account: public key, anti-spam nonce and checksum.
/// This is what a friend request is sent to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ToxAddress {
    public_key: PeerIdentity,
    nospam: u32,
}

impl ToxAddress {
    pub fn new(public_key: PeerIdentity, nospam: u32) -> Self {
        Self { public_key, nospam }
    }

    pub fn public_key(&self) -> &PeerIdentity {
        &self.public_key
    }

    pub fn nospam(&self) -> u32 {
        self.nospam
    }

    /// Key followed by the big-endian nonce.
    fn prefix(&self) -> [u8; PUBLIC_KEY_SIZE + NOSPAM_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE + NOSPAM_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(self.public_key.as_bytes());
        out[PUBLIC_KEY_SIZE..].copy_from_slice(&self.nospam.to_be_bytes());
        out
    }

    pub fn checksum(&self) -> [u8; CHECKSUM_SIZE] {
        checksum(&self.prefix())
    }

    pub fn to_bytes(&self) -> [u8; ADDRESS_SIZE] {
        let mut out = [0u8; ADDRESS_SIZE];
        out[..PUBLIC_KEY_SIZE + NOSPAM_SIZE].copy_from_slice(&self.prefix());
        out[PUBLIC_KEY_SIZE + NOSPAM_SIZE..].copy_from_slice(&self.checksum());
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl fmt::Display for ToxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ToxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ToxAddress({})", self.to_hex())
    }
}

impl FromStr for ToxAddress {
    type Err = IdentityError;

    /// Parses the 76-character hex form and rejects a mismatching checksum.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_exact::<ADDRESS_SIZE>(s)?;
        let mut key = [0u8; PUBLIC_KEY_SIZE];
        key.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut nospam = [0u8; NOSPAM_SIZE];
        nospam.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + NOSPAM_SIZE]);
        let address = ToxAddress::new(PeerIdentity(key), u32::from_be_bytes(nospam));
        if address.checksum()[..] != bytes[PUBLIC_KEY_SIZE + NOSPAM_SIZE..] {
            return Err(IdentityError::BadChecksum);
        }
        Ok(address)
    }
}

/// XOR-fold `bytes` pairwise into a two-byte accumulator: even offsets into
/// the first byte, odd offsets into the second.
pub fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut acc = [0u8; CHECKSUM_SIZE];
    for (i, b) in bytes.iter().enumerate() {
        acc[i % CHECKSUM_SIZE] ^= b;
    }
    acc
}

fn decode_exact<const N: usize>(s: &str) -> Result<[u8; N], IdentityError> {
    let raw = hex::decode(s.trim().to_ascii_lowercase())?;
    let actual = raw.len();
    raw.try_into()
        .map_err(|_| IdentityError::InvalidLength {
            expected: N,
            actual,
        })
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("address checksum mismatch")]
    BadChecksum,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_address_has_zero_checksum() {
        let addr = ToxAddress::new(PeerIdentity::from_bytes([0; 32]), 0);
        assert_eq!(addr.checksum(), [0, 0]);
        let hex = addr.to_hex();
        assert_eq!(hex.len(), ADDRESS_SIZE * 2);
        assert!(hex.chars().all(|c| c == '0'));
    }

    #[test]
    fn checksum_folds_even_and_odd_offsets() {
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        let addr = ToxAddress::new(PeerIdentity::from_bytes(key), 0x0102_0304);
        assert_eq!(addr.checksum(), [0x02, 0x06]);
        assert_eq!(
            addr.to_hex(),
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f010203040206"
        );
    }

    #[test]
    fn nospam_is_big_endian() {
        let addr = ToxAddress::new(PeerIdentity::from_bytes([0xab; 32]), 0xdead_beef);
        assert!(addr.to_hex().ends_with("deadbeef6042"));
    }

    #[test]
    fn address_parse_verifies_checksum() {
        let addr = ToxAddress::new(PeerIdentity::from_bytes([0xab; 32]), 0xdead_beef);
        let parsed: ToxAddress = addr.to_hex().to_uppercase().parse().unwrap();
        assert_eq!(parsed, addr);

        let mut tampered = addr.to_hex();
        tampered.replace_range(72.., "0000");
        assert!(matches!(
            tampered.parse::<ToxAddress>(),
            Err(IdentityError::BadChecksum)
        ));
    }

    #[test]
    fn identity_rejects_wrong_length() {
        let err = "abcd".parse::<PeerIdentity>().unwrap_err();
        assert!(matches!(
            err,
            IdentityError::InvalidLength {
                expected: 32,
                actual: 2
            }
        ));
        assert!("zz".repeat(32).parse::<PeerIdentity>().is_err());
    }

    #[test]
    fn identity_hex_is_lowercase() {
        let id: PeerIdentity = "AA".repeat(32).parse().unwrap();
        assert_eq!(id.to_string(), "aa".repeat(32));
    }
}
