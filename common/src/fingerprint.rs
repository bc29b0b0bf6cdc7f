//! SHA-512 certificate fingerprints, as accepted on the `-H` command line option.

use std::fmt;
use thiserror::Error;

pub const FINGERPRINT_LEN: usize = 64;

/// A single SHA-512 fingerprint, stored as raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("fingerprint must be exactly {FINGERPRINT_LEN} bytes (128 hex digits), got {0}")]
    WrongLength(usize),
    #[error("fingerprint is not valid hex: {0}")]
    InvalidHex(#[from] std::num::ParseIntError),
}

impl Fingerprint {
    pub fn from_hex(s: &str) -> Result<Self, FingerprintError> {
        if s.len() != FINGERPRINT_LEN * 2 {
            return Err(FingerprintError::WrongLength(s.len()));
        }
        let mut bytes = [0u8; FINGERPRINT_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Parse the colon-separated fingerprint list accepted by `-H`.
pub fn parse_fingerprint_set(arg: &str) -> Result<Vec<Fingerprint>, FingerprintError> {
    arg.split(':').map(Fingerprint::from_hex).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            Fingerprint::from_hex("abcd"),
            Err(FingerprintError::WrongLength(4))
        ));
    }

    #[test]
    fn round_trips_valid_hex() {
        let hex = "ab".repeat(FINGERPRINT_LEN);
        let fp = Fingerprint::from_hex(&hex).unwrap();
        assert_eq!(fp.as_bytes(), &[0xab; FINGERPRINT_LEN]);
    }

    #[test]
    fn parses_colon_separated_set() {
        let hex = "cd".repeat(FINGERPRINT_LEN);
        let arg = format!("{hex}:{hex}");
        let set = parse_fingerprint_set(&arg).unwrap();
        assert_eq!(set.len(), 2);
    }
}
