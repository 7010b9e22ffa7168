//! Content fingerprints used as ownership table keys.

use core::fmt;

use xxhash_rust::xxh3::xxh3_128;

pub const FINGERPRINT_SIZE: usize = 16;

/// A 16 byte digest of a block.
///
/// Two blocks with the same content are assumed to produce the same
/// fingerprint, and two blocks with different content are assumed not to.
/// Nothing re-reads the blocks to confirm a match: a digest collision makes
/// the table hand out the wrong owner.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub const ZERO: Fingerprint = Fingerprint([0; FINGERPRINT_SIZE]);

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl From<[u8; FINGERPRINT_SIZE]> for Fingerprint {
    fn from(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint(")?;
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Strategy that turns a block (or page) of bytes into a fingerprint.
///
/// Implementations must be deterministic and must accept any input,
/// including an empty slice.
pub trait Fingerprinter: Send + Sync {
    fn digest(&self, bytes: &[u8]) -> Fingerprint;
}

/// xxh3-128 over the whole buffer, stored little endian.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh3Fingerprinter;

impl Fingerprinter for Xxh3Fingerprinter {
    fn digest(&self, bytes: &[u8]) -> Fingerprint {
        Fingerprint(xxh3_128(bytes).to_le_bytes())
    }
}
