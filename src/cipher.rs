//! Contents cipher interface and the AES-256-XTS implementation.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::KeyInit;
use aes::Aes256;
use core::fmt;
use xts_mode::Xts128;

use crate::{
    error::{CryptError, CryptResult},
    policy::Iv,
};

/// Keyed transform applied to one block of file contents in place.
pub trait ContentsCipher: Send + Sync {
    /// Number of leading IV bytes the transform consumes.
    fn iv_size(&self) -> usize;
    fn encrypt(&self, iv: &Iv, data: &mut [u8]) -> CryptResult<()>;
    fn decrypt(&self, iv: &Iv, data: &mut [u8]) -> CryptResult<()>;
}

/// Two AES-256 keys (64 bytes in total).
pub const AES_256_XTS_KEY_SIZE: usize = 64;

const XTS_IV_SIZE: usize = 16;

/// AES-256 in XTS mode, tweaked by the first 16 IV bytes.
pub struct Aes256Xts {
    cipher: Xts128<Aes256>,
}

impl Aes256Xts {
    pub fn new(key: &[u8; AES_256_XTS_KEY_SIZE]) -> Self {
        let cipher = Xts128::<Aes256>::new(
            Aes256::new(GenericArray::from_slice(&key[..32])),
            Aes256::new(GenericArray::from_slice(&key[32..])),
        );
        Self { cipher }
    }

    fn tweak(iv: &Iv) -> [u8; XTS_IV_SIZE] {
        let mut tweak = [0u8; XTS_IV_SIZE];
        tweak.copy_from_slice(&iv.as_bytes()[..XTS_IV_SIZE]);
        tweak
    }

    fn check_len(data: &[u8]) -> CryptResult<()> {
        // XTS cannot handle less than one AES block.
        if data.len() < XTS_IV_SIZE {
            return Err(CryptError::InvalidInput);
        }
        Ok(())
    }
}

impl fmt::Debug for Aes256Xts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aes256Xts").finish_non_exhaustive()
    }
}

impl ContentsCipher for Aes256Xts {
    fn iv_size(&self) -> usize {
        XTS_IV_SIZE
    }

    fn encrypt(&self, iv: &Iv, data: &mut [u8]) -> CryptResult<()> {
        Self::check_len(data)?;
        self.cipher.encrypt_sector(data, Self::tweak(iv));
        Ok(())
    }

    fn decrypt(&self, iv: &Iv, data: &mut [u8]) -> CryptResult<()> {
        Self::check_len(data)?;
        self.cipher.decrypt_sector(data, Self::tweak(iv));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{generate_iv, InodeCryptInfo};
    use alloc::sync::Arc;

    #[test]
    fn xts_round_trip_depends_on_iv() {
        let cipher = Arc::new(Aes256Xts::new(&[3u8; AES_256_XTS_KEY_SIZE]));
        let ci = InodeCryptInfo::new(1, cipher.clone());
        let plain = [0x11u8; 512];

        let mut block = plain;
        cipher.encrypt(&generate_iv(5, &ci), &mut block).unwrap();
        assert_ne!(block, plain);

        let mut wrong = block;
        cipher.decrypt(&generate_iv(6, &ci), &mut wrong).unwrap();
        assert_ne!(wrong, plain);

        cipher.decrypt(&generate_iv(5, &ci), &mut block).unwrap();
        assert_eq!(block, plain);
    }

    #[test]
    fn short_data_is_rejected() {
        let cipher = Aes256Xts::new(&[3u8; AES_256_XTS_KEY_SIZE]);
        let ci = InodeCryptInfo::new(1, Arc::new(Aes256Xts::new(&[3u8; AES_256_XTS_KEY_SIZE])));
        let mut data = [0u8; 8];
        assert!(matches!(
            cipher.encrypt(&generate_iv(0, &ci), &mut data),
            Err(CryptError::InvalidInput)
        ));
    }
}
