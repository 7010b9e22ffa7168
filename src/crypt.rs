//! Per-block encryption and decryption of file contents on a deduplicating
//! filesystem.
//!
//! Once identical ciphertext blocks are shared, the address a block is read
//! through no longer says which file wrote it or at which logical block.
//! Encryption records the writer in the [`OwnershipIndex`]; decryption asks
//! that index for the owner's key context and asks the
//! [`LogicalBlockIndex`] for the original block number before deriving the
//! IV.

use alloc::{sync::Arc, vec::Vec};
use core::{fmt, ops::Range};
use log::debug;

use crate::{
    crypt_err,
    error::{CryptError, CryptResult},
    fingerprint::Fingerprinter,
    ownership::OwnershipIndex,
    policy::{generate_iv, InodeCryptInfo},
    recovery::{InodeResolver, LogicalBlockIndex},
    CONTENTS_ALIGNMENT, PAGE_SHIFT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Encrypt => write!(f, "encryption"),
            Direction::Decrypt => write!(f, "decryption"),
        }
    }
}

pub struct DedupCrypt {
    index: Arc<OwnershipIndex>,
    blocks: Arc<dyn LogicalBlockIndex>,
    fingerprinter: Arc<dyn Fingerprinter>,
    inodes: Arc<dyn InodeResolver>,
}

/// Byte range of one contents unit inside a page.
fn block_range(page_len: usize, len: usize, offs: usize) -> CryptResult<Range<usize>> {
    if len == 0 || len % CONTENTS_ALIGNMENT != 0 {
        return Err(CryptError::InvalidInput);
    }
    match offs.checked_add(len) {
        Some(end) if end <= page_len => Ok(offs..end),
        _ => Err(CryptError::InvalidInput),
    }
}

/// First logical block covered by `offs` in page `page_index`, for
/// page-level calls where `len` and `offs` must be whole blocks. Every block
/// up to `offs + len` must have a number that fits in a u64.
fn first_lblk(ci: &InodeCryptInfo, page_len: usize, page_index: u64, len: usize, offs: usize) -> CryptResult<u64> {
    let block_bits = ci.block_bits;
    let shift = PAGE_SHIFT.checked_sub(block_bits).ok_or(CryptError::InvalidInput)?;
    let block_size = ci.block_size();
    if len == 0 || (len | offs) % block_size != 0 {
        return Err(CryptError::InvalidInput);
    }
    let range = block_range(page_len, len, offs)?;
    let base = (page_index as u128) << shift;
    let last = base + ((range.end >> block_bits) as u128 - 1);
    if last > u64::MAX as u128 {
        return Err(CryptError::InvalidInput);
    }
    Ok((base + (offs >> block_bits) as u128) as u64)
}

impl DedupCrypt {
    pub fn new(
        index: Arc<OwnershipIndex>,
        blocks: Arc<dyn LogicalBlockIndex>,
        fingerprinter: Arc<dyn Fingerprinter>,
        inodes: Arc<dyn InodeResolver>,
    ) -> Self {
        Self {
            index,
            blocks,
            fingerprinter,
            inodes,
        }
    }

    pub fn index(&self) -> &Arc<OwnershipIndex> {
        &self.index
    }

    /// Encrypt or decrypt `len` bytes at `offs` from `src_page` into the same
    /// place in `dest_page`.
    ///
    /// On decrypt, a block number recorded for the source page's fingerprint
    /// replaces `lblk_num`. On encrypt, the ciphertext page is recorded as
    /// owned by `ci.ino` unless another inode already owns it.
    pub fn crypt_block(
        &self,
        ci: &InodeCryptInfo,
        rw: Direction,
        lblk_num: u64,
        src_page: &[u8],
        dest_page: &mut [u8],
        len: usize,
        offs: usize,
    ) -> CryptResult<()> {
        let range = block_range(src_page.len(), len, offs)?;
        if range.end > dest_page.len() {
            return Err(CryptError::InvalidInput);
        }
        let lblk_num = match rw {
            Direction::Decrypt => self.recover_lblk(ci, src_page, lblk_num),
            Direction::Encrypt => lblk_num,
        };
        dest_page[range.clone()].copy_from_slice(&src_page[range.clone()]);
        self.crypt_range(ci, rw, lblk_num, dest_page, range)
    }

    /// [`DedupCrypt::crypt_block`] with the source and destination the same page.
    pub fn crypt_block_inplace(
        &self,
        ci: &InodeCryptInfo,
        rw: Direction,
        lblk_num: u64,
        page: &mut [u8],
        len: usize,
        offs: usize,
    ) -> CryptResult<()> {
        let range = block_range(page.len(), len, offs)?;
        let lblk_num = match rw {
            Direction::Decrypt => self.recover_lblk(ci, page, lblk_num),
            Direction::Encrypt => lblk_num,
        };
        self.crypt_range(ci, rw, lblk_num, page, range)
    }

    pub fn encrypt_block_inplace(
        &self,
        ci: &InodeCryptInfo,
        page: &mut [u8],
        len: usize,
        offs: usize,
        lblk_num: u64,
    ) -> CryptResult<()> {
        self.crypt_block_inplace(ci, Direction::Encrypt, lblk_num, page, len, offs)
    }

    pub fn decrypt_block_inplace(
        &self,
        ci: &InodeCryptInfo,
        page: &mut [u8],
        len: usize,
        offs: usize,
        lblk_num: u64,
    ) -> CryptResult<()> {
        self.crypt_block_inplace(ci, Direction::Decrypt, lblk_num, page, len, offs)
    }

    /// Encrypt the blocks of a pagecache page into a newly allocated bounce
    /// page. Ciphertext lands at the same offsets as the plaintext; the rest
    /// of the bounce page is zero.
    pub fn encrypt_pagecache_blocks(
        &self,
        ci: &InodeCryptInfo,
        page: &[u8],
        page_index: u64,
        len: usize,
        offs: usize,
    ) -> CryptResult<Vec<u8>> {
        let first = first_lblk(ci, page.len(), page_index, len, offs)?;
        let block_size = ci.block_size();

        let mut bounce = Vec::new();
        bounce
            .try_reserve_exact(page.len())
            .map_err(|_| CryptError::AllocationFailure)?;
        bounce.resize(page.len(), 0);

        for (n, i) in (offs..offs + len).step_by(block_size).enumerate() {
            let lblk_num = first + n as u64;
            self.crypt_block(ci, Direction::Encrypt, lblk_num, page, &mut bounce, block_size, i)?;
        }
        Ok(bounce)
    }

    /// Decrypt the blocks of a pagecache page in place.
    ///
    /// The page is decrypted with the key context of whichever inode wrote
    /// its ciphertext, falling back to `ci` when no owner is recorded.
    pub fn decrypt_pagecache_blocks(
        &self,
        ci: &Arc<InodeCryptInfo>,
        page: &mut [u8],
        page_index: u64,
        len: usize,
        offs: usize,
    ) -> CryptResult<()> {
        let first = first_lblk(ci, page.len(), page_index, len, offs)?;
        let block_size = ci.block_size();

        let owner = self.resolve_owner(ci, page)?;
        for (n, i) in (offs..offs + len).step_by(block_size).enumerate() {
            let lblk_num = first + n as u64;
            self.crypt_block_inplace(&owner, Direction::Decrypt, lblk_num, page, block_size, i)?;
        }
        Ok(())
    }

    /// Key context that should decrypt `page`: its recorded owner, or `ci`.
    pub fn resolve_owner(&self, ci: &Arc<InodeCryptInfo>, page: &[u8]) -> CryptResult<Arc<InodeCryptInfo>> {
        let fingerprint = self.fingerprinter.digest(page);
        match self.index.lookup_owner(&fingerprint)? {
            Some(owner) if owner != ci.ino => {
                debug!("inode {}: page owned by inode {}", ci.ino, owner);
                self.inodes.resolve(owner)
            }
            _ => Ok(ci.clone()),
        }
    }

    fn recover_lblk(&self, ci: &InodeCryptInfo, src_page: &[u8], lblk_num: u64) -> u64 {
        let fingerprint = self.fingerprinter.digest(src_page);
        match self.blocks.lookup(&fingerprint) {
            Some(recovered) => {
                if recovered != lblk_num {
                    debug!(
                        "inode {}: block {} was written as block {}",
                        ci.ino, lblk_num, recovered
                    );
                }
                recovered
            }
            None => lblk_num,
        }
    }

    fn crypt_range(
        &self,
        ci: &InodeCryptInfo,
        rw: Direction,
        lblk_num: u64,
        page: &mut [u8],
        range: Range<usize>,
    ) -> CryptResult<()> {
        let iv = generate_iv(lblk_num, ci);
        let data = &mut page[range];
        let res = match rw {
            Direction::Encrypt => ci.cipher.encrypt(&iv, data),
            Direction::Decrypt => ci.cipher.decrypt(&iv, data),
        };
        if let Err(err) = res {
            crypt_err!(ci.ino, "{} failed for block {}: {}", rw, lblk_num, err);
            return Err(CryptError::Cipher {
                direction: rw,
                lblk_num,
            });
        }

        if rw == Direction::Encrypt {
            let fingerprint = self.fingerprinter.digest(page);
            if let Err(err) = self.index.record_owner(fingerprint, ci.ino) {
                crypt_err!(ci.ino, "cannot record owner of block {}: {}", lblk_num, err);
                return Err(err);
            }
        }
        Ok(())
    }
}
