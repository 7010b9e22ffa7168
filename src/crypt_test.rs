#[cfg(test)]
mod tests {
    use crate::cipher::{Aes256Xts, ContentsCipher, AES_256_XTS_KEY_SIZE};
    use crate::config::SyncPolicy;
    use crate::crypt::{DedupCrypt, Direction};
    use crate::error::{CryptError, CryptResult};
    use crate::fingerprint::{Fingerprinter, Xxh3Fingerprinter};
    use crate::ownership::OwnershipIndex;
    use crate::policy::{InodeCryptInfo, Iv, PolicyFlags};
    use crate::recovery::{InodeResolver, MemoryBlockIndex};
    use crate::storage::RamTable;
    use crate::PAGE_SIZE;
    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;
    use alloc::vec;
    use spin::RwLock;

    const KEY_A: [u8; AES_256_XTS_KEY_SIZE] = [0x41; AES_256_XTS_KEY_SIZE];
    const KEY_B: [u8; AES_256_XTS_KEY_SIZE] = [0x42; AES_256_XTS_KEY_SIZE];

    #[derive(Default)]
    struct Inodes {
        map: RwLock<BTreeMap<u64, Arc<InodeCryptInfo>>>,
    }

    impl Inodes {
        fn add(&self, ci: InodeCryptInfo) -> Arc<InodeCryptInfo> {
            let ci = Arc::new(ci);
            self.map.write().insert(ci.ino, ci.clone());
            ci
        }
    }

    impl InodeResolver for Inodes {
        fn resolve(&self, ino: u64) -> CryptResult<Arc<InodeCryptInfo>> {
            self.map.read().get(&ino).cloned().ok_or(CryptError::NoKey(ino))
        }
    }

    /// Rejects everything.
    struct BrokenCipher;

    impl ContentsCipher for BrokenCipher {
        fn iv_size(&self) -> usize {
            16
        }
        fn encrypt(&self, _iv: &Iv, _data: &mut [u8]) -> CryptResult<()> {
            Err(CryptError::InvalidInput)
        }
        fn decrypt(&self, _iv: &Iv, _data: &mut [u8]) -> CryptResult<()> {
            Err(CryptError::InvalidInput)
        }
    }

    struct Harness {
        table: Arc<RamTable>,
        blocks: Arc<MemoryBlockIndex>,
        inodes: Arc<Inodes>,
        crypt: DedupCrypt,
    }

    fn harness_with(index: OwnershipIndex, table: Arc<RamTable>) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let blocks = Arc::new(MemoryBlockIndex::new());
        let inodes = Arc::new(Inodes::default());
        let crypt = DedupCrypt::new(
            Arc::new(index),
            blocks.clone(),
            Arc::new(Xxh3Fingerprinter),
            inodes.clone(),
        );
        Harness {
            table,
            blocks,
            inodes,
            crypt,
        }
    }

    fn harness(capacity: usize) -> Harness {
        let table = Arc::new(RamTable::new());
        let index = OwnershipIndex::with_capacity(table.clone(), capacity, SyncPolicy::FullTable).unwrap();
        harness_with(index, table)
    }

    fn xts(key: &[u8; AES_256_XTS_KEY_SIZE]) -> Arc<Aes256Xts> {
        Arc::new(Aes256Xts::new(key))
    }

    fn pattern_page(seed: u8) -> vec::Vec<u8> {
        (0..PAGE_SIZE).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn zero_block_end_to_end() {
        let table = Arc::new(RamTable::new());
        let index = OwnershipIndex::new(table.clone());
        let h = harness_with(index, table);
        let ci = h.inodes.add(InodeCryptInfo::new(7, xts(&KEY_A)));

        let zero = vec![0u8; PAGE_SIZE];
        let mut ciphertext = vec![0u8; PAGE_SIZE];
        h.crypt
            .crypt_block(&ci, Direction::Encrypt, 0, &zero, &mut ciphertext, PAGE_SIZE, 0)
            .unwrap();
        assert_ne!(ciphertext, zero);

        let fingerprint = Xxh3Fingerprinter.digest(&ciphertext);
        let entry = h.crypt.index().search(&fingerprint).unwrap();
        assert_eq!(entry.owner_inode, 7);
        assert_eq!(h.table.len(), crate::DEDUP_TABLE_SIZE * crate::ownership::RECORD_SIZE);

        let mut plain = vec![0u8; PAGE_SIZE];
        h.crypt
            .crypt_block(&ci, Direction::Decrypt, 0, &ciphertext, &mut plain, PAGE_SIZE, 0)
            .unwrap();
        assert_eq!(plain, zero);
    }

    #[test]
    fn decrypt_uses_recovered_block_number() {
        let h = harness(1024);
        let ci = h.inodes.add(InodeCryptInfo::new(7, xts(&KEY_A)));
        let plain = pattern_page(1);

        let mut ciphertext = plain.clone();
        h.crypt.encrypt_block_inplace(&ci, &mut ciphertext, PAGE_SIZE, 0, 5).unwrap();

        // without a recorded block number the wrong IV is used
        let mut wrong = ciphertext.clone();
        h.crypt.decrypt_block_inplace(&ci, &mut wrong, PAGE_SIZE, 0, 9).unwrap();
        assert_ne!(wrong, plain);

        h.blocks.record(Xxh3Fingerprinter.digest(&ciphertext), 5);
        let mut page = ciphertext.clone();
        h.crypt.decrypt_block_inplace(&ci, &mut page, PAGE_SIZE, 0, 9).unwrap();
        assert_eq!(page, plain);
    }

    #[test]
    fn decrypt_never_records_ownership() {
        let h = harness(64);
        let ci = h.inodes.add(InodeCryptInfo::new(3, xts(&KEY_A)));
        let mut page = pattern_page(9);
        h.crypt.decrypt_block_inplace(&ci, &mut page, PAGE_SIZE, 0, 0).unwrap();
        assert!(h.table.is_empty());
        assert!(h.crypt.index().is_empty());
    }

    #[test]
    fn shared_page_decrypts_with_owner_key() {
        let h = harness(1024);
        let writer = h.inodes.add(InodeCryptInfo::new(7, xts(&KEY_A)));
        let reader = h.inodes.add(InodeCryptInfo::new(8, xts(&KEY_B)));
        let plain = pattern_page(2);

        let ciphertext = h.crypt.encrypt_pagecache_blocks(&writer, &plain, 0, PAGE_SIZE, 0).unwrap();

        let owner = h.crypt.resolve_owner(&reader, &ciphertext).unwrap();
        assert_eq!(owner.ino, 7);

        let mut page = ciphertext.clone();
        h.crypt.decrypt_pagecache_blocks(&reader, &mut page, 0, PAGE_SIZE, 0).unwrap();
        assert_eq!(page, plain);
    }

    #[test]
    fn relocated_block_recovers_owner_and_block_number() {
        let h = harness(1024);
        let writer = h.inodes.add(InodeCryptInfo::new(7, xts(&KEY_A)));
        let reader = h.inodes.add(InodeCryptInfo::new(8, xts(&KEY_B)));
        let plain = pattern_page(3);

        // written as block 3 of inode 7, later shared as block 10 of inode 8
        let ciphertext = h.crypt.encrypt_pagecache_blocks(&writer, &plain, 3, PAGE_SIZE, 0).unwrap();
        h.blocks.record(Xxh3Fingerprinter.digest(&ciphertext), 3);

        let mut page = ciphertext.clone();
        h.crypt.decrypt_pagecache_blocks(&reader, &mut page, 10, PAGE_SIZE, 0).unwrap();
        assert_eq!(page, plain);
    }

    #[test]
    fn unrecorded_page_keeps_addressed_inode() {
        let h = harness(1024);
        let reader = h.inodes.add(InodeCryptInfo::new(8, xts(&KEY_B)));
        let plain = pattern_page(4);

        // encrypted outside the index, e.g. before dedup was enabled
        let mut ciphertext = plain.clone();
        let iv = crate::policy::generate_iv(0, &reader);
        reader.cipher.encrypt(&iv, &mut ciphertext).unwrap();

        let owner = h.crypt.resolve_owner(&reader, &ciphertext).unwrap();
        assert!(Arc::ptr_eq(&owner, &reader));

        let mut page = ciphertext;
        h.crypt.decrypt_pagecache_blocks(&reader, &mut page, 0, PAGE_SIZE, 0).unwrap();
        assert_eq!(page, plain);
    }

    #[test]
    fn unknown_owner_is_no_key() {
        let h = harness(1024);
        let writer = InodeCryptInfo::new(7, xts(&KEY_A));
        let reader = h.inodes.add(InodeCryptInfo::new(8, xts(&KEY_B)));

        let mut page = pattern_page(5);
        h.crypt.encrypt_block_inplace(&writer, &mut page, PAGE_SIZE, 0, 0).unwrap();
        assert!(matches!(
            h.crypt.decrypt_pagecache_blocks(&reader, &mut page, 0, PAGE_SIZE, 0),
            Err(CryptError::NoKey(7))
        ));
    }

    #[test]
    fn identical_ciphertext_keeps_first_owner() {
        let h = harness(1024);
        let cipher = xts(&KEY_A);
        let first = h.inodes.add(InodeCryptInfo::new(7, cipher.clone()));
        let second = h.inodes.add(InodeCryptInfo::new(8, cipher));
        let plain = pattern_page(6);

        let a = h.crypt.encrypt_pagecache_blocks(&first, &plain, 0, PAGE_SIZE, 0).unwrap();
        let b = h.crypt.encrypt_pagecache_blocks(&second, &plain, 0, PAGE_SIZE, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(h.crypt.index().len(), 1);
        assert_eq!(
            h.crypt.index().lookup_owner(&Xxh3Fingerprinter.digest(&a)).unwrap(),
            Some(7)
        );
    }

    #[test]
    fn bad_lengths_fail_before_index_work() {
        let h = harness(64);
        let ci = h.inodes.add(InodeCryptInfo::new(1, xts(&KEY_A)));
        let src = pattern_page(7);
        let mut dest = vec![0u8; PAGE_SIZE];

        for (len, offs) in [(0, 0), (17, 0), (PAGE_SIZE, 16), (32, PAGE_SIZE - 16)] {
            assert!(matches!(
                h.crypt.crypt_block(&ci, Direction::Encrypt, 0, &src, &mut dest, len, offs),
                Err(CryptError::InvalidInput)
            ));
        }
        let mut short = vec![0u8; 64];
        assert!(matches!(
            h.crypt.crypt_block(&ci, Direction::Encrypt, 0, &src, &mut short, 128, 0),
            Err(CryptError::InvalidInput)
        ));
        assert!(matches!(
            h.crypt.encrypt_pagecache_blocks(&ci, &src, 0, 512, 0),
            Err(CryptError::InvalidInput)
        ));
        assert!(h.table.is_empty());
    }

    #[test]
    fn cipher_failure_names_block_and_direction() {
        let h = harness(64);
        let ci = h.inodes.add(InodeCryptInfo::new(1, Arc::new(BrokenCipher)));
        let mut page = pattern_page(8);

        let err = h.crypt.encrypt_block_inplace(&ci, &mut page, PAGE_SIZE, 0, 4).unwrap_err();
        assert!(matches!(
            err,
            CryptError::Cipher {
                direction: Direction::Encrypt,
                lblk_num: 4
            }
        ));
        assert_eq!(format!("{}", err), "encryption failed for block 4");

        let err = h.crypt.decrypt_block_inplace(&ci, &mut page, PAGE_SIZE, 0, 2).unwrap_err();
        assert!(matches!(
            err,
            CryptError::Cipher {
                direction: Direction::Decrypt,
                lblk_num: 2
            }
        ));
        assert!(h.table.is_empty());
    }

    #[test]
    fn full_index_fails_the_encrypt() {
        let h = harness(1);
        let ci = h.inodes.add(InodeCryptInfo::new(1, xts(&KEY_A)));

        let mut page = pattern_page(10);
        h.crypt.encrypt_block_inplace(&ci, &mut page, PAGE_SIZE, 0, 0).unwrap();
        let mut page = pattern_page(11);
        assert!(matches!(
            h.crypt.encrypt_block_inplace(&ci, &mut page, PAGE_SIZE, 0, 1),
            Err(CryptError::IndexFull)
        ));
    }

    #[test]
    fn sub_page_blocks_use_consecutive_block_numbers() {
        let h = harness(1024);
        let ci = h.inodes.add(InodeCryptInfo::new(5, xts(&KEY_A)).with_block_bits(11).unwrap());
        let plain = pattern_page(12);

        // second half of page 1: block (1 << 1) + 1
        let bounce = h.crypt.encrypt_pagecache_blocks(&ci, &plain, 1, 2048, 2048).unwrap();
        assert!(bounce[..2048].iter().all(|&b| b == 0));

        let mut expected = plain.clone();
        let iv = crate::policy::generate_iv(3, &ci);
        ci.cipher.encrypt(&iv, &mut expected[2048..]).unwrap();
        assert_eq!(&bounce[2048..], &expected[2048..]);
    }

    #[test]
    fn last_addressable_block_round_trips() {
        let h = harness(1024);
        let ci = h.inodes.add(InodeCryptInfo::new(6, xts(&KEY_A)));
        let plain = pattern_page(15);

        let bounce = h.crypt.encrypt_pagecache_blocks(&ci, &plain, u64::MAX, PAGE_SIZE, 0).unwrap();
        let mut expected = plain.clone();
        let iv = crate::policy::generate_iv(u64::MAX, &ci);
        ci.cipher.encrypt(&iv, &mut expected).unwrap();
        assert_eq!(bounce, expected);

        let mut page = bounce;
        h.crypt.decrypt_pagecache_blocks(&ci, &mut page, u64::MAX, PAGE_SIZE, 0).unwrap();
        assert_eq!(page, plain);
    }

    #[test]
    fn block_numbers_past_u64_are_rejected() {
        let h = harness(1024);
        let ci = h.inodes.add(InodeCryptInfo::new(6, xts(&KEY_A)).with_block_bits(11).unwrap());
        let plain = pattern_page(16);
        assert!(matches!(
            h.crypt.encrypt_pagecache_blocks(&ci, &plain, u64::MAX, PAGE_SIZE, 0),
            Err(CryptError::InvalidInput)
        ));
        // the largest page index whose blocks still have numbers
        let last_page = u64::MAX >> 1;
        h.crypt.encrypt_pagecache_blocks(&ci, &plain, last_page, PAGE_SIZE, 0).unwrap();
        assert!(!h.crypt.index().is_empty());
    }

    #[test]
    fn ino_lblk_64_policy_round_trips() {
        let h = harness(1024);
        let ci = h.inodes.add(
            InodeCryptInfo::new(12, xts(&KEY_A)).with_flags(PolicyFlags::IV_INO_LBLK_64),
        );
        let plain = pattern_page(13);

        let ciphertext = h.crypt.encrypt_pagecache_blocks(&ci, &plain, 6, PAGE_SIZE, 0).unwrap();
        let mut page = ciphertext;
        h.crypt.decrypt_pagecache_blocks(&ci, &mut page, 6, PAGE_SIZE, 0).unwrap();
        assert_eq!(page, plain);
    }

    #[cfg(feature = "std")]
    #[test]
    fn ownership_survives_restart_on_disk() {
        use crate::storage::FileTable;

        let path = std::env::temp_dir().join(format!("dedupcrypt-citable-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let plain = pattern_page(14);
        let writer = InodeCryptInfo::new(7, xts(&KEY_A));

        let ciphertext = {
            let table = Arc::new(FileTable::open(&path).unwrap());
            let index = Arc::new(OwnershipIndex::with_capacity(table, 256, SyncPolicy::FullTable).unwrap());
            let crypt = DedupCrypt::new(
                index,
                Arc::new(MemoryBlockIndex::new()),
                Arc::new(Xxh3Fingerprinter),
                Arc::new(Inodes::default()),
            );
            crypt.encrypt_pagecache_blocks(&writer, &plain, 0, PAGE_SIZE, 0).unwrap()
        };

        let table = Arc::new(FileTable::open(&path).unwrap());
        let index = OwnershipIndex::with_capacity(table, 256, SyncPolicy::FullTable).unwrap();
        assert_eq!(
            index.lookup_owner(&Xxh3Fingerprinter.digest(&ciphertext)).unwrap(),
            Some(7)
        );
        drop(index);
        std::fs::remove_file(&path).unwrap();
    }
}
