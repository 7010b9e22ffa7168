// Encrypt the blocks of a file and record their owner in an ownership
// table on disk, then report who owns each ciphertext block.
//
//   cargo run --example citable -- --table /tmp/citable encrypt --ino 7 some.bin
//   cargo run --example citable -- --table /tmp/citable owners some.bin.enc

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dedupcrypt::{
    Aes256Xts, CryptError, CryptResult, DedupConfig, DedupCrypt, FileTable, Fingerprinter,
    InodeCryptInfo, InodeResolver, MemoryBlockIndex, OwnershipIndex, SyncPolicy,
    Xxh3Fingerprinter, PAGE_SIZE,
};

#[derive(Parser)]
#[command(name = "citable", about = "Ownership table demo")]
struct Args {
    /// Ownership table file
    #[arg(long, default_value = "/tmp/citable")]
    table: PathBuf,

    /// Slots in the table
    #[arg(long, default_value_t = 65536)]
    capacity: usize,

    /// Write only changed records instead of the whole table
    #[arg(long)]
    write_through: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Encrypt FILE into FILE.enc as inode INO
    Encrypt {
        #[arg(long)]
        ino: u64,
        file: PathBuf,
    },
    /// Print the recorded owner of every block of FILE
    Owners { file: PathBuf },
}

/// Every inode shares one demo key.
struct DemoInodes {
    cipher: Arc<Aes256Xts>,
}

impl InodeResolver for DemoInodes {
    fn resolve(&self, ino: u64) -> CryptResult<Arc<InodeCryptInfo>> {
        Ok(Arc::new(InodeCryptInfo::new(ino, self.cipher.clone())))
    }
}

fn pages(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(PAGE_SIZE)
        .map(|chunk| {
            let mut page = chunk.to_vec();
            page.resize(PAGE_SIZE, 0);
            page
        })
        .collect()
}

fn run(args: Args) -> CryptResult<()> {
    let config = DedupConfig {
        capacity: args.capacity,
        table_path: args.table.display().to_string(),
        sync: if args.write_through {
            SyncPolicy::WriteThrough
        } else {
            SyncPolicy::FullTable
        },
        ..DedupConfig::default()
    };
    let table = Arc::new(FileTable::open(&config.table_path)?);
    let index = Arc::new(OwnershipIndex::from_config(&config, table)?);
    let inodes = Arc::new(DemoInodes {
        cipher: Arc::new(Aes256Xts::new(&[0x24; 64])),
    });
    let crypt = DedupCrypt::new(
        index.clone(),
        Arc::new(MemoryBlockIndex::new()),
        Arc::new(Xxh3Fingerprinter),
        inodes.clone(),
    );

    match args.command {
        Command::Encrypt { ino, file } => {
            let data = fs::read(&file).map_err(|e| CryptError::Persistence(e.to_string()))?;
            let ci = inodes.resolve(ino)?;
            let mut out = Vec::with_capacity(data.len() + PAGE_SIZE);
            for (n, page) in pages(&data).iter().enumerate() {
                out.extend(crypt.encrypt_pagecache_blocks(&ci, page, n as u64, PAGE_SIZE, 0)?);
            }
            let target = file.with_extension("enc");
            fs::write(&target, &out).map_err(|e| CryptError::Persistence(e.to_string()))?;
            println!("{} pages -> {}, {} owned blocks", out.len() / PAGE_SIZE, target.display(), index.len());
        }
        Command::Owners { file } => {
            let data = fs::read(&file).map_err(|e| CryptError::Persistence(e.to_string()))?;
            for (n, page) in data.chunks(PAGE_SIZE).enumerate() {
                let fingerprint = Xxh3Fingerprinter.digest(page);
                match index.lookup_owner(&fingerprint)? {
                    Some(ino) => println!("block {:>6}  {:?}  inode {}", n, fingerprint, ino),
                    None => println!("block {:>6}  {:?}  -", n, fingerprint),
                }
            }
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run(Args::parse()) {
        eprintln!("citable: {}", e);
        std::process::exit(1);
    }
}
