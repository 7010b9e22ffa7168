//! Backing stores for the ownership table.

use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{CryptError, CryptResult};

/// Flat byte store addressed by offset.
pub trait TableStorage: Send + Sync {
    /// Read into `buf` starting at `offset`. Returns the number of bytes
    /// read, which is short only when the store ends before `buf` does.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CryptResult<usize>;
    fn write_at(&self, offset: u64, data: &[u8]) -> CryptResult<()>;
    fn flush(&self) -> CryptResult<()>;
}

/// In-memory table, grows on write.
pub struct RamTable {
    data: Mutex<Vec<u8>>,
}

impl RamTable {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl Default for RamTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStorage for RamTable {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> CryptResult<usize> {
        let data = self.data.lock();
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let end = core::cmp::min(offset as usize + buf.len(), data.len());
        let len = end - offset as usize;
        buf[..len].copy_from_slice(&data[offset as usize..end]);
        Ok(len)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> CryptResult<()> {
        let mut data = self.data.lock();
        let end = offset as usize + buf.len();
        if end > data.len() {
            let extra = end - data.len();
            data.try_reserve(extra)
                .map_err(|_| CryptError::AllocationFailure)?;
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> CryptResult<()> {
        Ok(())
    }
}

#[cfg(feature = "std")]
pub use self::file::FileTable;

#[cfg(feature = "std")]
mod file {
    use alloc::format;
    use std::fs::{File, OpenOptions};
    use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
    use std::path::{Path, PathBuf};

    use spin::Mutex;

    use super::TableStorage;
    use crate::error::{CryptError, CryptResult};

    /// Ownership table kept in a regular file.
    ///
    /// The file is opened (and created if missing) once and the handle is
    /// held until the table is dropped.
    pub struct FileTable {
        path: PathBuf,
        file: Mutex<File>,
    }

    impl FileTable {
        pub fn open<P: AsRef<Path>>(path: P) -> CryptResult<Self> {
            let path = path.as_ref().to_path_buf();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| io_error("open", &path, e))?;
            log::info!("ownership table opened at {}", path.display());
            Ok(Self {
                path,
                file: Mutex::new(file),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    fn io_error(what: &str, path: &Path, err: std::io::Error) -> CryptError {
        log::error!("{} {} failed: {}", what, path.display(), err);
        CryptError::Persistence(format!("{} {}: {}", what, path.display(), err))
    }

    impl TableStorage for FileTable {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> CryptResult<usize> {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| io_error("seek", &self.path, e))?;
            let mut filled = 0;
            while filled < buf.len() {
                match file.read(&mut buf[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(io_error("read", &self.path, e)),
                }
            }
            Ok(filled)
        }

        fn write_at(&self, offset: u64, data: &[u8]) -> CryptResult<()> {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| io_error("seek", &self.path, e))?;
            file.write_all(data)
                .map_err(|e| io_error("write", &self.path, e))
        }

        fn flush(&self) -> CryptResult<()> {
            let mut file = self.file.lock();
            file.flush().map_err(|e| io_error("flush", &self.path, e))?;
            file.sync_data()
                .map_err(|e| io_error("sync", &self.path, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_table_short_read() {
        let table = RamTable::new();
        table.write_at(4, b"abcd").unwrap();
        assert_eq!(table.len(), 8);

        let mut buf = [0xffu8; 6];
        let n = table.read_at(2, &mut buf).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf, b"\0\0abcd");

        let n = table.read_at(6, &mut buf).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"cd");
        assert_eq!(table.read_at(100, &mut buf).unwrap(), 0);
    }

    #[cfg(feature = "std")]
    #[test]
    fn file_table_reopens_with_same_bytes() {
        let path = std::env::temp_dir().join(format!("dedupcrypt-ft-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let table = FileTable::open(&path).unwrap();
            table.write_at(24, &[7u8; 24]).unwrap();
            table.flush().unwrap();
        }
        let table = FileTable::open(&path).unwrap();
        let mut buf = [0u8; 48];
        assert_eq!(table.read_at(0, &mut buf).unwrap(), 48);
        assert_eq!(&buf[..24], &[0u8; 24]);
        assert_eq!(&buf[24..], &[7u8; 24]);
        drop(table);
        std::fs::remove_file(&path).unwrap();
    }
}
