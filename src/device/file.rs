//! File-Backed Storage Device
//!
//! Treats a regular file (or disk image) as an array of [`BLOCK_SIZE`]
//! blocks using positioned I/O, so no seek position is shared.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::debug;

use super::{block_offset, check_range, StorageDevice};
use crate::error::{DeviceOp, Error, Result};
use crate::BLOCK_SIZE;

/// Block device over an image file
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    block_count: u64,
}

impl FileDevice {
    /// Open an existing image. Its length must be a whole number of blocks.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        let block_size = BLOCK_SIZE as u64;
        if len % block_size != 0 {
            return Err(Error::Config(format!(
                "image {} is not block-aligned: len={} block_size={}",
                path.as_ref().display(),
                len,
                block_size
            )));
        }

        debug!(path = %path.as_ref().display(), blocks = len / block_size, "opened image");
        Ok(Self {
            file,
            block_count: len / block_size,
        })
    }

    /// Create (or truncate) an image of `block_count` zeroed blocks
    pub fn create(path: impl AsRef<Path>, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(block_offset(block_count)?)?;

        debug!(path = %path.as_ref().display(), blocks = block_count, "created image");
        Ok(Self { file, block_count })
    }

    /// Flush the image to stable storage
    pub fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl StorageDevice for FileDevice {
    fn read_block(&mut self, block: u64, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        check_range(block, self.block_count)?;
        self.file
            .read_exact_at(buf, block_offset(block)?)
            .map_err(|e| Error::device(block, DeviceOp::Read, e.to_string()))
    }

    fn write_block(&mut self, block: u64, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        check_range(block, self.block_count)?;
        self.file
            .write_all_at(buf, block_offset(block)?)
            .map_err(|e| Error::device(block, DeviceOp::Write, e.to_string()))
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("bcache-{}-{}.img", name, std::process::id()))
    }

    #[test]
    fn test_create_write_reopen() {
        let path = scratch_path("reopen");
        {
            let mut dev = FileDevice::create(&path, 4).unwrap();
            assert_eq!(dev.block_count(), 4);
            dev.write_block(2, &[0xABu8; BLOCK_SIZE]).unwrap();
            dev.sync_all().unwrap();
        }

        let mut dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.block_count(), 4);
        let mut buf = [0u8; BLOCK_SIZE];
        dev.read_block(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
        dev.read_block(1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_open_rejects_unaligned_image() {
        let path = scratch_path("unaligned");
        std::fs::write(&path, vec![0u8; BLOCK_SIZE + 1]).unwrap();

        let result = FileDevice::open(&path);
        assert!(matches!(result, Err(Error::Config(_))));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_out_of_range_block() {
        let path = scratch_path("range");
        let mut dev = FileDevice::create(&path, 1).unwrap();
        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            dev.read_block(1, &mut buf),
            Err(Error::BlockOutOfRange { .. })
        ));
        std::fs::remove_file(&path).unwrap();
    }
}
