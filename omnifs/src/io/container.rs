use super::block::{BlockNumber, BlockStorage};
use std::fs::File;
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};

/// A container backed by a regular file. The metadata area occupies the first
/// `data_offset` bytes and is followed by `block_count` blocks.
pub struct ContainerFile {
    fd: File,
    data_offset: u64,
    block_size: usize,
    /// The total number of blocks available in the data region.
    block_count: usize,
}

impl ContainerFile {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn block_offset(&self, blocknr: BlockNumber) -> std::io::Result<u64> {
        if blocknr >= self.block_count {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "block out of range",
            ));
        }
        Ok(self.data_offset + (blocknr * self.block_size) as u64)
    }
}

impl BlockStorage for ContainerFile {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()> {
        let offset = self.block_offset(blocknr)?;
        let max = buf.len().min(self.block_size);
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.read_exact(&mut buf[..max])
    }

    /// This method truncates writes that exceed the total block size.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()> {
        let offset = self.block_offset(blocknr)?;
        let max = buf.len().min(self.block_size);
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.write_all(&buf[..max])
    }

    fn read_region(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        if offset + buf.len() as u64 > self.data_offset {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "read crosses into the data region",
            ));
        }
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.read_exact(buf)
    }

    fn write_region(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        if offset + buf.len() as u64 > self.data_offset {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "write crosses into the data region",
            ));
        }
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.write_all(buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct ContainerFileBuilder {
    fd: File,
    data_offset: u64,
    block_size: usize,
    block_count: usize,
    clear: bool,
}

impl From<File> for ContainerFileBuilder {
    fn from(fd: File) -> Self {
        ContainerFileBuilder {
            fd,
            data_offset: 0,
            block_size: 4096,
            block_count: 0,
            clear: true,
        }
    }
}

impl ContainerFileBuilder {
    /// Sets the number of bytes preceding the first data block.
    pub fn with_data_offset(mut self, offset: u64) -> Self {
        self.data_offset = offset;
        self
    }

    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    /// Sets the number of desired blocks in the data region.
    pub fn with_block_count(mut self, blocks: usize) -> Self {
        self.block_count = blocks;
        self
    }

    /// Whether `build` zeroes the whole medium. Defaults to true; disable it
    /// when reopening an initialized container.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and, unless
    /// told otherwise, does destructive things to prepare the file for use.
    pub fn build(mut self) -> std::io::Result<ContainerFile> {
        if self.block_size == 0 || self.block_count == 0 {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "container needs a positive block size and block count",
            ));
        }
        if self.clear {
            self.zero_medium()?;
        }
        Ok(ContainerFile {
            fd: self.fd,
            data_offset: self.data_offset,
            block_size: self.block_size,
            block_count: self.block_count,
        })
    }

    fn zero_medium(&mut self) -> std::io::Result<()> {
        self.fd.set_len(0)?;
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the metadata area, then every block, buffering each write.
        bfd.write_all(&vec![0x00; self.data_offset as usize])?;
        let zeroes = vec![0x00; self.block_size];
        for _ in 0..self.block_count {
            bfd.write_all(&zeroes)?;
        }
        bfd.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(blocks: usize) -> ContainerFile {
        let fs_block = tempfile::tempfile().unwrap();
        ContainerFileBuilder::from(fs_block)
            .with_data_offset(512)
            .with_block_size(4096)
            .with_block_count(blocks)
            .build()
            .expect("failed to allocate container")
    }

    #[test]
    fn container_allocates_correct_num_bytes() {
        let mut disk = device(4);
        disk.sync_disk().unwrap();
        assert_eq!(disk.into_file().metadata().unwrap().len(), 512 + 4 * 4096);
    }

    #[test]
    fn can_read_and_write_blocks() {
        let mut disk = device(4);

        disk.write_block(2, &vec![0x55; 4096]).unwrap();

        let mut read_block = vec![0x00; 4096];
        // Read a different block.
        disk.read_block(3, &mut read_block).unwrap();
        assert_eq!(read_block, vec![0x00; 4096]);

        // Read the block with data.
        let mut filled_block = vec![0x00; 4096];
        disk.read_block(2, &mut filled_block).unwrap();
        assert_eq!(filled_block, vec![0x55; 4096]);
    }

    #[test]
    fn block_writes_do_not_touch_the_metadata_area() {
        let mut disk = device(1);
        disk.write_region(0, b"header").unwrap();
        disk.write_block(0, &vec![0xAA; 4096]).unwrap();

        let mut hdr = [0u8; 6];
        disk.read_region(0, &mut hdr).unwrap();
        assert_eq!(&hdr, b"header");
        assert!(disk.write_region(510, b"spill").is_err());
    }

    #[test]
    fn access_beyond_range_fails() {
        let mut disk = device(1);

        assert!(disk.write_block(1, &vec![0x55; 4096]).is_err());
        assert!(disk.read_block(1, &mut vec![0; 4096]).is_err());
    }

    #[test]
    fn partial_block_writes_succeed() {
        let mut disk = device(1);

        // Fill half the block with meaningful data.
        disk.write_block(0, &vec![0x55; 2048])
            .expect("failed to write block");
        let mut buf = vec![0; 4096];
        disk.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..2048], &vec![0x55; 2048][..]);
        assert_eq!(&buf[2048..], &vec![0x00; 2048][..]);
    }

    #[test]
    fn reopening_without_clearing_keeps_contents() {
        let disk = tempfile::NamedTempFile::new().unwrap();
        let mut dev = ContainerFileBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            .build()
            .unwrap();
        dev.write_block(1, b"persisted").unwrap();
        dev.sync_disk().unwrap();

        let mut dev = ContainerFileBuilder::from(disk.reopen().unwrap())
            .with_block_count(2)
            // Don't reset initialized disk.
            .clear_medium(false)
            .build()
            .unwrap();
        let mut buf = vec![0; 9];
        dev.read_block(1, &mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
    }
}
