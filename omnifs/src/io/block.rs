/// The block number to access ranging from 0 (the first data block) to n - 1
/// (the last block) where n is number of blocks available.
pub type BlockNumber = usize;

/// Storage backing a container: a byte-addressed metadata area (header and
/// user table) followed by a region of fixed-size data blocks.
pub trait BlockStorage {
    /// Size in bytes of every data block.
    fn block_size(&self) -> usize;

    /// Number of data blocks available.
    fn block_count(&self) -> usize;

    /// Reads the start of a data block into `buf`. At most one block is read.
    ///
    /// # Errors
    ///
    /// Attempting to read a block out of range will return an error.
    fn read_block(&mut self, blocknr: BlockNumber, buf: &mut [u8]) -> std::io::Result<()>;

    /// Writes `buf` at the start of a data block. Writes that exceed the block
    /// size are truncated.
    ///
    /// # Errors
    ///
    /// Attempting to write a block out of range will return an error.
    fn write_block(&mut self, blocknr: BlockNumber, buf: &[u8]) -> std::io::Result<()>;

    /// Reads bytes of the metadata area at an absolute offset.
    fn read_region(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()>;

    /// Writes bytes of the metadata area at an absolute offset.
    fn write_region(&mut self, offset: u64, buf: &[u8]) -> std::io::Result<()>;

    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}
