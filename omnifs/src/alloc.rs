use std::collections::BTreeMap;

use log::debug;

use crate::error::FsError;

/// Logical identifier of a file's block list.
pub type FileId = u32;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// A flat bit-vector, one bit per data block. A set bit marks the block as used.
#[derive(Debug, Clone)]
pub struct Bitmap {
    bitmap: Vec<u64>,
    len: usize,
    free: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bitmap: vec![0; (len + 63) / 64],
            len,
            free: len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Returns `None` for a block beyond the end of the map.
    pub fn get(&self, blocknr: usize) -> Option<State> {
        if blocknr >= self.len {
            return None;
        }
        // Grab the u64 containing the significant bit.
        let outer = self.bitmap[blocknr / 64];
        let mask = 0b01_u64 << (blocknr % 64);
        if outer & mask == 0 {
            Some(State::Free)
        } else {
            Some(State::Used)
        }
    }

    /// Marks a block used. Returns false if it was already used or out of range.
    pub fn set_reserved(&mut self, blocknr: usize) -> bool {
        match self.get(blocknr) {
            Some(State::Free) => {
                self.bitmap[blocknr / 64] |= 0b01_u64 << (blocknr % 64);
                self.free -= 1;
                true
            }
            _ => false,
        }
    }

    /// Marks a block free. Returns false if it was already free or out of range.
    pub fn set_free(&mut self, blocknr: usize) -> bool {
        match self.get(blocknr) {
            Some(State::Used) => {
                self.bitmap[blocknr / 64] &= !(0b01_u64 << (blocknr % 64));
                self.free += 1;
                true
            }
            _ => false,
        }
    }
}

/// Implements a first-fit block allocation policy. Each call to the iterator
/// yields the next free block after the previous one, scanning the whole map,
/// so consecutive results are not necessarily adjacent on disk.
pub struct NextAvailableAllocation<'a> {
    /// Keeps track of the next starting place for looking for available blocks.
    marker: usize,
    bitmap: &'a Bitmap,
}

impl<'a> NextAvailableAllocation<'a> {
    pub fn new(bitmap: &'a Bitmap) -> Self {
        Self { marker: 0, bitmap }
    }
}

impl<'a> Iterator for NextAvailableAllocation<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.marker < self.bitmap.len() {
            let candidate = self.marker;
            self.marker += 1;
            if let Some(State::Free) = self.bitmap.get(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Per-block bookkeeping for an allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    pub file_id: FileId,
    /// Position of the block within its file, starting at 0.
    pub sequence: u32,
    /// Bytes of file content stored in this block.
    pub payload_len: u32,
    /// The block holding the file's next chunk, if any.
    pub next_block: Option<u32>,
    /// Seconds since epoch at allocation time.
    pub allocated_at: u64,
}

/// Allocates non-contiguous block lists and tracks which file owns which block.
///
/// A block's bit is set iff it appears in exactly one file list and has a
/// metadata record.
#[derive(Debug)]
pub struct BlockStore {
    bitmap: Bitmap,
    files: BTreeMap<FileId, Vec<u32>>,
    meta: BTreeMap<u32, BlockMeta>,
    next_file_id: FileId,
}

impl BlockStore {
    pub fn new(total_blocks: u32) -> Self {
        Self {
            bitmap: Bitmap::new(total_blocks as usize),
            files: BTreeMap::new(),
            meta: BTreeMap::new(),
            next_file_id: 1,
        }
    }

    pub fn total_blocks(&self) -> u32 {
        self.bitmap.len() as u32
    }

    pub fn free_blocks(&self) -> u32 {
        self.bitmap.free_count() as u32
    }

    pub fn used_blocks(&self) -> u32 {
        self.total_blocks() - self.free_blocks()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Reserves `count` blocks for a new file. Either all of them are acquired
    /// or none are.
    pub fn allocate(&mut self, count: u32, now: u64) -> Result<FileId, FsError> {
        if count == 0 {
            return Err(FsError::invalid_op("cannot allocate zero blocks"));
        }
        if count > self.free_blocks() {
            debug!(
                "allocation of {} blocks refused, {} free",
                count,
                self.free_blocks()
            );
            return Err(FsError::NoSpace);
        }

        let picked: Vec<u32> = NextAvailableAllocation::new(&self.bitmap)
            .take(count as usize)
            .map(|block| block as u32)
            .collect();

        let mut acquired = Vec::with_capacity(picked.len());
        for &block in picked.iter() {
            if !self.bitmap.set_reserved(block as usize) {
                break;
            }
            acquired.push(block);
        }
        if acquired.len() != count as usize {
            for &block in acquired.iter() {
                self.bitmap.set_free(block as usize);
            }
            return Err(FsError::NoSpace);
        }

        let file_id = self.next_file_id;
        self.next_file_id = self.next_file_id.wrapping_add(1).max(1);
        for (seq, &block) in acquired.iter().enumerate() {
            self.meta.insert(
                block,
                BlockMeta {
                    file_id,
                    sequence: seq as u32,
                    payload_len: 0,
                    next_block: acquired.get(seq + 1).copied(),
                    allocated_at: now,
                },
            );
        }
        debug!("allocated {} blocks for file {}: {:?}", count, file_id, acquired);
        self.files.insert(file_id, acquired);
        Ok(file_id)
    }

    /// Releases every block owned by `file_id`.
    pub fn free(&mut self, file_id: FileId) -> bool {
        match self.files.remove(&file_id) {
            Some(blocks) => {
                for block in blocks.iter() {
                    self.bitmap.set_free(*block as usize);
                    self.meta.remove(block);
                }
                debug!("freed {} blocks of file {}", blocks.len(), file_id);
                true
            }
            None => false,
        }
    }

    /// Keeps the first `keep` blocks of a file and releases the rest. The new
    /// last block no longer links anywhere. Keeping zero blocks frees the file.
    pub fn shrink(&mut self, file_id: FileId, keep: usize) -> bool {
        if keep == 0 {
            return self.free(file_id);
        }
        let blocks = match self.files.get_mut(&file_id) {
            Some(blocks) => blocks,
            None => return false,
        };
        if keep > blocks.len() {
            return false;
        }
        for block in blocks.drain(keep..) {
            self.bitmap.set_free(block as usize);
            self.meta.remove(&block);
        }
        let last = blocks[keep - 1];
        if let Some(meta) = self.meta.get_mut(&last) {
            meta.next_block = None;
        }
        true
    }

    /// The blocks of a file in logical order.
    pub fn blocks_of(&self, file_id: FileId) -> Option<&[u32]> {
        self.files.get(&file_id).map(Vec::as_slice)
    }

    pub fn read_metadata(&self, block: u32) -> Option<BlockMeta> {
        self.meta.get(&block).copied()
    }

    /// Overwrites the record of an allocated block. Fails for free or
    /// out-of-range blocks.
    pub fn write_metadata(&mut self, block: u32, meta: BlockMeta) -> bool {
        match self.bitmap.get(block as usize) {
            Some(State::Used) => {
                self.meta.insert(block, meta);
                true
            }
            _ => false,
        }
    }

    /// Total payload bytes recorded across a file's blocks.
    pub fn file_size(&self, file_id: FileId) -> u64 {
        self.blocks_of(file_id)
            .unwrap_or(&[])
            .iter()
            .filter_map(|block| self.meta.get(block))
            .map(|meta| meta.payload_len as u64)
            .sum()
    }

    /// Share of used blocks, as a percentage.
    pub fn fragmentation(&self) -> f64 {
        if self.total_blocks() == 0 {
            return 0.0;
        }
        self.used_blocks() as f64 / self.total_blocks() as f64 * 100.0
    }

    #[cfg(test)]
    fn owned_blocks(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = Bitmap::new(4096);

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), Some(State::Free));
        assert_eq!(bmp.get(2), Some(State::Used));
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = Bitmap::new(4096);

        bmp.set_reserved(0);
        bmp.set_reserved(4095);

        assert_eq!(bmp.get(0), Some(State::Used));
        assert_eq!(bmp.get(4095), Some(State::Used));
        assert_eq!(bmp.get(4096), None);
        assert_eq!(bmp.free_count(), 4094);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = Bitmap::new(100);

        assert!(bmp.set_reserved(10));
        assert!(!bmp.set_reserved(10));
        assert_eq!(bmp.get(10), Some(State::Used));

        assert!(bmp.set_free(10));
        assert_eq!(bmp.get(10), Some(State::Free));
        // Neighbours in the same word are untouched.
        bmp.set_reserved(11);
        bmp.set_free(10);
        assert_eq!(bmp.get(11), Some(State::Used));
    }

    #[test]
    fn allocation_links_blocks_in_order() {
        let mut store = BlockStore::new(8);
        let file = store.allocate(3, 42).unwrap();

        let blocks = store.blocks_of(file).unwrap().to_vec();
        assert_eq!(blocks, vec![0, 1, 2]);
        let first = store.read_metadata(0).unwrap();
        assert_eq!(first.file_id, file);
        assert_eq!(first.sequence, 0);
        assert_eq!(first.next_block, Some(1));
        assert_eq!(first.allocated_at, 42);
        assert_eq!(store.read_metadata(2).unwrap().next_block, None);
    }

    #[test]
    fn allocation_fills_holes_left_by_freed_files() {
        let mut store = BlockStore::new(6);
        let a = store.allocate(2, 0).unwrap();
        let b = store.allocate(2, 0).unwrap();
        store.free(a);

        let c = store.allocate(3, 0).unwrap();
        assert_eq!(store.blocks_of(c).unwrap(), &[0, 1, 4]);
        assert_eq!(store.read_metadata(1).unwrap().next_block, Some(4));
        assert_eq!(store.blocks_of(b).unwrap(), &[2, 3]);
    }

    #[test]
    fn allocation_without_enough_space_changes_nothing() {
        let mut store = BlockStore::new(4);
        store.allocate(3, 0).unwrap();

        match store.allocate(2, 0) {
            Err(FsError::NoSpace) => (),
            other => panic!("expected NoSpace, got {:?}", other),
        }
        assert_eq!(store.free_blocks(), 1);
        assert_eq!(store.file_count(), 1);
    }

    #[test]
    fn shrink_releases_tail_blocks() {
        let mut store = BlockStore::new(8);
        let file = store.allocate(4, 0).unwrap();

        assert!(store.shrink(file, 2));
        assert_eq!(store.blocks_of(file).unwrap(), &[0, 1]);
        assert_eq!(store.read_metadata(1).unwrap().next_block, None);
        assert_eq!(store.read_metadata(2), None);
        assert_eq!(store.free_blocks(), 6);

        assert!(store.shrink(file, 0));
        assert_eq!(store.blocks_of(file), None);
        assert_eq!(store.free_blocks(), 8);
    }

    #[test]
    fn metadata_writes_require_an_allocated_block() {
        let mut store = BlockStore::new(4);
        let file = store.allocate(1, 0).unwrap();
        let mut meta = store.read_metadata(0).unwrap();
        meta.payload_len = 17;

        assert!(store.write_metadata(0, meta));
        assert_eq!(store.file_size(file), 17);
        assert!(!store.write_metadata(1, meta));
        assert!(!store.write_metadata(99, meta));
    }

    #[test]
    fn free_and_owned_blocks_always_cover_the_device() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut store = BlockStore::new(64);
        let mut live: Vec<FileId> = Vec::new();

        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                if let Ok(file) = store.allocate(rng.gen_range(1..8), 0) {
                    live.push(file);
                }
            } else {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(store.free(victim));
            }
            assert_eq!(
                store.free_blocks() as usize + store.owned_blocks(),
                store.total_blocks() as usize
            );
            assert_eq!(store.meta.len(), store.owned_blocks());
        }
    }

    #[test]
    fn fragmentation_reports_used_share() {
        let mut store = BlockStore::new(10);
        assert_eq!(store.fragmentation(), 0.0);
        store.allocate(5, 0).unwrap();
        assert!((store.fragmentation() - 50.0).abs() < f64::EPSILON);
    }
}
