use crate::{
    error::{RepositoryError, Result},
    segment::{ROOT_BLOCK_ID, Segment, SegmentStore},
    telemetry,
};
use std::{
    ops::Range,
    ptr,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

pub(crate) const BLOCK_HEADER_SIZE: u32 = 16;
const BLOCK_ID: usize = 0;
const BYTES_USED: usize = 4;
const CAPACITY: usize = 8;
const NEXT_BLOCK: usize = 12;
// Root block only: length of the saved schema, then the schema bytes.
const SCHEMA_LEN: usize = 16;
const SCHEMA_START: u32 = 24;
const PAGE_SIZE: u32 = 4096;

pub(crate) const fn align8(n: u32) -> u32 {
    (n + 7) & !7
}

fn round_to_page(n: u32) -> Option<u32> {
    n.checked_add(PAGE_SIZE - 1).map(|n| n & !(PAGE_SIZE - 1))
}

/// One segment of the chain: a header followed by packed instance records.
pub(crate) struct Block {
    id: u32,
    data_start: u32,
    segment: Arc<dyn Segment>,
}

impl Block {
    fn new(id: u32, data_start: u32, segment: Arc<dyn Segment>) -> Self {
        Self {
            id,
            data_start,
            segment,
        }
    }

    pub(crate) const fn id(&self) -> u32 {
        self.id
    }

    /// Offset of the first instance record.
    pub(crate) const fn data_start(&self) -> u32 {
        self.data_start
    }

    pub(crate) fn bytes_used(&self) -> u32 {
        self.atomic_u32(BYTES_USED).load(Ordering::Acquire)
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.atomic_u32(CAPACITY).load(Ordering::Relaxed)
    }

    pub(crate) fn free_bytes(&self) -> u32 {
        self.capacity().saturating_sub(self.bytes_used())
    }

    fn next_block(&self) -> u32 {
        self.atomic_u32(NEXT_BLOCK).load(Ordering::Acquire)
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.segment.is_writable()
    }

    /// Makes everything below `bytes_used` visible to readers.
    pub(crate) fn publish(&self, bytes_used: u32) {
        debug_assert!(bytes_used <= self.capacity());
        self.atomic_u32(BYTES_USED)
            .store(bytes_used, Ordering::Release);
    }

    pub(crate) fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.segment.len());
        unsafe { &*self.segment.as_ptr().add(offset).cast::<AtomicU32>() }
    }

    pub(crate) fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        assert!(offset % 8 == 0 && offset + 8 <= self.segment.len());
        unsafe { &*self.segment.as_ptr().add(offset).cast::<AtomicU64>() }
    }

    /// Copies bytes out of the block. Concurrent counter updates may be
    /// observed half written.
    pub(crate) fn read_into(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.segment.len());
        unsafe {
            ptr::copy_nonoverlapping(
                self.segment.as_ptr().add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    pub(crate) fn read_vec(&self, range: Range<usize>) -> Vec<u8> {
        let mut out = vec![0; range.len()];
        self.read_into(range.start, &mut out);
        out
    }

    pub(crate) fn write_bytes(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        if !self.is_writable() {
            return Err(RepositoryError::ReadOnly);
        }
        assert!(offset + bytes.len() <= self.segment.len());
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.segment.as_ptr().add(offset),
                bytes.len(),
            );
        }
        Ok(())
    }

    pub(crate) fn zero(&self, offset: usize, len: usize) -> Result<()> {
        if !self.is_writable() {
            return Err(RepositoryError::ReadOnly);
        }
        assert!(offset + len <= self.segment.len());
        unsafe { ptr::write_bytes(self.segment.as_ptr().add(offset), 0, len) };
        Ok(())
    }

    fn schema_bytes(&self) -> Vec<u8> {
        let len = self.atomic_u32(SCHEMA_LEN).load(Ordering::Relaxed) as usize;
        let start = SCHEMA_START as usize;
        self.read_vec(start..start + len)
    }

    fn init_header(&self, capacity: u32, bytes_used: u32) {
        self.atomic_u32(BLOCK_ID).store(self.id, Ordering::Relaxed);
        self.atomic_u32(CAPACITY).store(capacity, Ordering::Relaxed);
        self.atomic_u32(NEXT_BLOCK).store(0, Ordering::Relaxed);
        self.publish(bytes_used);
    }

    /// Maps and validates a block written by another process.
    fn attach(id: u32, segment: Arc<dyn Segment>) -> Result<Self> {
        if segment.len() < SCHEMA_START as usize {
            return Err(RepositoryError::CorruptRepository(format!(
                "block {id} is only {} bytes",
                segment.len()
            )));
        }
        let mut block = Self::new(id, BLOCK_HEADER_SIZE, segment);
        let bytes_used = block.bytes_used();
        if id == ROOT_BLOCK_ID && bytes_used == 0 {
            return Err(RepositoryError::RepositoryNotFound(
                "root block is not initialized yet".into(),
            ));
        }
        let stored_id = block.atomic_u32(BLOCK_ID).load(Ordering::Relaxed);
        let capacity = block.capacity();
        if stored_id != id || capacity as usize > block.segment.len() || bytes_used > capacity {
            return Err(RepositoryError::CorruptRepository(format!(
                "block {id} header (id {stored_id}, used {bytes_used}, capacity {capacity}) is invalid"
            )));
        }
        if id == ROOT_BLOCK_ID {
            let schema_len = block.atomic_u32(SCHEMA_LEN).load(Ordering::Relaxed);
            block.data_start = SCHEMA_START
                .checked_add(schema_len)
                .map(align8)
                .filter(|start| *start <= bytes_used)
                .ok_or_else(|| {
                    RepositoryError::CorruptRepository(format!(
                        "schema of {schema_len} bytes overruns the root block"
                    ))
                })?;
        }
        Ok(block)
    }
}

/// The append-only list of blocks, either owned by the provider or attached
/// read-only by a collector.
pub(crate) struct BlockChain {
    store: Arc<dyn SegmentStore>,
    blocks: Vec<Arc<Block>>,
    block_size: u32,
}

impl BlockChain {
    /// Creates a fresh chain whose root block carries `schema`.
    pub(crate) fn create(
        store: Arc<dyn SegmentStore>,
        block_size: u32,
        schema: &[u8],
    ) -> Result<Self> {
        let too_large =
            || RepositoryError::ResourceExhausted(format!("schema of {} bytes", schema.len()));
        let schema_len = u32::try_from(schema.len()).map_err(|_| too_large())?;
        let data_start = SCHEMA_START
            .checked_add(schema_len)
            .map(align8)
            .ok_or_else(too_large)?;
        let capacity = round_to_page(data_start.max(block_size)).ok_or_else(too_large)?;

        let segment = store.create(capacity as usize)?;
        let root = Block::new(ROOT_BLOCK_ID, data_start, segment);
        root.atomic_u32(SCHEMA_LEN)
            .store(schema_len, Ordering::Relaxed);
        root.write_bytes(SCHEMA_START as usize, schema)?;
        root.init_header(capacity, data_start);
        telemetry::block_allocated();
        log::debug!(
            "created repository {} with a {capacity} byte root block",
            store.name()
        );

        Ok(Self {
            store,
            blocks: vec![Arc::new(root)],
            block_size,
        })
    }

    /// Maps every block of an already published chain, read-only.
    pub(crate) fn open_existing(store: Arc<dyn SegmentStore>) -> Result<Self> {
        let segment = store
            .open_existing(ROOT_BLOCK_ID)?
            .ok_or_else(|| RepositoryError::RepositoryNotFound(store.name().to_string()))?;
        let root = Block::attach(ROOT_BLOCK_ID, segment)?;
        let block_size = root.capacity();
        let mut chain = Self {
            store,
            blocks: vec![Arc::new(root)],
            block_size,
        };
        chain.refresh()?;
        log::debug!(
            "attached to repository {} ({} blocks)",
            chain.store.name(),
            chain.blocks.len()
        );
        Ok(chain)
    }

    /// Follows links published since the last call, returning how many
    /// blocks were added.
    pub(crate) fn refresh(&mut self) -> Result<usize> {
        let mut added = 0;
        loop {
            let next = self.last().next_block();
            if next == 0 {
                return Ok(added);
            }
            // The link is stored only once the block is fully initialized.
            let segment = self.store.open_existing(next)?.ok_or_else(|| {
                RepositoryError::CorruptRepository(format!("linked block {next} is missing"))
            })?;
            self.blocks.push(Arc::new(Block::attach(next, segment)?));
            added += 1;
        }
    }

    /// Maps a new block after the last one, large enough for `min_bytes` of
    /// records.
    pub(crate) fn allocate_new_block(&mut self, min_bytes: u32) -> Result<Arc<Block>> {
        let last = self.last().clone();
        if !last.is_writable() {
            return Err(RepositoryError::ReadOnly);
        }
        let capacity = BLOCK_HEADER_SIZE
            .checked_add(min_bytes)
            .map(|needed| needed.max(self.block_size))
            .and_then(round_to_page)
            .ok_or_else(|| {
                RepositoryError::ResourceExhausted(format!("block for {min_bytes} bytes"))
            })?;
        let id = last.id() + 1;

        let segment = self.store.extend(id, capacity as usize)?;
        let block = Arc::new(Block::new(id, BLOCK_HEADER_SIZE, segment));
        block.init_header(capacity, BLOCK_HEADER_SIZE);
        last.atomic_u32(NEXT_BLOCK).store(id, Ordering::Release);
        self.blocks.push(block.clone());

        telemetry::block_allocated();
        log::debug!(
            "allocated block {id} ({capacity} bytes) in repository {}",
            self.store.name()
        );
        Ok(block)
    }

    /// Finds room for a record of `size` bytes, growing the chain when no
    /// block has enough left. The caller writes the record and publishes it.
    pub(crate) fn reserve(&mut self, size: u32) -> Result<(Arc<Block>, u32)> {
        if let Some(block) = self.blocks.iter().find(|b| b.free_bytes() >= size) {
            return Ok((block.clone(), block.bytes_used()));
        }
        let block = self.allocate_new_block(size)?;
        let offset = block.bytes_used();
        Ok((block, offset))
    }

    pub(crate) fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    pub(crate) fn schema_bytes(&self) -> Vec<u8> {
        self.blocks[0].schema_bytes()
    }

    fn last(&self) -> &Arc<Block> {
        // A chain always holds its root block.
        &self.blocks[self.blocks.len() - 1]
    }
}
