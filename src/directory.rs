use crate::{
    block::{Block, BlockChain},
    error::{RepositoryError, Result},
    schema::{CategoryDefinition, SchemaRegistry},
};
use std::{
    collections::HashSet,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

pub(crate) const RECORD_HEADER_SIZE: u32 = 24;
const ALLOC_SIZE: u32 = 0;
const CATEGORY_ID: u32 = 4;
const INSTANCE_ID: u32 = 8;
const REF_COUNT: u32 = 12;
const NAME_OFFSET: u32 = 16;
const NAME_LEN: u32 = 20;

/// An instance record inside a block.
#[derive(Clone)]
pub(crate) struct Record {
    block: Arc<Block>,
    offset: u32,
}

impl Record {
    fn field(&self, field: u32) -> &AtomicU32 {
        self.block.atomic_u32((self.offset + field) as usize)
    }

    fn alloc_size(&self) -> u32 {
        self.field(ALLOC_SIZE).load(Ordering::Relaxed)
    }

    pub(crate) fn category_id(&self) -> u32 {
        self.field(CATEGORY_ID).load(Ordering::Relaxed)
    }

    pub(crate) fn instance_id(&self) -> u32 {
        self.field(INSTANCE_ID).load(Ordering::Relaxed)
    }

    pub(crate) fn ref_count(&self) -> u32 {
        self.field(REF_COUNT).load(Ordering::Acquire)
    }

    pub(crate) fn name(&self) -> Option<String> {
        let name_offset = self.field(NAME_OFFSET).load(Ordering::Relaxed);
        if name_offset == 0 {
            return None;
        }
        let name_len = self.field(NAME_LEN).load(Ordering::Relaxed);
        let end = name_offset.checked_add(name_len)?;
        if end > self.alloc_size() {
            return None;
        }
        let start = (self.offset + name_offset) as usize;
        let bytes = self.block.read_vec(start..start + name_len as usize);
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn data_start(&self) -> usize {
        (self.offset + RECORD_HEADER_SIZE) as usize
    }

    /// Counter data bytes, at most `len` of them.
    pub(crate) fn data(&self, len: u32) -> Vec<u8> {
        let len = len.min(self.alloc_size() - RECORD_HEADER_SIZE) as usize;
        let start = self.data_start();
        self.block.read_vec(start..start + len)
    }

    /// Copies the counter data into `out`, truncated to the record.
    pub(crate) fn copy_data(&self, out: &mut [u8]) {
        let len = out
            .len()
            .min((self.alloc_size() - RECORD_HEADER_SIZE) as usize);
        self.block.read_into(self.data_start(), &mut out[..len]);
    }

    fn matches_name(&self, name: &str) -> bool {
        self.name().is_some_and(|n| n == name)
    }
}

fn block_records(block: &Arc<Block>, out: &mut Vec<Record>) {
    let used = block.bytes_used();
    let mut offset = block.data_start();
    while offset + RECORD_HEADER_SIZE <= used {
        let record = Record {
            block: block.clone(),
            offset,
        };
        let size = record.alloc_size();
        if size < RECORD_HEADER_SIZE || size % 8 != 0 || offset + size > used {
            log::warn!(
                "stopping scan of block {} at bad record at offset {offset}",
                block.id()
            );
            return;
        }
        out.push(record);
        offset += size;
    }
}

/// Every live record in chain order, oldest first.
pub(crate) fn live_records(chain: &BlockChain) -> Vec<Record> {
    let mut records = Vec::new();
    for block in chain.blocks() {
        block_records(block, &mut records);
    }
    records.retain(|r| r.ref_count() > 0);
    records
}

/// A reference to a live instance's counter data.
///
/// Counter values are written without taking the repository lock; a
/// collector may observe an update half applied. The handle keeps its block
/// mapped and stays valid until it is passed to `release_instance`.
pub struct InstanceHandle {
    record: Record,
    struct_size: u32,
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("category_id", &self.category_id())
            .field("instance_id", &self.instance_id())
            .field("block", &self.record.block.id())
            .field("offset", &self.record.offset)
            .finish_non_exhaustive()
    }
}

impl InstanceHandle {
    fn acquire(record: Record, struct_size: u32) -> Self {
        record.field(REF_COUNT).fetch_add(1, Ordering::AcqRel);
        Self {
            record,
            struct_size,
        }
    }

    #[must_use]
    pub fn category_id(&self) -> u32 {
        self.record.category_id()
    }

    #[must_use]
    pub fn instance_id(&self) -> u32 {
        self.record.instance_id()
    }

    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.record.name()
    }

    #[must_use]
    pub fn ref_count(&self) -> u32 {
        self.record.ref_count()
    }

    /// Size of the counter data, the category's struct size.
    #[must_use]
    pub const fn data_len(&self) -> u32 {
        self.struct_size
    }

    fn locate(&self, offset: u32, len: u32, align: u32) -> Result<usize> {
        let in_bounds = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.struct_size);
        if !in_bounds || offset % align != 0 {
            return Err(RepositoryError::InvalidAccess {
                offset,
                len,
                size: self.struct_size,
            });
        }
        Ok(self.record.data_start() + offset as usize)
    }

    fn writable(&self) -> Result<()> {
        if self.record.block.is_writable() {
            Ok(())
        } else {
            Err(RepositoryError::ReadOnly)
        }
    }

    /// # Errors
    /// `InvalidAccess` unless `offset` is a 4-byte aligned slot inside the data.
    pub fn get_u32(&self, offset: u32) -> Result<u32> {
        let at = self.locate(offset, 4, 4)?;
        Ok(self.record.block.atomic_u32(at).load(Ordering::Relaxed))
    }

    /// # Errors
    /// `InvalidAccess` unless `offset` is a 4-byte aligned slot inside the data.
    pub fn set_u32(&self, offset: u32, value: u32) -> Result<()> {
        self.writable()?;
        let at = self.locate(offset, 4, 4)?;
        self.record.block.atomic_u32(at).store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Wrapping add, returns the previous value.
    ///
    /// # Errors
    /// `InvalidAccess` unless `offset` is a 4-byte aligned slot inside the data.
    pub fn add_u32(&self, offset: u32, delta: u32) -> Result<u32> {
        self.writable()?;
        let at = self.locate(offset, 4, 4)?;
        Ok(self
            .record
            .block
            .atomic_u32(at)
            .fetch_add(delta, Ordering::Relaxed))
    }

    /// # Errors
    /// `InvalidAccess` unless `offset` is an 8-byte aligned slot inside the data.
    pub fn get_u64(&self, offset: u32) -> Result<u64> {
        let at = self.locate(offset, 8, 8)?;
        Ok(self.record.block.atomic_u64(at).load(Ordering::Relaxed))
    }

    /// # Errors
    /// `InvalidAccess` unless `offset` is an 8-byte aligned slot inside the data.
    pub fn set_u64(&self, offset: u32, value: u64) -> Result<()> {
        self.writable()?;
        let at = self.locate(offset, 8, 8)?;
        self.record.block.atomic_u64(at).store(value, Ordering::Relaxed);
        Ok(())
    }

    /// Wrapping add, returns the previous value.
    ///
    /// # Errors
    /// `InvalidAccess` unless `offset` is an 8-byte aligned slot inside the data.
    pub fn add_u64(&self, offset: u32, delta: u64) -> Result<u64> {
        self.writable()?;
        let at = self.locate(offset, 8, 8)?;
        Ok(self
            .record
            .block
            .atomic_u64(at)
            .fetch_add(delta, Ordering::Relaxed))
    }

    /// Overwrites raw counter bytes, e.g. a text counter.
    ///
    /// # Errors
    /// `InvalidAccess` if the bytes do not fit inside the data.
    pub fn write_bytes(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        self.writable()?;
        let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
        let at = self.locate(offset, len, 1)?;
        self.record.block.write_bytes(at, bytes)
    }

    /// # Errors
    /// `InvalidAccess` if the range is not inside the data.
    pub fn read_bytes(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let at = self.locate(offset, len, 1)?;
        Ok(self.record.block.read_vec(at..at + len as usize))
    }

    /// A copy of the whole counter data.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.record.data(self.struct_size)
    }
}

/// A copy of one live instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub category_id: u32,
    pub instance_id: u32,
    pub name: Option<String>,
    pub ref_count: u32,
    pub data: Vec<u8>,
}

fn lookup(schema: &SchemaRegistry, category_id: u32) -> Result<&CategoryDefinition> {
    schema
        .category(category_id)
        .ok_or(RepositoryError::UnknownCategory(category_id))
}

/// Cuts `name` so that it fits `max_len` characters together with the
/// terminator the collect stream appends. Zero means unlimited.
fn truncate_name(name: &str, max_len: u32) -> &str {
    if max_len == 0 {
        return name;
    }
    name.char_indices()
        .nth(max_len as usize - 1)
        .map_or(name, |(end, _)| &name[..end])
}

/// One past the highest live id, or the lowest unused id once that would
/// overflow.
fn next_instance_id(siblings: &[Record]) -> Option<u32> {
    match siblings.iter().map(Record::instance_id).max() {
        None => Some(0),
        Some(max) => max.checked_add(1).or_else(|| {
            let used: HashSet<u32> = siblings.iter().map(Record::instance_id).collect();
            (0..=u32::MAX).find(|id| !used.contains(id))
        }),
    }
}

/// Writes a new record for `category_id` and returns it with one reference.
///
/// `instance_id` of `None` assigns one past the highest live id of the
/// category. Names of instanceless categories are ignored and at most one
/// instance of such a category may be alive.
pub(crate) fn create_instance(
    chain: &mut BlockChain,
    schema: &SchemaRegistry,
    category_id: u32,
    instance_id: Option<u32>,
    name: Option<&str>,
) -> Result<InstanceHandle> {
    let category = lookup(schema, category_id)?;
    let name = if category.instanceless {
        None
    } else {
        name.map(|n| truncate_name(n, category.max_name_len))
    };

    let siblings: Vec<Record> = live_records(chain)
        .into_iter()
        .filter(|r| r.category_id() == category_id)
        .collect();
    let duplicate = if category.instanceless {
        !siblings.is_empty()
    } else {
        name.is_some_and(|n| siblings.iter().any(|r| r.matches_name(n)))
    };
    if duplicate {
        return Err(RepositoryError::DuplicateName {
            category: category_id,
            name: name.unwrap_or_default().to_string(),
        });
    }
    let instance_id = match instance_id {
        Some(id) => id,
        None => next_instance_id(&siblings).ok_or_else(|| {
            RepositoryError::ResourceExhausted(format!(
                "no unused instance id left in category {category_id}"
            ))
        })?,
    };

    let name_bytes = name.map(str::as_bytes).unwrap_or_default();
    let exhausted = || {
        RepositoryError::ResourceExhausted(format!(
            "instance of category {category_id} does not fit in a block"
        ))
    };
    let name_len = u32::try_from(name_bytes.len()).map_err(|_| exhausted())?;
    let data_size = category.struct_size.checked_add(7).ok_or_else(exhausted)? & !7;
    let alloc_size = RECORD_HEADER_SIZE
        .checked_add(data_size)
        .and_then(|n| n.checked_add(name_len))
        .and_then(|n| n.checked_add(7))
        .map(|n| n & !7)
        .ok_or_else(exhausted)?;

    let (block, offset) = chain.reserve(alloc_size)?;
    let record = Record {
        block: block.clone(),
        offset,
    };
    block.zero(record.data_start(), (alloc_size - RECORD_HEADER_SIZE) as usize)?;
    let name_offset = if name.is_some() {
        let name_offset = RECORD_HEADER_SIZE + data_size;
        block.write_bytes((offset + name_offset) as usize, name_bytes)?;
        name_offset
    } else {
        0
    };
    record.field(ALLOC_SIZE).store(alloc_size, Ordering::Relaxed);
    record.field(CATEGORY_ID).store(category_id, Ordering::Relaxed);
    record.field(INSTANCE_ID).store(instance_id, Ordering::Relaxed);
    record.field(REF_COUNT).store(0, Ordering::Relaxed);
    record.field(NAME_OFFSET).store(name_offset, Ordering::Relaxed);
    record.field(NAME_LEN).store(name_len, Ordering::Relaxed);
    let handle = InstanceHandle::acquire(record, category.struct_size);
    block.publish(offset + alloc_size);

    log::trace!(
        "created instance {instance_id} {name:?} of category {category_id} in block {} at {offset}",
        block.id()
    );
    Ok(handle)
}

fn find_latest(
    chain: &BlockChain,
    category: &CategoryDefinition,
    matches: impl Fn(&Record) -> bool,
) -> Result<InstanceHandle> {
    live_records(chain)
        .into_iter()
        .filter(|r| r.category_id() == category.id)
        .filter(|r| category.instanceless || matches(r))
        .last()
        .map(|record| InstanceHandle::acquire(record, category.struct_size))
        .ok_or(RepositoryError::InstanceNotFound)
}

pub(crate) fn find_by_name(
    chain: &BlockChain,
    schema: &SchemaRegistry,
    category_id: u32,
    name: &str,
) -> Result<InstanceHandle> {
    let category = lookup(schema, category_id)?;
    let name = truncate_name(name, category.max_name_len);
    find_latest(chain, category, |r| r.matches_name(name))
}

pub(crate) fn find_by_id(
    chain: &BlockChain,
    schema: &SchemaRegistry,
    category_id: u32,
    instance_id: u32,
) -> Result<InstanceHandle> {
    let category = lookup(schema, category_id)?;
    find_latest(chain, category, |r| r.instance_id() == instance_id)
}

/// Drops one reference and returns how many remain. At zero the record is
/// dead; its bytes stay in the block.
pub(crate) fn release(handle: InstanceHandle) -> Result<u32> {
    handle.writable()?;
    let ref_count = handle.record.field(REF_COUNT);
    let mut current = ref_count.load(Ordering::Acquire);
    loop {
        if current == 0 {
            return Err(RepositoryError::InstanceNotFound);
        }
        match ref_count.compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => return Ok(current - 1),
            Err(actual) => current = actual,
        }
    }
}

pub(crate) fn instances(chain: &BlockChain, schema: &SchemaRegistry) -> Vec<InstanceInfo> {
    live_records(chain)
        .into_iter()
        .filter_map(|record| {
            let category = schema.category(record.category_id())?;
            Some(InstanceInfo {
                category_id: record.category_id(),
                instance_id: record.instance_id(),
                name: record.name(),
                ref_count: record.ref_count(),
                data: record.data(category.struct_size),
            })
        })
        .collect()
}
