//! Translation of the live repository into the collector's object stream.
//!
//! Every collected category becomes one object: a 64 byte object header,
//! one 40 byte definition per counter, then per instance a 24 byte instance
//! definition followed by its UTF-16 name and a counter block. A counter
//! block is an 8 byte header followed by the instance's counter data copied
//! verbatim, so a counter registered at offset `n` is found at `8 + n` from
//! the start of the block. Instanceless categories carry a single counter
//! block and no instance definitions. All fields are little-endian.

use crate::{
    block::BlockChain,
    directory::{Record, live_records},
    error::{RepositoryError, Result},
    schema::{CategoryDefinition, SchemaRegistry},
};
use std::{collections::BTreeMap, convert::Infallible, str::FromStr};

pub const OBJECT_HEADER_SIZE: usize = 64;
pub const COUNTER_DEFINITION_SIZE: usize = 40;
pub const INSTANCE_DEFINITION_SIZE: usize = 24;
pub const COUNTER_BLOCK_HEADER_SIZE: usize = 8;
pub const PERF_NO_INSTANCES: i32 = -1;
pub const PERF_NO_UNIQUE_ID: i32 = -1;

const TOTAL_BYTE_LENGTH: usize = 0;
const NUM_INSTANCES: usize = 40;

const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Status reported back to the host's collect entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectStatus {
    /// Everything requested fit in the buffer.
    Success,
    /// The buffer filled up; retry with a larger one.
    MoreData,
}

impl CollectStatus {
    /// Host status code: `ERROR_SUCCESS` or `ERROR_MORE_DATA`.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::MoreData => 234,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectOutcome {
    pub status: CollectStatus,
    pub bytes_written: usize,
    /// Object types written completely.
    pub object_types: u32,
}

/// Which categories a collect request asks for.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CollectFilter {
    #[default]
    All,
    /// Costly and foreign requests, which this repository never serves.
    Nothing,
    Categories(Vec<u32>),
}

impl CollectFilter {
    #[must_use]
    pub fn wants(&self, category_id: u32) -> bool {
        match self {
            Self::All => true,
            Self::Nothing => false,
            Self::Categories(ids) => ids.contains(&category_id),
        }
    }
}

impl FromStr for CollectFilter {
    type Err = Infallible;

    /// Empty or `Global` selects everything, `Costly` and `Foreign` select
    /// nothing, anything else is read as whitespace separated category ids.
    /// Tokens that are not numbers are skipped.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("global") {
            return Ok(Self::All);
        }
        if value.eq_ignore_ascii_case("costly") || value.eq_ignore_ascii_case("foreign") {
            return Ok(Self::Nothing);
        }
        Ok(Self::Categories(
            value
                .split_whitespace()
                .filter_map(|token| token.parse().ok())
                .collect(),
        ))
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u32(&mut self, value: u32) {
        self.bytes(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.bytes(&value.to_le_bytes());
    }

    fn i64(&mut self, value: i64) {
        self.bytes(&value.to_le_bytes());
    }

    fn pad_to(&mut self, end: usize) {
        self.buf[self.pos..end].fill(0);
        self.pos = end;
    }

    fn slot(&mut self, len: usize) -> &mut [u8] {
        let start = self.pos;
        self.pos += len;
        &mut self.buf[start..self.pos]
    }
}

/// Object header and counter definitions of a category. They never change
/// after registration so they are encoded once and copied per request.
#[derive(Debug)]
pub(crate) struct CategoryLayout {
    instanceless: bool,
    struct_size: usize,
    definitions: Vec<u8>,
}

impl CategoryLayout {
    pub(crate) fn new(category: &CategoryDefinition) -> Self {
        let definition_len =
            OBJECT_HEADER_SIZE + COUNTER_DEFINITION_SIZE * category.counters.len();
        let mut definitions = vec![0; definition_len];
        let mut w = Writer {
            buf: &mut definitions,
            pos: 0,
        };
        w.u32(0); // total length, patched per request
        w.u32(definition_len as u32);
        w.u32(OBJECT_HEADER_SIZE as u32);
        w.u32(category.id);
        w.u32(0);
        w.u32(category.id.wrapping_add(1));
        w.u32(0);
        w.u32(category.detail_level);
        w.u32(category.counters.len() as u32);
        w.i32(category.default_counter);
        w.i32(PERF_NO_INSTANCES); // patched per request
        w.u32(0); // unicode instance names
        w.i64(0);
        w.i64(0);
        for counter in &category.counters {
            w.u32(COUNTER_DEFINITION_SIZE as u32);
            w.u32(counter.id);
            w.u32(0);
            w.u32(counter.id.wrapping_add(1));
            w.u32(0);
            w.i32(counter.default_scale);
            w.u32(counter.detail_level);
            w.u32(counter.counter_type.0);
            w.u32(counter.size());
            w.u32(COUNTER_BLOCK_HEADER_SIZE as u32 + counter.offset);
        }
        Self {
            instanceless: category.instanceless,
            struct_size: category.struct_size as usize,
            definitions,
        }
    }

    fn counter_block_len(&self) -> usize {
        align8(COUNTER_BLOCK_HEADER_SIZE + self.struct_size)
    }

    fn write_counter_block(&self, w: &mut Writer<'_>, record: Option<&Record>) {
        let len = self.counter_block_len();
        let end = w.pos + len;
        w.u32(len as u32);
        w.u32(0);
        let data = w.slot(self.struct_size);
        data.fill(0);
        if let Some(record) = record {
            record.copy_data(data);
        }
        w.pad_to(end);
    }
}

struct CollectedInstance {
    record: Record,
    name: Option<Vec<u8>>,
}

impl CollectedInstance {
    fn new(record: Record) -> Self {
        let name = record.name().map(|name| {
            name.encode_utf16()
                .chain(std::iter::once(0))
                .flat_map(u16::to_le_bytes)
                .collect()
        });
        Self { record, name }
    }

    fn definition_len(&self) -> usize {
        align8(INSTANCE_DEFINITION_SIZE + self.name.as_ref().map_or(0, Vec::len))
    }

    fn write_definition(&self, w: &mut Writer<'_>) {
        let len = self.definition_len();
        let end = w.pos + len;
        w.u32(len as u32);
        w.u32(0);
        w.u32(0);
        match &self.name {
            Some(name) => {
                w.i32(PERF_NO_UNIQUE_ID);
                w.u32(INSTANCE_DEFINITION_SIZE as u32);
                w.u32(name.len() as u32);
                w.bytes(name);
            }
            None => {
                w.i32(self.record.instance_id() as i32);
                w.u32(INSTANCE_DEFINITION_SIZE as u32);
                w.u32(0);
            }
        }
        w.pad_to(end);
    }
}

/// Writes the requested categories into `buf`, stopping at the first object
/// that does not fit. Objects are never split: a partial result holds only
/// complete object types.
pub(crate) fn collect_into(
    schema: &SchemaRegistry,
    chain: &BlockChain,
    filter: &CollectFilter,
    buf: &mut [u8],
) -> Result<CollectOutcome> {
    let mut by_category: BTreeMap<u32, Vec<Record>> = BTreeMap::new();
    for record in live_records(chain) {
        by_category
            .entry(record.category_id())
            .or_default()
            .push(record);
    }

    let mut w = Writer { buf, pos: 0 };
    let mut object_types = 0;
    for entry in schema.entries() {
        let category_id = entry.definition.id;
        if !filter.wants(category_id) {
            continue;
        }
        let layout = entry.layout();
        let instances: Vec<CollectedInstance> = by_category
            .remove(&category_id)
            .unwrap_or_default()
            .into_iter()
            .map(CollectedInstance::new)
            .collect();

        let total = layout.definitions.len()
            + if layout.instanceless {
                layout.counter_block_len()
            } else {
                instances
                    .iter()
                    .map(|i| i.definition_len() + layout.counter_block_len())
                    .sum()
            };
        if w.pos + total > w.buf.len() {
            log::debug!(
                "collect buffer of {} bytes full before category {category_id}",
                w.buf.len()
            );
            return Ok(CollectOutcome {
                status: CollectStatus::MoreData,
                bytes_written: w.pos,
                object_types,
            });
        }
        let total_len = u32::try_from(total).map_err(|_| {
            RepositoryError::ResourceExhausted(format!(
                "category {category_id} collects to {total} bytes"
            ))
        })?;

        let start = w.pos;
        w.bytes(&layout.definitions);
        w.buf[start + TOTAL_BYTE_LENGTH..start + TOTAL_BYTE_LENGTH + 4]
            .copy_from_slice(&total_len.to_le_bytes());
        if layout.instanceless {
            layout.write_counter_block(&mut w, instances.first().map(|i| &i.record));
        } else {
            let count = i32::try_from(instances.len()).unwrap_or(i32::MAX);
            w.buf[start + NUM_INSTANCES..start + NUM_INSTANCES + 4]
                .copy_from_slice(&count.to_le_bytes());
            for instance in &instances {
                instance.write_definition(&mut w);
                layout.write_counter_block(&mut w, Some(&instance.record));
            }
        }
        object_types += 1;
    }

    Ok(CollectOutcome {
        status: CollectStatus::Success,
        bytes_written: w.pos,
        object_types,
    })
}

/// A counter definition read back from a collected stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCounter {
    pub name_index: u32,
    pub counter_type: u32,
    pub size: u32,
    /// Offset from the start of the counter block.
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstance {
    pub unique_id: i32,
    pub name: Option<String>,
    /// Counter data, without the counter block header.
    pub data: Vec<u8>,
}

/// One object type read back from a collected stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedObject {
    pub name_index: u32,
    pub total_len: u32,
    pub num_instances: i32,
    pub counters: Vec<DecodedCounter>,
    pub instances: Vec<DecodedInstance>,
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    data.get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| RepositoryError::CorruptRepository(format!("stream ends at {at}")))
}

fn read_i32(data: &[u8], at: usize) -> Result<i32> {
    read_u32(data, at).map(|v| v as i32)
}

fn read_counter_block(data: &[u8], at: usize) -> Result<(Vec<u8>, usize)> {
    let len = read_u32(data, at)? as usize;
    let body = data
        .get(at + COUNTER_BLOCK_HEADER_SIZE..at + len)
        .ok_or_else(|| RepositoryError::CorruptRepository(format!("counter block at {at}")))?;
    Ok((body.to_vec(), at + len))
}

/// Parses the output of a collect request.
///
/// # Errors
/// `CorruptRepository` when a length points outside of `data`.
pub fn decode_objects(data: &[u8]) -> Result<Vec<DecodedObject>> {
    let mut objects = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let total_len = read_u32(data, pos)?;
        let definition_len = read_u32(data, pos + 4)? as usize;
        let header_len = read_u32(data, pos + 8)? as usize;
        let num_counters = read_u32(data, pos + 32)? as usize;
        let num_instances = read_i32(data, pos + NUM_INSTANCES)?;
        let end = pos + total_len as usize;
        if total_len == 0 || end > data.len() {
            return Err(RepositoryError::CorruptRepository(format!(
                "object at {pos} claims {total_len} bytes"
            )));
        }

        let mut counters = Vec::with_capacity(num_counters);
        for i in 0..num_counters {
            let at = pos + header_len + i * COUNTER_DEFINITION_SIZE;
            counters.push(DecodedCounter {
                name_index: read_u32(data, at + 4)?,
                counter_type: read_u32(data, at + 28)?,
                size: read_u32(data, at + 32)?,
                offset: read_u32(data, at + 36)?,
            });
        }

        let mut instances = Vec::new();
        let mut at = pos + definition_len;
        if num_instances == PERF_NO_INSTANCES {
            let (body, _) = read_counter_block(data, at)?;
            instances.push(DecodedInstance {
                unique_id: PERF_NO_UNIQUE_ID,
                name: None,
                data: body,
            });
        } else {
            for _ in 0..num_instances {
                let len = read_u32(data, at)? as usize;
                let unique_id = read_i32(data, at + 12)?;
                let name_offset = read_u32(data, at + 16)? as usize;
                let name_len = read_u32(data, at + 20)? as usize;
                let name = if name_len == 0 {
                    None
                } else {
                    let bytes = data
                        .get(at + name_offset..at + name_offset + name_len)
                        .ok_or_else(|| {
                            RepositoryError::CorruptRepository(format!("instance name at {at}"))
                        })?;
                    let units: Vec<u16> = bytes
                        .chunks_exact(2)
                        .map(|c| u16::from_le_bytes([c[0], c[1]]))
                        .take_while(|u| *u != 0)
                        .collect();
                    Some(String::from_utf16_lossy(&units))
                };
                let (body, next) = read_counter_block(data, at + len)?;
                instances.push(DecodedInstance {
                    unique_id,
                    name,
                    data: body,
                });
                at = next;
            }
        }

        objects.push(DecodedObject {
            name_index: read_u32(data, pos + 12)?,
            total_len,
            num_instances,
            counters,
            instances,
        });
        pos = end;
    }
    Ok(objects)
}
