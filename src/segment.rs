//! Shared memory segments backing the block chain.
//!
//! A [`SegmentStore`] names segments by block id inside one repository
//! namespace. The provider creates and extends, collectors open existing
//! segments read-only. [`MemoryStore`] keeps everything in process and is
//! what the tests use; [`MappedFileStore`] maps files so that independent
//! processes see the same bytes.
//!
//! Every store also carries the repository lock. The provider holds it for
//! structural changes and collectors hold it while they walk the chain, so
//! it has to be visible to every process attached to the namespace.

use crate::{
    error::{RepositoryError, Result},
    telemetry,
};
use fs2::FileExt;
use memmap2::{Mmap, MmapMut};
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, atomic::AtomicU64},
    thread,
    time::{Duration, Instant},
};

pub const ROOT_BLOCK_ID: u32 = 0;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A contiguous mapped region.
///
/// The pointer stays valid for as long as the segment is alive. Readers of a
/// segment that is not writable must never store through it.
pub trait Segment: Send + Sync {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
    fn is_writable(&self) -> bool;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The repository lock of a store, released when dropped.
pub struct StoreLock {
    _guard: Option<ArcMutexGuard<RawMutex, ()>>,
    _file: Option<File>,
}

impl StoreLock {
    /// Wraps a file the caller holds an exclusive advisory lock on.
    #[must_use]
    pub fn file(file: File) -> Self {
        Self {
            _guard: None,
            _file: Some(file),
        }
    }

    fn guard(guard: ArcMutexGuard<RawMutex, ()>) -> Self {
        Self {
            _guard: Some(guard),
            _file: None,
        }
    }
}

pub trait SegmentStore: Send + Sync {
    /// Namespace shared by the provider and its collectors.
    fn name(&self) -> &str;

    /// Creates segment `block_id` with `size` zeroed bytes mapped read/write,
    /// replacing any segment of the same id. Readers that already mapped the
    /// old segment keep their mapping.
    ///
    /// # Errors
    /// `ResourceExhausted` when the segment can not be created or mapped.
    fn extend(&self, block_id: u32, size: usize) -> Result<Arc<dyn Segment>>;

    /// Maps an existing segment read-only, `None` if it was never created
    /// or the provider that created it is gone.
    ///
    /// # Errors
    /// IO errors other than the segment not existing.
    fn open_existing(&self, block_id: u32) -> Result<Option<Arc<dyn Segment>>>;

    /// Takes the repository lock, waiting at most `timeout`. `None` when it
    /// is still held elsewhere after that.
    ///
    /// # Errors
    /// IO errors while opening or locking the lock.
    fn lock(&self, timeout: Duration) -> Result<Option<StoreLock>>;

    /// Deletes every segment of the namespace. Later opens find no
    /// repository; mappings that already exist stay readable.
    ///
    /// # Errors
    /// Returns an error if a segment exists but can not be removed.
    fn remove_all(&self) -> Result<()>;

    /// Creates the root segment of a fresh chain.
    ///
    /// # Errors
    /// `ResourceExhausted` when the segment can not be created or mapped.
    fn create(&self, size: usize) -> Result<Arc<dyn Segment>> {
        log::debug!("creating repository {} ({size} bytes)", self.name());
        self.extend(ROOT_BLOCK_ID, size)
    }
}

/// Counts and logs a lock that was not acquired in time.
pub(crate) fn lock_timed_out(store: &dyn SegmentStore, timeout: Duration) -> RepositoryError {
    telemetry::lock_timeout();
    log::warn!(
        "repository {} lock not acquired within {timeout:?}",
        store.name()
    );
    RepositoryError::LockTimeout(timeout)
}

/// The store lock as a `LockTimeout` error when it is not free in time.
pub(crate) fn lock_store(store: &dyn SegmentStore, timeout: Duration) -> Result<StoreLock> {
    store
        .lock(timeout)?
        .ok_or_else(|| lock_timed_out(store, timeout))
}

struct HeapSegment {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl HeapSegment {
    fn new(size: usize) -> Self {
        let words = size.div_ceil(8);
        Self {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            len: size,
        }
    }
}

struct HeapView {
    segment: Arc<HeapSegment>,
    writable: bool,
}

impl Segment for HeapView {
    fn as_ptr(&self) -> *mut u8 {
        // Atomics give the words interior mutability, so writes through this
        // pointer are permitted.
        self.segment.words.as_ptr().cast::<u8>().cast_mut()
    }

    fn len(&self) -> usize {
        self.segment.len
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// In-process segments, shared between every clone of the store.
#[derive(Clone)]
pub struct MemoryStore {
    name: String,
    segments: Arc<Mutex<HashMap<u32, Arc<HeapSegment>>>>,
    lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            segments: Arc::default(),
            lock: Arc::default(),
        }
    }

    /// Number of segments currently held.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.lock().len()
    }
}

impl SegmentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn extend(&self, block_id: u32, size: usize) -> Result<Arc<dyn Segment>> {
        let segment = Arc::new(HeapSegment::new(size));
        self.segments.lock().insert(block_id, segment.clone());
        Ok(Arc::new(HeapView {
            segment,
            writable: true,
        }))
    }

    fn open_existing(&self, block_id: u32) -> Result<Option<Arc<dyn Segment>>> {
        let segment = self.segments.lock().get(&block_id).cloned();
        Ok(segment.map(|segment| {
            Arc::new(HeapView {
                segment,
                writable: false,
            }) as Arc<dyn Segment>
        }))
    }

    fn lock(&self, timeout: Duration) -> Result<Option<StoreLock>> {
        Ok(self.lock.try_lock_arc_for(timeout).map(StoreLock::guard))
    }

    fn remove_all(&self) -> Result<()> {
        self.segments.lock().clear();
        Ok(())
    }
}

enum SegmentMmap {
    Read(Mmap),
    Write(MmapMut),
}

struct MappedSegment {
    mmap: SegmentMmap,
    data: *mut u8,
}

// The raw pointer refers into the mapping owned by the same struct.
unsafe impl Send for MappedSegment {}
unsafe impl Sync for MappedSegment {}

impl Segment for MappedSegment {
    fn as_ptr(&self) -> *mut u8 {
        self.data
    }

    fn len(&self) -> usize {
        match &self.mmap {
            SegmentMmap::Read(m) => m.len(),
            SegmentMmap::Write(m) => m.len(),
        }
    }

    fn is_writable(&self) -> bool {
        matches!(self.mmap, SegmentMmap::Write(_))
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.raw_os_error().is_some() && e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Segments backed by memory-mapped files, one file per block.
///
/// Next to the segments live `<name>.lock`, the repository lock, and
/// `<name>.owner`, which the provider keeps locked shared for as long as
/// its chain exists. Segments whose owner is no longer locked were left
/// behind by a provider that exited and are not opened.
#[derive(Debug, Clone)]
pub struct MappedFileStore {
    dir: PathBuf,
    name: String,
    owner: Arc<Mutex<Option<File>>>,
}

impl MappedFileStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            name: name.to_string(),
            owner: Arc::default(),
        }
    }

    /// Places the segment files in `/dev/shm` when it exists, the temp dir otherwise.
    #[must_use]
    pub fn in_shm(name: &str) -> Self {
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            Self::new(shm, name)
        } else {
            Self::new(std::env::temp_dir(), name)
        }
    }

    #[must_use]
    pub fn segment_path(&self, block_id: u32) -> PathBuf {
        self.dir.join(format!("{}.{block_id}.blk", self.name))
    }

    fn side_path(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}.{suffix}", self.name))
    }

    /// Whether a provider still owns the segments of this namespace.
    fn provider_alive(&self) -> Result<bool> {
        if self.owner.lock().is_some() {
            return Ok(true);
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.side_path("owner"))
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(false),
            Err(e) if is_contended(&e) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }
}

impl SegmentStore for MappedFileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, size: usize) -> Result<Arc<dyn Segment>> {
        {
            let mut owner = self.owner.lock();
            if owner.is_none() {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(self.side_path("owner"))?;
                FileExt::lock_shared(&file)?;
                *owner = Some(file);
            }
        }
        log::debug!("creating repository {} ({size} bytes)", self.name);
        self.extend(ROOT_BLOCK_ID, size)
    }

    fn extend(&self, block_id: u32, size: usize) -> Result<Arc<dyn Segment>> {
        let path = self.segment_path(block_id);
        let exhausted =
            |e: io::Error| RepositoryError::ResourceExhausted(format!("{}: {e}", path.display()));

        // Unlink first so existing readers keep the old inode mapped.
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(exhausted(e)),
            _ => {}
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(exhausted)?;
        file.set_len(size as u64).map_err(exhausted)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file).map_err(exhausted)? };
        if mmap.len() != size {
            return Err(RepositoryError::ResourceExhausted(format!(
                "{} mapped {} bytes, wanted {size}",
                path.display(),
                mmap.len()
            )));
        }
        let data = mmap.as_mut_ptr();
        Ok(Arc::new(MappedSegment {
            mmap: SegmentMmap::Write(mmap),
            data,
        }))
    }

    fn open_existing(&self, block_id: u32) -> Result<Option<Arc<dyn Segment>>> {
        let file = match OpenOptions::new()
            .read(true)
            .open(self.segment_path(block_id))
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if block_id == ROOT_BLOCK_ID && !self.provider_alive()? {
            log::debug!("repository {} has no live provider", self.name);
            return Ok(None);
        }
        let mmap = unsafe { Mmap::map(&file)? };
        let data = mmap.as_ptr().cast_mut();
        Ok(Some(Arc::new(MappedSegment {
            mmap: SegmentMmap::Read(mmap),
            data,
        })))
    }

    fn lock(&self, timeout: Duration) -> Result<Option<StoreLock>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.side_path("lock"))?;
        let deadline = Instant::now().checked_add(timeout);
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Some(StoreLock::file(file))),
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }
            let left = deadline.map_or(LOCK_POLL_INTERVAL, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if left.is_zero() {
                return Ok(None);
            }
            thread::sleep(left.min(LOCK_POLL_INTERVAL));
        }
    }

    fn remove_all(&self) -> Result<()> {
        let mut block_id = ROOT_BLOCK_ID;
        loop {
            match fs::remove_file(self.segment_path(block_id)) {
                Ok(()) => block_id += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                Err(e) => return Err(e.into()),
            }
        }
        if self.owner.lock().take().is_some() {
            match fs::remove_file(self.side_path("owner")) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        log::debug!("removed {block_id} segments of repository {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_shares_bytes() {
        let store = MemoryStore::new("shared");
        let writer = store.create(64).unwrap();
        unsafe { writer.as_ptr().add(3).write(7) };

        let reader = store.open_existing(ROOT_BLOCK_ID).unwrap().unwrap();
        assert!(!reader.is_writable());
        assert_eq!(reader.len(), 64);
        assert_eq!(unsafe { reader.as_ptr().add(3).read() }, 7);
        assert!(store.open_existing(1).unwrap().is_none());
    }

    #[test]
    fn test_mapped_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MappedFileStore::new(dir.path(), "mapped");
        let writer = store.extend(1, 4096).unwrap();
        assert!(writer.is_writable());
        unsafe { writer.as_ptr().write(42) };

        let reader = store.open_existing(1).unwrap().unwrap();
        assert_eq!(reader.len(), 4096);
        assert_eq!(unsafe { reader.as_ptr().read() }, 42);
        assert!(store.open_existing(2).unwrap().is_none());
    }

    #[test]
    fn test_mapped_store_replaces_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = MappedFileStore::new(dir.path(), "replace");
        let old = store.create(4096).unwrap();
        unsafe { old.as_ptr().write(1) };
        let held = store.open_existing(ROOT_BLOCK_ID).unwrap().unwrap();

        let fresh = store.create(8192).unwrap();
        assert_eq!(unsafe { fresh.as_ptr().read() }, 0);
        assert_eq!(unsafe { held.as_ptr().read() }, 1);

        store.remove_all().unwrap();
        assert!(!store.segment_path(ROOT_BLOCK_ID).exists());
    }

    #[test]
    fn test_mapped_store_skips_segments_without_owner() {
        let dir = tempfile::tempdir().unwrap();
        let provider = MappedFileStore::new(dir.path(), "owned");
        let collector = MappedFileStore::new(dir.path(), "owned");

        // A root segment nobody owns, as left by a provider that exited.
        provider.extend(ROOT_BLOCK_ID, 4096).unwrap();
        assert!(collector.open_existing(ROOT_BLOCK_ID).unwrap().is_none());

        provider.create(4096).unwrap();
        assert!(collector.open_existing(ROOT_BLOCK_ID).unwrap().is_some());

        provider.remove_all().unwrap();
        assert!(collector.open_existing(ROOT_BLOCK_ID).unwrap().is_none());
    }

    #[test]
    fn test_mapped_store_lock_excludes_other_stores() {
        let dir = tempfile::tempdir().unwrap();
        let first = MappedFileStore::new(dir.path(), "locked");
        let second = MappedFileStore::new(dir.path(), "locked");

        let held = first.lock(Duration::ZERO).unwrap().unwrap();
        let started = Instant::now();
        assert!(second.lock(Duration::from_millis(20)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));

        drop(held);
        assert!(second.lock(Duration::ZERO).unwrap().is_some());
    }

    #[test]
    fn test_memory_store_lock_shared_by_clones() {
        let store = MemoryStore::new("locked");
        let clone = store.clone();
        let held = store.lock(Duration::ZERO).unwrap().unwrap();
        assert!(clone.lock(Duration::from_millis(5)).unwrap().is_none());
        drop(held);
        assert!(clone.lock(Duration::ZERO).unwrap().is_some());
    }
}
