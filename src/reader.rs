use crate::{
    block::BlockChain,
    collect::{self, CollectFilter, CollectOutcome},
    config::DEFAULT_LOCK_TIMEOUT,
    directory::{self, InstanceInfo},
    error::{RepositoryError, Result},
    schema::SchemaRegistry,
    segment::{self, SegmentStore, StoreLock},
    telemetry,
};
use std::{sync::Arc, time::Duration};

/// Fill level of one block of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockUsage {
    pub block_id: u32,
    pub bytes_used: u32,
    pub capacity: u32,
}

/// The collector side of a repository: a read-only attachment to the block
/// chain a provider published.
///
/// The schema is loaded from the root block when the repository is opened.
/// Blocks the provider links later are picked up before every collection.
/// Opening and every walk of the chain hold the repository lock, so they
/// never overlap a structural change by the provider.
pub struct PerfCollector {
    store: Arc<dyn SegmentStore>,
    chain: BlockChain,
    schema: SchemaRegistry,
    lock_timeout: Duration,
}

impl PerfCollector {
    /// Attaches to the repository in `store`, waiting up to the default lock
    /// timeout for the provider to finish a structural change.
    ///
    /// # Errors
    /// `RepositoryNotFound` when no live provider initialized the
    /// repository, `CorruptRepository` when a block header or the schema is
    /// invalid, `LockTimeout` when the repository stays locked.
    pub fn open(store: Arc<dyn SegmentStore>) -> Result<Self> {
        let lock = segment::lock_store(&*store, DEFAULT_LOCK_TIMEOUT)?;
        let chain = BlockChain::open_existing(store.clone())?;
        drop(lock);
        let schema = SchemaRegistry::from_bytes(&chain.schema_bytes())
            .map_err(|e| RepositoryError::CorruptRepository(format!("unreadable schema: {e}")))?;
        log::debug!(
            "opened repository with {} categories in {} blocks",
            schema.len(),
            chain.blocks().len()
        );
        Ok(Self {
            store,
            chain,
            schema,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// How long `collect` and `instances` wait for the repository lock.
    #[must_use]
    pub const fn lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    fn lock(&self) -> Result<StoreLock> {
        segment::lock_store(&*self.store, self.lock_timeout)
    }

    #[must_use]
    pub const fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    fn refresh(&mut self) -> Result<()> {
        let added = self.chain.refresh()?;
        if added > 0 {
            log::trace!("followed {added} new blocks");
        }
        Ok(())
    }

    /// Writes the collect stream for the categories `filter` selects, see
    /// [`RepositoryGuard::collect`](crate::RepositoryGuard::collect).
    ///
    /// # Errors
    /// `LockTimeout` when the repository stays locked, `CorruptRepository`
    /// when a newly linked block is invalid.
    pub fn collect(&mut self, filter: &CollectFilter, buf: &mut [u8]) -> Result<CollectOutcome> {
        let _lock = self.lock()?;
        self.refresh()?;
        let outcome = collect::collect_into(&self.schema, &self.chain, filter, buf)?;
        telemetry::collected(outcome.status, outcome.bytes_written);
        Ok(outcome)
    }

    /// Copies of every live instance, oldest first.
    ///
    /// # Errors
    /// `LockTimeout` when the repository stays locked, `CorruptRepository`
    /// when a newly linked block is invalid.
    pub fn instances(&mut self) -> Result<Vec<InstanceInfo>> {
        let _lock = self.lock()?;
        self.refresh()?;
        Ok(directory::instances(&self.chain, &self.schema))
    }

    /// Fill level of every block, root first.
    ///
    /// # Errors
    /// Same as [`instances`](Self::instances).
    pub fn block_usage(&mut self) -> Result<Vec<BlockUsage>> {
        let _lock = self.lock()?;
        self.refresh()?;
        Ok(self
            .chain
            .blocks()
            .iter()
            .map(|block| BlockUsage {
                block_id: block.id(),
                bytes_used: block.bytes_used(),
                capacity: block.capacity(),
            })
            .collect())
    }

    /// Unmaps the repository.
    pub fn close(self) {
        log::debug!("closed repository ({} blocks)", self.chain.blocks().len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collect::{CollectStatus, decode_objects},
        config::RepositoryConfig,
        provider::PerfProvider,
        schema::{CategoryDefinition, CounterDefinition, CounterType},
        segment::MemoryStore,
    };
    use std::{sync::mpsc, thread};

    fn queues() -> PerfProvider {
        let provider = PerfProvider::in_memory(RepositoryConfig::default().name("locked"));
        provider
            .add_category(
                CategoryDefinition::builder(3, "Queues", 8)
                    .counter(CounterDefinition::new(1, "Depth", CounterType::LARGE_RAW_COUNT, 0))
                    .build(),
            )
            .unwrap();
        provider.initialize().unwrap();
        provider
    }

    #[test]
    fn test_open_missing_repository() {
        let store = Arc::new(MemoryStore::new("nothing"));
        assert!(matches!(
            PerfCollector::open(store),
            Err(RepositoryError::RepositoryNotFound(_))
        ));
    }

    #[test]
    fn test_collects_provider_state() {
        let provider =
            PerfProvider::in_memory(RepositoryConfig::default().name("reader").block_size(4096));
        provider
            .add_category(
                CategoryDefinition::builder(3, "Queues", 8)
                    .counter(CounterDefinition::new(1, "Depth", CounterType::LARGE_RAW_COUNT, 0))
                    .build(),
            )
            .unwrap();
        let jobs = provider.create_instance_by_name(3, "jobs").unwrap();
        jobs.set_u64(0, 12).unwrap();

        let mut collector = PerfCollector::open(provider.store()).unwrap();
        assert_eq!(collector.schema().category(3).unwrap().name, "Queues");

        // Enough instances to spill into a second block after attaching.
        let handles: Vec<_> = (0..200)
            .map(|i| provider.create_instance_by_name(3, &format!("q{i}")).unwrap())
            .collect();
        handles[199].set_u64(0, 5).unwrap();

        let instances = collector.instances().unwrap();
        assert_eq!(instances.len(), 201);
        assert_eq!(instances[0].data, 12u64.to_le_bytes());
        assert_eq!(instances[200].data, 5u64.to_le_bytes());

        let mut buf = vec![0; 64 * 1024];
        let outcome = collector.collect(&CollectFilter::All, &mut buf).unwrap();
        assert_eq!(outcome.status, CollectStatus::Success);
        let objects = decode_objects(&buf[..outcome.bytes_written]).unwrap();
        assert_eq!(objects[0].instances.len(), 201);
        collector.close();
    }

    #[test]
    fn test_open_initialized_empty_repository() {
        let provider = PerfProvider::in_memory(RepositoryConfig::default().name("ro"));
        provider
            .add_category(CategoryDefinition::builder(1, "Empty", 0).build())
            .unwrap();
        provider.initialize().unwrap();
        let mut collector = PerfCollector::open(provider.store()).unwrap();
        assert!(collector.instances().unwrap().is_empty());
    }

    #[test]
    fn test_collect_times_out_while_provider_holds_lock() {
        let provider = queues();
        let mut collector = PerfCollector::open(provider.store())
            .unwrap()
            .lock_timeout(Duration::from_millis(20));

        let mut guard = provider.lock(Duration::from_secs(1)).unwrap();
        guard.create_instance_by_name(3, "jobs").unwrap();
        let mut buf = vec![0; 4096];
        assert!(matches!(
            collector.collect(&CollectFilter::All, &mut buf),
            Err(RepositoryError::LockTimeout(_))
        ));
        assert!(matches!(
            collector.instances(),
            Err(RepositoryError::LockTimeout(_))
        ));
        drop(guard);

        assert_eq!(collector.instances().unwrap().len(), 1);
    }

    #[test]
    fn test_collect_waits_for_structural_change() {
        let provider = Arc::new(queues());
        let mut collector = PerfCollector::open(provider.store()).unwrap();
        let (locked_tx, locked_rx) = mpsc::channel();

        let writer = {
            let provider = provider.clone();
            thread::spawn(move || {
                let mut guard = provider.lock(Duration::from_secs(1)).unwrap();
                guard.create_instance_by_name(3, "jobs").unwrap();
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                guard.create_instance_by_name(3, "mail").unwrap();
            })
        };
        locked_rx.recv().unwrap();

        // Collect waits for the guard, so both instances are there.
        let mut buf = vec![0; 4096];
        let outcome = collector.collect(&CollectFilter::All, &mut buf).unwrap();
        let objects = decode_objects(&buf[..outcome.bytes_written]).unwrap();
        assert_eq!(objects[0].instances.len(), 2);
        writer.join().unwrap();
    }
}
