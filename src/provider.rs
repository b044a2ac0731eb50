use crate::{
    block::BlockChain,
    collect::{self, CollectFilter, CollectOutcome},
    config::RepositoryConfig,
    directory::{self, InstanceHandle, InstanceInfo},
    error::{RepositoryError, Result},
    schema::{CategoryDefinition, CounterDefinition, SchemaRegistry},
    segment::{self, MemoryStore, SegmentStore, StoreLock},
    snapshot::Snapshot,
    telemetry,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    io::{BufRead, Write},
    sync::Arc,
    time::{Duration, Instant},
};

struct ProviderState {
    schema: SchemaRegistry,
    chain: Option<BlockChain>,
}

/// The provider side of a repository: owns the schema and the writable
/// block chain that collectors attach to.
///
/// Structural operations go through a [`RepositoryGuard`] taken with
/// [`PerfProvider::lock`]. The convenience methods on this type take the
/// lock with the configured default timeout for a single operation.
///
/// The repository lives as long as the provider: dropping it removes the
/// segments from the store, after which collectors can no longer open it.
///
/// # Example
/// ```
/// use metrics_shm_repository::{
///     CategoryDefinition, CounterDefinition, CounterType, PerfProvider, RepositoryConfig,
/// };
///
/// let provider = PerfProvider::in_memory(RepositoryConfig::default());
/// provider
///     .add_category(
///         CategoryDefinition::builder(1, "Connections", 8)
///             .counter(CounterDefinition::new(1, "Bytes", CounterType::LARGE_RAW_COUNT, 0))
///             .build(),
///     )
///     .unwrap();
/// let eth0 = provider.create_instance_by_name(1, "eth0").unwrap();
/// eth0.add_u64(0, 1500).unwrap();
/// ```
pub struct PerfProvider {
    config: RepositoryConfig,
    store: Arc<dyn SegmentStore>,
    state: Mutex<ProviderState>,
}

impl PerfProvider {
    #[must_use]
    pub fn new(config: RepositoryConfig, store: Arc<dyn SegmentStore>) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(ProviderState {
                schema: SchemaRegistry::new(),
                chain: None,
            }),
        }
    }

    /// A provider whose segments live in this process only.
    #[must_use]
    pub fn in_memory(config: RepositoryConfig) -> Self {
        let store = Arc::new(MemoryStore::new(config.repository_name()));
        Self::new(config, store)
    }

    #[must_use]
    pub const fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// The store collectors open to attach to this repository.
    #[must_use]
    pub fn store(&self) -> Arc<dyn SegmentStore> {
        self.store.clone()
    }

    /// Takes the repository lock, waiting at most `timeout`. The lock is
    /// shared with every collector attached to the store.
    ///
    /// # Errors
    /// `LockTimeout` when the lock is still held by another thread or a
    /// collector after `timeout`. Nothing was changed in that case.
    pub fn lock(&self, timeout: Duration) -> Result<RepositoryGuard<'_>> {
        let started = Instant::now();
        let state = self
            .state
            .try_lock_for(timeout)
            .ok_or_else(|| segment::lock_timed_out(&*self.store, timeout))?;
        let store_lock = self
            .store
            .lock(timeout.saturating_sub(started.elapsed()))?
            .ok_or_else(|| segment::lock_timed_out(&*self.store, timeout))?;
        Ok(RepositoryGuard {
            provider: self,
            _store_lock: store_lock,
            state,
        })
    }

    fn locked(&self) -> Result<RepositoryGuard<'_>> {
        self.lock(self.config.default_lock_timeout())
    }

    /// # Errors
    /// See [`RepositoryGuard::add_category`].
    pub fn add_category(&self, category: CategoryDefinition) -> Result<()> {
        self.locked()?.add_category(category)
    }

    /// # Errors
    /// See [`RepositoryGuard::add_counter`].
    pub fn add_counter(&self, category_id: u32, counter: CounterDefinition) -> Result<()> {
        self.locked()?.add_counter(category_id, counter)
    }

    /// # Errors
    /// See [`RepositoryGuard::initialize`].
    pub fn initialize(&self) -> Result<()> {
        self.locked()?.initialize()
    }

    /// # Errors
    /// See [`RepositoryGuard::create_instance`].
    pub fn create_instance(
        &self,
        category_id: u32,
        instance_id: u32,
        name: Option<&str>,
    ) -> Result<InstanceHandle> {
        self.locked()?.create_instance(category_id, instance_id, name)
    }

    /// # Errors
    /// See [`RepositoryGuard::create_instance_by_name`].
    pub fn create_instance_by_name(&self, category_id: u32, name: &str) -> Result<InstanceHandle> {
        self.locked()?.create_instance_by_name(category_id, name)
    }

    /// # Errors
    /// See [`RepositoryGuard::find_instance_by_name`].
    pub fn find_instance_by_name(&self, category_id: u32, name: &str) -> Result<InstanceHandle> {
        self.locked()?.find_instance_by_name(category_id, name)
    }

    /// # Errors
    /// See [`RepositoryGuard::find_instance_by_id`].
    pub fn find_instance_by_id(&self, category_id: u32, instance_id: u32) -> Result<InstanceHandle> {
        self.locked()?.find_instance_by_id(category_id, instance_id)
    }

    /// # Errors
    /// See [`RepositoryGuard::release_instance`].
    pub fn release_instance(&self, instance: InstanceHandle) -> Result<u32> {
        self.locked()?.release_instance(instance)
    }

    /// # Errors
    /// `LockTimeout` only.
    pub fn instances(&self) -> Result<Vec<InstanceInfo>> {
        Ok(self.locked()?.instances())
    }

    /// # Errors
    /// See [`RepositoryGuard::collect`].
    pub fn collect(&self, filter: &CollectFilter, buf: &mut [u8]) -> Result<CollectOutcome> {
        self.locked()?.collect(filter, buf)
    }

    /// # Errors
    /// See [`RepositoryGuard::export`].
    pub fn export<W: Write>(&self, writer: W, first: bool, last: bool) -> Result<()> {
        self.locked()?.export(writer, first, last)
    }

    /// # Errors
    /// See [`RepositoryGuard::import`].
    pub fn import<R: BufRead>(&self, reader: R) -> Result<usize> {
        self.locked()?.import(reader)
    }
}

impl Drop for PerfProvider {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.chain.take().is_some() {
            remove_segments(&*self.store);
        }
    }
}

fn remove_segments(store: &dyn SegmentStore) {
    match store.remove_all() {
        Ok(()) => log::debug!("removed repository {}", store.name()),
        Err(e) => log::warn!("failed to remove repository {}: {e}", store.name()),
    }
}

/// Exclusive access to the repository structure. Dropping the guard
/// releases the lock.
pub struct RepositoryGuard<'a> {
    provider: &'a PerfProvider,
    _store_lock: StoreLock,
    state: MutexGuard<'a, ProviderState>,
}

impl RepositoryGuard<'_> {
    /// Drops the chain and the segments behind it.
    fn teardown(&mut self) -> bool {
        if self.state.chain.take().is_some() {
            remove_segments(&*self.provider.store);
            true
        } else {
            false
        }
    }

    fn ensure_mutable_schema(&self) -> Result<()> {
        if self.state.chain.is_some() {
            return Err(RepositoryError::SchemaFrozen);
        }
        Ok(())
    }

    /// # Errors
    /// `SchemaFrozen` once the repository is initialized, otherwise any
    /// registration error of [`SchemaRegistry::add_category`].
    pub fn add_category(&mut self, category: CategoryDefinition) -> Result<()> {
        self.ensure_mutable_schema()?;
        self.state.schema.add_category(category)
    }

    /// # Errors
    /// `SchemaFrozen` once the repository is initialized, otherwise any
    /// registration error of [`SchemaRegistry::add_counter`].
    pub fn add_counter(&mut self, category_id: u32, counter: CounterDefinition) -> Result<()> {
        self.ensure_mutable_schema()?;
        self.state.schema.add_counter(category_id, counter)
    }

    #[must_use]
    pub fn schema(&self) -> &SchemaRegistry {
        &self.state.schema
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.chain.is_some()
    }

    /// Drops every category and counter together with the block chain.
    /// Collectors opening the store afterwards find no repository.
    ///
    /// # Errors
    /// `InstancesAlive` while any instance has not been released.
    pub fn clear_map(&mut self) -> Result<()> {
        let alive = self
            .state
            .chain
            .as_ref()
            .is_some_and(|chain| !directory::live_records(chain).is_empty());
        if alive {
            return Err(RepositoryError::InstancesAlive);
        }
        self.teardown();
        self.state.schema.clear();
        log::debug!("cleared repository {}", self.provider.store.name());
        Ok(())
    }

    /// Publishes the root block carrying the current schema. Registration
    /// is closed from here on. Creating an instance or collecting
    /// initializes the repository implicitly.
    ///
    /// # Errors
    /// `ResourceExhausted` when the root segment can not be mapped.
    pub fn initialize(&mut self) -> Result<()> {
        let state = &mut *self.state;
        open_chain(self.provider, &mut state.chain, &state.schema).map(|_| ())
    }

    /// Drops the block chain and removes its segments. Handles already
    /// handed out keep their blocks mapped until they are dropped; the next
    /// initialization publishes a fresh root block.
    pub fn uninitialize(&mut self) {
        if self.teardown() {
            telemetry::live_instances(0);
            log::debug!("uninitialized repository {}", self.provider.store.name());
        }
    }

    fn report_live(&self) {
        if let Some(chain) = &self.state.chain {
            telemetry::live_instances(directory::live_records(chain).len());
        }
    }

    /// Creates an instance with an explicit id. `name` is required to be
    /// unique among the live instances of the category and is ignored for
    /// instanceless categories.
    ///
    /// # Errors
    /// `UnknownCategory`, `DuplicateName` or `ResourceExhausted`.
    pub fn create_instance(
        &mut self,
        category_id: u32,
        instance_id: u32,
        name: Option<&str>,
    ) -> Result<InstanceHandle> {
        self.create(category_id, Some(instance_id), name)
    }

    /// Creates a named instance with the next unused id of the category.
    ///
    /// # Errors
    /// `UnknownCategory`, `DuplicateName` or `ResourceExhausted`.
    pub fn create_instance_by_name(
        &mut self,
        category_id: u32,
        name: &str,
    ) -> Result<InstanceHandle> {
        self.create(category_id, None, Some(name))
    }

    fn create(
        &mut self,
        category_id: u32,
        instance_id: Option<u32>,
        name: Option<&str>,
    ) -> Result<InstanceHandle> {
        if self.state.schema.category(category_id).is_none() {
            return Err(RepositoryError::UnknownCategory(category_id));
        }
        let state = &mut *self.state;
        let chain = open_chain(self.provider, &mut state.chain, &state.schema)?;
        let handle =
            directory::create_instance(chain, &state.schema, category_id, instance_id, name)?;
        self.report_live();
        Ok(handle)
    }

    fn find(
        &self,
        category_id: u32,
        find: impl FnOnce(&BlockChain, &SchemaRegistry) -> Result<InstanceHandle>,
    ) -> Result<InstanceHandle> {
        if self.state.schema.category(category_id).is_none() {
            return Err(RepositoryError::UnknownCategory(category_id));
        }
        let chain = self
            .state
            .chain
            .as_ref()
            .ok_or(RepositoryError::InstanceNotFound)?;
        find(chain, &self.state.schema)
    }

    /// Looks up the most recent live instance called `name` and takes a
    /// reference to it.
    ///
    /// # Errors
    /// `UnknownCategory` or `InstanceNotFound`.
    pub fn find_instance_by_name(&self, category_id: u32, name: &str) -> Result<InstanceHandle> {
        self.find(category_id, |chain, schema| {
            directory::find_by_name(chain, schema, category_id, name)
        })
    }

    /// # Errors
    /// `UnknownCategory` or `InstanceNotFound`.
    pub fn find_instance_by_id(&self, category_id: u32, instance_id: u32) -> Result<InstanceHandle> {
        self.find(category_id, |chain, schema| {
            directory::find_by_id(chain, schema, category_id, instance_id)
        })
    }

    /// Drops the reference held by `instance`, returning how many remain.
    /// The instance is gone once none remain.
    ///
    /// # Errors
    /// `InstanceNotFound` when every reference was already released.
    pub fn release_instance(&mut self, instance: InstanceHandle) -> Result<u32> {
        let remaining = directory::release(instance)?;
        if remaining == 0 {
            self.report_live();
        }
        Ok(remaining)
    }

    /// Copies of every live instance, oldest first.
    #[must_use]
    pub fn instances(&self) -> Vec<InstanceInfo> {
        self.state
            .chain
            .as_ref()
            .map(|chain| directory::instances(chain, &self.state.schema))
            .unwrap_or_default()
    }

    /// Writes the collect stream for the categories `filter` selects.
    ///
    /// A buffer too small for every selected category is not an error: the
    /// outcome reports `MoreData` with the complete objects that fit.
    ///
    /// # Errors
    /// `ResourceExhausted` when initialization fails or a category encodes
    /// to more than 4 GiB.
    pub fn collect(&mut self, filter: &CollectFilter, buf: &mut [u8]) -> Result<CollectOutcome> {
        let state = &mut *self.state;
        let chain = open_chain(self.provider, &mut state.chain, &state.schema)?;
        let outcome = collect::collect_into(&state.schema, chain, filter, buf)?;
        telemetry::collected(outcome.status, outcome.bytes_written);
        Ok(outcome)
    }

    /// A copy of the schema and every live instance.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.state.schema, &self.instances())
    }

    /// Writes the repository as an XML fragment, see [`Snapshot::write_xml`].
    ///
    /// # Errors
    /// IO errors from `writer`.
    pub fn export<W: Write>(&self, writer: W, first: bool, last: bool) -> Result<()> {
        let snapshot = self.snapshot();
        snapshot.write_xml(writer, first, last)?;
        log::debug!(
            "exported {} categories and {} instances",
            snapshot.categories.len(),
            snapshot.instance_count()
        );
        Ok(())
    }

    /// Reads a document written by [`export`](Self::export) and applies it.
    /// Returns the number of instances created.
    ///
    /// # Errors
    /// See [`apply_snapshot`](Self::apply_snapshot), plus
    /// `MalformedSnapshot` for an invalid document.
    pub fn import<R: BufRead>(&mut self, reader: R) -> Result<usize> {
        let snapshot = Snapshot::read_xml(reader).inspect_err(|e| {
            log::warn!("rejected snapshot: {e}");
        })?;
        self.apply_snapshot(&snapshot)
    }

    /// Registers the categories of `snapshot` and recreates its instances
    /// with their counter values. Either all of it is applied or none.
    ///
    /// Categories already registered must match the snapshot exactly. New
    /// categories are only accepted before initialization.
    ///
    /// # Errors
    /// `DuplicateCategory` for a category registered with another
    /// definition, `SchemaFrozen` for a new category after initialization,
    /// `DuplicateName` when an instance name is already live.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<usize> {
        let initialized = self.is_initialized();
        let mut schema = self.state.schema.clone();
        for category in &snapshot.categories {
            let definition = &category.definition;
            match schema.category(definition.id) {
                Some(existing) if existing == definition => {}
                Some(_) => return Err(RepositoryError::DuplicateCategory(definition.id)),
                None if initialized => return Err(RepositoryError::SchemaFrozen),
                None => schema.add_category(definition.clone())?,
            }
        }

        let previous = std::mem::replace(&mut self.state.schema, schema);
        let mut created = Vec::with_capacity(snapshot.instance_count());
        let state = &mut *self.state;
        let result = open_chain(self.provider, &mut state.chain, &state.schema)
            .and_then(|chain| recreate_instances(chain, &state.schema, snapshot, &mut created));
        if let Err(e) = result {
            for handle in created {
                let (category, instance) = (handle.category_id(), handle.instance_id());
                if let Err(release) = directory::release(handle) {
                    log::warn!(
                        "failed to roll back instance {instance} of category {category}: {release}"
                    );
                }
            }
            if !initialized {
                self.teardown();
            }
            self.state.schema = previous;
            log::warn!("snapshot import rolled back: {e}");
            return Err(e);
        }

        self.report_live();
        log::debug!(
            "imported {} categories and {} instances",
            snapshot.categories.len(),
            created.len()
        );
        Ok(created.len())
    }
}

/// The chain of an initialized repository, publishing the root block first
/// when there is none yet.
fn open_chain<'a>(
    provider: &PerfProvider,
    chain: &'a mut Option<BlockChain>,
    schema: &SchemaRegistry,
) -> Result<&'a mut BlockChain> {
    if chain.is_none() {
        let created = BlockChain::create(
            provider.store.clone(),
            provider.config.default_block_size(),
            &schema.to_bytes()?,
        )?;
        log::debug!(
            "initialized repository {} with {} categories",
            provider.store.name(),
            schema.len()
        );
        *chain = Some(created);
    }
    chain
        .as_mut()
        .ok_or_else(|| RepositoryError::CorruptRepository("missing block chain".into()))
}

fn recreate_instances(
    chain: &mut BlockChain,
    schema: &SchemaRegistry,
    snapshot: &Snapshot,
    created: &mut Vec<InstanceHandle>,
) -> Result<()> {
    for category in &snapshot.categories {
        for instance in &category.instances {
            let handle = directory::create_instance(
                chain,
                schema,
                category.definition.id,
                Some(instance.id),
                instance.name.as_deref(),
            )?;
            let written = handle.write_bytes(0, &instance.data);
            created.push(handle);
            written?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collect::CollectStatus,
        schema::{CounterDefinition, CounterType},
    };
    use std::{sync::mpsc, thread};

    fn provider() -> PerfProvider {
        let provider = PerfProvider::in_memory(RepositoryConfig::default().name("provider-test"));
        provider
            .add_category(
                CategoryDefinition::builder(1, "Connections", 16)
                    .counter(CounterDefinition::new(1, "Bytes", CounterType::LARGE_RAW_COUNT, 0))
                    .counter(CounterDefinition::new(2, "Requests", CounterType::RAW_COUNT, 8))
                    .build(),
            )
            .unwrap();
        provider
            .add_category(
                CategoryDefinition::builder(2, "Server", 8)
                    .instanceless()
                    .counter(CounterDefinition::new(1, "Uptime", CounterType::LARGE_RAW_COUNT, 0))
                    .build(),
            )
            .unwrap();
        provider
    }

    #[test]
    fn test_schema_frozen_after_initialize() {
        let provider = provider();
        provider.initialize().unwrap();

        let late = CategoryDefinition::builder(3, "Late", 4).build();
        assert!(matches!(
            provider.add_category(late),
            Err(RepositoryError::SchemaFrozen)
        ));
        let counter = CounterDefinition::new(3, "Late", CounterType::RAW_COUNT, 12);
        assert!(matches!(
            provider.add_counter(1, counter),
            Err(RepositoryError::SchemaFrozen)
        ));
    }

    #[test]
    fn test_create_initializes_lazily() {
        let provider = provider();
        assert!(!provider.lock(Duration::ZERO).unwrap().is_initialized());

        let eth0 = provider.create_instance_by_name(1, "eth0").unwrap();
        eth0.set_u64(0, 42).unwrap();
        assert!(provider.lock(Duration::ZERO).unwrap().is_initialized());

        let found = provider.find_instance_by_name(1, "eth0").unwrap();
        assert_eq!(found.get_u64(0).unwrap(), 42);
        assert_eq!(provider.instances().unwrap().len(), 1);
    }

    #[test]
    fn test_find_before_initialize() {
        let provider = provider();
        assert!(matches!(
            provider.find_instance_by_id(1, 0),
            Err(RepositoryError::InstanceNotFound)
        ));
        assert!(matches!(
            provider.find_instance_by_id(9, 0),
            Err(RepositoryError::UnknownCategory(9))
        ));
    }

    #[test]
    fn test_lock_times_out() {
        let provider = Arc::new(provider());
        let guard = provider.lock(Duration::from_secs(1)).unwrap();
        let (tx, rx) = mpsc::channel();

        let other = provider.clone();
        let waiter = thread::spawn(move || {
            let result = other.lock(Duration::from_millis(20)).map(|_| ());
            tx.send(matches!(result, Err(RepositoryError::LockTimeout(_))))
                .unwrap();
        });
        assert!(rx.recv().unwrap());
        waiter.join().unwrap();
        drop(guard);
        assert!(provider.lock(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn test_clear_map_needs_released_instances() {
        let provider = provider();
        let eth0 = provider.create_instance_by_name(1, "eth0").unwrap();

        let mut guard = provider.lock(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            guard.clear_map(),
            Err(RepositoryError::InstancesAlive)
        ));
        guard.release_instance(eth0).unwrap();
        guard.clear_map().unwrap();
        assert!(guard.schema().is_empty());
        assert!(!guard.is_initialized());

        guard
            .add_category(CategoryDefinition::builder(3, "Fresh", 4).build())
            .unwrap();
        guard.create_instance(3, 0, None).unwrap();
        assert_eq!(guard.instances().len(), 1);
    }

    #[test]
    fn test_collect_through_guard() {
        let provider = provider();
        provider.create_instance(1, 4, Some("eth0")).unwrap();
        provider.create_instance(2, 0, None).unwrap();

        let mut buf = vec![0; 4096];
        let outcome = provider.collect(&CollectFilter::All, &mut buf).unwrap();
        assert_eq!(outcome.status, CollectStatus::Success);
        assert_eq!(outcome.object_types, 2);

        let outcome = provider
            .collect(&"2".parse().unwrap(), &mut buf)
            .unwrap();
        assert_eq!(outcome.object_types, 1);
    }

    #[test]
    fn test_export_import_round_trip() {
        let source = provider();
        let eth0 = source.create_instance(1, 3, Some("eth0")).unwrap();
        eth0.set_u64(0, 1500).unwrap();
        eth0.set_u32(8, 7).unwrap();
        source.create_instance(1, 9, None).unwrap();
        source.create_instance(2, 0, None).unwrap().set_u64(0, 60).unwrap();

        let mut xml = Vec::new();
        source.export(&mut xml, true, true).unwrap();

        let target = PerfProvider::in_memory(RepositoryConfig::default().name("import-test"));
        assert_eq!(target.import(xml.as_slice()).unwrap(), 3);

        let restored = target.find_instance_by_name(1, "eth0").unwrap();
        assert_eq!(restored.instance_id(), 3);
        assert_eq!(restored.get_u64(0).unwrap(), 1500);
        assert_eq!(restored.get_u32(8).unwrap(), 7);
        assert_eq!(target.find_instance_by_id(2, 0).unwrap().get_u64(0).unwrap(), 60);

        let guard = target.lock(Duration::from_secs(1)).unwrap();
        assert_eq!(guard.snapshot(), source.lock(Duration::from_secs(1)).unwrap().snapshot());
    }

    #[test]
    fn test_import_is_atomic() {
        let target = provider();
        target.create_instance_by_name(1, "eth1").unwrap();

        let source = provider();
        source.create_instance_by_name(1, "eth0").unwrap();
        source.create_instance_by_name(1, "eth1").unwrap();
        let mut xml = Vec::new();
        source.export(&mut xml, true, true).unwrap();

        assert!(matches!(
            target.import(xml.as_slice()),
            Err(RepositoryError::DuplicateName { .. })
        ));
        let names: Vec<_> = target
            .instances()
            .unwrap()
            .into_iter()
            .filter_map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["eth1".to_string()]);
    }

    #[test]
    fn test_import_rejects_new_category_after_initialize() {
        let target = provider();
        target.initialize().unwrap();

        let source = PerfProvider::in_memory(RepositoryConfig::default().name("other"));
        source
            .add_category(CategoryDefinition::builder(5, "Disk", 8).build())
            .unwrap();
        let mut xml = Vec::new();
        source.export(&mut xml, true, true).unwrap();

        assert!(matches!(
            target.import(xml.as_slice()),
            Err(RepositoryError::SchemaFrozen)
        ));
        assert!(target.lock(Duration::ZERO).unwrap().schema().category(5).is_none());
    }
}
