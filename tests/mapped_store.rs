use metrics_shm_repository::{
    CategoryDefinition, CollectFilter, CollectStatus, CounterDefinition, CounterType,
    MappedFileStore, PerfCollector, PerfProvider, RepositoryConfig, RepositoryError,
    SegmentStore, decode_objects,
};
use std::sync::Arc;

fn connections() -> CategoryDefinition {
    CategoryDefinition::builder(10, "Connections", 48)
        .help("Open connections")
        .counter(CounterDefinition::new(10, "Bytes", CounterType::BULK_COUNT, 0))
        .counter(CounterDefinition::new(12, "Requests", CounterType::RAW_COUNT, 8))
        .counter(
            CounterDefinition::new(14, "Peer", CounterType::TEXT, 16)
                .max_size(32)
                .help("Remote address"),
        )
        .build()
}

#[test]
fn collector_reads_provider_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = RepositoryConfig::default().name("mapped").block_size(4096);
    let provider = PerfProvider::new(config, Arc::new(MappedFileStore::new(dir.path(), "mapped")));
    provider.add_category(connections()).unwrap();

    let eth0 = provider.create_instance_by_name(10, "eth0").unwrap();
    eth0.set_u64(0, 1 << 40).unwrap();
    eth0.set_u32(8, 3).unwrap();
    eth0.write_bytes(16, b"10.0.0.1").unwrap();

    // A separate store value, as another process would open it.
    let reader_store = Arc::new(MappedFileStore::new(dir.path(), "mapped"));
    let mut collector = PerfCollector::open(reader_store).unwrap();
    assert_eq!(collector.schema().category(10), Some(&connections()));

    eth0.add_u32(8, 2).unwrap();
    let mut buf = vec![0; 8192];
    let outcome = collector.collect(&"10".parse().unwrap(), &mut buf).unwrap();
    assert_eq!(outcome.status, CollectStatus::Success);

    let objects = decode_objects(&buf[..outcome.bytes_written]).unwrap();
    let instance = &objects[0].instances[0];
    assert_eq!(instance.name.as_deref(), Some("eth0"));
    assert_eq!(instance.data[..8], (1u64 << 40).to_le_bytes());
    assert_eq!(instance.data[8..12], 5u32.to_le_bytes());
    assert_eq!(&instance.data[16..24], b"10.0.0.1");
    assert_eq!(objects[0].counters[2].offset, 8 + 16);
    collector.close();
}

#[test]
fn collector_follows_new_block_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MappedFileStore::new(dir.path(), "growing"));
    let provider = PerfProvider::new(
        RepositoryConfig::default().name("growing").block_size(4096),
        store.clone(),
    );
    provider.add_category(connections()).unwrap();
    provider.initialize().unwrap();

    let mut collector = PerfCollector::open(Arc::new(MappedFileStore::new(dir.path(), "growing")))
        .unwrap();
    for i in 0..100 {
        provider
            .create_instance_by_name(10, &format!("conn-{i}"))
            .unwrap();
    }
    assert!(store.segment_path(1).exists());

    let instances = collector.instances().unwrap();
    assert_eq!(instances.len(), 100);
    assert!(instances.iter().all(|i| i.data.len() == 48));

    store.remove_all().unwrap();
    assert!(!store.segment_path(0).exists());
}

#[test]
fn collector_needs_published_repository() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MappedFileStore::new(dir.path(), "absent"));
    assert!(matches!(
        PerfCollector::open(store),
        Err(RepositoryError::RepositoryNotFound(_))
    ));

    let provider = PerfProvider::new(
        RepositoryConfig::default(),
        Arc::new(MappedFileStore::new(dir.path(), "absent")),
    );
    provider.add_category(connections()).unwrap();
    let mut buf = vec![0; 16];
    let outcome = provider.collect(&CollectFilter::All, &mut buf).unwrap();
    assert_eq!(outcome.status, CollectStatus::MoreData);
    assert!(PerfCollector::open(Arc::new(MappedFileStore::new(dir.path(), "absent"))).is_ok());
}

#[test]
fn repository_goes_away_with_its_provider() {
    let dir = tempfile::tempdir().unwrap();
    let config = RepositoryConfig::default().name("teardown");
    let provider = PerfProvider::new(
        config,
        Arc::new(MappedFileStore::new(dir.path(), "teardown")),
    );
    provider.add_category(connections()).unwrap();
    let ghost = provider.create_instance_by_name(10, "ghost").unwrap();
    ghost.set_u64(0, 77).unwrap();

    let mut attached =
        PerfCollector::open(Arc::new(MappedFileStore::new(dir.path(), "teardown"))).unwrap();
    drop(ghost);
    drop(provider);

    assert!(matches!(
        PerfCollector::open(Arc::new(MappedFileStore::new(dir.path(), "teardown"))),
        Err(RepositoryError::RepositoryNotFound(_))
    ));
    // A collector attached before keeps reading its mapping.
    assert_eq!(attached.instances().unwrap()[0].data[..8], 77u64.to_le_bytes());
}

#[test]
fn uninitialize_removes_segment_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MappedFileStore::new(dir.path(), "uninit"));
    let provider = PerfProvider::new(RepositoryConfig::default().name("uninit"), store.clone());
    provider.add_category(connections()).unwrap();
    provider.initialize().unwrap();
    assert!(store.segment_path(0).exists());

    provider
        .lock(std::time::Duration::from_secs(1))
        .unwrap()
        .uninitialize();
    assert!(!store.segment_path(0).exists());
    assert!(matches!(
        PerfCollector::open(Arc::new(MappedFileStore::new(dir.path(), "uninit"))),
        Err(RepositoryError::RepositoryNotFound(_))
    ));
}

#[test]
fn collector_waits_for_provider_in_other_store() {
    let dir = tempfile::tempdir().unwrap();
    let provider = PerfProvider::new(
        RepositoryConfig::default().name("cross-lock"),
        Arc::new(MappedFileStore::new(dir.path(), "cross-lock")),
    );
    provider.add_category(connections()).unwrap();
    provider.initialize().unwrap();

    let mut collector =
        PerfCollector::open(Arc::new(MappedFileStore::new(dir.path(), "cross-lock")))
            .unwrap()
            .lock_timeout(std::time::Duration::from_millis(20));
    let guard = provider.lock(std::time::Duration::from_secs(1)).unwrap();
    assert!(matches!(
        collector.instances(),
        Err(RepositoryError::LockTimeout(_))
    ));
    drop(guard);
    assert!(collector.instances().unwrap().is_empty());
}
