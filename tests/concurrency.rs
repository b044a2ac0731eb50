use metrics_shm_repository::{
    CategoryDefinition, CollectFilter, CollectStatus, CounterDefinition, CounterType,
    PerfCollector, PerfProvider, RepositoryConfig, RepositoryError, decode_objects,
};
use std::{
    collections::HashSet,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

fn provider(name: &str) -> Arc<PerfProvider> {
    let provider = PerfProvider::in_memory(RepositoryConfig::default().name(name).block_size(4096));
    provider
        .add_category(
            CategoryDefinition::builder(1, "Workers", 16)
                .counter(CounterDefinition::new(1, "Jobs", CounterType::LARGE_RAW_COUNT, 0))
                .counter(CounterDefinition::new(2, "Errors", CounterType::RAW_COUNT, 8))
                .build(),
        )
        .unwrap();
    Arc::new(provider)
}

#[test]
fn concurrent_creates_never_duplicate_names() {
    let provider = provider("concurrent-creates");
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let provider = provider.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let mut created = 0;
                for i in 0..50 {
                    match provider.create_instance_by_name(1, &format!("worker-{}", (t + i) % 40)) {
                        Ok(handle) => {
                            handle.add_u64(0, 1).unwrap();
                            created += 1;
                        }
                        Err(RepositoryError::DuplicateName { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                created
            })
        })
        .collect();
    let created: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

    let instances = provider.instances().unwrap();
    assert_eq!(created, 40);
    assert_eq!(instances.len(), 40);
    let names: HashSet<_> = instances.iter().filter_map(|i| i.name.clone()).collect();
    assert_eq!(names.len(), 40);
    let ids: HashSet<_> = instances.iter().map(|i| i.instance_id).collect();
    assert_eq!(ids.len(), 40);

    let mut collector = PerfCollector::open(provider.store()).unwrap();
    let blocks = collector.block_usage().unwrap();
    assert!(!blocks.is_empty());
    for block in blocks {
        assert!(
            block.bytes_used <= block.capacity,
            "block {} uses {} of {} bytes",
            block.block_id,
            block.bytes_used,
            block.capacity
        );
    }
}

#[test]
fn reader_attached_during_growth_sees_whole_blocks() {
    let provider = provider("attach-during-growth");
    provider.create_instance_by_name(1, "first").unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let provider = provider.clone();
        let done = done.clone();
        thread::spawn(move || {
            for i in 0..1000 {
                let handle = provider
                    .create_instance_by_name(1, &format!("instance-{i}"))
                    .unwrap();
                handle.set_u32(8, i).unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    let mut buf = vec![0; 1024 * 1024];
    let mut passes = 0;
    loop {
        let finished = done.load(Ordering::Acquire);
        let mut collector = PerfCollector::open(provider.store()).unwrap();
        let mut seen = 0;
        for _ in 0..3 {
            let outcome = collector.collect(&CollectFilter::All, &mut buf).unwrap();
            assert_eq!(outcome.status, CollectStatus::Success);
            let objects = decode_objects(&buf[..outcome.bytes_written]).unwrap();
            assert_eq!(objects.len(), 1);
            let count = objects[0].instances.len();
            assert_eq!(objects[0].num_instances as usize, count);
            assert!(count >= seen, "instance count went back from {seen} to {count}");
            seen = count;
        }
        collector.close();
        passes += 1;
        if finished {
            assert_eq!(seen, 1001);
            break;
        }
    }
    writer.join().unwrap();
    assert!(passes >= 1);
}
