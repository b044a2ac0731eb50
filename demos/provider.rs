//! This demo publishes a small repository and serves collect calls for it.
//!
//! Two categories are registered: per-worker request counters and an instanceless process category. The counters are updated once a second while the `CollectServer` answers collect calls on the default socket; run the `collector` demo in another terminal to read them. The repository's own metrics are exposed through the Prometheus exporter on `0.0.0.0:9000`.

use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_shm_repository::{
    CategoryDefinition, CollectServer, CounterDefinition, CounterType, InstanceHandle,
    MappedFileStore, PerfProvider, RepositoryConfig, describe_metrics,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

const REQUESTS: u32 = 2;
const PROCESS: u32 = 4;

fn build_provider() -> Arc<PerfProvider> {
    let config = RepositoryConfig::default();
    let store = Arc::new(MappedFileStore::in_shm(config.repository_name()));
    let provider = PerfProvider::new(config, store);

    provider
        .add_category(
            CategoryDefinition::builder(REQUESTS, "Requests", 24)
                .help("Requests handled per worker")
                .counter(
                    CounterDefinition::new(REQUESTS + 2, "Total", CounterType::COUNTER, 0)
                        .help("Requests per second"),
                )
                .counter(CounterDefinition::new(REQUESTS + 4, "Failed", CounterType::RAW_COUNT, 4))
                .counter(
                    CounterDefinition::new(REQUESTS + 6, "Bytes", CounterType::BULK_COUNT, 8)
                        .help("Bytes sent per second"),
                )
                .counter(
                    CounterDefinition::new(REQUESTS + 8, "Queued", CounterType::LARGE_RAW_COUNT, 16)
                        .help("Requests waiting"),
                )
                .build(),
        )
        .expect("Failed to register requests category");
    provider
        .add_category(
            CategoryDefinition::builder(PROCESS, "Process", 8)
                .instanceless()
                .counter(CounterDefinition::new(PROCESS + 2, "Uptime", CounterType::LARGE_RAW_COUNT, 0))
                .build(),
        )
        .expect("Failed to register process category");

    Arc::new(provider)
}

fn update_counters(provider: &PerfProvider, running: &AtomicBool) {
    let workers: Vec<InstanceHandle> = (0..4)
        .map(|i| {
            provider
                .create_instance_by_name(REQUESTS, &format!("worker-{i}"))
                .expect("Failed to create worker instance")
        })
        .collect();
    let process = provider
        .create_instance(PROCESS, 0, None)
        .expect("Failed to create process instance");

    let mut tick: u64 = 0;
    while running.load(Ordering::SeqCst) {
        for (i, worker) in (1u32..).zip(&workers) {
            let _ = worker.add_u32(0, i * 10);
            let _ = worker.add_u64(8, u64::from(i) * 1500);
            let _ = worker.set_u64(16, tick % u64::from(i + 1));
            if tick % 7 == 0 {
                let _ = worker.add_u32(4, 1);
            }
        }
        let _ = process.set_u64(0, tick);
        tick += 1;
        thread::sleep(Duration::from_secs(1));
    }

    for worker in workers {
        let _ = provider.release_instance(worker);
    }
    let _ = provider.release_instance(process);
}

#[cfg(not(feature = "tokio"))]
fn main() {
    PrometheusBuilder::new()
        .install()
        .expect("Failed to install Prometheus recorder");
    describe_metrics();

    let provider = build_provider();
    if let Err(e) = CollectServer::default().start_serving(provider.clone()) {
        eprintln!("Failed to start collect endpoint: {}", e);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    // Handle Ctrl+C to exit gracefully.
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    println!("Provider is running. Press Ctrl+C to exit.");
    update_counters(&provider, &running);
    println!("Shutting down provider.");
}

#[cfg(feature = "tokio")]
#[tokio::main]
async fn main() {
    PrometheusBuilder::new()
        .install()
        .expect("Failed to install Prometheus recorder");
    describe_metrics();

    let provider = build_provider();
    if let Err(e) = CollectServer::default().start_serving(provider.clone()) {
        eprintln!("Failed to start collect endpoint: {}", e);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    println!("Provider is running. Press Ctrl+C to exit.");
    tokio::task::spawn_blocking(move || update_counters(&provider, &running))
        .await
        .expect("Counter updates panicked");
    println!("Shutting down provider.");
}
