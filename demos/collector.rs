//! This demo reads the repository published by the `provider` demo.
//!
//! It first asks the provider's collect endpoint for every category over the local socket, growing the buffer until everything fits. It then attaches to the shared memory directly with a `PerfCollector` and prints every live instance.

use metrics_shm_repository::{
    CollectClient, MappedFileStore, PerfCollector, RepositoryConfig, decode_objects,
};
use std::sync::Arc;

fn main() {
    let mut client = match CollectClient::open_default() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Failed to reach the provider: {}", e);
            return;
        }
    };

    let reply = client
        .collect_all("Global", 256)
        .expect("Collect call failed");
    println!(
        "{:?}: {} object types in {} bytes",
        reply.status,
        reply.object_types,
        reply.data.len()
    );
    for object in decode_objects(&reply.data).expect("Invalid collect stream") {
        println!(
            "object {} ({} counters, {} instances)",
            object.name_index,
            object.counters.len(),
            object.instances.len()
        );
        for instance in &object.instances {
            println!(
                "  {:>12} {:?}",
                instance.name.as_deref().unwrap_or("<unnamed>"),
                instance.data
            );
        }
    }
    client.close();

    let config = RepositoryConfig::default();
    let store = Arc::new(MappedFileStore::in_shm(config.repository_name()));
    let mut collector = PerfCollector::open(store).expect("Failed to attach to repository");
    for category in collector.schema().categories() {
        println!("category {} {:?}: {}", category.id, category.name, category.help);
    }
    for instance in collector.instances().expect("Failed to list instances") {
        println!(
            "category {} instance {} {:?}: {:?}",
            instance.category_id, instance.instance_id, instance.name, instance.data
        );
    }
    collector.close();
}
