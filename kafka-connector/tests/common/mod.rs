use std::sync::{Arc, Once};
use std::time::Duration;

use kafka_connector::memory::MemoryBrokerFactory;
use kafka_connector::{Client, ClientBuilder, Config, ConnectionRegistry, ConsumerOptions};

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub fn test_config(shared: bool) -> Config {
    Config::new(["localhost:9092"], "connector-tests").with_global_client(shared)
}

/// A client over an in-process broker, resolved through an isolated registry.
pub fn memory_client(
    config: Config,
    registry: &Arc<ConnectionRegistry>,
    factory: &Arc<MemoryBrokerFactory>,
    options: ConsumerOptions,
) -> Client {
    ClientBuilder::new(config)
        .with_registry(registry.clone())
        .with_factory(factory.clone())
        .with_consumer_options(options)
        .build()
        .expect("failed to build memory client")
}

pub async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition was not met in time");
}
