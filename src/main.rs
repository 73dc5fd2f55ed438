use anyhow::Context;
use clap::Parser;
use queue_worker::connector::{Connector, LocalConnector, MemoryBroker};
use queue_worker::logger::TracingLogger;
use queue_worker::metrics::InMemoryMetrics;
use queue_worker::settings::{BrokerKind, Settings, StoreKind};
use queue_worker::store::{DocumentStore, JsonFileStore, MemoryStore};
use queue_worker::{task_fn, TaskRegistry, Worker};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "queue-worker")]
#[command(about = "Consume a queue with a fixed worker pool and a dead-letter store", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a YAML settings file
    #[arg(short, long, env = "QUEUE_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Queue to consume
    #[arg(short, long, env = "QUEUE_WORKER_QUEUE")]
    queue: Option<String>,

    /// Worker name; dead letters go to `<name>_failed_queue`
    #[arg(short, long, env = "QUEUE_WORKER_NAME")]
    worker_name: Option<String>,

    /// Routing key stamped on dead letters
    #[arg(short, long, env = "QUEUE_WORKER_ROUTING_KEY")]
    routing_key: Option<String>,

    /// Number of concurrent workers
    #[arg(short, long, env = "QUEUE_WORKER_POOL_SIZE")]
    pool_size: Option<usize>,

    /// Directory for dead-letter files
    #[arg(long, env = "QUEUE_WORKER_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, env = "QUEUE_WORKER_LOG_JSON")]
    json: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn apply(self, settings: &mut Settings) {
        if let Some(queue) = self.queue {
            settings.consumer.queue_name = queue;
        }
        if let Some(worker_name) = self.worker_name {
            settings.consumer.worker_name = worker_name;
        }
        if let Some(routing_key) = self.routing_key {
            settings.consumer.routing_key = routing_key;
        }
        if let Some(pool_size) = self.pool_size {
            settings.consumer.pool_size = pool_size;
        }
        if let Some(store_dir) = self.store_dir {
            settings.store.kind = StoreKind::File;
            settings.store.path = store_dir;
        }
        if self.json {
            settings.logging.json = true;
        }
        if self.debug {
            settings.logging.level = "debug".to_string();
        }
    }
}

fn builtin_tasks() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register("noop", task_fn(|_| Ok(())));
    registry.register(
        "log",
        task_fn(|event| {
            info!(
                delivery_tag = event.original_message.delivery_tag(),
                fields = ?event.fields,
                "log task"
            );
            Ok(())
        }),
    );
    registry
}

/// Publish every non-empty stdin line to `queue`
fn spawn_stdin_feeder(broker: MemoryBroker, queue: String, routing_key: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => broker.publish(&queue, &routing_key, line),
                Ok(None) => {
                    info!("stdin closed, waiting for ctrl-c");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
}

#[cfg(feature = "kafka")]
fn kafka_connector(
    settings: &Settings,
    store: Arc<dyn DocumentStore>,
) -> anyhow::Result<Arc<dyn Connector>> {
    use queue_worker::connector::kafka::{KafkaConnector, KafkaSettings};

    let connector = KafkaConnector::new(
        KafkaSettings {
            brokers: settings.broker.brokers.clone(),
            group_id: settings.broker.group_id.clone(),
            properties: settings.broker.properties.clone(),
        },
        store,
    )?;
    Ok(Arc::new(connector))
}

#[cfg(not(feature = "kafka"))]
fn kafka_connector(
    _settings: &Settings,
    _store: Arc<dyn DocumentStore>,
) -> anyhow::Result<Arc<dyn Connector>> {
    anyhow::bail!("broker kind `kafka` needs a build with the `kafka` feature")
}

/// Resolves on SIGINT or, on unix, SIGTERM
async fn shutdown_signal() -> anyhow::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT").map_err(anyhow::Error::from),
            _ = terminate.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };
    cli.apply(&mut settings);

    queue_worker::init_tracing(&settings.logging.level, settings.logging.json);
    settings.validate()?;

    let store: Arc<dyn DocumentStore> = match settings.store.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => Arc::new(JsonFileStore::new(settings.store.path.clone())),
    };

    let mut broker = None;
    let connector: Arc<dyn Connector> = match settings.broker.kind {
        BrokerKind::Stdin => {
            let memory = MemoryBroker::new();
            spawn_stdin_feeder(
                memory.clone(),
                settings.consumer.queue_name.clone(),
                settings.consumer.routing_key.clone(),
            );
            broker = Some(memory.clone());
            Arc::new(LocalConnector::new(memory, store))
        }
        BrokerKind::Kafka => kafka_connector(&settings, store)?,
    };

    let facility = settings
        .logging
        .facility
        .clone()
        .unwrap_or_else(|| settings.consumer.worker_name.clone());
    let metrics = InMemoryMetrics::new();

    let mut builder = Worker::builder()
        .connector_arc(connector)
        .registry(builtin_tasks())
        .logger(TracingLogger::new(facility))
        .metrics(metrics.clone());
    if let Some(prefix) = &settings.metrics.prefix {
        builder = builder.metrics_prefix(prefix.clone());
    }
    let worker = builder.build()?;

    info!(
        queue = %settings.consumer.queue_name,
        tasks = ?worker.registry().names(),
        "queue-worker {} starting",
        queue_worker::VERSION
    );

    let supervisor = worker.supervisor(settings.consumer.clone());
    tokio::select! {
        result = supervisor.run() => result?,
        signal = shutdown_signal() => info!("Received {}, shutting down", signal?),
    }

    if let Some(broker) = broker {
        broker.close();
    }

    if settings.metrics.dump_on_exit {
        print!("{}", metrics.export_prometheus());
    }

    Ok(())
}
