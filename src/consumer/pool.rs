//! Fixed pool of workers draining one dispatch queue

use crate::consumer::dlq::DeadLetterSink;
use crate::consumer::error::ConsumerResult;
use crate::consumer::processor::JobProcessor;
use crate::event::Event;
use crate::logger::Logger;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Capacity of the dispatch queue; intake blocks while every worker is busy
pub const DISPATCH_CAPACITY: usize = 1;

/// Everything a worker needs to finish one job
pub struct WorkerContext {
    processor: Arc<dyn JobProcessor>,
    dead_letters: DeadLetterSink,
    logger: Arc<dyn Logger>,
}

impl WorkerContext {
    /// Bundle the stack, dead-letter sink and logger every worker shares
    pub fn new(
        processor: Arc<dyn JobProcessor>,
        dead_letters: DeadLetterSink,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            processor,
            dead_letters,
            logger,
        }
    }

    /// Run the job, acknowledge the delivery, then dead-letter a failure
    pub async fn handle(&self, event: Event) {
        let result = self.processor.process(&event).await;

        let delivery = &event.original_message;
        if let Err(ack_err) = delivery.ack().await {
            self.logger.log_error(
                &anyhow::Error::new(ack_err)
                    .context(format!("failed to acknowledge message {}", delivery.delivery_tag())),
            );
        }

        if let Err(err) = result {
            self.dead_letters.send(delivery, &err).await;
        }
    }
}

/// Competing workers sharing one bounded queue
pub struct WorkerPool {
    sender: mpsc::Sender<Event>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `size` workers
    pub fn spawn(size: usize, context: Arc<WorkerContext>) -> Self {
        let (sender, receiver) = mpsc::channel(DISPATCH_CAPACITY);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let context = context.clone();
                tokio::spawn(async move { run_worker(worker_id, receiver, context).await })
            })
            .collect();

        info!("Worker pool started with {} workers", size);
        Self { sender, workers }
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue an event, waiting while the queue is full
    pub async fn dispatch(&self, event: Event) -> ConsumerResult<()> {
        self.sender.send(event).await?;
        Ok(())
    }

    /// Close the queue and wait for the workers to finish what is queued
    pub async fn drain(self) {
        drop(self.sender);
        for (worker_id, handle) in self.workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!("Worker {} terminated abnormally: {}", worker_id, e);
            }
        }
        debug!("Worker pool drained");
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Event>>>,
    context: Arc<WorkerContext>,
) {
    debug!("Worker {} started", worker_id);
    loop {
        // The lock is only held while waiting for the next event
        let next = receiver.lock().await.recv().await;
        let Some(event) = next else {
            break;
        };
        context.handle(event).await;
    }
    debug!("Worker {} stopped", worker_id);
}
