use log::{debug, info, warn};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_retry::Retry;

use crate::backoff::RetryPolicy;
use crate::config::Config;
use crate::health::HealthState;
use crate::models::DeviceReading;
use crate::sink::Sink;

/// Bounded write path between the transport loop and the sink.
///
/// Readings are sharded to a fixed worker pool by device id, so writes for
/// the same device are applied in submission order (retries included) while
/// different devices proceed concurrently. A full shard queue spills into
/// the dead-letter buffer instead of blocking the transport callback.
pub struct WritePipeline {
    shards: Mutex<Vec<mpsc::Sender<DeviceReading>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dead_letters: Arc<Mutex<VecDeque<DeviceReading>>>,
    dead_letter_capacity: usize,
    health: Arc<HealthState>,
}

impl WritePipeline {
    /// Spawns the worker pool; must run inside a tokio runtime.
    pub fn new(sink: Arc<dyn Sink>, config: &Config, health: Arc<HealthState>) -> Self {
        let shard_capacity = config.max_pending_writes.div_ceil(config.write_workers);
        let dead_letters = Arc::new(Mutex::new(VecDeque::new()));
        let policy = config.retry_policy();

        let mut shards = Vec::with_capacity(config.write_workers);
        let mut workers = Vec::with_capacity(config.write_workers);
        for worker_id in 0..config.write_workers {
            let (tx, rx) = mpsc::channel(shard_capacity);
            shards.push(tx);
            workers.push(tokio::spawn(write_worker(
                worker_id,
                rx,
                sink.clone(),
                policy,
                config.write_max_attempts,
                dead_letters.clone(),
                config.dead_letter_capacity,
                health.clone(),
            )));
        }

        Self {
            shards: Mutex::new(shards),
            workers: Mutex::new(workers),
            dead_letters,
            dead_letter_capacity: config.dead_letter_capacity,
            health,
        }
    }

    /// Hands a reading to its device's shard. Never blocks: when the shard
    /// queue is at the backpressure ceiling the reading is dead-lettered.
    pub fn submit(&self, reading: DeviceReading) {
        let sender = {
            let shards = self.shards.lock().unwrap();
            if shards.is_empty() {
                None
            } else {
                Some(shards[shard_for(&reading.device_id, shards.len())].clone())
            }
        };

        let Some(sender) = sender else {
            self.push_dead_letter(reading);
            return;
        };

        match sender.try_send(reading) {
            Ok(()) => {}
            Err(TrySendError::Full(reading)) => {
                debug!(
                    "Write queue full; dead-lettering reading for device '{}'.",
                    reading.device_id
                );
                self.push_dead_letter(reading);
            }
            Err(TrySendError::Closed(reading)) => self.push_dead_letter(reading),
        }
    }

    /// Re-enqueues everything in the dead-letter buffer, oldest first.
    /// Called after a successful broker reconnect; entries that still do
    /// not fit go straight back to the buffer.
    pub fn redrive_dead_letters(&self) {
        let drained: Vec<DeviceReading> = {
            let mut queue = self.dead_letters.lock().unwrap();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }
        info!("Redriving {} dead-lettered readings.", drained.len());
        for reading in drained {
            self.submit(reading);
        }
    }

    pub fn dead_letter_len(&self) -> usize {
        self.dead_letters.lock().unwrap().len()
    }

    fn push_dead_letter(&self, reading: DeviceReading) {
        push_dead_letter(
            &self.dead_letters,
            self.dead_letter_capacity,
            &self.health,
            reading,
        );
    }

    /// Closes the shard queues and lets the workers drain within the grace
    /// period; whatever is still in flight afterwards is abandoned.
    /// Idempotent.
    pub async fn shutdown(&self, grace: Duration) {
        self.shards.lock().unwrap().clear();
        let mut workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().unwrap();
            guard.drain(..).collect()
        };
        if workers.is_empty() {
            return;
        }

        let drain = futures::future::join_all(workers.iter_mut());
        if timeout(grace, drain).await.is_err() {
            warn!(
                "Write pipeline did not drain within {:?}; abandoning in-flight writes.",
                grace
            );
            for handle in &workers {
                handle.abort();
            }
        }
    }
}

fn shard_for(device_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() as usize) % shards
}

fn push_dead_letter(
    queue: &Mutex<VecDeque<DeviceReading>>,
    capacity: usize,
    health: &HealthState,
    reading: DeviceReading,
) {
    let evicted = {
        let mut queue = queue.lock().unwrap();
        queue.push_back(reading);
        if queue.len() > capacity {
            queue.pop_front()
        } else {
            None
        }
    };
    health.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
    if let Some(evicted) = evicted {
        warn!(
            "Dead-letter buffer full; permanently dropping reading for device '{}'.",
            evicted.device_id
        );
        health.counters.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

#[allow(clippy::too_many_arguments)]
async fn write_worker(
    worker_id: usize,
    mut rx: mpsc::Receiver<DeviceReading>,
    sink: Arc<dyn Sink>,
    policy: RetryPolicy,
    max_attempts: u32,
    dead_letters: Arc<Mutex<VecDeque<DeviceReading>>>,
    dead_letter_capacity: usize,
    health: Arc<HealthState>,
) {
    while let Some(reading) = rx.recv().await {
        let reading = Arc::new(reading);
        let delays = policy
            .delays()
            .take(max_attempts.saturating_sub(1) as usize);

        let result = {
            let sink = sink.clone();
            let reading = reading.clone();
            Retry::spawn(delays, move || {
                let sink = sink.clone();
                let reading = reading.clone();
                async move { sink.merge_patch(&reading.device_id, &reading.fields).await }
            })
            .await
        };

        match result {
            Ok(()) => {
                health.counters.written.fetch_add(1, Ordering::Relaxed);
                debug!("Merge-patch applied for device '{}'.", reading.device_id);
            }
            Err(e) => {
                warn!(
                    "Write for device '{}' failed after {} attempts: {}. Dead-lettering.",
                    reading.device_id, max_attempts, e
                );
                let reading = Arc::try_unwrap(reading).unwrap_or_else(|shared| (*shared).clone());
                push_dead_letter(&dead_letters, dead_letter_capacity, &health, reading);
            }
        }
    }
    debug!("Write worker {worker_id} drained and exiting.");
}
