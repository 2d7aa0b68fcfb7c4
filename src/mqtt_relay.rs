use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::Config;
use crate::error::RelayError;
use crate::health::{HealthSnapshot, HealthState};
use crate::models::parse_reading;
use crate::sink::Sink;
use crate::writer::WritePipeline;

/// An owned relay instance with an explicit lifecycle. Multiple instances
/// can run side by side; nothing lives at process scope.
pub struct Relay {
    config: Config,
    health: Arc<HealthState>,
    pipeline: Arc<WritePipeline>,
    client: Mutex<Option<AsyncClient>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    stopped: AtomicBool,
    /// Last assigned receive timestamp; keeps `received_at` strictly
    /// increasing even if the wall clock stalls.
    clock: AtomicU64,
}

impl Relay {
    /// Must run inside a tokio runtime (the write workers spawn here).
    pub fn new(config: Config, sink: Arc<dyn Sink>) -> Arc<Self> {
        let health = Arc::new(HealthState::default());
        let pipeline = Arc::new(WritePipeline::new(sink, &config, health.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            health,
            pipeline,
            client: Mutex::new(None),
            run_handle: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            stopped: AtomicBool::new(false),
            clock: AtomicU64::new(0),
        })
    }

    /// Connects and subscribes, returning once the broker acknowledges the
    /// wildcard subscription. Attempts are bounded; after that the caller
    /// decides whether to retry the whole cycle (main does, indefinitely).
    pub async fn start(self: &Arc<Self>) -> Result<(), RelayError> {
        info!(
            "Starting relay: broker {}:{}, filter '{}'.",
            self.config.mqtt_host, self.config.mqtt_port, self.config.topic_filter
        );

        let mut delays = self.config.retry_policy().delays();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.connect_and_subscribe().await {
                Ok((client, event_loop)) => {
                    *self.client.lock().await = Some(client);
                    self.health.connected.store(true, Ordering::Relaxed);
                    info!("Subscribed to '{}'.", self.config.topic_filter);

                    let relay = self.clone();
                    let shutdown = self.shutdown_rx.clone();
                    let handle = tokio::spawn(relay.run(event_loop, shutdown));
                    *self.run_handle.lock().await = Some(handle);
                    return Ok(());
                }
                Err(reason) if attempts < self.config.connect_max_retries => {
                    let delay = delays.next().unwrap_or(Duration::from_secs(30));
                    warn!(
                        "Connect attempt {attempts} failed ({reason}); retrying in {delay:?}."
                    );
                    sleep(delay).await;
                }
                Err(reason) => {
                    return Err(RelayError::Connection { attempts, reason });
                }
            }
        }
    }

    async fn connect_and_subscribe(&self) -> Result<(AsyncClient, EventLoop), String> {
        let client_id = format!("agriflux_{}", Uuid::new_v4());
        let mut options =
            MqttOptions::new(client_id, &self.config.mqtt_host, self.config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(10));
        options.set_clean_session(true);
        if !self.config.mqtt_username.is_empty() && !self.config.mqtt_password.is_empty() {
            options.set_credentials(&self.config.mqtt_username, &self.config.mqtt_password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 10);
        client
            .subscribe(&self.config.topic_filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| e.to_string())?;

        // Drive the event loop until the subscription is acknowledged.
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(_))) => return Ok((client, event_loop)),
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    debug!("Connected to MQTT broker; awaiting subscription ack.");
                }
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    async fn run(self: Arc<Self>, mut event_loop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Relay event loop received shutdown signal.");
                    return;
                }
                polled = event_loop.poll() => match polled {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.handle_publish(&publish.topic, &publish.payload);
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker.");
                        self.health.connected.store(true, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.health.connected.store(false, Ordering::Relaxed);
                        if self.stopped.load(Ordering::SeqCst) {
                            return;
                        }
                        error!("Error in MQTT event loop: {e:?}");
                        match self.reconnect(&mut shutdown).await {
                            Some(next) => event_loop = next,
                            None => return,
                        }
                    }
                }
            }
        }
    }

    /// Resubscribes after a disconnect, retrying indefinitely with the
    /// shared backoff policy. Returns `None` only when stopping.
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<EventLoop> {
        let mut delays = self.config.retry_policy().delays();
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            self.health.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            let delay = delays.next().unwrap_or(Duration::from_secs(30));
            warn!("Lost connection to MQTT broker. Retrying in {delay:?}...");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => return None,
            }

            match self.connect_and_subscribe().await {
                Ok((client, event_loop)) => {
                    *self.client.lock().await = Some(client);
                    self.health.connected.store(true, Ordering::Relaxed);
                    info!("Resubscribed to '{}'.", self.config.topic_filter);
                    // Reconnection loses nothing: buffered readings go back
                    // through the write path.
                    self.pipeline.redrive_dead_letters();
                    return Some(event_loop);
                }
                Err(reason) => {
                    error!("Reconnect attempt failed: {reason}");
                }
            }
        }
    }

    /// Inbound publish handling. Never raises: malformed messages are
    /// counted and discarded, valid ones are handed to the write pipeline
    /// without awaiting sink completion.
    fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let received_at = self.next_timestamp();
        self.health.mark_message(received_at);

        match parse_reading(topic, payload, received_at) {
            Ok(reading) => self.pipeline.submit(reading),
            Err(e @ RelayError::MalformedTopic(_)) => {
                self.health
                    .counters
                    .malformed_topic
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Discarding message: {e}");
            }
            Err(e) => {
                self.health
                    .counters
                    .malformed_payload
                    .fetch_add(1, Ordering::Relaxed);
                warn!("Discarding message on '{topic}': {e}");
            }
        }
    }

    fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut prev = self.clock.load(Ordering::Relaxed);
        loop {
            let assigned = now.max(prev + 1);
            match self.clock.compare_exchange_weak(
                prev,
                assigned,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return assigned,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Point-in-time health snapshot; never blocks.
    pub fn health(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Unsubscribes, drains in-flight writes up to the grace timeout, then
    /// closes the transport. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping relay...");

        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.unsubscribe(&self.config.topic_filter).await {
                debug!("Unsubscribe on shutdown failed: {e:?}");
            }
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect on shutdown failed: {e:?}");
            }
        }

        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.run_handle.lock().await.take() {
            let _ = handle.await;
        }

        self.pipeline.shutdown(self.config.stop_grace()).await;
        self.health.connected.store(false, Ordering::Relaxed);
        info!("Relay stopped.");
    }
}
